use pkg_types::names::ServicePortName;
use thiserror::Error;

use crate::iptables::IptablesError;

/// Errors produced while reconciling services into sockets and rules.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A host port is already held by another service port.
    #[error("port conflict detected on {key}: {owner} vs {existing}")]
    PortConflict {
        key: String,
        owner: ServicePortName,
        existing: ServicePortName,
    },

    /// A release was attempted by a service port that does not hold the claim.
    #[error("port conflict detected on {key} (unowned release): {owner} vs {existing}")]
    ReleaseConflict {
        key: String,
        owner: ServicePortName,
        existing: ServicePortName,
    },

    /// The reservation socket for a claimed port could not be opened.
    #[error("can't open port {key}: {source}")]
    ClaimSocket {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Iptables(#[from] IptablesError),

    #[error("{0}")]
    Aggregate(Aggregate),

    #[error("cannot proxy on localhost")]
    ProxyOnLocalhost,

    #[error("failed to select a host interface: {0}")]
    HostInterface(String),

    #[error("failed to initialize iptables: {0}")]
    Init(#[source] IptablesError),

    #[error("failed to flush iptables: {0}")]
    Flush(Aggregate),

    #[error("failed to allocate proxy port: {0}")]
    Allocate(#[source] anyhow::Error),

    #[error("failed to open proxy socket for {service}: {source}")]
    Socket {
        service: ServicePortName,
        #[source]
        source: anyhow::Error,
    },
}

/// Ordered list of errors collected by operations that keep going after a
/// per-item failure.
#[derive(Debug, Default)]
pub struct Aggregate(Vec<ProxyError>);

impl Aggregate {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: impl Into<ProxyError>) {
        self.0.push(err.into());
    }

    pub fn extend(&mut self, other: Aggregate) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[ProxyError] {
        &self.0
    }

    /// `Ok(())` when nothing was collected, otherwise one aggregate error.
    pub fn into_result(self) -> Result<(), ProxyError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Aggregate(self))
        }
    }
}

impl std::fmt::Display for Aggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "{}", self.0[0]);
        }
        write!(f, "[")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", err)?;
        }
        write!(f, "]")
    }
}
