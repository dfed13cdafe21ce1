use async_trait::async_trait;
use pkg_constants::paths::IPTABLES_BIN;
use std::process::Output;
use thiserror::Error;
use tracing::debug;

/// iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// iptables chain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chain(String);

impl Chain {
    pub const PREROUTING: &'static str = "PREROUTING";
    pub const OUTPUT: &'static str = "OUTPUT";
    pub const INPUT: &'static str = "INPUT";

    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where `ensure_rule` inserts a rule that is not present yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    Prepend,
    Append,
}

impl RulePosition {
    fn flag(&self) -> &'static str {
        match self {
            RulePosition::Prepend => "-I",
            RulePosition::Append => "-A",
        }
    }
}

#[derive(Debug, Error)]
pub enum IptablesError {
    /// The chain or rule the operation targets does not exist.
    #[error("iptables {op} {table}/{chain}: not found")]
    NotFound {
        op: String,
        table: Table,
        chain: String,
    },

    #[error("iptables {op} {table}/{chain} failed (exit {code:?}): {stderr}")]
    Exec {
        op: String,
        table: Table,
        chain: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to run iptables: {0}")]
    Spawn(#[from] std::io::Error),
}

impl IptablesError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, IptablesError::NotFound { .. })
    }

    fn from_output(op: &str, table: Table, chain: &Chain, output: &Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let not_found = stderr.contains("No chain/target/match by that name")
            || stderr.contains("does a matching rule exist")
            || stderr.contains("doesn't exist")
            || stderr.contains("does not exist")
            || stderr.contains("No such file or directory");
        if not_found {
            IptablesError::NotFound {
                op: op.to_string(),
                table,
                chain: chain.to_string(),
            }
        } else {
            IptablesError::Exec {
                op: op.to_string(),
                table,
                chain: chain.to_string(),
                code: output.status.code(),
                stderr,
            }
        }
    }
}

/// Firewall rule primitive. Every call carries the full argument list, so
/// repeating a call is idempotent.
#[async_trait]
pub trait Iptables: Send + Sync {
    /// Create the chain if missing. Returns true if it already existed.
    async fn ensure_chain(&self, table: Table, chain: &Chain) -> Result<bool, IptablesError>;

    /// Insert the rule if missing. Returns true if it already existed.
    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &Chain,
        args: &[String],
    ) -> Result<bool, IptablesError>;

    /// Remove the rule. Removing an absent rule succeeds.
    async fn delete_rule(&self, table: Table, chain: &Chain, args: &[String])
    -> Result<(), IptablesError>;

    async fn flush_chain(&self, table: Table, chain: &Chain) -> Result<(), IptablesError>;

    async fn delete_chain(&self, table: Table, chain: &Chain) -> Result<(), IptablesError>;
}

/// `Iptables` backed by the `iptables` binary.
pub struct IptablesCommand {
    bin: String,
}

impl IptablesCommand {
    pub fn new() -> Self {
        Self::with_binary(IPTABLES_BIN)
    }

    pub fn with_binary(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
        }
    }

    async fn run(
        &self,
        op: &str,
        table: Table,
        chain: &Chain,
        args: &[String],
    ) -> Result<Output, IptablesError> {
        debug!("{} -w -t {} {} {} {}", self.bin, table, op, chain, args.join(" "));
        let output = tokio::process::Command::new(&self.bin)
            .arg("-w")
            .arg("-t")
            .arg(table.as_str())
            .arg(op)
            .arg(chain.as_str())
            .args(args)
            .output()
            .await?;
        Ok(output)
    }

    async fn run_checked(
        &self,
        op: &str,
        table: Table,
        chain: &Chain,
        args: &[String],
    ) -> Result<(), IptablesError> {
        let output = self.run(op, table, chain, args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(IptablesError::from_output(op, table, chain, &output))
        }
    }

    /// `-C`: exit 0 means present, exit 1 means absent.
    async fn check_rule(
        &self,
        table: Table,
        chain: &Chain,
        args: &[String],
    ) -> Result<bool, IptablesError> {
        let output = self.run("-C", table, chain, args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(IptablesError::from_output("-C", table, chain, &output)),
        }
    }
}

impl Default for IptablesCommand {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Iptables for IptablesCommand {
    async fn ensure_chain(&self, table: Table, chain: &Chain) -> Result<bool, IptablesError> {
        let output = self.run("-N", table, chain, &[]).await?;
        if output.status.success() {
            return Ok(false);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            return Ok(true);
        }
        Err(IptablesError::from_output("-N", table, chain, &output))
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &Chain,
        args: &[String],
    ) -> Result<bool, IptablesError> {
        if self.check_rule(table, chain, args).await? {
            return Ok(true);
        }
        self.run_checked(position.flag(), table, chain, args).await?;
        Ok(false)
    }

    async fn delete_rule(
        &self,
        table: Table,
        chain: &Chain,
        args: &[String],
    ) -> Result<(), IptablesError> {
        match self.check_rule(table, chain, args).await {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        self.run_checked("-D", table, chain, args).await
    }

    async fn flush_chain(&self, table: Table, chain: &Chain) -> Result<(), IptablesError> {
        self.run_checked("-F", table, chain, &[]).await
    }

    async fn delete_chain(&self, table: Table, chain: &Chain) -> Result<(), IptablesError> {
        self.run_checked("-X", table, chain, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_missing_chain_is_not_found() {
        let chain = Chain::new("KUBE-PORTALS-HOST");
        let err = IptablesError::from_output(
            "-F",
            Table::Nat,
            &chain,
            &output(1, "iptables: No chain/target/match by that name.\n"),
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_legacy_missing_jump_target_is_not_found() {
        let err = IptablesError::from_output(
            "-C",
            Table::Nat,
            &Chain::new("PREROUTING"),
            &output(
                2,
                "iptables v1.8.7 (legacy): Couldn't load target `KUBE-PORTALS-CONTAINER':No such file or directory\n",
            ),
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_nft_missing_chain_is_not_found() {
        let err = IptablesError::from_output(
            "-F",
            Table::Nat,
            &Chain::new("KUBE-NODEPORT-HOST"),
            &output(1, "iptables: Chain 'KUBE-NODEPORT-HOST' does not exist\n"),
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_failures_keep_exit_code() {
        let chain = Chain::new("KUBE-PORTALS-HOST");
        let err = IptablesError::from_output(
            "-A",
            Table::Nat,
            &chain,
            &output(4, "iptables: Resource temporarily unavailable.\n"),
        );
        assert!(!err.is_not_found());
        match err {
            IptablesError::Exec { code, stderr, .. } => {
                assert_eq!(code, Some(4));
                assert!(stderr.contains("temporarily unavailable"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_rule_position_flags() {
        assert_eq!(RulePosition::Prepend.flag(), "-I");
        assert_eq!(RulePosition::Append.flag(), "-A");
        assert_eq!(Table::Filter.to_string(), "filter");
    }
}
