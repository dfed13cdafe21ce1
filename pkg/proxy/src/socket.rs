use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use pkg_constants::proxy::{ENDPOINT_DIAL_TIMEOUTS_MS, UDP_BUFFER_SIZE};
use pkg_types::names::ServicePortName;
use pkg_types::service::Protocol;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::load_balancer::LoadBalancer;
use crate::service_info::ServiceState;

/// A bound listening socket that proxies one service port.
#[async_trait]
pub trait ProxySocket: Send + Sync {
    /// Bound address; reveals the allocated port when 0 was requested.
    fn addr(&self) -> SocketAddr;

    fn listen_port(&self) -> u16 {
        self.addr().port()
    }

    /// Serve until the socket is closed or the service is no longer alive.
    /// Every per-connection endpoint choice is delegated to `load_balancer`.
    async fn proxy_loop(
        &self,
        service: ServicePortName,
        state: Arc<ServiceState>,
        load_balancer: Arc<dyn LoadBalancer>,
    );

    /// Release the OS socket and unblock `proxy_loop`.
    fn close(&self) -> Result<()>;
}

/// Constructs proxy sockets; swapped for a fake in tests.
#[async_trait]
pub trait ProxySocketFactory: Send + Sync {
    async fn make(&self, protocol: Protocol, ip: IpAddr, port: u16) -> Result<Arc<dyn ProxySocket>>;
}

/// Real TCP/UDP sockets on the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSocketFactory;

#[async_trait]
impl ProxySocketFactory for TokioSocketFactory {
    async fn make(&self, protocol: Protocol, ip: IpAddr, port: u16) -> Result<Arc<dyn ProxySocket>> {
        let addr = SocketAddr::new(ip, port);
        match protocol {
            Protocol::Tcp => Ok(Arc::new(TcpProxySocket::bind(addr).await?)),
            Protocol::Udp => Ok(Arc::new(UdpProxySocket::bind(addr).await?)),
            Protocol::Sctp => bail!("unknown protocol {}", protocol),
        }
    }
}

// ─── TCP ──────────────────────────────────────────────────────────────────

pub struct TcpProxySocket {
    addr: SocketAddr,
    listener: std::sync::Mutex<Option<Arc<TcpListener>>>,
    closed: watch::Sender<bool>,
}

impl TcpProxySocket {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            addr,
            listener: std::sync::Mutex::new(Some(Arc::new(listener))),
            closed,
        })
    }
}

#[async_trait]
impl ProxySocket for TcpProxySocket {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn proxy_loop(
        &self,
        service: ServicePortName,
        state: Arc<ServiceState>,
        load_balancer: Arc<dyn LoadBalancer>,
    ) {
        let listener = match self.listener.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(listener) = listener else {
            return;
        };
        let mut closed = self.closed.subscribe();

        loop {
            if !state.is_alive() {
                break;
            }
            tokio::select! {
                _ = wait_closed(&mut closed) => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, client)) => {
                        debug!("Accepted TCP connection from {} for {}", client, service);
                        let service = service.clone();
                        let load_balancer = load_balancer.clone();
                        tokio::spawn(async move {
                            proxy_tcp(conn, client, service, load_balancer).await;
                        });
                    }
                    Err(e) => {
                        if !state.is_alive() {
                            break;
                        }
                        error!("Accept failed for {}: {}", service, e);
                    }
                },
            }
        }
        info!("Stopped proxying TCP for {} on {}", service, self.addr);
    }

    fn close(&self) -> Result<()> {
        self.listener
            .lock()
            .map_err(|_| anyhow!("listener lock poisoned"))?
            .take();
        self.closed.send_replace(true);
        Ok(())
    }
}

async fn proxy_tcp(
    mut conn: TcpStream,
    client: SocketAddr,
    service: ServicePortName,
    load_balancer: Arc<dyn LoadBalancer>,
) {
    let mut backend = match connect_to_endpoint(&service, client, load_balancer.as_ref()).await {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to connect {} to a backend of {}: {}", client, service, e);
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut conn, &mut backend).await {
        Ok((to_backend, to_client)) => debug!(
            "Closed connection {} for {} ({} bytes out, {} bytes back)",
            client, service, to_backend, to_client
        ),
        Err(e) => debug!("Connection {} for {} ended: {}", client, service, e),
    }
}

/// Dial an endpoint with growing timeouts. Retries ignore session affinity
/// so a dead sticky backend does not pin the client.
async fn connect_to_endpoint(
    service: &ServicePortName,
    client: SocketAddr,
    load_balancer: &dyn LoadBalancer,
) -> Result<TcpStream> {
    let mut reset_affinity = false;
    for timeout_ms in ENDPOINT_DIAL_TIMEOUTS_MS {
        let endpoint = load_balancer.next_endpoint(service, client, reset_affinity)?;
        let dial = TcpStream::connect(endpoint.as_str());
        match tokio::time::timeout(Duration::from_millis(*timeout_ms), dial).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => warn!("Dial {} for {} failed: {}", endpoint, service, e),
            Err(_) => warn!("Dial {} for {} timed out after {}ms", endpoint, service, timeout_ms),
        }
        reset_affinity = true;
    }
    bail!("failed to connect to an endpoint")
}

// ─── UDP ──────────────────────────────────────────────────────────────────

type ClientCache = Arc<Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>>;

pub struct UdpProxySocket {
    addr: SocketAddr,
    socket: std::sync::Mutex<Option<Arc<UdpSocket>>>,
    closed: watch::Sender<bool>,
}

impl UdpProxySocket {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let addr = socket.local_addr()?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            addr,
            socket: std::sync::Mutex::new(Some(Arc::new(socket))),
            closed,
        })
    }
}

#[async_trait]
impl ProxySocket for UdpProxySocket {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn proxy_loop(
        &self,
        service: ServicePortName,
        state: Arc<ServiceState>,
        load_balancer: Arc<dyn LoadBalancer>,
    ) {
        let socket = match self.socket.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(socket) = socket else {
            return;
        };
        let mut closed = self.closed.subscribe();
        let clients: ClientCache = Arc::new(Mutex::new(HashMap::new()));
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];

        loop {
            if !state.is_alive() {
                break;
            }
            tokio::select! {
                _ = wait_closed(&mut closed) => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, client)) => {
                        let backend = match backend_for_client(
                            &clients, client, &service, &socket, &state, load_balancer.as_ref(),
                        )
                        .await
                        {
                            Ok(b) => b,
                            Err(e) => {
                                error!("No backend for UDP client {} of {}: {}", client, service, e);
                                continue;
                            }
                        };
                        if let Err(e) = backend.send(&buf[..n]).await {
                            warn!("UDP write to backend for {} failed: {}", service, e);
                        }
                    }
                    Err(e) => {
                        if !state.is_alive() {
                            break;
                        }
                        error!("UDP receive failed for {}: {}", service, e);
                    }
                },
            }
        }
        info!("Stopped proxying UDP for {} on {}", service, self.addr);
    }

    fn close(&self) -> Result<()> {
        self.socket
            .lock()
            .map_err(|_| anyhow!("socket lock poisoned"))?
            .take();
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Resolves once `close` has been called or the socket is gone.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

async fn backend_for_client(
    clients: &ClientCache,
    client: SocketAddr,
    service: &ServicePortName,
    socket: &Arc<UdpSocket>,
    state: &ServiceState,
    load_balancer: &dyn LoadBalancer,
) -> Result<Arc<UdpSocket>> {
    let mut cache = clients.lock().await;
    if let Some(backend) = cache.get(&client) {
        return Ok(backend.clone());
    }

    let endpoint: SocketAddr = load_balancer.next_endpoint(service, client, false)?.parse()?;
    let local: IpAddr = if endpoint.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let backend = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
    backend.connect(endpoint).await?;
    let backend = Arc::new(backend);
    cache.insert(client, backend.clone());
    debug!("New UDP flow {} -> {} for {}", client, endpoint, service);

    tokio::spawn(pump_replies(
        client,
        backend.clone(),
        socket.clone(),
        clients.clone(),
        state.udp_idle_timeout,
    ));
    Ok(backend)
}

/// Copy backend replies to the client until the flow idles out.
async fn pump_replies(
    client: SocketAddr,
    backend: Arc<UdpSocket>,
    socket: Arc<UdpSocket>,
    clients: ClientCache,
    idle_timeout: Duration,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        match tokio::time::timeout(idle_timeout, backend.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                if let Err(e) = socket.send_to(&buf[..n], client).await {
                    warn!("UDP write to client {} failed: {}", client, e);
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!("UDP backend read for {} failed: {}", client, e);
                break;
            }
            Err(_) => break,
        }
    }
    clients.lock().await.remove(&client);
}
