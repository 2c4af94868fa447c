use super::transport::{SipTransport, Transport, TransportFactory, TransportManager, TransportType};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// One TCP connection to one peer.
pub struct TcpTransport {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    recv: parking_lot::Mutex<Option<OwnedReadHalf>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn from_stream(stream: TcpStream) -> Result<TcpTransport> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (recv, send) = stream.into_split();
        Ok(TcpTransport {
            local_addr,
            peer_addr,
            writer: Mutex::new(send),
            recv: parking_lot::Mutex::new(Some(recv)),
            reader: parking_lot::Mutex::new(None),
        })
    }

    /// Start reading; a second call does nothing.
    pub fn start(&self, transport: Weak<SipTransport>) {
        let recv = match self.recv.lock().take() {
            Some(recv) => recv,
            None => return,
        };
        let peer_addr = self.peer_addr;
        let handle = tokio::spawn(async move {
            serve_tcp_stream(recv, peer_addr, transport).await;
        });
        *self.reader.lock() = Some(handle);
    }
}

async fn serve_tcp_stream(
    mut recv: OwnedReadHalf,
    peer_addr: SocketAddr,
    transport: Weak<SipTransport>,
) {
    let mut buf = vec![0; 4096];
    loop {
        let result = recv.read(&mut buf).await;
        let transport = match transport.upgrade() {
            Some(transport) => transport,
            None => return,
        };
        match result {
            Ok(0) => {
                debug!("tcp connection {} closed by peer", peer_addr);
                transport.on_disconnected();
                return;
            }
            Ok(n) => transport.on_received(&buf[..n], peer_addr),
            Err(e) => {
                warn!("tcp connection {} read error {}, quit", peer_addr, e);
                transport.on_disconnected();
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    /// The connection has one peer, `dest` is ignored.
    async fn send_to(&self, data: &[u8], _dest: SocketAddr) -> Result<usize> {
        let mut conn = self.writer.lock().await;
        conn.write_all(data).await?;
        conn.flush().await?;
        Ok(data.len())
    }

    async fn close(&self) -> Result<()> {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let mut conn = self.writer.lock().await;
        if let Err(e) = conn.shutdown().await {
            debug!("tcp connection {} shutdown error {}", self.peer_addr, e);
        }
        Ok(())
    }
}

/// Connects to the requested remote on a registry miss.
pub struct TcpFactory {
    connect_timeout: Duration,
}

impl TcpFactory {
    pub fn new(connect_timeout: Duration) -> TcpFactory {
        TcpFactory { connect_timeout }
    }
}

#[async_trait]
impl TransportFactory for TcpFactory {
    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    async fn create_transport(
        &self,
        manager: &TransportManager,
        remote: Option<SocketAddr>,
    ) -> Result<Arc<SipTransport>> {
        let remote = remote.ok_or_else(|| anyhow!("tcp transport needs a remote address"))?;
        let stream = time::timeout(self.connect_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| anyhow!("tcp connect to {} timed out", remote))??;
        let tcp = Arc::new(TcpTransport::from_stream(stream)?);
        let transport = SipTransport::new(manager, tcp.clone());
        if let Err(e) = manager.register_transport(&transport) {
            warn!("{} not registered: {e}", transport.name());
            tcp.close().await?;
            return Err(e);
        }
        tcp.start(Arc::downgrade(&transport));
        Ok(transport)
    }
}

/// Accept inbound connections on `addr` and register each as a transport.
/// Returns the bound address.
pub async fn listen(manager: &TransportManager, addr: SocketAddr) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("tcp listening on {}", local_addr);
    let manager = manager.clone();
    tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("tcp accept error {e}");
                    continue;
                }
            };
            if manager.is_shutdown() {
                break;
            }
            if let Err(e) = accept(&manager, stream).await {
                error!("tcp connection {} not accepted: {}", peer_addr, e);
            }
        }
        info!("tcp listener {} stopped", local_addr);
    });
    Ok(local_addr)
}

async fn accept(manager: &TransportManager, stream: TcpStream) -> Result<()> {
    let tcp = Arc::new(TcpTransport::from_stream(stream)?);
    let transport = SipTransport::new(manager, tcp.clone());
    if let Err(e) = manager.register_transport(&transport) {
        tcp.close().await?;
        return Err(e);
    }
    tcp.start(Arc::downgrade(&transport));
    Ok(())
}
