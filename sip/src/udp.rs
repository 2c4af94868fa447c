use super::transport::{SipTransport, Transport, TransportFactory, TransportManager, TransportType};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, warn};

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
            reader: Mutex::new(None),
        })
    }

    /// Feed every datagram into `transport` until it goes away.
    pub fn start(&self, transport: Weak<SipTransport>, max_packet_len: usize) {
        let socket = self.socket.clone();
        let handle = tokio::spawn(async move {
            UdpTransport::run(socket, transport, max_packet_len).await;
        });
        if let Some(old) = self.reader.lock().replace(handle) {
            old.abort();
        }
    }

    async fn run(socket: Arc<UdpSocket>, transport: Weak<SipTransport>, max_packet_len: usize) {
        let mut buf = vec![0; max_packet_len];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((0, _)) => continue,
                Ok((n, addr)) => match transport.upgrade() {
                    Some(transport) => transport.on_received(&buf[..n], addr),
                    None => return,
                },
                Err(e) => error!("udp socket receive error {e}"),
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<usize> {
        let result = self.socket.send_to(data, dest).await;
        if let Err(e) = result.as_ref() {
            error!("udp socket send error {e}");
        }
        Ok(result?)
    }

    async fn close(&self) -> Result<()> {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        Ok(())
    }
}

/// Creates the one shared UDP transport bound to `bind`.
pub struct UdpFactory {
    bind: SocketAddr,
}

impl UdpFactory {
    pub fn new(bind: SocketAddr) -> UdpFactory {
        UdpFactory { bind }
    }
}

#[async_trait]
impl TransportFactory for UdpFactory {
    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    async fn create_transport(
        &self,
        manager: &TransportManager,
        _remote: Option<SocketAddr>,
    ) -> Result<Arc<SipTransport>> {
        let udp = Arc::new(UdpTransport::bind(self.bind).await?);
        let transport = SipTransport::new(manager, udp.clone());
        udp.start(Arc::downgrade(&transport), manager.config().max_packet_len);
        if let Err(e) = manager.register_transport(&transport) {
            warn!("{} not registered: {e}", transport.name());
            udp.close().await?;
            return Err(e);
        }
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::message::Message;
    use crate::txdata::TxData;
    use std::str::FromStr;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn acquire_twice_returns_same_socket() {
        let (sender, _receiver) = async_channel::unbounded();
        let manager = TransportManager::new(TransportConfig::default(), sender);
        manager
            .register_factory(Arc::new(UdpFactory::new(loopback())))
            .unwrap();

        let a = manager
            .acquire_transport(TransportType::Udp, None)
            .await
            .unwrap();
        let b = manager
            .acquire_transport(TransportType::Udp, None)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(manager.transport_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn datagram_is_patched_and_delivered() {
        let (sender, receiver) = async_channel::unbounded();
        let manager = TransportManager::new(TransportConfig::default(), sender);
        manager
            .register_factory(Arc::new(UdpFactory::new(loopback())))
            .unwrap();
        let transport = manager
            .acquire_transport(TransportType::Udp, None)
            .await
            .unwrap();

        let peer = UdpSocket::bind(loopback()).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let text = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
                    Via: SIP/2.0/UDP 192.0.2.1:5060;rport;branch=z9hG4bKu\r\n\
                    To: <sip:bob@example.com>\r\n\
                    From: <sip:alice@example.com>;tag=1\r\n\
                    Call-ID: udp1\r\n\
                    CSeq: 1 OPTIONS\r\n\
                    Content-Length: 0\r\n\r\n";
        peer.send_to(text.as_bytes(), transport.local_addr())
            .await
            .unwrap();

        let incoming = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.source.remote, peer_addr);
        let msg = incoming.result.unwrap();
        let via = msg.top_via().unwrap();
        assert_eq!(via.received.as_deref(), Some("127.0.0.1"));
        assert_eq!(via.rport, Some(peer_addr.port()));

        let tdata = TxData::new(Message::from_str(text).unwrap());
        let sent = transport.send(&tdata, peer_addr).await.unwrap();
        let mut buf = vec![0; 4000];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, sent);
        assert_eq!(Message::parse(&buf[..n]).unwrap().callid.as_deref(), Some("udp1"));

        manager.shutdown().await;
        assert!(transport.is_closed());
    }
}
