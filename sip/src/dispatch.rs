use super::message::Message;
use super::transport::TransportType;
use async_channel::Sender;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RxError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("missing mandatory header {0}")]
    MissingMandatoryHeader(&'static str),
    #[error("response with more than one via")]
    MultipleViaInResponse,
    #[error("partial message of {0} bytes exceeds receive buffer")]
    FramingOverflow(usize),
}

/// Where and when a frame arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub transport: TransportType,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub received_at: SystemTime,
    pub len: usize,
}

pub struct RxFrame {
    pub data: Bytes,
    pub source: SourceInfo,
}

/// One processed frame delivered upward.
#[derive(Debug)]
pub struct Incoming {
    pub result: Result<Message, RxError>,
    pub source: SourceInfo,
}

#[derive(Clone)]
pub struct Dispatcher {
    sender: Sender<Incoming>,
}

impl Dispatcher {
    pub fn new(sender: Sender<Incoming>) -> Dispatcher {
        Dispatcher { sender }
    }

    pub fn dispatch(&self, frame: RxFrame) {
        let result = Self::process(&frame);
        match &result {
            Ok(msg) => debug!(
                "rx {} bytes from {}:{} callid={}",
                frame.source.len,
                frame.source.transport,
                frame.source.remote,
                msg.callid.as_deref().unwrap_or("")
            ),
            Err(e) => warn!(
                "dropping {} bytes from {}:{}: {}",
                frame.source.len, frame.source.transport, frame.source.remote, e
            ),
        }
        self.deliver(Incoming {
            result,
            source: frame.source,
        });
    }

    /// Report a framing failure that produced no frame.
    pub fn report(&self, err: RxError, source: SourceInfo) {
        self.deliver(Incoming {
            result: Err(err),
            source,
        });
    }

    fn deliver(&self, incoming: Incoming) {
        if let Err(e) = self.sender.try_send(incoming) {
            warn!("incoming message not delivered: {}", e);
        }
    }

    /// Parse, validate and patch the top Via of one frame.
    pub fn process(frame: &RxFrame) -> Result<Message, RxError> {
        let mut msg = Message::parse(&frame.data)
            .map_err(|e| RxError::InvalidMessage(e.to_string()))?;

        if let Some(name) = msg.missing_mandatory_header() {
            return Err(RxError::MissingMandatoryHeader(name));
        }

        let source = frame.source.remote;
        if let Some(via) = msg.top_via_mut() {
            if via.sent_by_ip() != Some(source.ip()) {
                via.received = Some(source.ip().to_string());
            }
            if via.rport.is_some() {
                via.rport = Some(source.port());
            }
        }

        if msg.is_response() && msg.via.len() > 1 {
            return Err(RxError::MultipleViaInResponse);
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Reassembler;
    use std::str::FromStr;

    fn frame(text: &str, remote: &str) -> RxFrame {
        RxFrame {
            data: Bytes::from(text.to_string()),
            source: SourceInfo {
                transport: TransportType::Udp,
                local: "127.0.0.1:5060".parse().unwrap(),
                remote: remote.parse().unwrap(),
                received_at: SystemTime::now(),
                len: text.len(),
            },
        }
    }

    fn invite(via: &str) -> String {
        format!(
            "INVITE sip:bob@example.com SIP/2.0\r\n\
             Via: {via}\r\n\
             To: <sip:bob@example.com>\r\n\
             From: <sip:alice@example.com>;tag=1\r\n\
             Call-ID: inv1\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n"
        )
    }

    #[test]
    fn received_and_rport_are_patched() {
        let text = invite("SIP/2.0/UDP 192.168.1.10:5060;rport;branch=z9hG4bKa");
        let msg = Dispatcher::process(&frame(&text, "203.0.113.5:40000")).unwrap();
        let via = msg.top_via().unwrap();
        assert_eq!(via.received.as_deref(), Some("203.0.113.5"));
        assert_eq!(via.rport, Some(40000));
        assert!(msg.to_string().contains(";received=203.0.113.5;rport=40000"));
    }

    #[test]
    fn matching_source_is_left_alone() {
        let text = invite("SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bKa");
        let msg = Dispatcher::process(&frame(&text, "192.168.1.10:5060")).unwrap();
        let via = msg.top_via().unwrap();
        assert_eq!(via.received, None);
        assert_eq!(via.rport, None);
    }

    #[test]
    fn rport_filled_without_received() {
        let text = invite("SIP/2.0/UDP 192.168.1.10:5060;rport;branch=z9hG4bKa");
        let msg = Dispatcher::process(&frame(&text, "192.168.1.10:40001")).unwrap();
        let via = msg.top_via().unwrap();
        assert_eq!(via.received, None);
        assert_eq!(via.rport, Some(40001));
        let rendered = msg.to_string();
        assert!(rendered.contains(";rport=40001"));
        assert!(!rendered.contains("received="));
    }

    #[test]
    fn hostname_via_gets_received() {
        let text = invite("SIP/2.0/UDP pc33.example.com;branch=z9hG4bKa");
        let msg = Dispatcher::process(&frame(&text, "192.168.1.10:5060")).unwrap();
        assert_eq!(msg.top_via().unwrap().received.as_deref(), Some("192.168.1.10"));
    }

    #[test]
    fn missing_header_is_reported() {
        let text = invite("SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKa").replace("CSeq: 1 INVITE\r\n", "");
        assert_eq!(
            Dispatcher::process(&frame(&text, "10.0.0.1:5060")),
            Err(RxError::MissingMandatoryHeader("CSeq"))
        );
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(
            Dispatcher::process(&frame("hello world\r\n\r\n", "10.0.0.1:5060")),
            Err(RxError::InvalidMessage(_))
        ));
    }

    #[test]
    fn response_with_two_vias_is_dropped() {
        let text = "SIP/2.0 200 OK\r\n\
                    Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKa\r\n\
                    Via: SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bKb\r\n\
                    To: <sip:bob@example.com>;tag=2\r\n\
                    From: <sip:alice@example.com>;tag=1\r\n\
                    Call-ID: inv1\r\n\
                    CSeq: 1 INVITE\r\n\
                    Content-Length: 0\r\n\r\n";
        assert_eq!(
            Dispatcher::process(&frame(text, "10.0.0.1:5060")),
            Err(RxError::MultipleViaInResponse)
        );
    }

    #[tokio::test]
    async fn every_frame_produces_one_event() {
        let (sender, receiver) = async_channel::unbounded();
        let dispatcher = Dispatcher::new(sender);
        dispatcher.dispatch(frame("junk\r\n\r\n", "10.0.0.1:5060"));
        dispatcher.dispatch(frame(
            &invite("SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKa"),
            "10.0.0.1:5060",
        ));
        let first = receiver.recv().await.unwrap();
        assert!(first.result.is_err());
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.result.unwrap().callid.as_deref(), Some("inv1"));
        assert!(receiver.is_empty());
    }

    #[test]
    fn render_reassemble_dispatch_round_trip() {
        let original =
            Message::from_str(&invite("SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bKa")).unwrap();
        let wire = original.render(4000).unwrap();
        let mut rx = Reassembler::new(4000, false);
        let (a, b) = wire.split_at(wire.len() / 2);
        assert!(rx.feed(a).is_empty());
        let frames = rx.feed(b);
        assert_eq!(frames.len(), 1);
        let data = frames.into_iter().next().unwrap().unwrap();
        let len = data.len();
        let msg = Dispatcher::process(&RxFrame {
            data,
            source: SourceInfo {
                transport: TransportType::Tcp,
                local: "127.0.0.1:5060".parse().unwrap(),
                remote: "10.0.0.1:5060".parse().unwrap(),
                received_at: SystemTime::now(),
                len,
            },
        })
        .unwrap();
        assert_eq!(msg, original);
    }
}
