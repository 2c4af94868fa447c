use super::message::Message;
use super::transport::TransportError;
use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct TxState {
    buf: Option<Bytes>,
    pending: bool,
}

/// One outgoing message and its lazily rendered wire form.
///
/// Lock order is `state` then `msg`.
pub struct TxData {
    msg: Mutex<Message>,
    state: Mutex<TxState>,
    ref_count: AtomicUsize,
    renders: AtomicUsize,
}

impl TxData {
    pub fn new(msg: Message) -> Arc<TxData> {
        Arc::new(TxData {
            msg: Mutex::new(msg),
            state: Mutex::new(TxState {
                buf: None,
                pending: false,
            }),
            ref_count: AtomicUsize::new(0),
            renders: AtomicUsize::new(0),
        })
    }

    /// A copy of the message. Changes go through `modify`.
    pub fn message(&self) -> Message {
        self.msg.lock().clone()
    }

    /// Wire bytes, serialising only when no valid buffer exists.
    pub fn render(&self, max_len: usize) -> Result<Bytes> {
        let mut state = self.state.lock();
        self.render_locked(&mut state, max_len)
    }

    fn render_locked(&self, state: &mut TxState, max_len: usize) -> Result<Bytes> {
        if let Some(buf) = &state.buf {
            return Ok(buf.clone());
        }
        let buf = self.msg.lock().render(max_len)?;
        self.renders.fetch_add(1, Ordering::SeqCst);
        state.buf = Some(buf.clone());
        Ok(buf)
    }

    pub fn invalidate(&self) {
        self.state.lock().buf = None;
    }

    /// Change the message; the next render serialises again.
    pub fn modify<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Message) -> R,
    {
        let mut state = self.state.lock();
        let mut msg = self.msg.lock();
        let result = f(&mut *msg);
        state.buf = None;
        result
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().buf.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Number of times the message has been serialised.
    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        let released = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match released {
            Ok(1) => {
                self.state.lock().buf = None;
                debug!("destroying {}", self.info());
            }
            Ok(_) => (),
            Err(_) => warn!("{} released with no references", self.info()),
        }
    }

    pub fn info(&self) -> String {
        let msg = self.msg.lock();
        let cseq = msg
            .cseq
            .as_ref()
            .map(|c| c.seq.to_string())
            .unwrap_or_else(|| "-".to_string());
        match (&msg.method, msg.code) {
            (Some(method), _) => {
                format!("Request msg {}/cseq={} (txd{:p})", method, cseq, self)
            }
            (None, Some(code)) => format!(
                "Response msg {}/{}/cseq={} (txd{:p})",
                code,
                msg.cseq
                    .as_ref()
                    .map(|c| c.method.to_string())
                    .unwrap_or_default(),
                cseq,
                self
            ),
            (None, None) => format!("Unknown msg (txd{:p})", self),
        }
    }

    pub(crate) fn begin_send(&self, max_len: usize) -> Result<Bytes> {
        let mut state = self.state.lock();
        if state.pending {
            Err(TransportError::AlreadyPending)?;
        }
        let buf = self.render_locked(&mut state, max_len)?;
        self.add_ref();
        state.pending = true;
        Ok(buf)
    }

    pub(crate) fn end_send(&self) {
        self.state.lock().pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{GenericHeader, Method};
    use std::str::FromStr;

    fn register() -> Message {
        Message::from_str(
            "REGISTER sip:example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK9\r\n\
             To: <sip:alice@example.com>\r\n\
             From: <sip:alice@example.com>;tag=9\r\n\
             Call-ID: reg1\r\n\
             CSeq: 7 REGISTER\r\n\
             Content-Length: 0\r\n\r\n",
        )
        .unwrap()
    }

    #[test]
    fn render_is_idempotent() {
        let tdata = TxData::new(register());
        assert!(!tdata.is_valid());
        let a = tdata.render(4000).unwrap();
        let b = tdata.render(4000).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(tdata.render_count(), 1);
        assert!(tdata.is_valid());
    }

    #[test]
    fn modify_forces_rerender() {
        let tdata = TxData::new(register());
        let before = tdata.render(4000).unwrap();
        tdata.modify(|msg| {
            msg.generic_headers.push(GenericHeader {
                name: "X-Test".to_string(),
                content: "1".to_string(),
            })
        });
        assert!(!tdata.is_valid());
        let after = tdata.render(4000).unwrap();
        assert_eq!(tdata.render_count(), 2);
        assert!(after.len() > before.len());

        tdata.invalidate();
        tdata.render(4000).unwrap();
        assert_eq!(tdata.render_count(), 3);
    }

    #[test]
    fn release_to_zero_drops_buffer() {
        let tdata = TxData::new(register());
        tdata.add_ref();
        tdata.add_ref();
        tdata.render(4000).unwrap();
        tdata.release();
        assert!(tdata.is_valid());
        tdata.release();
        assert_eq!(tdata.ref_count(), 0);
        assert!(!tdata.is_valid());
        tdata.release();
        assert_eq!(tdata.ref_count(), 0);
    }

    #[test]
    fn begin_send_rejects_pending() {
        let tdata = TxData::new(register());
        tdata.begin_send(4000).unwrap();
        assert!(tdata.is_pending());
        assert_eq!(tdata.ref_count(), 1);
        let err = tdata.begin_send(4000).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransportError>(),
            Some(TransportError::AlreadyPending)
        ));
        tdata.end_send();
        assert!(!tdata.is_pending());
    }

    #[test]
    fn info_describes_message() {
        let tdata = TxData::new(register());
        assert!(tdata.info().starts_with("Request msg REGISTER/cseq=7 (txd"));
        tdata.modify(|msg| {
            msg.method = None;
            msg.request_uri = None;
            msg.code = Some(200);
            msg.status = Some("OK".to_string());
        });
        assert!(tdata.info().starts_with("Response msg 200/REGISTER/cseq=7"));
        assert_eq!(tdata.message().cseq.as_ref().unwrap().method, Method::REGISTER);
    }

    #[test]
    fn message_copy_does_not_touch_rendered_bytes() {
        let tdata = TxData::new(register());
        let before = tdata.render(4000).unwrap();
        let mut copy = tdata.message();
        copy.callid = Some("changed".to_string());
        let after = tdata.render(4000).unwrap();
        assert_eq!(before, after);
        assert_eq!(tdata.render_count(), 1);
        assert_eq!(tdata.message().callid.as_deref(), Some("reg1"));

        tdata.modify(|msg| msg.callid = Some("changed".to_string()));
        let changed = tdata.render(4000).unwrap();
        assert!(std::str::from_utf8(&changed)
            .unwrap()
            .contains("Call-ID: changed\r\n"));
    }
}
