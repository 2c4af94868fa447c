use super::dispatch::RxError;
use super::message::header_end;
use bytes::{Buf, Bytes, BytesMut};
use std::str;
use tracing::debug;

#[derive(Debug, PartialEq, Eq)]
pub enum Boundary {
    /// A whole message of this many bytes starts the buffer.
    Complete(usize),
    Incomplete,
    /// Unusable message; skip this many bytes.
    Invalid(usize, &'static str),
}

/// Locate the end of the first message in `buf`.
///
/// Without a Content-Length the message runs to the end of the buffer, unless
/// another start line follows; then the message is invalid and framing picks
/// up again at that line.
pub fn find_message(buf: &[u8]) -> Boundary {
    let body_start = match header_end(buf) {
        Some((_, body_start)) => body_start,
        None => return Boundary::Incomplete,
    };

    let head = &buf[..body_start];
    let mut content_length = None;
    for line in head.split(|b| *b == b'\n').skip(1) {
        let line = match str::from_utf8(line) {
            Ok(line) => line,
            Err(_) => continue,
        };
        let mut parts = line.splitn(2, ':');
        let name = parts.next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            let value = parts.next().unwrap_or("").trim();
            match value.parse::<usize>() {
                Ok(len) => content_length = Some(len),
                Err(_) => return Boundary::Invalid(body_start, "bad content-length"),
            }
            break;
        }
    }

    match content_length {
        Some(len) if buf.len() >= body_start + len => Boundary::Complete(body_start + len),
        Some(_) => Boundary::Incomplete,
        None => match next_start_line(buf, body_start) {
            Some(next) => Boundary::Invalid(next, "missing content-length"),
            None => Boundary::Complete(buf.len()),
        },
    }
}

/// Offset of the first line at or after `from` that opens a request or a
/// status line.
fn next_start_line(buf: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while pos < buf.len() {
        let end = buf[pos..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(buf.len(), |i| pos + i);
        if is_start_line(&buf[pos..end]) {
            return Some(pos);
        }
        pos = end + 1;
    }
    None
}

fn is_start_line(line: &[u8]) -> bool {
    let line = match str::from_utf8(line) {
        Ok(line) => line.trim_end_matches('\r'),
        Err(_) => return false,
    };
    if line.starts_with("SIP/2.0 ") {
        return true;
    }
    let parts: Vec<&str> = line.split(' ').collect();
    parts.len() == 3
        && parts[2] == "SIP/2.0"
        && !parts[0].is_empty()
        && parts[0].bytes().all(|b| b.is_ascii_uppercase())
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FramingState {
    Idle,
    Accumulating,
}

/// Splits received chunks into message frames, keeping leftovers of stream
/// transports between reads.
pub struct Reassembler {
    buf: BytesMut,
    max_size: usize,
    datagram: bool,
}

impl Reassembler {
    pub fn new(max_size: usize, datagram: bool) -> Reassembler {
        Reassembler {
            buf: BytesMut::new(),
            max_size,
            datagram,
        }
    }

    pub fn state(&self) -> FramingState {
        if self.buf.is_empty() {
            FramingState::Idle
        } else {
            FramingState::Accumulating
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Bytes, RxError>> {
        if self.datagram {
            if data.is_empty() || is_keepalive(data) {
                return Vec::new();
            }
            return vec![Ok(Bytes::copy_from_slice(data))];
        }

        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            let skip = self
                .buf
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            if skip > 0 {
                self.buf.advance(skip);
            }
            if self.buf.is_empty() {
                break;
            }

            match find_message(&self.buf) {
                Boundary::Complete(len) => {
                    frames.push(Ok(self.buf.split_to(len).freeze()));
                }
                Boundary::Invalid(skip, reason) => {
                    self.buf.advance(skip);
                    frames.push(Err(RxError::InvalidMessage(reason.to_string())));
                }
                Boundary::Incomplete => {
                    if self.buf.len() > self.max_size {
                        let len = self.buf.len();
                        self.buf.clear();
                        frames.push(Err(RxError::FramingOverflow(len)));
                    } else if !self.buf.is_empty() {
                        debug!("{} bytes waiting for the rest of a message", self.buf.len());
                    }
                    break;
                }
            }
        }
        frames
    }
}

fn is_keepalive(data: &[u8]) -> bool {
    data.iter().all(|b| *b == b'\r' || *b == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(callid: &str, body: &str) -> String {
        format!(
            "MESSAGE sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bK{callid}\r\n\
             To: <sip:bob@example.com>\r\n\
             From: <sip:alice@example.com>;tag=1\r\n\
             Call-ID: {callid}\r\n\
             CSeq: 1 MESSAGE\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn boundary_detection() {
        let msg = request("a", "hello");
        assert_eq!(find_message(msg.as_bytes()), Boundary::Complete(msg.len()));
        assert_eq!(
            find_message(&msg.as_bytes()[..msg.len() - 1]),
            Boundary::Incomplete
        );
        assert_eq!(find_message(b"OPTIONS sip:x SIP/2.0\r\nCall-ID: 1"), Boundary::Incomplete);

        let compact = "SIP/2.0 200 OK\r\nl: 2\r\n\r\nokEXTRA";
        assert_eq!(find_message(compact.as_bytes()), Boundary::Complete(compact.len() - 5));

        let bad = "SIP/2.0 200 OK\r\nContent-Length: x\r\n\r\n";
        assert_eq!(
            find_message(bad.as_bytes()),
            Boundary::Invalid(bad.len(), "bad content-length")
        );

        let bare = "SIP/2.0 200 OK\nCall-ID: 1\n\nrest";
        assert_eq!(find_message(bare.as_bytes()), Boundary::Complete(bare.len()));
    }

    #[test]
    fn pipelined_frames_keep_order() {
        let a = request("a", "one");
        let b = request("b", "two");
        let c = request("c", "");
        let mut rx = Reassembler::new(4000, false);
        let frames = rx.feed([a.as_str(), b.as_str(), c.as_str()].concat().as_bytes());
        let frames: Vec<Bytes> = frames.into_iter().map(Result::unwrap).collect();
        assert_eq!(frames, vec![Bytes::from(a), Bytes::from(b), Bytes::from(c)]);
        assert_eq!(rx.state(), FramingState::Idle);
    }

    #[test]
    fn split_inside_header() {
        let msg = request("a", "body");
        let mut rx = Reassembler::new(4000, false);
        assert!(rx.feed(&msg.as_bytes()[..20]).is_empty());
        assert_eq!(rx.state(), FramingState::Accumulating);
        assert_eq!(rx.buffered(), 20);
        let frames = rx.feed(&msg.as_bytes()[20..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), &Bytes::from(msg));
        assert_eq!(rx.state(), FramingState::Idle);
    }

    #[test]
    fn oversized_partial_message_overflows_once() {
        let mut rx = Reassembler::new(2048, false);
        let mut big = "INVITE sip:bob@example.com SIP/2.0\r\n".to_string();
        while big.len() < 2900 {
            big.push_str("X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        let frames = rx.feed(big.as_bytes());
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(RxError::FramingOverflow(n)) if n == big.len()));
        assert_eq!(rx.buffered(), 0);
        assert_eq!(rx.state(), FramingState::Idle);

        let msg = request("next", "");
        let frames = rx.feed(msg.as_bytes());
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[test]
    fn keepalives_are_skipped() {
        let msg = request("a", "");
        let mut rx = Reassembler::new(4000, false);
        assert!(rx.feed(b"\r\n\r\n").is_empty());
        assert_eq!(rx.state(), FramingState::Idle);
        let frames = rx.feed(format!("\r\n\r\n{msg}\r\n\r\n").as_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(rx.state(), FramingState::Idle);

        let mut udp = Reassembler::new(4000, true);
        assert!(udp.feed(b"\r\n\r\n").is_empty());
        assert!(udp.feed(b"").is_empty());
    }

    #[test]
    fn datagram_is_one_frame() {
        let a = request("a", "one");
        let mut rx = Reassembler::new(4000, true);
        let frames = rx.feed(&a.as_bytes()[..30]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().len(), 30);
        assert_eq!(rx.state(), FramingState::Idle);
    }

    #[test]
    fn bad_content_length_skips_header_block() {
        let bad = "SIP/2.0 200 OK\r\nContent-Length: nope\r\n\r\n";
        let good = request("g", "x");
        let mut rx = Reassembler::new(4000, false);
        let frames = rx.feed([bad, good.as_str()].concat().as_bytes());
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(RxError::InvalidMessage(_))));
        assert_eq!(frames[1].as_ref().unwrap(), &Bytes::from(good));
    }

    #[test]
    fn missing_content_length_stops_at_next_message() {
        let first = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
                     Call-ID: nolen\r\n\
                     CSeq: 1 OPTIONS\r\n\r\n\
                     stray body\r\n";
        let second = request("b", "two");
        let joined = [first, second.as_str()].concat();
        assert_eq!(
            find_message(joined.as_bytes()),
            Boundary::Invalid(first.len(), "missing content-length")
        );

        let mut rx = Reassembler::new(4000, false);
        let frames = rx.feed(joined.as_bytes());
        assert_eq!(frames.len(), 2);
        assert!(
            matches!(&frames[0], Err(RxError::InvalidMessage(reason)) if reason == "missing content-length")
        );
        assert_eq!(frames[1].as_ref().unwrap(), &Bytes::from(second));
        assert_eq!(rx.state(), FramingState::Idle);
    }

    #[test]
    fn bare_lf_message_before_crlf_message() {
        let bare = "SIP/2.0 200 OK\nCall-ID: lf\nContent-Length: 2\n\nok";
        let crlf = request("c", "three");
        let joined = [bare, crlf.as_str()].concat();
        assert_eq!(find_message(joined.as_bytes()), Boundary::Complete(bare.len()));

        let mut rx = Reassembler::new(4000, false);
        let frames = rx.feed(joined.as_bytes());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &Bytes::from(bare));
        assert_eq!(frames[1].as_ref().unwrap(), &Bytes::from(crlf));
    }
}
