use super::transport::{TransportError, TransportType};
use anyhow::{Error, Result};
use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Write};
use std::net::IpAddr;
use std::str;
use std::str::FromStr;
use strum_macros::EnumString;
use thiserror::Error;
use url::form_urlencoded;

lazy_static::lazy_static! {
    static ref URI_REGEX: Regex = Regex::new(
            [
                r"^(?P<scheme>[a-zA-Z][a-zA-Z0-9\+\-\.]*):",
                r"(?:(?:(?P<user>[a-zA-Z0-9\-_\.!\~\*\#'\(\)&=\+\$,;\?/%]+)",
                r"(?::(?P<password>[^:@;\?]+))?)@)?",
                r"(?P<host>\[[0-9a-fA-F:\.]+\]|[^;\?:\[\]]*)(?::(?P<port>[\d]+))?",
                r"(?:;(?P<params>[^\?]*))?",
                r"(?:\?(?P<headers>.*))?$",
            ]
            .concat()
            .as_ref(),
        ).unwrap();

    static ref ADDRESS_REGEX: [Regex;3] = [
        Regex::new(r#"^(?P<name>[a-zA-Z0-9\-\._\+\~ \t]*)<(?P<uri>[^>]+)>(?:;(?P<params>[^\?]*))?"#).unwrap(),
        Regex::new(r#"^(?:"(?P<name>[^"]+)")[ \t]*<(?P<uri>[^>]+)>(?:;(?P<params>[^\?]*))?"#).unwrap(),
        Regex::new(r#"^[ \t]*(?P<name>)(?P<uri>[^;]+)(?:;(?P<params>[^\?]*))?"#).unwrap(),
    ];
}

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    PartialEq,
    Eq,
    Clone,
    Serialize,
    Deserialize,
)]
pub enum Method {
    INVITE,
    REGISTER,
    CANCEL,
    ACK,
    BYE,
    SUBSCRIBE,
    REFER,
    INFO,
    NOTIFY,
    PUBLISH,
    OPTIONS,
    PRACK,
    UPDATE,
    MESSAGE,
}

impl Default for Method {
    fn default() -> Self {
        Method::INVITE
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid start line")]
    InvalidStartLine,
    #[error("invalid via header")]
    InvalidVia,
    #[error("invalid uri")]
    InvalidUri,
    #[error("invalid address")]
    InvalidAddress,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("duplicate {0} header")]
    DuplicateHeader(&'static str),
    #[error("body shorter than content-length ({0} < {1})")]
    Truncated(usize, usize),
}

#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cseq {
    pub seq: u32,
    pub method: Method,
}

impl FromStr for Cseq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() != 2 {
            Err(MessageError::InvalidMessage)?;
        }
        let seq = parts[0].parse::<u32>()?;
        let method = Method::from_str(parts[1])?;
        Ok(Cseq { seq, method })
    }
}

impl Display for Cseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Via {
    pub transport: TransportType,
    pub host: String,
    pub port: Option<u16>,
    pub branch: String,
    pub received: Option<String>,
    /// `Some(0)` is a bare `;rport` asking the receiver to fill it in.
    pub rport: Option<u16>,
    pub params: IndexMap<String, Option<String>>,
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut via = Via::default();
        let parts: Vec<&str> = s.trim().splitn(2, char::is_whitespace).collect();
        if parts.len() != 2 {
            Err(MessageError::InvalidVia)?;
        }

        let proto = parts[0];
        let addr = parts[1]
            .split(';')
            .map(|p| p.trim())
            .collect::<Vec<&str>>()
            .join(";");

        let parts: Vec<&str> = proto.split('/').collect();
        if parts.len() != 3 {
            Err(MessageError::InvalidVia)?;
        }
        via.transport = TransportType::from_str(&parts[2].to_lowercase())
            .map_err(|_| MessageError::InvalidVia)?;

        let uri = Uri::from_str(&["sip:", &addr].concat())?;
        if uri.host.is_empty() {
            Err(MessageError::InvalidVia)?;
        }
        via.host = uri.host;
        via.port = uri.port;
        for (key, value) in uri.params {
            match key.as_ref() {
                "branch" => via.branch = value.unwrap_or_else(|| "".to_string()),
                "received" => via.received = value,
                "rport" => {
                    via.rport =
                        Some(value.and_then(|r| r.parse::<u16>().ok()).unwrap_or(0));
                }
                _ => {
                    via.params.insert(key, value);
                }
            }
        }

        Ok(via)
    }
}

impl Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SIP/2.0/{} {}",
            self.transport.to_string().to_uppercase(),
            self.host
        )?;

        if let Some(ref p) = self.port {
            write!(f, ":{}", p)?;
        }

        if let Some(ref r) = self.received {
            write!(f, ";received={}", r)?;
        }

        match self.rport {
            Some(0) => write!(f, ";rport")?,
            Some(r) => write!(f, ";rport={}", r)?,
            None => (),
        }

        if !self.branch.is_empty() {
            write!(f, ";branch={}", self.branch)?;
        }

        write_params(f, &self.params)
    }
}

impl Via {
    /// The sent-by host as an IP address, if it is one.
    pub fn sent_by_ip(&self) -> Option<IpAddr> {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .ok()
    }
}

#[derive(Default, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Uri {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub transport: TransportType,
    pub lr: bool,
    pub params: IndexMap<String, Option<String>>,
    pub headers: IndexMap<String, String>,
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut uri = Uri::default();
        let caps = URI_REGEX.captures(s).ok_or(MessageError::InvalidUri)?;
        if let Some(m) = caps.name("scheme") {
            uri.scheme = m.as_str().to_string();
        }
        if let Some(m) = caps.name("user") {
            uri.user = Some(m.as_str().to_string());
        }
        if let Some(m) = caps.name("password") {
            uri.password = Some(m.as_str().to_string());
        }
        if let Some(m) = caps.name("host") {
            uri.host = m.as_str().to_string();
        }
        if let Some(m) = caps.name("port") {
            uri.port = Some(m.as_str().parse::<u16>()?);
        }

        let mut params = IndexMap::new();
        if let Some(m) = caps.name("params") {
            for p in m.as_str().split(';') {
                let mut parts = p.splitn(2, '=');

                let name = parts.next().unwrap_or("");
                if name.is_empty() {
                    continue;
                }
                let value = parts.next().map(|i| i.to_string());
                match name {
                    "transport" => {
                        let parsed = value.as_deref().map(TransportType::from_str);
                        match parsed {
                            Some(Ok(transport)) => uri.transport = transport,
                            // ws, wss and the like stay as plain params
                            _ => {
                                params.insert(name.to_string(), value);
                            }
                        }
                    }
                    "lr" => uri.lr = true,
                    _ => {
                        params.insert(name.to_string(), value);
                    }
                };
            }
        }
        uri.params = params;

        let mut headers = IndexMap::new();
        if let Some(m) = caps.name("headers") {
            for (k, v) in form_urlencoded::parse(m.as_str().as_bytes()) {
                headers.insert(k.to_string(), v.to_string());
            }
        }
        uri.headers = headers;

        Ok(uri)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:",
            if !self.scheme.is_empty() {
                &self.scheme
            } else {
                "sip"
            }
        )?;
        if let Some(ref u) = self.user {
            write!(f, "{}", u)?;
            if let Some(ref p) = self.password {
                write!(f, ":{}", p)?;
            }
            f.write_str("@")?;
        }
        write!(f, "{}", self.host)?;

        if let Some(ref p) = self.port {
            write!(f, ":{}", p)?;
        }

        if self.transport != TransportType::Udp {
            write!(
                f,
                ";transport={}",
                self.transport.to_string().to_lowercase()
            )?;
        }

        if self.lr {
            write!(f, ";lr")?;
        }

        write_params(f, &self.params)?;

        let mut encoded = form_urlencoded::Serializer::new(String::new());
        for (k, v) in self.headers.iter() {
            encoded.append_pair(k, v);
        }
        let encoded = encoded.finish();
        if !encoded.is_empty() {
            f.write_str("?")?;
            f.write_str(&encoded)?;
        }

        Ok(())
    }
}

fn write_params(
    f: &mut fmt::Formatter,
    params: &IndexMap<String, Option<String>>,
) -> fmt::Result {
    for (key, val) in params.iter() {
        f.write_str(";")?;
        f.write_str(key.as_str())?;
        if let Some(inner) = val {
            f.write_str("=")?;
            f.write_str(inner.as_str())?;
        }
    }
    Ok(())
}

#[derive(Default, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GenericHeader {
    pub name: String,
    pub content: String,
}

impl Display for GenericHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", &self.name, &self.content)
    }
}

#[derive(Default, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Address {
    pub display_name: String,
    pub uri: Uri,
    pub tag: Option<String>,
    pub params: IndexMap<String, Option<String>>,
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.split(';').map(|p| p.trim()).collect::<Vec<&str>>().join(";");
        for re in ADDRESS_REGEX.iter() {
            if let Some(cap) = re.captures(&s) {
                let display_name = cap
                    .name("name")
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                let uri = Uri::from_str(
                    cap.name("uri").ok_or(MessageError::InvalidUri)?.as_str().trim(),
                )?;

                let mut address = Address {
                    display_name,
                    uri,
                    tag: None,
                    params: IndexMap::new(),
                };

                if let Some(m) = cap.name("params") {
                    for part in m.as_str().split(';') {
                        let mut split = part.trim().splitn(2, '=');
                        let name = split.next().unwrap_or("");
                        if name.is_empty() {
                            continue;
                        }
                        let value = split.next().map(|i| i.to_string());
                        match name {
                            "tag" => address.tag = value,
                            _ => {
                                address.params.insert(name.to_string(), value);
                            }
                        }
                    }
                }

                return Ok(address);
            }
        }
        Err(MessageError::InvalidAddress)?
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.display_name.is_empty() {
            write!(f, r#""{}" "#, self.display_name)?;
        }

        write!(f, "<{}>", self.uri)?;

        if let Some(ref t) = self.tag {
            write!(f, ";tag={}", t)?;
        }

        write_params(f, &self.params)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub method: Option<Method>,
    pub request_uri: Option<Uri>,
    pub code: Option<u16>,
    pub status: Option<String>,

    pub via: Vec<Via>,
    pub route: Vec<Address>,
    pub record_route: Vec<Address>,
    pub max_forwards: Option<u32>,
    pub contact: Option<Address>,
    pub to: Option<Address>,
    pub from: Option<Address>,
    pub callid: Option<String>,
    pub cseq: Option<Cseq>,
    pub expires: Option<u32>,
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    pub body: Option<String>,

    pub generic_headers: Vec<GenericHeader>,
}

impl FromStr for Message {
    type Err = Error;

    fn from_str(s: &str) -> Result<Message, Error> {
        Message::parse(s.as_bytes())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_request() {
            write!(
                f,
                "{} {} SIP/2.0\r\n",
                self.method.as_ref().unwrap_or(&Method::INVITE),
                self.request_uri.as_ref().unwrap_or(&Uri::default()),
            )?;
        } else {
            write!(
                f,
                "SIP/2.0 {} {}\r\n",
                self.code.as_ref().unwrap_or(&0),
                self.status.as_deref().unwrap_or("")
            )?;
        }

        for via in self.via.iter() {
            write!(f, "Via: {}\r\n", via)?;
        }

        for address in self.record_route.iter() {
            write!(f, "Record-Route: {}\r\n", address)?;
        }

        for address in self.route.iter() {
            write!(f, "Route: {}\r\n", address)?;
        }

        if let Some(ref i) = self.max_forwards {
            write!(f, "Max-Forwards: {}\r\n", i)?;
        }

        if let Some(ref i) = self.contact {
            write!(f, "Contact: {}\r\n", i)?;
        }

        if let Some(ref i) = self.to {
            write!(f, "To: {}\r\n", i)?;
        }
        if let Some(ref i) = self.from {
            write!(f, "From: {}\r\n", i)?;
        }
        if let Some(ref i) = self.callid {
            write!(f, "Call-ID: {}\r\n", i)?;
        }
        if let Some(ref i) = self.cseq {
            write!(f, "CSeq: {}\r\n", i)?;
        }

        if let Some(h) = self.expires.as_ref() {
            write!(f, "Expires: {}\r\n", h)?;
        }

        if let Some(ref h) = self.content_type {
            write!(f, "Content-Type: {}\r\n", h)?;
        }

        if let Some(ref i) = self.user_agent {
            write!(f, "User-Agent: {}\r\n", i)?;
        }

        for generic_header in self.generic_headers.iter() {
            write!(f, "{}\r\n", generic_header)?;
        }

        write!(f, "Content-Length: {}\r\n", self.content_length())?;

        write!(f, "\r\n")?;

        if let Some(ref i) = self.body {
            write!(f, "{}", i)?;
        }

        Ok(())
    }
}

/// `fmt::Write` sink that refuses to grow past `limit` bytes.
struct BoundedWriter {
    buf: BytesMut,
    limit: usize,
}

impl fmt::Write for BoundedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.buf.len() + s.len() > self.limit {
            return Err(fmt::Error);
        }
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

impl Message {
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.code.is_some()
    }

    pub fn content_length(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.via.first_mut()
    }

    /// First of Call-ID, From, To, Via, CSeq that the message lacks.
    pub fn missing_mandatory_header(&self) -> Option<&'static str> {
        if self.callid.as_deref().map_or(true, |c| c.is_empty()) {
            Some("Call-ID")
        } else if self.from.is_none() {
            Some("From")
        } else if self.to.is_none() {
            Some("To")
        } else if self.via.is_empty() {
            Some("Via")
        } else if self.cseq.is_none() {
            Some("CSeq")
        } else {
            None
        }
    }

    /// Serialise into a buffer of at most `max_len` bytes.
    pub fn render(&self, max_len: usize) -> Result<Bytes> {
        let mut writer = BoundedWriter {
            buf: BytesMut::with_capacity(max_len),
            limit: max_len,
        };
        if write!(writer, "{}", self).is_err() {
            Err(TransportError::MessageTooLong(max_len))?;
        }
        Ok(writer.buf.freeze())
    }

    pub fn parse(buf: &[u8]) -> Result<Message> {
        let (head, body) = split_head(buf);
        let head = str::from_utf8(head)?;
        let lines = unfold_lines(head.trim_start_matches(['\r', '\n']));

        let mut msg = Message::default();
        let start = lines.first().ok_or(MessageError::InvalidStartLine)?;
        let parts: Vec<&str> = start.splitn(3, ' ').collect();
        if parts.len() != 3 {
            Err(MessageError::InvalidStartLine)?;
        }
        if parts[0].starts_with("SIP/") {
            if parts[0] != "SIP/2.0" {
                Err(MessageError::InvalidStartLine)?;
            }
            msg.code = Some(parts[1].parse::<u16>()?);
            msg.status = Some(parts[2].to_string());
        } else {
            if parts[2] != "SIP/2.0" {
                Err(MessageError::InvalidStartLine)?;
            }
            msg.method = Some(
                Method::from_str(parts[0])
                    .map_err(|_| MessageError::InvalidStartLine)?,
            );
            msg.request_uri = Some(Uri::from_str(parts[1])?);
        }

        let mut content_length = None;
        for line in lines.iter().skip(1) {
            let parts: Vec<&str> = line.splitn(2, ':').collect();
            if parts.len() != 2 {
                continue;
            }
            Self::parse_line(
                &mut msg,
                parts[0].trim(),
                parts[1].trim(),
                &mut content_length,
            )?;
        }

        let body = match content_length {
            Some(len) => {
                if body.len() < len {
                    Err(MessageError::Truncated(body.len(), len))?;
                }
                &body[..len]
            }
            None => body,
        };
        if !body.is_empty() {
            msg.body = Some(str::from_utf8(body)?.to_string());
        }

        Ok(msg)
    }

    fn parse_line(
        msg: &mut Message,
        field: &str,
        value: &str,
        content_length: &mut Option<usize>,
    ) -> Result<()> {
        match field.to_lowercase().as_ref() {
            "v" | "via" => {
                for part in value.split(',') {
                    msg.via.push(Via::from_str(part.trim())?);
                }
            }
            "record-route" => {
                if let Ok(a) = Address::from_str(value) {
                    msg.record_route.push(a);
                }
            }
            "route" => {
                if let Ok(a) = Address::from_str(value) {
                    msg.route.push(a);
                }
            }
            "max-forwards" => {
                msg.max_forwards = value.parse::<u32>().ok();
            }
            "cseq" => {
                if msg.cseq.is_some() {
                    Err(MessageError::DuplicateHeader("CSeq"))?;
                }
                msg.cseq = Some(Cseq::from_str(value)?);
            }
            "expires" => {
                msg.expires = value.parse::<u32>().ok();
            }
            "m" | "contact" => {
                msg.contact = Address::from_str(value).ok();
            }
            "f" | "from" => {
                if msg.from.is_some() {
                    Err(MessageError::DuplicateHeader("From"))?;
                }
                msg.from = Some(Address::from_str(value)?);
            }
            "t" | "to" => {
                if msg.to.is_some() {
                    Err(MessageError::DuplicateHeader("To"))?;
                }
                msg.to = Some(Address::from_str(value)?);
            }
            "i" | "call-id" => {
                if msg.callid.is_some() {
                    Err(MessageError::DuplicateHeader("Call-ID"))?;
                }
                msg.callid = Some(value.to_string());
            }
            "l" | "content-length" => {
                *content_length = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| MessageError::InvalidContentLength)?,
                );
            }
            "c" | "content-type" => {
                msg.content_type = Some(value.to_string());
            }
            "user-agent" => {
                msg.user_agent = Some(value.to_string());
            }
            _ => {
                msg.generic_headers.push(GenericHeader {
                    name: field.to_string(),
                    content: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Split at the blank line ending the header block. Without one, the whole
/// buffer is headers.
fn split_head(buf: &[u8]) -> (&[u8], &[u8]) {
    match header_end(buf) {
        Some((head_end, body_start)) => (&buf[..head_end], &buf[body_start..]),
        None => (buf, &[]),
    }
}

/// End of the header block and start of the body, taken at whichever blank
/// line comes first: `\n\r\n` or a bare `\n\n`.
pub(crate) fn header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find_subslice(buf, b"\n\r\n").map(|pos| (pos, pos + 3));
    let lf = find_subslice(buf, b"\n\n").map(|pos| (pos, pos + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Join header continuation lines (leading SP/HTAB) onto the previous line.
fn unfold_lines(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in head.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.starts_with([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}
