//! # SIP Transport Layer
//!
//! Owns the sockets and connections a SIP stack talks through. Outgoing
//! messages are rendered once and written through a shared, reference counted
//! transport; incoming bytes are framed, validated and patched before being
//! handed upward on a channel.
//!
//! ## Core Components
//!
//! - **TransportManager**: registry of live transports keyed by type and remote
//!   address, plus the factories that create them on demand
//! - **SipTransport**: one UDP socket or TCP connection with an idle timer
//! - **TxData**: an outgoing message and its cached wire form
//! - **Reassembler**: stream framing by `Content-Length`
//! - **Dispatcher**: mandatory header checks and Via `received`/`rport`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sip::config::TransportConfig;
//! use sip::transport::{TransportManager, TransportType};
//! use sip::udp::UdpFactory;
//!
//! let (sender, receiver) = async_channel::unbounded();
//! let config = TransportConfig::default();
//! let manager = TransportManager::new(config.clone(), sender);
//! manager.register_factory(Arc::new(UdpFactory::new(config.udp_bind)))?;
//! let udp = manager.acquire_transport(TransportType::Udp, None).await?;
//! udp.send(&TxData::new(message), dest).await?;
//! udp.release();
//! ```

pub mod config;
pub mod dispatch;
pub mod framing;
pub mod message;
pub mod tcp;
pub mod transport;
pub mod txdata;
pub mod udp;
