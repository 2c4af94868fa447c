use super::config::TransportConfig;
use super::dispatch::{Dispatcher, Incoming, RxFrame, SourceInfo};
use super::framing::Reassembler;
use super::txdata::TxData;
use anyhow::Result;
use async_channel::Sender;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use strum_macros::EnumString;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Clone,
    Copy,
    Deserialize,
    Serialize,
)]
#[strum(ascii_case_insensitive)]
pub enum TransportType {
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "tls")]
    Tls,
    #[strum(serialize = "sctp")]
    Sctp,
}

impl Default for TransportType {
    fn default() -> Self {
        TransportType::Udp
    }
}

impl TransportType {
    pub fn is_reliable(&self) -> bool {
        !self.is_datagram()
    }

    pub fn is_secure(&self) -> bool {
        *self == TransportType::Tls
    }

    /// Connectionless types share one transport for every peer.
    pub fn is_datagram(&self) -> bool {
        *self == TransportType::Udp
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tls => 5061,
            _ => 5060,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport {0} not supported")]
    UnsupportedTransport(TransportType),
    #[error("factory for {0} already registered")]
    DuplicateType(TransportType),
    #[error("transport {0} already registered")]
    AlreadyRegistered(TransportKey),
    #[error("transport still referenced ({0})")]
    StillReferenced(usize),
    #[error("message is already being sent")]
    AlreadyPending,
    #[error("message longer than {0} bytes")]
    MessageTooLong(usize),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub transport: TransportType,
    /// `None` for connectionless transports.
    pub remote: Option<SocketAddr>,
}

impl TransportKey {
    pub fn new(transport: TransportType, remote: Option<SocketAddr>) -> TransportKey {
        TransportKey { transport, remote }
    }

    pub fn any(transport: TransportType) -> TransportKey {
        TransportKey {
            transport,
            remote: None,
        }
    }
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.remote {
            Some(remote) => write!(f, "{}:{}", self.transport, remote),
            None => write!(f, "{}:*", self.transport),
        }
    }
}

/// Socket level send and close for one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> Option<SocketAddr>;

    async fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

/// Builds and registers a transport when the manager has none for a key.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn transport_type(&self) -> TransportType;

    async fn create_transport(
        &self,
        manager: &TransportManager,
        remote: Option<SocketAddr>,
    ) -> Result<Arc<SipTransport>>;
}

struct RefState {
    ref_count: usize,
    idle_timer: Option<JoinHandle<()>>,
    registered: bool,
    // bumped whenever an armed timer is superseded
    generation: u64,
}

pub struct SipTransport {
    name: String,
    key: TransportKey,
    local_addr: SocketAddr,
    io: Arc<dyn Transport>,
    manager: Weak<ManagerInner>,
    dispatcher: Dispatcher,
    state: Mutex<RefState>,
    rx: Mutex<Reassembler>,
    closed: AtomicBool,
    idle_timeout: Duration,
    max_packet_len: usize,
}

impl fmt::Debug for SipTransport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SipTransport")
            .field("name", &self.name)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl SipTransport {
    pub fn new(manager: &TransportManager, io: Arc<dyn Transport>) -> Arc<SipTransport> {
        let transport = io.transport_type();
        let local_addr = io.local_addr();
        let remote = if transport.is_datagram() {
            None
        } else {
            io.remote_addr()
        };
        let name = match remote {
            Some(remote) => format!("{}:{}->{}", transport, local_addr, remote),
            None => format!("{}:{}", transport, local_addr),
        };
        let config = manager.config();
        Arc::new(SipTransport {
            name,
            key: TransportKey::new(transport, remote),
            local_addr,
            io,
            manager: Arc::downgrade(&manager.inner),
            dispatcher: manager.inner.dispatcher.clone(),
            state: Mutex::new(RefState {
                ref_count: 0,
                idle_timer: None,
                registered: false,
                generation: 0,
            }),
            rx: Mutex::new(Reassembler::new(
                config.max_rx_buffer,
                transport.is_datagram(),
            )),
            closed: AtomicBool::new(false),
            idle_timeout: config.idle_timeout(),
            max_packet_len: config.max_packet_len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &TransportKey {
        &self.key
    }

    pub fn transport_type(&self) -> TransportType {
        self.key.transport
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.key.remote
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn add_ref(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.ref_count > 0 {
                state.ref_count += 1;
                return;
            }
        }

        // 0 -> 1 races with the idle timer, so it goes through the registry
        match self.manager.upgrade() {
            Some(inner) => {
                let _registry = inner.registry.lock();
                self.inc_ref_locked();
            }
            None => self.inc_ref_locked(),
        }
    }

    /// Caller holds the registry lock, or the manager is gone.
    fn inc_ref_locked(&self) {
        let mut state = self.state.lock();
        state.ref_count += 1;
        if state.ref_count == 1 {
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
                debug!("{} idle timer cancelled", self.name);
            }
            state.generation += 1;
        }
    }

    pub fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.ref_count == 0 {
            warn!("{} released with no references", self.name);
            return;
        }
        state.ref_count -= 1;
        if state.ref_count > 0 {
            return;
        }
        if state.registered {
            self.arm_idle_timer(&mut state);
        } else {
            drop(state);
            self.spawn_close();
        }
    }

    fn arm_idle_timer(self: &Arc<Self>, state: &mut RefState) {
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("{} no runtime, idle timer not armed", self.name);
                return;
            }
        };
        let transport = Arc::downgrade(self);
        let timeout = self.idle_timeout;
        state.idle_timer = Some(handle.spawn(async move {
            time::sleep(timeout).await;
            if let Some(transport) = transport.upgrade() {
                transport.on_idle_timeout(generation).await;
            }
        }));
        debug!("{} idle timer armed for {:?}", self.name, timeout);
    }

    async fn on_idle_timeout(self: &Arc<Self>, generation: u64) {
        let inner = match self.manager.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        {
            let mut registry = inner.registry.lock();
            let mut state = self.state.lock();
            if state.ref_count != 0 || state.generation != generation {
                return;
            }
            // our own handle, dropping it does not cancel us
            state.idle_timer.take();
            state.registered = false;
            registry.remove(self);
        }
        info!("{} idle timeout, destroying", self.name);
        self.close_io().await;
    }

    fn spawn_close(self: &Arc<Self>) {
        match Handle::try_current() {
            Ok(handle) => {
                let transport = self.clone();
                handle.spawn(async move {
                    transport.close_io().await;
                });
            }
            Err(_) => warn!("{} no runtime to close transport", self.name),
        }
    }

    async fn close_io(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} closed", self.name);
        if let Err(e) = self.io.close().await {
            warn!("{} close error {}", self.name, e);
        }
    }

    fn begin_send(self: &Arc<Self>, tdata: &Arc<TxData>) -> Result<(Bytes, SendGuard)> {
        if self.is_closed() {
            Err(TransportError::Closed)?;
        }
        let data = tdata.begin_send(self.max_packet_len)?;
        self.add_ref();
        let guard = SendGuard {
            transport: self.clone(),
            tdata: tdata.clone(),
        };
        Ok((data, guard))
    }

    /// Send and wait for the socket to finish.
    pub async fn send(
        self: &Arc<Self>,
        tdata: &Arc<TxData>,
        dest: SocketAddr,
    ) -> Result<usize> {
        let (data, _guard) = self.begin_send(tdata)?;
        let result = self.io.send_to(&data, dest).await;
        if let Err(e) = &result {
            warn!("{} send {} to {} failed: {}", self.name, tdata.info(), dest, e);
        }
        result
    }

    /// Send in the background; `completion` runs once the write finishes.
    /// Render failures are returned here and `completion` is never called.
    pub fn send_with<F>(
        self: &Arc<Self>,
        tdata: Arc<TxData>,
        dest: SocketAddr,
        completion: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<usize>) + Send + 'static,
    {
        let (data, guard) = self.begin_send(&tdata)?;
        let transport = self.clone();
        tokio::spawn(async move {
            let result = transport.io.send_to(&data, dest).await;
            if let Err(e) = &result {
                warn!(
                    "{} send {} to {} failed: {}",
                    transport.name,
                    tdata.info(),
                    dest,
                    e
                );
            }
            tdata.end_send();
            completion(result);
            drop(guard);
        });
        Ok(())
    }

    /// Raw bytes from the socket. Frames are dispatched in arrival order.
    pub fn on_received(&self, data: &[u8], source: SocketAddr) {
        let mut rx = self.rx.lock();
        for frame in rx.feed(data) {
            match frame {
                Ok(data) => {
                    let source = self.source_info(source, data.len());
                    self.dispatcher.dispatch(RxFrame { data, source });
                }
                Err(e) => {
                    warn!("{} receive error {}", self.name, e);
                    self.dispatcher.report(e, self.source_info(source, 0));
                }
            }
        }
    }

    /// The stream peer went away.
    pub fn on_disconnected(self: &Arc<Self>) {
        info!("{} disconnected", self.name);
        match self.manager.upgrade() {
            Some(inner) => TransportManager { inner }.detach_transport(self),
            None => self.spawn_close(),
        }
    }

    fn source_info(&self, remote: SocketAddr, len: usize) -> SourceInfo {
        SourceInfo {
            transport: self.key.transport,
            local: self.local_addr,
            remote,
            received_at: SystemTime::now(),
            len,
        }
    }
}

/// Ends a send when dropped, also when the sending future is cancelled:
/// clears the pending flag and gives back both references.
struct SendGuard {
    transport: Arc<SipTransport>,
    tdata: Arc<TxData>,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.tdata.end_send();
        self.tdata.release();
        self.transport.release();
    }
}

struct Registry {
    transports: HashMap<TransportKey, Arc<SipTransport>>,
    factories: Vec<Arc<dyn TransportFactory>>,
    creating: HashMap<TransportKey, Arc<tokio::sync::Mutex<()>>>,
}

impl Registry {
    fn lookup(
        &self,
        transport: TransportType,
        remote: Option<SocketAddr>,
    ) -> Option<&Arc<SipTransport>> {
        let found = self.transports.get(&TransportKey::new(transport, remote));
        if found.is_none() && transport.is_datagram() {
            return self.transports.get(&TransportKey::any(transport));
        }
        found
    }

    fn factory(&self, transport: TransportType) -> Option<Arc<dyn TransportFactory>> {
        self.factories
            .iter()
            .find(|f| f.transport_type() == transport)
            .cloned()
    }

    fn remove(&mut self, transport: &Arc<SipTransport>) -> bool {
        match self.transports.get(&transport.key) {
            Some(t) if Arc::ptr_eq(t, transport) => {
                self.transports.remove(&transport.key);
                true
            }
            _ => false,
        }
    }
}

struct ManagerInner {
    config: TransportConfig,
    registry: Mutex<Registry>,
    dispatcher: Dispatcher,
    shutdown: AtomicBool,
}

#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

impl TransportManager {
    pub fn new(config: TransportConfig, sender: Sender<Incoming>) -> TransportManager {
        TransportManager {
            inner: Arc::new(ManagerInner {
                config,
                registry: Mutex::new(Registry {
                    transports: HashMap::new(),
                    factories: Vec::new(),
                    creating: HashMap::new(),
                }),
                dispatcher: Dispatcher::new(sender),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn register_factory(&self, factory: Arc<dyn TransportFactory>) -> Result<()> {
        let transport = factory.transport_type();
        let mut registry = self.inner.registry.lock();
        if registry.factory(transport).is_some() {
            Err(TransportError::DuplicateType(transport))?;
        }
        registry.factories.push(factory);
        info!("factory for {} registered", transport);
        Ok(())
    }

    pub fn unregister_factory(&self, transport: TransportType) -> Result<()> {
        let mut registry = self.inner.registry.lock();
        let before = registry.factories.len();
        registry
            .factories
            .retain(|f| f.transport_type() != transport);
        if registry.factories.len() == before {
            Err(TransportError::UnsupportedTransport(transport))?;
        }
        info!("factory for {} unregistered", transport);
        Ok(())
    }

    pub fn register_transport(&self, transport: &Arc<SipTransport>) -> Result<()> {
        let mut registry = self.inner.registry.lock();
        if self.is_shutdown() {
            Err(TransportError::Closed)?;
        }
        if registry.transports.contains_key(&transport.key) {
            Err(TransportError::AlreadyRegistered(transport.key.clone()))?;
        }
        let mut state = transport.state.lock();
        state.registered = true;
        registry
            .transports
            .insert(transport.key.clone(), transport.clone());
        if state.ref_count == 0 {
            transport.arm_idle_timer(&mut state);
        }
        info!("{} registered", transport.name);
        Ok(())
    }

    pub async fn unregister_transport(&self, transport: &Arc<SipTransport>) -> Result<()> {
        {
            let mut registry = self.inner.registry.lock();
            let mut state = transport.state.lock();
            if state.ref_count > 0 {
                Err(TransportError::StillReferenced(state.ref_count))?;
            }
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
            state.generation += 1;
            state.registered = false;
            registry.remove(transport);
        }
        info!("{} unregistered", transport.name);
        transport.close_io().await;
        Ok(())
    }

    /// Drop the index entry of a transport whose peer is gone. It closes when
    /// the last reference is released.
    pub fn detach_transport(&self, transport: &Arc<SipTransport>) {
        let close_now = {
            let mut registry = self.inner.registry.lock();
            let mut state = transport.state.lock();
            registry.remove(transport);
            state.registered = false;
            state.generation += 1;
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
            state.ref_count == 0
        };
        debug!("{} detached", transport.name);
        if close_now {
            transport.spawn_close();
        }
    }

    /// Registered transport for the key, without taking a reference.
    pub fn find_transport(
        &self,
        transport: TransportType,
        remote: Option<SocketAddr>,
    ) -> Option<Arc<SipTransport>> {
        self.inner
            .registry
            .lock()
            .lookup(transport, remote)
            .cloned()
    }

    pub fn transport_count(&self) -> usize {
        self.inner.registry.lock().transports.len()
    }

    pub fn dump_transports(&self) {
        let registry = self.inner.registry.lock();
        info!("{} transports registered", registry.transports.len());
        for transport in registry.transports.values() {
            info!(
                "  {} refcnt={}",
                transport.name,
                transport.state.lock().ref_count
            );
        }
    }

    fn lookup_and_ref(
        &self,
        transport: TransportType,
        remote: Option<SocketAddr>,
    ) -> Option<Arc<SipTransport>> {
        let registry = self.inner.registry.lock();
        let found = registry.lookup(transport, remote)?.clone();
        found.inc_ref_locked();
        Some(found)
    }

    /// Returns a transport for `remote` with one reference taken, creating it
    /// through the registered factory on a miss.
    pub async fn acquire_transport(
        &self,
        transport: TransportType,
        remote: Option<SocketAddr>,
    ) -> Result<Arc<SipTransport>> {
        if self.is_shutdown() {
            Err(TransportError::Closed)?;
        }
        if let Some(found) = self.lookup_and_ref(transport, remote) {
            debug!("acquired {} refcnt={}", found.name, found.ref_count());
            return Ok(found);
        }

        let lock_key = if transport.is_datagram() {
            TransportKey::any(transport)
        } else {
            TransportKey::new(transport, remote)
        };
        let (factory, creating) = {
            let mut registry = self.inner.registry.lock();
            let factory = registry
                .factory(transport)
                .ok_or(TransportError::UnsupportedTransport(transport))?;
            let creating = registry
                .creating
                .entry(lock_key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            (factory, creating)
        };

        let guard = creating.lock().await;
        let result = match self.lookup_and_ref(transport, remote) {
            Some(found) => Ok(found),
            None => {
                debug!("creating {} transport to {:?}", transport, remote);
                factory
                    .create_transport(self, remote)
                    .await
                    .map(|created| {
                        created.add_ref();
                        created
                    })
            }
        };
        drop(guard);
        self.finish_creating(&lock_key, &creating);
        result
    }

    fn finish_creating(&self, key: &TransportKey, creating: &Arc<tokio::sync::Mutex<()>>) {
        let mut registry = self.inner.registry.lock();
        let idle = match registry.creating.get(key) {
            // the map and this caller are the only holders
            Some(lock) => Arc::ptr_eq(lock, creating) && Arc::strong_count(creating) <= 2,
            None => false,
        };
        if idle {
            registry.creating.remove(key);
        }
    }

    /// Close every registered transport regardless of its references.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let transports: Vec<Arc<SipTransport>> = {
            let mut registry = self.inner.registry.lock();
            registry.creating.clear();
            registry.transports.drain().map(|(_, t)| t).collect()
        };
        info!("shutting down {} transports", transports.len());
        for transport in transports {
            {
                let mut state = transport.state.lock();
                state.ref_count = 0;
                state.registered = false;
                state.generation += 1;
                if let Some(timer) = state.idle_timer.take() {
                    timer.abort();
                }
            }
            transport.close_io().await;
        }
    }
}
