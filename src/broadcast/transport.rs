use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::keys::SYNC_EVENT_KEY;
use crate::storage::LocalCache;

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    #[error("Send failed on {kind:?}: {message}")]
    SendFailed { kind: TransportKind, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transports in rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Hub shared across origins
    SharedRelay,
    /// Same-origin named channel
    SameOriginChannel,
    /// Change notification on a shared storage key
    StorageSignal,
}

/// A connected transport endpoint for one context.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn send(&self, message: &str) -> Result<(), BroadcastError>;

    /// Take the stream of messages from other contexts. Yields `None` once
    /// taken.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<String>>;
}

/// Probed at startup. Failing probes mean the host lacks the transport.
pub trait TransportProvider: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn probe(&self) -> Result<Box<dyn Transport>, BroadcastError>;
}

/// Fan-out of messages to every member except the sender.
#[derive(Default)]
struct Fanout {
    members: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_id: AtomicU64,
}

impl Fanout {
    fn join(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.members.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    fn leave(&self, id: u64) {
        self.members.lock().unwrap().remove(&id);
    }

    fn publish(&self, from: u64, message: &str) -> usize {
        let mut members = self.members.lock().unwrap();
        // Drop members whose receiver is gone.
        members.retain(|_, tx| !tx.is_closed());
        members
            .iter()
            .filter(|(id, _)| **id != from)
            .filter(|(_, tx)| tx.send(message.to_string()).is_ok())
            .count()
    }
}

struct FanoutPort {
    kind: TransportKind,
    fanout: Arc<Fanout>,
    id: u64,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    closed: Option<Arc<AtomicBool>>,
}

impl FanoutPort {
    fn open(kind: TransportKind, fanout: Arc<Fanout>, closed: Option<Arc<AtomicBool>>) -> Self {
        let (id, rx) = fanout.join();
        Self {
            kind,
            fanout,
            id,
            inbound: Mutex::new(Some(rx)),
            closed,
        }
    }
}

impl Transport for FanoutPort {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send(&self, message: &str) -> Result<(), BroadcastError> {
        if self.closed.as_ref().is_some_and(|c| c.load(Ordering::SeqCst)) {
            return Err(BroadcastError::SendFailed {
                kind: self.kind,
                message: "relay closed".to_string(),
            });
        }
        let delivered = self.fanout.publish(self.id, message);
        log::trace!("{:?} delivered to {} peers", self.kind, delivered);
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inbound.lock().unwrap().take()
    }
}

impl Drop for FanoutPort {
    fn drop(&mut self) {
        self.fanout.leave(self.id);
    }
}

/// Relay shared by contexts of every origin.
#[derive(Default)]
pub struct RelayHub {
    fanout: Arc<Fanout>,
    closed: Arc<AtomicBool>,
}

impl RelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Shut the hub down. Later probes fail and sends error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl TransportProvider for Arc<RelayHub> {
    fn kind(&self) -> TransportKind {
        TransportKind::SharedRelay
    }

    fn probe(&self) -> Result<Box<dyn Transport>, BroadcastError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BroadcastError::Unavailable("relay hub closed".to_string()));
        }
        Ok(Box::new(FanoutPort::open(
            TransportKind::SharedRelay,
            Arc::clone(&self.fanout),
            Some(Arc::clone(&self.closed)),
        )))
    }
}

/// Named channels, each visible only within one origin.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<(String, String), Arc<Fanout>>>,
}

impl ChannelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn channel(&self, origin: &str, name: &str) -> Arc<Fanout> {
        let mut channels = self.channels.lock().unwrap();
        Arc::clone(
            channels
                .entry((origin.to_string(), name.to_string()))
                .or_default(),
        )
    }
}

/// A context's handle on one same-origin channel.
pub struct SameOriginChannel {
    registry: Arc<ChannelRegistry>,
    origin: String,
    name: String,
}

impl SameOriginChannel {
    pub fn new(registry: &Arc<ChannelRegistry>, origin: &str, name: &str) -> Self {
        Self {
            registry: Arc::clone(registry),
            origin: origin.to_string(),
            name: name.to_string(),
        }
    }
}

impl TransportProvider for SameOriginChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::SameOriginChannel
    }

    fn probe(&self) -> Result<Box<dyn Transport>, BroadcastError> {
        if self.name.is_empty() {
            return Err(BroadcastError::Unavailable("empty channel name".to_string()));
        }
        Ok(Box::new(FanoutPort::open(
            TransportKind::SameOriginChannel,
            self.registry.channel(&self.origin, &self.name),
            None,
        )))
    }
}

/// Signals through a transient key in the shared cache.
pub struct StorageSignal {
    cache: LocalCache,
    window: Duration,
}

impl StorageSignal {
    pub fn new(cache: LocalCache, window: Duration) -> Self {
        Self { cache, window }
    }
}

impl TransportProvider for StorageSignal {
    fn kind(&self) -> TransportKind {
        TransportKind::StorageSignal
    }

    fn probe(&self) -> Result<Box<dyn Transport>, BroadcastError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BroadcastError::Unavailable(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = self.cache.watch();
        let pump = runtime.spawn(async move {
            while let Some(event) = watcher.next().await {
                if event.key != SYNC_EVENT_KEY {
                    continue;
                }
                if let Some(value) = event.new_value {
                    if tx.send(value).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Box::new(StorageSignalPort {
            cache: self.cache.clone(),
            window: self.window,
            runtime,
            inbound: Mutex::new(Some(rx)),
            pump,
        }))
    }
}

struct StorageSignalPort {
    cache: LocalCache,
    window: Duration,
    runtime: tokio::runtime::Handle,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    pump: tokio::task::JoinHandle<()>,
}

impl Transport for StorageSignalPort {
    fn kind(&self) -> TransportKind {
        TransportKind::StorageSignal
    }

    fn send(&self, message: &str) -> Result<(), BroadcastError> {
        self.cache
            .set(SYNC_EVENT_KEY, message)
            .map_err(|e| BroadcastError::SendFailed {
                kind: TransportKind::StorageSignal,
                message: e.to_string(),
            })?;

        let cache = self.cache.clone();
        let window = self.window;
        let sent = message.to_string();
        self.runtime.spawn(async move {
            tokio::time::sleep(window).await;
            // A newer signal may have replaced ours.
            if cache.get(SYNC_EVENT_KEY).as_deref() == Some(sent.as_str()) {
                cache.remove(SYNC_EVENT_KEY);
            }
        });
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inbound.lock().unwrap().take()
    }
}

impl Drop for StorageSignalPort {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OriginStorage;

    #[tokio::test]
    async fn test_relay_excludes_sender() {
        let hub = RelayHub::new();
        let a = hub.probe().unwrap();
        let b = hub.probe().unwrap();
        let mut a_in = a.take_inbound().unwrap();
        let mut b_in = b.take_inbound().unwrap();
        assert!(a.take_inbound().is_none());

        a.send("hello").unwrap();
        assert_eq!(b_in.recv().await.as_deref(), Some("hello"));
        assert!(a_in.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_relay_is_unavailable() {
        let hub = RelayHub::new();
        let port = hub.probe().unwrap();
        hub.close();
        assert!(hub.probe().is_err());
        assert!(port.send("x").is_err());
    }

    #[tokio::test]
    async fn test_channels_are_scoped_by_origin() {
        let registry = ChannelRegistry::new();
        let app_a = SameOriginChannel::new(&registry, "https://app", "bookshelf-sync")
            .probe()
            .unwrap();
        let app_b = SameOriginChannel::new(&registry, "https://app", "bookshelf-sync")
            .probe()
            .unwrap();
        let other = SameOriginChannel::new(&registry, "https://reader", "bookshelf-sync")
            .probe()
            .unwrap();
        let mut b_in = app_b.take_inbound().unwrap();
        let mut other_in = other.take_inbound().unwrap();

        app_a.send("ping").unwrap();
        assert_eq!(b_in.recv().await.as_deref(), Some("ping"));
        assert!(other_in.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_signal_is_transient() {
        let origin = OriginStorage::in_memory("https://app");
        let tab_a = origin.open_cache();
        let tab_b = origin.open_cache();
        let window = Duration::from_millis(1000);

        let a = StorageSignal::new(tab_a.clone(), window).probe().unwrap();
        let b = StorageSignal::new(tab_b, window).probe().unwrap();
        let mut b_in = b.take_inbound().unwrap();

        a.send("{\"n\":1}").unwrap();
        assert_eq!(b_in.recv().await.as_deref(), Some("{\"n\":1}"));
        assert!(tab_a.contains(SYNC_EVENT_KEY));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!tab_a.contains(SYNC_EVENT_KEY));
    }
}
