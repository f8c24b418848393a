use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::event::SyncEvent;
use super::transport::{Transport, TransportKind, TransportProvider};
use crate::subscription::Subscription;

const RECENT_EVENTS: usize = 64;

pub type SyncListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Coordinator status snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStatus {
    pub tab_id: String,
    pub origin: String,
    pub listener_count: usize,
    pub transports: Vec<TransportKind>,
    pub stopped: bool,
}

struct Dispatch {
    tab_id: String,
    listeners: Mutex<BTreeMap<String, SyncListener>>,
    recent: Mutex<VecDeque<String>>,
}

impl Dispatch {
    /// Returns false when the fingerprint was already seen.
    fn remember(&self, fingerprint: String) -> bool {
        let mut recent = self.recent.lock().unwrap();
        if recent.contains(&fingerprint) {
            return false;
        }
        if recent.len() == RECENT_EVENTS {
            recent.pop_front();
        }
        recent.push_back(fingerprint);
        true
    }

    fn handle(&self, kind: TransportKind, raw: &str) {
        let event: SyncEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping malformed sync event from {:?}: {}", kind, e);
                return;
            }
        };

        if event.tab_id == self.tab_id {
            return;
        }
        if !self.remember(event.fingerprint()) {
            log::trace!("Duplicate {:?} event via {:?}", event.event_type, kind);
            return;
        }

        let listeners: Vec<(String, SyncListener)> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(id, l)| (id.clone(), Arc::clone(l)))
            .collect();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                log::error!("Sync listener {} panicked", id);
            }
        }
    }
}

/// Fans change notifications out to other contexts over every available
/// transport, and delivers theirs to local listeners.
pub struct BroadcastCoordinator {
    dispatch: Arc<Dispatch>,
    origin: String,
    transports: Mutex<Vec<Box<dyn Transport>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastCoordinator {
    /// Probe `providers` in rank order and start one receive pump per live
    /// transport. Must be called from within a tokio runtime.
    pub fn start(
        tab_id: impl Into<String>,
        origin: impl Into<String>,
        mut providers: Vec<Box<dyn TransportProvider>>,
    ) -> Arc<Self> {
        let dispatch = Arc::new(Dispatch {
            tab_id: tab_id.into(),
            listeners: Mutex::new(BTreeMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS)),
        });

        providers.sort_by_key(|p| p.kind());
        let mut transports = Vec::new();
        let mut pumps = Vec::new();

        for provider in providers {
            let transport = match provider.probe() {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("Skipping {:?} transport: {}", provider.kind(), e);
                    continue;
                }
            };
            let kind = transport.kind();
            if let Some(mut inbound) = transport.take_inbound() {
                let dispatch = Arc::clone(&dispatch);
                pumps.push(tokio::spawn(async move {
                    while let Some(raw) = inbound.recv().await {
                        dispatch.handle(kind, &raw);
                    }
                    log::debug!("{:?} transport closed", kind);
                }));
            }
            transports.push(transport);
        }

        let origin = origin.into();
        log::info!(
            "Broadcast coordinator {} on {} using {:?}",
            dispatch.tab_id,
            origin,
            transports.iter().map(|t| t.kind()).collect::<Vec<_>>()
        );

        Arc::new(Self {
            dispatch,
            origin,
            transports: Mutex::new(transports),
            pumps: Mutex::new(pumps),
        })
    }

    /// `tab_<millis>_<9 random chars>`
    pub fn generate_tab_id() -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(char::from)
            .collect();
        format!("tab_{}_{}", Utc::now().timestamp_millis(), suffix.to_lowercase())
    }

    pub fn tab_id(&self) -> &str {
        &self.dispatch.tab_id
    }

    /// Stamp and send `event` on every live transport. Returns how many
    /// transports accepted it.
    pub fn broadcast_sync_event(&self, mut event: SyncEvent) -> usize {
        event.tab_id = self.dispatch.tab_id.clone();
        event.origin = Some(self.origin.clone());

        let raw = match serde_json::to_string(&event) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("Failed to encode sync event: {}", e);
                return 0;
            }
        };

        let transports = self.transports.lock().unwrap();
        let mut sent = 0;
        for transport in transports.iter() {
            match transport.send(&raw) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Broadcast via {:?} failed: {}", transport.kind(), e),
            }
        }
        log::debug!("Broadcast {:?} on {} transports", event.event_type, sent);
        sent
    }

    /// Register `listener` under `listener_id`, replacing any listener with
    /// the same id.
    pub fn subscribe<F>(&self, listener_id: &str, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.dispatch
            .listeners
            .lock()
            .unwrap()
            .insert(listener_id.to_string(), Arc::new(listener));

        let dispatch: Weak<Dispatch> = Arc::downgrade(&self.dispatch);
        let id = listener_id.to_string();
        Subscription::new(move || {
            if let Some(dispatch) = dispatch.upgrade() {
                dispatch.listeners.lock().unwrap().remove(&id);
            }
        })
    }

    pub fn status(&self) -> BroadcastStatus {
        let transports: Vec<TransportKind> =
            self.transports.lock().unwrap().iter().map(|t| t.kind()).collect();
        BroadcastStatus {
            tab_id: self.dispatch.tab_id.clone(),
            origin: self.origin.clone(),
            listener_count: self.dispatch.listeners.lock().unwrap().len(),
            stopped: self.pumps.lock().unwrap().is_empty() && transports.is_empty(),
            transports,
        }
    }

    /// Close every transport and drop all listeners.
    pub fn stop(&self) {
        for pump in self.pumps.lock().unwrap().drain(..) {
            pump.abort();
        }
        self.transports.lock().unwrap().clear();
        self.dispatch.listeners.lock().unwrap().clear();
        log::info!("Broadcast coordinator {} stopped", self.dispatch.tab_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::event::SyncEventType;
    use crate::broadcast::transport::{
        BroadcastError, ChannelRegistry, RelayHub, SameOriginChannel,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Missing;

    impl TransportProvider for Missing {
        fn kind(&self) -> TransportKind {
            TransportKind::SharedRelay
        }

        fn probe(&self) -> Result<Box<dyn Transport>, BroadcastError> {
            Err(BroadcastError::Unavailable("not in this host".to_string()))
        }
    }

    fn both(hub: &Arc<RelayHub>, registry: &Arc<ChannelRegistry>) -> Vec<Box<dyn TransportProvider>> {
        vec![
            Box::new(SameOriginChannel::new(registry, "https://app", "bookshelf-sync")),
            Box::new(Arc::clone(hub)),
        ]
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_generated_tab_id_shape() {
        let id = BroadcastCoordinator::generate_tab_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "tab");
        assert_eq!(parts[2].len(), 9);
    }

    #[tokio::test]
    async fn test_delivers_once_across_transports() {
        let hub = RelayHub::new();
        let registry = ChannelRegistry::new();
        let a = BroadcastCoordinator::start("tab_a", "https://app", both(&hub, &registry));
        let b = BroadcastCoordinator::start("tab_b", "https://app", both(&hub, &registry));
        assert_eq!(
            a.status().transports,
            vec![TransportKind::SharedRelay, TransportKind::SameOriginChannel]
        );

        let seen_by_a = Arc::new(AtomicUsize::new(0));
        let seen_by_b = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen_by_a);
        let _sa = a.subscribe("ui", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&seen_by_b);
        let _sb = b.subscribe("ui", move |event| {
            assert_eq!(event.tab_id, "tab_a");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let sent = a.broadcast_sync_event(SyncEvent::new(SyncEventType::BookCreated, "Physics"));
        assert_eq!(sent, 2);
        settle().await;

        assert_eq!(seen_by_b.load(Ordering::SeqCst), 1);
        assert_eq!(seen_by_a.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unavailable_transport_is_skipped() {
        let registry = ChannelRegistry::new();
        let providers: Vec<Box<dyn TransportProvider>> = vec![
            Box::new(Missing),
            Box::new(SameOriginChannel::new(&registry, "https://app", "bookshelf-sync")),
        ];
        let coordinator = BroadcastCoordinator::start("tab_a", "https://app", providers);
        assert_eq!(
            coordinator.status().transports,
            vec![TransportKind::SameOriginChannel]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        let hub = RelayHub::new();
        let a = BroadcastCoordinator::start("tab_a", "x", vec![Box::new(Arc::clone(&hub))]);
        let b = BroadcastCoordinator::start("tab_b", "y", vec![Box::new(Arc::clone(&hub))]);

        let calls = Arc::new(AtomicUsize::new(0));
        let _bad = b.subscribe("a-bad", |_| panic!("listener bug"));
        let counter = Arc::clone(&calls);
        let _good = b.subscribe("b-good", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.broadcast_sync_event(SyncEvent::new(SyncEventType::SyncComplete, ""));
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_template_updated_reaches_other_tab() {
        let hub = RelayHub::new();
        let registry = ChannelRegistry::new();
        let a = BroadcastCoordinator::start("tab_a", "https://app", both(&hub, &registry));
        let b = BroadcastCoordinator::start("tab_b", "https://app", both(&hub, &registry));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _sub = b.subscribe("qa_Physics_Mechanics", move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        a.broadcast_sync_event(SyncEvent::template_updated("b1", "Physics", "Mechanics", "QA"));
        settle().await;

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].event_type, SyncEventType::TemplateUpdated);
        assert_eq!(received[0].tab_id, "tab_a");
        assert_eq!(received[0].content_type.as_deref(), Some("QA"));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_stop() {
        let hub = RelayHub::new();
        let a = BroadcastCoordinator::start("tab_a", "x", vec![Box::new(Arc::clone(&hub))]);
        let b = BroadcastCoordinator::start("tab_b", "x", vec![Box::new(Arc::clone(&hub))]);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = b.subscribe("ui", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(b.status().listener_count, 1);
        sub.unsubscribe();
        assert_eq!(b.status().listener_count, 0);

        a.broadcast_sync_event(SyncEvent::new(SyncEventType::BookUpdated, "Physics"));
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        a.stop();
        assert!(a.status().stopped);
        assert_eq!(a.broadcast_sync_event(SyncEvent::new(SyncEventType::BookUpdated, "x")), 0);
    }
}
