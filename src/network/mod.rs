//! Connectivity monitoring
//!
//! `NetworkMonitor` follows a `ConnectivitySignal` and fans transitions out
//! to its own listeners. Repeated reports of the same state are dropped.
//! Without a signal the monitor assumes it is online.

pub mod signal;

pub use signal::{HttpProbeSignal, ManualSignal};

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Invoked with the new online state
pub type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// Platform source of online/offline transitions.
pub trait ConnectivitySignal: Send + Sync {
    /// Current state, if known
    fn current(&self) -> Option<bool>;
    fn subscribe(&self, callback: ConnectivityCallback) -> ListenerToken;
    fn unsubscribe(&self, token: ListenerToken);
}

/// Ordered callback registry shared by the signals and the monitor.
#[derive(Default)]
pub(crate) struct CallbackList {
    next_token: AtomicU64,
    callbacks: Mutex<Vec<(ListenerToken, ConnectivityCallback)>>,
}

impl CallbackList {
    pub(crate) fn add(&self, callback: ConnectivityCallback) -> ListenerToken {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.callbacks.lock().push((token, callback));
        token
    }

    pub(crate) fn remove(&self, token: ListenerToken) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(t, _)| *t != token);
        callbacks.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Call every callback in registration order. A panicking callback is
    /// logged and skipped.
    pub(crate) fn notify(&self, online: bool) {
        let snapshot: Vec<ConnectivityCallback> =
            self.callbacks.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(online))).is_err() {
                warn!("Connectivity listener panicked");
            }
        }
    }
}

pub struct NetworkMonitor {
    signal: Option<Arc<dyn ConnectivitySignal>>,
    online: AtomicBool,
    listeners: CallbackList,
    signal_token: Mutex<Option<ListenerToken>>,
}

impl NetworkMonitor {
    pub fn new(signal: Option<Arc<dyn ConnectivitySignal>>) -> Arc<Self> {
        Arc::new(Self {
            signal,
            online: AtomicBool::new(true),
            listeners: CallbackList::default(),
            signal_token: Mutex::new(None),
        })
    }

    /// Monitor without a platform signal; always online unless `report`ed otherwise.
    pub fn always_online() -> Arc<Self> {
        Self::new(None)
    }

    /// Subscribe to the platform signal. Calling `start` twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(signal) = &self.signal else {
            debug!("No connectivity signal, assuming online");
            return;
        };

        let mut token = self.signal_token.lock();
        if token.is_some() {
            return;
        }

        if let Some(online) = signal.current() {
            self.online.store(online, Ordering::SeqCst);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        *token = Some(signal.subscribe(Arc::new(move |online: bool| {
            if let Some(monitor) = weak.upgrade() {
                monitor.report(online);
            }
        })));
        info!(
            "Network monitor started ({})",
            if self.is_online() { "online" } else { "offline" }
        );
    }

    /// Release the platform subscription.
    pub fn stop(&self) {
        if let (Some(signal), Some(token)) = (&self.signal, self.signal_token.lock().take()) {
            signal.unsubscribe(token);
            info!("Network monitor stopped");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Feed a connectivity report. Listeners only hear about changes.
    pub fn report(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }
        info!(
            "Connectivity changed: {}",
            if online { "online" } else { "offline" }
        );
        self.listeners.notify(online);
    }

    pub fn subscribe(&self, callback: ConnectivityCallback) -> ListenerToken {
        self.listeners.add(callback)
    }

    pub fn unsubscribe(&self, token: ListenerToken) -> bool {
        self.listeners.remove(token)
    }
}
