use super::{CallbackList, ConnectivityCallback, ConnectivitySignal, ListenerToken};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

/// Signal driven by the application: tests, the CLI, or a platform bridge.
pub struct ManualSignal {
    online: AtomicBool,
    listeners: CallbackList,
}

impl ManualSignal {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            listeners: CallbackList::default(),
        }
    }

    /// Every call is forwarded; the monitor filters repeats.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        self.listeners.notify(online);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl ConnectivitySignal for ManualSignal {
    fn current(&self) -> Option<bool> {
        Some(self.online.load(Ordering::SeqCst))
    }

    fn subscribe(&self, callback: ConnectivityCallback) -> ListenerToken {
        self.listeners.add(callback)
    }

    fn unsubscribe(&self, token: ListenerToken) {
        self.listeners.remove(token);
    }
}

struct ProbeState {
    current: Mutex<Option<bool>>,
    listeners: CallbackList,
}

impl ProbeState {
    fn record(&self, online: bool) {
        let changed = {
            let mut current = self.current.lock();
            let changed = *current != Some(online);
            *current = Some(online);
            changed
        };
        if changed {
            self.listeners.notify(online);
        }
    }
}

/// Polls a health endpoint of the remote store.
///
/// Any 2xx answer within `timeout` counts as online.
pub struct HttpProbeSignal {
    client: reqwest::Client,
    url: String,
    every: Duration,
    timeout: Duration,
    state: Arc<ProbeState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpProbeSignal {
    pub fn new(url: impl Into<String>, every: Duration, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            every,
            timeout,
            state: Arc::new(ProbeState {
                current: Mutex::new(None),
                listeners: CallbackList::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Probe once and record the result.
    pub async fn probe(&self) -> bool {
        let online = probe_url(&self.client, &self.url, self.timeout).await;
        self.state.record(online);
        online
    }

    /// Start the background probe loop. Must be called inside a tokio runtime.
    pub fn spawn(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let client = self.client.clone();
        let url = self.url.clone();
        let timeout = self.timeout;
        let state = self.state.clone();
        let mut tick = interval(self.every);

        *task = Some(tokio::spawn(async move {
            loop {
                tick.tick().await;
                let online = probe_url(&client, &url, timeout).await;
                state.record(online);
            }
        }));
        debug!("Started connectivity probe of {}", self.url);
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for HttpProbeSignal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ConnectivitySignal for HttpProbeSignal {
    fn current(&self) -> Option<bool> {
        *self.state.current.lock()
    }

    fn subscribe(&self, callback: ConnectivityCallback) -> ListenerToken {
        self.state.listeners.add(callback)
    }

    fn unsubscribe(&self, token: ListenerToken) {
        self.state.listeners.remove(token);
    }
}

async fn probe_url(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            warn!("Connectivity probe of {} failed: {}", url, e);
            false
        }
    }
}
