//! Local stand-ins for the identity-provider frame and transport.
//!
//! Mock mode drives the real orchestrator against these, and the test suites
//! use them as doubles. Timers run on tokio time, so paused-clock tests see
//! exact delays.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::Result;
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::frame::{FrameHandle, FrameListener, FrameSignal, ListenerId, ReadyState};
use crate::transport::{Transport, TransportError, TransportStep};

/// How a simulated frame's document behaves after each navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadBehaviour {
    /// The document is complete as soon as navigation starts.
    AlreadyComplete,
    /// The load signal fires after the delay.
    LoadAfter(Duration),
    /// The error signal fires after the delay.
    FailAfter(Duration, String),
    /// No signal ever fires.
    Never,
}

type SharedListener = Arc<dyn Fn(&FrameSignal) + Send + Sync>;

struct FrameState {
    ready: Option<ReadyState>,
    listeners: Vec<(ListenerId, SharedListener)>,
    next_listener: u64,
    subscriptions_made: u32,
    navigation: u64,
}

pub struct SimulatedFrame {
    me: Weak<SimulatedFrame>,
    url: Url,
    behaviour: LoadBehaviour,
    state: Mutex<FrameState>,
    reloads: AtomicU32,
}

impl SimulatedFrame {
    pub fn new(url: Url, behaviour: LoadBehaviour) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: Weak::clone(me),
            url,
            behaviour,
            state: Mutex::new(FrameState {
                ready: Some(ReadyState::Loading),
                listeners: Vec::new(),
                next_listener: 0,
                subscriptions_made: 0,
                navigation: 0,
            }),
            reloads: AtomicU32::new(0),
        })
    }

    /// Frame configured from `[frame]` and `[simulation]`.
    ///
    /// # Errors
    /// Returns an error if the configured base URL is invalid.
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let delay = Duration::from_millis(config.simulation.load_delay_ms);
        let behaviour = match &config.simulation.load_error {
            Some(message) => LoadBehaviour::FailAfter(delay, message.clone()),
            None => LoadBehaviour::LoadAfter(delay),
        };
        Ok(Self::new(config.frame.effective_base_url()?, behaviour))
    }

    fn lock(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Begins the initial navigation.
    pub fn start(&self) {
        self.navigate();
    }

    fn navigate(&self) {
        let navigation = {
            let mut state = self.lock();
            state.navigation += 1;
            state.ready = Some(ReadyState::Loading);
            state.navigation
        };

        match &self.behaviour {
            LoadBehaviour::AlreadyComplete => {
                self.lock().ready = Some(ReadyState::Complete);
            }
            LoadBehaviour::LoadAfter(delay) => {
                self.schedule(navigation, *delay, FrameSignal::Load);
            }
            LoadBehaviour::FailAfter(delay, message) => {
                self.schedule(navigation, *delay, FrameSignal::Error(message.clone()));
            }
            LoadBehaviour::Never => {}
        }
    }

    fn schedule(&self, navigation: u64, delay: Duration, signal: FrameSignal) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("simulated frame started outside a tokio runtime; no signal scheduled");
            return;
        };
        let me = Weak::clone(&self.me);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(frame) = me.upgrade() {
                frame.settle(navigation, &signal);
            }
        });
    }

    /// Applies a scheduled signal unless a newer navigation superseded it.
    fn settle(&self, navigation: u64, signal: &FrameSignal) {
        {
            let mut state = self.lock();
            if state.navigation != navigation {
                return;
            }
            if *signal == FrameSignal::Load {
                state.ready = Some(ReadyState::Complete);
            }
        }
        self.fire(signal);
    }

    /// Delivers `signal` to every current listener.
    pub fn fire(&self, signal: &FrameSignal) {
        let listeners: Vec<SharedListener> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(signal);
        }
    }

    /// Overrides the reported ready state (`None` models a cross-origin document).
    pub fn set_ready_state(&self, ready: Option<ReadyState>) {
        self.lock().ready = ready;
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Total listeners ever added.
    pub fn subscriptions_made(&self) -> u32 {
        self.lock().subscriptions_made
    }

    pub fn reload_count(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl FrameHandle for SimulatedFrame {
    fn ready_state(&self) -> Option<ReadyState> {
        self.lock().ready
    }

    fn add_listener(&self, listener: FrameListener) -> ListenerId {
        let mut state = self.lock();
        state.next_listener += 1;
        state.subscriptions_made += 1;
        let id = ListenerId(state.next_listener);
        state.listeners.push((id, Arc::from(listener)));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.lock().listeners.retain(|(current, _)| *current != id);
    }

    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(url = %self.url, "simulated frame reloading");
        self.navigate();
    }
}

/// Transport answering locally after a fixed latency.
pub struct SimulatedTransport {
    latency: Duration,
    reject: Option<(TransportStep, String)>,
    pairing_id: Mutex<Option<String>>,
    calls: [AtomicU32; 3],
}

impl SimulatedTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            reject: None,
            pairing_id: Mutex::new(None),
            calls: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    /// Makes `step` reject with `message`.
    #[must_use]
    pub fn with_rejection(mut self, step: TransportStep, message: impl Into<String>) -> Self {
        self.reject = Some((step, message.into()));
        self
    }

    /// Transport configured from `[simulation]`.
    pub fn from_config(config: &Config) -> Self {
        let simulation = &config.simulation;
        let transport = Self::new(Duration::from_millis(simulation.latency_ms));
        match simulation.reject_step {
            Some(step) => {
                let message = simulation
                    .reject_message
                    .clone()
                    .unwrap_or_else(|| "rejected by simulation".to_string());
                transport.with_rejection(step, message)
            }
            None => transport,
        }
    }

    /// Number of times `step` was invoked.
    pub fn calls(&self, step: TransportStep) -> u32 {
        self.calls[Self::slot(step)].load(Ordering::SeqCst)
    }

    fn slot(step: TransportStep) -> usize {
        match step {
            TransportStep::Readiness => 0,
            TransportStep::Link => 1,
            TransportStep::Pairing => 2,
        }
    }

    fn pairing_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.pairing_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn answer(&self, step: TransportStep) -> Result<(), TransportError> {
        self.calls[Self::slot(step)].fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        match &self.reject {
            Some((rejected, message)) if *rejected == step => {
                Err(TransportError::new(message.clone()))
            }
            _ => Ok(()),
        }
    }
}

impl Transport for SimulatedTransport {
    async fn is_ready(&self) -> Result<(), TransportError> {
        self.answer(TransportStep::Readiness).await
    }

    async fn request_link(&self) -> Result<(), TransportError> {
        self.answer(TransportStep::Link).await
    }

    async fn get_user_pairing_id(&self) -> Result<(), TransportError> {
        self.answer(TransportStep::Pairing).await?;
        *self.pairing_slot() = Some(Uuid::new_v4().to_string());
        Ok(())
    }

    fn pairing_id(&self) -> Option<String> {
        self.pairing_slot().clone()
    }

    fn forget_pairing(&self) {
        self.pairing_slot().take();
    }

    fn is_in_mock_mode(&self) -> bool {
        true
    }
}
