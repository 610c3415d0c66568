//! Authentication handshake orchestrator.
//!
//! Drives one handshake session through mount detection, load completion and
//! the three transport calls, then records the pairing id in the
//! [`SessionStore`]. A [`Handshake`] is a cheap, clonable handle: one task awaits
//! a run while another may close or reset it.
//!
//! Every run captures a ticket. Closing bumps the session generation and
//! cancels the ticket's token, so the run's pending await is dropped and any
//! result that still lands is discarded.

mod error;
mod events;
mod state;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub use error::{ErrorKind, HandshakeError};
pub use events::{HandshakeEvent, HandshakeEventRx, HandshakeEventTx, create_event_channel};
pub use state::{HandshakeSnapshot, HandshakeState, MAX_ATTEMPTS};
use state::{HandshakeSession, RunTicket};

use crate::config::HandshakeConfig;
use crate::frame::{FrameRegistry, MountedFrame};
use crate::load_wait::LoadWaiter;
use crate::session::{SessionStore, mask_id};
use crate::transport::{Transport, TransportError, TransportStep};

/// Timing policy of a handshake run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeTiming {
    pub mount_poll_interval: Duration,
    pub mount_poll_attempts: u32,
    pub load_timeout: Duration,
    pub settle_delay: Duration,
    pub success_display_delay: Duration,
    /// Bound on each transport call; `None` leaves calls unbounded.
    pub transport_timeout: Option<Duration>,
}

impl Default for HandshakeTiming {
    fn default() -> Self {
        Self::from(&HandshakeConfig::default())
    }
}

impl From<&HandshakeConfig> for HandshakeTiming {
    fn from(config: &HandshakeConfig) -> Self {
        Self {
            mount_poll_interval: Duration::from_millis(config.mount_poll_interval_ms),
            mount_poll_attempts: config.mount_poll_attempts,
            load_timeout: Duration::from_secs(config.load_timeout_secs),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            success_display_delay: Duration::from_millis(config.success_display_delay_ms),
            transport_timeout: config.transport_timeout(),
        }
    }
}

/// How a call into the orchestrator ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Connected { pairing_id: String },
    Failed(HandshakeError),
    /// The run was closed or reset before it finished.
    Closed,
    /// Another run is in progress; nothing was started.
    AlreadyRunning,
}

/// Why a run stopped before producing a pairing id.
enum Interrupt {
    Failed(HandshakeError),
    Abandoned,
}

impl From<HandshakeError> for Interrupt {
    fn from(err: HandshakeError) -> Self {
        Interrupt::Failed(err)
    }
}

struct Shared<T> {
    registry: FrameRegistry,
    transport: Arc<T>,
    store: SessionStore,
    timing: HandshakeTiming,
    events: Option<HandshakeEventTx>,
    session: Mutex<HandshakeSession>,
}

pub struct HandshakeBuilder<T> {
    registry: FrameRegistry,
    transport: Arc<T>,
    store: SessionStore,
    timing: HandshakeTiming,
    events: Option<HandshakeEventTx>,
}

impl<T: Transport + 'static> HandshakeBuilder<T> {
    #[must_use]
    pub fn timing(mut self, timing: HandshakeTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Publishes [`HandshakeEvent`]s on `tx`.
    #[must_use]
    pub fn events(mut self, tx: HandshakeEventTx) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn build(self) -> Handshake<T> {
        Handshake {
            shared: Arc::new(Shared {
                registry: self.registry,
                transport: self.transport,
                store: self.store,
                timing: self.timing,
                events: self.events,
                session: Mutex::new(HandshakeSession::new()),
            }),
        }
    }
}

pub struct Handshake<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Handshake<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport + 'static> Handshake<T> {
    pub fn builder(
        registry: FrameRegistry,
        transport: Arc<T>,
        store: SessionStore,
    ) -> HandshakeBuilder<T> {
        HandshakeBuilder {
            registry,
            transport,
            store,
            timing: HandshakeTiming::default(),
            events: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandshakeSession> {
        self.shared
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> HandshakeSnapshot {
        self.lock().snapshot()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    pub fn store(&self) -> &SessionStore {
        &self.shared.store
    }

    /// Starts the handshake from `Idle` and runs it to an outcome.
    ///
    /// From `Failed` this reports the recorded error without starting a run;
    /// use [`Handshake::retry`] or [`Handshake::force_retry`] instead.
    pub async fn open(&self) -> HandshakeOutcome {
        let ticket = {
            let mut session = self.lock();
            if let Some(outcome) = Self::settled_outcome(&session) {
                return outcome;
            }
            session.begin_run()
        };
        tracing::debug!("handshake opened");
        self.run(ticket).await
    }

    /// Soft retry: the next attempt, keeping a loaded frame that is still mounted.
    ///
    /// At the last attempt the session instead becomes permanently failed with
    /// [`HandshakeError::RetryExhausted`].
    pub async fn retry(&self) -> HandshakeOutcome {
        match self.retry_ticket() {
            Ok(ticket) => self.run(ticket).await,
            Err(outcome) => outcome,
        }
    }

    /// Starts the next soft-retry run, or says why none was started.
    fn retry_ticket(&self) -> Result<RunTicket, HandshakeOutcome> {
        let mut session = self.lock();
        match session.state {
            HandshakeState::Failed => {}
            HandshakeState::Idle => {
                tracing::debug!("soft retry from idle opens a new run");
                return Ok(session.begin_run());
            }
            _ => {
                return Err(
                    Self::settled_outcome(&session).unwrap_or(HandshakeOutcome::AlreadyRunning)
                );
            }
        }

        if session.retry_exhausted {
            return Err(HandshakeOutcome::Failed(
                session
                    .last_error
                    .clone()
                    .unwrap_or(HandshakeError::RetryExhausted { max: MAX_ATTEMPTS }),
            ));
        }

        if session.attempt >= MAX_ATTEMPTS {
            let err = HandshakeError::RetryExhausted { max: MAX_ATTEMPTS };
            session.retry_exhausted = true;
            session.fail(err.clone());
            let snapshot = session.snapshot();
            drop(session);
            tracing::warn!(max = MAX_ATTEMPTS, "soft retry refused: attempts exhausted");
            self.publish(HandshakeEvent::Failed(snapshot));
            return Err(HandshakeOutcome::Failed(err));
        }

        session.attempt += 1;
        tracing::debug!(attempt = session.attempt, "soft retry");
        Ok(session.begin_run())
    }

    /// Hard retry: back to attempt 1 with a forced frame reload.
    ///
    /// Also abandons a run that is still in progress.
    pub async fn force_retry(&self) -> HandshakeOutcome {
        let ticket = {
            let mut session = self.lock();
            if let Some(pairing_id) = Self::connected(&session) {
                return HandshakeOutcome::Connected { pairing_id };
            }
            session.attempt = 1;
            session.last_error = None;
            session.frame_loaded = false;
            session.frame_mount = None;
            session.retry_exhausted = false;
            session.begin_run()
        };

        match self.shared.registry.get_frame() {
            Some(frame) => frame.reload(),
            None => tracing::debug!("hard retry without a mounted frame"),
        }
        tracing::debug!("hard retry");
        self.run(ticket).await
    }

    /// Dismisses the handshake: a running or failed session goes back to `Idle`.
    ///
    /// Returns whether anything was closed. No outcome event is published for
    /// the abandoned run.
    pub fn close(&self) -> bool {
        let mut session = self.lock();
        if session.state.is_running() || session.state == HandshakeState::Failed {
            session.clear();
            tracing::debug!("handshake closed");
            true
        } else {
            false
        }
    }

    /// Replaces the session with a fresh one, whatever its state.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Forgets the pairing everywhere: transport cache, orchestrator and store.
    ///
    /// Returns whether a session was stored.
    ///
    /// # Errors
    /// Returns an error if the persisted session cannot be removed.
    pub fn disconnect(&self) -> anyhow::Result<bool> {
        self.shared.transport.forget_pairing();
        self.reset();
        self.shared.store.disconnect()
    }

    fn connected(session: &HandshakeSession) -> Option<String> {
        if session.state == HandshakeState::Success {
            session.pairing_id.clone()
        } else {
            None
        }
    }

    /// Outcome for a session that must not start a new run, if any.
    fn settled_outcome(session: &HandshakeSession) -> Option<HandshakeOutcome> {
        if let Some(pairing_id) = Self::connected(session) {
            return Some(HandshakeOutcome::Connected { pairing_id });
        }
        match session.state {
            HandshakeState::Idle => None,
            HandshakeState::Failed => Some(HandshakeOutcome::Failed(
                session
                    .last_error
                    .clone()
                    .unwrap_or(HandshakeError::FrameNotFound),
            )),
            _ => Some(HandshakeOutcome::AlreadyRunning),
        }
    }

    fn publish(&self, event: HandshakeEvent) {
        if let Some(tx) = &self.shared.events {
            let _ = tx.send(event);
        }
    }

    async fn run(&self, ticket: RunTicket) -> HandshakeOutcome {
        self.publish(HandshakeEvent::Progress(self.snapshot()));

        let result = tokio::select! {
            biased;
            () = ticket.cancel.cancelled() => Err(Interrupt::Abandoned),
            result = self.steps(&ticket) => result,
        };

        match result {
            Ok(pairing_id) => self.complete(&ticket, pairing_id).await,
            Err(Interrupt::Failed(err)) => self.fail(&ticket, err),
            Err(Interrupt::Abandoned) => {
                tracing::debug!("handshake run abandoned");
                HandshakeOutcome::Closed
            }
        }
    }

    async fn steps(&self, ticket: &RunTicket) -> Result<String, Interrupt> {
        let transport = &self.shared.transport;

        let mounted = self.await_mount().await?;
        self.advance(ticket, HandshakeState::LoadWait)?;
        if self.needs_load(ticket, &mounted)? {
            self.load_waiter().wait().await?;
            self.mark_loaded(ticket, &mounted)?;
        } else {
            tracing::debug!(mount = %mounted.id, "frame already loaded, skipping load wait");
        }

        self.advance(ticket, HandshakeState::ReadinessCheck)?;
        self.call(TransportStep::Readiness, transport.is_ready())
            .await?;

        self.advance(ticket, HandshakeState::LinkRequest)?;
        self.call(TransportStep::Link, transport.request_link())
            .await?;

        self.advance(ticket, HandshakeState::PairingFetch)?;
        self.call(TransportStep::Pairing, transport.get_user_pairing_id())
            .await?;

        transport
            .pairing_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                Interrupt::Failed(HandshakeError::rejected(
                    TransportStep::Pairing,
                    TransportError::new("no pairing identifier returned"),
                ))
            })
    }

    /// Polls the registry until a frame is mounted.
    async fn await_mount(&self) -> Result<MountedFrame, HandshakeError> {
        let timing = &self.shared.timing;
        let mut polls = 0;
        loop {
            if let Some(mounted) = self.shared.registry.current() {
                tracing::debug!(mount = %mounted.id, polls, "frame observed");
                return Ok(mounted);
            }
            if polls >= timing.mount_poll_attempts {
                return Err(HandshakeError::FrameMountTimeout { polls });
            }
            polls += 1;
            tokio::time::sleep(timing.mount_poll_interval).await;
        }
    }

    fn load_waiter(&self) -> LoadWaiter {
        let timing = &self.shared.timing;
        LoadWaiter::with_timing(
            self.shared.registry.clone(),
            timing.load_timeout,
            timing.settle_delay,
        )
    }

    /// Whether `mounted` still has to be waited on.
    fn needs_load(&self, ticket: &RunTicket, mounted: &MountedFrame) -> Result<bool, Interrupt> {
        let mut session = self.lock();
        if !session.is_current(ticket) {
            return Err(Interrupt::Abandoned);
        }
        if session.frame_loaded && session.frame_mount == Some(mounted.id) {
            return Ok(false);
        }
        session.frame_loaded = false;
        session.frame_mount = Some(mounted.id);
        Ok(true)
    }

    fn mark_loaded(&self, ticket: &RunTicket, mounted: &MountedFrame) -> Result<(), Interrupt> {
        let mut session = self.lock();
        if !session.is_current(ticket) {
            return Err(Interrupt::Abandoned);
        }
        if session.frame_mount == Some(mounted.id) {
            session.frame_loaded = true;
        }
        Ok(())
    }

    /// Moves the session to `state` unless the run was superseded.
    fn advance(&self, ticket: &RunTicket, state: HandshakeState) -> Result<(), Interrupt> {
        let snapshot = {
            let mut session = self.lock();
            if !session.is_current(ticket) {
                return Err(Interrupt::Abandoned);
            }
            session.enter(state);
            session.snapshot()
        };
        tracing::debug!(?state, attempt = snapshot.attempt, "handshake state changed");
        self.publish(HandshakeEvent::Progress(snapshot));
        Ok(())
    }

    async fn call<F>(&self, step: TransportStep, call: F) -> Result<(), HandshakeError>
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        let result = match self.shared.timing.transport_timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| HandshakeError::TransportTimeout { step, after })?,
            None => call.await,
        };
        result.map_err(|source| HandshakeError::rejected(step, source))
    }

    async fn complete(&self, ticket: &RunTicket, pairing_id: String) -> HandshakeOutcome {
        let snapshot = {
            let mut session = self.lock();
            if !session.is_current(ticket) {
                return HandshakeOutcome::Closed;
            }
            session.succeed(pairing_id.clone());
            session.snapshot()
        };

        if let Err(e) = self.shared.store.establish(&pairing_id) {
            tracing::warn!("Failed to persist session: {e:#}");
        }
        tracing::info!(
            pairing_id = %mask_id(&pairing_id),
            attempt = snapshot.attempt,
            "handshake succeeded"
        );
        self.publish(HandshakeEvent::Progress(snapshot));

        tokio::time::sleep(self.shared.timing.success_display_delay).await;
        self.publish(HandshakeEvent::Connected {
            pairing_id: pairing_id.clone(),
        });
        HandshakeOutcome::Connected { pairing_id }
    }

    fn fail(&self, ticket: &RunTicket, err: HandshakeError) -> HandshakeOutcome {
        let snapshot = {
            let mut session = self.lock();
            if !session.is_current(ticket) {
                return HandshakeOutcome::Closed;
            }
            session.fail(err.clone());
            session.snapshot()
        };
        tracing::warn!(
            kind = %err.kind(),
            attempt = snapshot.attempt,
            "handshake failed: {err}"
        );
        self.publish(HandshakeEvent::Failed(snapshot));
        HandshakeOutcome::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Notify;
    use tokio::time::Instant;
    use url::Url;

    use super::*;
    use crate::frame::MountGuard;
    use crate::simulation::{LoadBehaviour, SimulatedFrame, SimulatedTransport};

    fn frame_url() -> Url {
        Url::parse("https://id.example.test/").unwrap()
    }

    fn handshake(
        registry: &FrameRegistry,
        transport: SimulatedTransport,
    ) -> (Handshake<SimulatedTransport>, SessionStore) {
        let store = SessionStore::in_memory();
        let handshake =
            Handshake::builder(registry.clone(), Arc::new(transport), store.clone()).build();
        (handshake, store)
    }

    fn mounted_frame(
        registry: &FrameRegistry,
        behaviour: LoadBehaviour,
    ) -> (Arc<SimulatedFrame>, MountGuard) {
        let frame = SimulatedFrame::new(frame_url(), behaviour);
        let guard = registry.mount(&frame);
        frame.start();
        (frame, guard)
    }

    async fn fail_with_link_rejection(handshake: &Handshake<SimulatedTransport>) {
        let outcome = handshake.open().await;
        assert!(matches!(outcome, HandshakeOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_handshake_after_late_mount() {
        let registry = FrameRegistry::new();
        let (tx, mut rx) = create_event_channel();
        let store = SessionStore::in_memory();
        let handshake = Handshake::builder(
            registry.clone(),
            Arc::new(SimulatedTransport::new(Duration::from_millis(100))),
            store.clone(),
        )
        .events(tx)
        .build();

        // Mounted between the first and second poll; navigation starts once
        // the waiter listens, so the load lands at 500 ms.
        let frame = SimulatedFrame::new(frame_url(), LoadBehaviour::LoadAfter(Duration::ZERO));
        let mount_registry = registry.clone();
        let mount_frame = Arc::clone(&frame);
        let mounter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(450)).await;
            let guard = mount_registry.mount(&mount_frame);
            let mut states = Vec::new();
            while let Some(event) = rx.recv().await {
                if let HandshakeEvent::Progress(snapshot) = event {
                    states.push(snapshot.state);
                    if snapshot.state == HandshakeState::LoadWait {
                        break;
                    }
                }
            }
            mount_frame.start();
            (guard, states, rx)
        });

        let started = Instant::now();
        let outcome = handshake.open().await;
        let elapsed = started.elapsed();
        let (_guard, mut states, mut rx) = mounter.await.unwrap();

        let HandshakeOutcome::Connected { pairing_id } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(!pairing_id.is_empty());
        assert!(store.is_connected());
        assert_eq!(store.user_pairing_id(), Some(pairing_id.clone()));
        // 500 ms mount + 2 s settle + 3 x 100 ms calls + 500 ms success display.
        assert!(elapsed >= Duration::from_millis(3_300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3_320), "{elapsed:?}");
        assert_eq!(frame.subscriptions_made(), 1);

        let snapshot = handshake.snapshot();
        assert_eq!(snapshot.state, HandshakeState::Success);
        assert_eq!(snapshot.progress_percent, Some(100));
        assert!(snapshot.frame_loaded);

        let mut connected = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                HandshakeEvent::Progress(snapshot) => states.push(snapshot.state),
                HandshakeEvent::Connected { pairing_id } => connected = Some(pairing_id),
                HandshakeEvent::Failed(snapshot) => panic!("unexpected failure {snapshot:?}"),
            }
        }
        states.dedup();
        assert_eq!(
            states,
            vec![
                HandshakeState::MountWait,
                HandshakeState::LoadWait,
                HandshakeState::ReadinessCheck,
                HandshakeState::LinkRequest,
                HandshakeState::PairingFetch,
                HandshakeState::Success,
            ]
        );
        assert_eq!(connected, Some(pairing_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_frame_times_out_after_polls() {
        let registry = FrameRegistry::new();
        let (handshake, store) = handshake(&registry, SimulatedTransport::new(Duration::ZERO));

        let started = Instant::now();
        let outcome = handshake.open().await;

        assert_eq!(
            outcome,
            HandshakeOutcome::Failed(HandshakeError::FrameMountTimeout { polls: 40 })
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(20_050), "{elapsed:?}");
        let snapshot = handshake.snapshot();
        assert_eq!(snapshot.state, HandshakeState::Failed);
        assert_eq!(snapshot.attempt, 1);
        assert!(snapshot.can_retry);
        assert!(!store.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_rejection_offers_both_retries() {
        let registry = FrameRegistry::new();
        let (_frame, _guard) = mounted_frame(&registry, LoadBehaviour::AlreadyComplete);
        let (handshake, store) = handshake(
            &registry,
            SimulatedTransport::new(Duration::from_millis(100))
                .with_rejection(TransportStep::Link, "denied"),
        );

        let outcome = handshake.open().await;

        let HandshakeOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(err.kind(), ErrorKind::TransportRejection);
        assert!(err.to_string().contains("denied"));

        let snapshot = handshake.snapshot();
        assert_eq!(snapshot.attempt, 1);
        assert_eq!(snapshot.max_attempts, 4);
        assert!(snapshot.can_retry);
        assert!(snapshot.can_force_retry);
        assert_eq!(snapshot.last_error, Some(err));
        assert_eq!(handshake.transport().calls(TransportStep::Pairing), 0);
        assert!(!store.is_connected());
    }

    struct GatedTransport {
        gate: Notify,
        link_calls: AtomicU32,
    }

    impl Transport for GatedTransport {
        async fn is_ready(&self) -> Result<(), TransportError> {
            self.gate.notified().await;
            Ok(())
        }

        async fn request_link(&self) -> Result<(), TransportError> {
            self.link_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_user_pairing_id(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn pairing_id(&self) -> Option<String> {
            Some("pair-0123456789abcdef".to_string())
        }

        fn forget_pairing(&self) {}

        fn is_in_mock_mode(&self) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_readiness_check_discards_result() {
        let registry = FrameRegistry::new();
        let (_frame, _guard) = mounted_frame(&registry, LoadBehaviour::AlreadyComplete);
        let transport = Arc::new(GatedTransport {
            gate: Notify::new(),
            link_calls: AtomicU32::new(0),
        });
        let store = SessionStore::in_memory();
        let handshake =
            Handshake::builder(registry.clone(), Arc::clone(&transport), store.clone()).build();

        let run = tokio::spawn({
            let handshake = handshake.clone();
            async move { handshake.open().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handshake.snapshot().state, HandshakeState::ReadinessCheck);

        assert!(handshake.close());
        transport.gate.notify_one();

        assert_eq!(run.await.unwrap(), HandshakeOutcome::Closed);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let snapshot = handshake.snapshot();
        assert_eq!(snapshot.state, HandshakeState::Idle);
        assert_eq!(snapshot.progress_label, None);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(transport.link_calls.load(Ordering::SeqCst), 0);
        assert!(!store.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_retries_exhaust_after_max_attempts() {
        let registry = FrameRegistry::new();
        let (_frame, _guard) = mounted_frame(&registry, LoadBehaviour::AlreadyComplete);
        let (handshake, _store) = handshake(
            &registry,
            SimulatedTransport::new(Duration::ZERO).with_rejection(TransportStep::Link, "denied"),
        );

        fail_with_link_rejection(&handshake).await;
        for expected in 2..=MAX_ATTEMPTS {
            let outcome = handshake.retry().await;
            assert!(matches!(outcome, HandshakeOutcome::Failed(_)));
            let snapshot = handshake.snapshot();
            assert_eq!(snapshot.attempt, expected);
            assert!(snapshot.can_retry);
        }

        let outcome = handshake.retry().await;
        assert_eq!(
            outcome,
            HandshakeOutcome::Failed(HandshakeError::RetryExhausted { max: MAX_ATTEMPTS })
        );
        let snapshot = handshake.snapshot();
        assert_eq!(snapshot.state, HandshakeState::Failed);
        assert_eq!(snapshot.attempt, MAX_ATTEMPTS);
        assert!(!snapshot.can_retry);
        assert!(snapshot.can_force_retry);
        assert!(
            snapshot
                .last_error
                .unwrap()
                .to_string()
                .contains("maximum attempts reached")
        );

        // Further soft retries change nothing.
        handshake.retry().await;
        assert_eq!(handshake.snapshot().attempt, MAX_ATTEMPTS);
        assert_eq!(handshake.transport().calls(TransportStep::Link), MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_retry_runs_on_spawned_task() {
        let registry = FrameRegistry::new();
        let (_frame, _guard) = mounted_frame(&registry, LoadBehaviour::AlreadyComplete);
        let (handshake, _store) = handshake(
            &registry,
            SimulatedTransport::new(Duration::ZERO).with_rejection(TransportStep::Link, "denied"),
        );

        // From Idle a soft retry opens the first attempt.
        let first = tokio::spawn({
            let handshake = handshake.clone();
            async move { handshake.retry().await }
        });
        assert!(matches!(first.await.unwrap(), HandshakeOutcome::Failed(_)));
        assert_eq!(handshake.snapshot().attempt, 1);

        let second = tokio::spawn({
            let handshake = handshake.clone();
            async move { handshake.retry().await }
        });
        assert!(matches!(second.await.unwrap(), HandshakeOutcome::Failed(_)));
        assert_eq!(handshake.snapshot().attempt, 2);
        assert_eq!(handshake.transport().calls(TransportStep::Link), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_retry_keeps_loaded_frame() {
        let registry = FrameRegistry::new();
        let (frame, _guard) = mounted_frame(
            &registry,
            LoadBehaviour::LoadAfter(Duration::from_millis(100)),
        );
        let (handshake, _store) = handshake(
            &registry,
            SimulatedTransport::new(Duration::ZERO).with_rejection(TransportStep::Link, "denied"),
        );

        // Keep the document "loading" so only the flag can skip the wait.
        fail_with_link_rejection(&handshake).await;
        assert!(handshake.snapshot().frame_loaded);
        frame.set_ready_state(Some(crate::frame::ReadyState::Loading));

        let started = Instant::now();
        handshake.retry().await;
        assert!(started.elapsed() < Duration::from_millis(10));
        assert_eq!(frame.subscriptions_made(), 1);
        assert!(handshake.snapshot().frame_loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_retry_waits_for_new_frame_instance() {
        let registry = FrameRegistry::new();
        let (_old, old_guard) = mounted_frame(&registry, LoadBehaviour::AlreadyComplete);
        let (handshake, _store) = handshake(
            &registry,
            SimulatedTransport::new(Duration::ZERO).with_rejection(TransportStep::Link, "denied"),
        );
        fail_with_link_rejection(&handshake).await;
        drop(old_guard);

        let (new, _new_guard) = mounted_frame(
            &registry,
            LoadBehaviour::LoadAfter(Duration::from_millis(100)),
        );
        let started = Instant::now();
        handshake.retry().await;

        assert!(started.elapsed() >= Duration::from_millis(2_100));
        assert_eq!(new.subscriptions_made(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_retry_resets_attempt_and_reloads_frame() {
        let registry = FrameRegistry::new();
        let (frame, _guard) = mounted_frame(
            &registry,
            LoadBehaviour::LoadAfter(Duration::from_millis(100)),
        );
        let (handshake, _store) = handshake(
            &registry,
            SimulatedTransport::new(Duration::ZERO).with_rejection(TransportStep::Link, "denied"),
        );

        fail_with_link_rejection(&handshake).await;
        handshake.retry().await;
        assert_eq!(handshake.snapshot().attempt, 2);

        let run = tokio::spawn({
            let handshake = handshake.clone();
            async move { handshake.force_retry().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = handshake.snapshot();
        assert_eq!(snapshot.attempt, 1);
        assert!(!snapshot.frame_loaded);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(snapshot.state, HandshakeState::LoadWait);
        assert_eq!(frame.reload_count(), 1);

        assert!(matches!(run.await.unwrap(), HandshakeOutcome::Failed(_)));
        assert_eq!(frame.subscriptions_made(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_retry_recovers_after_exhaustion() {
        let registry = FrameRegistry::new();
        let (_frame, _guard) = mounted_frame(&registry, LoadBehaviour::AlreadyComplete);
        let (handshake, _store) = handshake(
            &registry,
            SimulatedTransport::new(Duration::ZERO).with_rejection(TransportStep::Link, "denied"),
        );

        fail_with_link_rejection(&handshake).await;
        for _ in 0..MAX_ATTEMPTS {
            handshake.retry().await;
        }
        assert!(!handshake.snapshot().can_retry);

        handshake.force_retry().await;
        let snapshot = handshake.snapshot();
        assert_eq!(snapshot.attempt, 1);
        assert!(snapshot.can_retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_timeout_when_configured() {
        let registry = FrameRegistry::new();
        let (_frame, _guard) = mounted_frame(&registry, LoadBehaviour::AlreadyComplete);
        let store = SessionStore::in_memory();
        let handshake = Handshake::builder(
            registry.clone(),
            Arc::new(SimulatedTransport::new(Duration::from_secs(60))),
            store,
        )
        .timing(HandshakeTiming {
            transport_timeout: Some(Duration::from_secs(5)),
            ..HandshakeTiming::default()
        })
        .build();

        let outcome = handshake.open().await;
        assert_eq!(
            outcome,
            HandshakeOutcome::Failed(HandshakeError::TransportTimeout {
                step: TransportStep::Readiness,
                after: Duration::from_secs(5),
            })
        );
    }

    struct EmptyPairingTransport;

    impl Transport for EmptyPairingTransport {
        async fn is_ready(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn request_link(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn get_user_pairing_id(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn pairing_id(&self) -> Option<String> {
            Some(String::new())
        }

        fn forget_pairing(&self) {}

        fn is_in_mock_mode(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pairing_id_is_a_rejection() {
        let registry = FrameRegistry::new();
        let (_frame, _guard) = mounted_frame(&registry, LoadBehaviour::AlreadyComplete);
        let store = SessionStore::in_memory();
        let handshake =
            Handshake::builder(registry.clone(), Arc::new(EmptyPairingTransport), store.clone())
                .build();

        let HandshakeOutcome::Failed(err) = handshake.open().await else {
            panic!("expected failure");
        };
        assert_eq!(
            err.to_string(),
            "pairing fetch failed: no pairing identifier returned"
        );
        assert!(!store.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_open_does_not_start_concurrent_run() {
        let registry = FrameRegistry::new();
        let (handshake, _store) = handshake(&registry, SimulatedTransport::new(Duration::ZERO));

        let run = tokio::spawn({
            let handshake = handshake.clone();
            async move { handshake.open().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(handshake.open().await, HandshakeOutcome::AlreadyRunning);
        assert!(handshake.close());
        assert_eq!(run.await.unwrap(), HandshakeOutcome::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_final_and_disconnect_clears_everything() {
        let registry = FrameRegistry::new();
        let (_frame, _guard) = mounted_frame(&registry, LoadBehaviour::AlreadyComplete);
        let (handshake, store) = handshake(&registry, SimulatedTransport::new(Duration::ZERO));

        let HandshakeOutcome::Connected { pairing_id } = handshake.open().await else {
            panic!("expected success");
        };
        assert!(!handshake.close());
        assert_eq!(
            handshake.retry().await,
            HandshakeOutcome::Connected {
                pairing_id: pairing_id.clone()
            }
        );
        assert_eq!(handshake.snapshot().state, HandshakeState::Success);

        assert!(handshake.disconnect().unwrap());
        assert!(!store.is_connected());
        assert_eq!(handshake.transport().pairing_id(), None);
        assert_eq!(handshake.snapshot().state, HandshakeState::Idle);
    }
}
