//! `pairgate connect`: the dashboard gate on the command line.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pairgate_core::config::{Config, paths};
use pairgate_core::frame::{FrameRegistry, FrameSpec, Visibility};
use pairgate_core::gate::{Access, RecoveryAction, RecoveryPrompt, ensure_connected};
use pairgate_core::handshake::{
    Handshake, HandshakeEvent, HandshakeEventTx, HandshakeSnapshot, HandshakeTiming,
    create_event_channel,
};
use pairgate_core::session::{SessionStore, mask_id};
use pairgate_core::simulation::{SimulatedFrame, SimulatedTransport};
use pairgate_core::transport::Transport;
use tokio::sync::{mpsc, oneshot};

/// Handshake over the simulated identity provider described by `config`.
pub fn build_handshake(
    config: &Config,
    registry: FrameRegistry,
    store: SessionStore,
    events: Option<HandshakeEventTx>,
) -> Handshake<SimulatedTransport> {
    let transport = Arc::new(SimulatedTransport::from_config(config));
    let builder = Handshake::builder(registry, transport, store)
        .timing(HandshakeTiming::from(&config.handshake));
    match events {
        Some(tx) => builder.events(tx).build(),
        None => builder.build(),
    }
}

struct PromptRequest {
    snapshot: HandshakeSnapshot,
    reply: oneshot::Sender<RecoveryAction>,
}

/// Forwards recovery questions to the task that owns the terminal.
struct ChannelPrompt {
    requests: mpsc::UnboundedSender<PromptRequest>,
}

impl RecoveryPrompt for ChannelPrompt {
    async fn choose(&mut self, snapshot: &HandshakeSnapshot) -> RecoveryAction {
        let (reply, answer) = oneshot::channel();
        let request = PromptRequest {
            snapshot: snapshot.clone(),
            reply,
        };
        if self.requests.send(request).is_err() {
            return RecoveryAction::Abandon;
        }
        answer.await.unwrap_or(RecoveryAction::Abandon)
    }
}

pub async fn run(config: &Config, force: bool) -> Result<()> {
    let store = SessionStore::open(&paths::session_path()).context("open session store")?;
    if force && store.disconnect()? {
        println!("Discarded stored session.");
    }

    let spec = FrameSpec::from_config(&config.frame)?;
    let registry = FrameRegistry::new();
    let frame = SimulatedFrame::from_config(config)?;
    let (events_tx, mut events) = create_event_channel();
    let handshake = build_handshake(config, registry.clone(), store, Some(events_tx));

    if handshake.transport().is_in_mock_mode() {
        println!("Mock mode: identity provider responses are simulated.");
    }
    let hidden = spec.geometry(Visibility::Hidden);
    tracing::debug!(
        src = %spec.src,
        sandbox = %spec.sandbox_attr(),
        width = hidden.width,
        height = hidden.height,
        "mounting authentication frame"
    );

    let mount_delay = Duration::from_millis(config.simulation.mount_delay_ms);
    let mounter = tokio::spawn({
        let registry = registry.clone();
        let frame = Arc::clone(&frame);
        async move {
            tokio::time::sleep(mount_delay).await;
            let guard = registry.mount(&frame);
            frame.start();
            guard
        }
    });

    let (requests_tx, mut requests) = mpsc::unbounded_channel();
    let gate = tokio::spawn(async move {
        let mut prompt = ChannelPrompt {
            requests: requests_tx,
        };
        ensure_connected(&handshake, &mut prompt).await
    });

    // Events are drained first so a failure line always precedes its prompt.
    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => render(&event),
            Some(request) = requests.recv() => {
                let action = ask(&request.snapshot).await?;
                let _ = request.reply.send(action);
            }
            else => break,
        }
    }

    let access = gate.await.context("handshake task failed")?;
    mounter.abort();

    match access {
        Access::Granted {
            pairing_id,
            resumed: true,
        } => {
            println!("Already connected (pairing id: {}).", mask_id(&pairing_id));
            Ok(())
        }
        Access::Granted { pairing_id, .. } => {
            println!("Connected (pairing id: {}).", mask_id(&pairing_id));
            Ok(())
        }
        Access::Denied(Some(err)) => anyhow::bail!("Not connected: {err}"),
        Access::Denied(None) => anyhow::bail!("Not connected: handshake was closed"),
    }
}

fn render(event: &HandshakeEvent) {
    match event {
        HandshakeEvent::Progress(snapshot) => {
            if let (Some(label), Some(percent)) = (snapshot.progress_label, snapshot.progress_percent)
            {
                println!("[{percent:>3}%] {label}");
            }
        }
        HandshakeEvent::Failed(snapshot) => {
            let reason = snapshot
                .last_error
                .as_ref()
                .map_or_else(|| "unknown error".to_string(), ToString::to_string);
            println!(
                "Connection failed (attempt {}/{}): {reason}",
                snapshot.attempt, snapshot.max_attempts
            );
        }
        HandshakeEvent::Connected { .. } => {}
    }
}

/// Asks on stdin how to recover. End of input abandons.
async fn ask(snapshot: &HandshakeSnapshot) -> Result<RecoveryAction> {
    loop {
        if snapshot.can_retry {
            print!("[r]etry / [f]orce retry / [q]uit: ");
        } else {
            print!("[f]orce retry / [q]uit: ");
        }
        io::stdout().flush()?;

        let line = tokio::task::spawn_blocking(|| -> io::Result<Option<String>> {
            let mut input = String::new();
            let read = io::stdin().lock().read_line(&mut input)?;
            Ok((read > 0).then_some(input))
        })
        .await
        .context("read recovery choice")??;

        let Some(line) = line else {
            println!();
            return Ok(RecoveryAction::Abandon);
        };

        match parse_choice(&line, snapshot.can_retry) {
            Some(action) => return Ok(action),
            None => println!("Please answer r, f or q."),
        }
    }
}

fn parse_choice(input: &str, can_retry: bool) -> Option<RecoveryAction> {
    match input.trim().to_ascii_lowercase().as_str() {
        "r" | "retry" if can_retry => Some(RecoveryAction::Retry),
        "f" | "force" => Some(RecoveryAction::ForceRetry),
        "q" | "quit" => Some(RecoveryAction::Abandon),
        _ => None,
    }
}
