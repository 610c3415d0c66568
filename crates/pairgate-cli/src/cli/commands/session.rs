//! Session command handlers.

use anyhow::{Context, Result};
use pairgate_core::config::{Config, paths};
use pairgate_core::frame::FrameRegistry;
use pairgate_core::session::{SessionStore, mask_id};
use pairgate_core::transport::Transport;

use super::connect::build_handshake;

fn open_store() -> Result<SessionStore> {
    SessionStore::open(&paths::session_path()).context("open session store")
}

pub fn status(config: &Config) -> Result<()> {
    let store = open_store()?;
    let session = store.snapshot();

    match session.session_id.as_deref() {
        Some(pairing_id) if session.authenticated => {
            println!("Connected (pairing id: {}).", mask_id(pairing_id));
            if let Some(connected_at) = session.connected_at {
                println!("Since: {}", connected_at.to_rfc3339());
            }
        }
        _ => println!("Not connected."),
    }

    let handshake = build_handshake(config, FrameRegistry::new(), store, None);
    if handshake.transport().is_in_mock_mode() {
        println!(
            "Mock mode: identity provider at {} is simulated.",
            config.frame.effective_base_url()?
        );
    }
    Ok(())
}

pub fn disconnect(config: &Config) -> Result<()> {
    let handshake = build_handshake(config, FrameRegistry::new(), open_store()?, None);
    if handshake.disconnect()? {
        println!("Disconnected.");
    } else {
        println!("No stored session.");
    }
    Ok(())
}
