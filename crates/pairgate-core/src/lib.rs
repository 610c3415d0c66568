//! Core PairGate library (frame registry, handshake orchestration, session store, config).

pub mod config;
pub mod frame;
pub mod gate;
pub mod handshake;
pub mod load_wait;
pub mod logging;
pub mod session;
pub mod simulation;
pub mod transport;
