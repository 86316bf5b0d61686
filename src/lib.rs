//! YaPPuchino — server-side session and presence engine for a real-time
//! chat service.
//!
//! The core: admits and de-duplicates connections by name, owns the
//! authoritative user directory and its presence states, routes public
//! and private messages with at-least-once delivery, maintains capped
//! per-room histories, and drives automatic presence transitions on
//! inactivity. See `SPEC_FULL.md` for the full component breakdown.

pub mod admission;
pub mod conn;
pub mod config;
pub mod directory;
pub mod history;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod sweeper;

pub use config::Config;
pub use directory::{Directory, PresenceState, UserRecord};
