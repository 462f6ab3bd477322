//! Persistent client-recovery tracking core for an NFSv4 server-side
//! daemon.
//!
//! After a server restart, NFSv4 requires that only clients known to have
//! held locking/open state before the crash be allowed to reclaim it.
//! This crate is the on-disk tracking store and epoch-based grace/reclaim
//! state machine that makes that decision, in the style of the `nfsdcld`
//! daemon's sqlite backend.
//!
//! [`Core`] is the single entry point: open a directory, then call its
//! methods (`create`, `remove`, `check`, `grace_start`, `grace_done`,
//! `iterate_recovery`) in response to upcalls from whatever transport a
//! daemon shell wires in front of this crate. That transport, the
//! event-loop, daemonization, and CLI parsing are all out of scope here.

mod core;
mod engine;
mod error;
mod grace;
mod schema;
mod table;

pub use crate::core::Core;
pub use crate::error::{Error, Result};
pub use crate::schema::SCHEMA_VERSION;
