//! Power-fail-safe flash storage core for a hardware wallet's root
//! secrets, PIN/U2F counters and session cache.
//!
//! See the module-level docs of each component for the part of the
//! design it covers: [`flash`] (region map and the `FlashDevice`
//! capability), [`record`] (on-flash record codec), [`commit`] (merge
//! policy and atomic sector rewrite), [`migrate`] (schema migration),
//! [`counters`] (PIN-fail/U2F bit-clearing counters), [`session`]
//! (volatile secret cache), [`crypto`]/[`pipeline`] (mnemonic/seed/HD-
//! node derivation), [`securechip`] (optional secure-element backend),
//! and [`api`] (the `StorageCore` entry point).
#![cfg_attr(not(test), no_std)]

pub mod commit;
pub mod counters;
pub mod crypto;
pub mod error;
pub mod flash;
pub mod migrate;
pub mod pipeline;
pub mod record;
pub mod session;

#[cfg(feature = "secure-chip")]
pub mod securechip;

pub mod api;

pub use api::StorageCore;
pub use error::{Error, Result};
