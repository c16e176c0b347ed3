//! Driver core for quad and octal span T1/E1/J1 PCI framer cards.
//!
//! A [`card::Card`] owns one card's register window, DMA ring, spans,
//! cross-connect fabric, HDLC controllers and echo canceller control.
//! The host calls [`card::Card::handle_interrupt`] from its interrupt path
//! and runs [`dispatch::spawn_deferred_worker`] (or calls
//! [`card::Card::service_deferred`] itself) for the work that may block.
//! Cards in one chassis share a [`sync::SyncRegistry`] to agree on a
//! timing source.

pub mod alarm;
pub mod card;
pub mod config;
pub mod dispatch;
pub mod dma;
pub mod echo;
pub mod error;
pub mod handle;
pub mod hdlc;
pub mod host;
pub mod maintenance;
pub mod reserve;
pub mod sim;
pub mod span;
pub mod sync;
pub mod tsi;
pub mod window;

pub use error::{Error, Result};
