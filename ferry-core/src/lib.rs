//! Ferry Core - slot hashing and shared limits for the ferry proxy.
//!
//! This crate holds the pieces every other ferry crate agrees on: the `Slot`
//! type, the key-to-slot hash, and the bounds that keep queues and frames
//! finite.
//!
//! # Design Principles
//!
//! - **Strongly-typed slots**: a `Slot` is not a bare `u16`
//! - **Explicit limits**: every queue and buffer has a bounded maximum
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod limits;
mod slot;

pub use limits::Limits;
pub use slot::{key_slot, Slot, SLOT_COUNT};
