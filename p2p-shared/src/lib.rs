#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod error;
pub mod timer;
pub(crate) mod transport;
pub mod util;

#[cfg(test)]
mod timer_test;

pub use timer::{TimerId, TimerQueue};
pub use transport::{TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol};
