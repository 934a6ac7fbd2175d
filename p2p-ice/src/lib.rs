#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod allocator;
pub(crate) mod binding;
pub mod candidate;
pub mod connection;
pub mod network;
pub mod port;
pub mod rand;
pub mod socket;
pub mod transport;

pub use shared::error::{Error, Result};
