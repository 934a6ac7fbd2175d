#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod addr;
pub mod attributes;
pub mod data;
pub mod error_code;
pub mod message;
pub mod options;
pub mod request;
pub mod textattrs;

#[cfg(test)]
mod message_test;
#[cfg(test)]
mod request_test;

pub use shared::error::{Error, Result};
