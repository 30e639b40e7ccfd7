//! Layered point-to-point messaging over a reliable byte stream.
//!
//! The endpoint exposes four layers: non-blocking buffered byte I/O,
//! length-prefixed framing, vector-tagged messages for correlating replies,
//! and a mode-governed request/response dispatch surface shared by
//! concurrent callers.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod frame;
pub mod shared;
pub mod vector;
