//! imgfetch Core - Image Download Engine
//!
//! This crate provides an asynchronous image download manager with:
//! - Bounded concurrency and FIFO/LIFO admission
//! - Low-priority requests that yield to normal ones
//! - Cancellation at any point before a terminal state
//! - Progressive delivery of partial payloads
//! - Cache-bypass control per request
//! - Optional coalescing of concurrent fetches for one URL
//!
//! HTTP is reached through the [`HttpClient`] trait; [`ReqwestClient`] is the
//! default implementation.

pub mod config;
mod decode;
mod error;
mod http;
mod manager;
mod notifier;
mod operation;
mod queue;

pub use decode::*;
pub use error::*;
pub use http::*;
pub use manager::*;
pub use notifier::*;
pub use operation::*;

pub use imgfetch_types as types;
