//! An asynchronous loader for remote resources.
//!
//! The [`Engine`](engine::Engine) loads a resource identified by its URL through a memory tier,
//! a disk tier and finally the network, running each load at most once at any time no matter how
//! many listeners ask for it.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod decoder;
pub mod download;
pub mod engine;
pub mod logging;
pub mod pending;
pub mod pool;
pub mod stages;
pub mod types;
pub mod utils;

#[cfg(test)]
use webimage_test as test;
