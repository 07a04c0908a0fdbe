//! Comet Spider library surface.
//!
//! Given a handful of named root addresses, the spider rebuilds a deployment's full
//! contract graph (proxies, implementations, related contracts) from chain state alone,
//! names every node, and hands back a name-keyed table of callable contract handles.
//! The operator entry point is `src/bin/spider.rs`.

pub mod artifact;
pub mod chain;
pub mod deployment;
pub mod error;
pub mod relations;
pub mod spider;
pub mod storage;
pub mod utils;

pub mod config {
    pub mod networks;
    pub mod settings;
}

pub use error::{Result, SpiderError};
