//! Pluggable key-value storage driver contract (`SPEC_FULL.md` §6).
//!
//! A collaborator, not part of the core: the broker loads one by name at
//! startup and must have it initialized before the websocket listener
//! starts. The only driver shipped here (`memory::MemoryDriver`) is a
//! stub standing in for the `mdbx` driver named in the CLI default.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// One page of a `list` scan: the items found and an opaque cursor for
/// the next page, `None` once exhausted.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<(String, Value)>,
    pub next_cursor: Option<String>,
}

/// The pluggable key-value storage driver contract. Every operation is
/// scoped to a `domain` (a logical namespace, e.g. a collection name).
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registers this driver's CLI flags. Represented as a builder hook
    /// rather than a dynamic flag registry, since Rust's CLI parsing
    /// (`clap`) is static; the in-memory stub has none to add.
    fn create_flags(&self) {}

    /// Opens/creates whatever backing storage this driver needs. Must
    /// complete before the broker accepts any websocket connection.
    async fn initialize(&self) -> Result<()>;

    async fn list(&self, domain: &str, cursor: Option<&str>) -> Result<Page>;
    async fn get(&self, domain: &str, key: &str) -> Result<Option<Value>>;
    async fn set(&self, domain: &str, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, domain: &str, key: &str) -> Result<()>;
    async fn flush(&self, domain: &str) -> Result<()>;
}

/// Resolves a driver by name. Only `mdbx` (the stub) and `memory` (an
/// explicit alias for it) are known; anything else is a configuration
/// error caught before the listener starts.
pub fn resolve(name: &str) -> Result<Box<dyn Driver>> {
    match name {
        "mdbx" | "memory" => Ok(Box::new(memory::MemoryDriver::new())),
        other => Err(crate::error::Error::Config(format!(
            "unknown storage driver \"{other}\""
        ))),
    }
}
