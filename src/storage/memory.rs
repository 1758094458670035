//! In-memory stand-in for the `mdbx` driver named in the CLI default.
//!
//! Matches the spec's statement that the included storage driver is a
//! stub and not part of the core: it logs and keeps everything in a
//! `DashMap`, with no persistence across restarts.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{Driver, Page};
use crate::error::Result;

pub struct MemoryDriver {
    data: DashMap<(String, String), Value>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn initialize(&self) -> Result<()> {
        tracing::info!("storage driver \"mdbx\" (in-memory stub) initialized");
        Ok(())
    }

    async fn list(&self, domain: &str, cursor: Option<&str>) -> Result<Page> {
        // No real pagination in the stub: one page, everything in the
        // domain, cursor argument accepted and ignored beyond presence.
        let _ = cursor;
        let items = self
            .data
            .iter()
            .filter(|entry| entry.key().0 == domain)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        Ok(Page {
            items,
            next_cursor: None,
        })
    }

    async fn get(&self, domain: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .data
            .get(&(domain.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn set(&self, domain: &str, key: &str, value: Value) -> Result<()> {
        self.data.insert((domain.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn remove(&self, domain: &str, key: &str) -> Result<()> {
        self.data.remove(&(domain.to_string(), key.to_string()));
        Ok(())
    }

    async fn flush(&self, domain: &str) -> Result<()> {
        tracing::debug!(domain, "flush is a no-op on the in-memory stub");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let driver = MemoryDriver::new();
        driver.initialize().await.unwrap();
        driver
            .set("peers", "abc", serde_json::json!({"hello": "world"}))
            .await
            .unwrap();

        let value = driver.get("peers", "abc").await.unwrap();
        assert_eq!(value, Some(serde_json::json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let driver = MemoryDriver::new();
        assert_eq!(driver.get("peers", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_is_scoped_to_domain() {
        let driver = MemoryDriver::new();
        driver.set("a", "k1", Value::Null).await.unwrap();
        driver.set("b", "k2", Value::Null).await.unwrap();

        let page = driver.list("a", None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].0, "k1");
    }

    #[tokio::test]
    async fn remove_then_get_returns_none() {
        let driver = MemoryDriver::new();
        driver.set("a", "k1", Value::Bool(true)).await.unwrap();
        driver.remove("a", "k1").await.unwrap();
        assert_eq!(driver.get("a", "k1").await.unwrap(), None);
    }
}
