//! Per-request context
//!
//! A context scopes one request: it holds an open store session, the
//! privileged flag, and an open-ended key/value bag handlers read
//! criterion bindings from. Sessions come from the pooled client;
//! `close` releases the handle and any later store access panics.
//! Long-poll drains release and reacquire around the wait.

use std::collections::HashMap;

use bson::Document;
use mongodb::gridfs::GridFsBucket;
use mongodb::{Client, Collection, Database};

use crate::value::Value;

pub struct Context {
    client: Client,
    db_name: String,
    db: Option<Database>,
    privileged: bool,
    updated: bool,
    values: HashMap<String, Value>,
}

impl Context {
    pub(crate) fn new(client: Client, db_name: String) -> Self {
        let db = client.database(&db_name);
        Context {
            client,
            db_name,
            db: Some(db),
            privileged: false,
            updated: false,
            values: HashMap::new(),
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn set_privileged(&mut self, b: bool) {
        self.privileged = b;
    }

    /// Whether the bag changed since the last `set_updated(false)`.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn set_updated(&mut self, b: bool) {
        self.updated = b;
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, val: Value) {
        self.updated = true;
        self.values.insert(key.into(), val);
    }

    /// The whole bag, for persistence across requests.
    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    /// Release the store session. Store access after close panics.
    pub fn close(&mut self) {
        if self.db.take().is_none() {
            panic!("context closed");
        }
    }

    /// Reacquire a session after `close`, used by long-poll drains.
    pub(crate) fn reopen(&mut self) {
        if self.db.is_some() {
            panic!("context has been opened");
        }
        self.db = Some(self.client.database(&self.db_name));
    }

    fn database(&self) -> &Database {
        self.db.as_ref().expect("context closed")
    }

    /// Collection backing a shape; collection names are the lowered
    /// shape name.
    pub(crate) fn coll(&self, type_name: &str) -> Collection<Document> {
        self.database().collection(&type_name.to_lowercase())
    }

    /// Grid-file bucket for binary payloads.
    pub(crate) fn bucket(&self) -> GridFsBucket {
        self.database().gridfs_bucket(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_context() -> Context {
        let client = Client::with_uri_str("mongodb://localhost:27017")
            .await
            .expect("client parse");
        Context::new(client, "rest_test".to_string())
    }

    #[tokio::test]
    async fn test_bag_sets_updated_flag() {
        let mut ctx = test_context().await;
        assert!(!ctx.is_updated());
        ctx.set("CB1", Value::Bool(true));
        assert!(ctx.is_updated());
        assert_eq!(ctx.get("CB1"), Some(&Value::Bool(true)));
        assert_eq!(ctx.get("missing"), None);
    }

    #[tokio::test]
    async fn test_close_and_reopen() {
        let mut ctx = test_context().await;
        assert!(ctx.is_open());
        ctx.close();
        assert!(!ctx.is_open());
        ctx.reopen();
        assert!(ctx.is_open());
    }

    #[tokio::test]
    #[should_panic(expected = "context closed")]
    async fn test_double_close_panics() {
        let mut ctx = test_context().await;
        ctx.close();
        ctx.close();
    }

    #[tokio::test]
    #[should_panic(expected = "context closed")]
    async fn test_store_access_after_close_panics() {
        let mut ctx = test_context().await;
        ctx.close();
        let _ = ctx.coll("ss");
    }

    #[tokio::test]
    #[should_panic(expected = "context has been opened")]
    async fn test_reopen_while_open_panics() {
        let mut ctx = test_context().await;
        ctx.reopen();
    }
}
