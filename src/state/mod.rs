//! Persistent node state.
//!
//! The lifecycle core only talks to the [`Database`] trait. [`SqliteDatabase`]
//! is the shipped implementation: a SQLite file (`node.db`, WAL mode) under the
//! node's state directory, or an in-memory database for tests.
//!
//! # Records
//!
//! - [`Perma`]: a created service; durable until deleted
//! - [`Session`]: a container believed live for a service
//! - [`ImageRecord`]: one built image bucket per (template, build options)
//! - service meta: free-form per-service key/value pairs
//! - node meta: free-form node-wide key/value pairs

mod sqlite;
mod types;

pub use sqlite::SqliteDatabase;
pub use types::{ImageRecord, Perma, Session};

use crate::engine::MetaStore;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Service meta key recording the last failed resume.
pub const LAST_POWER_ERROR_KEY: &str = "lastPowerError";

#[async_trait]
pub trait Database: Send + Sync {
    async fn save_perma(&self, perma: &Perma) -> Result<()>;
    async fn get_perma(&self, service_id: &str) -> Result<Option<Perma>>;
    async fn delete_perma(&self, service_id: &str) -> Result<bool>;

    async fn save_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, service_id: &str) -> Result<Option<Session>>;
    async fn delete_session(&self, service_id: &str) -> Result<bool>;
    async fn delete_sessions(&self, node_id: &str) -> Result<usize>;
    async fn list_sessions(&self, node_id: &str) -> Result<Vec<Session>>;

    /// Services on `node_id`, optionally paginated (`page` is zero-based) and
    /// restricted to those whose meta contains every pair in `meta_filter`.
    async fn list(
        &self,
        node_id: &str,
        page: Option<u32>,
        page_size: Option<u32>,
        meta_filter: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<Perma>>;
    async fn count(&self, node_id: &str) -> Result<u64>;

    async fn save_image(&self, image: &ImageRecord) -> Result<()>;
    async fn get_image(&self, image_id: &str) -> Result<Option<ImageRecord>>;
    async fn delete_image(&self, image_id: &str) -> Result<bool>;
    /// Images of `template_id` built with exactly `options`, oldest first.
    async fn list_images_by_options(
        &self,
        template_id: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Vec<ImageRecord>>;
    /// Number of services whose Perma points at `image_id`.
    async fn count_image_refs(&self, image_id: &str) -> Result<u64>;

    /// `None` removes the key.
    async fn set_service_meta(&self, service_id: &str, key: &str, value: Option<&str>)
        -> Result<()>;
    async fn get_service_meta(&self, service_id: &str, key: &str) -> Result<Option<String>>;

    async fn set_meta_val(&self, key: &str, value: &str) -> Result<()>;
    async fn get_meta_val(&self, key: &str, default: Option<&str>) -> Result<Option<String>>;
}

/// A [`MetaStore`] scoped to one service, backed by the database.
#[derive(Clone)]
pub struct ServiceMetaStore {
    db: Arc<dyn Database>,
    service_id: String,
}

impl ServiceMetaStore {
    pub fn new(db: Arc<dyn Database>, service_id: impl Into<String>) -> Self {
        Self {
            db,
            service_id: service_id.into(),
        }
    }
}

#[async_trait]
impl MetaStore for ServiceMetaStore {
    fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.get_service_meta(&self.service_id, key).await
    }

    async fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        self.db.set_service_meta(&self.service_id, key, value).await
    }
}
