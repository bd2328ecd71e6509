//! Build cache for template images.
//!
//! Images are grouped in buckets: one per (template, build options). A bucket
//! id is stable; when only the template source changes the bucket is rebuilt
//! in place under the same id. Changing build options moves a service to
//! another bucket, reusing an existing one when the options match exactly.

use crate::engine::{BuildOptions, ContainerEngine};
use crate::error::{Error, Result};
use crate::state::{Database, ImageRecord};
use crate::template::TemplateRegistry;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Source of current template content hashes.
pub trait TemplateHashes: Send + Sync {
    /// Fails with [`Error::HashPending`] before the first computation.
    fn template_hash(&self, template_id: &str) -> Result<String>;
}

pub struct ImageManager {
    db: Arc<dyn Database>,
    engine: Arc<dyn ContainerEngine>,
    templates: Arc<TemplateRegistry>,
    hashes: Arc<dyn TemplateHashes>,
    /// Builds of one template run one at a time.
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageManager {
    pub fn new(
        db: Arc<dyn Database>,
        engine: Arc<dyn ContainerEngine>,
        templates: Arc<TemplateRegistry>,
        hashes: Arc<dyn TemplateHashes>,
    ) -> Self {
        Self {
            db,
            engine,
            templates,
            hashes,
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    fn build_lock(&self, template_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.build_locks
                .lock()
                .entry(template_id.to_string())
                .or_default(),
        )
    }

    /// Resolve the image a service should run, building only when needed.
    pub async fn process_image(
        &self,
        current_image_id: Option<&str>,
        template_id: &str,
        options: &BuildOptions,
    ) -> Result<String> {
        let Some(current_id) = current_image_id else {
            return self.build_new(template_id, options).await;
        };

        let stored = self
            .db
            .get_image(current_id)
            .await?
            .ok_or_else(|| Error::ImageNotFound(current_id.to_string()))?;
        let current_hash = self.hashes.template_hash(template_id)?;

        // BTreeMap equality ignores insertion order
        if &stored.build_options != options {
            let matches = self.db.list_images_by_options(template_id, options).await?;
            let image_id = match matches.into_iter().next() {
                Some(found) => {
                    debug!(
                        "reusing image bucket {} for template '{}'",
                        found.id, template_id
                    );
                    found.id
                }
                None => self.build_new(template_id, options).await?,
            };
            if image_id != stored.id {
                self.collect_if_unreferenced(&stored.id).await;
            }
            return Ok(image_id);
        }

        if stored.content_hash != current_hash {
            return self.rebuild_in_place(stored, &current_hash).await;
        }

        debug!("image {} is current for template '{}'", stored.id, template_id);
        Ok(stored.id)
    }

    async fn build_new(&self, template_id: &str, options: &BuildOptions) -> Result<String> {
        let template = self.templates.get(template_id)?;
        let hash = self.hashes.template_hash(template_id)?;

        let lock = self.build_lock(template_id);
        let _building = lock.lock().await;

        info!("building new image for template '{}'", template_id);
        let image_id = self.engine.build(None, &template.dir, options).await?;
        self.db
            .save_image(&ImageRecord {
                id: image_id.clone(),
                template_id: template_id.to_string(),
                content_hash: hash,
                build_options: options.clone(),
                created_at: Utc::now(),
            })
            .await?;
        Ok(image_id)
    }

    async fn rebuild_in_place(&self, stored: ImageRecord, current_hash: &str) -> Result<String> {
        let template = self.templates.get(&stored.template_id)?;
        let lock = self.build_lock(&stored.template_id);
        let _building = lock.lock().await;

        // Another service may have rebuilt this bucket while we waited
        if let Some(latest) = self.db.get_image(&stored.id).await? {
            if latest.content_hash == current_hash {
                return Ok(latest.id);
            }
        }

        info!(
            "template '{}' changed; rebuilding image {} in place",
            stored.template_id, stored.id
        );
        let image_id = self
            .engine
            .build(Some(&stored.id), &template.dir, &stored.build_options)
            .await?;
        self.db
            .save_image(&ImageRecord {
                id: image_id.clone(),
                content_hash: current_hash.to_string(),
                ..stored
            })
            .await?;
        Ok(image_id)
    }

    /// Delete `image_id` from the runtime and the store if no service
    /// references it. Failures are logged; returns whether it was removed.
    pub async fn collect_if_unreferenced(&self, image_id: &str) -> bool {
        match self.db.count_image_refs(image_id).await {
            Ok(0) => {}
            Ok(refs) => {
                debug!("image {} still referenced by {} service(s)", image_id, refs);
                return false;
            }
            Err(e) => {
                warn!("failed to count references to image {}: {}", image_id, e);
                return false;
            }
        }

        if let Err(e) = self.engine.remove_image(image_id).await {
            warn!("failed to remove image {} from runtime: {}", image_id, e);
        }
        match self.db.delete_image(image_id).await {
            Ok(removed) => {
                if removed {
                    info!("collected unreferenced image {}", image_id);
                }
                removed
            }
            Err(e) => {
                warn!("failed to delete image record {}: {}", image_id, e);
                false
            }
        }
    }
}
