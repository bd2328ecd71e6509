mod common;

use common::{env, start_node, templates_dir, write_template, FakeEngine, WEB_TEMPLATE};
use parking_lot::Mutex;
use service_node::image::{ImageManager, TemplateHashes};
use service_node::state::{Database, SqliteDatabase};
use service_node::template::TemplateRegistry;
use service_node::{CreateOptions, Error, ServiceUpdate};
use std::collections::HashMap;
use std::sync::Arc;

/// Template hashes set by hand.
#[derive(Default)]
struct FixedHashes {
    hashes: Mutex<HashMap<String, String>>,
}

impl FixedHashes {
    fn set(&self, template_id: &str, hash: &str) {
        self.hashes
            .lock()
            .insert(template_id.to_string(), hash.to_string());
    }
}

impl TemplateHashes for FixedHashes {
    fn template_hash(&self, template_id: &str) -> service_node::Result<String> {
        self.hashes
            .lock()
            .get(template_id)
            .cloned()
            .ok_or_else(|| Error::HashPending(template_id.to_string()))
    }
}

struct Fixture {
    _templates: tempfile::TempDir,
    engine: Arc<FakeEngine>,
    hashes: Arc<FixedHashes>,
    images: ImageManager,
}

async fn fixture() -> Fixture {
    let templates = tempfile::tempdir().unwrap();
    write_template(templates.path(), "web", WEB_TEMPLATE);
    let engine = FakeEngine::new();
    let hashes = Arc::new(FixedHashes::default());
    hashes.set("web", "hash-1");
    let db: Arc<dyn Database> = Arc::new(SqliteDatabase::new_ephemeral().await.unwrap());
    let registry = Arc::new(TemplateRegistry::new(templates.path(), false));
    let images = ImageManager::new(db, engine.clone(), registry, hashes.clone());
    Fixture {
        _templates: templates,
        engine,
        hashes,
        images,
    }
}

#[tokio::test]
async fn unchanged_template_is_a_cache_hit() {
    let f = fixture().await;
    let options = env(&[("VERSION", "1")]);

    let first = f.images.process_image(None, "web", &options).await.unwrap();
    let second = f
        .images
        .process_image(Some(&first), "web", &options)
        .await
        .unwrap();
    let third = f
        .images
        .process_image(Some(&second), "web", &options)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(f.engine.builds(), 1);
}

#[tokio::test]
async fn changed_template_rebuilds_in_place() {
    let f = fixture().await;
    let options = env(&[("VERSION", "1")]);
    let image = f.images.process_image(None, "web", &options).await.unwrap();

    f.hashes.set("web", "hash-2");
    let rebuilt = f
        .images
        .process_image(Some(&image), "web", &options)
        .await
        .unwrap();

    assert_eq!(rebuilt, image);
    assert_eq!(f.engine.builds(), 2);
    assert_eq!(f.engine.rebuilt.lock().clone(), vec![image.clone()]);

    // The new hash was recorded, so a third call builds nothing
    f.images
        .process_image(Some(&image), "web", &options)
        .await
        .unwrap();
    assert_eq!(f.engine.builds(), 2);
}

#[tokio::test]
async fn changed_options_reuse_a_matching_bucket() {
    let f = fixture().await;
    let one = f
        .images
        .process_image(None, "web", &env(&[("VERSION", "1")]))
        .await
        .unwrap();
    let two = f
        .images
        .process_image(None, "web", &env(&[("VERSION", "2")]))
        .await
        .unwrap();
    assert_ne!(one, two);

    let moved = f
        .images
        .process_image(Some(&one), "web", &env(&[("VERSION", "2")]))
        .await
        .unwrap();

    assert_eq!(moved, two);
    assert_eq!(f.engine.builds(), 2);
    // Nothing references the old bucket
    assert!(!f.engine.has_image(&one));
}

#[tokio::test]
async fn unknown_image_and_pending_hash_fail() {
    let f = fixture().await;
    let options = env(&[("VERSION", "1")]);

    let err = f
        .images
        .process_image(Some("img-404"), "web", &options)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ImageNotFound(_)));

    f.hashes.hashes.lock().clear();
    let err = f.images.process_image(None, "web", &options).await.unwrap_err();
    assert!(matches!(err, Error::HashPending(_)));
    assert_eq!(f.engine.builds(), 0);
}

/// Two services on options `{VERSION: 1}` and `{VERSION: 2}`; moving the
/// first onto the second's options shares the second's image and collects
/// the first's.
#[tokio::test]
async fn services_share_buckets_by_options() {
    let templates = templates_dir();
    let engine = FakeEngine::new();
    let node = start_node(templates.path(), engine.clone()).await;

    let mut ids = Vec::new();
    for version in ["1", "2"] {
        let perma = node
            .create_service(
                "web",
                CreateOptions {
                    env: env(&[("EULA", "true"), ("VERSION", version)]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        node.resume_service(&perma.service_id).await.unwrap();
        node.stop_service(&perma.service_id, false).await.unwrap();
        ids.push(perma.service_id);
    }
    assert_eq!(engine.builds(), 2);
    let first_image = node.get_service(&ids[0]).await.unwrap().image_id.unwrap();
    let second_image = node.get_service(&ids[1]).await.unwrap().image_id.unwrap();

    node.update_options(
        &ids[0],
        ServiceUpdate {
            env: Some(env(&[("VERSION", "2")])),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    node.resume_service(&ids[0]).await.unwrap();

    assert_eq!(engine.builds(), 2);
    assert_eq!(
        node.get_service(&ids[0]).await.unwrap().image_id,
        Some(second_image)
    );
    assert!(!engine.has_image(&first_image));
}

#[tokio::test]
async fn template_edit_rebuilds_on_next_resume() {
    let templates = templates_dir();
    let engine = FakeEngine::new();
    let node = start_node(templates.path(), engine.clone()).await;
    let perma = node
        .create_service(
            "web",
            CreateOptions {
                env: env(&[("EULA", "true")]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    node.resume_service(&perma.service_id).await.unwrap();
    node.stop_service(&perma.service_id, false).await.unwrap();

    std::fs::write(templates.path().join("web/Dockerfile"), "FROM debian\n").unwrap();
    node.watcher().notify_changed("web");
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    node.resume_service(&perma.service_id).await.unwrap();
    assert_eq!(engine.builds(), 2);
    assert_eq!(engine.rebuilt.lock().len(), 1);
}
