use super::types::{ImageRecord, Perma, Session};
use super::Database;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::OptionalExtension;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

const DB_FILE_NAME: &str = "node.db";
const LOCK_FILE_NAME: &str = ".lock";
const SCHEMA_VERSION: i32 = 1;

const PERMA_COLUMNS: &str = "service_id, template_id, node_id, port, ports, ram, cpu, disk, env, meta, network, image_id, created_at";

/// SQLite-backed [`Database`].
///
/// Holds an advisory lock (`state_dir/.lock`) for its lifetime so two nodes
/// never share a state directory by accident.
pub struct SqliteDatabase {
    db_path: PathBuf,
    conn: Connection,
    #[allow(dead_code)]
    lock_file: Option<std::fs::File>,
}

/// A `perma` row before its JSON columns are decoded.
struct PermaRow {
    service_id: String,
    template_id: String,
    node_id: String,
    port: i64,
    ports: String,
    ram: i64,
    cpu: f64,
    disk: i64,
    env: String,
    meta: String,
    network: bool,
    image_id: Option<String>,
    created_at: String,
}

impl PermaRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            service_id: row.get(0)?,
            template_id: row.get(1)?,
            node_id: row.get(2)?,
            port: row.get(3)?,
            ports: row.get(4)?,
            ram: row.get(5)?,
            cpu: row.get(6)?,
            disk: row.get(7)?,
            env: row.get(8)?,
            meta: row.get(9)?,
            network: row.get(10)?,
            image_id: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn decode(self) -> Result<Perma> {
        Ok(Perma {
            port: to_port(self.port)?,
            ports: serde_json::from_str(&self.ports)?,
            ram: self.ram.max(0) as u64,
            cpu: self.cpu,
            disk: self.disk.max(0) as u64,
            env: serde_json::from_str(&self.env)?,
            meta: serde_json::from_str(&self.meta)?,
            network: self.network,
            image_id: self.image_id,
            created_at: parse_timestamp(&self.created_at)?,
            service_id: self.service_id,
            template_id: self.template_id,
            node_id: self.node_id,
        })
    }
}

struct ImageRow {
    id: String,
    template_id: String,
    content_hash: String,
    build_options: String,
    created_at: String,
}

impl ImageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            template_id: row.get(1)?,
            content_hash: row.get(2)?,
            build_options: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<ImageRecord> {
        Ok(ImageRecord {
            build_options: serde_json::from_str(&self.build_options)?,
            created_at: parse_timestamp(&self.created_at)?,
            id: self.id,
            template_id: self.template_id,
            content_hash: self.content_hash,
        })
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_session(
    (service_id, node_id, container_id, started_at): (String, String, String, String),
) -> Result<Session> {
    Ok(Session {
        service_id,
        node_id,
        container_id,
        started_at: parse_timestamp(&started_at)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("invalid timestamp '{}': {}", raw, e)))
}

fn to_port(raw: i64) -> Result<u16> {
    u16::try_from(raw).map_err(|_| Error::Persistence(format!("invalid port {}", raw)))
}

/// Build options are stored as the JSON of a sorted map, so equal option
/// sets always serialize to the same text and can be compared in SQL.
fn canonical_options(options: &BTreeMap<String, String>) -> Result<String> {
    Ok(serde_json::to_string(options)?)
}

impl SqliteDatabase {
    /// Open (or create) `state_dir/node.db` and bring its schema up to date.
    pub async fn new(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        std::fs::create_dir_all(state_dir).map_err(|e| {
            Error::Filesystem(format!(
                "Failed to create state directory {}: {}",
                state_dir.display(),
                e
            ))
        })?;

        let lock_file = Self::try_acquire_lock(&state_dir.join(LOCK_FILE_NAME))?;
        let db_path = state_dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path).await?;

        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;

        let db = Self {
            db_path,
            conn,
            lock_file,
        };
        db.initialize().await?;
        Ok(db)
    }

    /// In-memory database with no state directory and no file lock.
    pub async fn new_ephemeral() -> Result<Self> {
        let conn = Connection::open(":memory:").await?;
        let db = Self {
            db_path: PathBuf::from(":memory:"),
            conn,
            lock_file: None,
        };
        db.initialize().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Returns `None` (and proceeds unlocked) if another process holds the lock.
    fn try_acquire_lock(lock_path: &Path) -> Result<Option<std::fs::File>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| Error::Filesystem(format!("Failed to open lock file: {}", e)))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                debug!("Acquired advisory lock on {:?}", lock_path);
                Ok(Some(file))
            }
            Err(e) => {
                let owner = std::fs::read_to_string(lock_path).unwrap_or_default();
                let owner = owner.trim();
                match owner.parse::<i32>() {
                    Ok(pid) if pid as u32 != std::process::id() => {
                        use nix::sys::signal::kill;
                        use nix::unistd::Pid;
                        if kill(Pid::from_raw(pid), None).is_ok() {
                            warn!(
                                "Another node (PID {}) is using this state directory. \
                                 Proceeding anyway, but state conflicts are possible.",
                                pid
                            );
                        } else {
                            debug!("Stale lock file (PID {} no longer exists)", pid);
                        }
                    }
                    _ => debug!("Could not acquire lock ({}) - proceeding anyway", e),
                }
                Ok(None)
            }
        }
    }

    async fn initialize(&self) -> Result<()> {
        let version: Option<i32> = self
            .conn
            .call(
                |conn: &mut rusqlite::Connection| -> tokio_rusqlite::Result<Option<i32>> {
                    let exists: bool = conn.query_row(
                        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
                        [],
                        |row| row.get(0),
                    )?;
                    if !exists {
                        return Ok(None);
                    }
                    Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                        row.get(0)
                    })?)
                },
            )
            .await?;

        match version {
            None => {
                debug!("Creating SQLite schema");
                self.create_schema().await
            }
            Some(v) if v > SCHEMA_VERSION => Err(Error::Persistence(format!(
                "{} has schema version {}, newer than supported version {}",
                self.db_path.display(),
                v,
                SCHEMA_VERSION
            ))),
            Some(_) => {
                debug!("Loading existing SQLite state");
                Ok(())
            }
        }
    }

    async fn create_schema(&self) -> Result<()> {
        self.conn
            .call(|conn: &mut rusqlite::Connection| -> tokio_rusqlite::Result<()> {
                conn.execute_batch(
                    r#"
                    CREATE TABLE schema_version (
                        version INTEGER PRIMARY KEY,
                        applied_at TEXT NOT NULL
                    );

                    CREATE TABLE perma (
                        service_id TEXT PRIMARY KEY,
                        template_id TEXT NOT NULL,
                        node_id TEXT NOT NULL,
                        port INTEGER NOT NULL,
                        ports TEXT NOT NULL,
                        ram INTEGER NOT NULL,
                        cpu REAL NOT NULL,
                        disk INTEGER NOT NULL,
                        env TEXT NOT NULL,
                        meta TEXT NOT NULL,
                        network INTEGER NOT NULL DEFAULT 0,
                        image_id TEXT,
                        created_at TEXT NOT NULL
                    );

                    CREATE INDEX idx_perma_node ON perma(node_id, created_at);
                    CREATE INDEX idx_perma_image ON perma(image_id) WHERE image_id IS NOT NULL;

                    CREATE TABLE sessions (
                        service_id TEXT PRIMARY KEY,
                        node_id TEXT NOT NULL,
                        container_id TEXT NOT NULL,
                        started_at TEXT NOT NULL
                    );

                    CREATE INDEX idx_sessions_node ON sessions(node_id);

                    CREATE TABLE images (
                        id TEXT PRIMARY KEY,
                        template_id TEXT NOT NULL,
                        content_hash TEXT NOT NULL,
                        build_options TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );

                    CREATE INDEX idx_images_bucket ON images(template_id, build_options);

                    CREATE TABLE service_meta (
                        service_id TEXT NOT NULL,
                        key TEXT NOT NULL,
                        value TEXT NOT NULL,
                        PRIMARY KEY (service_id, key)
                    );

                    CREATE TABLE node_meta (
                        key TEXT PRIMARY KEY,
                        value TEXT NOT NULL
                    );
                    "#,
                )?;

                conn.execute(
                    "INSERT INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                    rusqlite::params![SCHEMA_VERSION],
                )?;

                Ok(())
            })
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn save_perma(&self, perma: &Perma) -> Result<()> {
        let perma = perma.clone();
        let ports = serde_json::to_string(&perma.ports)?;
        let env = serde_json::to_string(&perma.env)?;
        let meta = serde_json::to_string(&perma.meta)?;
        let created_at = perma.created_at.to_rfc3339();

        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO perma ({}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                        PERMA_COLUMNS
                    ),
                    rusqlite::params![
                        perma.service_id,
                        perma.template_id,
                        perma.node_id,
                        perma.port as i64,
                        ports,
                        perma.ram as i64,
                        perma.cpu,
                        perma.disk as i64,
                        env,
                        meta,
                        perma.network,
                        perma.image_id,
                        created_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_perma(&self, service_id: &str) -> Result<Option<Perma>> {
        let service_id = service_id.to_string();
        let row = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {} FROM perma WHERE service_id = ?1", PERMA_COLUMNS),
                        [&service_id],
                        PermaRow::from_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(PermaRow::decode).transpose()
    }

    async fn delete_perma(&self, service_id: &str) -> Result<bool> {
        let service_id = service_id.to_string();
        let removed = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM perma WHERE service_id = ?1", [&service_id])?;
                tx.execute("DELETE FROM service_meta WHERE service_id = ?1", [&service_id])?;
                tx.commit()?;
                Ok(removed)
            })
            .await?;
        Ok(removed > 0)
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "INSERT OR REPLACE INTO sessions (service_id, node_id, container_id, started_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        session.service_id,
                        session.node_id,
                        session.container_id,
                        session.started_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_session(&self, service_id: &str) -> Result<Option<Session>> {
        let service_id = service_id.to_string();
        let row = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn
                    .query_row(
                        "SELECT service_id, node_id, container_id, started_at FROM sessions WHERE service_id = ?1",
                        [&service_id],
                        session_from_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(decode_session).transpose()
    }

    async fn delete_session(&self, service_id: &str) -> Result<bool> {
        let service_id = service_id.to_string();
        let removed = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.execute("DELETE FROM sessions WHERE service_id = ?1", [&service_id])?)
            })
            .await?;
        Ok(removed > 0)
    }

    async fn delete_sessions(&self, node_id: &str) -> Result<usize> {
        let node_id = node_id.to_string();
        let removed = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.execute("DELETE FROM sessions WHERE node_id = ?1", [&node_id])?)
            })
            .await?;
        Ok(removed)
    }

    async fn list_sessions(&self, node_id: &str) -> Result<Vec<Session>> {
        let node_id = node_id.to_string();
        let rows = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(
                    "SELECT service_id, node_id, container_id, started_at FROM sessions \
                     WHERE node_id = ?1 ORDER BY started_at",
                )?;
                let rows = stmt
                    .query_map([&node_id], session_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_session).collect()
    }

    async fn list(
        &self,
        node_id: &str,
        page: Option<u32>,
        page_size: Option<u32>,
        meta_filter: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<Perma>> {
        let node_id = node_id.to_string();
        let rows = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM perma WHERE node_id = ?1 ORDER BY created_at, service_id",
                    PERMA_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([&node_id], PermaRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut services = Vec::with_capacity(rows.len());
        for row in rows {
            let perma = row.decode()?;
            let matches = meta_filter.map_or(true, |filter| {
                filter
                    .iter()
                    .all(|(k, v)| perma.meta.get(k).is_some_and(|actual| actual == v))
            });
            if matches {
                services.push(perma);
            }
        }

        Ok(match page_size {
            Some(size) if size > 0 => {
                let skip = page.unwrap_or(0) as usize * size as usize;
                services.into_iter().skip(skip).take(size as usize).collect()
            }
            _ => services,
        })
    }

    async fn count(&self, node_id: &str) -> Result<u64> {
        let node_id = node_id.to_string();
        let count: i64 = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM perma WHERE node_id = ?1",
                    [&node_id],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn save_image(&self, image: &ImageRecord) -> Result<()> {
        let image = image.clone();
        let options = canonical_options(&image.build_options)?;
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "INSERT OR REPLACE INTO images (id, template_id, content_hash, build_options, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        image.id,
                        image.template_id,
                        image.content_hash,
                        options,
                        image.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        let image_id = image_id.to_string();
        let row = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn
                    .query_row(
                        "SELECT id, template_id, content_hash, build_options, created_at FROM images WHERE id = ?1",
                        [&image_id],
                        ImageRow::from_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(ImageRow::decode).transpose()
    }

    async fn delete_image(&self, image_id: &str) -> Result<bool> {
        let image_id = image_id.to_string();
        let removed = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.execute("DELETE FROM images WHERE id = ?1", [&image_id])?)
            })
            .await?;
        Ok(removed > 0)
    }

    async fn list_images_by_options(
        &self,
        template_id: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Vec<ImageRecord>> {
        let template_id = template_id.to_string();
        let options = canonical_options(options)?;
        let rows = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(
                    "SELECT id, template_id, content_hash, build_options, created_at FROM images \
                     WHERE template_id = ?1 AND build_options = ?2 ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map([&template_id, &options], ImageRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(ImageRow::decode).collect()
    }

    async fn count_image_refs(&self, image_id: &str) -> Result<u64> {
        let image_id = image_id.to_string();
        let count: i64 = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM perma WHERE image_id = ?1",
                    [&image_id],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn set_service_meta(
        &self,
        service_id: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let service_id = service_id.to_string();
        let key = key.to_string();
        let value = value.map(str::to_string);
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                match value {
                    Some(value) => conn.execute(
                        "INSERT OR REPLACE INTO service_meta (service_id, key, value) VALUES (?1, ?2, ?3)",
                        rusqlite::params![service_id, key, value],
                    )?,
                    None => conn.execute(
                        "DELETE FROM service_meta WHERE service_id = ?1 AND key = ?2",
                        rusqlite::params![service_id, key],
                    )?,
                };
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_service_meta(&self, service_id: &str, key: &str) -> Result<Option<String>> {
        let service_id = service_id.to_string();
        let key = key.to_string();
        let value = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM service_meta WHERE service_id = ?1 AND key = ?2",
                        [&service_id, &key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(value)
    }

    async fn set_meta_val(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "INSERT OR REPLACE INTO node_meta (key, value) VALUES (?1, ?2)",
                    [&key, &value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_meta_val(&self, key: &str, default: Option<&str>) -> Result<Option<String>> {
        let key = key.to_string();
        let value: Option<String> = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn
                    .query_row("SELECT value FROM node_meta WHERE key = ?1", [&key], |row| {
                        row.get(0)
                    })
                    .optional()?)
            })
            .await?;
        Ok(value.or_else(|| default.map(str::to_string)))
    }
}
