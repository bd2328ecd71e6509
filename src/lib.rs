#![allow(unused_assignments)]

//! # Service Node
//!
//! A node-local orchestrator that turns template directories into running,
//! resource-bounded container services.
//!
//! ## Features
//!
//! - **Templates**: a directory with `template.yaml` and a build context; its
//!   content hash is tracked by a debounced file watcher
//! - **Image cache**: images are shared per (template, build options) bucket
//!   and rebuilt in place when the template changes
//! - **Lifecycle**: create, resume, stop, delete and update services, with one
//!   pending action per service enforced by a busy lock
//! - **Reconciliation**: on boot, persisted sessions are reattached and
//!   unowned managed containers are killed
//!
//! ## Quick Start
//!
//! ```no_run
//! use service_node::{CreateOptions, Node, Parser};
//!
//! # async fn example() -> Result<(), service_node::Error> {
//! let config = Parser::new().load_config("node.yaml")?;
//! let node = Node::builder().config(config).build().await?;
//! node.start().await?;
//!
//! let service = node.create_service("web", CreateOptions::default()).await?;
//! node.resume_service(&service.service_id).await?;
//! node.stop_service(&service.service_id, false).await?;
//! node.delete_service(&service.service_id).await?;
//!
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Every [`Node`] method takes `&self`; the node lives in an `Arc`
//! - Operations on one service serialize through [`lock::BusyLock`]; a second
//!   concurrent operation fails fast with [`Error::Conflict`]
//! - Operations on distinct services run concurrently

pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod events;
pub mod image;
pub mod lock;
pub mod orchestrator;
pub mod port;
pub mod state;
pub mod template;
pub mod watch;

// Re-export commonly used types
pub use config::{NodeConfig, Parser};
pub use error::{Error, Result};
pub use orchestrator::{BootReport, CreateOptions, ListQuery, Node, NodeBuilder, ServiceUpdate};
pub use state::{Perma, Session};
