//! # Briefcase Backend
//!
//! Async orchestration of briefcases against a hub.
//!
//! [`BriefcaseManager`] is the entry point: it opens iModels as
//! [`IModelDb`]s, pulls and merges changesets, pushes local changes and
//! closes briefcases. The deterministic pieces (changesets, locks, codes,
//! merging, txns) live in `briefcase_engine`; this crate adds the hub, the
//! local files and the suspension points between them.
//!
//! ## Seams
//!
//! - [`HubClient`] - the central service. [`InMemoryHub`] runs in-process and
//!   supports fault injection.
//! - [`DatabaseOpener`] / [`LocalDatabase`] - briefcase files.
//!   [`JsonOpener`] stores each briefcase as one JSON file.
//!
//! ## Example
//!
//! ```no_run
//! use briefcase_backend::{
//!     AuthorizedContext, BriefcaseManager, Config, InMemoryHub, JsonOpener,
//! };
//! use briefcase_engine::ElementProps;
//! use std::sync::Arc;
//!
//! # async fn run() -> briefcase_backend::BackendResult<()> {
//! let manager = BriefcaseManager::new_shared(
//!     InMemoryHub::new_shared(),
//!     Arc::new(JsonOpener::new()),
//!     Config::from_env()?,
//! );
//! let ctx = AuthorizedContext::for_token("token");
//!
//! let db = manager.create(&ctx, "project", "plant", "").await?;
//! db.insert_element(ElementProps::new("0x20", "0x10", "Generic:PhysicalObject"))
//!     .await?;
//! db.save_changes("add pump").await?;
//! manager.push_changes(&ctx, &db, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod briefcase;
pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod hub;
pub mod imodel;
pub mod manager;
pub mod memory;

pub use briefcase::{BriefcaseEntry, BriefcaseEvent, DbGuard};
pub use config::{Config, ConfigError};
pub use database::{DatabaseError, DatabaseOpener, DbResult, LocalDatabase};
pub use db::{BriefcaseFile, JsonDatabase, JsonOpener};
pub use error::{BackendError, BackendResult, RequestError};
pub use hub::{
    AuthorizedContext, ChangeSetPosition, ChangeSetQuery, DeniedLocks, HubClient, HubError,
    IModelInfo, IModelVersion,
};
pub use imodel::{IModelDb, IModelEvent, Validator};
pub use manager::{BriefcaseManager, OpenOutcome, OpenParams};
pub use memory::InMemoryHub;
