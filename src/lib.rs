//! trayvault - JSON documents and logs on shared object stores.
//!
//! This library lets unrelated subsystems persist JSON documents (trays) and
//! ordered JSON logs (cords) on a local directory tree or an S3-compatible
//! store that several processes and hosts write to at once. Cross-process
//! exclusion uses sentinel lock objects next to each document.
//!
//! # Modules
//!
//! - [`path`] - Container/path addressing
//! - [`storage`] - Object store trait and backends (local, remote, memory)
//! - [`lock`] - Sentinel lock protocol over any object store
//! - [`format`] - Line-per-entry JSON layout of stored documents
//! - [`tray`] - Key-value documents
//! - [`cord`] - Ordered logs of objects
//! - [`registry`] - One shared instance per path
//! - [`config`] - Configuration loading
//! - [`cli`] - Command-line interface definitions
//! - [`commands`] - Operations behind the CLI

pub mod cli;
pub mod commands;
pub mod config;
pub mod cord;
mod document;
pub mod format;
pub mod lock;
pub mod path;
pub mod registry;
pub mod storage;
pub mod tray;

pub use cord::{Cord, CordKind, FieldValue, open_cord};
pub use document::{DOCUMENT_LOCK_WAIT, Object};
pub use lock::LockingStore;
pub use path::StoragePath;
pub use registry::Documents;
pub use storage::{ObjectStore, StorageError, StorageResult};
pub use tray::{Tray, TrayKind, open_tray};
