//! # File Notifications
//!
//! This crate provides a cross-platform file change watcher. Callers register
//! paths and receive a normalized stream of [`Event`]s whose [`Op`] mask says
//! what happened: create, write, remove, rename or chmod.
//!
//! ## Features
//!
//! - **One Event Model**: every backend reports the same operation bitmask
//! - **Recursive Watches**: `dir/...` watches a subtree, even on backends that
//!   can only watch single directories
//! - **Resource Limits**: the descriptor limit is raised once and respected
//!   when registering directories
//! - **Overflow Handling**: dropped notifications surface as a single
//!   [`WatcherError::EventOverflow`] and the watcher keeps running
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Watcher                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  add("dir/...") ──► recursive_path ──► find_dirs                │
//! │                                           │                     │
//! │                                           ▼                     │
//! │        rlimit ──────────────────────► WatchRegistry             │
//! │                                           │                     │
//! │                                           ▼                     │
//! │  Event / WatcherError ◄── Normalizer ◄── Backend (notify)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use codex_fs_notify::{Op, Watcher, WatcherConfig};
//!
//! let watcher = Watcher::new(WatcherConfig::default())?;
//! watcher.add("src/...").await?;
//!
//! while let Some(event) = watcher.next_event().await {
//!     if event.has(Op::WRITE) {
//!         println!("modified: {event}");
//!     }
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod op;
pub mod recursive;
pub mod registry;
pub mod rlimit;
pub mod watcher;

pub use backend::{Backend, ManualBackend, ManualHandle, NotifyBackend, RawNotification, RawSink};
pub use config::WatcherConfig;
pub use error::{Result, WatcherError};
pub use event::Event;
pub use op::Op;
pub use recursive::{RECURSIVE_MARKER, find_dirs, recursive_path};
pub use registry::{ScannedWatch, WatchRegistry};
pub use watcher::Watcher;
