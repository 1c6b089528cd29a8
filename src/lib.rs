//! # Tidemark: a checkpointed key-value store core
//!
//! Tidemark implements the two load-bearing subsystems of a distributed,
//! memcached-compatible, eventually-persisted store:
//!
//! - **The checkpoint manager** ([`checkpoint`]): a bounded, ordered,
//!   de-duplicating in-memory mutation log per partition, read concurrently
//!   by the disk flusher (through the reserved persistence cursor) and by
//!   named replication cursors. It assigns strictly increasing
//!   bySeqno/CAS pairs, rotates checkpoints under an item-count policy,
//!   and collapses closed checkpoints once nobody references them.
//! - **The connection engine** ([`server`]): the binary-protocol front end
//!   over TCP and TLS — an explicit per-connection state machine driven by
//!   readiness events, scatter-gather send buffering, SASL authentication,
//!   X.509 client-certificate auth, and role-based privilege checks
//!   against a reloadable user catalog.
//!
//! The two meet in the [`engine`] module: commands accepted by a
//! connection queue items into the checkpoint manager, and the flusher
//! drains them to the [`engine::KvStore`] facade.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use tidemark::checkpoint::{CheckpointConfig, CheckpointManager, GenerateBySeqno, GenerateCas};
//! use tidemark::checkpoint::PERSISTENCE_CURSOR;
//! use tidemark::hlc::HybridClock;
//! use tidemark::item::{DocKey, Item};
//!
//! let manager = CheckpointManager::new(
//!     0,
//!     CheckpointConfig::default(),
//!     Arc::new(HybridClock::new()),
//!     0,
//!     0,
//!     0,
//! );
//!
//! let item = Item::mutation(DocKey::default_collection("doc"), 0, 1, "body");
//! manager.queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes).unwrap();
//!
//! let (range, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
//! assert_eq!(range.end, 1);
//! assert_eq!(items.len(), 2); // checkpoint_start + the mutation
//! ```
//!
//! ## Module Guide
//!
//! - [`item`] - Keys, namespaces, queue operations and immutable items
//! - [`hlc`] - The hybrid logical clock backing CAS generation
//! - [`checkpoint`] - Checkpoints, cursors and the per-partition manager
//! - [`protocol`] - Binary wire protocol framing and feature negotiation
//! - [`auth`] - RBAC privilege contexts and the SASL boundary
//! - [`engine`] - Bucket engine, storage facade and the flusher
//! - [`server`] - Connections, the state machine and the worker reactor
//! - [`settings`] - Process configuration
//! - [`telemetry`] - Tracing setup

pub mod auth;
pub mod checkpoint;
pub mod engine;
pub mod hlc;
pub mod item;
pub mod protocol;
pub mod server;
pub mod settings;
pub mod telemetry;
