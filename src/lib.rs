//! High-throughput bulk data movement between delimited files and sharded
//! relational tables.
//!
//! Shardflow moves data in both directions through the same bounded
//! pipeline: pre-allocated event slots in a multi-producer/multi-consumer
//! ring, OS threads on both sides, and shared completion bookkeeping that
//! only declares a run finished when every producer is done *and* every
//! published batch has been drained.
//!
//! - **Export** ([`export`], [`merge`]): shard-parallel SELECT streaming
//!   into per-shard, line-capped, or fixed-count output files, with an
//!   optional globally ordered merge across shards.
//! - **Import** ([`reader`], [`import`]): cooperative block-claiming file
//!   readers framing delimited records, consumers issuing batched inserts,
//!   partition-routed inserts, dry runs, or primary-key UPDATE/DELETE.
//! - **Resume** ([`progress`], [`source`]): per-block in-flight ledgers
//!   plus a fingerprinted history file make insert-ignore imports
//!   restartable.
//!
//! The database itself stays behind the traits in [`db`]; wire protocols,
//! pools, and SQL dialects are the caller's concern. [`testing`] ships an
//! in-memory implementation for hermetic tests.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shardflow::{Command, Engine, ExportConfig};
//! use shardflow::testing::MemoryDb;
//!
//! let db = MemoryDb::new();
//! let engine = Engine::new(
//!     Arc::new(db.clone()),
//!     Arc::new(db.clone()),
//!     Arc::new(db.sql_builder()),
//! );
//! let report = engine.run(&Command::Export {
//!     tables: vec!["orders".into()],
//!     config: ExportConfig::new("/tmp/orders"),
//! });
//! assert!(report.is_success());
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod executor;
pub mod export;
pub mod format;
pub mod import;
pub mod merge;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod source;
pub mod sync;
pub mod testing;
pub mod transform;

pub use config::{
    Charset, DmlConfig, ExportConfig, FileSplitPolicy, ImportConfig, MergeMode, OrderSpec,
    QuoteMode,
};
pub use error::{Result, TransferError};
pub use executor::{Command, Engine, RunReport, TableOutcome, expand_patterns};
pub use transform::{BlockTransform, IdentityTransform};

#[cfg(feature = "compression-gzip")]
pub use transform::GzipTransform;
#[cfg(feature = "compression-zstd")]
pub use transform::ZstdTransform;
