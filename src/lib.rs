//! # docshard - Embedded Schemaless Document Store
//!
//! docshard stores arbitrary JSON documents in memory-mapped files, assigns
//! each a permanent numeric id, and maintains secondary hash indexes over
//! arbitrary attribute paths. Collections are sharded across a fixed number
//! of partitions so reads, writes and index maintenance proceed in parallel.
//!
//! ## Quick Start
//!
//! ```ignore
//! use docshard::Db;
//! use serde_json::json;
//!
//! let db = Db::open("./mydb")?;
//! db.create("feeds")?;
//! db.index("feeds", &["source"])?;
//!
//! let feeds = db.col("feeds").unwrap();
//! let id = feeds.insert(&json!({"source": "hn", "title": "..."}))?;
//! let doc = feeds.read(id)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │       Db  (directory, schema lifecycle)     │
//! ├─────────────────────────────────────────────┤
//! │   Col  (N-way sharding, secondary indexes)  │
//! ├─────────────────────────────────────────────┤
//! │  Partition  (doc file + id lookup + gate)   │
//! ├──────────────────────┬──────────────────────┤
//! │      Collection      │      HashTable       │
//! ├──────────────────────┴──────────────────────┤
//! │   DataFile  (mmap, watermark, auto-grow)    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! database_dir/
//! ├── data-config.json        # tuning parameters, fixed at creation
//! ├── number_of_partitions    # shard count, fixed at creation
//! └── feeds/                  # one directory per collection
//!     ├── dat_0 .. dat_N      # document data, one file per partition
//!     ├── id_0  .. id_N       # id -> offset lookup tables
//!     └── source/0 .. N       # hash tables of the index on ["source"]
//! ```
//!
//! ## Concurrency Model
//!
//! Blocking locks, acquired strictly downwards:
//!
//! 1. database schema lock (read for document traffic, write for lifecycle)
//! 2. partition data lock (write for mutation, read for reads)
//! 3. per-document update gate (taken only with the data lock released)
//! 4. per-hash-table locks (innermost, around single primitives)
//!
//! Operations on distinct documents are unordered; operations on one
//! document are serialized by its update gate. Index maintenance runs after
//! the data lock is dropped, so index readers may briefly see a document
//! under both its old and new indexed values.
//!
//! ## Durability
//!
//! Writes land in shared mmaps and reach disk on OS flush or close; there
//! is no write-ahead log. [`Db::scrub`] is the repair path: it rebuilds a
//! collection from its live documents, dropping tombstones and shedding
//! corrupt records.

pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod storage;

pub use config::Config;
pub use db::{Col, ColGuard, Db};
pub use error::StorageError;
