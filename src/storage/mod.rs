//! # Storage Module
//!
//! The foundational storage layer: memory-mapped data files and the two
//! structures layered on top of them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Partition                    │
//! │  document log + id lookup + update gate      │
//! ├──────────────────────┬───────────────────────┤
//! │      Collection      │       HashTable       │
//! │  header-tagged docs  │  chained hash buckets │
//! ├──────────────────────┴───────────────────────┤
//! │                  DataFile                    │
//! │  mmap buffer, append watermark, auto-grow    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A [`DataFile`] is a flat byte buffer backed by a memory-mapped file with
//! an in-use watermark that is reconstructed by bisection on open. A
//! [`Collection`] appends variable-length document records to one; a
//! [`HashTable`] divides one into fixed-size buckets of integer entries. A
//! [`Partition`] pairs a collection with the hash table that maps permanent
//! document ids to physical record offsets, and adds the per-document
//! exclusive update gate.
//!
//! ## Durability Model
//!
//! Writes land in the shared mmap and reach disk when the OS flushes dirty
//! pages, or explicitly on close/sync. There is no write-ahead log; the
//! repair path for an unclean shutdown is a collection scrub at the database
//! layer.

mod collection;
mod data_file;
mod hashtable;
mod partition;

pub use collection::Collection;
pub use data_file::DataFile;
pub use hashtable::HashTable;
pub use partition::{Partition, PartitionStore};
