//! # Database Layer
//!
//! A database is a directory: a config file, a partition-count file, and one
//! subdirectory per collection.
//!
//! ```text
//! <dbdir>/
//!   data-config.json          tuning parameters (fixed at creation)
//!   number_of_partitions      ASCII integer, fixed at creation
//!   <col>/                    one directory per collection
//! ```
//!
//! The partition count is chosen once (the host CPU count when the
//! database is first created) and never changes afterwards: every data file
//! and hash table is laid out per partition, so the number is part of the
//! on-disk format.
//!
//! ## Schema Lock
//!
//! One reader-writer lock guards the collection map. Document operations
//! hold it in read mode for as long as a [`Db::col`] handle lives; the
//! lifecycle operations here (create, drop, rename, truncate, scrub, dump,
//! index management) take it in write mode, so they observe no concurrent
//! document traffic.
//!
//! ## Scrub
//!
//! Scrubbing a collection rebuilds it from its live documents: a sibling
//! `scrub-<name>-<nanos>` directory is populated by re-inserting every
//! parseable document under its existing id, then swapped in place of the
//! original. This drops tombstones, reclaims oversize-update leftovers, and
//! silently sheds corrupt records.

mod col;
pub mod doc;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::StorageError;

pub use col::{Col, DOC_DATA_FILE, DOC_LOOKUP_FILE, INDEX_PATH_SEP};

/// Name of the partition-count file inside the database root.
pub const PART_NUM_FILE: &str = "number_of_partitions";

/// An embedded document database rooted at a directory.
pub struct Db {
    path: PathBuf,
    conf: Arc<Config>,
    num_parts: usize,
    cols: RwLock<HashMap<String, Col>>,
}

/// A collection handle; holds the schema lock in read mode for as long as
/// it lives.
pub type ColGuard<'a> = MappedRwLockReadGuard<'a, Col>;

impl Db {
    /// Open a database directory, creating it (and its config and partition
    /// count) if absent, and load every collection found inside.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        let conf = Arc::new(Config::load_or_create(&path)?);

        let part_num_path = path.join(PART_NUM_FILE);
        let num_parts_assumed = !part_num_path.exists();
        if num_parts_assumed {
            let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            fs::write(&part_num_path, cpus.to_string())
                .wrap_err_with(|| format!("failed to write '{}'", part_num_path.display()))?;
        } else {
            ensure!(
                part_num_path.is_file(),
                "'{}' is not a file; is the database path correct?",
                part_num_path.display()
            );
        }
        let num_parts: usize = fs::read_to_string(&part_num_path)
            .wrap_err_with(|| format!("failed to read '{}'", part_num_path.display()))?
            .trim()
            .parse()
            .wrap_err_with(|| format!("malformed partition count in '{}'", part_num_path.display()))?;

        let db = Db {
            path,
            conf,
            num_parts,
            cols: RwLock::new(HashMap::new()),
        };

        let mut cols = db.cols.write();
        for entry in fs::read_dir(&db.path)
            .wrap_err_with(|| format!("failed to scan '{}'", db.path.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // Collections found next to a freshly assumed partition count
            // mean the count file was lost; loading them under a guessed
            // count would shred their layout.
            ensure!(
                !num_parts_assumed,
                "found collections but '{}' had to be created; repair it manually",
                part_num_path.display()
            );
            let name = entry.file_name().to_string_lossy().into_owned();
            let col = Col::open(&db.path, &name, Arc::clone(&db.conf), db.num_parts)?;
            cols.insert(name, col);
        }
        drop(cols);

        info!(path = %db.path.display(), num_parts = db.num_parts, "database opened");
        Ok(db)
    }

    /// Number of partitions every collection in this database is sharded
    /// into.
    pub fn num_parts(&self) -> usize {
        self.num_parts
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a new collection.
    pub fn create(&self, name: &str) -> Result<()> {
        let mut cols = self.cols.write();
        self.create_locked(&mut cols, name)
    }

    fn create_locked(&self, cols: &mut HashMap<String, Col>, name: &str) -> Result<()> {
        if cols.contains_key(name) {
            bail!(StorageError::CollectionExists(name.to_string()));
        }
        let col = Col::open(&self.path, name, Arc::clone(&self.conf), self.num_parts)?;
        cols.insert(name.to_string(), col);
        Ok(())
    }

    /// Return a handle to a collection, or `None` when it does not exist.
    /// The handle keeps the schema lock in read mode while it lives; drop it
    /// before calling any lifecycle operation from the same thread.
    pub fn col(&self, name: &str) -> Option<ColGuard<'_>> {
        RwLockReadGuard::try_map(self.cols.read(), |cols| cols.get(name)).ok()
    }

    /// Return a handle to a collection, creating the collection first if it
    /// does not exist.
    pub fn force_col(&self, name: &str) -> Result<ColGuard<'_>> {
        if let Some(col) = self.col(name) {
            return Ok(col);
        }
        let mut cols = self.cols.write();
        if !cols.contains_key(name) {
            self.create_locked(&mut cols, name)?;
        }
        let cols = RwLockWriteGuard::downgrade(cols);
        Ok(RwLockReadGuard::map(cols, |cols| {
            &cols[name] // INVARIANT: inserted above under the same guard
        }))
    }

    /// True when the collection exists.
    pub fn col_exists(&self, name: &str) -> bool {
        self.cols.read().contains_key(name)
    }

    /// All collection names.
    pub fn all_cols(&self) -> Vec<String> {
        self.cols.read().keys().cloned().collect()
    }

    /// Rename a collection.
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut cols = self.cols.write();
        if !cols.contains_key(old_name) {
            bail!(StorageError::CollectionMissing(old_name.to_string()));
        }
        if cols.contains_key(new_name) {
            bail!(StorageError::CollectionExists(new_name.to_string()));
        }
        let col = cols.remove(old_name).expect("checked above");
        col.close()?;
        fs::rename(self.path.join(old_name), self.path.join(new_name))
            .wrap_err_with(|| format!("failed to rename collection '{old_name}'"))?;
        let col = Col::open(&self.path, new_name, Arc::clone(&self.conf), self.num_parts)?;
        cols.insert(new_name.to_string(), col);
        Ok(())
    }

    /// Delete every document in a collection, keeping its indexes defined.
    pub fn truncate(&self, name: &str) -> Result<()> {
        let cols = self.cols.write();
        let Some(col) = cols.get(name) else {
            bail!(StorageError::CollectionMissing(name.to_string()));
        };
        col.truncate()
    }

    /// Drop a collection, losing its documents and indexes.
    pub fn drop_col(&self, name: &str) -> Result<()> {
        let mut cols = self.cols.write();
        let Some(col) = cols.remove(name) else {
            bail!(StorageError::CollectionMissing(name.to_string()));
        };
        col.close()?;
        fs::remove_dir_all(self.path.join(name))
            .wrap_err_with(|| format!("failed to remove collection '{name}'"))?;
        Ok(())
    }

    /// Create a secondary index on an attribute path of a collection, and
    /// index every existing document.
    pub fn index(&self, name: &str, idx_path: &[&str]) -> Result<()> {
        let mut cols = self.cols.write();
        let Some(col) = cols.get_mut(name) else {
            bail!(StorageError::CollectionMissing(name.to_string()));
        };
        col.index(idx_path)
    }

    /// Drop a secondary index of a collection.
    pub fn unindex(&self, name: &str, idx_path: &[&str]) -> Result<()> {
        let mut cols = self.cols.write();
        let Some(col) = cols.get_mut(name) else {
            bail!(StorageError::CollectionMissing(name.to_string()));
        };
        col.unindex(idx_path)
    }

    /// Rebuild a collection from its live documents: de-fragment free
    /// space, drop tombstones, and shed corrupt records.
    pub fn scrub(&self, name: &str) -> Result<()> {
        let mut cols = self.cols.write();
        if !cols.contains_key(name) {
            bail!(StorageError::CollectionMissing(name.to_string()));
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos();
        let tmp_name = format!("scrub-{name}-{nanos}");
        let tmp_dir = self.path.join(&tmp_name);
        fs::create_dir_all(&tmp_dir)
            .wrap_err_with(|| format!("failed to create '{}'", tmp_dir.display()))?;

        // Mirror the index directories so the temporary collection opens
        // with the same indexes defined.
        for idx_name in cols[name].index_names() {
            fs::create_dir_all(tmp_dir.join(idx_name))?;
        }

        let tmp_col = Col::open(&self.path, &tmp_name, Arc::clone(&self.conf), self.num_parts)?;
        let mut copied = 0usize;
        let mut skipped = 0usize;
        cols[name].for_each_doc(|id, data| {
            match serde_json::from_slice::<Value>(data) {
                Ok(doc) => {
                    if let Err(err) = tmp_col.insert_recovery(id, &doc) {
                        warn!(collection = name, id, %err, "scrub failed to re-insert document");
                    } else {
                        copied += 1;
                    }
                }
                Err(_) => skipped += 1, // corrupted document, shed it
            }
            true
        });
        tmp_col.close()?;

        let col = cols.remove(name).expect("checked above");
        if let Err(err) = col.close() {
            warn!(collection = name, %err, "error closing collection during scrub");
        }
        fs::remove_dir_all(self.path.join(name))
            .wrap_err_with(|| format!("failed to remove old collection '{name}'"))?;
        fs::rename(&tmp_dir, self.path.join(name))
            .wrap_err_with(|| format!("failed to swap scrubbed collection '{name}'"))?;
        let col = Col::open(&self.path, name, Arc::clone(&self.conf), self.num_parts)?;
        cols.insert(name.to_string(), col);

        info!(collection = name, copied, skipped, "scrub finished");
        Ok(())
    }

    /// Copy the entire database directory tree into `dest` (for backup).
    /// Fails if any destination file already exists.
    pub fn dump<P: AsRef<Path>>(&self, dest: P) -> Result<()> {
        let _cols = self.cols.write(); // quiesce all traffic while copying
        copy_tree(&self.path, dest.as_ref())
    }

    /// Flush and close every collection. The database directory can be
    /// reopened afterwards.
    pub fn close(self) -> Result<()> {
        let cols = self.cols.into_inner();
        for (_, col) in cols {
            col.close()?;
        }
        Ok(())
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .wrap_err_with(|| format!("failed to create '{}'", dest.display()))?;
    for entry in
        fs::read_dir(src).wrap_err_with(|| format!("failed to scan '{}'", src.display()))?
    {
        let entry = entry?;
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &to)?;
        } else {
            ensure!(!to.exists(), "destination file '{}' already exists", to.display());
            fs::copy(entry.path(), &to)
                .wrap_err_with(|| format!("failed to copy '{}'", to.display()))?;
        }
    }
    Ok(())
}
