//! # Sharded Collection
//!
//! A logical collection fans its documents out over N partitions, fixed for
//! the life of the database. A document's home partition is `id mod N`; an
//! indexed value's home partition is `str_hash(value) mod N`, so both the
//! documents and every secondary index are spread independently across the
//! same N shards.
//!
//! ## On-Disk Layout
//!
//! ```text
//! <dbdir>/<col>/
//!   dat_<k>        document data file of partition k
//!   id_<k>         id -> offset lookup table of partition k
//!   <a>!<b>/<k>    hash table of the index on path ["a","b"], partition k
//! ```
//!
//! ## Lock Order
//!
//! Every operation here runs under the database schema lock (read mode for
//! document operations, write mode for index management; the `Db` layer
//! enforces that). Within it: partition data lock, then the per-document
//! update gate (only after the data lock is released), then individual
//! index-table locks. Index maintenance deliberately happens after the data
//! lock is dropped, so a reader may briefly observe both the old and the new
//! indexed value of a document mid-update.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::db::doc::{get_in, index_str, str_hash};
use crate::error::StorageError;
use crate::storage::{HashTable, Partition};

/// Prefix of a partition's document data file.
pub const DOC_DATA_FILE: &str = "dat_";
/// Prefix of a partition's id lookup file.
pub const DOC_LOOKUP_FILE: &str = "id_";
/// Separator joining index path components into a directory name.
pub const INDEX_PATH_SEP: &str = "!";

/// Document ids are 63-bit non-negative integers.
const ID_MASK: u64 = i64::MAX as u64;

/// Aim for roughly this many documents per sub-partition when iterating a
/// whole collection.
const DOCS_PER_ITERATION: usize = 4000;

/// A collection of documents sharded over fixed partitions, with secondary
/// index maintenance.
pub struct Col {
    name: String,
    dir: PathBuf,
    conf: Arc<Config>,
    num_parts: usize,
    parts: Vec<Partition>,
    hts: Vec<HashMap<String, RwLock<HashTable>>>,
    index_paths: HashMap<String, Vec<String>>,
}

impl Col {
    /// Open a collection directory, its partitions, and every index found
    /// in it.
    pub(crate) fn open(
        db_path: &Path,
        name: &str,
        conf: Arc<Config>,
        num_parts: usize,
    ) -> Result<Col> {
        let dir = db_path.join(name);
        fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create collection directory '{}'", dir.display()))?;

        let mut parts = Vec::with_capacity(num_parts);
        let mut hts: Vec<HashMap<String, RwLock<HashTable>>> = Vec::with_capacity(num_parts);
        for i in 0..num_parts {
            parts.push(Partition::open(
                dir.join(format!("{DOC_DATA_FILE}{i}")),
                dir.join(format!("{DOC_LOOKUP_FILE}{i}")),
                Arc::clone(&conf),
            )?);
            hts.push(HashMap::new());
        }

        let mut col = Col {
            name: name.to_string(),
            dir,
            conf,
            num_parts,
            parts,
            hts,
            index_paths: HashMap::new(),
        };

        // Every subdirectory is an index.
        let entries = fs::read_dir(&col.dir)
            .wrap_err_with(|| format!("failed to scan '{}'", col.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let idx_name = entry.file_name().to_string_lossy().into_owned();
            let idx_path: Vec<String> =
                idx_name.split(INDEX_PATH_SEP).map(str::to_string).collect();
            for i in 0..col.num_parts {
                let ht = HashTable::open(
                    col.dir.join(&idx_name).join(i.to_string()),
                    Arc::clone(&col.conf),
                )?;
                col.hts[i].insert(idx_name.clone(), RwLock::new(ht));
            }
            col.index_paths.insert(idx_name, idx_path);
        }
        Ok(col)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn part_for(&self, id: u64) -> &Partition {
        &self.parts[(id % self.num_parts as u64) as usize]
    }

    /// Add one document's values to every index.
    fn index_doc(&self, id: u64, doc: &Value) -> Result<()> {
        for (idx_name, idx_path) in &self.index_paths {
            for idx_val in get_in(doc, idx_path) {
                if idx_val.is_null() {
                    continue;
                }
                let hash_key = str_hash(&index_str(idx_val));
                let part_num = (hash_key % self.num_parts as u64) as usize;
                self.hts[part_num][idx_name].write().put(hash_key, id)?;
            }
        }
        Ok(())
    }

    /// Remove one document's values from every index.
    fn unindex_doc(&self, id: u64, doc: &Value) {
        for (idx_name, idx_path) in &self.index_paths {
            for idx_val in get_in(doc, idx_path) {
                if idx_val.is_null() {
                    continue;
                }
                let hash_key = str_hash(&index_str(idx_val));
                let part_num = (hash_key % self.num_parts as u64) as usize;
                self.hts[part_num][idx_name].write().remove(hash_key, id);
            }
        }
    }

    /// Insert a document, returning its newly assigned permanent id.
    pub fn insert(&self, doc: &Value) -> Result<u64> {
        let data = serde_json::to_vec(doc)?;
        let id = rand::random::<u64>() & ID_MASK;
        let part = self.part_for(id);
        part.store().write().insert(id, &data)?;

        part.lock_update(id);
        let indexed = self.index_doc(id, doc);
        part.unlock_update(id);
        indexed?;
        Ok(id)
    }

    /// Insert a document under a caller-supplied id, bypassing id
    /// generation. Used by the scrub path; callers hold the schema write
    /// lock, so no update gate is taken.
    pub(crate) fn insert_recovery(&self, id: u64, doc: &Value) -> Result<()> {
        let data = serde_json::to_vec(doc)?;
        self.part_for(id).store().write().insert(id, &data)?;
        self.index_doc(id, doc)
    }

    /// Find and retrieve a document by id.
    pub fn read(&self, id: u64) -> Result<Value> {
        let data = self.part_for(id).store().read().read(id)?;
        serde_json::from_slice(&data)
            .wrap_err_with(|| format!("document {id} holds malformed payload"))
    }

    /// Overwrite a document and swap its index entries.
    pub fn update(&self, id: u64, doc: &Value) -> Result<()> {
        let data = serde_json::to_vec(doc)?;
        let part = self.part_for(id);

        let original = {
            let mut store = part.store().write();
            let original = store.read(id)?;
            store.update(id, &data)?;
            original
        };

        part.lock_update(id);
        match serde_json::from_slice::<Value>(&original) {
            Ok(original) => self.unindex_doc(id, &original),
            Err(_) => warn!(id, "not unindexing malformed original during update"),
        }
        let indexed = self.index_doc(id, doc);
        part.unlock_update(id);
        indexed
    }

    /// Read a document, derive its replacement with `update`, write the
    /// replacement back and swap index entries, all against a consistent
    /// original.
    pub fn update_with<F>(&self, id: u64, update: F) -> Result<Value>
    where
        F: FnOnce(&Value) -> Result<Value>,
    {
        let part = self.part_for(id);

        let (original, doc) = {
            let mut store = part.store().write();
            let original: Value = serde_json::from_slice(&store.read(id)?)
                .wrap_err_with(|| format!("document {id} holds malformed payload"))?;
            let doc = update(&original)?;
            let data = serde_json::to_vec(&doc)?;
            store.update(id, &data)?;
            (original, doc)
        };

        part.lock_update(id);
        self.unindex_doc(id, &original);
        let indexed = self.index_doc(id, &doc);
        part.unlock_update(id);
        indexed?;
        Ok(doc)
    }

    /// Delete a document and drop its index entries.
    pub fn delete(&self, id: u64) -> Result<()> {
        let part = self.part_for(id);

        let original = {
            let mut store = part.store().write();
            let original = store.read(id)?;
            store.delete(id)?;
            original
        };

        match serde_json::from_slice::<Value>(&original) {
            Ok(original) => {
                part.lock_update(id);
                self.unindex_doc(id, &original);
                part.unlock_update(id);
            }
            Err(_) => warn!(id, "not unindexing malformed document during delete"),
        }
        Ok(())
    }

    /// Create a secondary index on the path and index every existing
    /// document. Callers hold the schema write lock.
    pub(crate) fn index(&mut self, idx_path: &[&str]) -> Result<()> {
        let idx_name = idx_path.join(INDEX_PATH_SEP);
        if self.index_paths.contains_key(&idx_name) {
            bail!(StorageError::IndexExists(idx_name));
        }
        let idx_dir = self.dir.join(&idx_name);
        fs::create_dir_all(&idx_dir)
            .wrap_err_with(|| format!("failed to create index directory '{}'", idx_dir.display()))?;
        for i in 0..self.num_parts {
            let ht = HashTable::open(idx_dir.join(i.to_string()), Arc::clone(&self.conf))?;
            self.hts[i].insert(idx_name.clone(), RwLock::new(ht));
        }
        self.index_paths
            .insert(idx_name.clone(), idx_path.iter().map(|s| s.to_string()).collect());

        // Put every existing document on the new index.
        let path = self.index_paths[&idx_name].clone();
        self.for_each_doc(|id, data| {
            let Ok(doc) = serde_json::from_slice::<Value>(data) else {
                return true; // skip corrupted document
            };
            for idx_val in get_in(&doc, &path) {
                if idx_val.is_null() {
                    continue;
                }
                let hash_key = str_hash(&index_str(idx_val));
                let part_num = (hash_key % self.num_parts as u64) as usize;
                if let Err(err) = self.hts[part_num][&idx_name].write().put(hash_key, id) {
                    warn!(id, %err, "failed to index document");
                }
            }
            true
        });
        Ok(())
    }

    /// Drop a secondary index: close its hash tables and remove its
    /// directory. Callers hold the schema write lock.
    pub(crate) fn unindex(&mut self, idx_path: &[&str]) -> Result<()> {
        let idx_name = idx_path.join(INDEX_PATH_SEP);
        if !self.index_paths.contains_key(&idx_name) {
            bail!(StorageError::IndexMissing(idx_name));
        }
        self.index_paths.remove(&idx_name);
        for part_hts in &mut self.hts {
            if let Some(ht) = part_hts.remove(&idx_name) {
                ht.into_inner().close()?;
            }
        }
        let idx_dir = self.dir.join(&idx_name);
        fs::remove_dir_all(&idx_dir)
            .wrap_err_with(|| format!("failed to remove index directory '{}'", idx_dir.display()))?;
        Ok(())
    }

    /// All indexed paths, as copies.
    pub fn all_indexes(&self) -> Vec<Vec<String>> {
        self.index_paths.values().cloned().collect()
    }

    pub(crate) fn index_names(&self) -> Vec<String> {
        self.index_paths.keys().cloned().collect()
    }

    /// Equality lookup against a secondary index: the ids of up to `limit`
    /// documents indexed under `value` at the path (0 means all). This is
    /// the primitive a query layer resolves equality predicates with; note
    /// that distinct values may collide into the same integer key, so
    /// callers are expected to re-check the documents they fetch.
    pub fn index_scan(&self, idx_path: &[&str], value: &Value, limit: usize) -> Result<Vec<u64>> {
        let idx_name = idx_path.join(INDEX_PATH_SEP);
        if !self.index_paths.contains_key(&idx_name) {
            bail!(StorageError::IndexMissing(idx_name));
        }
        let hash_key = str_hash(&index_str(value));
        let part_num = (hash_key % self.num_parts as u64) as usize;
        Ok(self.hts[part_num][&idx_name].read().get(hash_key, limit))
    }

    /// Run `fun` over every document; stop early when it returns false.
    /// Work is divided so each pass over a partition covers roughly
    /// [`DOCS_PER_ITERATION`] documents.
    pub fn for_each_doc<F>(&self, mut fun: F)
    where
        F: FnMut(u64, &[u8]) -> bool,
    {
        let mut part_div = self.approx_doc_count() / self.num_parts / DOCS_PER_ITERATION;
        if part_div == 0 {
            part_div = 1;
        }
        for part in &self.parts {
            let store = part.store().read();
            for i in 0..part_div {
                if !store.for_each_doc(i, part_div, &mut fun) {
                    return;
                }
            }
        }
    }

    /// Run `fun` over the documents of one page of the id space in every
    /// partition.
    pub fn for_each_doc_in_page<F>(&self, page: usize, total: usize, mut fun: F)
    where
        F: FnMut(u64, &[u8]) -> bool,
    {
        for part in &self.parts {
            let store = part.store().read();
            if !store.for_each_doc(page, total, &mut fun) {
                return;
            }
        }
    }

    /// Approximate number of documents in the collection.
    pub fn approx_doc_count(&self) -> usize {
        self.parts
            .iter()
            .map(|part| part.store().read().approx_doc_count())
            .sum()
    }

    /// Total in-use bytes across the partitions' document files. Grows with
    /// every insert and oversize update; only a scrub shrinks it.
    pub fn used_data_bytes(&self) -> usize {
        self.parts
            .iter()
            .map(|part| part.store().read().collection().used())
            .sum()
    }

    /// Clear every partition and index back to its initial size. Callers
    /// hold the schema write lock.
    pub(crate) fn truncate(&self) -> Result<()> {
        for (i, part) in self.parts.iter().enumerate() {
            part.store().write().clear()?;
            for ht in self.hts[i].values() {
                ht.write().clear()?;
            }
        }
        Ok(())
    }

    /// Consume the collection, flushing and closing every file.
    pub(crate) fn close(self) -> Result<()> {
        for (part, part_hts) in self.parts.into_iter().zip(self.hts) {
            part.close()?;
            for (_, ht) in part_hts {
                ht.into_inner().close()?;
            }
        }
        Ok(())
    }

    /// Flush every file without closing.
    pub fn sync(&self) -> Result<()> {
        for (i, part) in self.parts.iter().enumerate() {
            part.store().read().sync()?;
            for ht in self.hts[i].values() {
                ht.read().sync()?;
            }
        }
        Ok(())
    }
}
