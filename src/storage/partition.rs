//! # Collection Partition
//!
//! A partition pairs a document collection file with a lookup hash table so
//! a document can be addressed by an unchanging id: the table stores the
//! permanent id as entry key and the physical record offset as entry value.
//! When an update relocates a record, only the lookup entry changes; the id
//! the caller holds stays valid forever.
//!
//! ## Locking
//!
//! The two files share one data lock ([`Partition::store`]); callers take it
//! for reading or writing around each operation. Independently, a partition
//! hands out an exclusive per-document *update gate*
//! ([`Partition::lock_update`]) that serializes index maintenance for one
//! document without holding the data lock, so re-indexing document X never
//! blocks reads or writes of document Y in the same partition.
//!
//! The gate is a rendezvous: the holder parks a slot in a registry keyed by
//! document id, and releasing closes the slot, waking every waiter to
//! re-contend. Progress is guaranteed (a close wakes all waiters and exactly
//! one re-registration wins); fairness is not.

use std::path::Path;
use std::sync::Arc;

use eyre::{bail, Result, WrapErr};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::Config;
use crate::error::StorageError;
use crate::storage::{Collection, HashTable};

/// Probe granularity for [`PartitionStore::approx_doc_count`]. Larger means
/// cheaper and less accurate.
const APPROX_PROBE_PARTS: usize = 24;

/// Rendezvous slot for the per-document update gate.
#[derive(Default)]
struct UpdateSlot {
    closed: Mutex<bool>,
    cond: Condvar,
}

impl UpdateSlot {
    fn wait(&self) {
        let mut closed = self.closed.lock();
        while !*closed {
            self.cond.wait(&mut closed);
        }
    }

    fn close(&self) {
        *self.closed.lock() = true;
        self.cond.notify_all();
    }
}

/// The two data files of a partition, guarded together by one lock.
#[derive(Debug)]
pub struct PartitionStore {
    col: Collection,
    lookup: HashTable,
}

/// One shard of a logical collection: a document file, its id lookup table,
/// and the per-document update gate registry.
pub struct Partition {
    store: RwLock<PartitionStore>,
    excl_update: Mutex<HashMap<u64, Arc<UpdateSlot>>>,
}

impl Partition {
    /// Open the partition's two files, creating them if absent.
    pub fn open<P: AsRef<Path>>(
        col_path: P,
        lookup_path: P,
        conf: Arc<Config>,
    ) -> Result<Partition> {
        let col = Collection::open(col_path, Arc::clone(&conf))?;
        let lookup = HashTable::open(lookup_path, conf)?;
        Ok(Partition {
            store: RwLock::new(PartitionStore { col, lookup }),
            excl_update: Mutex::new(HashMap::new()),
        })
    }

    /// The partition data lock. Take it for writing around any mutation of
    /// the document file or lookup table, for reading around pure reads.
    pub fn store(&self) -> &RwLock<PartitionStore> {
        &self.store
    }

    /// Acquire the exclusive update gate for a document id, blocking while
    /// another holder has it. Must not be called while holding the data
    /// lock.
    pub fn lock_update(&self, id: u64) {
        loop {
            let mut gates = self.excl_update.lock();
            match gates.entry(id) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(UpdateSlot::default()));
                    return;
                }
                Entry::Occupied(occupied) => {
                    let slot = Arc::clone(occupied.get());
                    drop(gates);
                    // Wait for the holder to close the slot, then re-contend.
                    slot.wait();
                }
            }
        }
    }

    /// Release the update gate, waking every waiter to re-contend.
    pub fn unlock_update(&self, id: u64) {
        let slot = self.excl_update.lock().remove(&id);
        if let Some(slot) = slot {
            slot.close();
        }
    }

    /// Consume the partition, flushing and closing both files.
    pub fn close(self) -> Result<()> {
        let store = self.store.into_inner();
        store.col.close().wrap_err("failed to close document file")?;
        store.lookup.close().wrap_err("failed to close lookup table")
    }
}

impl PartitionStore {
    /// Insert a document under the given permanent id, returning its
    /// physical offset.
    pub fn insert(&mut self, id: u64, data: &[u8]) -> Result<usize> {
        let phys_id = self.col.insert(data)?;
        self.lookup.put(id, phys_id as u64)?;
        Ok(phys_id)
    }

    /// Find and retrieve a document by its permanent id.
    pub fn read(&self, id: u64) -> Result<Vec<u8>> {
        let phys_id = self.lookup.get(id, 1);
        let Some(&phys_id) = phys_id.first() else {
            bail!(StorageError::NoDoc(id));
        };
        match self.col.read(phys_id as usize) {
            Some(data) => Ok(data),
            None => bail!(StorageError::NoDoc(id)),
        }
    }

    /// Overwrite a document; when the new payload does not fit its reserved
    /// room the record moves and the lookup entry is rewritten.
    pub fn update(&mut self, id: u64, data: &[u8]) -> Result<()> {
        let phys_id = self.lookup.get(id, 1);
        let Some(&phys_id) = phys_id.first() else {
            bail!(StorageError::NoDoc(id));
        };
        let new_id = self.col.update(phys_id as usize, data)?;
        if new_id != phys_id as usize {
            self.lookup.remove(id, phys_id);
            self.lookup.put(id, new_id as u64)?;
        }
        Ok(())
    }

    /// Tombstone a document and drop its lookup entry.
    pub fn delete(&mut self, id: u64) -> Result<()> {
        let phys_id = self.lookup.get(id, 1);
        let Some(&phys_id) = phys_id.first() else {
            bail!(StorageError::NoDoc(id));
        };
        // The lookup entry goes away even when the record itself already
        // fails validation; a scrub reconciles the rest.
        let _ = self.col.delete(phys_id as usize);
        self.lookup.remove(id, phys_id);
        Ok(())
    }

    /// Run `fun` over every readable document whose lookup entry falls in
    /// the chosen slice of the id space; stop early when it returns false.
    pub fn for_each_doc<F>(&self, part_num: usize, total_parts: usize, fun: &mut F) -> bool
    where
        F: FnMut(u64, &[u8]) -> bool,
    {
        let (ids, phys_ids) = self.lookup.get_partition(part_num, total_parts);
        for (&id, &phys_id) in ids.iter().zip(phys_ids.iter()) {
            if let Some(data) = self.col.read(phys_id as usize) {
                if !fun(id, &data) {
                    return false;
                }
            }
        }
        true
    }

    /// Cheap, bounded-work estimate of the number of documents. Probes one
    /// slice of the lookup table and scales up, widening the slice until it
    /// catches something or the table is plainly empty.
    pub fn approx_doc_count(&self) -> usize {
        let mut total_parts = APPROX_PROBE_PARTS;
        loop {
            let (keys, _) = self.lookup.get_partition(0, total_parts);
            if keys.is_empty() {
                if total_parts < 8 {
                    return 0;
                }
                total_parts /= 2;
            } else {
                return keys.len() * total_parts;
            }
        }
    }

    /// Clear both files back to their initial size.
    pub fn clear(&mut self) -> Result<()> {
        self.col
            .clear()
            .wrap_err("failed to clear document file")?;
        self.lookup.clear().wrap_err("failed to clear lookup table")
    }

    /// Flush both files.
    pub fn sync(&self) -> Result<()> {
        self.col.sync()?;
        self.lookup.sync()
    }

    /// Direct access to the document log (diagnostics and tests).
    pub fn collection(&self) -> &Collection {
        &self.col
    }

    /// Physical offsets currently recorded for an id.
    pub fn lookup_offsets(&self, id: u64) -> Vec<u64> {
        self.lookup.get(id, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn small_conf() -> Arc<Config> {
        let mut conf = Config {
            col_file_growth: 4096,
            ht_file_growth: 4096,
            per_bucket: 4,
            hash_bits: 4,
            doc_max_room: 1024,
            ..Config::default()
        };
        conf.calculate_derived();
        Arc::new(conf)
    }

    fn open_part(dir: &Path) -> Partition {
        Partition::open(dir.join("dat_0"), dir.join("id_0"), small_conf()).unwrap()
    }

    #[test]
    fn insert_read_update_delete_by_permanent_id() {
        let dir = tempdir().unwrap();
        let part = open_part(dir.path());
        let mut store = part.store().write();

        store.insert(12345, b"{\"a\":1}").unwrap();
        assert_eq!(&store.read(12345).unwrap()[..7], b"{\"a\":1}");

        store.update(12345, b"{\"a\":2}").unwrap();
        assert_eq!(&store.read(12345).unwrap()[..7], b"{\"a\":2}");

        store.delete(12345).unwrap();
        let err = store.read(12345).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::NoDoc(12345))
        );
    }

    #[test]
    fn small_update_keeps_the_physical_offset() {
        let dir = tempdir().unwrap();
        let part = open_part(dir.path());
        let mut store = part.store().write();

        store
            .insert(7, b"{\"title\":\"long-title-xxxxxxxxxxxxxx\"}")
            .unwrap();
        let before = store.lookup_offsets(7);
        store.update(7, b"{\"t\":\"x\"}").unwrap();
        assert_eq!(store.lookup_offsets(7), before);
        assert_eq!(&store.read(7).unwrap()[..9], b"{\"t\":\"x\"}");
    }

    #[test]
    fn oversize_update_moves_the_document_and_tombstones_the_old_offset() {
        let dir = tempdir().unwrap();
        let part = open_part(dir.path());
        let mut store = part.store().write();

        store.insert(8, b"{\"x\":\"a\"}").unwrap();
        let before = store.lookup_offsets(8);
        let bigger = format!("{{\"x\":\"{}\"}}", "a".repeat(40));
        store.update(8, bigger.as_bytes()).unwrap();

        let after = store.lookup_offsets(8);
        assert_ne!(after, before);
        assert!(
            store.collection().read(before[0] as usize).is_none(),
            "old record is tombstoned"
        );
        assert_eq!(&store.read(8).unwrap()[..bigger.len()], bigger.as_bytes());
    }

    #[test]
    fn reads_of_unknown_ids_fail_with_no_doc() {
        let dir = tempdir().unwrap();
        let part = open_part(dir.path());
        let store = part.store().read();
        assert!(store.read(999).is_err());
    }

    #[test]
    fn approx_doc_count_is_zero_on_empty_and_positive_after_inserts() {
        let dir = tempdir().unwrap();
        let part = open_part(dir.path());
        let mut store = part.store().write();

        assert_eq!(store.approx_doc_count(), 0);
        for id in 0..50u64 {
            store.insert(id, b"{}").unwrap();
        }
        assert!(store.approx_doc_count() > 0);
    }

    #[test]
    fn for_each_doc_covers_all_partitions_of_the_id_space() {
        let dir = tempdir().unwrap();
        let part = open_part(dir.path());
        let mut store = part.store().write();

        for id in 0..30u64 {
            store.insert(id, format!("{{\"n\":{}}}", id).as_bytes()).unwrap();
        }
        let mut seen = Vec::new();
        for part_num in 0..4 {
            store.for_each_doc(part_num, 4, &mut |id, _| {
                seen.push(id);
                true
            });
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..30u64).collect::<Vec<_>>());
    }

    #[test]
    fn clear_empties_the_partition() {
        let dir = tempdir().unwrap();
        let part = open_part(dir.path());
        let mut store = part.store().write();

        for id in 0..10u64 {
            store.insert(id, b"{}").unwrap();
        }
        store.clear().unwrap();
        assert!(store.read(3).is_err());
        assert_eq!(store.approx_doc_count(), 0);
    }

    #[test]
    fn update_gate_is_exclusive_per_id() {
        let dir = tempdir().unwrap();
        let part = Arc::new(open_part(dir.path()));
        let in_section = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let part = Arc::clone(&part);
            let in_section = Arc::clone(&in_section);
            let entries = Arc::clone(&entries);
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    part.lock_update(42);
                    assert!(
                        !in_section.swap(true, Ordering::SeqCst),
                        "two holders inside the gate"
                    );
                    thread::sleep(Duration::from_micros(50));
                    in_section.store(false, Ordering::SeqCst);
                    entries.fetch_add(1, Ordering::SeqCst);
                    part.unlock_update(42);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 160);
        assert!(part.excl_update.lock().is_empty(), "registry drained");
    }

    #[test]
    fn update_gates_on_distinct_ids_do_not_block_each_other() {
        let dir = tempdir().unwrap();
        let part = Arc::new(open_part(dir.path()));

        part.lock_update(1);
        let other = Arc::clone(&part);
        let done = thread::spawn(move || {
            other.lock_update(2);
            other.unlock_update(2);
        });
        done.join().unwrap();
        part.unlock_update(1);
    }
}
