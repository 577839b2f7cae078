//! # Static Hash Table File
//!
//! A hash table file is an array of fixed-size buckets holding integer
//! entries:
//!
//! ```text
//! bucket:  +-------------+--------+--------+ ... +--------+
//!          | next bucket | entry0 | entry1 |     | entryN |
//!          0------------10---------------------------------
//!
//! entry:   +------+-----+-------+
//!          | flag | key | value |
//!          0------1----11------21
//! ```
//!
//! Buckets `[0, initial_buckets)` are *head* buckets, addressed directly by
//! the integer smear hash. When a head bucket (or its descendants) fills up,
//! an *overflow* bucket is appended at the file tail and linked through the
//! `next` field, so every head bucket roots a chain. A chain walk ends at a
//! zero `next` link or at an entry slot whose flag, key and value are all
//! zero (never-written space).
//!
//! An entry key may carry multiple values; the `(key, value)` combination is
//! what must stay unique, and it is the *caller's* contract to uphold:
//! [`HashTable::put`] happily appends duplicates.
//!
//! ## Chain Validation
//!
//! A `next` link is only honored when it points strictly forward into the
//! overflow region and inside the file. Anything else is treated as
//! end-of-chain and reported once per table handle, which bounds every walk
//! and makes cycles impossible. A scrub at the database layer is the repair
//! path.
//!
//! ## Reconstruction
//!
//! The in-use watermark of a hash table file cannot be bisected back
//! directly, because a tail of empty pre-allocated buckets is
//! indistinguishable from unused space. Instead, reopening walks every head
//! chain to its terminus and takes the highest linked bucket as the last
//! in-use one.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;
use tracing::{debug, error};

use crate::config::{Config, BUCKET_HEADER, ENTRY_SIZE};
use crate::encoding::{decode_varint, encode_varint, VARINT_SLOT};
use crate::storage::DataFile;

/// Static hash table with chained overflow buckets, layered on a
/// [`DataFile`].
#[derive(Debug)]
pub struct HashTable {
    file: DataFile,
    conf: Arc<Config>,
    num_buckets: usize,
    corrupt_logged: AtomicBool,
}

impl HashTable {
    /// Open a hash table file, creating it if absent, and reconstruct its
    /// bucket count.
    pub fn open<P: AsRef<Path>>(path: P, conf: Arc<Config>) -> Result<HashTable> {
        let file = DataFile::open(path, conf.ht_file_growth)?;
        let mut ht = HashTable {
            file,
            conf,
            num_buckets: 0,
            corrupt_logged: AtomicBool::new(false),
        };
        ht.calculate_num_buckets()?;
        Ok(ht)
    }

    /// Follow the longest bucket chain to find the total number of buckets,
    /// and hence the in-use size of the file.
    fn calculate_num_buckets(&mut self) -> Result<()> {
        self.num_buckets = self.file.size / self.conf.bucket_size;

        let head_region = self.conf.initial_buckets * self.conf.bucket_size;
        self.file.prefetch(0, head_region);

        let mut largest = self.conf.initial_buckets - 1;
        for head in 0..self.conf.initial_buckets {
            let last = self.last_bucket(head);
            if last > largest && last < self.num_buckets {
                largest = last;
            }
        }
        self.num_buckets = largest + 1;

        let used_size = self.num_buckets * self.conf.bucket_size;
        if used_size > self.file.size {
            self.file.used = self.file.size;
            self.file.ensure_size(used_size - self.file.used)?;
        }
        self.file.used = used_size;
        debug!(
            path = %self.file.path().display(),
            num_buckets = self.num_buckets,
            used = used_size,
            "hash table reconstructed"
        );
        Ok(())
    }

    /// Return the next chained bucket, or 0 at end of chain. A link that
    /// fails validation is reported once and treated as end of chain.
    fn next_bucket(&self, bucket: usize) -> usize {
        if bucket >= self.num_buckets {
            return 0;
        }
        let addr = bucket * self.conf.bucket_size;
        let (next, read) = decode_varint(&self.file.buf()[addr..addr + BUCKET_HEADER]);
        if next == 0 {
            return 0;
        }
        let valid = read > 0
            && next > bucket as i64
            && (next as usize) < self.num_buckets
            && next >= self.conf.initial_buckets as i64;
        if !valid {
            if !self.corrupt_logged.swap(true, Ordering::Relaxed) {
                error!(
                    path = %self.file.path().display(),
                    bucket,
                    "bad hash table chain link - repair the collection as soon as possible"
                );
            }
            return 0;
        }
        next as usize
    }

    /// Return the last bucket of the chain rooted at `bucket`.
    fn last_bucket(&self, bucket: usize) -> usize {
        let mut curr = bucket;
        loop {
            let next = self.next_bucket(curr);
            if next == 0 {
                return curr;
            }
            curr = next;
        }
    }

    /// Append a fresh empty bucket and link the chain rooted at `bucket` to
    /// it.
    fn grow_bucket(&mut self, bucket: usize) -> Result<()> {
        self.file.ensure_size(self.conf.bucket_size)?;
        let last_addr = self.last_bucket(bucket) * self.conf.bucket_size;
        let num_buckets = self.num_buckets;
        encode_varint(
            num_buckets as i64,
            &mut self.file.buf_mut()[last_addr..last_addr + VARINT_SLOT],
        );
        self.file.used += self.conf.bucket_size;
        self.num_buckets += 1;
        Ok(())
    }

    /// Store the pair in the first vacant slot of the key's chain, growing
    /// the chain when it is full. Duplicate pairs are not detected.
    pub fn put(&mut self, key: u64, val: u64) -> Result<()> {
        let head = self.conf.hash_key(key);
        let (mut bucket, mut entry) = (head, 0);
        loop {
            let addr = bucket * self.conf.bucket_size + BUCKET_HEADER + entry * ENTRY_SIZE;
            if self.file.buf()[addr] != 1 {
                let buf = self.file.buf_mut();
                buf[addr] = 1;
                encode_varint(key as i64, &mut buf[addr + 1..addr + 1 + VARINT_SLOT]);
                encode_varint(
                    val as i64,
                    &mut buf[addr + 1 + VARINT_SLOT..addr + ENTRY_SIZE],
                );
                return Ok(());
            }
            entry += 1;
            if entry == self.conf.per_bucket {
                entry = 0;
                bucket = self.next_bucket(bucket);
                if bucket == 0 {
                    self.grow_bucket(head)?;
                    bucket = head;
                }
            }
        }
    }

    /// Decode the entry at `addr` as `(flag, key, value)`.
    fn entry_at(&self, addr: usize) -> (u8, i64, i64) {
        let buf = self.file.buf();
        let (key, _) = decode_varint(&buf[addr + 1..addr + 1 + VARINT_SLOT]);
        let (val, _) = decode_varint(&buf[addr + 1 + VARINT_SLOT..addr + ENTRY_SIZE]);
        (buf[addr], key, val)
    }

    /// Collect up to `limit` values stored under `key`, in chain-walk order.
    /// A `limit` of 0 collects every value.
    pub fn get(&self, key: u64, limit: usize) -> Vec<u64> {
        let mut vals = Vec::with_capacity(if limit == 0 { 10 } else { limit });
        let (mut bucket, mut entry) = (self.conf.hash_key(key), 0);
        loop {
            let addr = bucket * self.conf.bucket_size + BUCKET_HEADER + entry * ENTRY_SIZE;
            let (flag, entry_key, entry_val) = self.entry_at(addr);
            if flag == 1 {
                if entry_key == key as i64 {
                    vals.push(entry_val as u64);
                    if vals.len() == limit {
                        return vals;
                    }
                }
            } else if entry_key == 0 && entry_val == 0 {
                // Never-written slot: end of data for this chain.
                return vals;
            }
            entry += 1;
            if entry == self.conf.per_bucket {
                entry = 0;
                bucket = self.next_bucket(bucket);
                if bucket == 0 {
                    return vals;
                }
            }
        }
    }

    /// Clear the first live entry matching the pair. At most one entry is
    /// removed per call.
    pub fn remove(&mut self, key: u64, val: u64) {
        let (mut bucket, mut entry) = (self.conf.hash_key(key), 0);
        loop {
            let addr = bucket * self.conf.bucket_size + BUCKET_HEADER + entry * ENTRY_SIZE;
            let (flag, entry_key, entry_val) = self.entry_at(addr);
            if flag == 1 {
                if entry_key == key as i64 && entry_val == val as i64 {
                    self.file.buf_mut()[addr] = 0;
                    return;
                }
            } else if entry_key == 0 && entry_val == 0 {
                return;
            }
            entry += 1;
            if entry == self.conf.per_bucket {
                entry = 0;
                bucket = self.next_bucket(bucket);
                if bucket == 0 {
                    return;
                }
            }
        }
    }

    /// Collect every live pair reachable from the `head` bucket's chain.
    fn collect_entries(&self, head: usize, keys: &mut Vec<u64>, vals: &mut Vec<u64>) {
        let (mut bucket, mut entry) = (head, 0);
        loop {
            let addr = bucket * self.conf.bucket_size + BUCKET_HEADER + entry * ENTRY_SIZE;
            let (flag, entry_key, entry_val) = self.entry_at(addr);
            if flag == 1 {
                keys.push(entry_key as u64);
                vals.push(entry_val as u64);
            } else if entry_key == 0 && entry_val == 0 {
                return;
            }
            entry += 1;
            if entry == self.conf.per_bucket {
                entry = 0;
                bucket = self.next_bucket(bucket);
                if bucket == 0 {
                    return;
                }
            }
        }
    }

    /// Collect every live pair whose head bucket falls in the chosen
    /// partition of the head index space.
    pub fn get_partition(&self, part_num: usize, total_parts: usize) -> (Vec<u64>, Vec<u64>) {
        let (start, end) = self.conf.partition_range(part_num, total_parts);
        let prealloc = (end - start) * self.conf.per_bucket;
        let mut keys = Vec::with_capacity(prealloc);
        let mut vals = Vec::with_capacity(prealloc);
        for head in start..end {
            self.collect_entries(head, &mut keys, &mut vals);
        }
        (keys, vals)
    }

    /// Truncate the table back to its initial buckets.
    pub fn clear(&mut self) -> Result<()> {
        self.file.clear()?;
        self.calculate_num_buckets()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn close(self) -> Result<()> {
        self.file.close()
    }

    /// Total number of buckets, head and overflow.
    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }
}
