//! # Document Collection File
//!
//! A collection file stores document records end to end:
//!
//! ```text
//! +------+---------------+----------------------------+
//! | flag | room (varint) |     payload + padding      |
//! 0------1--------------11------------------------room
//! ```
//!
//! `flag` is 1 for a live record and 0 for a tombstone. `room` is the total
//! reserved payload space, always twice the payload's size at insert time so
//! later updates can grow in place. Reserved-but-unused space is filled with
//! ASCII spaces, which keeps the file free of long zero runs (the watermark
//! bisection depends on that) and lets a JSON payload be parsed straight out
//! of its reserved region, trailing padding included.
//!
//! Updates overwrite in place when the new payload fits the reserved room;
//! otherwise the record is tombstoned and the payload re-inserted at the
//! tail. Tombstoned space is only reclaimed by a scrub at the database
//! layer.

use std::path::Path;
use std::sync::Arc;

use eyre::{bail, Result};

use crate::config::{Config, DOC_HEADER, PADDING};
use crate::encoding::{decode_varint, encode_varint};
use crate::error::StorageError;
use crate::storage::DataFile;

/// Document log layered on a [`DataFile`].
#[derive(Debug)]
pub struct Collection {
    file: DataFile,
    conf: Arc<Config>,
}

impl Collection {
    /// Open a collection file, creating it if absent.
    pub fn open<P: AsRef<Path>>(path: P, conf: Arc<Config>) -> Result<Collection> {
        let file = DataFile::open(path, conf.col_file_growth)?;
        Ok(Collection { file, conf })
    }

    /// Decode and validate the header at `id`, returning the record's room.
    /// `None` means there is no live, sane record at this offset.
    fn valid_room(&self, id: usize) -> Option<usize> {
        let buf = self.file.buf();
        if id + DOC_HEADER > self.file.used || buf[id] != 1 {
            return None;
        }
        let (room, _) = decode_varint(&buf[id + 1..id + DOC_HEADER]);
        if room < 0 || room as usize > self.conf.doc_max_room {
            return None;
        }
        let room = room as usize;
        if id + DOC_HEADER + room >= self.file.size {
            return None;
        }
        Some(room)
    }

    /// Retrieve a document by physical offset. The returned buffer is a copy
    /// of the record's entire reserved region (payload and padding). Corrupt
    /// headers yield `None`, never an error.
    pub fn read(&self, id: usize) -> Option<Vec<u8>> {
        let room = self.valid_room(id)?;
        let start = id + DOC_HEADER;
        Some(self.file.buf()[start..start + room].to_vec())
    }

    /// Insert a new document, reserving twice its size, and return its
    /// physical offset.
    pub fn insert(&mut self, data: &[u8]) -> Result<usize> {
        let room = data.len() * 2;
        if room > self.conf.doc_max_room {
            bail!(StorageError::DocTooLarge {
                given: room,
                max: self.conf.doc_max_room,
            });
        }

        let id = self.file.used;
        self.file.ensure_size(DOC_HEADER + room)?;
        self.file.used += DOC_HEADER + room;
        let doc_end = self.file.used;

        let buf = self.file.buf_mut();
        buf[id] = 1;
        encode_varint(room as i64, &mut buf[id + 1..id + DOC_HEADER]);
        let payload = id + DOC_HEADER;
        buf[payload..payload + data.len()].copy_from_slice(data);
        buf[payload + data.len()..doc_end].fill(PADDING);
        Ok(id)
    }

    /// Overwrite a document in place when it fits its reserved room, or
    /// tombstone and re-insert it otherwise. Returns the document's physical
    /// offset after the update, which differs from `id` in the re-insert
    /// case.
    pub fn update(&mut self, id: usize, data: &[u8]) -> Result<usize> {
        if data.len() > self.conf.doc_max_room {
            bail!(StorageError::DocTooLarge {
                given: data.len(),
                max: self.conf.doc_max_room,
            });
        }
        let Some(room) = self.valid_room(id) else {
            bail!(StorageError::NoDoc(id as u64));
        };

        if data.len() <= room {
            let payload = id + DOC_HEADER;
            let buf = self.file.buf_mut();
            buf[payload..payload + data.len()].copy_from_slice(data);
            buf[payload + data.len()..payload + room].fill(PADDING);
            return Ok(id);
        }

        // Not enough room at the old offset.
        self.delete(id)?;
        self.insert(data)
    }

    /// Tombstone a document. Space is not reclaimed until a scrub.
    pub fn delete(&mut self, id: usize) -> Result<()> {
        if id + DOC_HEADER > self.file.used || self.file.buf()[id] != 1 {
            bail!(StorageError::NoDoc(id as u64));
        }
        self.file.buf_mut()[id] = 0;
        Ok(())
    }

    /// Walk every record from offset 0, invoking `fun` on each live
    /// document; stop early when `fun` returns false. A header that fails
    /// validation advances the scan by a single byte so one torn record
    /// cannot hide the rest of the file.
    pub fn for_each_doc<F>(&self, mut fun: F)
    where
        F: FnMut(usize, &[u8]) -> bool,
    {
        let buf = self.file.buf();
        let used = self.file.used;
        let mut id = 0usize;
        while id + DOC_HEADER < used {
            let validity = buf[id];
            let (room, _) = decode_varint(&buf[id + 1..id + DOC_HEADER]);
            let header_ok = validity <= 1
                && room >= 0
                && room as usize <= self.conf.doc_max_room
                && id + DOC_HEADER + room as usize <= used;
            if header_ok {
                let doc_end = id + DOC_HEADER + room as usize;
                if validity == 1 && !fun(id, &buf[id + DOC_HEADER..doc_end]) {
                    return;
                }
                id = doc_end;
            } else {
                // Corrupt record, resynchronize byte by byte.
                id += 1;
            }
        }
    }

    /// Truncate back to one growth increment.
    pub fn clear(&mut self) -> Result<()> {
        self.file.clear()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn close(self) -> Result<()> {
        self.file.close()
    }

    /// Bytes in use, pointing just past the last inserted record.
    pub fn used(&self) -> usize {
        self.file.used
    }
}
