//! # Encoding Module
//!
//! Integer encoding helpers for the on-disk formats. Every length, key and
//! link field in a data file lives in a fixed 10-byte header slot holding a
//! signed varint; see [`varint`] for the wire format.

pub mod varint;

pub use varint::{decode_varint, encode_varint, VARINT_SLOT};
