//! # Signed Varint Encoding
//!
//! This module implements the signed variable-length integer encoding used by
//! every header field in the data files: document room, hash entry keys and
//! values, and bucket chain links.
//!
//! ## Encoding Format
//!
//! A value is first zig-zag mapped to an unsigned integer so that small
//! magnitudes of either sign stay small:
//!
//! ```text
//! zigzag(v) = (v << 1) ^ (v >> 63)     // arithmetic shift
//!
//! 0 -> 0, -1 -> 1, 1 -> 2, -2 -> 3, ...
//! ```
//!
//! then emitted as little-endian base-128 groups, 7 bits per byte, with the
//! high bit of each byte marking continuation. An `i64` needs at most 10
//! bytes, which is why header slots are a fixed [`VARINT_SLOT`] bytes wide:
//! the encoder writes only as many bytes as the value needs, and whatever the
//! slot held before stays behind the terminator byte where the decoder never
//! looks.
//!
//! ## Corruption Tolerance
//!
//! [`decode_varint`] does not return a `Result`. A slot that fails to
//! terminate within the slice decodes to `(0, 0)`. Every caller either
//! validates the decoded value against file bounds anyway (document headers)
//! or treats zero bytes-read as a corrupt chain link (bucket headers), so an
//! error type here would only be unwrapped back into the same fallback.

/// Fixed width of every varint header slot on disk.
pub const VARINT_SLOT: usize = 10;

/// Encode `value` into the front of `buf`, returning the number of bytes
/// written (1 to 10).
pub fn encode_varint(value: i64, buf: &mut [u8]) -> usize {
    let mut ux = ((value << 1) ^ (value >> 63)) as u64;
    let mut i = 0;
    while ux >= 0x80 {
        buf[i] = (ux as u8) | 0x80;
        ux >>= 7;
        i += 1;
    }
    buf[i] = ux as u8;
    i + 1
}

/// Decode a varint from the front of `buf`, returning `(value, bytes_read)`.
/// Returns `(0, 0)` when the slice is empty, the encoding does not terminate
/// within it, or the value overflows 64 bits.
pub fn decode_varint(buf: &[u8]) -> (i64, usize) {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if b < 0x80 {
            if i == 9 && b > 1 {
                return (0, 0); // 10th byte may only carry the top bit
            }
            ux |= (b as u64) << shift;
            let value = ((ux >> 1) as i64) ^ -((ux & 1) as i64);
            return (value, i + 1);
        }
        if i == 9 {
            return (0, 0);
        }
        ux |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    (0, 0)
}
