//! C1: the key codec (spec section 4.1).
//!
//! An encoded key is `table_id` (8 bytes, little-endian) followed by the raw
//! user key bytes. Two encoded keys from the same table sort by user key
//! lexicographically; two encoded keys from different tables are disjoint
//! and ordered by table id - exactly the property a single global
//! `BTreeMap<Vec<u8>, _>` keyed on the encoded bytes needs.
//!
//! The empty user key is an overloaded "maximum key" sentinel: scans use an
//! empty `key_end` to mean "to the end of this table's key space". To make
//! that hold under plain lexicographic byte comparison, an empty user key is
//! encoded as the 8-byte little-endian representation of `table_id + 1`
//! (which sorts after every real key of `table_id`, and before every key of
//! `table_id + 1`).

use byteorder::{ByteOrder, LittleEndian};

pub const TABLE_ID_LEN: usize = 8;

/// Encodes `(table_id, user_key)` into the single ordered byte string used as
/// the storage map's sort key.
pub fn encode(table_id: u64, user_key: &[u8]) -> Vec<u8> {
    if user_key.is_empty() {
        let mut buf = vec![0u8; TABLE_ID_LEN];
        LittleEndian::write_u64(&mut buf, table_id + 1);
        return buf;
    }
    let mut buf = Vec::with_capacity(TABLE_ID_LEN + user_key.len());
    buf.resize(TABLE_ID_LEN, 0);
    LittleEndian::write_u64(&mut buf, table_id);
    buf.extend_from_slice(user_key);
    buf
}

/// Decodes an encoded key back into `(table_id, user_key)`. An 8-byte encoded
/// key (no user-key bytes) is recognized as the maximum-key sentinel and
/// decodes to `(table_id - 1, empty)`.
pub fn decode(encoded: &[u8]) -> (u64, Vec<u8>) {
    debug_assert!(encoded.len() >= TABLE_ID_LEN, "encoded key shorter than a table id");
    let raw = LittleEndian::read_u64(&encoded[..TABLE_ID_LEN]);
    if encoded.len() == TABLE_ID_LEN {
        (raw.wrapping_sub(1), Vec::new())
    } else {
        (raw, encoded[TABLE_ID_LEN..].to_vec())
    }
}

/// The minimum possible key for any table: the single `\0` byte.
pub fn min_key() -> Vec<u8> {
    vec![0u8]
}

/// Encodes the first key of a table's key space (inclusive lower bound),
/// used when a scan's `start` is empty ("from the first key").
pub fn table_lower_bound(table_id: u64) -> Vec<u8> {
    let mut buf = vec![0u8; TABLE_ID_LEN];
    LittleEndian::write_u64(&mut buf, table_id);
    buf
}

/// Encodes the exclusive upper bound of a table's key space (the maximum-key
/// sentinel), used when a scan's `end` is empty ("to the last key").
pub fn table_upper_bound(table_id: u64) -> Vec<u8> {
    encode(table_id, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_nonempty_key() {
        for table_id in [0u64, 1, 42, u64::MAX - 1] {
            for key in [&b""[..], b"a", b"hello world", &[0xffu8; 32]] {
                let encoded = encode(table_id, key);
                let (t, k) = decode(&encoded);
                if key.is_empty() {
                    assert_eq!(t, table_id);
                    assert_eq!(k, Vec::<u8>::new());
                } else {
                    assert_eq!(t, table_id);
                    assert_eq!(k, key);
                }
            }
        }
    }

    #[test]
    fn empty_key_sorts_after_every_nonempty_key_of_same_table() {
        let table = 7u64;
        let max = encode(table, &[]);
        for key in [&b"a"[..], b"zzzzzzzz", &[0xffu8; 64]] {
            let encoded = encode(table, key);
            assert!(encoded < max, "key {key:?} did not sort before the max sentinel");
        }
    }

    #[test]
    fn tables_are_disjoint_and_ordered_by_id() {
        let a = encode(3, b"zzz");
        let b = encode(4, b"aaa");
        assert!(a < b);
    }

    #[test]
    fn min_key_sorts_first_within_a_table() {
        let table = 1u64;
        let min = encode(table, &min_key());
        let other = encode(table, b"anything");
        assert!(min <= other);
    }
}
