//! The storage map's row type (spec section 3).

/// `{data, metadata}`. `metadata` means different things per backend: the
/// owning transaction id under 2PL (0 = unlocked), or a monotonically
/// increasing version under OCC (`-1` marks a retained tombstone).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub data: Vec<u8>,
    pub metadata: i32,
}

impl Entry {
    pub fn new(data: Vec<u8>, metadata: i32) -> Self {
        Entry { data, metadata }
    }
}
