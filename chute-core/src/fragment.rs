//! Fragment arithmetic: split a file into fixed-size slices addressed by sequence number.

use crate::protocol::FRAGMENT_SIZE;

/// One slice of a file: sequence number and byte range (start inclusive, end exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId {
    pub sequence: u32,
    pub start: u64,
    pub end: u64,
}

impl FragmentId {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Number of fragments for a file of `total_len` bytes: ceil(total_len / FRAGMENT_SIZE).
/// `None` if the count does not fit the wire's 32-bit sequence space.
pub fn fragment_count(total_len: u64) -> Option<u32> {
    let n = total_len.div_ceil(FRAGMENT_SIZE as u64);
    u32::try_from(n).ok()
}

/// Byte offset at which fragment `sequence` is written.
pub fn fragment_offset(sequence: u32) -> u64 {
    u64::from(sequence) * FRAGMENT_SIZE as u64
}

/// Fragment `sequence` of a file of `total_len` bytes; only the last one may be short.
/// `None` past the last fragment.
pub fn fragment_at(sequence: u32, total_len: u64) -> Option<FragmentId> {
    let start = fragment_offset(sequence);
    if start >= total_len {
        return None;
    }
    Some(FragmentId {
        sequence,
        start,
        end: (start + FRAGMENT_SIZE as u64).min(total_len),
    })
}
