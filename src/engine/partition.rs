// Byte-range planning: splits a resource of known size into fixed-size parts.

/// Half-open interval `[start, end)` over the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Inclusive last byte, as used in a `Range: bytes=a-b` header.
    pub fn last_byte(&self) -> u64 {
        self.end - 1
    }
}

/// Tile `[0, total_size)` with ascending ranges of at most `part_size` bytes.
///
/// Only the final range may be shorter than `part_size`. An empty resource
/// yields no ranges.
pub fn partition(total_size: u64, part_size: u64) -> Vec<ByteRange> {
    debug_assert!(part_size > 0, "part_size must be > 0");
    let part_size = part_size.max(1);
    let count = total_size.div_ceil(part_size);
    let mut ranges = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
    let mut start = 0u64;
    while start < total_size {
        let end = start.saturating_add(part_size).min(total_size);
        ranges.push(ByteRange { start, end });
        start = end;
    }
    ranges
}
