//! Transport-sized chunking of change batches.

use crate::change::ChangeRecord;

/// Chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    /// Target maximum records per chunk. Zero is treated as one.
    pub size: usize,
    /// Never split a run of records sharing one `db_version`.
    pub strict: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            size: 1000,
            strict: true,
        }
    }
}

/// Split `records` into contiguous sub-batches.
///
/// Version groups are packed greedily. In strict mode a group larger than
/// `size` becomes its own oversized chunk; otherwise it is cut into pieces
/// of `size`.
pub fn chunk(records: &[ChangeRecord], options: ChunkOptions) -> Vec<&[ChangeRecord]> {
    let size = options.size.max(1);
    if records.is_empty() {
        return Vec::new();
    }
    if records.len() <= size {
        return vec![records];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut group_start = 0;

    while group_start < records.len() {
        let version = records[group_start].db_version;
        let group_end = records[group_start..]
            .iter()
            .position(|r| r.db_version != version)
            .map_or(records.len(), |offset| group_start + offset);
        let group_len = group_end - group_start;
        let pending = group_start - start;

        if pending + group_len > size && pending > 0 {
            chunks.push(&records[start..group_start]);
            start = group_start;
        }

        if group_len > size && !options.strict {
            let mut piece = group_start;
            while group_end - piece > size {
                chunks.push(&records[piece..piece + size]);
                piece += size;
            }
            start = piece;
        }

        group_start = group_end;
    }

    if start < records.len() {
        chunks.push(&records[start..]);
    }
    chunks
}
