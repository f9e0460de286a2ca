//! Partitioning of a parameter range into fixed-size task chunks.
//!
//! Planning is a pure function of `(total_parameters, chunk_size)`: chunk
//! identifiers are derived from position, never from wall-clock time, so
//! re-planning always reproduces the same partition.

use chrono::{DateTime, Utc};

use super::job::TaskChunk;
use crate::error::QueueError;

/// Width of the zero-padded numeric part of a chunk id.
const CHUNK_ID_WIDTH: usize = 6;

/// Returns the identifier of the chunk at `index`.
pub fn chunk_id(index: u64) -> String {
    format!("chunk_{:0width$}", index, width = CHUNK_ID_WIDTH)
}

/// Returns the number of chunks needed to cover `total_parameters`.
pub fn chunk_count(total_parameters: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_parameters.div_ceil(chunk_size)
}

/// Plans chunks covering `[0, total_parameters)`, stamped with the current time.
pub fn plan(total_parameters: u64, chunk_size: u64) -> Result<Vec<TaskChunk>, QueueError> {
    plan_at(total_parameters, chunk_size, Utc::now())
}

/// Plans chunks with a fixed creation timestamp.
///
/// The final chunk is shorter than `chunk_size` when `total_parameters`
/// is not a multiple of it.
pub fn plan_at(
    total_parameters: u64,
    chunk_size: u64,
    created_at: DateTime<Utc>,
) -> Result<Vec<TaskChunk>, QueueError> {
    if chunk_size == 0 {
        return Err(QueueError::InvalidConfig(
            "chunk_size must be at least 1".to_string(),
        ));
    }

    let count = chunk_count(total_parameters, chunk_size);
    let chunks = (0..count)
        .map(|index| {
            let start = index * chunk_size;
            let end = (start + chunk_size).min(total_parameters);
            TaskChunk::new(chunk_id(index), start, end, created_at)
        })
        .collect();

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_partition(chunks: &[TaskChunk], total: u64) {
        let mut cursor = 0;
        for chunk in chunks {
            assert!(chunk.is_well_formed(), "chunk {:?} malformed", chunk);
            assert_eq!(chunk.start_param, cursor, "gap or overlap at {}", cursor);
            cursor = chunk.end_param;
        }
        assert_eq!(cursor, total);
        assert_eq!(chunks.iter().map(|c| c.total_in_chunk).sum::<u64>(), total);
    }

    #[test]
    fn test_chunk_id_format() {
        assert_eq!(chunk_id(0), "chunk_000000");
        assert_eq!(chunk_id(42), "chunk_000042");
        assert_eq!(chunk_id(1_234_567), "chunk_1234567");
    }

    #[test]
    fn test_plan_even_split() {
        let chunks = plan(1000, 10).expect("plan should succeed");

        assert_eq!(chunks.len(), 100);
        assert_exact_partition(&chunks, 1000);
        assert!(chunks.iter().all(|c| c.total_in_chunk == 10));
    }

    #[test]
    fn test_plan_short_final_chunk() {
        let chunks = plan(25, 10).expect("plan should succeed");

        assert_eq!(chunks.len(), 3);
        assert_exact_partition(&chunks, 25);
        assert_eq!(chunks[2].total_in_chunk, 5);
        assert_eq!(chunks[2].start_param, 20);
    }

    #[test]
    fn test_plan_chunk_larger_than_total() {
        let chunks = plan(7, 100).expect("plan should succeed");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total_in_chunk, 7);
    }

    #[test]
    fn test_plan_empty_range() {
        let chunks = plan(0, 10).expect("plan should succeed");
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_plan_rejects_zero_chunk_size() {
        let result = plan(100, 0);
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
        assert_eq!(chunk_count(100, 0), 0);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let at = Utc::now();
        let first = plan_at(1003, 7, at).expect("plan");
        let second = plan_at(1003, 7, at).expect("plan");

        assert_eq!(first, second);

        let ids_now: Vec<_> = plan(1003, 7).expect("plan").into_iter().map(|c| c.chunk_id).collect();
        let ids_then: Vec<_> = first.into_iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids_now, ids_then);
    }

    #[test]
    fn test_chunk_count_matches_plan() {
        for (total, size) in [(0, 1), (1, 1), (10, 3), (99, 10), (100, 10)] {
            let chunks = plan(total, size).expect("plan");
            assert_eq!(chunks.len() as u64, chunk_count(total, size));
        }
    }
}
