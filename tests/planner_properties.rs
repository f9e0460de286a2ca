use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use sweepq::scheduler::job::ResultSummary;
use sweepq::scheduler::planner::{chunk_count, plan_at};

proptest! {
    /// Property: chunks cover [0, N) exactly once, in order, with no gaps
    #[test]
    fn chunks_partition_the_range(total in 0u64..50_000, size in 1u64..5_000) {
        let created = Utc.timestamp_opt(0, 0).single().expect("epoch");
        let chunks = plan_at(total, size, created).expect("plan");

        prop_assert_eq!(chunks.len() as u64, chunk_count(total, size));
        let mut next = 0;
        for chunk in &chunks {
            prop_assert_eq!(chunk.start_param, next, "gap or overlap before {}", chunk.chunk_id);
            prop_assert!(chunk.is_well_formed(), "malformed chunk {:?}", chunk);
            prop_assert!(chunk.total_in_chunk <= size);
            next = chunk.end_param;
        }
        prop_assert_eq!(next, total);
        prop_assert_eq!(chunks.iter().map(|c| c.total_in_chunk).sum::<u64>(), total);
    }

    /// Property: only the last chunk may be short
    #[test]
    fn only_final_chunk_is_short(total in 1u64..50_000, size in 1u64..5_000) {
        let created = Utc.timestamp_opt(0, 0).single().expect("epoch");
        let chunks = plan_at(total, size, created).expect("plan");
        let (last, rest) = chunks.split_last().expect("non-empty plan");
        prop_assert!(rest.iter().all(|c| c.total_in_chunk == size));
        prop_assert_eq!(last.total_in_chunk, total - size * rest.len() as u64);
    }

    /// Property: planning twice yields identical chunk ids
    #[test]
    fn chunk_ids_are_deterministic(total in 0u64..20_000, size in 1u64..2_000) {
        let a = plan_at(total, size, Utc.timestamp_opt(0, 0).single().expect("epoch")).expect("plan");
        let b = plan_at(total, size, Utc::now()).expect("plan");
        let ids_a: Vec<_> = a.iter().map(|c| &c.chunk_id).collect();
        let ids_b: Vec<_> = b.iter().map(|c| &c.chunk_id).collect();
        prop_assert_eq!(ids_a, ids_b);
    }

    /// Property: folding summaries does not depend on order
    #[test]
    fn summary_merge_is_order_independent(values in prop::collection::vec((any::<i64>(), 0u64..1_000), 0..50)) {
        let summaries: Vec<_> = values.iter().map(|&(s, c)| ResultSummary::new(s, c)).collect();
        let forward = summaries.iter().fold(ResultSummary::default(), |acc, s| acc.merge(*s));
        let backward = summaries.iter().rev().fold(ResultSummary::default(), |acc, s| acc.merge(*s));
        prop_assert_eq!(forward, backward);
    }
}

#[test]
fn zero_chunk_size_is_rejected() {
    assert!(plan_at(10, 0, Utc::now()).is_err());
}
