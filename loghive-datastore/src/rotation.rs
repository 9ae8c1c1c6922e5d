//! Rotation policies deciding when the active chunk is sealed.
//!
//! Policies are consulted before every append, against a snapshot of the
//! active chunk and the incoming record, so a byte budget can account for
//! the record that is about to be written.

use std::fmt;

use crate::chunk_meta::ActiveChunkState;
use crate::record::Record;

/// Why a chunk was rotated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationReason {
    RecordCount,
    ByteBudget,
    Age,
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            RotationReason::RecordCount => "record count",
            RotationReason::ByteBudget => "byte budget",
            RotationReason::Age => "age",
        };
        f.write_str(text)
    }
}

pub trait RotationPolicy: Send + Sync {
    /// Returns a reason when `next` must go into a fresh chunk.
    fn check(&self, state: &ActiveChunkState, next: &Record) -> Option<RotationReason>;
}

/// Rotate once the active chunk holds `max_records` records.
pub struct RecordCountPolicy {
    max_records: u64,
}

impl RecordCountPolicy {
    pub fn new(max_records: u64) -> Self {
        Self { max_records }
    }
}

impl RotationPolicy for RecordCountPolicy {
    fn check(&self, state: &ActiveChunkState, _next: &Record) -> Option<RotationReason> {
        (state.record_count >= self.max_records).then_some(RotationReason::RecordCount)
    }
}

/// Rotate when the incoming record would push the chunk past `max_bytes`.
pub struct ByteBudgetPolicy {
    max_bytes: u64,
}

impl ByteBudgetPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl RotationPolicy for ByteBudgetPolicy {
    fn check(&self, state: &ActiveChunkState, next: &Record) -> Option<RotationReason> {
        (state.byte_count + next.payload_len() as u64 > self.max_bytes)
            .then_some(RotationReason::ByteBudget)
    }
}

/// Rotate chunks older than `max_age_secs` (wall clock).
pub struct AgePolicy {
    max_age_secs: i64,
}

impl AgePolicy {
    pub fn new(max_age_secs: i64) -> Self {
        Self { max_age_secs }
    }
}

impl RotationPolicy for AgePolicy {
    fn check(&self, state: &ActiveChunkState, _next: &Record) -> Option<RotationReason> {
        (proxmox_time::epoch_i64() - state.created >= self.max_age_secs)
            .then_some(RotationReason::Age)
    }
}

/// Triggers on the first sub-policy (in declaration order) that fires.
pub struct AnyOfPolicy {
    policies: Vec<Box<dyn RotationPolicy>>,
}

impl AnyOfPolicy {
    pub fn new(policies: Vec<Box<dyn RotationPolicy>>) -> Self {
        Self { policies }
    }
}

impl RotationPolicy for AnyOfPolicy {
    fn check(&self, state: &ActiveChunkState, next: &Record) -> Option<RotationReason> {
        self.policies
            .iter()
            .find_map(|policy| policy.check(state, next))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk_meta::ChunkId;
    use crate::record::SourceId;

    fn state(record_count: u64, byte_count: u64) -> ActiveChunkState {
        ActiveChunkState {
            id: ChunkId::generate(),
            last_write_ts: 0,
            created: proxmox_time::epoch_i64(),
            record_count,
            byte_count,
        }
    }

    fn record(len: usize) -> Record {
        Record::new(vec![b'x'; len], SourceId::generate())
    }

    #[test]
    fn test_record_count() {
        let policy = RecordCountPolicy::new(3);
        assert_eq!(policy.check(&state(2, 0), &record(1)), None);
        assert_eq!(
            policy.check(&state(3, 0), &record(1)),
            Some(RotationReason::RecordCount)
        );
    }

    #[test]
    fn test_byte_budget_counts_incoming() {
        let policy = ByteBudgetPolicy::new(10);
        assert_eq!(policy.check(&state(1, 5), &record(5)), None);
        assert_eq!(
            policy.check(&state(1, 5), &record(6)),
            Some(RotationReason::ByteBudget)
        );
    }

    #[test]
    fn test_age() {
        assert_eq!(AgePolicy::new(3600).check(&state(1, 0), &record(1)), None);
        assert_eq!(
            AgePolicy::new(0).check(&state(1, 0), &record(1)),
            Some(RotationReason::Age)
        );
    }

    #[test]
    fn test_any_of_first_reason_wins() {
        let policy = AnyOfPolicy::new(vec![
            Box::new(RecordCountPolicy::new(1)),
            Box::new(ByteBudgetPolicy::new(0)),
        ]);
        // both fire; declaration order decides the reason
        assert_eq!(
            policy.check(&state(1, 1), &record(1)),
            Some(RotationReason::RecordCount)
        );

        let empty = AnyOfPolicy::new(vec![]);
        assert_eq!(empty.check(&state(1, 1), &record(1)), None);
    }
}
