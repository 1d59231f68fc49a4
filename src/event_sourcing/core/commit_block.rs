use crate::error::{Result, StoreError};
use super::event::{AggregateCommit, AggregateId, PayloadSerializer, RawEvent, PUBLIC_EVENTS_OFFSET};

// ============================================================================
// Commit Block - Rebuilds Aggregate Commits From Ordered Rows
// ============================================================================
//
// Rows arrive ordered by (revision, position) from the clustering order, so a
// single forward pass is enough: a higher revision closes the current commit,
// the position tells private events (0..N-1) from public ones (OFFSET..).
//
// ============================================================================

pub struct CommitBlock<T> {
    aggregate_id: AggregateId,
    revision: Option<i32>,
    timestamp: i64,
    events: Vec<T>,
    public_events: Vec<T>,
    commits: Vec<AggregateCommit<T>>,
}

impl<T> CommitBlock<T> {
    pub fn new(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            revision: None,
            timestamp: 0,
            events: Vec::new(),
            public_events: Vec::new(),
            commits: Vec::new(),
        }
    }

    pub fn append_row(&mut self, revision: i32, position: i32, payload: T, timestamp: i64) -> Result<()> {
        match self.revision {
            None => {
                self.revision = Some(revision);
                self.timestamp = timestamp;
            }
            Some(current) if revision == current => {}
            Some(current) if revision > current => {
                self.flush(current);
                self.revision = Some(revision);
                self.timestamp = timestamp;
            }
            Some(_) => return Err(self.corrupted(revision, position, "revision went backwards")),
        }

        let private_count = self.events.len() as i32;
        let next_public = PUBLIC_EVENTS_OFFSET + self.public_events.len() as i32;

        // Public rows may have gaps left by deletes; private rows may not.
        if position == private_count {
            self.events.push(payload);
        } else if position >= next_public {
            self.public_events.push(payload);
        } else {
            return Err(self.corrupted(revision, position, "position is neither the next private nor a public slot"));
        }

        Ok(())
    }

    /// Close the block and return every commit seen, in revision order.
    pub fn complete(mut self) -> Vec<AggregateCommit<T>> {
        if let Some(revision) = self.revision {
            if !self.events.is_empty() {
                self.flush(revision);
            }
        }
        self.commits
    }

    fn flush(&mut self, revision: i32) {
        let commit = AggregateCommit {
            aggregate_id: self.aggregate_id,
            revision,
            events: std::mem::take(&mut self.events),
            public_events: std::mem::take(&mut self.public_events),
            timestamp: self.timestamp,
        };
        self.commits.push(commit);
    }

    fn corrupted(&self, revision: i32, position: i32, reason: &'static str) -> StoreError {
        tracing::error!(
            aggregate_id = %self.aggregate_id,
            revision = revision,
            position = position,
            reason = reason,
            "Structural inconsistency while rebuilding aggregate commits"
        );
        StoreError::CorruptedCommit {
            aggregate_id: self.aggregate_id.to_string(),
            revision,
            position,
            reason,
        }
    }
}

// ============================================================================
// Write Side - Commit to Rows
// ============================================================================

/// Serialize a commit into the rows that will be written in one batch.
///
/// Private events take positions `0..k`, public events `OFFSET..OFFSET+m`.
/// A commit with public events and `k >= OFFSET` private events cannot be
/// told apart on read and is rejected.
pub fn encode_commit<E, S>(commit: &AggregateCommit<E>, serializer: &S) -> Result<Vec<RawEvent>>
where
    E: serde::Serialize,
    S: PayloadSerializer,
{
    let private_count = commit.events.len() as i32;
    if !commit.public_events.is_empty() && private_count >= PUBLIC_EVENTS_OFFSET {
        return Err(StoreError::InvalidCommit(format!(
            "revision {} of {} has {} private events; at most {} allowed alongside public events",
            commit.revision,
            commit.aggregate_id,
            private_count,
            PUBLIC_EVENTS_OFFSET - 1
        )));
    }

    let private_rows = commit.events.iter().zip(0..);
    let public_rows = commit.public_events.iter().zip(PUBLIC_EVENTS_OFFSET..);

    private_rows
        .chain(public_rows)
        .map(|(event, position)| {
            Ok(RawEvent {
                aggregate_id: commit.aggregate_id,
                revision: commit.revision,
                position,
                timestamp: commit.timestamp,
                data: serializer.serialize(event)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::event::JsonSerializer;
    use proptest::prelude::*;

    fn id() -> AggregateId {
        AggregateId::new([0xAA; 16])
    }

    #[test]
    fn test_single_revision_with_public_event() {
        let mut block = CommitBlock::new(id());
        block.append_row(1, 0, "x", 100).unwrap();
        block.append_row(1, 5, "y", 100).unwrap();

        let commits = block.complete();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].revision, 1);
        assert_eq!(commits[0].events, vec!["x"]);
        assert_eq!(commits[0].public_events, vec!["y"]);
        assert_eq!(commits[0].timestamp, 100);
    }

    #[test]
    fn test_new_revision_flushes_previous() {
        let mut block = CommitBlock::new(id());
        block.append_row(1, 0, "a", 10).unwrap();
        block.append_row(1, 1, "b", 10).unwrap();
        block.append_row(2, 0, "c", 20).unwrap();
        block.append_row(2, 5, "p", 20).unwrap();
        block.append_row(2, 6, "q", 20).unwrap();

        let commits = block.complete();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].events, vec!["a", "b"]);
        assert!(commits[0].public_events.is_empty());
        assert_eq!(commits[1].revision, 2);
        assert_eq!(commits[1].timestamp, 20);
        assert_eq!(commits[1].public_events, vec!["p", "q"]);
    }

    #[test]
    fn test_gap_position_is_corruption() {
        let mut block = CommitBlock::new(id());
        block.append_row(1, 0, "a", 10).unwrap();
        let err = block.append_row(1, 3, "b", 10).unwrap_err();
        assert!(matches!(err, StoreError::CorruptedCommit { revision: 1, position: 3, .. }));
    }

    #[test]
    fn test_public_positions_may_have_gaps() {
        let mut block = CommitBlock::new(id());
        block.append_row(1, 0, "a", 10).unwrap();
        block.append_row(1, 6, "q", 10).unwrap();
        block.append_row(1, 9, "r", 10).unwrap();

        let commits = block.complete();
        assert_eq!(commits[0].events, vec!["a"]);
        assert_eq!(commits[0].public_events, vec!["q", "r"]);
    }

    #[test]
    fn test_position_below_next_public_slot_is_corruption() {
        let mut block = CommitBlock::new(id());
        block.append_row(1, 0, "a", 10).unwrap();
        block.append_row(1, 6, "q", 10).unwrap();
        // Public slots only move forward: 5 is now below the next public slot.
        assert!(matches!(
            block.append_row(1, 5, "p", 10),
            Err(StoreError::CorruptedCommit { position: 5, .. })
        ));
    }

    #[test]
    fn test_revision_going_backwards_is_corruption() {
        let mut block = CommitBlock::new(id());
        block.append_row(2, 0, "a", 10).unwrap();
        assert!(block.append_row(1, 0, "b", 10).is_err());
    }

    #[test]
    fn test_trailing_revision_without_private_events_is_dropped() {
        let mut block = CommitBlock::new(id());
        block.append_row(1, 0, "a", 10).unwrap();
        block.append_row(2, 5, "orphan", 20).unwrap();

        let commits = block.complete();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].revision, 1);
    }

    #[test]
    fn test_empty_block() {
        assert!(CommitBlock::<String>::new(id()).complete().is_empty());
    }

    #[test]
    fn test_encode_commit_positions() {
        let commit = AggregateCommit::new(id(), 1, vec!["x".to_string()], vec!["y".to_string()])
            .with_timestamp(42);
        let rows = encode_commit(&commit, &JsonSerializer).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].revision, rows[0].position), (1, 0));
        assert_eq!((rows[1].revision, rows[1].position), (1, 5));
        assert!(rows.iter().all(|r| r.timestamp == 42));
        assert_eq!(rows[0].data, JsonSerializer.serialize(&"x").unwrap());
        assert_eq!(rows[1].data, JsonSerializer.serialize(&"y").unwrap());
    }

    #[test]
    fn test_encode_rejects_ambiguous_commit() {
        let events: Vec<u8> = (0..5).collect();
        let commit = AggregateCommit::new(id(), 1, events.clone(), vec![9]);
        assert!(matches!(
            encode_commit(&commit, &JsonSerializer),
            Err(StoreError::InvalidCommit(_))
        ));

        // Without public events any number of private events is fine.
        let commit = AggregateCommit::new(id(), 1, events, vec![]);
        assert_eq!(encode_commit(&commit, &JsonSerializer).unwrap().len(), 5);
    }

    proptest! {
        #[test]
        fn prop_positions_skip_reserved_gap(private in 1usize..5, public in 0usize..8) {
            let commit = AggregateCommit::new(
                id(),
                3,
                (0..private as u32).collect::<Vec<_>>(),
                (100..100 + public as u32).collect::<Vec<_>>(),
            );
            let rows = encode_commit(&commit, &JsonSerializer).unwrap();

            let positions: Vec<i32> = rows.iter().map(|r| r.position).collect();
            let expected: Vec<i32> = (0..private as i32)
                .chain(PUBLIC_EVENTS_OFFSET..PUBLIC_EVENTS_OFFSET + public as i32)
                .collect();
            prop_assert_eq!(positions, expected);

            let mut block = CommitBlock::new(id());
            for row in &rows {
                let payload: u32 = JsonSerializer.deserialize(&row.data).unwrap();
                block.append_row(row.revision, row.position, payload, row.timestamp).unwrap();
            }
            let commits = block.complete();
            prop_assert_eq!(commits.len(), 1);
            prop_assert_eq!(&commits[0].events, &commit.events);
            prop_assert_eq!(&commits[0].public_events, &commit.public_events);
        }
    }
}
