//! Per-partition offset bookkeeping for manual commits.
//!
//! Messages of a batch settle in any order, but a Kafka commit covers every
//! offset below it. The tracker only advances the commit point over a
//! contiguous run of settled offsets, so an abandoned or still running
//! message is never committed past.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    InFlight,
    Settled,
}

/// Position of a message in its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Position {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: HashMap<i32, BTreeMap<i64, State>>,
    deliveries: HashMap<Position, u32>,
}

impl OffsetTracker {
    /// Record a received message and return how often it has been delivered.
    pub fn track(&mut self, position: Position) -> u32 {
        self.partitions
            .entry(position.partition)
            .or_default()
            .insert(position.offset, State::InFlight);
        let count = self.deliveries.entry(position).or_insert(0);
        *count += 1;
        *count
    }

    pub fn is_in_flight(&self, position: Position) -> bool {
        self.partitions
            .get(&position.partition)
            .and_then(|offsets| offsets.get(&position.offset))
            == Some(&State::InFlight)
    }

    /// Mark a message settled. Returns the offset to commit if the
    /// contiguous settled prefix of its partition advanced.
    pub fn settle(&mut self, position: Position) -> Option<i64> {
        let offsets = self.partitions.get_mut(&position.partition)?;
        *offsets.get_mut(&position.offset)? = State::Settled;

        let mut commit = None;
        while let Some(entry) = offsets.first_entry() {
            if *entry.get() != State::Settled {
                break;
            }
            let offset = *entry.key();
            entry.remove();
            self.deliveries.remove(&Position {
                partition: position.partition,
                offset,
            });
            commit = Some(offset + 1);
        }
        commit
    }
}
