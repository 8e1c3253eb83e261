//! Per-session record of plays already relayed.
//!
//! Two plays are the same when their track ids match and their timestamps are
//! closer than the tolerance window; source and sink clocks do not agree to
//! the second.  The ledger is bounded by count and age, but eviction only ever
//! touches entries that sit behind the caller's watermark (the coordinator's
//! high-water mark), so nothing a poll can still return is forgotten.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::client::TrackId;

#[derive(Debug, Clone, PartialEq)]
pub struct DedupEntry {
    pub track_id: TrackId,
    pub played_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DedupLedger {
    entries: VecDeque<DedupEntry>,
    tolerance: TimeDelta,
    capacity: usize,
    max_age: TimeDelta,
}

impl DedupLedger {
    pub fn new(tolerance: Duration, capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            tolerance: to_delta(tolerance),
            capacity: capacity.max(1),
            max_age: to_delta(max_age),
        }
    }

    pub fn seen(&self, track_id: &TrackId, played_at: DateTime<Utc>) -> bool {
        self.entries
            .iter()
            .any(|e| &e.track_id == track_id && (e.played_at - played_at).abs() < self.tolerance)
    }

    /// Record a relayed play.  Recording a play that is already present is a
    /// no-op.
    pub fn record(&mut self, track_id: TrackId, played_at: DateTime<Utc>) {
        if self.seen(&track_id, played_at) {
            return;
        }
        self.entries.push_back(DedupEntry {
            track_id,
            played_at,
        });
    }

    /// Drop the oldest entries while the ledger is over capacity or they are
    /// older than the age limit.  Only entries more than one tolerance window
    /// behind `watermark` are eligible.  Returns how many were dropped.
    pub fn evict(&mut self, watermark: DateTime<Utc>) -> usize {
        let Some(eligible_before) = watermark.checked_sub_signed(self.tolerance) else {
            return 0;
        };
        let expired_before = watermark.checked_sub_signed(self.max_age);
        let mut dropped = 0;

        while let Some(front) = self.entries.front() {
            if front.played_at >= eligible_before {
                break;
            }
            let over_capacity = self.entries.len() > self.capacity;
            let expired = expired_before.is_some_and(|t| front.played_at < t);
            if !over_capacity && !expired {
                break;
            }
            self.entries.pop_front();
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tolerance(&self) -> TimeDelta {
        self.tolerance
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}
