//! Tracks connections parked in a blocking `XREAD ... BLOCK ms`. See spec
//! §3 (BlockingWaiter), §4.4, §5.

use std::collections::{HashMap, HashSet};

use crate::connection::ConnId;
use crate::store::StreamEntryId;

/// A connection's blocking read: which streams it watches, from which id,
/// and when (if ever) it times out.
#[derive(Clone)]
pub struct BlockingWaiter {
    pub conn_id: ConnId,
    /// `None` means `BLOCK 0` — wait forever.
    pub deadline_ms: Option<u64>,
    pub watches: Vec<(Vec<u8>, StreamEntryId)>,
}

impl BlockingWaiter {
    /// Whether any watched stream, as reflected by `lookup`, now holds an
    /// entry newer than the id the connection was waiting from.
    pub fn is_satisfied(&self, mut has_newer: impl FnMut(&[u8], StreamEntryId) -> bool) -> bool {
        self.watches.iter().any(|(name, since)| has_newer(name, *since))
    }
}

/// Primary index by connection, secondary index by stream name, so an
/// append can wake the relevant waiters in O(1 + k) (spec §3).
#[derive(Default)]
pub struct BlockingRegistry {
    by_conn: HashMap<ConnId, BlockingWaiter>,
    by_stream: HashMap<Vec<u8>, HashSet<ConnId>>,
}

impl BlockingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, waiter: BlockingWaiter) {
        for (name, _) in &waiter.watches {
            self.by_stream.entry(name.clone()).or_default().insert(waiter.conn_id);
        }
        self.by_conn.insert(waiter.conn_id, waiter);
    }

    /// Removes and returns the waiter for `conn_id`, if any, clearing it
    /// from every stream's secondary index too.
    pub fn deregister(&mut self, conn_id: ConnId) -> Option<BlockingWaiter> {
        let waiter = self.by_conn.remove(&conn_id)?;
        for (name, _) in &waiter.watches {
            if let Some(set) = self.by_stream.get_mut(name) {
                set.remove(&conn_id);
                if set.is_empty() {
                    self.by_stream.remove(name);
                }
            }
        }
        Some(waiter)
    }

    pub fn is_blocked(&self, conn_id: ConnId) -> bool {
        self.by_conn.contains_key(&conn_id)
    }

    /// Connections registered as watching `stream_name`, in no particular
    /// order — used to re-check each one after an append.
    pub fn waiters_on(&self, stream_name: &[u8]) -> Vec<ConnId> {
        self.by_stream
            .get(stream_name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Connections whose deadline has passed by `now_ms` (never includes
    /// `BLOCK 0` waiters, whose deadline is `None`).
    pub fn due_timeouts(&self, now_ms: u64) -> Vec<ConnId> {
        self.by_conn
            .values()
            .filter(|w| matches!(w.deadline_ms, Some(deadline) if deadline <= now_ms))
            .map(|w| w.conn_id)
            .collect()
    }

    /// Re-checks every waiter registered on `stream_name` against
    /// `is_satisfied` and deregisters the ones that are (spec §4.4 "wake on
    /// append"), returning them so the caller can write their replies.
    pub fn wake_satisfied(
        &mut self,
        stream_name: &[u8],
        mut is_satisfied: impl FnMut(&BlockingWaiter) -> bool,
    ) -> Vec<BlockingWaiter> {
        let candidates = self.waiters_on(stream_name);
        let mut woken = Vec::new();
        for conn_id in candidates {
            let satisfied = self.by_conn.get(&conn_id).map_or(false, |w| is_satisfied(w));
            if satisfied {
                if let Some(waiter) = self.deregister(conn_id) {
                    woken.push(waiter);
                }
            }
        }
        woken
    }

    /// Removes and returns every waiter whose deadline is due by `now_ms`
    /// (spec §4.4 "wake on timeout").
    pub fn take_due_timeouts(&mut self, now_ms: u64) -> Vec<BlockingWaiter> {
        self.due_timeouts(now_ms)
            .into_iter()
            .filter_map(|id| self.deregister(id))
            .collect()
    }
}
