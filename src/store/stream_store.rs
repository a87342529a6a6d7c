//! The stream family: an append-only log per stream name with
//! auto-generated, strictly increasing identifiers. See spec §3, §4.3.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamEntryId(pub u64, pub u64);

impl StreamEntryId {
    pub const MIN: Self = Self(0, 0);
    pub const MAX: Self = Self(u64::MAX, u64::MAX);
    pub const ZERO: Self = Self(0, 0);
}

impl Display for StreamEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}

impl FromStr for StreamEntryId {
    type Err = CommandError;

    /// Parses an explicit `ms-seq` or bare `ms` (seq defaults to 0) form.
    /// Does not understand `*`, `ms-*`, `-`, or `+` — those are resolved by
    /// the caller (XADD's allocator, XRANGE's bound expansion).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((ms, seq)) => {
                let ms = ms.parse().map_err(|_| CommandError::InvalidStreamId)?;
                let seq = seq.parse().map_err(|_| CommandError::InvalidStreamId)?;
                Ok(Self(ms, seq))
            }
            None => {
                let ms = s.parse().map_err(|_| CommandError::InvalidStreamId)?;
                Ok(Self(ms, 0))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: StreamEntryId,
    pub fields: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Default)]
pub struct Stream {
    entries: Vec<StreamEntry>,
}

impl Stream {
    pub fn tail(&self) -> StreamEntryId {
        self.entries.last().map_or(StreamEntryId::MIN, |e| e.id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves the requested id form into a concrete id per the XADD
    /// allocation table (spec §4.3), without validating or appending it.
    pub fn allocate_id(&self, requested: &str, now_ms: u64) -> Result<StreamEntryId, CommandError> {
        let last = if self.is_empty() { None } else { Some(self.tail()) };

        if requested == "*" {
            return Ok(match last {
                None => StreamEntryId(now_ms, 0),
                Some(last) if now_ms > last.0 => StreamEntryId(now_ms, 0),
                Some(last) if now_ms == last.0 => StreamEntryId(now_ms, last.1 + 1),
                // clock appears to have gone backwards relative to the stream's tail
                Some(last) => StreamEntryId(last.0, last.1 + 1),
            });
        }

        if let Some(ms_part) = requested.strip_suffix("-*") {
            let ms: u64 = ms_part.parse().map_err(|_| CommandError::InvalidStreamId)?;
            let seq = match last {
                None => {
                    if ms == 0 {
                        1
                    } else {
                        0
                    }
                }
                Some(last) if last.0 == ms => last.1 + 1,
                Some(_) => 0,
            };
            return Ok(StreamEntryId(ms, seq));
        }

        requested.parse()
    }

    /// Validates `id` against the invariants in spec §4.3: never `0-0`,
    /// always strictly greater than the current tail.
    pub fn validate_new_id(&self, id: StreamEntryId) -> Result<(), CommandError> {
        if id == StreamEntryId::ZERO {
            return Err(CommandError::XaddZeroId);
        }
        if !self.is_empty() && id <= self.tail() {
            return Err(CommandError::XaddIdTooSmall);
        }
        Ok(())
    }

    pub fn append(&mut self, id: StreamEntryId, fields: Vec<(Vec<u8>, Vec<u8>)>) {
        self.entries.push(StreamEntry { id, fields });
    }

    /// Entries with id in the inclusive `[from, to]` range (XRANGE).
    pub fn range_inclusive(&self, from: StreamEntryId, to: StreamEntryId) -> Vec<&StreamEntry> {
        self.entries.iter().filter(|e| e.id >= from && e.id <= to).collect()
    }

    /// Entries with id strictly greater than `since` (XREAD).
    pub fn after(&self, since: StreamEntryId) -> Vec<&StreamEntry> {
        self.entries.iter().filter(|e| e.id > since).collect()
    }
}

#[derive(Default)]
pub struct StreamStore {
    streams: HashMap<Vec<u8>, Stream>,
}

impl StreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &[u8]) -> Option<&Stream> {
        self.streams.get(name)
    }

    pub fn contains(&self, name: &[u8]) -> bool {
        self.streams.contains_key(name)
    }

    /// Allocates and appends a new entry to `name`, creating the stream if
    /// it doesn't exist yet. Returns the concrete id assigned.
    pub fn append(
        &mut self,
        name: &[u8],
        requested_id: &str,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        now_ms: u64,
    ) -> Result<StreamEntryId, CommandError> {
        let stream = self.streams.entry(name.to_vec()).or_default();
        let id = stream.allocate_id(requested_id, now_ms)?;
        stream.validate_new_id(id)?;
        stream.append(id, fields);
        Ok(id)
    }

    /// The tail id at the moment of the call — used to resolve XREAD's `$`.
    pub fn current_tail(&self, name: &[u8]) -> StreamEntryId {
        self.streams.get(name).map_or(StreamEntryId::MIN, |s| s.tail())
    }
}
