// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The filesystem-native change-log extraction API is an external
// collaborator; this module only defines the boundary this daemon needs
// from it: a monotonic index, an optional trailing name, and
// open/recv/free/clear/close semantics.

use crate::error::LcapError;

/// A single change-log record. `index` is the only field this daemon
/// interprets; the rest is an opaque, length-prefixed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub index: u64,
    pub type_tag: u32,
    pub timestamp: u64,
    pub flags: u32,
    pub name: Vec<u8>,
}

impl ChangeRecord {
    /// Serialize in the fixed-header-plus-trailing-name layout the wire
    /// protocol expects inside an ENQUEUE body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::fixed_header_len() + self.name.len());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.type_tag.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.name);
        buf
    }

    pub fn fixed_header_len() -> usize {
        8 + 4 + 8 + 4 + 4
    }

    pub fn byte_len(&self) -> usize {
        Self::fixed_header_len() + self.name.len()
    }

    /// Decode one record from the front of `buf`, returning the record and
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(ChangeRecord, usize), LcapError> {
        if buf.len() < Self::fixed_header_len() {
            return Err(LcapError::Protocol("truncated record header".into()));
        }
        let index = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let type_tag = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let timestamp = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let flags = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let namelen = u32::from_le_bytes(buf[24..28].try_into().unwrap()) as usize;
        let total = Self::fixed_header_len() + namelen;
        if buf.len() < total {
            return Err(LcapError::Protocol("truncated record name".into()));
        }
        let name = buf[28..total].to_vec();
        Ok((ChangeRecord { index, type_tag, timestamp, flags, name }, total))
    }

    /// Decode every record out of a concatenated ENQUEUE body.
    pub fn decode_all(mut buf: &[u8], count: u32) -> Result<Vec<ChangeRecord>, LcapError> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (rec, used) = ChangeRecord::decode(buf)?;
            buf = &buf[used..];
            out.push(rec);
        }
        Ok(out)
    }
}

/// An open handle onto one metadata target's change-log stream.
pub trait ChangelogSourceHandle: Send {
    /// Pull the next record, or `Err(LcapError::EndOfStream)` /
    /// `Err(LcapError::TryAgain)` when none is currently available.
    fn recv(&mut self) -> Result<ChangeRecord, LcapError>;

    /// Release a record once its owning bucket has been cleared.
    fn free(&mut self, record: &ChangeRecord);

    /// Advance the source-side low-watermark past `index`, matching a
    /// client CLEAR. Advisory: the in-memory cache has already released
    /// the record via `free`.
    fn clear(&mut self, index: i64) -> Result<(), LcapError>;

    fn close(&mut self);
}

/// A pluggable changelog source: opens a handle positioned at `start_index`.
pub trait ChangelogSource: Send + Sync {
    fn open(&self, start_index: u64) -> Result<Box<dyn ChangelogSourceHandle>, LcapError>;
}

/// In-memory test double used by unit/integration tests and by `DIRECT`
/// mode demos. Yields a fixed, pre-seeded sequence of records.
pub struct MemorySource {
    records: Vec<ChangeRecord>,
}

impl MemorySource {
    pub fn from_indices(indices: impl IntoIterator<Item = u64>) -> Self {
        let records = indices
            .into_iter()
            .map(|index| ChangeRecord { index, type_tag: 0, timestamp: 0, flags: 0, name: Vec::new() })
            .collect();
        MemorySource { records }
    }
}

impl ChangelogSource for MemorySource {
    fn open(&self, start_index: u64) -> Result<Box<dyn ChangelogSourceHandle>, LcapError> {
        let pending: Vec<ChangeRecord> = self
            .records
            .iter()
            .filter(|r| r.index >= start_index)
            .cloned()
            .collect();
        Ok(Box::new(MemorySourceHandle { pending: pending.into_iter(), exhausted: false }))
    }
}

struct MemorySourceHandle {
    pending: std::vec::IntoIter<ChangeRecord>,
    exhausted: bool,
}

impl ChangelogSourceHandle for MemorySourceHandle {
    fn recv(&mut self) -> Result<ChangeRecord, LcapError> {
        match self.pending.next() {
            Some(rec) => Ok(rec),
            None => {
                self.exhausted = true;
                Err(LcapError::EndOfStream)
            }
        }
    }

    fn free(&mut self, _record: &ChangeRecord) {}

    fn clear(&mut self, _index: i64) -> Result<(), LcapError> {
        Ok(())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_encode_decode() {
        let rec = ChangeRecord { index: 7, type_tag: 1, timestamp: 99, flags: 0, name: b"foo".to_vec() };
        let bytes = rec.encode();
        let (decoded, used) = ChangeRecord::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, rec);
    }

    #[test]
    fn memory_source_yields_in_order_and_then_eof() {
        let src = MemorySource::from_indices(1..=3);
        let mut handle = src.open(0).unwrap();
        assert_eq!(handle.recv().unwrap().index, 1);
        assert_eq!(handle.recv().unwrap().index, 2);
        assert_eq!(handle.recv().unwrap().index, 3);
        assert!(matches!(handle.recv().unwrap_err(), LcapError::EndOfStream));
    }

    #[test]
    fn memory_source_resumes_at_start_index() {
        let src = MemorySource::from_indices(1..=5);
        let mut handle = src.open(3).unwrap();
        assert_eq!(handle.recv().unwrap().index, 3);
    }
}
