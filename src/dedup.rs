//! Content-hash interning of record sub-sections.
//!
//! Files with thousands of records typically repeat a handful of structural
//! blocks (grid definitions, station tables).  [`RecordDeduper`] keys each
//! candidate sub-section on BLAKE3 of its canonical form (the kind byte
//! followed by the raw bytes) and hands back one shared [`Arc`] per distinct
//! key.  Entries are never evicted; the table is bounded by the number of
//! distinct variants, not by the number of records.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Format-defined discriminant of a sub-section within a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartKind(pub u8);

impl PartKind {
    /// The single part of an opaque record body.
    pub const PAYLOAD: PartKind = PartKind(0);
}

/// One typed sub-section of a record, detached from its stream position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subsection {
    pub kind: PartKind,
    pub data: Vec<u8>,
}

impl Subsection {
    pub fn new(kind: PartKind, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    pub fn len(&self) -> usize { self.data.len() }

    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    pub fn key(&self) -> DedupKey {
        DedupKey::of(self)
    }
}

/// BLAKE3 of a sub-section's canonical byte form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    pub fn of(section: &Subsection) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[section.kind.0]);
        hasher.update(&section.data);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] { &self.0 }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DedupKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hit/miss counters for the intern table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub entries: usize,
    pub hits:    u64,
    pub misses:  u64,
}

#[derive(Debug, Default)]
pub struct RecordDeduper {
    table:  HashMap<DedupKey, Arc<Subsection>>,
    hits:   u64,
    misses: u64,
}

impl RecordDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical instance for `section`, inserting it if new.
    pub fn intern(&mut self, section: Subsection) -> Arc<Subsection> {
        let key = section.key();
        if let Some(existing) = self.table.get(&key) {
            self.hits += 1;
            tracing::trace!(%key, "dedup hit");
            return Arc::clone(existing);
        }
        self.misses += 1;
        tracing::debug!(%key, kind = section.kind.0, len = section.len(), "new structural variant");
        let canonical = Arc::new(section);
        self.table.insert(key, Arc::clone(&canonical));
        canonical
    }

    pub fn get(&self, key: &DedupKey) -> Option<&Arc<Subsection>> {
        self.table.get(key)
    }

    /// Distinct variants held.
    pub fn len(&self) -> usize { self.table.len() }

    pub fn is_empty(&self) -> bool { self.table.is_empty() }

    pub fn stats(&self) -> DedupStats {
        DedupStats { entries: self.table.len(), hits: self.hits, misses: self.misses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_sections_share_one_instance() {
        let mut dd = RecordDeduper::new();
        let a = dd.intern(Subsection::new(PartKind(2), b"grid 181x360".to_vec()));
        let b = dd.intern(Subsection::new(PartKind(2), b"grid 181x360".to_vec()));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(dd.stats(), DedupStats { entries: 1, hits: 1, misses: 1 });
    }

    #[test]
    fn kind_is_part_of_the_key() {
        let mut dd = RecordDeduper::new();
        let a = dd.intern(Subsection::new(PartKind(1), b"same".to_vec()));
        let b = dd.intern(Subsection::new(PartKind(2), b"same".to_vec()));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(dd.len(), 2);
        assert!(dd.get(&a.key()).is_some());
    }
}
