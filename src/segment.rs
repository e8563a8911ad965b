//! `OutputSegment`: an immutable, length-exact byte segment or consolidation
//! of segments (spec §3 "Data").

use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use crate::error::{ProcessError, Result};

/// The largest size a single segment (or a consolidation of segments) may
/// report; consolidating past this is an error (spec §3: "Overflow (sum >
/// `MAX_I32`) is an error").
pub const MAX_SEGMENT_SIZE: usize = i32::MAX as usize;

#[derive(Clone)]
enum Repr {
    Single(Arc<[u8]>),
    Rope(Arc<Vec<OutputSegment>>),
}

/// An immutable byte-exact view over one or more underlying reader buffers.
///
/// Cheap to clone (reference-counted); equality and hashing are by byte
/// content, not by representation, so a `Single` and an equivalent `Rope`
/// compare equal.
#[derive(Clone)]
pub struct OutputSegment {
    repr: Repr,
    size: usize,
    utf8_cache: Arc<OnceLock<Arc<str>>>,
    hash_cache: Arc<OnceLock<u64>>,
}

impl OutputSegment {
    /// Build a segment from a length-exact copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> OutputSegment {
        OutputSegment {
            repr: Repr::Single(Arc::from(bytes)),
            size: bytes.len(),
            utf8_cache: Arc::new(OnceLock::new()),
            hash_cache: Arc::new(OnceLock::new()),
        }
    }

    /// An empty segment.
    pub fn empty() -> OutputSegment {
        OutputSegment::from_bytes(&[])
    }

    /// Number of bytes this segment logically holds.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Byte at `index`, or `None` if out of range.
    pub fn get(&self, index: usize) -> Option<u8> {
        if index >= self.size {
            return None;
        }
        match &self.repr {
            Repr::Single(bytes) => bytes.get(index).copied(),
            Repr::Rope(parts) => {
                let mut remaining = index;
                for part in parts.iter() {
                    if remaining < part.size {
                        return part.get(remaining);
                    }
                    remaining -= part.size;
                }
                None
            }
        }
    }

    /// Iterate over every byte in order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.size).map(move |i| self.get(i).expect("index within bounds"))
    }

    /// Whether `needle` occurs anywhere in this segment.
    pub fn contains(&self, needle: u8) -> bool {
        self.iter().any(|b| b == needle)
    }

    /// Copy `[index_start, index_end)` of this segment into `dest` starting
    /// at `dest_offset`. Panics if any range is out of bounds, matching the
    /// teacher's "bounds-checked write" convention for `WriteStream::write`.
    pub fn copy_into(
        &self,
        dest: &mut [u8],
        dest_offset: usize,
        index_start: usize,
        index_end: usize,
    ) {
        assert!(index_start <= index_end && index_end <= self.size, "range out of bounds");
        assert!(dest_offset + (index_end - index_start) <= dest.len(), "dest too small");
        for (i, src_index) in (index_start..index_end).enumerate() {
            dest[dest_offset + i] = self.get(src_index).expect("index within bounds");
        }
    }

    /// Materialize this segment into an owned, contiguous byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.repr {
            Repr::Single(bytes) => bytes.to_vec(),
            Repr::Rope(_) => {
                let mut out = vec![0u8; self.size];
                self.copy_into(&mut out, 0, 0, self.size);
                out
            }
        }
    }

    /// UTF-8 decoding of this segment's bytes, cached after first call.
    /// Invalid UTF-8 is decoded lossily, matching the spec's external UTF-8
    /// oracle contract rather than surfacing a new error type here.
    pub fn utf8(&self) -> Arc<str> {
        self.utf8_cache
            .get_or_init(|| {
                let bytes = self.to_bytes();
                Arc::from(String::from_utf8_lossy(&bytes).into_owned())
            })
            .clone()
    }

    fn compute_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.size.hash(&mut hasher);
        for b in self.iter() {
            b.hash(&mut hasher);
        }
        hasher.finish()
    }

    fn cached_hash(&self) -> u64 {
        *self.hash_cache.get_or_init(|| self.compute_hash())
    }

    /// Collapse a sequence of optional segments into one logical segment,
    /// following spec §3's consolidation rule: `None`/empty entries are
    /// dropped; a single remaining non-empty segment is returned unchanged
    /// (no copy); otherwise a `Rope` view is built over the survivors.
    pub fn consolidate(parts: impl IntoIterator<Item = Option<OutputSegment>>) -> Result<Option<OutputSegment>> {
        let survivors: Vec<OutputSegment> = parts
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();

        match survivors.len() {
            0 => Ok(None),
            1 => Ok(survivors.into_iter().next()),
            _ => {
                let total: usize = survivors.iter().map(|s| s.size).sum();
                if total > MAX_SEGMENT_SIZE {
                    return Err(ProcessError::IllegalState(format!(
                        "consolidated segment size {total} exceeds {MAX_SEGMENT_SIZE}"
                    )));
                }
                Ok(Some(OutputSegment {
                    repr: Repr::Rope(Arc::new(survivors)),
                    size: total,
                    utf8_cache: Arc::new(OnceLock::new()),
                    hash_cache: Arc::new(OnceLock::new()),
                }))
            }
        }
    }
}

impl PartialEq for OutputSegment {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.iter().eq(other.iter())
    }
}

impl Eq for OutputSegment {}

impl Hash for OutputSegment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.cached_hash());
    }
}

impl std::fmt::Debug for OutputSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const PREVIEW_LEN: usize = 32;
        let preview: Vec<u8> = self.iter().take(PREVIEW_LEN).collect();
        write!(
            f,
            "OutputSegment {{ size: {}, preview: {:?}{} }}",
            self.size,
            String::from_utf8_lossy(&preview),
            if self.size > PREVIEW_LEN { "..." } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_via_copy_into() {
        let s = OutputSegment::from_bytes(b"hello world");
        let mut dest = vec![0u8; s.size()];
        s.copy_into(&mut dest, 0, 0, s.size());
        assert_eq!(dest, s.to_bytes());
    }

    #[test]
    fn utf8_matches_lossy_decode_of_bytes() {
        let s = OutputSegment::from_bytes("héllo".as_bytes());
        assert_eq!(s.utf8().as_ref(), "héllo");
    }

    #[test]
    fn consolidate_collapses_null_empty_and_single() {
        let a = OutputSegment::from_bytes(b"a");
        let consolidated = OutputSegment::consolidate(vec![
            Some(a.clone()),
            None,
            Some(OutputSegment::empty()),
        ])
        .unwrap();
        assert_eq!(consolidated, Some(a));
    }

    #[test]
    fn consolidate_of_single_non_empty_returns_same_content() {
        let a = OutputSegment::from_bytes(b"solo");
        let consolidated = OutputSegment::consolidate(vec![Some(a.clone())])
            .unwrap()
            .unwrap();
        assert_eq!(consolidated, a);
    }

    #[test]
    fn consolidate_of_multiple_builds_rope_with_combined_bytes() {
        let a = OutputSegment::from_bytes(b"foo");
        let b = OutputSegment::from_bytes(b"bar");
        let combined = OutputSegment::consolidate(vec![Some(a), None, Some(b)])
            .unwrap()
            .unwrap();
        assert_eq!(combined.to_bytes(), b"foobar");
        assert_eq!(combined.size(), 6);
    }

    #[test]
    fn consolidate_is_equivalent_after_dropping_nulls_and_empties() {
        let a = OutputSegment::from_bytes(b"x");
        let b = OutputSegment::from_bytes(b"y");
        let with_noise =
            OutputSegment::consolidate(vec![Some(a.clone()), None, Some(OutputSegment::empty()), Some(b.clone())])
                .unwrap();
        let without_noise = OutputSegment::consolidate(vec![Some(a), Some(b)]).unwrap();
        assert_eq!(with_noise, without_noise);
    }

    #[test]
    fn equality_ignores_representation() {
        let flat = OutputSegment::from_bytes(b"foobar");
        let rope = OutputSegment::consolidate(vec![
            Some(OutputSegment::from_bytes(b"foo")),
            Some(OutputSegment::from_bytes(b"bar")),
        ])
        .unwrap()
        .unwrap();
        assert_eq!(flat, rope);
        let mut h1 = std::collections::hash_map::DefaultHasher::new();
        let mut h2 = std::collections::hash_map::DefaultHasher::new();
        flat.hash(&mut h1);
        rope.hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn contains_finds_byte_across_rope_boundary() {
        let rope = OutputSegment::consolidate(vec![
            Some(OutputSegment::from_bytes(b"ab")),
            Some(OutputSegment::from_bytes(b"cd")),
        ])
        .unwrap()
        .unwrap();
        assert!(rope.contains(b'c'));
        assert!(!rope.contains(b'z'));
    }
}
