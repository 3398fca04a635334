//! Chunked snapshot reassembly.
//!
//! A snapshot is delivered as `total` parts sharing one `version`. Parts may
//! arrive in any order; the snapshot completes once parts `1..=total` are all
//! present and is then handed out exactly once.
//!
//! | Incoming version | Effect |
//! |------------------|--------|
//! | older than tracked | stale, ignored |
//! | same as tracked | part recorded |
//! | newer, or nothing tracked | buffer reset, part recorded |

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// One received part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub(crate) version: u64,
    pub(crate) sequence: u32,
    pub(crate) total: u32,
    pub(crate) data: String,
}

/// Result of pushing a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The chunk belongs to an outdated version.
    Stale,
    /// More parts are needed.
    Pending,
    /// Every part arrived; `text` is the concatenated snapshot.
    Complete { version: u64, text: String },
}

// ============================================================================
// Reassembly
// ============================================================================

/// Buffer for the version currently being received.
#[derive(Debug, Default)]
pub(crate) struct Reassembly {
    version: Option<u64>,
    total: u32,
    /// Received parts keyed by sequence number.
    parts: BTreeMap<u32, String>,
}

impl Reassembly {
    /// Records `chunk`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reassembly`] for a part outside `1..=total`, a total
    /// that changes within a version, or a gap at assembly time. The version
    /// in progress is discarded.
    pub(crate) fn push(&mut self, chunk: Chunk) -> Result<Progress> {
        match self.version {
            Some(current) if chunk.version < current => {
                trace!(version = chunk.version, current, "Stale chunk");
                return Ok(Progress::Stale);
            }
            Some(current) if chunk.version == current => {}
            _ => self.start(chunk.version, chunk.total),
        }

        if chunk.sequence == 0 || chunk.sequence > chunk.total {
            self.reset();
            return Err(Error::reassembly(
                chunk.version,
                format!("part {} outside 1..={}", chunk.sequence, chunk.total),
            ));
        }

        if chunk.total != self.total {
            let expected = self.total;
            self.reset();
            return Err(Error::reassembly(
                chunk.version,
                format!("total changed from {expected} to {}", chunk.total),
            ));
        }

        self.parts.insert(chunk.sequence, chunk.data);

        if self.parts.len() < self.total as usize {
            return Ok(Progress::Pending);
        }

        let version = chunk.version;
        let text = self.assemble(version);
        self.reset();
        Ok(Progress::Complete {
            version,
            text: text?,
        })
    }

    /// Version currently being received.
    #[inline]
    pub(crate) fn version(&self) -> Option<u64> {
        self.version
    }

    /// Number of parts received for the current version.
    #[inline]
    pub(crate) fn received(&self) -> usize {
        self.parts.len()
    }

    fn start(&mut self, version: u64, total: u32) {
        self.version = Some(version);
        self.total = total;
        self.parts.clear();
    }

    fn reset(&mut self) {
        self.version = None;
        self.total = 0;
        self.parts.clear();
    }

    fn assemble(&self, version: u64) -> Result<String> {
        let mut text = String::with_capacity(self.parts.values().map(String::len).sum());
        for sequence in 1..=self.total {
            let part = self.parts.get(&sequence).ok_or_else(|| {
                Error::reassembly(version, format!("missing part {sequence}"))
            })?;
            text.push_str(part);
        }
        Ok(text)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn chunk(version: u64, sequence: u32, total: u32, data: &str) -> Chunk {
        Chunk {
            version,
            sequence,
            total,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_single_part_completes() {
        let mut buffer = Reassembly::default();
        let progress = buffer.push(chunk(0, 1, 1, "[1]")).expect("push");
        assert_eq!(
            progress,
            Progress::Complete {
                version: 0,
                text: "[1]".to_string()
            }
        );
        assert_eq!(buffer.version(), None);
    }

    #[test]
    fn test_newer_version_discards_partial() {
        let mut buffer = Reassembly::default();
        assert_eq!(
            buffer.push(chunk(2, 1, 3, "a")).expect("push"),
            Progress::Pending
        );
        assert_eq!(
            buffer.push(chunk(3, 1, 2, "x")).expect("push"),
            Progress::Pending
        );
        assert_eq!(buffer.version(), Some(3));
        assert_eq!(buffer.received(), 1);

        assert_eq!(
            buffer.push(chunk(3, 2, 2, "y")).expect("push"),
            Progress::Complete {
                version: 3,
                text: "xy".to_string()
            }
        );
    }

    #[test]
    fn test_older_version_is_stale() {
        let mut buffer = Reassembly::default();
        buffer.push(chunk(5, 1, 2, "a")).expect("push");
        assert_eq!(
            buffer.push(chunk(4, 2, 2, "b")).expect("push"),
            Progress::Stale
        );
        assert_eq!(buffer.received(), 1);
    }

    #[test]
    fn test_out_of_range_part_is_error() {
        let mut buffer = Reassembly::default();
        buffer.push(chunk(1, 1, 2, "a")).expect("push");

        let err = buffer.push(chunk(1, 3, 2, "c")).err().expect("error");
        assert!(matches!(err, Error::Reassembly { version: 1, .. }));
        assert_eq!(buffer.version(), None);

        let err = buffer.push(chunk(1, 0, 2, "z")).err().expect("error");
        assert!(matches!(err, Error::Reassembly { .. }));
    }

    #[test]
    fn test_changed_total_is_error() {
        let mut buffer = Reassembly::default();
        buffer.push(chunk(1, 1, 3, "a")).expect("push");
        assert!(buffer.push(chunk(1, 2, 2, "b")).is_err());
        assert_eq!(buffer.received(), 0);
    }

    #[test]
    fn test_same_version_can_complete_again() {
        let mut buffer = Reassembly::default();
        assert!(matches!(
            buffer.push(chunk(0, 1, 1, "a")).expect("push"),
            Progress::Complete { .. }
        ));
        assert!(matches!(
            buffer.push(chunk(0, 1, 1, "b")).expect("push"),
            Progress::Complete { .. }
        ));
    }

    proptest! {
        #[test]
        fn test_any_delivery_order_completes_once(
            parts in prop::collection::vec("[a-z]{0,4}", 1..8),
            seed in any::<u64>(),
        ) {
            let total = parts.len() as u32;
            let mut order: Vec<u32> = (1..=total).collect();
            // Deterministic shuffle from the seed.
            let mut state = seed;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                order.swap(i, j);
            }

            let mut buffer = Reassembly::default();
            let mut completed = Vec::new();
            for sequence in order {
                let data = parts[(sequence - 1) as usize].clone();
                let progress = buffer.push(Chunk { version: 9, sequence, total, data }).unwrap();
                if let Progress::Complete { text, .. } = progress {
                    completed.push(text);
                }
            }

            prop_assert_eq!(completed, vec![parts.concat()]);
        }
    }
}
