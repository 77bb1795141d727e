//! Stream Identifier Allocation
//!
//! Identifiers increase monotonically from just above the reserved range.
//! When the counter reaches the configured maximum it wraps back to the
//! first non-reserved identifier and from then on probes for one that is
//! not held by a live entry.

use crate::domain::stream::StreamId;

/// Allocator for item stream identifiers.
#[derive(Debug, Clone)]
pub struct StreamIdAllocator {
    first: StreamId,
    max: StreamId,
    last: StreamId,
    wrapped: bool,
}

impl StreamIdAllocator {
    /// Create an allocator handing out `reserved + 1 ..= max`.
    ///
    /// A `max` at or below `reserved` yields an allocator with no capacity.
    #[must_use]
    pub const fn new(reserved: StreamId, max: StreamId) -> Self {
        Self {
            first: reserved + 1,
            max,
            last: reserved,
            wrapped: false,
        }
    }

    /// Number of identifiers this allocator can hand out.
    #[must_use]
    pub const fn capacity(&self) -> StreamId {
        if self.max < self.first {
            0
        } else {
            self.max - self.first + 1
        }
    }

    /// Whether the counter has wrapped at least once.
    #[must_use]
    pub const fn has_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Allocate the next identifier.
    ///
    /// Before the first wrap every identifier is fresh and `in_use` is not
    /// consulted. After wrapping, identifiers for which `in_use` returns
    /// `true` are skipped. Returns `None` when every identifier is in use.
    pub fn allocate(&mut self, in_use: impl Fn(StreamId) -> bool) -> Option<StreamId> {
        if !self.wrapped {
            if self.last < self.max {
                self.last += 1;
                return Some(self.last);
            }

            self.wrapped = true;
            self.last = self.first - 1;
            tracing::trace!(
                max = self.max,
                "Reached max number available for next stream id, wrapping around"
            );
        }

        for _ in 0..self.capacity() {
            self.last = if self.last >= self.max {
                self.first
            } else {
                self.last + 1
            };

            if !in_use(self.last) {
                return Some(self.last);
            }
        }

        None
    }
}
