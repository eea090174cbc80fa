//! Sequence allocator for write version stamps

use std::sync::atomic::{AtomicI64, Ordering};
use tessera_core::Sid;

/// Issues strictly increasing sids.
///
/// The first sid handed out is `start + 1`; zero means "nothing written yet".
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    last: AtomicI64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after an existing high-water mark.
    pub fn starting_after(last: Sid) -> Self {
        Self {
            last: AtomicI64::new(last),
        }
    }

    /// Allocate the next sid.
    pub fn next_sid(&self) -> Sid {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest sid handed out so far.
    pub fn current(&self) -> Sid {
        self.last.load(Ordering::SeqCst)
    }
}
