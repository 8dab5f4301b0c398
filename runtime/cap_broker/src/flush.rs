//! Region flushing
//!
//! Revoking a virtual range from a task means unmapping it as a sequence of
//! naturally aligned power-of-two flexpages. [`RegionPages`] produces that
//! sequence; the lifecycle manager sends it to the kernel in batches of at
//! most [`FLUSH_BATCH`].

use l4_platform::{Fpage, FpageRights, MSG_REGS, PAGE_SIZE};

/// Flexpages per unmap call: the message registers minus the header words
pub const FLUSH_BATCH: usize = MSG_REGS - 2;

/// Splits `[start, end)` into maximal aligned flexpages, lowest first
///
/// Both bounds are rounded down to a page boundary. Each step takes the
/// largest order that is both the alignment of the current start and no
/// bigger than what remains, so the pieces tile the range exactly.
#[derive(Debug, Clone)]
pub struct RegionPages {
    start: usize,
    end: usize,
    rights: FpageRights,
}

impl RegionPages {
    pub fn new(start: usize, end: usize, rights: FpageRights) -> Self {
        let mask = !(PAGE_SIZE - 1);
        Self {
            start: start & mask,
            end: end & mask,
            rights,
        }
    }

    /// Bytes left to cover
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.start)
    }
}

impl Iterator for RegionPages {
    type Item = Fpage;

    fn next(&mut self) -> Option<Fpage> {
        let len = self.remaining();
        if len == 0 {
            return None;
        }

        // trailing_zeros of 0 is BITS, so a range starting at 0 is limited
        // by its length alone.
        let align = self.start.trailing_zeros();
        let fit = usize::BITS - 1 - len.leading_zeros();
        let order = align.min(fit);

        let page = Fpage::memory(self.start, order as u8, self.rights);
        self.start += 1 << order;
        Some(page)
    }
}
