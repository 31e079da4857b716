use std::sync::atomic::{AtomicU64, Ordering};

// Bit layout of the packed reservation word:
//
//   0..20   cur_entry_offset (u64 units into the open entry body)
//   20      idx
//   21      prev_buf_unwritten
//   22..43  buf 0 reservation count
//   43..64  buf 1 reservation count
const OFFSET_BITS: u32 = 20;
const IDX_SHIFT: u32 = 20;
const PREV_UNWRITTEN_SHIFT: u32 = 21;
const COUNT_BITS: u32 = 21;
const COUNT_SHIFT: [u32; 2] = [22, 43];

const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// Largest representable entry offset.  Entry bodies must stay strictly below
/// the sentinel values, which caps a single entry at a little under 8MiB of
/// key payload.
pub(crate) const OFFSET_MAX: u32 = (1 << OFFSET_BITS) - 1;

/// Sentinel offset: the journal has hit a fatal error and refuses all
/// reservations.  Absorbing; never cleared.
pub(crate) const OFFSET_ERROR: u32 = OFFSET_MAX;

/// Sentinel offset: the current entry is sealed and no entry is open yet.
pub(crate) const OFFSET_CLOSED: u32 = OFFSET_MAX - 1;

/// A decoded snapshot of the reservation word.
///
/// All four logical fields are read with a single atomic load, so any
/// consistent combination a thread observes is a combination that actually
/// existed.  Transitions go back through [`ReservationState`] as a
/// compare-and-swap of the whole word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ResState(u64);

impl ResState {
    pub fn cur_entry_offset(self) -> u32 {
        (self.0 & OFFSET_MASK) as u32
    }

    pub fn idx(self) -> usize {
        ((self.0 >> IDX_SHIFT) & 1) as usize
    }

    pub fn prev_buf_unwritten(self) -> bool {
        (self.0 >> PREV_UNWRITTEN_SHIFT) & 1 == 1
    }

    pub fn count(self, idx: usize) -> u32 {
        ((self.0 >> COUNT_SHIFT[idx]) & COUNT_MASK) as u32
    }

    /// True iff an entry is currently accepting reservations.
    pub fn entry_is_open(self) -> bool {
        self.cur_entry_offset() < OFFSET_CLOSED
    }

    pub fn is_error(self) -> bool {
        self.cur_entry_offset() == OFFSET_ERROR
    }

    #[must_use]
    pub fn with_offset(self, offset: u32) -> Self {
        debug_assert!(u64::from(offset) <= OFFSET_MASK);
        Self((self.0 & !OFFSET_MASK) | u64::from(offset))
    }

    #[must_use]
    pub fn inc_count(self, idx: usize) -> Self {
        debug_assert!(self.count(idx) < COUNT_MASK as u32);
        Self(self.0 + (1 << COUNT_SHIFT[idx]))
    }

    #[must_use]
    pub fn dec_count(self, idx: usize) -> Self {
        assert!(self.count(idx) > 0, "reservation count underflow");
        Self(self.0 - (1 << COUNT_SHIFT[idx]))
    }

    #[must_use]
    pub fn flip_idx(self) -> Self {
        Self(self.0 ^ (1 << IDX_SHIFT))
    }

    #[must_use]
    pub fn with_prev_buf_unwritten(self, set: bool) -> Self {
        if set {
            Self(self.0 | (1 << PREV_UNWRITTEN_SHIFT))
        } else {
            Self(self.0 & !(1 << PREV_UNWRITTEN_SHIFT))
        }
    }
}

/// The reservation state word.
///
/// Holds the open entry's fill offset, the current buffer index, the
/// previous-buffer-unwritten bit and both buffers' outstanding reservation
/// counts in one `AtomicU64`, per the layout above.
#[derive(Debug)]
pub(crate) struct ReservationState(AtomicU64);

impl ReservationState {
    /// A fresh journal starts with no entry open.
    pub fn new() -> Self {
        Self(AtomicU64::new(
            ResState(0).with_offset(OFFSET_CLOSED).0,
        ))
    }

    pub fn load(&self) -> ResState {
        ResState(self.0.load(Ordering::Acquire))
    }

    /// Applies `f` to the current word in a CAS loop.
    ///
    /// `f` returning `None` aborts the update and yields `Err` with the
    /// observed state; otherwise the state `f` was applied to is returned.
    pub fn update<F>(&self, mut f: F) -> Result<ResState, ResState>
    where
        F: FnMut(ResState) -> Option<ResState>,
    {
        let mut old = self.load();
        loop {
            let new = match f(old) {
                Some(new) => new,
                None => return Err(old),
            };
            match self.0.compare_exchange_weak(
                old.0,
                new.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(old),
                Err(v) => old = ResState(v),
            }
        }
    }

    /// Drops one reservation held on buffer `idx`, returning the resulting
    /// state.
    pub fn dec_count(&self, idx: usize) -> ResState {
        let old = self
            .update(|s| Some(s.dec_count(idx)))
            .expect("unconditional update cannot fail");
        old.dec_count(idx)
    }

    /// Latches the error sentinel.  Returns `false` if it was already set.
    pub fn halt(&self) -> bool {
        self.update(|s| {
            if s.is_error() {
                None
            } else {
                Some(s.with_offset(OFFSET_ERROR))
            }
        })
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn sentinels_are_ordered() {
        assert!(OFFSET_CLOSED < OFFSET_ERROR);
        assert!(ResState(0).with_offset(OFFSET_CLOSED).cur_entry_offset() == OFFSET_CLOSED);
        assert!(!ResState(0).with_offset(OFFSET_CLOSED).entry_is_open());
        assert!(ResState(0).with_offset(OFFSET_ERROR).is_error());
        assert!(ResState(0).with_offset(OFFSET_CLOSED - 1).entry_is_open());
    }

    #[test]
    fn close_transition_shape() {
        // The shape buf_switch applies: take the write reservation, seal the
        // offset, flip the index, mark the previous buffer in flight.
        let s = ResState(0).with_offset(123).inc_count(0).inc_count(0);
        let closed = s
            .inc_count(s.idx())
            .with_offset(OFFSET_CLOSED)
            .flip_idx()
            .with_prev_buf_unwritten(true);
        assert_eq!(closed.idx(), 1);
        assert!(closed.prev_buf_unwritten());
        assert_eq!(closed.count(0), 3);
        assert_eq!(closed.count(1), 0);
        assert!(!closed.entry_is_open());
    }

    #[test]
    fn error_is_absorbing() {
        let state = ReservationState::new();
        assert!(state.halt());
        assert!(!state.halt());
        assert!(state.load().is_error());
    }

    proptest! {
        #[test]
        fn fields_roundtrip(offset in 0u32..OFFSET_MAX, idx in 0usize..2, prev in any::<bool>(),
                            c0 in 0u32..1000, c1 in 0u32..1000) {
            let mut s = ResState(0).with_offset(offset).with_prev_buf_unwritten(prev);
            if idx == 1 {
                s = s.flip_idx();
            }
            for _ in 0..c0 {
                s = s.inc_count(0);
            }
            for _ in 0..c1 {
                s = s.inc_count(1);
            }
            prop_assert_eq!(s.cur_entry_offset(), offset);
            prop_assert_eq!(s.idx(), idx);
            prop_assert_eq!(s.prev_buf_unwritten(), prev);
            prop_assert_eq!(s.count(0), c0);
            prop_assert_eq!(s.count(1), c1);
        }
    }
}
