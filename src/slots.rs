//! Sampling-slot allocation.
//!
//! A device exposes a small, fixed number of texture binding points. The
//! [`SlotAllocator`] hands them out first-fit from slot 0 and takes them back
//! when the returned [`SlotClaim`] is released or dropped.
//!
//! ```text
//!   capacity 4:   [busy][free][busy][free]
//!   acquire()  ->        ^ slot 1
//! ```
//!
//! Claims made with `keep = true` are counted separately; they stay bound
//! across many draws (picking buffers, lookup tables) while transient claims
//! come and go within one `process()` call.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::SlotError;

#[derive(Debug, Default)]
struct SlotTable {
    busy: Vec<bool>,
    live: u32,
    kept: u32,
    epoch: u64,
}

/// Occupancy table for sampling slots.
///
/// Cloning shares the table, so every clone sees the same claims. The
/// [`GraphicsContext`](crate::GraphicsContext) keeps one sized to the
/// device's binding capacity and hands out claims through
/// [`acquire_slot`](crate::GraphicsContext::acquire_slot).
///
/// # Example
///
/// ```
/// use phalanx::SlotAllocator;
///
/// let slots = SlotAllocator::new(2);
/// let color = slots.acquire(false).unwrap();
/// let lut = slots.acquire(true).unwrap();
/// assert_eq!((color.slot(), lut.slot()), (0, 1));
/// assert!(slots.acquire(false).is_err());
///
/// drop(color);
/// assert_eq!(slots.num_active_transient(), 0);
/// assert_eq!(slots.num_kept(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SlotAllocator {
    table: Rc<RefCell<SlotTable>>,
}

impl SlotAllocator {
    /// Creates an allocator with `capacity` free slots.
    pub fn new(capacity: u32) -> Self {
        let allocator = Self::default();
        allocator.init(capacity);
        allocator
    }

    /// Clears occupancy and sets a new capacity.
    ///
    /// Call this whenever the graphics context is (re)created. Claims made
    /// before become inert; dropping them later does nothing.
    pub fn init(&self, capacity: u32) {
        let mut table = self.table.borrow_mut();
        table.busy = vec![false; capacity as usize];
        table.live = 0;
        table.kept = 0;
        table.epoch += 1;
    }

    /// Forgets every claim. Does not touch the device's binding point.
    pub fn cleanup(&self) {
        let mut table = self.table.borrow_mut();
        table.busy.iter_mut().for_each(|b| *b = false);
        table.live = 0;
        table.kept = 0;
        table.epoch += 1;
    }

    /// Claims the lowest free slot.
    ///
    /// `keep` marks a claim that stays bound across draws; it is counted in
    /// [`num_kept`](Self::num_kept) instead of
    /// [`num_active_transient`](Self::num_active_transient).
    ///
    /// # Errors
    ///
    /// [`SlotError::Exhausted`] when every slot is taken.
    pub fn acquire(&self, keep: bool) -> Result<SlotClaim, SlotError> {
        let mut table = self.table.borrow_mut();
        let capacity = table.busy.len() as u32;
        let Some(slot) = table.busy.iter().position(|busy| !busy) else {
            log::error!("sampling slot requested but all {capacity} are in use");
            return Err(SlotError::Exhausted { capacity });
        };
        table.busy[slot] = true;
        table.live += 1;
        if keep {
            table.kept += 1;
        }
        log::trace!("acquired sampling slot {slot} (keep: {keep})");
        Ok(SlotClaim {
            slot: slot as u32,
            keep,
            epoch: table.epoch,
            table: Some(Rc::clone(&self.table)),
        })
    }

    /// Number of slots, free or busy.
    pub fn capacity(&self) -> u32 {
        self.table.borrow().busy.len() as u32
    }

    /// Claims currently held, kept and transient.
    pub fn num_live(&self) -> u32 {
        self.table.borrow().live
    }

    /// Claims made with `keep = true` still held.
    pub fn num_kept(&self) -> u32 {
        self.table.borrow().kept
    }

    /// Claims made with `keep = false` still held. Nonzero after a
    /// processor returns means it leaked a claim.
    pub fn num_active_transient(&self) -> u32 {
        let table = self.table.borrow();
        table.live - table.kept
    }

    /// Whether `slot` is claimed. Out-of-range slots are never busy.
    pub fn is_busy(&self, slot: u32) -> bool {
        self.table
            .borrow()
            .busy
            .get(slot as usize)
            .copied()
            .unwrap_or(false)
    }
}

/// A claimed sampling slot. Released on drop.
///
/// A claim outliving a call to [`SlotAllocator::init`] or
/// [`SlotAllocator::cleanup`] is inert: releasing it leaves the new table
/// alone.
#[derive(Debug)]
pub struct SlotClaim {
    slot: u32,
    keep: bool,
    epoch: u64,
    table: Option<Rc<RefCell<SlotTable>>>,
}

impl SlotClaim {
    /// The binding point this claim owns.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Whether the claim was made with `keep = true`.
    pub fn is_kept(&self) -> bool {
        self.keep
    }

    /// Releases the slot now instead of at end of scope.
    pub fn release(mut self) {
        self.free();
    }

    fn free(&mut self) {
        let Some(table) = self.table.take() else {
            return;
        };
        let mut table = table.borrow_mut();
        if table.epoch != self.epoch {
            return;
        }
        let slot = self.slot as usize;
        debug_assert!(table.busy[slot], "sampling slot {slot} released twice");
        table.busy[slot] = false;
        table.live -= 1;
        if self.keep {
            table.kept -= 1;
        }
        log::trace!("released sampling slot {slot}");
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exhaustion_after_capacity() {
        let slots = SlotAllocator::new(4);
        let claims: Vec<_> = (0..4).map(|_| slots.acquire(false).unwrap()).collect();
        let mut seen: Vec<u32> = claims.iter().map(SlotClaim::slot).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(slots.acquire(false).err(), Some(SlotError::Exhausted { capacity: 4 }));
    }

    #[test]
    fn released_slot_is_reused_first() {
        let slots = SlotAllocator::new(4);
        let mut claims: Vec<_> = (0..4).map(|_| slots.acquire(false).unwrap()).collect();
        let second = claims.remove(2);
        assert_eq!(second.slot(), 2);
        second.release();
        assert!(!slots.is_busy(2));
        assert_eq!(slots.acquire(false).unwrap().slot(), 2);
    }

    #[test]
    fn kept_and_transient_are_counted_apart() {
        let slots = SlotAllocator::new(8);
        let kept = slots.acquire(true).unwrap();
        let transient = slots.acquire(false).unwrap();
        assert!(kept.is_kept());
        assert_eq!(slots.num_kept(), 1);
        assert_eq!(slots.num_active_transient(), 1);
        drop(transient);
        assert_eq!(slots.num_active_transient(), 0);
        assert_eq!(slots.num_kept(), 1);
        drop(kept);
        assert_eq!(slots.num_live(), 0);
    }

    #[test]
    fn claims_from_before_cleanup_are_inert() {
        let slots = SlotAllocator::new(2);
        let stale = slots.acquire(false).unwrap();
        slots.cleanup();
        let fresh = slots.acquire(false).unwrap();
        assert_eq!(fresh.slot(), 0);
        drop(stale);
        assert!(slots.is_busy(0));
        assert_eq!(slots.num_live(), 1);
    }

    #[test]
    fn init_resizes() {
        let slots = SlotAllocator::new(2);
        slots.init(5);
        assert_eq!(slots.capacity(), 5);
        assert_eq!(slots.num_live(), 0);
    }

    proptest! {
        #[test]
        fn acquire_is_first_fit(capacity in 1u32..24, ops in prop::collection::vec(any::<(bool, u8)>(), 0..64)) {
            let slots = SlotAllocator::new(capacity);
            let mut held: Vec<SlotClaim> = Vec::new();
            for (acquire, pick) in ops {
                if acquire || held.is_empty() {
                    let lowest_free = (0..capacity).find(|s| !slots.is_busy(*s));
                    match slots.acquire(false) {
                        Ok(claim) => {
                            prop_assert_eq!(Some(claim.slot()), lowest_free);
                            held.push(claim);
                        }
                        Err(SlotError::Exhausted { .. }) => prop_assert_eq!(lowest_free, None),
                    }
                } else {
                    let index = pick as usize % held.len();
                    held.remove(index).release();
                }
                prop_assert_eq!(slots.num_live() as usize, held.len());
            }
        }
    }
}
