//! # Slot Table
//!
//! Fixed-capacity slot arena with a bitmap allocator.
//!
//! ```text
//!            table lock                    slot locks
//!   ┌──────────────────────────┐   ┌────┬────┬────┬─────┬────┐
//!   │ bitmap   1 1 0 1 0 ...   │   │ 0  │ 1  │ 2  │ ... │ N-1│
//!   │ dedup    identity → idx  │   └────┴────┴────┴─────┴────┘
//!   └──────────────────────────┘      ▲ reserved, never handed out
//! ```
//!
//! Lock order is slot, then table. The one place the table lock is held
//! while a slot lock is taken is `acquire`, and there the slot is free: its
//! lock can only be held by a teardown that has already given its bit back
//! and no longer needs the table.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::backend::Identity;
use crate::dedup::DedupIndex;
use crate::error::{Error, Result};
use crate::handle::BufferHandle;
use crate::slot::BufferSlot;

const WORD_BITS: usize = u64::BITS as usize;

/// State behind the table lock
#[derive(Debug)]
struct TableInner {
    /// One bit per slot; set means taken
    words: Vec<u64>,
    dedup: DedupIndex,
    in_use: usize,
    closing: bool,
}

impl TableInner {
    fn take_free(&mut self) -> Option<usize> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return Some(word_idx * WORD_BITS + bit);
            }
        }
        None
    }

    fn clear(&mut self, index: usize) -> bool {
        let mask = 1u64 << (index % WORD_BITS);
        let word = &mut self.words[index / WORD_BITS];
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }

    fn is_set(&self, index: usize) -> bool {
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }
}

/// Result of a dedup lookup
#[derive(Debug)]
pub enum Reservation<'a> {
    /// Identity already recorded at this index; lock and re-check the slot
    Existing(usize),
    /// New slot acquired and recorded for the identity
    Fresh {
        /// Slot index
        index: usize,
        /// Handle minted for the slot
        handle: BufferHandle,
        /// The slot, locked
        slot: MutexGuard<'a, BufferSlot>,
    },
}

/// Buffer slot table
#[derive(Debug)]
pub struct SlotTable {
    capacity: usize,
    inner: Mutex<TableInner>,
    slots: Box<[Mutex<BufferSlot>]>,
}

impl SlotTable {
    /// Create a table of `capacity` slots; slot 0 is marked used
    pub fn new(capacity: usize) -> Self {
        let word_count = capacity.div_ceil(WORD_BITS);
        let mut words = alloc::vec![0u64; word_count];

        // Reserved index 0
        words[0] |= 1;
        // Bits past the end of the table
        let tail = capacity % WORD_BITS;
        if tail != 0 {
            words[word_count - 1] |= u64::MAX << tail;
        }

        let slots = (0..capacity)
            .map(|_| Mutex::new(BufferSlot::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            capacity,
            inner: Mutex::new(TableInner {
                words,
                dedup: DedupIndex::with_capacity(capacity),
                in_use: 0,
                closing: false,
            }),
            slots,
        }
    }

    /// Number of slots, including slot 0
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently handed out
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Is bit `index` set?
    pub fn is_allocated(&self, index: usize) -> bool {
        index < self.capacity && self.inner.lock().is_set(index)
    }

    /// Stop handing out slots; returns false if already closing
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        !core::mem::replace(&mut inner.closing, true)
    }

    /// Has the table been closed?
    pub fn is_closing(&self) -> bool {
        self.inner.lock().closing
    }

    /// Slot lock for `index`
    #[inline]
    pub fn slot(&self, index: usize) -> Option<&Mutex<BufferSlot>> {
        self.slots.get(index)
    }

    /// Take the first free slot and bring it into use
    pub fn acquire(&self, now_ns: u64) -> Result<(usize, BufferHandle, MutexGuard<'_, BufferSlot>)> {
        let mut inner = self.inner.lock();
        self.acquire_locked(&mut inner, now_ns)
    }

    /// Look `identity` up in the dedup index, or acquire a slot and record
    /// the identity against it
    pub fn find_or_reserve(&self, identity: Identity, now_ns: u64) -> Result<Reservation<'_>> {
        let mut inner = self.inner.lock();
        if inner.closing {
            return Err(Error::ShuttingDown);
        }
        if let Some(index) = inner.dedup.find(identity) {
            return Ok(Reservation::Existing(index));
        }
        let (index, handle, slot) = self.acquire_locked(&mut inner, now_ns)?;
        inner.dedup.insert(identity, index);
        Ok(Reservation::Fresh { index, handle, slot })
    }

    /// Record `identity` for a slot created without a dedup lookup
    pub fn index_identity(&self, identity: Identity, index: usize) -> bool {
        self.inner.lock().dedup.insert(identity, index)
    }

    /// Give `index` back to the bitmap and drop its dedup entry
    ///
    /// The caller holds the slot lock and has already reset the slot.
    pub fn release(&self, index: usize, identity: Option<Identity>) {
        let mut inner = self.inner.lock();
        if let Some(identity) = identity {
            inner.dedup.remove(identity, index);
        }
        if index != 0 && index < self.capacity && inner.clear(index) {
            inner.in_use -= 1;
        } else {
            log::warn!("bufmgr: release of free slot {}", index);
        }
    }

    /// Lock the slot named by `handle` and check the handle is current
    pub fn lock(&self, handle: BufferHandle) -> Result<(usize, MutexGuard<'_, BufferSlot>)> {
        let index = handle.decode(self.capacity)?;
        let slot = self.slots[index].lock();
        if let Err(e) = slot.validate(handle) {
            log::warn!("bufmgr: stale handle {:?}", handle);
            return Err(e);
        }
        Ok((index, slot))
    }

    fn acquire_locked<'a>(
        &'a self,
        inner: &mut TableInner,
        now_ns: u64,
    ) -> Result<(usize, BufferHandle, MutexGuard<'a, BufferSlot>)> {
        if inner.closing {
            return Err(Error::ShuttingDown);
        }
        let Some(index) = inner.take_free() else {
            log::error!("bufmgr: all {} slots in use", self.capacity - 1);
            return Err(Error::TableFull);
        };
        inner.in_use += 1;

        let mut slot = self.slots[index].lock();
        let handle = slot.activate(index, now_ns);
        Ok((index, handle, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_zero_never_returned() {
        let table = SlotTable::new(8);
        assert!(table.is_allocated(0));
        for expected in 1..8 {
            let (index, handle, _) = table.acquire(0).unwrap();
            assert_eq!(index, expected);
            assert_eq!(handle.index(), expected);
        }
        assert_eq!(table.acquire(0).map(|_| ()), Err(Error::TableFull));
    }

    #[test]
    fn test_release_allows_reuse() {
        let table = SlotTable::new(4);
        let (index, first, mut slot) = table.acquire(0).unwrap();
        slot.reset();
        table.release(index, None);
        drop(slot);

        let (again, second, _) = table.acquire(0).unwrap();
        assert_eq!(again, index);
        assert_ne!(first, second);
        assert_eq!(table.in_use(), 1);
    }

    #[test]
    fn test_capacity_not_word_aligned() {
        let table = SlotTable::new(70);
        let mut seen = 0;
        while table.acquire(0).is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 69);
    }

    #[test]
    fn test_find_or_reserve() {
        let table = SlotTable::new(8);
        let index = match table.find_or_reserve(Identity(11), 0).unwrap() {
            Reservation::Fresh { index, .. } => index,
            Reservation::Existing(_) => panic!("unexpected dedup hit"),
        };
        match table.find_or_reserve(Identity(11), 0).unwrap() {
            Reservation::Existing(found) => assert_eq!(found, index),
            Reservation::Fresh { .. } => panic!("expected dedup hit"),
        }

        table.release(index, Some(Identity(11)));
        assert!(matches!(
            table.find_or_reserve(Identity(11), 0).unwrap(),
            Reservation::Fresh { .. }
        ));
    }

    #[test]
    fn test_lock_validates_handle() {
        let table = SlotTable::new(8);
        let (index, handle, mut slot) = table.acquire(0).unwrap();
        drop(slot);
        assert!(table.lock(handle).is_ok());

        slot = table.slot(index).unwrap().lock();
        slot.reset();
        table.release(index, None);
        drop(slot);
        assert_eq!(table.lock(handle).map(|(i, _)| i), Err(Error::InvalidHandle));
        assert_eq!(
            table.lock(BufferHandle::encode(0, 0)).map(|(i, _)| i),
            Err(Error::InvalidHandle)
        );
    }

    #[test]
    fn test_close_refuses_new_slots() {
        let table = SlotTable::new(8);
        assert!(table.close());
        assert!(!table.close());
        assert!(table.is_closing());
        assert_eq!(table.acquire(0).map(|_| ()), Err(Error::ShuttingDown));
    }
}
