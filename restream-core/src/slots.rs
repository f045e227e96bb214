//! Fixed ring of reusable raw-frame buffers.
//!
//! The capture thread writes into the pool, the scheduler thread reads
//! from it. Ownership of a slot is handed over through its
//! `ready_to_fill` flag:
//!
//! ```text
//!  producer                          scheduler
//!  claim_next_writable ──► fill ──► commit ──(notify)──► borrow_for_read ──► release
//!        ▲                                                                      │
//!        └────────────────────── ready_to_fill = true ◄─────────────────────────┘
//! ```
//!
//! When the next slot in round-robin order is still owned by the
//! scheduler the incoming frame is dropped. The producer never waits.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::trace;

use crate::error::StreamError;

/// One reusable raw-frame buffer.
struct FrameSlot {
    buf: Mutex<Vec<u8>>,
    ready_to_fill: AtomicBool,
    /// Pool generation the current contents were written under.
    filled_in: AtomicU64,
}

/// Round-robin pool of [`FrameSlot`]s with drop-on-contention.
///
/// Designed for one producer and one consumer.
pub struct FrameSlotPool {
    slots: Vec<FrameSlot>,
    last_index: AtomicUsize,
    generation: AtomicU64,
    slot_size: usize,
}

impl FrameSlotPool {
    /// Allocate `count` slots of `slot_size` bytes each.
    pub fn new(count: usize, slot_size: usize) -> Self {
        let slots = (0..count.max(1))
            .map(|_| FrameSlot {
                buf: Mutex::new(vec![0u8; slot_size]),
                ready_to_fill: AtomicBool::new(true),
                filled_in: AtomicU64::new(0),
            })
            .collect();
        Self {
            slots,
            last_index: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            slot_size,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Current generation. Bumped by [`reset`](Self::reset); consumers
    /// tag notifications with it to recognise stale ones.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Next slot in round-robin order if it is free, `None` if busy.
    pub fn claim_next_writable(&self) -> Option<usize> {
        let target = (self.last_index.load(Ordering::Acquire) + 1) % self.slots.len();
        if self.slots[target].ready_to_fill.load(Ordering::Acquire) {
            Some(target)
        } else {
            None
        }
    }

    /// Write into a claimed slot.
    pub fn fill<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, StreamError> {
        let slot = self.slot(index)?;
        let mut buf = slot.buf.lock();
        Ok(f(buf.as_mut_slice()))
    }

    /// Hand a filled slot over to the reader.
    pub fn commit(&self, index: usize) -> Result<(), StreamError> {
        let slot = self.slot(index)?;
        slot.ready_to_fill.store(false, Ordering::Release);
        self.last_index.store(index, Ordering::Release);
        Ok(())
    }

    /// Read access to a committed slot.
    pub fn borrow_for_read(&self, index: usize) -> Result<MappedMutexGuard<'_, [u8]>, StreamError> {
        let slot = self.slot(index)?;
        Ok(MutexGuard::map(slot.buf.lock(), |v| v.as_mut_slice()))
    }

    /// Give a slot back to the producer.
    pub fn release(&self, index: usize) -> Result<(), StreamError> {
        let slot = self.slot(index)?;
        slot.ready_to_fill.store(true, Ordering::Release);
        Ok(())
    }

    /// Claim, fill and commit in one go.
    ///
    /// Returns the committed index, or `None` when the frame was dropped
    /// because the target slot is still being consumed.
    pub fn offer(
        &self,
        f: impl FnOnce(&mut [u8]) -> Result<(), StreamError>,
    ) -> Result<Option<usize>, StreamError> {
        Ok(self.offer_tagged(f)?.map(|(index, _)| index))
    }

    /// Like [`offer`](Self::offer), also returning the generation the
    /// frame was written under. The generation is read before the slot
    /// is claimed, so a concurrent [`reset`](Self::reset) always makes
    /// the frame stale.
    pub fn offer_tagged(
        &self,
        f: impl FnOnce(&mut [u8]) -> Result<(), StreamError>,
    ) -> Result<Option<(usize, u64)>, StreamError> {
        let generation = self.generation();
        let Some(index) = self.claim_next_writable() else {
            trace!("frame slot busy, dropping frame");
            return Ok(None);
        };
        self.fill(index, f)??;
        self.commit(index)?;
        self.slots[index].filled_in.store(generation, Ordering::Release);
        Ok(Some((index, generation)))
    }

    /// Release a slot whose notification turned out stale, unless the
    /// slot has since been refilled under a newer generation.
    pub fn release_stale(&self, index: usize, generation: u64) -> Result<bool, StreamError> {
        let slot = self.slot(index)?;
        if slot.filled_in.load(Ordering::Acquire) != generation {
            return Ok(false);
        }
        slot.ready_to_fill.store(true, Ordering::Release);
        Ok(true)
    }

    /// Make every slot writable again and rewind the cursor.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        for slot in &self.slots {
            slot.ready_to_fill.store(true, Ordering::Release);
        }
        self.last_index.store(0, Ordering::Release);
    }

    /// Whether the slot at `index` is free for the producer.
    pub fn is_ready_to_fill(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|s| s.ready_to_fill.load(Ordering::Acquire))
    }

    fn slot(&self, index: usize) -> Result<&FrameSlot, StreamError> {
        self.slots.get(index).ok_or(StreamError::BadIndex {
            index,
            len: self.slots.len(),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn write(pool: &FrameSlotPool, byte: u8) -> Option<usize> {
        pool.offer(|buf| {
            buf.fill(byte);
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn round_robin_starts_after_zero() {
        let pool = FrameSlotPool::new(3, 4);
        assert_eq!(write(&pool, 1), Some(1));
        assert_eq!(write(&pool, 2), Some(2));
        assert_eq!(write(&pool, 3), Some(0));
    }

    #[test]
    fn busy_slot_drops_frame() {
        let pool = FrameSlotPool::new(2, 4);
        assert_eq!(write(&pool, 1), Some(1));
        assert_eq!(write(&pool, 2), Some(0));
        // Slot 1 was never released.
        assert_eq!(write(&pool, 3), None);
        pool.release(1).unwrap();
        assert_eq!(write(&pool, 4), Some(1));
        assert_eq!(pool.borrow_for_read(1).unwrap()[0], 4);
    }

    #[test]
    fn committed_slot_is_not_writable() {
        let pool = FrameSlotPool::new(4, 4);
        let idx = write(&pool, 9).unwrap();
        assert!(!pool.is_ready_to_fill(idx));
        pool.release(idx).unwrap();
        assert!(pool.is_ready_to_fill(idx));
    }

    #[test]
    fn reset_frees_everything() {
        let pool = FrameSlotPool::new(2, 4);
        write(&pool, 1);
        write(&pool, 2);
        let before = pool.generation();
        pool.reset();
        assert_eq!(pool.generation(), before + 1);
        assert!(pool.is_ready_to_fill(0));
        assert!(pool.is_ready_to_fill(1));
        assert_eq!(write(&pool, 3), Some(1));
    }

    #[test]
    fn frame_committed_across_reset_is_stale_and_reclaimable() {
        let pool = FrameSlotPool::new(2, 4);
        let (idx, generation) = pool
            .offer_tagged(|buf| {
                // Camera switch lands while the frame is being written.
                pool.reset();
                buf.fill(7);
                Ok(())
            })
            .unwrap()
            .unwrap();
        assert_ne!(generation, pool.generation());
        assert!(!pool.is_ready_to_fill(idx));
        assert!(pool.release_stale(idx, generation).unwrap());
        assert!(pool.is_ready_to_fill(idx));
    }

    #[test]
    fn refilled_slot_is_not_released_by_stale_notice() {
        let pool = FrameSlotPool::new(2, 4);
        let (idx, old) = pool.offer_tagged(|_| Ok(())).unwrap().unwrap();
        pool.reset();
        let (again, new) = pool.offer_tagged(|_| Ok(())).unwrap().unwrap();
        assert_eq!(idx, again);
        assert!(!pool.release_stale(idx, old).unwrap());
        assert!(!pool.is_ready_to_fill(idx));
        assert!(pool.release_stale(idx, new).unwrap());
    }

    #[test]
    fn bad_index_is_an_error() {
        let pool = FrameSlotPool::new(2, 4);
        assert!(matches!(
            pool.commit(7),
            Err(StreamError::BadIndex { index: 7, len: 2 })
        ));
    }

    #[test]
    fn producer_never_writes_a_slot_under_read() {
        let pool = Arc::new(FrameSlotPool::new(3, 64));
        let (tx, rx) = crossbeam_channel::unbounded::<usize>();

        let reader = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let mut seen = 0;
                while let Ok(idx) = rx.recv() {
                    {
                        let view = pool.borrow_for_read(idx).unwrap();
                        let first = view[0];
                        // Slot content must be uniform: no torn write.
                        assert!(view.iter().all(|b| *b == first));
                    }
                    pool.release(idx).unwrap();
                    seen += 1;
                }
                seen
            })
        };

        let mut accepted = 0;
        for i in 0..2000u32 {
            if let Some(idx) = write(&pool, (i % 251) as u8) {
                tx.send(idx).unwrap();
                accepted += 1;
            }
        }
        drop(tx);
        assert_eq!(reader.join().unwrap(), accepted);
    }
}
