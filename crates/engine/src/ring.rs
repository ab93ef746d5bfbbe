use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Slots in each channel's circular buffer.
pub const RING_SLOTS: usize = 8;

/// Fixed-depth byte ring shared between one driver callback (the writer)
/// and the alignment loop (the reader).
///
/// Slot transfers are plain memcpys with no per-slot locking so the driver
/// callback stays O(memcpy). The `produced` counter is the only
/// synchronization: the writer publishes a slot with a Release increment
/// and the reader observes it with an Acquire load. The reader must keep
/// pace: once the writer runs more than `RING_SLOTS - 1` blocks ahead, the
/// oldest unread slot is overwritten in place and a concurrent read of it
/// yields torn payload bytes. Indices are never affected.
pub struct Ring {
    buf: UnsafeCell<Box<[u8]>>,
    slot_len: usize,
    produced: AtomicU64,
}

// SAFETY: the writer side is confined to one driver callback at a time,
// the reader copies whole slots, and both go through raw-pointer copies
// rather than references into the shared region, so a lapped slot can
// only tear payload bytes.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(slot_len: usize) -> Self {
        Self {
            buf: UnsafeCell::new(vec![0u8; slot_len * RING_SLOTS].into_boxed_slice()),
            slot_len,
            produced: AtomicU64::new(0),
        }
    }

    /// Blocks delivered by the driver so far.
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    /// Copy one driver buffer into the next write slot and publish it.
    /// Only the owning channel's driver callback may call this.
    pub fn push(&self, data: &[u8]) {
        assert!(
            data.len() == self.slot_len,
            "driver delivered {} bytes, expected {}",
            data.len(),
            self.slot_len
        );
        let index = self.produced.load(Ordering::Relaxed);
        let base = (index % RING_SLOTS as u64) as usize * self.slot_len;
        // SAFETY: base + slot_len stays within the allocation, and no
        // other thread stores into this slot until `produced` wraps past
        // it again RING_SLOTS publishes later.
        unsafe {
            let dst = (*self.buf.get()).as_mut_ptr().add(base);
            ptr::copy_nonoverlapping(data.as_ptr(), dst, self.slot_len);
        }
        self.produced.fetch_add(1, Ordering::Release);
    }

    /// Copy the slot holding block `index` into `out`.
    pub fn read_into(&self, index: u64, out: &mut [u8]) {
        assert!(out.len() == self.slot_len);
        let base = (index % RING_SLOTS as u64) as usize * self.slot_len;
        // SAFETY: the range stays within the allocation; if the writer
        // has lapped this slot the copy yields torn bytes, which the
        // engine tolerates by contract.
        unsafe {
            let src = (*self.buf.get()).as_ptr().add(base);
            ptr::copy_nonoverlapping(src, out.as_mut_ptr(), self.slot_len);
        }
    }
}
