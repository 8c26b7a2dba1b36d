//! Message and packet buffer management.
//!
//! [`MsgBuffer`] is the user-visible payload container: a contiguous,
//! cache-line-aligned allocation with room for one packet header ahead of the
//! payload. Ownership moves into the endpoint at `enqueue_request` and moves
//! back out through the continuation.
//!
//! [`PktBufPool`] backs the datapath: one contiguous page-aligned region
//! carved into MTU-sized slots, registered with the transport once, with an
//! index-stack free list.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;
use crate::transport::MemKey;

/// Alignment for message buffers (cache line).
pub const MSG_BUFFER_ALIGN: usize = 64;

/// Page size alignment for the packet buffer pool.
pub const PAGE_SIZE: usize = 4096;

/// A reusable payload container with reserved packet-header room.
///
/// The payload length may be resized to any value up to the original
/// allocation; the allocation itself never moves, so the transport can read
/// it in place for the lifetime of an exchange.
pub struct MsgBuffer {
    /// Start of the allocation (header region).
    ptr: NonNull<u8>,
    /// Payload capacity in bytes (allocation is PKT_HDR_SIZE larger).
    capacity: usize,
    /// Current payload length.
    len: usize,
    /// Transport registration key, set at allocation.
    lkey: Option<MemKey>,
}

impl MsgBuffer {
    /// Allocate an unregistered buffer with the given payload capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("buffer capacity cannot be 0".into()));
        }

        let layout = Layout::from_size_align(PKT_HDR_SIZE + capacity, MSG_BUFFER_ALIGN)
            .map_err(|_| Error::InvalidConfig("invalid buffer layout".into()))?;

        let ptr = unsafe {
            let ptr = alloc(layout);
            if ptr.is_null() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "failed to allocate buffer",
                )));
            }
            NonNull::new_unchecked(ptr)
        };

        Ok(Self {
            ptr,
            capacity,
            len: capacity,
            lkey: None,
        })
    }

    /// Record the transport registration key.
    pub(crate) fn set_lkey(&mut self, key: MemKey) {
        self.lkey = Some(key);
    }

    /// Transport registration key, if registered.
    #[inline]
    pub fn lkey(&self) -> Option<MemKey> {
        self.lkey
    }

    /// Payload capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the payload is empty. A zero-length response payload is the
    /// failure signal for a completed exchange.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the payload length.
    ///
    /// # Panics
    /// Panics if `len` exceeds the payload capacity.
    #[inline]
    pub(crate) fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity);
        self.len = len;
    }

    /// Shrink or re-grow the payload within the original allocation.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.capacity {
            return Err(Error::BufferTooSmall {
                required: new_len,
                available: self.capacity,
            });
        }
        self.len = new_len;
        Ok(())
    }

    /// Start of the allocation, including the header region.
    #[inline]
    pub(crate) fn hdr_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    fn payload_ptr(&self) -> *const u8 {
        unsafe { self.ptr.as_ptr().add(PKT_HDR_SIZE) }
    }

    #[inline]
    fn payload_mut_ptr(&mut self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(PKT_HDR_SIZE) }
    }

    /// Payload as a byte slice.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload_ptr(), self.len) }
    }

    /// Payload as a mutable byte slice.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        unsafe { std::slice::from_raw_parts_mut(self.payload_mut_ptr(), len) }
    }

    /// Full payload capacity as a mutable slice, regardless of length.
    #[inline]
    pub(crate) fn capacity_mut(&mut self) -> &mut [u8] {
        let cap = self.capacity;
        unsafe { std::slice::from_raw_parts_mut(self.payload_mut_ptr(), cap) }
    }

    /// Copy data into the payload and set the length accordingly.
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Err(Error::BufferTooSmall {
                required: data.len(),
                available: self.capacity,
            });
        }
        self.capacity_mut()[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }
}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .field("registered", &self.lkey.is_some())
            .finish()
    }
}

impl Drop for MsgBuffer {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(PKT_HDR_SIZE + self.capacity, MSG_BUFFER_ALIGN).unwrap();
        unsafe {
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

// MsgBuffer owns its allocation; handles carrying one may cross into a
// background worker and back.
unsafe impl Send for MsgBuffer {}

/// Packet buffer pool: one page-aligned region, one registration.
///
/// Slots hold a full packet (header plus payload) and are addressed by index
/// so TX bookkeeping and completions stay copy-free. The free list is a
/// plain index stack; the pool is fixed-size and single-threaded, so alloc
/// and free are a pop and a push.
pub struct PktBufPool {
    buffer: *mut u8,
    slot_size: usize,
    num_slots: usize,
    free: Vec<u32>,
    lkey: Option<MemKey>,
}

impl PktBufPool {
    /// Create a pool of `num_slots` buffers of `slot_size` bytes each.
    pub fn new(num_slots: usize, slot_size: usize) -> Result<Self> {
        if num_slots == 0 {
            return Err(Error::InvalidConfig("num_slots cannot be 0".into()));
        }
        if slot_size == 0 {
            return Err(Error::InvalidConfig("slot_size cannot be 0".into()));
        }

        // Cache-line align each slot
        let slot_size = (slot_size + MSG_BUFFER_ALIGN - 1) & !(MSG_BUFFER_ALIGN - 1);
        let total_size = num_slots * slot_size;

        let buffer = unsafe {
            let mut ptr: *mut libc::c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, PAGE_SIZE, total_size);
            if ret != 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    format!("posix_memalign failed: {}", ret),
                )));
            }
            std::ptr::write_bytes(ptr as *mut u8, 0, total_size);
            ptr as *mut u8
        };

        // Seeded in reverse so slot 0 is handed out first
        let free: Vec<u32> = (0..num_slots as u32).rev().collect();

        Ok(Self {
            buffer,
            slot_size,
            num_slots,
            free,
            lkey: None,
        })
    }

    /// The whole region, for one-shot transport registration.
    pub fn region(&self) -> (*const u8, usize) {
        (self.buffer, self.num_slots * self.slot_size)
    }

    /// Record the region's registration key. All slots share it.
    pub fn set_lkey(&mut self, key: MemKey) {
        self.lkey = Some(key);
    }

    /// Shared registration key.
    #[inline]
    pub fn lkey(&self) -> Option<MemKey> {
        self.lkey
    }

    /// Allocate a slot. Returns None when the pool is exhausted.
    #[inline]
    pub fn alloc(&mut self) -> Option<usize> {
        self.free.pop().map(|idx| idx as usize)
    }

    /// Return a slot to the pool.
    #[inline]
    pub fn free(&mut self, idx: usize) {
        debug_assert!(idx < self.num_slots);
        debug_assert!(self.free.len() < self.num_slots);
        self.free.push(idx as u32);
    }

    /// Slot contents as a slice.
    #[inline]
    pub fn slot(&self, idx: usize) -> &[u8] {
        debug_assert!(idx < self.num_slots);
        unsafe {
            let ptr = self.buffer.add(idx * self.slot_size);
            std::slice::from_raw_parts(ptr, self.slot_size)
        }
    }

    /// Slot contents as a mutable slice.
    #[inline]
    pub fn slot_mut(&mut self, idx: usize) -> &mut [u8] {
        debug_assert!(idx < self.num_slots);
        unsafe {
            let ptr = self.buffer.add(idx * self.slot_size);
            std::slice::from_raw_parts_mut(ptr, self.slot_size)
        }
    }

    /// Slot size in bytes.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of free slots.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of slots.
    #[inline]
    pub fn total(&self) -> usize {
        self.num_slots
    }
}

impl Drop for PktBufPool {
    fn drop(&mut self) {
        unsafe {
            libc::free(self.buffer as *mut libc::c_void);
        }
    }
}

unsafe impl Send for PktBufPool {}
