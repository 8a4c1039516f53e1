//! On-disk/in-memory layout of the shared region (spec §3, §4.1 — C1).
//!
//! The layout is fixed and host-native little-endian; this client targets
//! x86_64 only and does not attempt to byteswap. Every accessor here
//! validates offsets against the mapped region's length before
//! dereferencing — the slab is addressed by offset, never by raw pointer,
//! and an out-of-range offset is a [`VmError::Corrupt`], not a panic.

use crate::error::{VmError, VmResult};
use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Sentinel bytes every valid region starts with.
pub const MAGIC: [u8; 8] = *b"VMDISP01";

/// Header/wire format version this client implements.
pub const VERSION: u32 = 1;

/// Maximum number of queue descriptors carried in the header. The core
/// only ever subscribes to [`QueueId::Frame`] and [`QueueId::Pointer`];
/// remaining slots are reserved and ignored (spec §6).
pub const MAX_QUEUES: usize = 4;

/// Ring capacity (slot count) used for both the frame and pointer queues.
pub const RING_CAPACITY: u32 = 8;

/// Well-known queue ids the core subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    Frame = 0,
    Pointer = 1,
}

/// Fixed region header. `repr(C)` and `Pod` so it can be read directly out
/// of the mapped byte range without field-by-field parsing.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RegionHeader {
    pub magic: [u8; 8],
    pub version: u32,
    /// Monotonic; changes whenever the host (re)initializes the region.
    pub session_id: u32,
    /// Host-maintained counter or timestamp; stalling indicates the host
    /// has wedged or exited without tearing down the region.
    pub heartbeat: u64,
    pub queue_count: u32,
    _reserved: u32,
    pub queues: [QueueDescriptor; MAX_QUEUES],
}

/// One queue's ring metadata, embedded inline in the header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueueDescriptor {
    /// `0` means "inactive": the host hasn't published this queue.
    pub active: u32,
    /// Ring capacity, power-of-two recommended.
    pub capacity: u32,
    /// Next slot index the producer will fill.
    pub write_index: u32,
    /// Next slot index the (sole) consumer will read.
    pub read_index: u32,
    /// One bit per slot: set while a message is delivered but not yet
    /// released via `message_done`.
    pub pending_ack: u64,
    /// Byte offset of this queue's slab, relative to the region base.
    pub slab_offset: u64,
    /// Byte length of this queue's slab (`capacity * size_of::<MessageSlot>()`).
    pub slab_len: u64,
}

/// One fixed-capacity slot in a queue's slab.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MessageSlot {
    /// Monotonic per-queue sequence number, assigned at publish time.
    pub seq: u64,
    /// Opaque producer flags/word (spec §3: `udata:u32`).
    pub udata: u32,
    pub _pad: u32,
    /// Byte length of the payload.
    pub payload_len: u64,
    /// Byte offset of the payload within the shared data arena (region
    /// base + this offset), not a raw pointer.
    pub payload_offset: u64,
}

/// Borrowed view over a mapped shared-memory region. Holds no ownership of
/// the mapping itself — that's the caller's responsibility (e.g. an
/// `ivshmem` opener outside this crate's scope) — only the `{base, len}`
/// pair named in spec §6.
pub struct Region<'a> {
    bytes: &'a [u8],
}

impl<'a> Region<'a> {
    /// Wrap a byte range. Does not itself validate the header; callers
    /// that need a validated session should go through
    /// [`crate::session::Session::init`].
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read the fixed header at offset 0.
    pub fn header(&self) -> VmResult<&RegionHeader> {
        let size = std::mem::size_of::<RegionHeader>();
        let slice = self
            .bytes
            .get(0..size)
            .ok_or(VmError::Corrupt("region shorter than header"))?;
        Ok(bytemuck::from_bytes(slice))
    }

    /// Validate and return the slot array for a queue descriptor.
    pub fn slab(&self, desc: &QueueDescriptor) -> VmResult<&[MessageSlot]> {
        let offset = desc.slab_offset as usize;
        let len = desc.slab_len as usize;
        let end = offset
            .checked_add(len)
            .ok_or(VmError::Corrupt("slab offset+len overflow"))?;
        if end > self.bytes.len() {
            return Err(VmError::Corrupt("slab out of bounds"));
        }
        let slice = &self.bytes[offset..end];
        let slot_size = std::mem::size_of::<MessageSlot>();
        if slice.len() % slot_size != 0 {
            return Err(VmError::Corrupt("slab length not a multiple of slot size"));
        }
        Ok(bytemuck::cast_slice(slice))
    }

    /// Validate and return a payload slice referenced by a slot, bounds
    /// checked against the region (spec §4.1: "validate offset+len <=
    /// region.len before dereferencing").
    pub fn payload(&self, slot: &MessageSlot) -> VmResult<&[u8]> {
        let offset = slot.payload_offset as usize;
        let len = slot.payload_len as usize;
        let end = offset
            .checked_add(len)
            .ok_or(VmError::Corrupt("payload offset+len overflow"))?;
        self.bytes
            .get(offset..end)
            .ok_or(VmError::Corrupt("payload out of bounds"))
    }

    /// Atomic view of the host heartbeat counter. The host is the sole
    /// writer; the client only ever loads it.
    pub fn heartbeat_atomic(&self) -> VmResult<&AtomicU64> {
        let header = self.header()?;
        let ptr = std::ptr::addr_of!(header.heartbeat) as *mut u64;
        // SAFETY: `ptr` points into the live mapped region at a field of
        // type u64 that the host writes without synchronization other
        // than this atomic load; 8-byte alignment is guaranteed by
        // RegionHeader's repr(C) layout.
        Ok(unsafe { AtomicU64::from_ptr(ptr) })
    }

    /// Atomic view of a queue descriptor's producer write index. The host
    /// is the sole writer; the client only loads it.
    pub fn write_index_atomic(&self, queue: QueueId) -> VmResult<&AtomicU32> {
        let header = self.header()?;
        let desc = &header.queues[queue as usize];
        let ptr = std::ptr::addr_of!(desc.write_index) as *mut u32;
        // SAFETY: see `heartbeat_atomic`; 4-byte alignment guaranteed.
        Ok(unsafe { AtomicU32::from_ptr(ptr) })
    }

    /// Atomic view of a queue descriptor's consumer read index. This
    /// client is the sole writer of this field.
    pub fn read_index_atomic(&self, queue: QueueId) -> VmResult<&AtomicU32> {
        let header = self.header()?;
        let desc = &header.queues[queue as usize];
        let ptr = std::ptr::addr_of!(desc.read_index) as *mut u32;
        // SAFETY: see `heartbeat_atomic`.
        Ok(unsafe { AtomicU32::from_ptr(ptr) })
    }

    /// Atomic view of a queue descriptor's pending-ack bitmap. This client
    /// is the sole writer of this field.
    pub fn pending_ack_atomic(&self, queue: QueueId) -> VmResult<&AtomicU64> {
        let header = self.header()?;
        let desc = &header.queues[queue as usize];
        let ptr = std::ptr::addr_of!(desc.pending_ack) as *mut u64;
        // SAFETY: see `heartbeat_atomic`.
        Ok(unsafe { AtomicU64::from_ptr(ptr) })
    }

    /// Plain (non-atomic) snapshot of a queue descriptor, for fields that
    /// are fixed once the host activates the queue (`active`, `capacity`,
    /// `slab_offset`, `slab_len`).
    pub fn queue_descriptor(&self, queue: QueueId) -> VmResult<QueueDescriptor> {
        Ok(self.header()?.queues[queue as usize])
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build an in-memory region with one active frame queue holding the
    /// given payloads, for use by session/queue scenario tests (spec §8).
    pub fn build_region(payloads: &[&[u8]]) -> Vec<u8> {
        let header_size = std::mem::size_of::<RegionHeader>();
        let slot_size = std::mem::size_of::<MessageSlot>();
        let slab_len = RING_CAPACITY as usize * slot_size;
        let arena_offset = header_size + slab_len;
        let mut arena = Vec::new();
        let mut slots = vec![MessageSlot::zeroed(); RING_CAPACITY as usize];

        for (i, payload) in payloads.iter().enumerate() {
            let offset = arena_offset + arena.len();
            arena.extend_from_slice(payload);
            slots[i] = MessageSlot {
                seq: i as u64 + 1,
                udata: 0,
                _pad: 0,
                payload_len: payload.len() as u64,
                payload_offset: offset as u64,
            };
        }

        let mut queues = [QueueDescriptor::zeroed(); MAX_QUEUES];
        queues[QueueId::Frame as usize] = QueueDescriptor {
            active: 1,
            capacity: RING_CAPACITY,
            write_index: payloads.len() as u32 % RING_CAPACITY,
            read_index: 0,
            pending_ack: 0,
            slab_offset: header_size as u64,
            slab_len: slab_len as u64,
        };

        let header = RegionHeader {
            magic: MAGIC,
            version: VERSION,
            session_id: 1,
            heartbeat: 1,
            queue_count: MAX_QUEUES as u32,
            _reserved: 0,
            queues,
        };

        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        bytes.extend_from_slice(bytemuck::cast_slice(&slots));
        bytes.extend_from_slice(&arena);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::build_region;

    #[test]
    fn header_round_trips_through_bytes() {
        let bytes = build_region(&[b"hello", b"world"]);
        let region = Region::new(&bytes);
        let header = region.header().unwrap();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.session_id, 1);
    }

    #[test]
    fn slab_rejects_out_of_bounds_descriptor() {
        let bytes = build_region(&[b"hi"]);
        let header = Region::new(&bytes).header().unwrap().clone_for_test();
        let mut desc = header.queues[QueueId::Frame as usize];
        desc.slab_len = bytes.len() as u64 * 2; // claim more than the region holds
        let region = Region::new(&bytes);
        assert!(matches!(region.slab(&desc), Err(VmError::Corrupt(_))));
    }

    #[test]
    fn payload_out_of_bounds_is_corrupt() {
        let bytes = build_region(&[b"hi"]);
        let region = Region::new(&bytes);
        let mut bad_slot = MessageSlot::zeroed();
        bad_slot.payload_offset = bytes.len() as u64;
        bad_slot.payload_len = 16;
        assert!(matches!(
            region.payload(&bad_slot),
            Err(VmError::Corrupt(_))
        ));
    }
}

#[cfg(test)]
impl RegionHeader {
    fn clone_for_test(&self) -> Self {
        *self
    }
}
