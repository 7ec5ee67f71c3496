//! Shared-region wire format.
//!
//! These `repr(C)` structures are the cross-process contract; an independent
//! consumer implementation must reproduce them byte for byte.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  RegionHeader (128 B, 64-byte aligned)                         │
//! │   version │ slot_count │ slots_offset │ slot_stride │ size     │
//! │   video descriptor │ write_index │ read_index │ counters       │
//! ├────────────────────────────────────────────────────────────────┤
//! │  FrameSlot[0]   (64 B record + inline payload capacity)        │
//! ├────────────────────────────────────────────────────────────────┤
//! │  FrameSlot[1]                                                  │
//! ├────────────────────────────────────────────────────────────────┤
//! │  ...                                                           │
//! ├────────────────────────────────────────────────────────────────┤
//! │  FrameSlot[slot_count - 1]                                     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Indices are monotonic 64-bit counters, never reset; the physical slot of
//! index `i` is `i % slot_count`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Protocol version tag. ASCII "FRING" in the high bytes doubles as a magic
/// number; the low bytes carry the revision. Producer and consumer must match
/// bit for bit.
pub const PROTOCOL_VERSION: u64 = 0x4652_494E_4700_0001;

/// Slot array alignment; the header is padded out to this boundary.
pub const SLOT_ALIGN: u64 = 64;

/// Sentinel for an absent media timestamp.
pub const TIME_NONE: u64 = u64::MAX;

/// Opaque cross-process reference to a GPU-resident resource. The ring
/// stores, copies, and invalidates the bit pattern but never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalHandle(pub u64);

impl ExternalHandle {
    pub const NULL: ExternalHandle = ExternalHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Stream format, written once by the producer at region creation. The
/// consumer treats it as immutable.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub fps_num: u32,
    pub fps_den: u32,
}

/// Per-frame metadata supplied by the producer. Timestamps are in
/// nanoseconds; `TIME_NONE` marks an absent value.
#[derive(Debug, Clone, Copy)]
pub struct FrameMetadata {
    pub decode_time: u64,
    pub presentation_time: u64,
    pub duration: u64,
    pub discontinuity: bool,
}

impl Default for FrameMetadata {
    fn default() -> Self {
        FrameMetadata {
            decode_time: TIME_NONE,
            presentation_time: TIME_NONE,
            duration: 0,
            discontinuity: false,
        }
    }
}

/// Ownership governor state. `Owned` means "still needed by the side that
/// has not yet consumed it". Transitions happen only under the region lock:
/// the producer performs `Free -> Owned` at publish; `Owned -> Free` is the
/// consumer's acknowledgement, or the producer's forced reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Free = 0,
    Owned = 1,
}

impl SlotState {
    pub(crate) fn from_raw(raw: u32) -> SlotState {
        match raw {
            1 => SlotState::Owned,
            _ => SlotState::Free,
        }
    }
}

#[repr(C, align(64))]
pub struct RegionHeader {
    pub(crate) version: AtomicU64,
    pub(crate) slot_count: u64,
    pub(crate) slots_offset: u64,
    pub(crate) slot_stride: u64,
    pub(crate) region_size: u64,
    pub(crate) video: VideoDescriptor,
    _reserved: u32,
    pub(crate) write_index: AtomicU64,
    pub(crate) read_index: AtomicU64,
    pub(crate) dropped_frames: AtomicU64,
    pub(crate) forced_reclaims: AtomicU64,
    pub(crate) stopped: AtomicU32,
    _tail: [u8; 28],
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == 128);
const _: () = assert!(std::mem::size_of::<RegionHeader>() as u64 % SLOT_ALIGN == 0);

impl RegionHeader {
    /// Static fields only; `version` starts at zero and is stored last by
    /// the creator so openers never observe a half-written header.
    pub(crate) fn new(
        slot_count: u64,
        slot_stride: u64,
        region_size: u64,
        video: VideoDescriptor,
    ) -> Self {
        RegionHeader {
            version: AtomicU64::new(0),
            slot_count,
            slots_offset: slots_offset(),
            slot_stride,
            region_size,
            video,
            _reserved: 0,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            forced_reclaims: AtomicU64::new(0),
            stopped: AtomicU32::new(0),
            _tail: [0; 28],
        }
    }
}

/// One ring position. Overwritten in place for the lifetime of the region;
/// only `ownership_state` and handle validity ever change meaning. An inline
/// payload area of fixed capacity follows the record within the slot stride.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub decode_time: u64,
    pub presentation_time: u64,
    pub duration: u64,
    pub discontinuity: u8,
    _pad: [u8; 7],
    pub payload_size: u64,
    pub external_handle: u64,
    pub sequence_number: u64,
    pub ownership_state: u32,
    _pad2: u32,
}

const _: () = assert!(std::mem::size_of::<FrameSlot>() == 64);

impl FrameSlot {
    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.ownership_state)
    }

    pub(crate) fn set_state(&mut self, state: SlotState) {
        self.ownership_state = state as u32;
    }
}

pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

pub(crate) const fn slots_offset() -> u64 {
    std::mem::size_of::<RegionHeader>() as u64
}

pub(crate) const fn slot_stride(slot_capacity: u64) -> u64 {
    align_up(
        std::mem::size_of::<FrameSlot>() as u64 + slot_capacity,
        SLOT_ALIGN,
    )
}

pub(crate) const fn region_size(slot_count: u64, slot_capacity: u64) -> u64 {
    slots_offset() + slot_count * slot_stride(slot_capacity)
}
