use crate::config::SessionConfig;
use crate::error::{Result, RingError};
use crate::layout::{
    self, FrameSlot, RegionHeader, SlotState, VideoDescriptor, PROTOCOL_VERSION,
};
use crate::memory::SharedMapping;
use std::sync::atomic::Ordering;
use tracing::info;

/// The memory-mapped block shared by producer and consumer: one header and
/// a fixed slot array. Created once per producer start, opened by name from
/// the consumer side. All slot mutation happens under the session lock; the
/// region itself only enforces layout and the ownership-state transitions.
pub struct Region {
    mapping: SharedMapping,
}

impl Region {
    pub fn create(
        config: &SessionConfig,
        slot_count: u64,
        slot_capacity: u64,
        video: VideoDescriptor,
    ) -> Result<Region> {
        config.validate()?;
        if slot_count == 0 {
            return Err(RingError::InvalidConfig("slot_count must be non-zero"));
        }
        let stride = layout::slot_stride(slot_capacity);
        let size = layout::region_size(slot_count, slot_capacity);
        let mapping = SharedMapping::create(&config.region_name(), size as usize)?;
        unsafe {
            (mapping.ptr() as *mut RegionHeader)
                .write(RegionHeader::new(slot_count, stride, size, video));
        }
        let region = Region { mapping };
        // publish the version last so openers never see a half-written header
        region
            .header()
            .version
            .store(PROTOCOL_VERSION, Ordering::Release);
        info!(
            name = %config.region_name(),
            slot_count,
            slot_capacity,
            region_size = size,
            "region created"
        );
        Ok(region)
    }

    pub fn open(config: &SessionConfig) -> Result<Region> {
        config.validate()?;
        let mapping = SharedMapping::open(&config.region_name())?;
        if mapping.len() < std::mem::size_of::<RegionHeader>() {
            return Err(RingError::RegionUnavailable);
        }
        let region = Region { mapping };
        match region.header().version.load(Ordering::Acquire) {
            0 => return Err(RingError::RegionUnavailable),
            PROTOCOL_VERSION => {}
            found => {
                return Err(RingError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    found,
                })
            }
        }
        region.validate_geometry()?;
        Ok(region)
    }

    fn validate_geometry(&self) -> Result<()> {
        let header = self.header();
        if header.slot_count == 0 {
            return Err(RingError::InvalidConfig("slot_count must be non-zero"));
        }
        if header.slots_offset != layout::slots_offset() {
            return Err(RingError::InvalidConfig("unexpected slot array offset"));
        }
        if header.slot_stride < std::mem::size_of::<FrameSlot>() as u64 {
            return Err(RingError::InvalidConfig("slot stride smaller than a slot"));
        }
        let expected = header.slots_offset + header.slot_count * header.slot_stride;
        if header.region_size != expected || (self.mapping.len() as u64) < expected {
            return Err(RingError::InvalidConfig("region size does not match layout"));
        }
        Ok(())
    }

    pub(crate) fn header(&self) -> &RegionHeader {
        unsafe { &*(self.mapping.ptr() as *const RegionHeader) }
    }

    pub fn slot_count(&self) -> u64 {
        self.header().slot_count
    }

    /// Usable inline payload bytes per slot.
    pub fn slot_capacity(&self) -> u64 {
        self.header().slot_stride - std::mem::size_of::<FrameSlot>() as u64
    }

    pub fn video(&self) -> VideoDescriptor {
        self.header().video
    }

    pub fn write_index(&self) -> u64 {
        self.header().write_index.load(Ordering::Acquire)
    }

    pub fn read_index(&self) -> u64 {
        self.header().read_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_index(&self, index: u64) {
        self.header().write_index.store(index, Ordering::Release);
    }

    pub(crate) fn set_read_index(&self, index: u64) {
        self.header().read_index.store(index, Ordering::Release);
    }

    pub fn dropped_frames(&self) -> u64 {
        self.header().dropped_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn add_dropped(&self, count: u64) {
        self.header()
            .dropped_frames
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn forced_reclaims(&self) -> u64 {
        self.header().forced_reclaims.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_forced_reclaims(&self) {
        self.header().forced_reclaims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stopped(&self) -> bool {
        self.header().stopped.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_stopped(&self) {
        self.header().stopped.store(1, Ordering::Release);
    }

    pub(crate) fn physical(&self, index: u64) -> u64 {
        index % self.header().slot_count
    }

    fn slot_ptr(&self, physical: u64) -> *mut FrameSlot {
        debug_assert!(physical < self.header().slot_count);
        let offset = self.header().slots_offset + physical * self.header().slot_stride;
        unsafe { self.mapping.ptr().add(offset as usize) as *mut FrameSlot }
    }

    pub(crate) fn slot(&self, physical: u64) -> &FrameSlot {
        unsafe { &*self.slot_ptr(physical) }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn slot_mut(&self, physical: u64) -> &mut FrameSlot {
        unsafe { &mut *self.slot_ptr(physical) }
    }

    pub(crate) fn payload(&self, physical: u64) -> &[u8] {
        let base = self.slot_ptr(physical) as *const u8;
        unsafe {
            std::slice::from_raw_parts(
                base.add(std::mem::size_of::<FrameSlot>()),
                self.slot_capacity() as usize,
            )
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn payload_mut(&self, physical: u64) -> &mut [u8] {
        let base = self.slot_ptr(physical) as *mut u8;
        unsafe {
            std::slice::from_raw_parts_mut(
                base.add(std::mem::size_of::<FrameSlot>()),
                self.slot_capacity() as usize,
            )
        }
    }

    /// Ownership governor: `Free -> Owned`. Producer only, under the region
    /// lock; `sequence` becomes the identity of the frame in this slot.
    pub(crate) fn claim_slot(&self, physical: u64, sequence: u64) {
        let slot = self.slot_mut(physical);
        debug_assert_eq!(slot.state(), SlotState::Free);
        slot.sequence_number = sequence;
        slot.set_state(SlotState::Owned);
    }

    /// Ownership governor: `Owned -> Free`. Consumer acknowledgement after
    /// copy-out, or the producer's forced reclaim; under the region lock.
    pub(crate) fn release_slot(&self, physical: u64) {
        let slot = self.slot_mut(physical);
        debug_assert_eq!(slot.state(), SlotState::Owned);
        slot.set_state(SlotState::Free);
    }
}
