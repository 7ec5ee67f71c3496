use crate::config::{ProducerOptions, SessionConfig};
use crate::error::{Result, RingError, SyncError};
use crate::layout::{ExternalHandle, FrameMetadata, SlotState};
use crate::region::Region;
use crate::sync::{ProcessLock, SessionLock, WakeLatch, WakeSignal};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace, warn};

const STOP_LOCK_TIMEOUT: Duration = Duration::from_millis(200);

/// The GPU/interop collaborator that owns the meaning of an
/// [`ExternalHandle`]. The ring never interprets handles; it hands them back
/// here when a slot's resource is no longer referenced by either side.
pub trait HandleReleaser: Send + Sync {
    fn release(&self, handle: ExternalHandle);
}

/// Releaser for sessions that never attach GPU resources, e.g. the inline
/// payload fallback path.
#[derive(Debug, Default)]
pub struct NoopReleaser;

impl HandleReleaser for NoopReleaser {
    fn release(&self, _handle: ExternalHandle) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    Published,
    /// The frame was not written; the caller still owns it and may retry or
    /// discard without blocking the media thread.
    Dropped,
}

struct BlockedPublish {
    sequence: u64,
    attempts: u32,
}

/// Publishing side of the ring. Creates the region and both named
/// primitives; there is exactly one producer per session.
pub struct ProducerEndpoint<L: SessionLock = ProcessLock, W: WakeSignal = WakeLatch> {
    region: Region,
    lock: L,
    wake: W,
    releaser: Arc<dyn HandleReleaser>,
    lock_timeout: Duration,
    drop_threshold: u32,
    blocked: Option<BlockedPublish>,
    stopped: bool,
}

impl ProducerEndpoint {
    pub fn create(
        config: &SessionConfig,
        options: &ProducerOptions,
        releaser: Arc<dyn HandleReleaser>,
    ) -> Result<Self> {
        config.validate()?;
        let region = Region::create(
            config,
            options.slot_count,
            options.slot_capacity_bytes,
            options.video,
        )?;
        let lock = ProcessLock::create(&config.lock_name())?;
        let wake = WakeLatch::create(&config.wake_name())?;
        info!(session = %config.session, slot_count = options.slot_count, "producer session created");
        Ok(Self::from_parts(region, lock, wake, options, releaser))
    }
}

impl<L: SessionLock, W: WakeSignal> ProducerEndpoint<L, W> {
    pub(crate) fn from_parts(
        region: Region,
        lock: L,
        wake: W,
        options: &ProducerOptions,
        releaser: Arc<dyn HandleReleaser>,
    ) -> Self {
        ProducerEndpoint {
            region,
            lock,
            wake,
            releaser,
            lock_timeout: options.lock_timeout(),
            drop_threshold: options.drop_threshold.max(1),
            blocked: None,
            stopped: false,
        }
    }

    /// Publish one frame carrying a GPU handle. Never blocks longer than the
    /// configured lock timeout; a frame that cannot be placed is `Dropped`
    /// and remains the caller's.
    pub fn publish(&mut self, meta: &FrameMetadata, handle: ExternalHandle) -> Result<PublishResult> {
        self.publish_impl(meta, handle, None)
    }

    /// Fallback path: copy pixel data into the slot's inline payload area
    /// instead of attaching a handle.
    pub fn publish_inline(&mut self, meta: &FrameMetadata, payload: &[u8]) -> Result<PublishResult> {
        let capacity = self.region.slot_capacity() as usize;
        if payload.len() > capacity {
            return Err(RingError::PayloadTooLarge {
                size: payload.len(),
                capacity,
            });
        }
        self.publish_impl(meta, ExternalHandle::NULL, Some(payload))
    }

    fn publish_impl(
        &mut self,
        meta: &FrameMetadata,
        handle: ExternalHandle,
        payload: Option<&[u8]>,
    ) -> Result<PublishResult> {
        if self.stopped {
            return Err(RingError::AlreadyStopped);
        }
        let guard = match self.lock.acquire(self.lock_timeout) {
            Ok(guard) => guard,
            Err(SyncError::Timeout) => {
                warn!("publish lock wait timed out, dropping frame");
                return Ok(PublishResult::Dropped);
            }
            Err(SyncError::Abandoned) => {
                warn!("region lock was abandoned by its holder, dropping frame");
                return Ok(PublishResult::Dropped);
            }
            Err(err) => return Err(RingError::Sync(err)),
        };

        let previous = self.region.write_index();
        let index = previous + 1;
        self.region.set_write_index(index);
        let physical = self.region.physical(index);

        trace!(
            index,
            physical,
            read_index = self.region.read_index(),
            "publish attempt"
        );

        if self.region.slot(physical).state() == SlotState::Owned {
            let blocking = self.region.slot(physical).sequence_number;
            let attempts = match &mut self.blocked {
                Some(blocked) if blocked.sequence == blocking => {
                    blocked.attempts += 1;
                    blocked.attempts
                }
                _ => {
                    self.blocked = Some(BlockedPublish {
                        sequence: blocking,
                        attempts: 1,
                    });
                    1
                }
            };
            if attempts < self.drop_threshold {
                self.region.set_write_index(previous);
                trace!(blocking, attempts, "target slot still owned, frame dropped");
                drop(guard);
                return Ok(PublishResult::Dropped);
            }
            // The consumer copies out and acknowledges under this same lock,
            // so a slot still Owned here is provably untouched right now.
            let stale = self.region.slot(physical).external_handle;
            if stale != 0 {
                self.releaser.release(ExternalHandle(stale));
                self.region.slot_mut(physical).external_handle = 0;
            }
            self.region.release_slot(physical);
            self.region.add_dropped(1);
            self.region.bump_forced_reclaims();
            warn!(
                sequence = blocking,
                attempts, "forced reclaim of an unconsumed slot"
            );
        } else {
            // consumer finished with this slot earlier; its handle may still
            // be waiting for the sweep
            let stale = self.region.slot(physical).external_handle;
            if stale != 0 {
                self.releaser.release(ExternalHandle(stale));
                self.region.slot_mut(physical).external_handle = 0;
            }
        }
        self.blocked = None;

        let slot = self.region.slot_mut(physical);
        slot.decode_time = meta.decode_time;
        slot.presentation_time = meta.presentation_time;
        slot.duration = meta.duration;
        slot.discontinuity = meta.discontinuity as u8;
        slot.external_handle = handle.0;
        slot.payload_size = 0;
        if let Some(bytes) = payload {
            self.region.payload_mut(physical)[..bytes.len()].copy_from_slice(bytes);
            self.region.slot_mut(physical).payload_size = bytes.len() as u64;
        }
        self.region.claim_slot(physical, index);

        self.sweep_consumed_handles(physical);

        drop(guard);
        if let Err(err) = self.wake.notify() {
            warn!(error = %err, "wake notify failed");
        }
        trace!(index, "frame published");
        Ok(PublishResult::Published)
    }

    /// Release handles of slots the consumer already acknowledged. Runs on
    /// the producer so the release cost stays off the consumer's path.
    fn sweep_consumed_handles(&self, just_published: u64) {
        for physical in 0..self.region.slot_count() {
            if physical == just_published {
                continue;
            }
            let slot = self.region.slot(physical);
            if slot.state() == SlotState::Free && slot.external_handle != 0 {
                let handle = ExternalHandle(slot.external_handle);
                self.region.slot_mut(physical).external_handle = 0;
                self.releaser.release(handle);
                trace!(physical, "swept handle of consumed slot");
            }
        }
    }

    /// Invalidate every slot and end the stream. Idempotent; `publish` is
    /// rejected afterwards.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        let guard = match self.lock.acquire(STOP_LOCK_TIMEOUT) {
            Ok(guard) => guard,
            Err(SyncError::Abandoned) => self
                .lock
                .acquire(STOP_LOCK_TIMEOUT)
                .map_err(RingError::Sync)?,
            Err(err) => return Err(RingError::Sync(err)),
        };
        for physical in 0..self.region.slot_count() {
            let handle = self.region.slot(physical).external_handle;
            if handle != 0 {
                self.releaser.release(ExternalHandle(handle));
                self.region.slot_mut(physical).external_handle = 0;
            }
            if self.region.slot(physical).state() == SlotState::Owned {
                self.region.release_slot(physical);
            }
        }
        self.region.set_stopped();
        drop(guard);
        let _ = self.wake.notify();
        self.stopped = true;
        info!("producer session stopped");
        Ok(())
    }

    pub fn dropped_frames(&self) -> u64 {
        self.region.dropped_frames()
    }

    pub fn forced_reclaims(&self) -> u64 {
        self.region.forced_reclaims()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerOptions;
    use crate::consumer::ConsumerEndpoint;
    use crate::layout::TIME_NONE;
    use crate::sync::local::{LocalLock, LocalWake};
    use parking_lot::Mutex;
    use rstest::*;

    #[derive(Default)]
    pub(crate) struct CountingReleaser {
        pub released: Mutex<Vec<u64>>,
    }

    impl HandleReleaser for CountingReleaser {
        fn release(&self, handle: ExternalHandle) {
            self.released.lock().push(handle.0);
        }
    }

    fn test_config(tag: &str) -> SessionConfig {
        SessionConfig::new(format!("framering-prod-{}-{}", tag, std::process::id()))
    }

    fn meta(pts: u64) -> FrameMetadata {
        FrameMetadata {
            decode_time: TIME_NONE,
            presentation_time: pts,
            duration: 33_000_000,
            discontinuity: false,
        }
    }

    fn local_producer(
        tag: &str,
        slot_count: u64,
        drop_threshold: u32,
    ) -> (
        ProducerEndpoint<Arc<LocalLock>, Arc<LocalWake>>,
        Arc<CountingReleaser>,
    ) {
        let config = test_config(tag);
        let options = ProducerOptions {
            slot_count,
            drop_threshold,
            ..ProducerOptions::default()
        };
        let region = Region::create(&config, slot_count, 0, options.video).unwrap();
        let releaser = Arc::new(CountingReleaser::default());
        let producer = ProducerEndpoint::from_parts(
            region,
            Arc::new(LocalLock::new()),
            Arc::new(LocalWake::new()),
            &options,
            releaser.clone() as Arc<dyn HandleReleaser>,
        );
        (producer, releaser)
    }

    #[rstest]
    fn test_publish_claims_slot() {
        let (mut producer, _releaser) = local_producer("claim", 8, 4);

        let result = producer.publish(&meta(0), ExternalHandle(0x1001)).unwrap();
        assert_eq!(result, PublishResult::Published);

        let region = producer.region();
        assert_eq!(region.write_index(), 1);
        let slot = region.slot(1);
        assert_eq!(slot.state(), SlotState::Owned);
        assert_eq!(slot.sequence_number, 1);
        assert_eq!(slot.external_handle, 0x1001);
        assert_eq!(slot.presentation_time, 0);
    }

    #[rstest]
    fn test_drop_policy_respects_threshold() {
        let threshold = 3;
        let (mut producer, releaser) = local_producer("threshold", 2, threshold);

        producer.publish(&meta(0), ExternalHandle(0x1)).unwrap();
        producer.publish(&meta(33), ExternalHandle(0x2)).unwrap();
        assert_eq!(producer.region().write_index(), 2);

        // target slot holds sequence 1 and the consumer never shows up
        for _ in 0..threshold - 1 {
            let result = producer.publish(&meta(66), ExternalHandle(0x3)).unwrap();
            assert_eq!(result, PublishResult::Dropped);
            assert_eq!(producer.region().write_index(), 2);
            assert!(releaser.released.lock().is_empty());
        }

        let result = producer.publish(&meta(66), ExternalHandle(0x3)).unwrap();
        assert_eq!(result, PublishResult::Published);
        assert_eq!(producer.region().write_index(), 3);
        assert_eq!(*releaser.released.lock(), vec![0x1]);
        assert_eq!(producer.forced_reclaims(), 1);
        assert_eq!(producer.dropped_frames(), 1);
    }

    #[rstest]
    fn test_no_leak_under_pressure() {
        let slot_count = 4;
        let threshold = 2;
        let (mut producer, releaser) = local_producer("pressure", slot_count, threshold);

        let mut published = 0u64;
        let mut handle = 0x100u64;
        while published < 20 {
            handle += 1;
            if producer.publish(&meta(published * 33), ExternalHandle(handle)).unwrap()
                == PublishResult::Published
            {
                published += 1;
            }
        }

        let forced = producer.forced_reclaims();
        assert_eq!(forced, published - slot_count);
        assert_eq!(producer.dropped_frames(), forced);
        assert_eq!(releaser.released.lock().len() as u64, forced);
    }

    #[rstest]
    fn test_ordinary_reclaim_releases_stale_handle() {
        let (mut producer, releaser) = local_producer("reclaim", 2, 4);

        producer.publish(&meta(0), ExternalHandle(0xA)).unwrap();
        producer.publish(&meta(33), ExternalHandle(0xB)).unwrap();

        // consumer acknowledges sequence 1 but leaves the handle for the sweep
        producer.region().release_slot(1);

        let result = producer.publish(&meta(66), ExternalHandle(0xC)).unwrap();
        assert_eq!(result, PublishResult::Published);
        assert_eq!(*releaser.released.lock(), vec![0xA]);
        assert_eq!(producer.forced_reclaims(), 0);
    }

    #[rstest]
    fn test_sweep_releases_consumed_handles() {
        let (mut producer, releaser) = local_producer("sweep", 4, 4);

        for (i, handle) in [0xA, 0xB, 0xC].iter().enumerate() {
            producer.publish(&meta(i as u64 * 33), ExternalHandle(*handle)).unwrap();
        }
        // consumer acknowledged 1 and 2; their handles await the sweep
        producer.region().release_slot(1);
        producer.region().release_slot(2);

        producer.publish(&meta(99), ExternalHandle(0xD)).unwrap();
        let mut released = releaser.released.lock().clone();
        released.sort_unstable();
        assert_eq!(released, vec![0xA, 0xB]);
    }

    #[rstest]
    fn test_stop_releases_everything_and_rejects_publish() {
        let (mut producer, releaser) = local_producer("stop", 4, 4);

        producer.publish(&meta(0), ExternalHandle(0xA)).unwrap();
        producer.publish(&meta(33), ExternalHandle(0xB)).unwrap();

        producer.stop().unwrap();
        let mut released = releaser.released.lock().clone();
        released.sort_unstable();
        assert_eq!(released, vec![0xA, 0xB]);
        assert!(producer.region().stopped());
        for physical in 0..4 {
            assert_eq!(producer.region().slot(physical).state(), SlotState::Free);
        }

        assert!(matches!(
            producer.publish(&meta(66), ExternalHandle(0xC)),
            Err(RingError::AlreadyStopped)
        ));
        // stop is idempotent
        producer.stop().unwrap();
    }

    #[rstest]
    fn test_publish_inline_round_trip_and_capacity() {
        let config = test_config("inline");
        let options = ProducerOptions {
            slot_count: 4,
            slot_capacity_bytes: 64,
            ..ProducerOptions::default()
        };
        let region = Region::create(&config, 4, 64, options.video).unwrap();
        let lock = Arc::new(LocalLock::new());
        let wake = Arc::new(LocalWake::new());
        let mut producer = ProducerEndpoint::from_parts(
            region,
            lock.clone(),
            wake.clone(),
            &options,
            Arc::new(NoopReleaser),
        );

        let payload = vec![0x5A; 48];
        producer.publish_inline(&meta(0), &payload).unwrap();
        assert_eq!(producer.region().slot(1).payload_size, 48);
        assert_eq!(&producer.region().payload(1)[..48], payload.as_slice());

        let oversized = vec![0u8; producer.region().slot_capacity() as usize + 1];
        assert!(matches!(
            producer.publish_inline(&meta(33), &oversized),
            Err(RingError::PayloadTooLarge { .. })
        ));

        let mut consumer = ConsumerEndpoint::from_parts(
            config.clone(),
            ConsumerOptions::default(),
            Region::open(&config).unwrap(),
            lock,
            wake,
        );
        let frame = consumer.consume_next().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[rstest]
    fn test_lock_timeout_drops_frame() {
        let config = test_config("locked");
        let options = ProducerOptions {
            slot_count: 4,
            lock_timeout_ms: 10,
            ..ProducerOptions::default()
        };
        let region = Region::create(&config, 4, 0, options.video).unwrap();
        let lock = Arc::new(LocalLock::new());
        let mut producer = ProducerEndpoint::from_parts(
            region,
            lock.clone(),
            Arc::new(LocalWake::new()),
            &options,
            Arc::new(NoopReleaser),
        );

        let _held = lock.acquire(Duration::from_millis(50)).unwrap();
        let result = producer.publish(&meta(0), ExternalHandle(0x1)).unwrap();
        assert_eq!(result, PublishResult::Dropped);
        assert_eq!(producer.region().write_index(), 0);
    }
}
