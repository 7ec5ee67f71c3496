use crate::config::{ConsumerOptions, SessionConfig};
use crate::error::{Result, RingError, SyncError};
use crate::layout::{ExternalHandle, TIME_NONE};
use crate::region::Region;
use crate::sync::{ProcessLock, SessionLock, WakeLatch, WakeSignal};
use tracing::{debug, info, trace, warn};

/// One consumed frame, fully copied out of the ring. Holding a `Frame` keeps
/// nothing referenced inside the region; the handle's resource stays valid
/// until the producer reclaims the slot it came from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence_number: u64,
    pub decode_time: u64,
    pub presentation_time: u64,
    pub duration: u64,
    /// Reconciled stream time: embedded time minus the session anchor,
    /// guarded to never move backward.
    pub output_time: u64,
    pub discontinuity: bool,
    pub payload_size: u64,
    pub external_handle: ExternalHandle,
    /// Inline pixel data for the non-handle fallback path; empty otherwise.
    pub payload: Vec<u8>,
}

struct ClockAnchor {
    offset: u64,
}

struct Session<L: SessionLock, W: WakeSignal> {
    region: Region,
    lock: L,
    wake: W,
    started: bool,
    anchor: Option<ClockAnchor>,
    last_output: Option<u64>,
}

#[derive(Default)]
struct ConsumerStats {
    frames_consumed: u64,
    timestamp_warnings: u64,
}

/// Consuming side of the ring. Opens the region lazily so the consumer may
/// start before the producer; a session terminated by `Abandoned` is closed
/// and re-opened on a later call, picking up the recreated region.
pub struct ConsumerEndpoint<L: SessionLock = ProcessLock, W: WakeSignal = WakeLatch> {
    config: SessionConfig,
    options: ConsumerOptions,
    session: Option<Session<L, W>>,
    stats: ConsumerStats,
}

impl ConsumerEndpoint {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_options(config, ConsumerOptions::default())
    }

    pub fn with_options(config: SessionConfig, options: ConsumerOptions) -> Self {
        ConsumerEndpoint {
            config,
            options,
            session: None,
            stats: ConsumerStats::default(),
        }
    }

    /// Wait for the next frame, bounded by the configured timeouts.
    ///
    /// `NotReady` is the retry signal: the producer has not started, has not
    /// published, or the wait budget ran out. `Abandoned` and `Stopped` end
    /// the session; a later call attaches to a recreated one.
    pub fn next_frame(&mut self) -> Result<Frame> {
        if self.session.is_none() {
            match self.open_session() {
                Ok(()) => {}
                Err(RingError::RegionUnavailable) => return Err(RingError::NotReady),
                Err(err) => return Err(err),
            }
        }
        self.consume_next()
    }

    fn open_session(&mut self) -> Result<()> {
        self.config.validate()?;
        let region = Region::open(&self.config)?;
        let lock = ProcessLock::open(&self.config.lock_name())?;
        let wake = WakeLatch::open(&self.config.wake_name())?;
        info!(session = %self.config.session, "consumer attached to region");
        self.session = Some(Session {
            region,
            lock,
            wake,
            started: false,
            anchor: None,
            last_output: None,
        });
        Ok(())
    }
}

impl<L: SessionLock, W: WakeSignal> ConsumerEndpoint<L, W> {
    pub(crate) fn from_parts(
        config: SessionConfig,
        options: ConsumerOptions,
        region: Region,
        lock: L,
        wake: W,
    ) -> Self {
        ConsumerEndpoint {
            config,
            options,
            session: Some(Session {
                region,
                lock,
                wake,
                started: false,
                anchor: None,
                last_output: None,
            }),
            stats: ConsumerStats::default(),
        }
    }

    pub(crate) fn consume_next(&mut self) -> Result<Frame> {
        let Some(session) = self.session.as_mut() else {
            return Err(RingError::NotReady);
        };
        match Self::read_frame(session, &self.options, &mut self.stats) {
            Ok(frame) => {
                self.stats.frames_consumed += 1;
                Ok(frame)
            }
            Err(RingError::Abandoned) => {
                warn!(session = %self.config.session, "region lock abandoned, closing session");
                self.session = None;
                Err(RingError::Abandoned)
            }
            Err(err) => Err(err),
        }
    }

    fn read_frame(
        session: &mut Session<L, W>,
        options: &ConsumerOptions,
        stats: &mut ConsumerStats,
    ) -> Result<Frame> {
        let mut guard = match session.lock.acquire(options.lock_timeout()) {
            Ok(guard) => guard,
            Err(SyncError::Timeout) => return Err(RingError::NotReady),
            Err(SyncError::Abandoned) => return Err(RingError::Abandoned),
            Err(err) => return Err(RingError::Sync(err)),
        };

        loop {
            // a stopped region has every handle invalidated already
            if session.region.stopped() {
                return Err(RingError::Stopped);
            }
            if session.region.write_index() > session.region.read_index() {
                break;
            }
            drop(guard);
            match session.wake.wait(options.wait_timeout()) {
                Ok(()) => {}
                Err(SyncError::Timeout) => return Err(RingError::NotReady),
                Err(SyncError::Abandoned) => return Err(RingError::Abandoned),
                Err(err) => return Err(RingError::Sync(err)),
            }
            guard = match session.lock.acquire(options.lock_timeout()) {
                Ok(guard) => guard,
                Err(SyncError::Timeout) => return Err(RingError::NotReady),
                Err(SyncError::Abandoned) => return Err(RingError::Abandoned),
                Err(err) => return Err(RingError::Sync(err)),
            };
        }

        let region = &session.region;
        let write = region.write_index();
        let mut read = region.read_index();
        let slot_count = region.slot_count();
        let mut forced_discontinuity = false;

        if write - read > slot_count {
            // more behind than the ring holds: recover to half-full
            let target = write - slot_count / 2;
            let skipped = target - read;
            region.add_dropped(skipped);
            region.set_read_index(target);
            warn!(
                skipped,
                write_index = write,
                "consumer fell behind the ring, catching up"
            );
            read = target;
            forced_discontinuity = true;
        } else if !session.started && read == 0 {
            // first attach: skip any backlog published before we existed
            read = write - 1;
            region.set_read_index(read);
            debug!(backlog = read, "start of stream, skipping backlog");
            forced_discontinuity = true;
        }

        let sequence = read + 1;
        region.set_read_index(sequence);
        let physical = region.physical(sequence);
        let slot = *region.slot(physical);
        if slot.sequence_number != sequence {
            warn!(
                expected = sequence,
                found = slot.sequence_number,
                "slot sequence skew"
            );
        }
        let payload = if slot.payload_size > 0 {
            let len = slot.payload_size.min(region.slot_capacity()) as usize;
            region.payload(physical)[..len].to_vec()
        } else {
            Vec::new()
        };
        // acknowledge through the governor; the handle itself is released by
        // the producer's sweep
        region.release_slot(physical);

        if !session.started {
            session.started = true;
            info!(sequence, "stream started");
        }

        let embedded = if slot.decode_time != TIME_NONE {
            slot.decode_time
        } else if slot.presentation_time != TIME_NONE {
            slot.presentation_time
        } else {
            0
        };
        let anchor = session.anchor.get_or_insert_with(|| {
            debug!(embedded, "anchoring stream clock to first frame");
            ClockAnchor { offset: embedded }
        });
        let mut output_time = embedded.saturating_sub(anchor.offset);
        if let Some(previous) = session.last_output {
            if output_time <= previous {
                let synthesized = previous + slot.duration / 2;
                warn!(
                    output_time,
                    previous, synthesized, "non-monotonic timestamp, synthesizing"
                );
                output_time = synthesized;
                stats.timestamp_warnings += 1;
            }
        }
        session.last_output = Some(output_time);

        drop(guard);
        trace!(sequence, output_time, "frame consumed");
        Ok(Frame {
            sequence_number: slot.sequence_number,
            decode_time: slot.decode_time,
            presentation_time: slot.presentation_time,
            duration: slot.duration,
            output_time,
            discontinuity: forced_discontinuity || slot.discontinuity != 0,
            payload_size: slot.payload_size,
            external_handle: ExternalHandle(slot.external_handle),
            payload,
        })
    }

    /// Drop the current session; the next call over the POSIX primitives
    /// re-opens by name.
    pub fn close(&mut self) {
        self.session = None;
    }

    pub fn frames_consumed(&self) -> u64 {
        self.stats.frames_consumed
    }

    pub fn timestamp_warnings(&self) -> u64 {
        self.stats.timestamp_warnings
    }

    /// Lost-frame counter shared through the region; zero when detached.
    pub fn dropped_frames(&self) -> u64 {
        self.session
            .as_ref()
            .map(|session| session.region.dropped_frames())
            .unwrap_or(0)
    }
}
