//! # framering - Cross-Process Frame Handoff Ring
//!
//! Single-producer single-consumer ring buffer over named POSIX shared
//! memory, built to hand GPU-resident video frames from one process to
//! another without copying pixel data. Each slot carries per-frame metadata
//! plus an opaque external handle; both sides run on independent schedules
//! and synchronize through a named robust lock and a named coalescing wake
//! signal.
//!
//! A session is one producer and one consumer agreeing on a single session
//! string; the region, lock, and wake-signal names all derive from it.
//!
//! ## Producing Frames
//!
//! The producer creates the region and publishes without ever blocking
//! longer than its short lock budget. A frame that cannot be placed comes
//! back as [`PublishResult::Dropped`] and stays the caller's.
//!
//! ```rust
//! use framering::{
//!     ExternalHandle, FrameMetadata, NoopReleaser, ProducerEndpoint, ProducerOptions,
//!     SessionConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = SessionConfig::new("docs-producer");
//! let mut producer =
//!     ProducerEndpoint::create(&config, &ProducerOptions::default(), Arc::new(NoopReleaser))?;
//!
//! let meta = FrameMetadata {
//!     presentation_time: 0,
//!     duration: 33_333_333,
//!     ..FrameMetadata::default()
//! };
//! producer.publish(&meta, ExternalHandle(0x7001))?;
//! # Ok::<(), framering::RingError>(())
//! ```
//!
//! The handle is released back through the [`HandleReleaser`] collaborator
//! once neither side references the slot; pass a real releaser when handles
//! point at GPU resources.
//!
//! ## Consuming Frames
//!
//! The consumer may start first; it attaches lazily and reports
//! [`RingError::NotReady`] until frames arrive.
//!
//! ```rust,no_run
//! use framering::{ConsumerEndpoint, RingError, SessionConfig};
//!
//! let mut consumer = ConsumerEndpoint::new(SessionConfig::new("docs-consumer"));
//! loop {
//!     match consumer.next_frame() {
//!         Ok(frame) => println!("frame {} at {}ns", frame.sequence_number, frame.output_time),
//!         Err(RingError::NotReady) => continue,
//!         Err(RingError::Abandoned) => continue, // producer died; reattaches on retry
//!         Err(err) => return Err(err),
//!     }
//! }
//! # Ok::<(), framering::RingError>(())
//! ```
//!
//! ## Fallback Without GPU Handles
//!
//! Pixel data can also travel inline through a fixed per-slot payload area:
//!
//! ```rust
//! use framering::{FrameMetadata, NoopReleaser, ProducerEndpoint, ProducerOptions, SessionConfig};
//! use std::sync::Arc;
//!
//! let config = SessionConfig::new("docs-inline");
//! let options = ProducerOptions {
//!     slot_capacity_bytes: 4096,
//!     ..ProducerOptions::default()
//! };
//! let mut producer = ProducerEndpoint::create(&config, &options, Arc::new(NoopReleaser))?;
//! producer.publish_inline(&FrameMetadata::default(), &[0u8; 1024])?;
//! # Ok::<(), framering::RingError>(())
//! ```
//!
//! ## Overload Behavior
//!
//! When the consumer stalls, the producer first drops new frames, then after
//! a configured number of blocked attempts force-reclaims the oldest slot so
//! publish latency stays bounded; every reclaim is counted and its handle is
//! released exactly once. A consumer that falls more than one ring behind
//! jumps forward to half-full and adds the skipped frames to the shared
//! dropped counter.

pub use config::{ConsumerOptions, ProducerOptions, SessionConfig};
pub use consumer::{ConsumerEndpoint, Frame};
pub use error::{Result, RingError, SyncError};
pub use layout::{
    ExternalHandle, FrameMetadata, SlotState, VideoDescriptor, PROTOCOL_VERSION, TIME_NONE,
};
pub use producer::{HandleReleaser, NoopReleaser, ProducerEndpoint, PublishResult};
pub use region::Region;
pub use sync::{ProcessLock, SessionLock, WakeLatch, WakeSignal};

pub mod config;
pub mod consumer;
pub mod error;
pub mod layout;
pub(crate) mod memory;
pub mod producer;
pub mod region;
pub mod sync;
