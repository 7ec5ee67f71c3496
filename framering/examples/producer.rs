use clap::Parser;
use framering::{
    FrameMetadata, NoopReleaser, ProducerEndpoint, ProducerOptions, PublishResult, SessionConfig,
    VideoDescriptor,
};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[clap(name = "producer")]
#[clap(about = "Frame ring producer example", long_about = None)]
struct Args {
    #[clap(short, long, default_value = "framering-demo")]
    session: String,

    #[clap(long, default_value_t = 320)]
    width: u32,

    #[clap(long, default_value_t = 240)]
    height: u32,

    #[clap(short, long, default_value_t = 30)]
    fps: u32,

    #[clap(short = 'n', long, default_value_t = 300)]
    frames: u64,

    #[clap(long, default_value_t = 8)]
    slot_count: u64,

    #[clap(short, long, default_value_t = 100)]
    print_interval: u64,
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!(session = %args.session, "starting producer");
    debug!(?args, "producer configuration");

    let config = SessionConfig::new(args.session.clone());
    let frame_bytes = args.width as u64 * args.height as u64 * 4;
    let options = ProducerOptions {
        slot_count: args.slot_count,
        slot_capacity_bytes: frame_bytes,
        video: VideoDescriptor {
            width: args.width,
            height: args.height,
            pixel_format: u32::from_le_bytes(*b"BGRA"),
            fps_num: args.fps,
            fps_den: 1,
        },
        ..ProducerOptions::default()
    };
    let mut producer = ProducerEndpoint::create(&config, &options, Arc::new(NoopReleaser))?;

    let rate = NonZeroU32::new(args.fps).ok_or_else(|| eyre::eyre!("fps must be non-zero"))?;
    let limiter = RateLimiter::direct(Quota::per_second(rate));
    let frame_duration = 1_000_000_000 / args.fps as u64;

    let mut payload = vec![0u8; frame_bytes as usize];
    let mut published = 0u64;
    let mut rejected = 0u64;

    while published < args.frames {
        while limiter.check().is_err() {
            thread::sleep(Duration::from_millis(1));
        }

        let pts = published * frame_duration;
        payload.fill((published % 256) as u8);
        let meta = FrameMetadata {
            decode_time: pts,
            presentation_time: pts,
            duration: frame_duration,
            discontinuity: false,
        };

        match producer.publish_inline(&meta, &payload)? {
            PublishResult::Published => {
                published += 1;
                debug!(published, pts, "frame published");
                if published % args.print_interval == 0 {
                    info!(
                        published,
                        rejected,
                        forced_reclaims = producer.forced_reclaims(),
                        "progress update"
                    );
                }
            }
            PublishResult::Dropped => {
                rejected += 1;
                debug!(rejected, "frame dropped, consumer is behind");
            }
        }
    }

    producer.stop()?;
    info!(
        published,
        rejected,
        dropped_frames = producer.dropped_frames(),
        "producer finished"
    );
    Ok(())
}
