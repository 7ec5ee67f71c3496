use clap::Parser;
use framering::{ConsumerEndpoint, RingError, SessionConfig};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[clap(name = "consumer")]
#[clap(about = "Frame ring consumer example", long_about = None)]
struct Args {
    #[clap(short, long, default_value = "framering-demo")]
    session: String,

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

    info!(session = %args.session, "starting consumer");

    let mut consumer = ConsumerEndpoint::new(SessionConfig::new(args.session.clone()));
    let mut received = 0u64;

    loop {
        match consumer.next_frame() {
            Ok(frame) => {
                received += 1;
                if frame.discontinuity {
                    debug!(sequence = frame.sequence_number, "discontinuity");
                }
                if received % args.print_interval == 0 {
                    info!(
                        received,
                        sequence = frame.sequence_number,
                        output_ms = frame.output_time / 1_000_000,
                        dropped = consumer.dropped_frames(),
                        "progress update"
                    );
                }
            }
            Err(RingError::NotReady) => continue,
            Err(RingError::Stopped) => {
                info!(received, "stream stopped by the producer");
                break;
            }
            Err(RingError::Abandoned) => {
                warn!("producer went away, waiting for a restart");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }

    info!(
        received,
        dropped = consumer.dropped_frames(),
        warnings = consumer.timestamp_warnings(),
        "consumer finished"
    );
    Ok(())
}
