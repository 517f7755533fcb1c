use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use std::error::Error;
use std::thread;

use shmq::{CancelToken, QueueConfig, QueueError, Subscriber};

#[derive(Parser)]
#[clap(about = "Consume messages from a shared-memory queue")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmq-subscriber.toml")]
    config: String,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct SubscriberConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();
    let cfg: SubscriberConfig = confy::load_path(&opts.config)?;
    tracing::info!(queue = ?cfg.queue, "starting subscriber");
    let mut subscriber = Subscriber::new(&cfg.queue)?;

    let cancel = CancelToken::new();
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    {
        let cancel = cancel.clone();
        thread::spawn(move || {
            if signals.forever().next().is_some() {
                tracing::info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    run(&subscriber, &cancel);
    subscriber.close();
    Ok(())
}

fn run(subscriber: &Subscriber, cancel: &CancelToken) {
    let mut consumed = 0u64;
    loop {
        match subscriber.consume(cancel) {
            Ok(message) => {
                consumed += 1;
                if consumed % 1000 == 0 {
                    tracing::info!(consumed, last_len = message.len(), "progress");
                }
            }
            Err(QueueError::Cancelled) => {
                tracing::info!(consumed, "cancelled, shutting down");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "consume failed");
                break;
            }
        }
    }
}
