use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use std::error::Error;
use std::thread;
use std::time::Duration;

use shmq::{Publisher, QueueConfig};

#[derive(Parser)]
#[clap(about = "Publish messages onto a shared-memory queue")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmq-publisher.toml")]
    config: String,
    #[clap(short = 'n', long = "count", default_value = "10000")]
    count: u64,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct PublisherConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();
    let cfg: PublisherConfig = confy::load_path(&opts.config)?;
    tracing::info!(queue = ?cfg.queue, "starting publisher");
    let publisher = Publisher::new(&cfg.queue)?;
    run(&publisher, opts.count);
    Ok(())
}

fn run(publisher: &Publisher, count: u64) {
    for x in 0..count {
        let payload = format!("message-{}", x);
        while !publisher.publish(payload.as_bytes()) {
            // ring full; give consumers a moment to drain
            thread::sleep(Duration::from_millis(1));
        }
        if (x + 1) % 1000 == 0 {
            tracing::info!(published = x + 1, "progress");
        }
    }
    tracing::info!(published = count, "done");
}
