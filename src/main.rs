use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runstream::{Phase, RelayConfig, StatusTracker, TrackerConfig};

#[derive(Parser)]
#[command(name = "runstream", version, about = "Run status relay and tracker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the same-origin status relay.
    Serve {
        /// YAML config file; RUNSTREAM_* variables override it.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        bind: Option<String>,
    },
    /// Follow one run through a relay and print each state change as JSON.
    Watch {
        run_id: String,
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        relay: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runstream=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Serve { config, bind } => {
            let mut cfg = RelayConfig::load(config.as_deref()).await?;
            if let Some(bind) = bind {
                cfg.bind = bind;
            }
            runstream::serve(cfg).await
        }
        Command::Watch { run_id, relay } => watch(run_id, relay).await,
    }
}

async fn watch(run_id: String, relay: String) -> Result<()> {
    let mut tracker = StatusTracker::new(TrackerConfig::new(relay))?;
    let mut updates = WatchStream::new(tracker.subscribe());
    tracker.watch(&run_id, true);

    while let Some(state) = updates.next().await {
        if state.run_id.as_deref() != Some(run_id.as_str()) {
            continue;
        }
        println!("{}", serde_json::to_string(&state)?);
        if matches!(state.phase, Phase::ClosedTerminal | Phase::ClosedError) {
            break;
        }
    }
    Ok(())
}
