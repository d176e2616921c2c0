//! Syncstage - retrieval session engine for content-addressed storage
//!
//! Stages an owner's files from Kubo (or a local block store) into an
//! ephemeral cache, and reaps abandoned sessions.

use std::error::Error;
use syncstage_core::{run_service, run_sweep, run_sync, Action, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let (config, action) = Config::from_cli()?;

    // Initialize logging
    init_logging(&config.log_level);

    match action {
        Action::Start => {
            tracing::info!("Starting Syncstage service...");
            run_service(config).await?;
        }
        Action::Sync {
            owner_id,
            record_ids,
        } => {
            let outcome = run_sync(config, &owner_id, &record_ids).await?;
            println!(
                "session {} staged {} file(s), {} byte(s) for {}",
                outcome.session_id, outcome.files, outcome.bytes, owner_id
            );
        }
        Action::Sweep => {
            let report = run_sweep(config).await?;
            println!(
                "reaped {} session(s), {} live, {} orphan(s) removed, {} cleanup failure(s)",
                report.reaped, report.live, report.orphans_removed, report.cleanup_failures
            );
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
