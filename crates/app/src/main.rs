//! Fallwatch - Main Entry Point

use std::path::PathBuf;

use fallwatch::{init_logging, run, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("=== Fallwatch v{} ===", env!("CARGO_PKG_VERSION"));

    // Optional positional config path, otherwise FALLWATCH_CONFIG or the default
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(path.as_deref())?;

    let summary = run(config).await?;
    info!(
        "Done: {} frames, {} people, {} person failures, {} frame failures",
        summary.frames, summary.people, summary.person_failures, summary.frame_failures
    );

    Ok(())
}
