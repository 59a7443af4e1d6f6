use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use shelfdb::dataset::NullSink;
use shelfdb::maintenance::Maintenance;
use shelfdb::StoreContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    fmt().with_env_filter(filter).init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    let root = std::env::var("SHELFDB_ROOT").unwrap_or_else(|_| "shelf".to_string());
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(target: "shelfdb", "shelfdb starting: RUST_LOG='{}', mode={}, root='{}'", rust_log, mode, root);

    let ctx = StoreContext::open(&root)
        .await
        .with_context(|| format!("opening store root '{}'", root))?;
    let maintenance = Maintenance::open(&ctx, Arc::new(NullSink)).context("opening stores")?;

    match mode.as_str() {
        "sweep" => {
            let report = maintenance.retention_pass(chrono::Utc::now()).await;
            let outcome = maintenance.prune_tick().await?;
            info!(target: "shelfdb", "sweep done: {:?}, prune {:?}", report, outcome);
        }
        "run" => {
            maintenance
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::warn!(target: "shelfdb", "ctrl-c handler failed: {}", e);
                    }
                })
                .await;
        }
        other => anyhow::bail!("unknown mode '{}', expected 'run' or 'sweep'", other),
    }
    Ok(())
}
