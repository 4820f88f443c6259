use anyhow::{bail, Result};
use meter_sync::{
    app,
    config::AppConfig,
    observability,
    pipeline::Source,
    sources::ReadingCsvFileSource,
    ExecutionContext, SyncOutcome,
};
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: import_readings <csv_file_path> [--accept-warnings]");
    }
    let file_path = &args[1];
    let accept_warnings = args[2..].iter().any(|a| a == "--accept-warnings");

    let cfg = AppConfig::load()?;
    let engine = app::open_engine(&cfg).await?;

    let actor = env::var("METER_SYNC_ACTOR").unwrap_or_else(|_| "import".to_string());
    let ctx = ExecutionContext::new(actor, time::OffsetDateTime::now_utc());

    if engine.coordinator().connectivity().is_online() {
        engine.coordinator().refresh_snapshots(&ctx).await?;
    }

    let rows = ReadingCsvFileSource::new(file_path).stream().await;
    let summary = engine.import_readings(&ctx, rows, accept_warnings).await?;

    for row in &summary.rejected {
        tracing::warn!(line = row.line, customer_id = ?row.customer_id, reason = %row.reason, "row rejected");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);

    match engine.sync(&ctx).await? {
        SyncOutcome::Completed(report) => {
            tracing::info!(transmitted = report.transmitted, failed = report.failed.len(), "sync after import");
        }
        other => tracing::info!(outcome = ?other, "imported readings stay queued"),
    }

    Ok(())
}
