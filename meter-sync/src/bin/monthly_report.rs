use anyhow::{bail, Context, Result};
use meter_sync::{app, config::AppConfig, observability, ExecutionContext};
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: monthly_report <year> <month>");
    }
    let year: i32 = args[1].parse().context("invalid year")?;
    let month: u8 = args[2].parse().context("invalid month")?;

    let cfg = AppConfig::load()?;
    let engine = app::open_engine(&cfg).await?;
    let ctx = ExecutionContext::system();

    let report = engine.pipeline().generate_monthly_report(&ctx, year, month).await?;

    for error in &report.errors {
        tracing::warn!(customer_id = %error.customer_id, error = %error.error, "record excluded");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
