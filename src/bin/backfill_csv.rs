/// One-shot backfill written as CSV to stdout
/// Usage: cargo run --bin backfill_csv -- [config.toml] [count] > candles.csv
use std::io;

use anyhow::Context;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use candlefeed::{config::load_config, data::CandleStream, utils::epoch_to_rfc3339, Candle};

#[derive(Debug, Serialize)]
struct CandleRow {
    open_time: i64,
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    vwap: Option<f64>,
    placeholder: bool,
}

impl CandleRow {
    fn from_candle(candle: &Candle) -> anyhow::Result<Self> {
        Ok(CandleRow {
            open_time: candle.open_time(),
            timestamp: epoch_to_rfc3339(candle.open_time())?,
            open: candle.open(),
            high: candle.high(),
            low: candle.low(),
            close: candle.close(),
            volume: candle.volume(),
            vwap: candle.vwap(),
            placeholder: candle.is_placeholder(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the CSV
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.toml".to_string());
    let config = load_config(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    let count = match args.next() {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid candle count: {}", raw))?,
        None => config.backfill.count,
    };

    info!(
        "📥 Backfilling {} {} candles of {} from {}",
        count, config.exchange.granularity, config.exchange.instrument, config.exchange.kind
    );

    let stream = CandleStream::new(config.supplier()?);
    let outcome = stream.historical_candles(count).await?;

    let mut writer = csv::Writer::from_writer(io::stdout().lock());
    for candle in &outcome.candles {
        writer.serialize(CandleRow::from_candle(candle)?)?;
    }
    writer.flush()?;

    let placeholders = outcome.candles.iter().filter(|c| c.is_placeholder()).count();
    info!(
        "✅ Wrote {} candles ({} placeholders, {:?}, {} pages, {} retries)",
        outcome.candles.len(),
        placeholders,
        outcome.status,
        outcome.pages,
        outcome.retries
    );
    Ok(())
}
