/// Supported candle durations per exchange
use crate::error::{CandleError, Result};
use crate::types::{ExchangeKind, Granularity, GranularitySet};

/// S5..H12, D and W (weekly candles aligned to Thursday so they land on
/// epoch multiples).
const OANDA: &[u32] = &[
    5, 10, 15, 30, 60, 120, 240, 300, 600, 900, 1800, 3600, 7200, 10_800, 14_400, 21_600,
    28_800, 43_200, 86_400, 604_800,
];

/// 1m..1d. Binance weekly klines open on Monday, off the epoch grid.
const BINANCE: &[u32] = &[
    60, 180, 300, 900, 1800, 3600, 7200, 14_400, 21_600, 28_800, 43_200, 86_400,
];

const COINBASE: &[u32] = &[60, 300, 900, 3600, 21_600, 86_400];

pub fn supported_granularities(exchange: ExchangeKind) -> GranularitySet {
    match exchange {
        ExchangeKind::Oanda => GranularitySet::from_secs(OANDA),
        ExchangeKind::Binance => GranularitySet::from_secs(BINANCE),
        ExchangeKind::Coinbase => GranularitySet::from_secs(COINBASE),
    }
}

/// Fail fast, before any request, on a duration the exchange cannot serve
pub fn validate(exchange: ExchangeKind, granularity: Granularity) -> Result<()> {
    if supported_granularities(exchange).contains(granularity) {
        Ok(())
    } else {
        Err(CandleError::config(format!(
            "granularity {}s ({}) is not supported by {}",
            granularity.as_secs(),
            granularity,
            exchange
        )))
    }
}

/// Finer duration used to rebuild an in-progress period from sub-candles:
/// the supported value closest to `elapsed / 200`, never coarser than the
/// period itself.
pub fn sub_period_granularity(
    exchange: ExchangeKind,
    period: Granularity,
    elapsed_secs: i64,
) -> Option<Granularity> {
    let set = supported_granularities(exchange);
    let finest = set.finest()?;
    let ideal = (elapsed_secs / 200).max(finest.as_secs());
    let finer = GranularitySet::from_secs(
        &set.iter()
            .filter(|g| *g <= period)
            .map(|g| g.as_secs() as u32)
            .collect::<Vec<_>>(),
    );
    finer.closest_to(ideal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogs_are_ordered_and_nonempty() {
        for exchange in [ExchangeKind::Oanda, ExchangeKind::Binance, ExchangeKind::Coinbase] {
            let set = supported_granularities(exchange);
            assert!(!set.is_empty());
            let secs: Vec<i64> = set.iter().map(|g| g.as_secs()).collect();
            let mut sorted = secs.clone();
            sorted.sort();
            assert_eq!(secs, sorted);
            assert!(set.contains(Granularity::from_secs(3600)));
        }
    }

    #[test]
    fn test_unsupported_granularity_fails_fast() {
        let err = validate(ExchangeKind::Coinbase, Granularity::from_secs(120)).unwrap_err();
        assert!(matches!(err, CandleError::Configuration(_)));
        assert!(validate(ExchangeKind::Oanda, Granularity::from_secs(120)).is_ok());
    }

    #[test]
    fn test_sub_period_granularity() {
        let hour = Granularity::from_secs(3600);
        // 40 minutes into an hour: ideal 12s, closest Oanda value is 10s
        assert_eq!(
            sub_period_granularity(ExchangeKind::Oanda, hour, 2400),
            Some(Granularity::from_secs(10))
        );
        // Coinbase cannot go below a minute
        assert_eq!(
            sub_period_granularity(ExchangeKind::Coinbase, hour, 2400),
            Some(Granularity::from_secs(60))
        );
        let day = Granularity::from_secs(86_400);
        assert_eq!(
            sub_period_granularity(ExchangeKind::Binance, day, 80_000),
            Some(Granularity::from_secs(300))
        );
    }
}
