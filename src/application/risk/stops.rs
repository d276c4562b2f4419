use crate::domain::market_regime::MarketRegime;
use crate::domain::types::Candle;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use ta::indicators::AverageTrueRange;
use ta::{DataItem, Next};

pub const ATR_PERIOD: usize = 14;

/// ATR(14) over daily candles, oldest first. Needs at least one full period
/// of bars.
pub fn atr(candles: &[Candle]) -> Option<Decimal> {
    if candles.len() < ATR_PERIOD {
        return None;
    }
    let mut indicator = AverageTrueRange::new(ATR_PERIOD).ok()?;
    let mut latest = 0.0;
    for candle in candles {
        let item = DataItem::builder()
            .open(candle.open.to_f64()?)
            .high(candle.high.to_f64()?)
            .low(candle.low.to_f64()?)
            .close(candle.close.to_f64()?)
            .volume(candle.volume as f64)
            .build()
            .ok()?;
        latest = indicator.next(&item);
    }
    Decimal::from_f64(latest).map(|d| d.round_dp(4))
}

/// Regime-dependent initial stop levels at entry:
/// stop = entry - k*ATR, take-profit = entry + m*ATR.
pub fn initial_stops(entry: Decimal, atr: Decimal, regime: MarketRegime) -> (Decimal, Decimal) {
    let (k, m) = regime.stop_multipliers();
    let k = Decimal::from_f64(k).unwrap_or(Decimal::TWO);
    let m = Decimal::from_f64(m).unwrap_or(Decimal::TWO);
    let stop = (entry - k * atr).max(Decimal::ZERO);
    let take_profit = entry + m * atr;
    (stop, take_profit)
}

/// Trailing adjustment: the stop ratchets toward `price - k*ATR` and never
/// moves down.
pub fn trail_stop(
    current_stop: Decimal,
    price: Decimal,
    atr: Decimal,
    regime: MarketRegime,
) -> Decimal {
    let (k, _) = regime.stop_multipliers();
    let k = Decimal::from_f64(k).unwrap_or(Decimal::TWO);
    let proposed = price - k * atr;
    current_stop.max(proposed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::StockCode;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn candles(n: usize, base: f64, range: f64) -> Vec<Candle> {
        let code = StockCode::parse("005930").unwrap();
        let start = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        (0..n)
            .map(|i| {
                let close = base + (i as f64 * 0.5);
                Candle {
                    code: code.clone(),
                    date: start + chrono::Duration::days(i as i64),
                    open: Decimal::from_f64(close - range / 4.0).unwrap(),
                    high: Decimal::from_f64(close + range / 2.0).unwrap(),
                    low: Decimal::from_f64(close - range / 2.0).unwrap(),
                    close: Decimal::from_f64(close).unwrap(),
                    volume: 1_000_000,
                }
            })
            .collect()
    }

    #[test]
    fn test_atr_needs_full_period() {
        assert!(atr(&candles(13, 70_000.0, 1_000.0)).is_none());
        assert!(atr(&candles(30, 70_000.0, 1_000.0)).is_some());
    }

    #[test]
    fn test_atr_tracks_range() {
        let narrow = atr(&candles(30, 70_000.0, 500.0)).unwrap();
        let wide = atr(&candles(30, 70_000.0, 2_000.0)).unwrap();
        assert!(wide > narrow);
    }

    #[test]
    fn test_initial_stops_by_regime() {
        let entry = dec!(70000);
        let atr = dec!(1000);

        let (stop, tp) = initial_stops(entry, atr, MarketRegime::Bull);
        assert_eq!(stop, dec!(67500)); // entry - 2.5*ATR
        assert_eq!(tp, dec!(74000)); // entry + 4.0*ATR

        let (stop, tp) = initial_stops(entry, atr, MarketRegime::Bear);
        assert_eq!(stop, dec!(68500)); // entry - 1.5*ATR
        assert_eq!(tp, dec!(72000)); // entry + 2.0*ATR
    }

    #[test]
    fn test_trailing_stop_only_moves_up() {
        let atr = dec!(1000);
        let stop = dec!(67500);

        // Price advances: stop ratchets up.
        let raised = trail_stop(stop, dec!(72000), atr, MarketRegime::Bull);
        assert_eq!(raised, dec!(69500));

        // Price falls back: stop holds.
        let held = trail_stop(raised, dec!(68000), atr, MarketRegime::Bull);
        assert_eq!(held, raised);
    }
}
