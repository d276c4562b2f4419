use crate::config::DrawdownConfig;
use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Mutex;
use tracing::{info, warn};

/// Recovery must clear a threshold by this much before a response relaxes.
const HYSTERESIS: f64 = 0.01;

/// Ordered drawdown responses, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrawdownResponse {
    Normal,
    Warning,
    ReduceSize,
    HaltEntries,
    CloseHalf,
    CloseAll,
}

impl DrawdownResponse {
    /// Multiplier applied to new-position sizing.
    pub fn size_multiplier(&self) -> f64 {
        match self {
            DrawdownResponse::Normal | DrawdownResponse::Warning => 1.0,
            DrawdownResponse::ReduceSize => 0.5,
            _ => 0.0,
        }
    }

    pub fn allows_new_entries(&self) -> bool {
        matches!(
            self,
            DrawdownResponse::Normal | DrawdownResponse::Warning | DrawdownResponse::ReduceSize
        )
    }
}

/// Drawdowns across every tracked horizon, fractions of the relevant peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawdownSnapshot {
    pub current: f64,
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
    pub all_time: f64,
    pub response: DrawdownResponse,
}

struct PeriodPeak {
    key: (i32, u32),
    peak: f64,
}

struct MonitorState {
    all_time_peak: f64,
    daily: PeriodPeak,
    weekly: PeriodPeak,
    monthly: PeriodPeak,
    response: DrawdownResponse,
}

/// Tracks equity peaks per horizon and derives the ordered response level.
///
/// Escalation is immediate; de-escalation requires recovering through the
/// hysteresis band, so responses cannot flap around a threshold.
pub struct DrawdownMonitor {
    config: DrawdownConfig,
    state: Mutex<MonitorState>,
}

impl DrawdownMonitor {
    pub fn new(config: DrawdownConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState {
                all_time_peak: 0.0,
                daily: PeriodPeak { key: (0, 0), peak: 0.0 },
                weekly: PeriodPeak { key: (0, 0), peak: 0.0 },
                monthly: PeriodPeak { key: (0, 0), peak: 0.0 },
                response: DrawdownResponse::Normal,
            }),
        }
    }

    /// Restore the all-time high-water mark from persistence.
    pub fn with_high_water_mark(config: DrawdownConfig, hwm: Decimal) -> Self {
        let monitor = Self::new(config);
        {
            let mut state = monitor.state.lock().unwrap_or_else(|e| e.into_inner());
            state.all_time_peak = hwm.to_f64().unwrap_or(0.0);
        }
        monitor
    }

    pub fn observe(&self, equity: Decimal, today: NaiveDate) -> DrawdownSnapshot {
        let equity = equity.to_f64().unwrap_or(0.0);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let day_key = (today.year(), today.ordinal());
        let week = today.iso_week();
        let week_key = (week.year(), week.week());
        let month_key = (today.year(), today.month());

        roll_peak(&mut state.daily, day_key, equity);
        roll_peak(&mut state.weekly, week_key, equity);
        roll_peak(&mut state.monthly, month_key, equity);
        if equity > state.all_time_peak {
            state.all_time_peak = equity;
        }

        let all_time = drawdown_from(state.all_time_peak, equity);
        let snapshot_raw = DrawdownSnapshot {
            current: all_time,
            daily: drawdown_from(state.daily.peak, equity),
            weekly: drawdown_from(state.weekly.peak, equity),
            monthly: drawdown_from(state.monthly.peak, equity),
            all_time,
            response: state.response,
        };

        let raw = self.level_for(snapshot_raw.current);
        if raw > state.response {
            warn!(
                "DrawdownMonitor: escalating {:?} -> {:?} (drawdown {:.2}%)",
                state.response,
                raw,
                snapshot_raw.current * 100.0
            );
            state.response = raw;
        } else if raw < state.response {
            // Relax only once the drawdown clears the band below the
            // current level's threshold.
            let relaxed = self.level_for(snapshot_raw.current + HYSTERESIS);
            if relaxed < state.response {
                info!(
                    "DrawdownMonitor: recovering {:?} -> {:?} (drawdown {:.2}%)",
                    state.response,
                    relaxed,
                    snapshot_raw.current * 100.0
                );
                state.response = relaxed;
            }
        }

        DrawdownSnapshot {
            response: state.response,
            ..snapshot_raw
        }
    }

    pub fn response(&self) -> DrawdownResponse {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .response
    }

    fn level_for(&self, drawdown: f64) -> DrawdownResponse {
        let d = &self.config;
        if drawdown >= d.close_all {
            DrawdownResponse::CloseAll
        } else if drawdown >= d.close_half {
            DrawdownResponse::CloseHalf
        } else if drawdown >= d.halt {
            DrawdownResponse::HaltEntries
        } else if drawdown >= d.reduce {
            DrawdownResponse::ReduceSize
        } else if drawdown >= d.warn {
            DrawdownResponse::Warning
        } else {
            DrawdownResponse::Normal
        }
    }
}

fn roll_peak(period: &mut PeriodPeak, key: (i32, u32), equity: f64) {
    if period.key != key {
        period.key = key;
        period.peak = equity;
    } else if equity > period.peak {
        period.peak = equity;
    }
}

fn drawdown_from(peak: f64, equity: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    ((peak - equity) / peak).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_levels_escalate_with_drawdown() {
        let monitor = DrawdownMonitor::new(DrawdownConfig::default());
        monitor.observe(dec!(100_000_000), day(2));

        let snap = monitor.observe(dec!(96_500_000), day(2)); // 3.5%
        assert_eq!(snap.response, DrawdownResponse::Warning);

        let snap = monitor.observe(dec!(94_000_000), day(3)); // 6%
        assert_eq!(snap.response, DrawdownResponse::ReduceSize);
        assert_eq!(snap.response.size_multiplier(), 0.5);

        let snap = monitor.observe(dec!(91_000_000), day(4)); // 9%
        assert_eq!(snap.response, DrawdownResponse::HaltEntries);
        assert!(!snap.response.allows_new_entries());

        let snap = monitor.observe(dec!(89_000_000), day(4)); // 11%
        assert_eq!(snap.response, DrawdownResponse::CloseHalf);

        let snap = monitor.observe(dec!(87_000_000), day(5)); // 13%
        assert_eq!(snap.response, DrawdownResponse::CloseAll);
    }

    #[test]
    fn test_hysteresis_blocks_flapping() {
        let monitor = DrawdownMonitor::new(DrawdownConfig::default());
        monitor.observe(dec!(100_000_000), day(2));

        // 5.2% -> ReduceSize.
        let snap = monitor.observe(dec!(94_800_000), day(2));
        assert_eq!(snap.response, DrawdownResponse::ReduceSize);

        // Recover to 4.8%: inside the band, response holds.
        let snap = monitor.observe(dec!(95_200_000), day(2));
        assert_eq!(snap.response, DrawdownResponse::ReduceSize);

        // Recover to 3.5%: clears 5% - 1%, relaxes to Warning.
        let snap = monitor.observe(dec!(96_500_000), day(2));
        assert_eq!(snap.response, DrawdownResponse::Warning);

        // Full recovery.
        let snap = monitor.observe(dec!(99_900_000), day(2));
        assert_eq!(snap.response, DrawdownResponse::Normal);
    }

    #[test]
    fn test_daily_peak_resets_per_day() {
        let monitor = DrawdownMonitor::new(DrawdownConfig::default());
        monitor.observe(dec!(100_000_000), day(2));
        let snap = monitor.observe(dec!(95_000_000), day(2));
        assert!(snap.daily >= 0.049);

        // Next day: daily peak resets to the opening observation.
        let snap = monitor.observe(dec!(95_000_000), day(3));
        assert_eq!(snap.daily, 0.0);
        // All-time drawdown persists.
        assert!(snap.all_time >= 0.049);
    }

    #[test]
    fn test_restored_high_water_mark() {
        let monitor =
            DrawdownMonitor::with_high_water_mark(DrawdownConfig::default(), dec!(120_000_000));
        let snap = monitor.observe(dec!(108_000_000), day(2)); // 10% from restored HWM
        assert_eq!(snap.response, DrawdownResponse::CloseHalf);
    }
}
