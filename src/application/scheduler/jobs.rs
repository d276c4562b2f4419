use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use std::fmt;

pub const MARKET_OPEN: NaiveTime = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
pub const MARKET_CLOSE: NaiveTime = NaiveTime::from_hms_opt(15, 30, 0).unwrap();

/// Every job the daily table can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// 06:00 universe screening.
    Phase1,
    /// 07:00 + 5 min spacing per batch.
    Phase2Batch(usize),
    /// After the last batch: aggregate, optimize, persist the selection.
    Phase2Finalize,
    /// 09:00 market-open actions (position sync, regime refresh).
    MarketOpen,
    /// 15:30 market-close housekeeping.
    MarketClose,
    /// 16:00 daily performance close-out.
    CloseOut,
    /// 00:00 cache namespace flush.
    CacheFlush,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Phase1 => write!(f, "phase1"),
            JobKind::Phase2Batch(id) => write!(f, "phase2_batch_{id:02}"),
            JobKind::Phase2Finalize => write!(f, "phase2_finalize"),
            JobKind::MarketOpen => write!(f, "market_open"),
            JobKind::MarketClose => write!(f, "market_close"),
            JobKind::CloseOut => write!(f, "close_out"),
            JobKind::CacheFlush => write!(f, "cache_flush"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledJob {
    pub kind: JobKind,
    pub time: NaiveTime,
}

/// The wall-clock job table (local time, weekdays only).
pub struct JobTable {
    batches: usize,
}

impl JobTable {
    pub fn new(batches: usize) -> Self {
        Self { batches }
    }

    pub fn is_trading_day(date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_market_hours(time: NaiveTime) -> bool {
        (MARKET_OPEN..MARKET_CLOSE).contains(&time)
    }

    /// All of a day's jobs in time order. Empty on weekends except the
    /// midnight cache flush, which runs every day.
    pub fn jobs_for(&self, date: NaiveDate) -> Vec<ScheduledJob> {
        let mut jobs = vec![ScheduledJob {
            kind: JobKind::CacheFlush,
            time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        }];
        if !Self::is_trading_day(date) {
            return jobs;
        }

        jobs.push(ScheduledJob {
            kind: JobKind::Phase1,
            time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        });
        for batch_id in 0..self.batches {
            let minutes = (batch_id * 5) as u32;
            jobs.push(ScheduledJob {
                kind: JobKind::Phase2Batch(batch_id),
                time: NaiveTime::from_hms_opt(7 + minutes / 60, minutes % 60, 0).unwrap(),
            });
        }
        jobs.push(ScheduledJob {
            kind: JobKind::Phase2Finalize,
            time: NaiveTime::from_hms_opt(8, 45, 0).unwrap(),
        });
        jobs.push(ScheduledJob {
            kind: JobKind::MarketOpen,
            time: MARKET_OPEN,
        });
        jobs.push(ScheduledJob {
            kind: JobKind::MarketClose,
            time: MARKET_CLOSE,
        });
        jobs.push(ScheduledJob {
            kind: JobKind::CloseOut,
            time: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
        });

        jobs.sort_by_key(|j| j.time);
        jobs
    }
}
