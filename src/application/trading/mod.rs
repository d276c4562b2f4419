pub mod closeout;
pub mod engine;

pub use closeout::{CloseOut, DailyPerformance, PERFORMANCE_FILE};
pub use engine::{exit_reason, ExitReason, TradingEngine};
