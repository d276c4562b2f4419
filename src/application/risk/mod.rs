pub mod circuit_breaker;
pub mod correlation;
pub mod drawdown;
pub mod kelly;
pub mod stops;

pub use circuit_breaker::{BreakerInputs, CircuitBreaker, TripReason};
pub use correlation::{CorrelationGate, CORRELATION_WINDOW_DAYS};
pub use drawdown::{DrawdownMonitor, DrawdownResponse, DrawdownSnapshot};
pub use kelly::KellySizer;
