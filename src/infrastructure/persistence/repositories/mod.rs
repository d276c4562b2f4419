mod error_log_repository;
mod selection_repository;
mod stock_repository;
mod trade_repository;
mod watchlist_repository;

pub use error_log_repository::{ErrorLogRepository, ErrorLogRow, Severity};
pub use selection_repository::SelectionRepository;
pub use stock_repository::StockRepository;
pub use trade_repository::{TradeRepository, TradeStats};
pub use watchlist_repository::WatchlistRepository;
