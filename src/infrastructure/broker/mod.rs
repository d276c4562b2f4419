//! Brokerage facade: REST client with governed rate budget, token
//! lifecycle, response-code retry dispatch, and the realtime stream.

pub mod client;
pub mod models;
pub mod realtime;

pub use client::{BatchPrices, BrokerClient, HttpTokenIssuer, HttpTransport, PreparedRequest, RawResponse, ReqwestTransport};
pub use models::{AccountBalance, BrokerPosition, FinancialRatios, OrderReceipt};
pub use realtime::RealtimeSession;
