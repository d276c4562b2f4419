//! kquant: automated KOSPI/KOSDAQ quant trading service.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
