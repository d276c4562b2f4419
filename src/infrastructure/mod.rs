pub mod broker;
pub mod cache;
pub mod governor;
pub mod masking;
pub mod notify;
pub mod observability;
pub mod persistence;
pub mod token;
