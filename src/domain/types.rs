use crate::domain::errors::CodeError;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Listing venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Market {
    Kospi,
    Kosdaq,
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Market::Kospi => write!(f, "KOSPI"),
            Market::Kosdaq => write!(f, "KOSDAQ"),
        }
    }
}

impl FromStr for Market {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "KOSPI" => Ok(Market::Kospi),
            "KOSDAQ" => Ok(Market::Kosdaq),
            _ => anyhow::bail!("Invalid market: {}. Must be 'KOSPI' or 'KOSDAQ'", s),
        }
    }
}

/// Validated KRX stock code: six digits, optionally a trailing class suffix
/// (`K`/`L`/`M`) for preferred or SPAC listings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StockCode(String);

impl StockCode {
    pub fn parse(raw: &str) -> Result<Self, CodeError> {
        let bytes = raw.as_bytes();
        let valid = match bytes.len() {
            6 => bytes.iter().all(u8::is_ascii_digit),
            7 => {
                bytes[..6].iter().all(u8::is_ascii_digit)
                    && matches!(bytes[6], b'K' | b'L' | b'M')
            }
            _ => false,
        };
        if !valid {
            return Err(CodeError::InvalidStockCode {
                raw: raw.to_string(),
                reason: "expected six digits with optional K/L/M class suffix".to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StockCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for StockCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StockCode::parse(&value)
    }
}

impl From<StockCode> for String {
    fn from(code: StockCode) -> Self {
        code.0
    }
}

/// A listed instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stock {
    pub code: StockCode,
    pub name: String,
    pub market: Market,
    pub sector: String,
}

/// Daily OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub code: StockCode,
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Real-time quote snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub code: StockCode,
    pub price: Decimal,
    pub change_pct: Decimal,
    pub volume: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Events published by the realtime stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    Quote(Quote),
    Subscribed { code: StockCode },
    Disconnected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_six_digit_codes() {
        assert!(StockCode::parse("005930").is_ok());
        assert!(StockCode::parse("000660").is_ok());
    }

    #[test]
    fn test_accepts_class_suffix() {
        assert!(StockCode::parse("005930K").is_ok());
        assert!(StockCode::parse("123456M").is_ok());
    }

    #[test]
    fn test_rejects_malformed_codes() {
        for raw in ["5930", "0059300", "00593a", "005930X", "", "005 30", "ABCDEF"] {
            let err = StockCode::parse(raw).unwrap_err();
            assert!(matches!(err, CodeError::InvalidStockCode { .. }), "{raw}");
        }
    }

    #[test]
    fn test_code_serde_round_trip() {
        let code = StockCode::parse("005930").unwrap();
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"005930\"");
        let back: StockCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn test_code_serde_rejects_invalid() {
        let result: Result<StockCode, _> = serde_json::from_str("\"59\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_market_parsing() {
        assert_eq!(Market::from_str("kospi").unwrap(), Market::Kospi);
        assert_eq!(Market::from_str("KOSDAQ").unwrap(), Market::Kosdaq);
        assert!(Market::from_str("NYSE").is_err());
    }
}
