use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Discrete market-state label. High-volatility is a disjoint state, not a
/// modifier on the directional labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketRegime {
    Bull,
    Sideways,
    Bear,
    HighVolatility,
}

impl MarketRegime {
    /// Position-size multiplier applied on top of Kelly sizing.
    pub fn size_multiplier(&self) -> f64 {
        match self {
            MarketRegime::Bull => 1.0,
            MarketRegime::Sideways => 0.75,
            MarketRegime::Bear => 0.5,
            MarketRegime::HighVolatility => 0.3,
        }
    }

    /// ATR multipliers (stop-loss k, take-profit m) at entry.
    pub fn stop_multipliers(&self) -> (f64, f64) {
        match self {
            MarketRegime::Bull => (2.5, 4.0),
            MarketRegime::Sideways => (2.0, 3.0),
            MarketRegime::Bear => (1.5, 2.0),
            MarketRegime::HighVolatility => (1.5, 2.5),
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketRegime::Bull => write!(f, "bull"),
            MarketRegime::Sideways => write!(f, "sideways"),
            MarketRegime::Bear => write!(f, "bear"),
            MarketRegime::HighVolatility => write!(f, "high_volatility"),
        }
    }
}

impl FromStr for MarketRegime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bull" | "bullish" => Ok(MarketRegime::Bull),
            "sideways" | "neutral" => Ok(MarketRegime::Sideways),
            "bear" | "bearish" => Ok(MarketRegime::Bear),
            "high_volatility" | "high_vol" => Ok(MarketRegime::HighVolatility),
            _ => anyhow::bail!("Invalid market regime: {}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_multipliers() {
        assert_eq!(MarketRegime::Bull.size_multiplier(), 1.0);
        assert_eq!(MarketRegime::Sideways.size_multiplier(), 0.75);
        assert_eq!(MarketRegime::Bear.size_multiplier(), 0.5);
        assert_eq!(MarketRegime::HighVolatility.size_multiplier(), 0.3);
    }

    #[test]
    fn test_stop_multipliers_tighten_in_bear() {
        let (bull_k, bull_m) = MarketRegime::Bull.stop_multipliers();
        let (bear_k, bear_m) = MarketRegime::Bear.stop_multipliers();
        assert!(bear_k < bull_k);
        assert!(bear_m < bull_m);
    }

    #[test]
    fn test_parsing_aliases() {
        assert_eq!(MarketRegime::from_str("bullish").unwrap(), MarketRegime::Bull);
        assert_eq!(MarketRegime::from_str("neutral").unwrap(), MarketRegime::Sideways);
        assert_eq!(
            MarketRegime::from_str("high_vol").unwrap(),
            MarketRegime::HighVolatility
        );
        assert!(MarketRegime::from_str("sidewise").is_err());
    }
}
