use crate::application::phase2::scoring::ScoredCandidate;
use crate::config::{CompositeWeightsConfig, LegacyFilterConfig, TargetCountsConfig};
use crate::domain::market_regime::MarketRegime;
use std::collections::HashMap;
use tracing::debug;

/// Blended attractiveness recorded on the selection row: the configured
/// mix of the batch-scaled technical, volume, inverted risk, and
/// confidence components, on the same 0..100 band as the composite.
pub fn attractiveness(candidate: &ScoredCandidate, weights: &CompositeWeightsConfig) -> f64 {
    let blended = weights.technical * candidate.technical_score
        + weights.volume * candidate.volume_score
        + weights.risk * (100.0 - candidate.risk_score)
        + weights.confidence * candidate.confidence * 100.0;
    blended.clamp(0.0, 100.0)
}

/// Safety filter: every candidate must clear all four thresholds, which
/// exist only in configuration.
pub fn passes_safety_filter(candidate: &ScoredCandidate, filter: &LegacyFilterConfig) -> bool {
    let passed = candidate.risk_score < filter.risk_max
        && candidate.volume_score > filter.volume_min
        && candidate.confidence >= filter.confidence_min
        && candidate.technical_score >= filter.technical_min;
    if !passed {
        debug!(
            "Safety filter rejected {}: risk {:.1} vol {:.1} conf {:.2} tech {:.1}",
            candidate.code,
            candidate.risk_score,
            candidate.volume_score,
            candidate.confidence,
            candidate.technical_score
        );
    }
    passed
}

/// Regime-adaptive target position count. The high-volatility regime uses
/// the bearish count, the most defensive of the three.
pub fn target_count(regime: MarketRegime, counts: &TargetCountsConfig) -> usize {
    match regime {
        MarketRegime::Bull => counts.bullish,
        MarketRegime::Sideways => counts.neutral,
        MarketRegime::Bear | MarketRegime::HighVolatility => counts.bearish,
    }
}

/// Take candidates in composite order subject to the per-sector cap.
pub fn select_with_sector_cap(
    mut candidates: Vec<ScoredCandidate>,
    target: usize,
    sector_cap: usize,
) -> Vec<ScoredCandidate> {
    candidates.sort_by(|a, b| {
        b.composite
            .partial_cmp(&a.composite)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.code.cmp(&b.code))
    });

    let mut per_sector: HashMap<String, usize> = HashMap::new();
    let mut selected = Vec::with_capacity(target);
    for candidate in candidates {
        if selected.len() >= target {
            break;
        }
        let count = per_sector.entry(candidate.sector.clone()).or_insert(0);
        if *count >= sector_cap {
            debug!(
                "Sector cap: skipping {} ({} already at {})",
                candidate.code, candidate.sector, sector_cap
            );
            continue;
        }
        *count += 1;
        selected.push(candidate);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::factors::FactorScores;
    use crate::domain::types::StockCode;

    fn candidate(code: &str, sector: &str, composite: f64) -> ScoredCandidate {
        ScoredCandidate {
            code: StockCode::parse(code).unwrap(),
            sector: sector.to_string(),
            priority: 50.0,
            factors: FactorScores::from_array([0.0; 7]),
            composite,
            risk_score: 40.0,
            volume_score: 55.0,
            technical_score: 60.0,
            confidence: 0.71,
            signal_count: 5,
        }
    }

    #[test]
    fn test_safety_filter_thresholds() {
        let filter = LegacyFilterConfig::default();
        let good = candidate("005930", "Tech", 70.0);
        assert!(passes_safety_filter(&good, &filter));

        let mut risky = good.clone();
        risky.risk_score = 75.0;
        assert!(!passes_safety_filter(&risky, &filter));

        let mut thin = good.clone();
        thin.volume_score = 25.0;
        assert!(!passes_safety_filter(&thin, &filter));

        let mut unsure = good.clone();
        unsure.confidence = 0.4;
        assert!(!passes_safety_filter(&unsure, &filter));

        let mut weak = good.clone();
        weak.technical_score = 30.0;
        assert!(!passes_safety_filter(&weak, &filter));
    }

    #[test]
    fn test_attractiveness_blend() {
        let weights = CompositeWeightsConfig::default();
        let strong = candidate("005930", "Tech", 70.0);
        let value = attractiveness(&strong, &weights);
        // 0.4*60 + 0.2*55 + 0.2*(100-40) + 0.2*71 = 61.2
        assert!((value - 61.2).abs() < 0.5, "got {value}");

        let mut risky = strong.clone();
        risky.risk_score = 90.0;
        assert!(attractiveness(&risky, &weights) < value);
    }

    #[test]
    fn test_target_counts_per_regime() {
        let counts = TargetCountsConfig::default();
        assert_eq!(target_count(MarketRegime::Bull, &counts), 12);
        assert_eq!(target_count(MarketRegime::Sideways, &counts), 8);
        assert_eq!(target_count(MarketRegime::Bear, &counts), 5);
        assert_eq!(target_count(MarketRegime::HighVolatility, &counts), 5);
    }

    #[test]
    fn test_sector_cap_enforced() {
        // Five semiconductor names outscore everything; cap lets three in.
        let mut candidates: Vec<ScoredCandidate> = (0..5)
            .map(|i| candidate(&format!("{:06}", 100000 + i), "Semis", 90.0 - i as f64))
            .collect();
        candidates.push(candidate("200000", "Autos", 60.0));
        candidates.push(candidate("200001", "Banks", 55.0));

        let selected = select_with_sector_cap(candidates, 5, 3);
        assert_eq!(selected.len(), 5);
        let semis = selected.iter().filter(|c| c.sector == "Semis").count();
        assert_eq!(semis, 3);
        assert_eq!(selected[0].composite, 90.0);
        // The two non-semis filled the remaining slots.
        assert!(selected.iter().any(|c| c.sector == "Autos"));
        assert!(selected.iter().any(|c| c.sector == "Banks"));
    }

    #[test]
    fn test_selection_is_composite_ordered() {
        let candidates = vec![
            candidate("000100", "A", 40.0),
            candidate("000200", "B", 80.0),
            candidate("000300", "C", 60.0),
        ];
        let selected = select_with_sector_cap(candidates, 2, 3);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].code.as_str(), "000200");
        assert_eq!(selected[1].code.as_str(), "000300");
    }
}
