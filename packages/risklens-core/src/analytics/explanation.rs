//! Deterministic plain-language summary of an analysis.

use crate::types::PositionRisk;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Volatility bucket used in the summary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    #[default]
    Low,
    Moderate,
    High,
    #[serde(rename = "Very High")]
    VeryHigh,
}

impl RiskLevel {
    /// Bucket an annualized volatility.
    pub fn from_volatility(volatility: f64) -> Self {
        if volatility > 0.30 {
            RiskLevel::VeryHigh
        } else if volatility > 0.20 {
            RiskLevel::High
        } else if volatility > 0.10 {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
            RiskLevel::VeryHigh => "very high",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskDriver {
    pub ticker: String,
    pub contribution_pct: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Explanation {
    pub summary: String,
    pub risk_level: RiskLevel,
    pub top_drivers: Vec<RiskDriver>,
    /// Combined contribution of `top_drivers`, in percent
    pub top_drivers_contribution_pct: f64,
}

/// Rank positions by risk contribution and render the summary.
///
/// Ties keep portfolio order. Positions contributing no risk are never
/// reported as drivers.
pub fn explain(
    positions: &[PositionRisk],
    total_value: f64,
    volatility: f64,
    var: f64,
    confidence_level: f64,
    top_k: usize,
) -> Explanation {
    let mut ranked: Vec<&PositionRisk> = positions
        .iter()
        .filter(|p| p.risk_contribution_pct > 0.0)
        .collect();
    ranked.sort_by(|a, b| b.risk_contribution_pct.total_cmp(&a.risk_contribution_pct));

    let top_drivers: Vec<RiskDriver> = ranked
        .into_iter()
        .take(top_k)
        .map(|p| RiskDriver {
            ticker: p.ticker.clone(),
            contribution_pct: p.risk_contribution_pct,
            weight: p.weight,
        })
        .collect();
    let top_drivers_contribution_pct = top_drivers.iter().map(|d| d.contribution_pct).sum();

    let risk_level = RiskLevel::from_volatility(volatility);
    let var_pct = if total_value > 0.0 {
        var / total_value * 100.0
    } else {
        0.0
    };

    let mut summary = format!(
        "Your {} portfolio has {} risk with an annualized volatility of {:.1}%. \
         The 1-day Value at Risk at {:.0}% confidence is {} ({:.2}% of the portfolio).",
        format_currency(total_value),
        risk_level,
        volatility * 100.0,
        confidence_level * 100.0,
        format_currency(var),
        var_pct,
    );
    match top_drivers.first() {
        Some(top) => {
            summary.push_str(&format!(
                " {} is the largest risk driver, contributing {:.1}% of total risk.",
                top.ticker, top.contribution_pct
            ));
            if top_drivers.len() > 1 {
                summary.push_str(&format!(
                    " The top {} positions account for {:.1}% of portfolio risk.",
                    top_drivers.len(),
                    top_drivers_contribution_pct
                ));
            }
        }
        None => summary.push_str(" No position contributes measurable risk."),
    }

    Explanation {
        summary,
        risk_level,
        top_drivers,
        top_drivers_contribution_pct,
    }
}

/// `$1,234,567.89`
fn format_currency(value: f64) -> String {
    let cents = (value.abs() * 100.0).round();
    let whole = (cents / 100.0).trunc() as u64;
    let fraction = (cents % 100.0) as u64;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 && cents > 0.0 { "-" } else { "" };
    format!("{}${}.{:02}", sign, grouped, fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetClass;

    fn position(ticker: &str, contribution: f64) -> PositionRisk {
        PositionRisk {
            ticker: ticker.to_string(),
            asset_class: AssetClass::Equity,
            quantity: 1.0,
            current_price: 100.0,
            value: 100.0,
            weight: 0.25,
            volatility: 0.2,
            risk_contribution_pct: contribution,
            marginal_risk: 0.1,
        }
    }

    #[test]
    fn test_risk_level_buckets() {
        assert_eq!(RiskLevel::from_volatility(0.05), RiskLevel::Low);
        assert_eq!(RiskLevel::from_volatility(0.10), RiskLevel::Low);
        assert_eq!(RiskLevel::from_volatility(0.15), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_volatility(0.25), RiskLevel::High);
        assert_eq!(RiskLevel::from_volatility(0.45), RiskLevel::VeryHigh);
    }

    #[test]
    fn test_format_currency() {
        assert_eq!(format_currency(0.0), "$0.00");
        assert_eq!(format_currency(999.999), "$1,000.00");
        assert_eq!(format_currency(1_234_567.891), "$1,234,567.89");
        assert_eq!(format_currency(-42.5), "-$42.50");
    }

    #[test]
    fn test_top_drivers_ranked_descending() {
        let positions = vec![
            position("AAPL", 20.0),
            position("MSFT", 45.0),
            position("GOOGL", 10.0),
            position("TLT", 25.0),
        ];
        let e = explain(&positions, 100_000.0, 0.22, 2_300.0, 0.95, 3);

        let tickers: Vec<&str> = e.top_drivers.iter().map(|d| d.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["MSFT", "TLT", "AAPL"]);
        assert_eq!(e.top_drivers_contribution_pct, 90.0);
        assert_eq!(e.risk_level, RiskLevel::High);
        assert!(e.summary.contains("$100,000.00"));
        assert!(e.summary.contains("MSFT is the largest risk driver"));
        assert!(e.summary.contains("22.0%"));
    }

    #[test]
    fn test_ties_keep_portfolio_order() {
        let positions = vec![position("B", 50.0), position("A", 50.0)];
        let e = explain(&positions, 1_000.0, 0.1, 10.0, 0.95, 1);
        assert_eq!(e.top_drivers[0].ticker, "B");
    }

    #[test]
    fn test_riskless_portfolio_has_no_drivers() {
        let positions = vec![position("CASH", 0.0)];
        let e = explain(&positions, 5_000.0, 0.0, 0.0, 0.95, 3);
        assert!(e.top_drivers.is_empty());
        assert_eq!(e.risk_level, RiskLevel::Low);
        assert!(e.summary.contains("No position contributes measurable risk"));
    }
}
