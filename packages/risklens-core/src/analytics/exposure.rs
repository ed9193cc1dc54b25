//! Sector and country exposure.

use crate::market::AssetMetadataSource;
use crate::types::{AssetClass, Warning, WarningCode};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const UNKNOWN: &str = "Unknown";
const CASH: &str = "Cash";

/// Value weights aggregated by sector and by country; each map sums to 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SectorBreakdown {
    pub sectors: BTreeMap<String, f64>,
    pub countries: BTreeMap<String, f64>,
}

/// Aggregate position weights by sector and country.
///
/// `holdings` are `(ticker, asset class, weight)`. Cash is bucketed as
/// `Cash`; tickers without metadata fall into `Unknown` with a warning.
/// Fails when no risky ticker could be classified.
pub fn sector_breakdown(
    holdings: &[(String, AssetClass, f64)],
    source: &dyn AssetMetadataSource,
    warnings: &mut Vec<Warning>,
) -> Result<SectorBreakdown> {
    let mut breakdown = SectorBreakdown::default();
    let mut risky = 0;
    let mut classified = 0;

    for (ticker, asset_class, weight) in holdings {
        let (sector, country) = if asset_class.is_cash() {
            (CASH.to_string(), CASH.to_string())
        } else {
            risky += 1;
            match source.metadata(ticker) {
                Ok(meta) => {
                    classified += 1;
                    (meta.sector, meta.country)
                }
                Err(e) => {
                    debug!(ticker = %ticker, error = %e, "no metadata for ticker");
                    warnings.push(Warning::new(
                        WarningCode::SectorBreakdownUnavailable,
                        format!("no sector/country metadata for {}", ticker),
                    ));
                    (UNKNOWN.to_string(), UNKNOWN.to_string())
                }
            }
        };
        *breakdown.sectors.entry(sector).or_insert(0.0) += weight;
        *breakdown.countries.entry(country).or_insert(0.0) += weight;
    }

    if risky > 0 && classified == 0 {
        return Err(Error::DataUnavailable(
            "no metadata available for any holding".to_string(),
        ));
    }
    Ok(breakdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{AssetMetadata, InMemoryMarketData, PricePanel};
    use approx::assert_relative_eq;

    fn source() -> InMemoryMarketData {
        let meta = |sector: &str, country: &str| AssetMetadata {
            sector: sector.into(),
            country: country.into(),
            industry: None,
        };
        InMemoryMarketData::new(PricePanel::new())
            .with_metadata("AAPL", meta("Technology", "United States"))
            .with_metadata("MSFT", meta("Technology", "United States"))
            .with_metadata("ASML", meta("Technology", "Netherlands"))
            .with_metadata("JNJ", meta("Healthcare", "United States"))
    }

    #[test]
    fn test_weights_aggregate_by_sector_and_country() {
        let holdings = vec![
            ("AAPL".to_string(), AssetClass::Equity, 0.3),
            ("MSFT".to_string(), AssetClass::Equity, 0.2),
            ("ASML".to_string(), AssetClass::Equity, 0.1),
            ("JNJ".to_string(), AssetClass::Equity, 0.3),
            ("CASH".to_string(), AssetClass::Cash, 0.1),
        ];
        let mut warnings = Vec::new();
        let b = sector_breakdown(&holdings, &source(), &mut warnings).unwrap();

        assert_relative_eq!(b.sectors["Technology"], 0.6, epsilon = 1e-12);
        assert_relative_eq!(b.sectors["Healthcare"], 0.3, epsilon = 1e-12);
        assert_relative_eq!(b.countries["United States"], 0.8, epsilon = 1e-12);
        assert_relative_eq!(b.countries["Cash"], 0.1, epsilon = 1e-12);
        assert_relative_eq!(b.sectors.values().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_unknown_ticker_is_bucketed_with_warning() {
        let holdings = vec![
            ("AAPL".to_string(), AssetClass::Equity, 0.5),
            ("ZZZZ".to_string(), AssetClass::Equity, 0.5),
        ];
        let mut warnings = Vec::new();
        let b = sector_breakdown(&holdings, &source(), &mut warnings).unwrap();
        assert_eq!(b.sectors[UNKNOWN], 0.5);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_fails_without_any_metadata() {
        let holdings = vec![("ZZZZ".to_string(), AssetClass::Equity, 1.0)];
        let mut warnings = Vec::new();
        assert!(sector_breakdown(&holdings, &source(), &mut warnings).is_err());
    }
}
