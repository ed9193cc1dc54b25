//! Market data collaborators.
//!
//! The engine never performs network I/O itself. Prices, benchmark series and
//! asset metadata arrive through the traits in this module.

mod memory;
mod panel;

pub use memory::{InMemoryMarketData, MarketDataFile, TimedSource};
pub use panel::{AlignedPanel, PricePanel, PricePoint};
pub(crate) use panel::clean_series;

use crate::types::Period;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Result of a panel request that may have failed for individual tickers.
#[derive(Debug, Default)]
pub struct PanelFetch {
    pub panel: PricePanel,
    /// Per-ticker failures, typically [`Error::TickerNotFound`]
    pub failures: BTreeMap<String, Error>,
}

impl PanelFetch {
    pub fn new(panel: PricePanel) -> Self {
        Self {
            panel,
            failures: BTreeMap::new(),
        }
    }
}

/// Source of historical adjusted-close prices.
///
/// Implementations return whatever tickers they could resolve and report the
/// rest in [`PanelFetch::failures`]. A complete outage is
/// [`Error::DataUnavailable`].
pub trait MarketDataSource: Send + Sync {
    fn price_panel(&self, tickers: &BTreeSet<String>, period: Period) -> Result<PanelFetch>;

    /// Convenience for single-series requests such as a benchmark index.
    fn price_series(&self, ticker: &str, period: Period) -> Result<Vec<PricePoint>> {
        let request = BTreeSet::from([ticker.to_string()]);
        let mut fetch = self.price_panel(&request, period)?;
        if let Some(error) = fetch.failures.remove(ticker) {
            return Err(error);
        }
        fetch
            .panel
            .remove(ticker)
            .ok_or_else(|| Error::TickerNotFound(ticker.to_string()))
    }
}

/// Static classification of a ticker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetMetadata {
    pub sector: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
}

/// Source of sector/country metadata used for exposure breakdowns.
pub trait AssetMetadataSource: Send + Sync {
    fn metadata(&self, ticker: &str) -> Result<AssetMetadata>;
}
