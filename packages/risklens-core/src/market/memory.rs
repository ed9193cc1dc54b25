//! In-process market data sources.

use super::{AssetMetadata, AssetMetadataSource, MarketDataSource, PanelFetch, PricePanel};
use crate::types::Period;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// On-disk shape of a market data snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketDataFile {
    pub prices: PricePanel,
    #[serde(default)]
    pub metadata: BTreeMap<String, AssetMetadata>,
}

/// Market data served from a preloaded panel.
///
/// The full stored history is returned regardless of the requested period;
/// windowing happens during alignment.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMarketData {
    panel: PricePanel,
    metadata: BTreeMap<String, AssetMetadata>,
}

impl InMemoryMarketData {
    pub fn new(panel: PricePanel) -> Self {
        Self {
            panel,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach sector/country metadata for a ticker.
    pub fn with_metadata(mut self, ticker: &str, metadata: AssetMetadata) -> Self {
        self.metadata.insert(ticker.to_uppercase(), metadata);
        self
    }

    /// Load a [`MarketDataFile`] from JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let file: MarketDataFile = serde_json::from_str(&content)?;
        debug!(
            path = %path.as_ref().display(),
            tickers = file.prices.tickers().count(),
            "loaded market data snapshot"
        );
        Ok(Self {
            panel: file.prices,
            metadata: file
                .metadata
                .into_iter()
                .map(|(ticker, meta)| (ticker.to_uppercase(), meta))
                .collect(),
        })
    }

    pub fn panel(&self) -> &PricePanel {
        &self.panel
    }
}

impl MarketDataSource for InMemoryMarketData {
    fn price_panel(&self, tickers: &BTreeSet<String>, _period: Period) -> Result<PanelFetch> {
        let mut fetch = PanelFetch::new(self.panel.subset(tickers));
        for ticker in tickers {
            if !self.panel.contains(ticker) {
                fetch
                    .failures
                    .insert(ticker.clone(), Error::TickerNotFound(ticker.clone()));
            }
        }
        Ok(fetch)
    }
}

impl AssetMetadataSource for InMemoryMarketData {
    fn metadata(&self, ticker: &str) -> Result<AssetMetadata> {
        self.metadata
            .get(ticker)
            .cloned()
            .ok_or_else(|| Error::TickerNotFound(ticker.to_string()))
    }
}

/// Wraps a blocking source and bounds each request by a timeout.
///
/// The request runs on a worker thread. On timeout the worker is abandoned
/// and the call fails with [`Error::DataUnavailable`].
#[derive(Clone)]
pub struct TimedSource {
    inner: Arc<dyn MarketDataSource>,
    timeout: Duration,
}

impl TimedSource {
    pub fn new(inner: Arc<dyn MarketDataSource>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl MarketDataSource for TimedSource {
    fn price_panel(&self, tickers: &BTreeSet<String>, period: Period) -> Result<PanelFetch> {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let request = tickers.clone();

        thread::Builder::new()
            .name("risklens-fetch".to_string())
            .spawn(move || {
                // The receiver may be gone after a timeout.
                let _ = tx.send(inner.price_panel(&request, period));
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?self.timeout, "market data request timed out");
                Err(Error::DataUnavailable(format!(
                    "market data request timed out after {:?}",
                    self.timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::DataUnavailable(
                "market data worker terminated without a response".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::PricePoint;
    use chrono::NaiveDate;

    struct SlowSource;

    impl MarketDataSource for SlowSource {
        fn price_panel(&self, _tickers: &BTreeSet<String>, _period: Period) -> Result<PanelFetch> {
            thread::sleep(Duration::from_millis(500));
            Ok(PanelFetch::default())
        }
    }

    fn sample_panel() -> PricePanel {
        let mut panel = PricePanel::new();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        panel.insert("AAPL", vec![PricePoint::new(date, 185.0)]);
        panel.insert("MSFT", vec![PricePoint::new(date, 370.0)]);
        panel
    }

    #[test]
    fn test_in_memory_reports_missing_tickers() {
        let source = InMemoryMarketData::new(sample_panel());
        let request = BTreeSet::from(["AAPL".to_string(), "NOPE".to_string()]);

        let fetch = source.price_panel(&request, Period::OneYear).unwrap();
        assert!(fetch.panel.contains("AAPL"));
        assert!(!fetch.panel.contains("MSFT"));
        assert!(matches!(
            fetch.failures.get("NOPE"),
            Some(Error::TickerNotFound(_))
        ));
    }

    #[test]
    fn test_price_series_single_ticker() {
        let source = InMemoryMarketData::new(sample_panel());
        assert_eq!(source.price_series("MSFT", Period::Max).unwrap().len(), 1);
        assert!(matches!(
            source.price_series("NOPE", Period::Max),
            Err(Error::TickerNotFound(_))
        ));
    }

    #[test]
    fn test_metadata_lookup() {
        let source = InMemoryMarketData::new(sample_panel()).with_metadata(
            "aapl",
            AssetMetadata {
                sector: "Technology".into(),
                country: "United States".into(),
                industry: None,
            },
        );
        assert_eq!(source.metadata("AAPL").unwrap().sector, "Technology");
        assert!(source.metadata("MSFT").is_err());
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.json");
        let file = MarketDataFile {
            prices: sample_panel(),
            metadata: BTreeMap::new(),
        };
        fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let source = InMemoryMarketData::from_json_file(&path).unwrap();
        assert!(source.panel().contains("AAPL"));
    }

    #[test]
    fn test_timed_source_passes_through() {
        let source = TimedSource::new(
            Arc::new(InMemoryMarketData::new(sample_panel())),
            Duration::from_secs(5),
        );
        let request = BTreeSet::from(["AAPL".to_string()]);
        assert!(source.price_panel(&request, Period::OneYear).is_ok());
    }

    #[test]
    fn test_timed_source_times_out() {
        let source = TimedSource::new(Arc::new(SlowSource), Duration::from_millis(20));
        let request = BTreeSet::from(["AAPL".to_string()]);
        let result = source.price_panel(&request, Period::OneYear);
        assert!(matches!(result, Err(Error::DataUnavailable(_))));
    }
}
