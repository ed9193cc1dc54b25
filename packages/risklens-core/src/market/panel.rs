//! Price panels and alignment onto a common trading-day index.

use crate::types::{Period, Warning, WarningCode};
use crate::{Error, Result};
use chrono::NaiveDate;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// One adjusted-close observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

impl PricePoint {
    pub fn new(date: NaiveDate, close: f64) -> Self {
        Self { date, close }
    }
}

/// Ticker to chronological price series, as delivered by a market data source.
///
/// Series are not assumed to be sorted, deduplicated or aligned; see
/// [`PricePanel::align`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PricePanel {
    series: BTreeMap<String, Vec<PricePoint>>,
}

impl PricePanel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a ticker's series. Tickers are upper-cased.
    pub fn insert(&mut self, ticker: &str, points: Vec<PricePoint>) {
        self.series.insert(ticker.trim().to_uppercase(), points);
    }

    pub fn get(&self, ticker: &str) -> Option<&[PricePoint]> {
        self.series.get(ticker).map(Vec::as_slice)
    }

    pub fn remove(&mut self, ticker: &str) -> Option<Vec<PricePoint>> {
        self.series.remove(ticker)
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.series.contains_key(ticker)
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Keep only the requested tickers.
    pub fn subset(&self, tickers: &BTreeSet<String>) -> PricePanel {
        PricePanel {
            series: self
                .series
                .iter()
                .filter(|(ticker, _)| tickers.contains(*ticker))
                .map(|(ticker, points)| (ticker.clone(), points.clone()))
                .collect(),
        }
    }

    /// Align the requested tickers onto a common index inside `period`.
    ///
    /// - Non-finite and non-positive prices are treated as missing.
    /// - The window ends at the latest observation across the requested tickers.
    /// - Tickers with fewer than `min_prices` observations in the window are
    ///   excluded and reported as warnings.
    /// - The index is the union of the remaining dates, starting at the latest
    ///   first observation; gaps are forward-filled, never zero-filled.
    pub fn align(&self, tickers: &[String], period: Period, min_prices: usize) -> Result<AlignedPanel> {
        // A return needs two prices.
        let min_prices = min_prices.max(2);
        let mut warnings = Vec::new();
        let mut cleaned = Vec::with_capacity(tickers.len());

        for ticker in tickers {
            match self.series.get(ticker) {
                Some(points) => cleaned.push((ticker.clone(), clean_series(points))),
                None => {
                    warn!(ticker = %ticker, "ticker missing from price panel");
                    warnings.push(Warning::new(
                        WarningCode::TickerNotFound,
                        format!("no price data for {}", ticker),
                    ));
                }
            }
        }

        let end = cleaned
            .iter()
            .filter_map(|(_, series)| series.last().map(|p| p.date))
            .max()
            .ok_or_else(|| {
                Error::InsufficientHistory("no price observations for any ticker".to_string())
            })?;
        let start = period.start_date(end);

        let mut kept: Vec<(String, Vec<PricePoint>)> = Vec::with_capacity(cleaned.len());
        for (ticker, series) in cleaned {
            let windowed: Vec<PricePoint> = series
                .into_iter()
                .filter(|p| start.is_none_or(|s| p.date >= s))
                .collect();

            if windowed.len() < min_prices {
                warn!(
                    ticker = %ticker,
                    observations = windowed.len(),
                    required = min_prices,
                    "excluding ticker with insufficient history"
                );
                warnings.push(Warning::new(
                    WarningCode::TickerExcluded,
                    format!(
                        "{} has {} prices in the {} window, at least {} required",
                        ticker,
                        windowed.len(),
                        period,
                        min_prices
                    ),
                ));
                continue;
            }
            kept.push((ticker, windowed));
        }

        let first_common = kept
            .iter()
            .map(|(_, series)| series[0].date)
            .max()
            .ok_or_else(|| {
                Error::InsufficientHistory(format!(
                    "no ticker has at least {} prices in the {} window",
                    min_prices, period
                ))
            })?;

        let dates: Vec<NaiveDate> = kept
            .iter()
            .flat_map(|(_, series)| series.iter().map(|p| p.date))
            .filter(|date| *date >= first_common)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if dates.len() < min_prices {
            return Err(Error::InsufficientHistory(format!(
                "only {} aligned observations from {}, at least {} required",
                dates.len(),
                first_common,
                min_prices
            )));
        }

        let mut prices = DMatrix::zeros(dates.len(), kept.len());
        for (col, (_, series)) in kept.iter().enumerate() {
            let mut cursor = 0;
            let mut last = series[0].close;
            for (row, date) in dates.iter().enumerate() {
                while cursor < series.len() && series[cursor].date <= *date {
                    last = series[cursor].close;
                    cursor += 1;
                }
                prices[(row, col)] = last;
            }
        }

        debug!(
            tickers = kept.len(),
            observations = dates.len(),
            start = %dates[0],
            end = %end,
            "aligned price panel"
        );

        Ok(AlignedPanel {
            tickers: kept.into_iter().map(|(ticker, _)| ticker).collect(),
            dates,
            prices,
            warnings,
        })
    }
}

/// Sort by date, drop unusable prices and keep the last observation per date.
pub(crate) fn clean_series(points: &[PricePoint]) -> Vec<PricePoint> {
    let mut sorted: Vec<PricePoint> = points
        .iter()
        .filter(|p| p.close.is_finite() && p.close > 0.0)
        .copied()
        .collect();
    sorted.sort_by_key(|p| p.date);

    let mut deduped: Vec<PricePoint> = Vec::with_capacity(sorted.len());
    for point in sorted {
        match deduped.last_mut() {
            Some(last) if last.date == point.date => *last = point,
            _ => deduped.push(point),
        }
    }
    deduped
}

/// Prices of several tickers on one shared index.
#[derive(Debug, Clone)]
pub struct AlignedPanel {
    pub tickers: Vec<String>,
    pub dates: Vec<NaiveDate>,
    /// Rows are dates, columns are tickers
    pub prices: DMatrix<f64>,
    /// Tickers dropped during alignment
    pub warnings: Vec<Warning>,
}

impl AlignedPanel {
    /// Last aligned price per ticker.
    pub fn last_prices(&self) -> Vec<f64> {
        let last = self.prices.nrows() - 1;
        (0..self.prices.ncols())
            .map(|col| self.prices[(last, col)])
            .collect()
    }
}
