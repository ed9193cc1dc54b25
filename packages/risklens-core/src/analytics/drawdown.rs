//! Running-maximum drawdown analysis.

use crate::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Drawdown at one date, always `<= 0`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DrawdownPoint {
    pub date: NaiveDate,
    pub drawdown: f64,
}

/// Whether the value regained its pre-drawdown peak.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Recovery {
    /// The series never fell below its running maximum
    NoDrawdown,
    /// Peak regained `days` trading days after the trough
    Recovered { days: usize, date: NaiveDate },
    NotRecovered,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrawdownMetrics {
    /// Most negative drawdown, as a fraction
    pub max_drawdown: f64,
    pub max_drawdown_date: NaiveDate,
    /// Date of the running maximum preceding the trough
    pub peak_date: NaiveDate,
    pub current_drawdown: f64,
    pub recovery: Recovery,
    pub series: Vec<DrawdownPoint>,
}

impl DrawdownMetrics {
    /// Trading days to recover, when the peak was regained.
    pub fn recovery_time_days(&self) -> Option<usize> {
        match self.recovery {
            Recovery::Recovered { days, .. } => Some(days),
            _ => None,
        }
    }
}

/// Value of 1 invested at the start and compounded through `returns`.
///
/// The output has one more entry than `returns`.
pub fn wealth_index(returns: &[f64]) -> Vec<f64> {
    let mut values = Vec::with_capacity(returns.len() + 1);
    let mut value = 1.0;
    values.push(value);
    for r in returns {
        value *= 1.0 + r;
        values.push(value);
    }
    values
}

/// Drawdown analysis of a dated value series.
pub fn drawdown_metrics(dates: &[NaiveDate], values: &[f64]) -> Result<DrawdownMetrics> {
    if dates.len() != values.len() {
        return Err(Error::Validation(format!(
            "{} dates for {} values",
            dates.len(),
            values.len()
        )));
    }
    if values.is_empty() {
        return Err(Error::InsufficientHistory(
            "drawdown needs at least one value".to_string(),
        ));
    }
    if let Some(bad) = values.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
        return Err(Error::NumericInstability(format!(
            "drawdown needs positive finite values, found {}",
            bad
        )));
    }

    let mut series = Vec::with_capacity(values.len());
    let mut running_max = values[0];
    let mut running_peak = 0;
    let mut trough = 0;
    let mut peak = 0;
    let mut max_drawdown = 0.0;

    for (i, (&date, &value)) in dates.iter().zip(values).enumerate() {
        if value >= running_max {
            running_max = value;
            running_peak = i;
        }
        let drawdown = (value / running_max - 1.0).min(0.0);
        if drawdown < max_drawdown {
            max_drawdown = drawdown;
            trough = i;
            peak = running_peak;
        }
        series.push(DrawdownPoint { date, drawdown });
    }

    let recovery = if max_drawdown == 0.0 {
        Recovery::NoDrawdown
    } else {
        let target = values[peak];
        values[trough + 1..]
            .iter()
            .position(|v| *v >= target)
            .map(|offset| Recovery::Recovered {
                days: offset + 1,
                date: dates[trough + 1 + offset],
            })
            .unwrap_or(Recovery::NotRecovered)
    };

    Ok(DrawdownMetrics {
        max_drawdown,
        max_drawdown_date: dates[trough],
        peak_date: dates[peak],
        current_drawdown: series.last().map(|p| p.drawdown).unwrap_or(0.0),
        recovery,
        series,
    })
}
