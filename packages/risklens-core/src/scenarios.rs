//! Historical stress scenarios.
//!
//! A scenario is static reference data: a named market shock, optionally
//! refined per asset class. Applying it to a value is pure arithmetic.

use crate::types::AssetClass;
use crate::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Moderate,
    Severe,
    Extreme,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Historical stress scenario definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub date_range: DateRange,
    pub duration_days: u32,
    /// Aggregate market move as a fraction (e.g. -0.38)
    pub market_shock: f64,
    /// Per-asset-class overrides of `market_shock`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub asset_class_shocks: BTreeMap<AssetClass, f64>,
}

impl Scenario {
    /// Shock applied to holdings of `asset_class`.
    ///
    /// Cash is unaffected unless the scenario overrides it.
    pub fn shock_for(&self, asset_class: AssetClass) -> f64 {
        match self.asset_class_shocks.get(&asset_class) {
            Some(shock) => *shock,
            None if asset_class.is_cash() => 0.0,
            None => self.market_shock,
        }
    }

    /// Apply the aggregate shock to a single value.
    pub fn apply(&self, value: f64) -> Result<ScenarioImpact> {
        validate_value(value)?;
        let projected_value = value * (1.0 + self.market_shock);
        Ok(self.impact(value, projected_value, Vec::new()))
    }

    /// Apply per-asset-class shocks to a value breakdown.
    pub fn apply_by_class(&self, values: &BTreeMap<AssetClass, f64>) -> Result<ScenarioImpact> {
        let mut original = 0.0;
        let mut projected = 0.0;
        let mut by_class = Vec::with_capacity(values.len());
        for (&asset_class, &value) in values {
            validate_value(value)?;
            let shock = self.shock_for(asset_class);
            let projected_value = value * (1.0 + shock);
            original += value;
            projected += projected_value;
            by_class.push(AssetClassImpact {
                asset_class,
                original_value: value,
                shock_pct: shock * 100.0,
                projected_value,
            });
        }
        Ok(self.impact(original, projected, by_class))
    }

    fn impact(
        &self,
        original_value: f64,
        projected_value: f64,
        by_asset_class: Vec<AssetClassImpact>,
    ) -> ScenarioImpact {
        let loss_pct = if original_value > 0.0 {
            (projected_value / original_value - 1.0) * 100.0
        } else {
            self.market_shock * 100.0
        };
        ScenarioImpact {
            scenario_id: self.id.clone(),
            scenario_name: self.name.clone(),
            description: self.description.clone(),
            severity: self.severity,
            date_range: self.date_range,
            duration_days: self.duration_days,
            market_shock_pct: self.market_shock * 100.0,
            original_value,
            projected_value,
            projected_loss: original_value - projected_value,
            loss_pct,
            by_asset_class,
        }
    }
}

fn validate_value(value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "scenario value must be finite and non-negative, got {}",
            value
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetClassImpact {
    pub asset_class: AssetClass,
    pub original_value: f64,
    pub shock_pct: f64,
    pub projected_value: f64,
}

/// Projected effect of a scenario on a portfolio value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioImpact {
    pub scenario_id: String,
    pub scenario_name: String,
    pub description: String,
    pub severity: Severity,
    pub date_range: DateRange,
    pub duration_days: u32,
    pub market_shock_pct: f64,
    pub original_value: f64,
    pub projected_value: f64,
    /// `original_value - projected_value`; positive for a loss
    pub projected_loss: f64,
    /// Signed change in percent; equals `market_shock_pct` for an aggregate shock
    pub loss_pct: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by_asset_class: Vec<AssetClassImpact>,
}

/// Read-only source of scenarios.
pub trait ScenarioCatalog: Send + Sync {
    fn list_scenarios(&self) -> Vec<Scenario>;

    fn get_scenario(&self, id: &str) -> Result<Scenario> {
        self.list_scenarios()
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::UnknownScenario(id.to_string()))
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

/// Built-in historical scenarios, in display order.
pub static BUILTIN_SCENARIOS: LazyLock<Vec<Scenario>> = LazyLock::new(|| {
    vec![
        Scenario {
            id: "2008_financial_crisis".to_string(),
            name: "2008 Financial Crisis".to_string(),
            description: "Global financial meltdown triggered by subprime mortgage collapse"
                .to_string(),
            severity: Severity::Extreme,
            date_range: DateRange {
                start: date(2008, 9, 1),
                end: date(2009, 3, 31),
            },
            duration_days: 212,
            market_shock: -0.38,
            asset_class_shocks: BTreeMap::new(),
        },
        Scenario {
            id: "covid_crash".to_string(),
            name: "COVID-19 Crash".to_string(),
            description: "Pandemic-induced market crash in early 2020".to_string(),
            severity: Severity::Severe,
            date_range: DateRange {
                start: date(2020, 2, 19),
                end: date(2020, 3, 23),
            },
            duration_days: 33,
            market_shock: -0.34,
            asset_class_shocks: BTreeMap::new(),
        },
        Scenario {
            id: "dotcom_bubble".to_string(),
            name: "Dot-com Bubble Burst".to_string(),
            description: "Technology stock collapse from 2000-2002".to_string(),
            severity: Severity::Extreme,
            date_range: DateRange {
                start: date(2000, 3, 1),
                end: date(2002, 10, 1),
            },
            duration_days: 945,
            market_shock: -0.49,
            asset_class_shocks: BTreeMap::new(),
        },
        Scenario {
            id: "black_monday".to_string(),
            name: "1987 Black Monday".to_string(),
            description: "Largest single-day percentage decline in stock market history"
                .to_string(),
            severity: Severity::Severe,
            date_range: DateRange {
                start: date(1987, 10, 19),
                end: date(1987, 10, 19),
            },
            duration_days: 1,
            market_shock: -0.22,
            asset_class_shocks: BTreeMap::new(),
        },
    ]
});

/// Catalog backed by [`BUILTIN_SCENARIOS`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticScenarioCatalog;

impl ScenarioCatalog for StaticScenarioCatalog {
    fn list_scenarios(&self) -> Vec<Scenario> {
        BUILTIN_SCENARIOS.clone()
    }

    fn get_scenario(&self, id: &str) -> Result<Scenario> {
        let id = id.trim().to_lowercase();
        BUILTIN_SCENARIOS
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(Error::UnknownScenario(id))
    }
}

/// Catalog holding caller-supplied scenarios.
#[derive(Debug, Clone, Default)]
pub struct CustomScenarioCatalog {
    scenarios: Vec<Scenario>,
}

impl CustomScenarioCatalog {
    pub fn new(scenarios: Vec<Scenario>) -> Self {
        Self { scenarios }
    }

    /// The built-in scenarios followed by `extra`.
    pub fn with_builtins(extra: Vec<Scenario>) -> Self {
        let mut scenarios = BUILTIN_SCENARIOS.clone();
        scenarios.extend(extra);
        Self { scenarios }
    }
}

impl ScenarioCatalog for CustomScenarioCatalog {
    fn list_scenarios(&self) -> Vec<Scenario> {
        self.scenarios.clone()
    }
}
