//! Trades that move current holdings to target weights.

use crate::types::TradeAction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A suggested trade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebalancingTrade {
    pub ticker: String,
    pub action: TradeAction,
    /// Shares to trade, always positive
    pub shares: f64,
    /// Currency amount, always positive
    pub amount: f64,
    pub price: f64,
    pub current_weight: f64,
    pub target_weight: f64,
}

/// Current state of one holding in the optimizable universe.
#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub quantity: f64,
    pub price: f64,
}

/// Compare current holdings with target weights over the same total value.
///
/// Tickers present only in `targets` are bought from zero; tickers present
/// only in `holdings` are sold down to zero. Trades smaller than
/// `min_amount` in value or `min_shares` in shares are dropped. The result is
/// sorted by amount, largest first.
pub fn rebalancing_trades(
    holdings: &BTreeMap<String, Holding>,
    targets: &BTreeMap<String, f64>,
    prices: &BTreeMap<String, f64>,
    min_amount: f64,
    min_shares: f64,
) -> Vec<RebalancingTrade> {
    let total_value: f64 = holdings.values().map(|h| h.quantity * h.price).sum();
    if !(total_value.is_finite() && total_value > 0.0) {
        return Vec::new();
    }

    let tickers: BTreeSet<&String> = holdings.keys().chain(targets.keys()).collect();
    let mut trades = Vec::new();

    for ticker in tickers {
        let holding = holdings.get(ticker);
        let Some(price) = holding
            .map(|h| h.price)
            .or_else(|| prices.get(ticker).copied())
            .filter(|p| p.is_finite() && *p > 0.0)
        else {
            continue;
        };

        let current_value = holding.map(|h| h.quantity * h.price).unwrap_or(0.0);
        let target_weight = targets.get(ticker).copied().unwrap_or(0.0);
        let target_value = target_weight * total_value;
        let delta_value = target_value - current_value;
        let delta_shares = delta_value / price;

        if delta_value.abs() <= min_amount || delta_shares.abs() < min_shares {
            continue;
        }

        trades.push(RebalancingTrade {
            ticker: ticker.clone(),
            action: if delta_value > 0.0 {
                TradeAction::Buy
            } else {
                TradeAction::Sell
            },
            shares: delta_shares.abs(),
            amount: delta_value.abs(),
            price,
            current_weight: current_value / total_value,
            target_weight,
        });
    }

    trades.sort_by(|a, b| b.amount.total_cmp(&a.amount));
    trades
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn holdings(entries: &[(&str, f64, f64)]) -> BTreeMap<String, Holding> {
        entries
            .iter()
            .map(|(t, q, p)| (t.to_string(), Holding { quantity: *q, price: *p }))
            .collect()
    }

    #[test]
    fn test_buy_and_sell_to_target() {
        // 50/50 today, target 80/20; total 20_000
        let current = holdings(&[("AAA", 100.0, 100.0), ("BBB", 50.0, 200.0)]);
        let targets = BTreeMap::from([("AAA".to_string(), 0.8), ("BBB".to_string(), 0.2)]);
        let trades = rebalancing_trades(&current, &targets, &BTreeMap::new(), 10.0, 0.1);

        assert_eq!(trades.len(), 2);
        let aaa = trades.iter().find(|t| t.ticker == "AAA").unwrap();
        assert_eq!(aaa.action, TradeAction::Buy);
        assert_relative_eq!(aaa.amount, 6_000.0, epsilon = 1e-9);
        assert_relative_eq!(aaa.shares, 60.0, epsilon = 1e-9);
        assert_relative_eq!(aaa.current_weight, 0.5, epsilon = 1e-12);

        let bbb = trades.iter().find(|t| t.ticker == "BBB").unwrap();
        assert_eq!(bbb.action, TradeAction::Sell);
        assert_relative_eq!(bbb.shares, 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_small_deltas_are_dropped() {
        let current = holdings(&[("AAA", 100.0, 100.0), ("BBB", 100.0, 100.0)]);
        let targets = BTreeMap::from([("AAA".to_string(), 0.5002), ("BBB".to_string(), 0.4998)]);
        // Delta is $4 per side
        let trades = rebalancing_trades(&current, &targets, &BTreeMap::new(), 10.0, 0.1);
        assert!(trades.is_empty());
    }

    #[test]
    fn test_new_ticker_uses_supplied_price_and_sorting() {
        let current = holdings(&[("AAA", 10.0, 1_000.0)]);
        let targets = BTreeMap::from([
            ("AAA".to_string(), 0.5),
            ("NEW".to_string(), 0.3),
            ("ALT".to_string(), 0.2),
        ]);
        let prices = BTreeMap::from([("NEW".to_string(), 50.0), ("ALT".to_string(), 20.0)]);
        let trades = rebalancing_trades(&current, &targets, &prices, 10.0, 0.1);

        let amounts: Vec<f64> = trades.iter().map(|t| t.amount).collect();
        assert_eq!(trades[0].ticker, "AAA");
        assert!(amounts.windows(2).all(|w| w[0] >= w[1]));
        let new = trades.iter().find(|t| t.ticker == "NEW").unwrap();
        assert_relative_eq!(new.shares, 60.0, epsilon = 1e-9);
        assert_eq!(new.current_weight, 0.0);
    }

    #[test]
    fn test_empty_holdings_produce_no_trades() {
        let targets = BTreeMap::from([("AAA".to_string(), 1.0)]);
        assert!(rebalancing_trades(&BTreeMap::new(), &targets, &BTreeMap::new(), 10.0, 0.1).is_empty());
    }
}
