//! Flagship reference strategy: enter markets where "Yes" is trading
//! at high probability and the external model agrees.

use crate::domain::Side;
use crate::strategy::{Signal, Strategy, StrategyContext};

#[derive(Debug, Clone)]
pub struct HighProbYesStrategy {
    price_threshold: f64,
    entry_score_threshold: f64,
    watchlist_score_min: f64,
    position_size: f64,
}

impl HighProbYesStrategy {
    pub fn new(price_threshold: f64, position_size: f64) -> Self {
        Self {
            price_threshold,
            entry_score_threshold: 0.97,
            watchlist_score_min: 0.90,
            position_size,
        }
    }
}

impl Strategy for HighProbYesStrategy {
    fn name(&self) -> &str {
        "high_prob_yes"
    }

    /// Size filtering happens upstream as a hard filter, so by the time
    /// a context reaches here `trade_size` has already passed the >= 50
    /// gate (or the strategy would never be called).
    fn evaluate(&self, ctx: &StrategyContext) -> Signal {
        if ctx.trigger_price < self.price_threshold {
            return Signal::hold(format!(
                "price {} < {}",
                ctx.trigger_price, self.price_threshold
            ));
        }

        let Some(score) = ctx.model_score else {
            return Signal::hold("no model score available");
        };

        if score >= self.entry_score_threshold {
            return Signal::Entry {
                token_id: ctx.token_id.clone(),
                side: Side::Buy,
                price: ctx.trigger_price,
                size: self.position_size,
                reason: format!("high probability entry (score={score:.2})"),
            };
        }

        if score >= self.watchlist_score_min {
            return Signal::Watchlist {
                token_id: ctx.token_id.clone(),
                current_score: score,
                reason: format!("score {score:.2} below entry threshold, watching"),
            };
        }

        Signal::hold(format!("score {score:.2} below watchlist threshold"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(price: f64, score: Option<f64>) -> StrategyContext {
        StrategyContext {
            condition_id: "C1".into(),
            token_id: "T1".into(),
            question: "Will X happen?".into(),
            category: None,
            trigger_price: price,
            trade_size: Some(100.0),
            time_to_end_hours: 48.0,
            trade_age_seconds: 5.0,
            model_score: score,
            current_position: None,
            outcome: None,
            outcome_index: None,
        }
    }

    #[test]
    fn high_score_triggers_entry() {
        let strategy = HighProbYesStrategy::new(0.95, 20.0);
        match strategy.evaluate(&ctx(0.96, Some(0.98))) {
            Signal::Entry { side, size, .. } => {
                assert_eq!(side, Side::Buy);
                assert_eq!(size, 20.0);
            }
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn mid_score_goes_to_watchlist() {
        let strategy = HighProbYesStrategy::new(0.95, 20.0);
        assert!(matches!(
            strategy.evaluate(&ctx(0.96, Some(0.93))),
            Signal::Watchlist { .. }
        ));
    }

    #[test]
    fn low_price_holds() {
        let strategy = HighProbYesStrategy::new(0.95, 20.0);
        assert!(matches!(
            strategy.evaluate(&ctx(0.80, Some(0.99))),
            Signal::Hold { .. }
        ));
    }

    #[test]
    fn low_score_holds() {
        let strategy = HighProbYesStrategy::new(0.95, 20.0);
        assert!(matches!(
            strategy.evaluate(&ctx(0.96, Some(0.5))),
            Signal::Hold { .. }
        ));
    }
}
