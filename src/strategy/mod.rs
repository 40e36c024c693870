//! Strategy dispatch: pure evaluation functions over a `StrategyContext`,
//! registered by name. Strategies never touch the database or the wire
//! — everything they need is assembled by the caller.

pub mod filters;
pub mod high_prob_yes;

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::domain::Position;

/// All data a strategy needs to make a decision. Built by the engine
/// from a `ProcessedEvent` plus database lookups.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub condition_id: String,
    pub token_id: String,
    pub question: String,
    pub category: Option<String>,

    pub trigger_price: f64,
    /// `None` when backfill (G3) could not find a matching trade.
    pub trade_size: Option<f64>,

    pub time_to_end_hours: f64,
    pub trade_age_seconds: f64,

    pub model_score: Option<f64>,

    pub current_position: Option<Position>,

    pub outcome: Option<String>,
    pub outcome_index: Option<i64>,
}

/// Decision returned by a strategy or a hard filter.
#[derive(Debug, Clone)]
pub enum Signal {
    Entry {
        token_id: String,
        side: crate::domain::Side,
        price: f64,
        size: f64,
        reason: String,
    },
    Exit {
        position_id: String,
        reason: String,
    },
    Hold {
        reason: String,
    },
    Watchlist {
        token_id: String,
        current_score: f64,
        reason: String,
    },
    Ignore {
        filter_name: String,
        reason: String,
    },
}

impl Signal {
    pub fn hold(reason: impl Into<String>) -> Self {
        Signal::Hold {
            reason: reason.into(),
        }
    }

    pub fn ignore(filter_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Signal::Ignore {
            filter_name: filter_name.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Entry { .. } => "entry",
            Signal::Exit { .. } => "exit",
            Signal::Hold { .. } => "hold",
            Signal::Watchlist { .. } => "watchlist",
            Signal::Ignore { .. } => "ignore",
        }
    }
}

/// Pure decision function: no I/O, no side effects, trivially testable.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, ctx: &StrategyContext) -> Signal;
}

/// Named strategy lookup. Registration fails on duplicate names so two
/// strategies can never silently shadow each other.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Box<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Box<dyn Strategy>) -> Result<()> {
        let name = strategy.name().to_string();
        if self.strategies.contains_key(&name) {
            bail!("strategy '{name}' is already registered");
        }
        self.strategies.insert(name, strategy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Strategy> {
        self.strategies.get(name).map(|s| s.as_ref())
    }

    pub fn list_all(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysHold;
    impl Strategy for AlwaysHold {
        fn name(&self) -> &str {
            "always_hold"
        }
        fn evaluate(&self, _ctx: &StrategyContext) -> Signal {
            Signal::hold("test")
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = StrategyRegistry::new();
        registry.register(Box::new(AlwaysHold)).unwrap();
        assert!(registry.register(Box::new(AlwaysHold)).is_err());
    }

    #[test]
    fn lookup_by_name() {
        let mut registry = StrategyRegistry::new();
        registry.register(Box::new(AlwaysHold)).unwrap();
        assert!(registry.get("always_hold").is_some());
        assert!(registry.get("missing").is_none());
    }
}
