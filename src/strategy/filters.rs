//! Hard filters: run before strategy evaluation. Any rejection short
//! circuits straight to `Signal::Ignore` — the strategy is never
//! called.
//!
//! The weather filter is word-boundary-aware on purpose: a naive
//! substring match against "rain" blocks "Rainbow Six Siege", which
//! shipped once and had to be fixed.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::strategy::{Signal, StrategyContext};

const MIN_TRADE_SIZE: f64 = 50.0;

static WEATHER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(rain|snow|hurricane|storm|weather|tornado|flood|drought)\b").unwrap()
});

pub fn weather(ctx: &StrategyContext) -> Option<Signal> {
    if WEATHER_RE.is_match(&ctx.question) {
        Some(Signal::ignore(
            "weather",
            format!("question matches weather pattern: {}", ctx.question),
        ))
    } else {
        None
    }
}

pub fn time_to_end(ctx: &StrategyContext, min_hours: f64) -> Option<Signal> {
    if ctx.time_to_end_hours < min_hours {
        Some(Signal::ignore(
            "time_to_end",
            format!(
                "time_to_end_hours {} < {min_hours}",
                ctx.time_to_end_hours
            ),
        ))
    } else {
        None
    }
}

pub fn category(ctx: &StrategyContext, blocked: &[String]) -> Option<Signal> {
    match &ctx.category {
        Some(cat) if blocked.iter().any(|b| b.eq_ignore_ascii_case(cat)) => Some(Signal::ignore(
            "category",
            format!("category '{cat}' is blocked"),
        )),
        _ => None,
    }
}

pub fn trade_age(ctx: &StrategyContext, max_trade_age_seconds: f64) -> Option<Signal> {
    if ctx.trade_age_seconds > max_trade_age_seconds {
        Some(Signal::ignore(
            "trade_age",
            format!(
                "trade_age_seconds {} > {max_trade_age_seconds}",
                ctx.trade_age_seconds
            ),
        ))
    } else {
        None
    }
}

/// The size >= 50 filter is the single highest-impact win-rate lever
/// in the pipeline; treat `None` (G3 — backfill failed) as a failure.
pub fn trade_size(ctx: &StrategyContext) -> Option<Signal> {
    match ctx.trade_size {
        Some(size) if size >= MIN_TRADE_SIZE => None,
        Some(size) => Some(Signal::ignore(
            "trade_size",
            format!("trade_size {size} < {MIN_TRADE_SIZE}"),
        )),
        None => Some(Signal::ignore(
            "trade_size",
            "trade size unknown (G3 backfill failed)",
        )),
    }
}

/// Runs all hard filters in order, short-circuiting on the first
/// rejection. Returns `None` when the context passes every filter.
pub fn run_all(
    ctx: &StrategyContext,
    min_time_to_end_hours: f64,
    blocked_categories: &[String],
    max_trade_age_seconds: f64,
) -> Option<Signal> {
    weather(ctx)
        .or_else(|| time_to_end(ctx, min_time_to_end_hours))
        .or_else(|| category(ctx, blocked_categories))
        .or_else(|| trade_age(ctx, max_trade_age_seconds))
        .or_else(|| trade_size(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_ctx() -> StrategyContext {
        StrategyContext {
            condition_id: "C1".into(),
            token_id: "T1".into(),
            question: "Will the Fed cut rates in March?".into(),
            category: Some("economics".into()),
            trigger_price: 0.96,
            trade_size: Some(100.0),
            time_to_end_hours: 48.0,
            trade_age_seconds: 5.0,
            model_score: Some(0.98),
            current_position: None,
            outcome: None,
            outcome_index: None,
        }
    }

    #[test]
    fn rainbow_six_siege_is_not_blocked_by_weather_filter() {
        let mut ctx = base_ctx();
        ctx.question = "Will Rainbow Six Siege esports event X happen?".into();
        assert!(weather(&ctx).is_none());
    }

    #[test]
    fn will_it_rain_is_blocked_by_weather_filter() {
        let mut ctx = base_ctx();
        ctx.question = "Will it rain in NYC tomorrow?".into();
        assert!(weather(&ctx).is_some());
    }

    #[test]
    fn trade_size_none_is_rejected() {
        let mut ctx = base_ctx();
        ctx.trade_size = None;
        assert!(trade_size(&ctx).is_some());
    }

    #[test]
    fn trade_size_below_minimum_is_rejected() {
        let mut ctx = base_ctx();
        ctx.trade_size = Some(10.0);
        assert!(trade_size(&ctx).is_some());
    }

    #[test]
    fn passing_context_clears_all_filters() {
        let ctx = base_ctx();
        assert!(run_all(&ctx, 6.0, &["politics".to_string()], 60.0).is_none());
    }
}
