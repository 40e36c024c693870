//! Environment/`.env`-driven configuration via `Config::from_env`:
//! every key has a parsed default, and only `database_url` is
//! required.

use std::env;

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub dry_run: bool,
    pub price_threshold: f64,
    pub position_size: f64,
    pub min_balance_reserve: f64,
    pub max_positions: usize,
    pub max_price_deviation: f64,
    pub max_trade_age_seconds: i64,
    pub verify_orderbook: bool,
    pub min_time_to_end_hours: f64,
    pub blocked_categories: Vec<String>,
    pub profit_target: f64,
    pub stop_loss: f64,
    pub min_hold_days: f64,
    pub max_spread_percent: f64,
    pub min_exit_price_floor: f64,
    pub max_slippage_percent: f64,
    pub watchlist_rescore_interval_hours: f64,
    pub order_sync_interval_seconds: u64,
    pub exit_eval_interval_seconds: u64,
    pub position_sync_interval_seconds: u64,
    pub full_position_sync_interval_seconds: u64,
    pub dashboard_host: String,
    pub dashboard_port: u16,
    pub dashboard_api_key: Option<String>,
    pub strategy_name: String,
    pub heartbeat_timeout_seconds: u64,
    pub fill_timeout_seconds: u64,
    pub alert_cooldown_seconds: u64,
    pub wallet_address: Option<String>,
    pub hold_policy: String,
    pub mature_days: i64,
    pub data_api_base: String,
    pub markets_api_base: String,
    pub market_discovery_interval_seconds: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let database_url = match env::var("DATABASE_URL") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => bail!("DATABASE_URL is required but not set"),
        };

        Ok(Self {
            database_url,
            dry_run: env_bool("DRY_RUN", true),
            price_threshold: env_parse("PRICE_THRESHOLD", 0.95),
            position_size: env_parse("POSITION_SIZE", 20.0),
            min_balance_reserve: env_parse("MIN_BALANCE_RESERVE", 100.0),
            max_positions: env_parse("MAX_POSITIONS", 50),
            max_price_deviation: env_parse("MAX_PRICE_DEVIATION", 0.10),
            max_trade_age_seconds: env_parse("MAX_TRADE_AGE_SECONDS", 300),
            verify_orderbook: env_bool("VERIFY_ORDERBOOK", true),
            min_time_to_end_hours: env_parse("MIN_TIME_TO_END_HOURS", 6.0),
            blocked_categories: env::var("BLOCKED_CATEGORIES")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            profit_target: env_parse("PROFIT_TARGET", 0.99),
            stop_loss: env_parse("STOP_LOSS", 0.90),
            min_hold_days: env_parse("MIN_HOLD_DAYS", 7.0),
            max_spread_percent: env_parse("MAX_SPREAD_PERCENT", 0.20),
            min_exit_price_floor: env_parse("MIN_EXIT_PRICE_FLOOR", 0.50),
            max_slippage_percent: env_parse("MAX_SLIPPAGE_PERCENT", 0.10),
            watchlist_rescore_interval_hours: env_parse("WATCHLIST_RESCORE_INTERVAL_HOURS", 1.0),
            order_sync_interval_seconds: env_parse("ORDER_SYNC_INTERVAL_SECONDS", 30),
            exit_eval_interval_seconds: env_parse("EXIT_EVAL_INTERVAL_SECONDS", 60),
            position_sync_interval_seconds: env_parse("POSITION_SYNC_INTERVAL_SECONDS", 120),
            full_position_sync_interval_seconds: env_parse(
                "FULL_POSITION_SYNC_INTERVAL_SECONDS",
                900,
            ),
            dashboard_host: env::var("DASHBOARD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            dashboard_port: env_parse("DASHBOARD_PORT", 8080),
            dashboard_api_key: env::var("DASHBOARD_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            strategy_name: env::var("STRATEGY_NAME").unwrap_or_else(|_| "high_prob_yes".to_string()),
            heartbeat_timeout_seconds: env_parse("HEARTBEAT_TIMEOUT_SECONDS", 30),
            fill_timeout_seconds: env_parse("FILL_TIMEOUT_SECONDS", 30),
            alert_cooldown_seconds: env_parse("ALERT_COOLDOWN_SECONDS", 300),
            wallet_address: env::var("WALLET_ADDRESS")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            hold_policy: env::var("HOLD_POLICY").unwrap_or_else(|_| "new".to_string()),
            mature_days: env_parse("MATURE_DAYS", 8),
            data_api_base: env::var("DATA_API_BASE")
                .unwrap_or_else(|_| "https://data-api.polymarket.com".to_string()),
            markets_api_base: env::var("MARKETS_API_BASE")
                .unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string()),
            market_discovery_interval_seconds: env_parse("MARKET_DISCOVERY_INTERVAL_SECONDS", 3600),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_url_is_fatal() {
        std::env::remove_var("DATABASE_URL");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn defaults_match_spec() {
        std::env::set_var("DATABASE_URL", "/tmp/triggerbot-test.db");
        std::env::remove_var("PRICE_THRESHOLD");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.price_threshold, 0.95);
        assert_eq!(cfg.min_hold_days, 7.0);
        assert_eq!(cfg.max_spread_percent, 0.20);
        assert!(cfg.dry_run);
        std::env::remove_var("DATABASE_URL");
    }
}
