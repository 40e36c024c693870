//! Core data model: markets, trades, orders, positions and the other
//! shared value types that flow between components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub token_id: String,
    pub outcome_label: String,
    pub outcome_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub condition_id: String,
    pub question: String,
    pub category: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub token_id: String,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

impl PriceUpdate {
    pub fn new(token_id: impl Into<String>, price: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            token_id: token_id.into(),
            price,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(anyhow::anyhow!("unrecognized side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub token_id: String,
    pub condition_id: Option<String>,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub traded_at: DateTime<Utc>,
}

impl Trade {
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.traded_at).num_seconds()
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, max_trade_age_seconds: i64) -> bool {
        self.age_seconds(now) <= max_trade_age_seconds
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub token_id: String,
    /// Descending by price.
    pub bids: Vec<BookLevel>,
    /// Ascending by price.
    pub asks: Vec<BookLevel>,
    pub observed_at: DateTime<Utc>,
}

impl Orderbook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn sort(&mut self) {
        self.bids
            .sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        self.asks
            .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub token_id: String,
    pub condition_id: String,
    pub threshold: f64,
    pub price: f64,
    pub trade_size: Option<f64>,
    pub model_score: Option<f64>,
    pub outcome: Option<String>,
    pub outcome_index: Option<i64>,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Live,
    Partial,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Live => "LIVE",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "LIVE" => Some(OrderStatus::Live),
            "PARTIAL" => Some(OrderStatus::Partial),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub token_id: String,
    pub condition_id: String,
    pub side: Side,
    pub limit_price: f64,
    pub size: f64,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub avg_fill_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgeSource {
    Actual,
    Unknown,
}

impl AgeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeSource::Actual => "actual",
            AgeSource::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "actual" {
            AgeSource::Actual
        } else {
            AgeSource::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Claiming,
    Pending,
    Timeout,
    Failed,
    Cancelled,
    Closed,
    StaleClaim,
    LiquidityBlocked,
    Cleared,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Claiming => "claiming",
            ExitStatus::Pending => "pending",
            ExitStatus::Timeout => "timeout",
            ExitStatus::Failed => "failed",
            ExitStatus::Cancelled => "cancelled",
            ExitStatus::Closed => "closed",
            ExitStatus::StaleClaim => "stale_claim",
            ExitStatus::LiquidityBlocked => "liquidity_blocked",
            ExitStatus::Cleared => "cleared",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "claiming" => ExitStatus::Claiming,
            "pending" => ExitStatus::Pending,
            "timeout" => ExitStatus::Timeout,
            "failed" => ExitStatus::Failed,
            "cancelled" => ExitStatus::Cancelled,
            "closed" => ExitStatus::Closed,
            "stale_claim" => ExitStatus::StaleClaim,
            "liquidity_blocked" => ExitStatus::LiquidityBlocked,
            "cleared" => ExitStatus::Cleared,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub token_id: String,
    pub condition_id: String,
    pub outcome: Option<String>,
    pub outcome_index: Option<i64>,
    pub size: f64,
    pub entry_price: f64,
    pub entry_cost: f64,
    pub entry_time: DateTime<Utc>,
    pub status: PositionStatus,
    pub realized_pnl: f64,
    pub exit_pending: bool,
    pub exit_status: Option<ExitStatus>,
    pub exit_order_id: Option<String>,
    pub hold_start_at: DateTime<Utc>,
    pub age_source: AgeSource,
    pub import_source: Option<String>,
    pub entry_order_id: Option<String>,
    pub description: Option<String>,
    /// When the current `exit_pending` claim was taken. `None` outside
    /// of a claim. Distinct from `hold_start_at`, which never changes
    /// after entry — staleness checks on an in-flight claim must key
    /// off this, not the position's age.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set when a reconciliation pass adjusts `size`/`entry_cost` from
    /// an externally observed fill: the recorded entry price no longer
    /// reflects a true weighted average of this position's own fills.
    pub cost_basis_unknown: bool,
}

impl Position {
    pub fn new_from_fill(
        position_id: String,
        token_id: String,
        condition_id: String,
        size: f64,
        fill_price: f64,
        now: DateTime<Utc>,
        entry_order_id: Option<String>,
    ) -> Self {
        Self {
            position_id,
            token_id,
            condition_id,
            outcome: None,
            outcome_index: None,
            size,
            entry_price: fill_price,
            entry_cost: size * fill_price,
            entry_time: now,
            status: PositionStatus::Open,
            realized_pnl: 0.0,
            exit_pending: false,
            exit_status: None,
            exit_order_id: None,
            hold_start_at: now,
            age_source: AgeSource::Actual,
            import_source: None,
            entry_order_id,
            description: None,
            claimed_at: None,
            cost_basis_unknown: false,
        }
    }

    pub fn hold_age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.hold_start_at).num_seconds() as f64 / 86_400.0
    }

    pub fn current_value(&self, current_price: f64) -> f64 {
        self.size * current_price
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        self.current_value(current_price) - self.entry_cost
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub order_id: String,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchlistStatus {
    Watching,
    Promoted,
    Expired,
    Traded,
}

impl WatchlistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchlistStatus::Watching => "watching",
            WatchlistStatus::Promoted => "promoted",
            WatchlistStatus::Expired => "expired",
            WatchlistStatus::Traded => "traded",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "promoted" => WatchlistStatus::Promoted,
            "expired" => WatchlistStatus::Expired,
            "traded" => WatchlistStatus::Traded,
            _ => WatchlistStatus::Watching,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub token_id: String,
    pub condition_id: String,
    pub question: Option<String>,
    pub trigger_price: Option<f64>,
    pub initial_score: f64,
    pub current_score: f64,
    pub time_to_end_hours: f64,
    pub status: WatchlistStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitEvent {
    pub position_id: String,
    pub token_id: String,
    pub condition_id: String,
    pub exit_type: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub gross_pnl: f64,
    pub net_pnl: f64,
    pub hours_held: f64,
    pub exit_order_id: Option<String>,
    pub status: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionStage {
    Threshold,
    Duplicate,
    G1TradeAge,
    G5Orderbook,
    G6Weather,
    TimeToEnd,
    TradeSize,
    Category,
    ManualBlock,
    MaxPositions,
    StrategyHold,
    StrategyIgnore,
}

impl RejectionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionStage::Threshold => "threshold",
            RejectionStage::Duplicate => "duplicate",
            RejectionStage::G1TradeAge => "g1_trade_age",
            RejectionStage::G5Orderbook => "g5_orderbook",
            RejectionStage::G6Weather => "g6_weather",
            RejectionStage::TimeToEnd => "time_to_end",
            RejectionStage::TradeSize => "trade_size",
            RejectionStage::Category => "category",
            RejectionStage::ManualBlock => "manual_block",
            RejectionStage::MaxPositions => "max_positions",
            RejectionStage::StrategyHold => "strategy_hold",
            RejectionStage::StrategyIgnore => "strategy_ignore",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub token_id: String,
    pub condition_id: String,
    pub stage: RejectionStage,
    pub observed_at: DateTime<Utc>,
    pub price: f64,
    pub details: Option<String>,
}

/// A raw event coming off the streaming ingestion layer, before hazard
/// filtering.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Price {
        token_id: String,
        condition_id: Option<String>,
        price: f64,
        observed_at: DateTime<Utc>,
    },
    Trade(Trade),
}

/// An event that has passed through the Event Processor's hazard filters.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub token_id: String,
    pub condition_id: Option<String>,
    pub price: f64,
    pub trade_size: Option<f64>,
    pub trade_age_seconds: Option<i64>,
    pub observed_at: DateTime<Utc>,
    pub g5_flagged: bool,
}
