use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("trader not initialized")]
    NotInitialized,
    #[error("invalid market price for {symbol}: {price}")]
    InvalidPrice { symbol: String, price: f64 },
    #[error("position not found for {0}")]
    PositionNotFound(String),
    #[error("insufficient balance: need ${needed:.2}, available ${available:.2}")]
    InsufficientBalance { needed: f64, available: f64 },
    #[error("order rejected: {0}")]
    OrderRejected(String),
    #[error("exchange error: {0}")]
    Exchange(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

/// Exchange-reported position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Contract size.
    pub size: f64,
    /// Notional USD value.
    pub size_usd: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_percent: f64,
    pub liquidation_price: Option<f64>,
    pub margin_used: f64,
}

impl Position {
    pub fn is_profitable(&self) -> bool {
        self.unrealized_pnl > 0.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: f64,
    pub available_balance: f64,
    pub total_margin_used: f64,
    pub unrealized_pnl: f64,
    pub positions: Vec<Position>,
}

impl AccountState {
    pub fn margin_usage_percent(&self) -> f64 {
        if self.equity == 0.0 {
            return 0.0;
        }
        self.total_margin_used / self.equity * 100.0
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub filled_size: Option<f64>,
    pub filled_price: Option<f64>,
    pub status: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    pub fn filled(order_id: String, size: f64, price: f64) -> Self {
        Self {
            success: true,
            order_id: Some(order_id),
            filled_size: Some(size),
            filled_price: Some(price),
            status: "filled".to_string(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            filled_size: None,
            filled_price: None,
            status: "failed".to_string(),
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn no_action() -> Self {
        Self {
            success: true,
            order_id: None,
            filled_size: None,
            filled_price: None,
            status: "no_action".to_string(),
            error: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub mid_price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub volume_24h: f64,
    pub funding_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Single candlestick, OHLCV.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Kline {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Kline {
    pub fn change_percent(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.close - self.open) / self.open * 100.0
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FundingRate {
    pub timestamp: DateTime<Utc>,
    /// Rate as a decimal (0.0001 = 0.01%).
    pub rate: f64,
}
