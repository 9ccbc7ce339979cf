use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::decision::RiskControls;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("grid config: upper_price must be > lower_price ({upper} <= {lower})")]
    GridBounds { upper: f64, lower: f64 },
    #[error("grid config: grid_count must be in 2..=200 (got {0})")]
    GridCount(u32),
    #[error("leverage must be in 1..=50 (got {0})")]
    Leverage(u32),
    #[error("{field} must be positive (got {value})")]
    NonPositive { field: &'static str, value: f64 },
    #[error("rsi config: overbought_threshold must be > oversold_threshold")]
    RsiThresholds,
    #[error("unknown strategy type: {0}")]
    UnknownStrategyType(String),
    #[error("invalid config payload: {0}")]
    Payload(#[from] serde_json::Error),
}

fn default_leverage() -> u32 {
    1
}

/// Grid trading: a ladder of buy/sell levels within a price band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub upper_price: f64,
    pub lower_price: f64,
    pub grid_count: u32,
    pub total_investment: f64,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

impl GridConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upper_price <= self.lower_price {
            return Err(ConfigError::GridBounds {
                upper: self.upper_price,
                lower: self.lower_price,
            });
        }
        if !(2..=200).contains(&self.grid_count) {
            return Err(ConfigError::GridCount(self.grid_count));
        }
        if !(1..=50).contains(&self.leverage) {
            return Err(ConfigError::Leverage(self.leverage));
        }
        if self.total_investment <= 0.0 {
            return Err(ConfigError::NonPositive {
                field: "total_investment",
                value: self.total_investment,
            });
        }
        Ok(())
    }
}

fn default_take_profit_percent() -> f64 {
    5.0
}

/// Dollar-cost averaging: periodic buys with a take-profit exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaConfig {
    pub order_amount: f64,
    pub interval_minutes: i64,
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: f64,
    /// 0 = unlimited
    #[serde(default)]
    pub total_budget: f64,
    /// 0 = unlimited
    #[serde(default)]
    pub max_orders: u32,
}

impl DcaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.order_amount <= 0.0 {
            return Err(ConfigError::NonPositive {
                field: "order_amount",
                value: self.order_amount,
            });
        }
        if self.interval_minutes < 1 {
            return Err(ConfigError::NonPositive {
                field: "interval_minutes",
                value: self.interval_minutes as f64,
            });
        }
        Ok(())
    }
}

fn default_rsi_period() -> u32 {
    14
}
fn default_overbought() -> f64 {
    70.0
}
fn default_oversold() -> f64 {
    30.0
}
fn default_timeframe() -> String {
    "1h".to_string()
}

/// RSI signal trading: buy oversold, sell overbought.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiConfig {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: u32,
    #[serde(default = "default_overbought")]
    pub overbought_threshold: f64,
    #[serde(default = "default_oversold")]
    pub oversold_threshold: f64,
    pub order_amount: f64,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

impl RsiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.overbought_threshold <= self.oversold_threshold {
            return Err(ConfigError::RsiThresholds);
        }
        if self.order_amount <= 0.0 {
            return Err(ConfigError::NonPositive {
                field: "order_amount",
                value: self.order_amount,
            });
        }
        if !(1..=50).contains(&self.leverage) {
            return Err(ConfigError::Leverage(self.leverage));
        }
        Ok(())
    }
}

/// Quant strategy config, dispatched by the `strategy_type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy_type", content = "config", rename_all = "lowercase")]
pub enum QuantConfig {
    Grid(GridConfig),
    Dca(DcaConfig),
    Rsi(RsiConfig),
}

impl QuantConfig {
    pub fn strategy_type(&self) -> &'static str {
        match self {
            QuantConfig::Grid(_) => "grid",
            QuantConfig::Dca(_) => "dca",
            QuantConfig::Rsi(_) => "rsi",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            QuantConfig::Grid(c) => c.validate(),
            QuantConfig::Dca(c) => c.validate(),
            QuantConfig::Rsi(c) => c.validate(),
        }
    }

    /// Build from the raw `(strategy_type, config)` columns.
    pub fn from_parts(strategy_type: &str, config: serde_json::Value) -> Result<Self, ConfigError> {
        let parsed = match strategy_type {
            "grid" => QuantConfig::Grid(serde_json::from_value(config)?),
            "dca" => QuantConfig::Dca(serde_json::from_value(config)?),
            "rsi" => QuantConfig::Rsi(serde_json::from_value(config)?),
            other => return Err(ConfigError::UnknownStrategyType(other.to_string())),
        };
        parsed.validate()?;
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Aggressive,
    Balanced,
    Conservative,
}

impl Default for TradingMode {
    fn default() -> Self {
        TradingMode::Conservative
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Zh,
}

impl Default for Language {
    fn default() -> Self {
        Language::En
    }
}

/// User-editable prompt sections; empty strings fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptSections {
    #[serde(default)]
    pub role_definition: String,
    #[serde(default)]
    pub trading_frequency: String,
    #[serde(default)]
    pub entry_standards: String,
    #[serde(default)]
    pub decision_process: String,
}

/// Configuration for an AI-driven strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiStrategyConfig {
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub timeframes: Vec<String>,
    #[serde(default)]
    pub risk_controls: RiskControls,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub prompt_sections: PromptSections,
    #[serde(default)]
    pub custom_prompt: String,
    #[serde(default)]
    pub indicators: serde_json::Value,
}

impl Default for AiStrategyConfig {
    fn default() -> Self {
        Self {
            symbols: vec![],
            timeframes: vec!["15m".to_string(), "1h".to_string(), "4h".to_string()],
            risk_controls: RiskControls::default(),
            trading_mode: TradingMode::default(),
            language: Language::default(),
            prompt_sections: PromptSections::default(),
            custom_prompt: String::new(),
            indicators: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StrategyKind {
    Ai(AiStrategyConfig),
    Quant(QuantConfig),
}

/// Reusable strategy template shared by many agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyTemplate {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    /// Primary symbol for quant strategies.
    pub symbol: Option<String>,
    pub kind: StrategyKind,
    pub runtime_state: serde_json::Value,
}

impl StrategyTemplate {
    pub fn strategy_type(&self) -> &'static str {
        match &self.kind {
            StrategyKind::Ai(_) => "ai",
            StrategyKind::Quant(q) => q.strategy_type(),
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        match &self.kind {
            StrategyKind::Ai(cfg) => cfg.symbols.clone(),
            StrategyKind::Quant(_) => self.symbol.iter().cloned().collect(),
        }
    }
}
