use serde::{Deserialize, Serialize};

use crate::strategy::Language;

/// Closed set of trading actions an AI decision may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::OpenLong => "open_long",
            ActionType::OpenShort => "open_short",
            ActionType::CloseLong => "close_long",
            ActionType::CloseShort => "close_short",
            ActionType::Hold => "hold",
            ActionType::Wait => "wait",
        }
    }

    /// Tolerant parse: lowercases and accepts dash-separated variants.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().replace('-', "_").as_str() {
            "open_long" => Some(ActionType::OpenLong),
            "open_short" => Some(ActionType::OpenShort),
            "close_long" => Some(ActionType::CloseLong),
            "close_short" => Some(ActionType::CloseShort),
            "hold" => Some(ActionType::Hold),
            "wait" => Some(ActionType::Wait),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ActionType::OpenLong | ActionType::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, ActionType::CloseLong | ActionType::CloseShort)
    }

    pub fn is_passive(&self) -> bool {
        matches!(self, ActionType::Hold | ActionType::Wait)
    }
}

fn default_max_leverage() -> u32 {
    5
}
fn default_max_position_ratio() -> f64 {
    0.2
}
fn default_max_total_exposure() -> f64 {
    0.8
}
fn default_min_risk_reward_ratio() -> f64 {
    2.0
}
fn default_max_drawdown_percent() -> f64 {
    0.1
}
fn default_min_confidence() -> i64 {
    60
}
fn default_sl_atr_multiplier() -> f64 {
    1.5
}
fn default_tp_atr_multiplier() -> f64 {
    3.0
}
fn default_max_sl_percent() -> f64 {
    0.10
}

/// Hard risk limits enforced by code, regardless of what the model suggests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskControls {
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    /// Max margin per position as a ratio of effective equity.
    #[serde(default = "default_max_position_ratio")]
    pub max_position_ratio: f64,
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,
    #[serde(default = "default_min_risk_reward_ratio")]
    pub min_risk_reward_ratio: f64,
    #[serde(default = "default_max_drawdown_percent")]
    pub max_drawdown_percent: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: i64,
    #[serde(default = "default_sl_atr_multiplier")]
    pub default_sl_atr_multiplier: f64,
    #[serde(default = "default_tp_atr_multiplier")]
    pub default_tp_atr_multiplier: f64,
    /// Hard cap on the stop-loss distance as a fraction of entry price.
    #[serde(default = "default_max_sl_percent")]
    pub max_sl_percent: f64,
}

impl Default for RiskControls {
    fn default() -> Self {
        Self {
            max_leverage: default_max_leverage(),
            max_position_ratio: default_max_position_ratio(),
            max_total_exposure: default_max_total_exposure(),
            min_risk_reward_ratio: default_min_risk_reward_ratio(),
            max_drawdown_percent: default_max_drawdown_percent(),
            min_confidence: default_min_confidence(),
            default_sl_atr_multiplier: default_sl_atr_multiplier(),
            default_tp_atr_multiplier: default_tp_atr_multiplier(),
            max_sl_percent: default_max_sl_percent(),
        }
    }
}

/// One action the model wants to take on one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingDecision {
    pub symbol: String,
    pub action: ActionType,
    pub leverage: u32,
    /// Notional value in USD (= margin x leverage).
    pub position_size_usd: f64,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// 0-100
    pub confidence: i64,
    pub risk_usd: f64,
    pub reasoning: String,
}

/// Complete parsed model output for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub chain_of_thought: String,
    pub market_assessment: String,
    pub decisions: Vec<TradingDecision>,
    pub overall_confidence: i64,
    pub next_review_minutes: i64,
}

impl DecisionResponse {
    pub fn empty(chain_of_thought: impl Into<String>) -> Self {
        Self {
            chain_of_thought: chain_of_thought.into(),
            market_assessment: String::new(),
            decisions: vec![],
            overall_confidence: 0,
            next_review_minutes: 60,
        }
    }
}

const DECISION_JSON_SCHEMA_EN: &str = r#"{
  "chain_of_thought": "string - Your detailed reasoning process",
  "market_assessment": "string - Overall market condition summary",
  "decisions": [
    {
      "symbol": "string - Trading pair symbol (e.g., 'BTC')",
      "action": "string - One of: open_long, open_short, close_long, close_short, hold, wait",
      "leverage": "integer - Leverage multiplier (1-50)",
      "position_size_usd": "number - Notional position value in USD (= margin x leverage)",
      "entry_price": "number | null - Entry price for limit orders",
      "stop_loss": "number - Stop loss price (REQUIRED for open_long/open_short)",
      "take_profit": "number - Take profit price (REQUIRED for open_long/open_short)",
      "confidence": "integer - Confidence score 0-100",
      "risk_usd": "number - Estimated max risk in USD",
      "reasoning": "string - Reasoning for this specific decision"
    }
  ],
  "overall_confidence": "integer - Overall market confidence 0-100",
  "next_review_minutes": "integer - Suggested time until next review (5-1440)"
}"#;

const DECISION_JSON_SCHEMA_ZH: &str = r#"{
  "chain_of_thought": "string - 你的详细推理分析过程（必须使用中文）",
  "market_assessment": "string - 整体市场状况评估总结（必须使用中文）",
  "decisions": [
    {
      "symbol": "string - 交易对符号（如 'BTC'）",
      "action": "string - 以下之一: open_long, open_short, close_long, close_short, hold, wait",
      "leverage": "integer - 杠杆倍数 (1-50)",
      "position_size_usd": "number - 仓位名义价值（美元）（= 保证金 × 杠杆）",
      "entry_price": "number | null - 限价单入场价格",
      "stop_loss": "number - 止损价格（open_long/open_short 时必填）",
      "take_profit": "number - 止盈价格（open_long/open_short 时必填）",
      "confidence": "integer - 置信度评分 0-100",
      "risk_usd": "number - 预估最大风险（美元）",
      "reasoning": "string - 该决策的具体推理依据（必须使用中文）"
    }
  ],
  "overall_confidence": "integer - 整体市场置信度 0-100",
  "next_review_minutes": "integer - 建议下次复查时间（5-1440 分钟）"
}"#;

/// JSON output schema embedded in the system prompt.
pub fn decision_json_schema(language: Language) -> &'static str {
    match language {
        Language::Zh => DECISION_JSON_SCHEMA_ZH,
        Language::En => DECISION_JSON_SCHEMA_EN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_parse_is_tolerant() {
        assert_eq!(ActionType::parse("OPEN_LONG"), Some(ActionType::OpenLong));
        assert_eq!(ActionType::parse("open-short"), Some(ActionType::OpenShort));
        assert_eq!(ActionType::parse("Hold"), Some(ActionType::Hold));
        assert_eq!(ActionType::parse("buy"), None);
    }

    #[test]
    fn risk_control_defaults() {
        let rc = RiskControls::default();
        assert_eq!(rc.max_leverage, 5);
        assert_eq!(rc.min_confidence, 60);
        assert!((rc.max_position_ratio - 0.2).abs() < f64::EPSILON);
    }
}
