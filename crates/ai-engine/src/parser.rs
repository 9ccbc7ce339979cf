//! Tolerant parsing of model output into validated trading decisions.
//!
//! Models wrap JSON in prose, code fences, or CJK punctuation; the parser
//! tries progressively looser extraction strategies before giving up. The
//! in-memory form is strict: unknown actions and empty symbols are dropped.

use std::collections::HashMap;

use agent_core::{ActionType, DecisionResponse, RiskControls, TradingDecision};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,
    #[error("no parseable JSON found in response")]
    NoJson,
    #[error("JSON payload rejected: {0}")]
    InvalidJson(String),
}

pub struct DecisionParser {
    risk_controls: RiskControls,
    market_prices: HashMap<String, f64>,
    market_atrs: HashMap<String, f64>,
}

impl DecisionParser {
    pub fn new(risk_controls: RiskControls) -> Self {
        Self {
            risk_controls,
            market_prices: HashMap::new(),
            market_atrs: HashMap::new(),
        }
    }

    /// Inject latest per-symbol mid prices and ATRs so missing SL/TP on
    /// open decisions can be auto-filled.
    pub fn update_market_data(
        &mut self,
        prices: HashMap<String, f64>,
        atrs: HashMap<String, f64>,
    ) {
        self.market_prices = prices;
        self.market_atrs = atrs;
    }

    pub fn parse(&self, raw_response: &str) -> Result<DecisionResponse, ParseError> {
        if raw_response.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let cleaned = normalize_punctuation(raw_response);
        let value = self.extract_json(&cleaned).ok_or(ParseError::NoJson)?;

        let mut response = self.build_response(value);
        self.enforce_risk_controls(&mut response);
        Ok(response)
    }

    /// Extraction strategies, in order: the whole string, a fenced code
    /// block, a bare decisions array, and finally a brace-balanced object
    /// containing "chain_of_thought".
    fn extract_json(&self, text: &str) -> Option<Value> {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            return Some(value);
        }

        if let Some(block) = extract_fenced_block(text) {
            if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
                return Some(value);
            }
        }

        if let Some(array) = extract_balanced(text, '[', ']') {
            if let Ok(value @ Value::Array(_)) = serde_json::from_str::<Value>(&array) {
                // Wrap the bare array in a default envelope, keeping any
                // reasoning text that preceded it.
                return Some(serde_json::json!({
                    "chain_of_thought": text_before_json(text),
                    "market_assessment": "",
                    "decisions": value,
                    "overall_confidence": 50,
                    "next_review_minutes": 60,
                }));
            }
        }

        if text.contains("\"chain_of_thought\"") {
            if let Some(object) = extract_balanced(text, '{', '}') {
                if let Ok(value) = serde_json::from_str::<Value>(&object) {
                    return Some(value);
                }
            }
        }

        let preview: String = text.chars().take(200).collect();
        tracing::warn!(
            length = text.len(),
            preview = %preview,
            "failed to extract JSON from model response"
        );
        None
    }

    fn build_response(&self, data: Value) -> DecisionResponse {
        // A bare array is just the decisions list.
        let data = match data {
            Value::Array(items) => serde_json::json!({
                "chain_of_thought": "",
                "market_assessment": "",
                "decisions": items,
            }),
            other => other,
        };

        let raw_decisions = data
            .get("decisions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if raw_decisions.is_empty() {
            tracing::warn!("model returned an empty decisions array");
        }

        let mut decisions = Vec::new();
        for entry in &raw_decisions {
            match self.build_decision(entry) {
                Some(decision) => decisions.push(decision),
                None => {
                    tracing::warn!(raw = %entry, "skipping invalid decision");
                }
            }
        }
        if !raw_decisions.is_empty() && decisions.is_empty() {
            tracing::error!(
                total = raw_decisions.len(),
                "all decisions failed validation"
            );
        }

        DecisionResponse {
            chain_of_thought: str_field(&data, "chain_of_thought"),
            market_assessment: str_field(&data, "market_assessment"),
            decisions,
            overall_confidence: int_field(&data, "overall_confidence", 50),
            next_review_minutes: int_field(&data, "next_review_minutes", 60),
        }
    }

    fn build_decision(&self, entry: &Value) -> Option<TradingDecision> {
        let symbol = entry
            .get("symbol")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())?;
        let action = ActionType::parse(entry.get("action").and_then(Value::as_str).unwrap_or("hold"))?;

        Some(TradingDecision {
            symbol,
            action,
            leverage: (int_field(entry, "leverage", 1).max(1)) as u32,
            position_size_usd: float_field(entry, "position_size_usd", 0.0),
            entry_price: entry.get("entry_price").and_then(Value::as_f64),
            stop_loss: entry.get("stop_loss").and_then(Value::as_f64),
            take_profit: entry.get("take_profit").and_then(Value::as_f64),
            confidence: int_field(entry, "confidence", 50).clamp(0, 100),
            risk_usd: float_field(entry, "risk_usd", 0.0),
            reasoning: entry
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or("No reasoning provided")
                .to_string(),
        })
    }

    /// Enforce the hard limits in place: cap leverage, auto-fill missing
    /// SL/TP from ATR, and log (not reject) poor risk/reward setups.
    pub fn enforce_risk_controls(&self, response: &mut DecisionResponse) {
        let rc = &self.risk_controls;

        for decision in &mut response.decisions {
            if decision.leverage > rc.max_leverage {
                tracing::info!(
                    symbol = %decision.symbol,
                    requested = decision.leverage,
                    cap = rc.max_leverage,
                    "leverage capped"
                );
                decision.leverage = rc.max_leverage;
            }

            if decision.action.is_open() {
                self.autofill_sl_tp(decision);
            }

            if let (Some(sl), Some(tp), Some(entry)) =
                (decision.stop_loss, decision.take_profit, decision.reference_price(&self.market_prices))
            {
                let (risk, reward) = match decision.action {
                    ActionType::OpenLong => (entry - sl, tp - entry),
                    ActionType::OpenShort => (sl - entry, entry - tp),
                    _ => (0.0, 0.0),
                };
                if risk > 0.0 && reward / risk < rc.min_risk_reward_ratio {
                    tracing::warn!(
                        symbol = %decision.symbol,
                        ratio = reward / risk,
                        minimum = rc.min_risk_reward_ratio,
                        "risk/reward below configured minimum"
                    );
                }
            }
        }
    }

    fn autofill_sl_tp(&self, decision: &mut TradingDecision) {
        if decision.stop_loss.is_some() && decision.take_profit.is_some() {
            return;
        }
        let reference = match decision.reference_price(&self.market_prices) {
            Some(p) if p > 0.0 => p,
            _ => return,
        };
        let atr = match self.market_atrs.get(&decision.symbol) {
            Some(atr) if *atr > 0.0 => *atr,
            _ => return,
        };
        let rc = &self.risk_controls;
        let long = decision.action == ActionType::OpenLong;

        if decision.stop_loss.is_none() {
            let distance = (rc.default_sl_atr_multiplier * atr).min(rc.max_sl_percent * reference);
            let sl = if long { reference - distance } else { reference + distance };
            tracing::info!(symbol = %decision.symbol, sl, "auto-filled stop loss from ATR");
            decision.stop_loss = Some(sl);
        }
        if decision.take_profit.is_none() {
            let distance = rc.default_tp_atr_multiplier * atr;
            let tp = if long { reference + distance } else { reference - distance };
            tracing::info!(symbol = %decision.symbol, tp, "auto-filled take profit from ATR");
            decision.take_profit = Some(tp);
        }
    }

    /// Whether a decision should reach the execution stage.
    pub fn should_execute(&self, decision: &TradingDecision) -> (bool, String) {
        if decision.action.is_passive() {
            return (false, "Action is hold/wait".to_string());
        }
        if decision.confidence < self.risk_controls.min_confidence {
            return (
                false,
                format!(
                    "Confidence {}% below threshold {}%",
                    decision.confidence, self.risk_controls.min_confidence
                ),
            );
        }
        if decision.action.is_open() && decision.position_size_usd <= 0.0 {
            return (false, "Position size is zero".to_string());
        }
        (true, "Passed validation".to_string())
    }
}

trait ReferencePrice {
    fn reference_price(&self, prices: &HashMap<String, f64>) -> Option<f64>;
}

impl ReferencePrice for TradingDecision {
    fn reference_price(&self, prices: &HashMap<String, f64>) -> Option<f64> {
        self.entry_price.or_else(|| prices.get(&self.symbol).copied())
    }
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

fn int_field(data: &Value, key: &str, default: i64) -> i64 {
    match data.get(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

fn float_field(data: &Value, key: &str, default: f64) -> f64 {
    match data.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

/// Map CJK punctuation to its ASCII equivalent so JSON survives models that
/// localize quotes and brackets.
fn normalize_punctuation(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            '【' => '[',
            '】' => ']',
            '（' => '(',
            '）' => ')',
            '：' => ':',
            '，' => ',',
            other => other,
        })
        .collect()
}

/// Content of the first ``` fence (the `json` language tag is stripped).
fn extract_fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = if let Some(rest) = after_fence.strip_prefix("json") {
        rest
    } else {
        after_fence
    };
    let end = body_start.find("```")?;
    Some(&body_start[..end])
}

/// First balanced `open..close` span that starts at the first `open`.
fn extract_balanced(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn text_before_json(text: &str) -> String {
    let brace = text.find('{');
    let bracket = text.find('[');
    let json_start = match (brace, bracket) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return String::new(),
    };
    text[..json_start].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> DecisionParser {
        DecisionParser::new(RiskControls::default())
    }

    const FULL_RESPONSE: &str = r#"{
        "chain_of_thought": "Momentum is strong and funding is neutral.",
        "market_assessment": "Uptrend intact.",
        "decisions": [
            {
                "symbol": "btc",
                "action": "open_long",
                "leverage": 3,
                "position_size_usd": 500,
                "stop_loss": 95000,
                "take_profit": 112000,
                "confidence": 80,
                "reasoning": "Breakout with volume confirmation."
            }
        ],
        "overall_confidence": 75,
        "next_review_minutes": 30
    }"#;

    #[test]
    fn parses_plain_json() {
        let response = parser().parse(FULL_RESPONSE).unwrap();
        assert_eq!(response.decisions.len(), 1);
        assert_eq!(response.decisions[0].symbol, "BTC");
        assert_eq!(response.decisions[0].action, ActionType::OpenLong);
        assert_eq!(response.overall_confidence, 75);
    }

    #[test]
    fn parses_fenced_block_with_prose() {
        let wrapped = format!("Here is my analysis.\n```json\n{FULL_RESPONSE}\n```\nDone.");
        let response = parser().parse(&wrapped).unwrap();
        assert_eq!(response.decisions.len(), 1);
    }

    #[test]
    fn wraps_bare_decision_array() {
        let raw = r#"I would open a long here.
        [{"symbol": "ETH", "action": "open_long", "position_size_usd": 100,
          "confidence": 70, "reasoning": "Oversold bounce setup."}]"#;
        let response = parser().parse(raw).unwrap();
        assert_eq!(response.decisions.len(), 1);
        assert_eq!(response.decisions[0].symbol, "ETH");
        assert_eq!(response.overall_confidence, 50);
        assert!(response.chain_of_thought.contains("open a long"));
    }

    #[test]
    fn balances_braces_after_leading_text() {
        let raw = format!("Thinking out loud first. {FULL_RESPONSE} trailing words");
        let response = parser().parse(&raw).unwrap();
        assert_eq!(response.decisions.len(), 1);
    }

    #[test]
    fn normalizes_cjk_punctuation() {
        let raw = "{\"chain_of_thought\"：\"看涨\"，\"market_assessment\"：\"\"，\
                   \"decisions\"：[]，\"overall_confidence\"：60}";
        let response = parser().parse(raw).unwrap();
        assert_eq!(response.overall_confidence, 60);
        assert!(response.decisions.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parser().parse("   "), Err(ParseError::Empty)));
        assert!(matches!(
            parser().parse("no json anywhere"),
            Err(ParseError::NoJson)
        ));
    }

    #[test]
    fn drops_invalid_entries_keeps_valid() {
        let raw = r#"{
            "chain_of_thought": "x",
            "market_assessment": "",
            "decisions": [
                {"symbol": "BTC", "action": "teleport", "confidence": 90, "reasoning": "?"},
                {"action": "open_long", "confidence": 90, "reasoning": "missing symbol"},
                {"symbol": "SOL", "action": "hold", "confidence": 40, "reasoning": "waiting"}
            ]
        }"#;
        let response = parser().parse(raw).unwrap();
        assert_eq!(response.decisions.len(), 1);
        assert_eq!(response.decisions[0].symbol, "SOL");
    }

    #[test]
    fn leverage_capped_and_clamped() {
        let raw = r#"{
            "chain_of_thought": "x", "market_assessment": "",
            "decisions": [
                {"symbol": "BTC", "action": "open_long", "leverage": 20,
                 "position_size_usd": 100, "confidence": 90, "reasoning": "high conviction"},
                {"symbol": "ETH", "action": "hold", "leverage": 0,
                 "confidence": 50, "reasoning": "flat"}
            ]
        }"#;
        let response = parser().parse(raw).unwrap();
        // Capped at RiskControls::default().max_leverage == 5.
        assert_eq!(response.decisions[0].leverage, 5);
        // Clamped up to 1 for passive actions.
        assert_eq!(response.decisions[1].leverage, 1);
    }

    #[test]
    fn autofills_sl_tp_from_atr() {
        let mut p = parser();
        p.update_market_data(
            HashMap::from([("BTC".to_string(), 100_000.0)]),
            HashMap::from([("BTC".to_string(), 1000.0)]),
        );
        let raw = r#"{
            "chain_of_thought": "x", "market_assessment": "",
            "decisions": [
                {"symbol": "BTC", "action": "open_long", "position_size_usd": 100,
                 "confidence": 90, "reasoning": "setup looks clean"}
            ]
        }"#;
        let response = p.parse(raw).unwrap();
        let d = &response.decisions[0];
        // SL at 1.5 x ATR below, TP at 3 x ATR above the mid.
        assert_eq!(d.stop_loss, Some(100_000.0 - 1500.0));
        assert_eq!(d.take_profit, Some(100_000.0 + 3000.0));
    }

    #[test]
    fn autofill_caps_stop_distance() {
        let mut p = parser();
        // ATR so large that 1.5 x ATR would exceed the 10% cap.
        p.update_market_data(
            HashMap::from([("BTC".to_string(), 1000.0)]),
            HashMap::from([("BTC".to_string(), 500.0)]),
        );
        let raw = r#"{
            "chain_of_thought": "x", "market_assessment": "",
            "decisions": [
                {"symbol": "BTC", "action": "open_short", "position_size_usd": 100,
                 "confidence": 90, "reasoning": "distribution at range high"}
            ]
        }"#;
        let response = p.parse(raw).unwrap();
        // Short: SL above reference, distance capped at 10% of 1000.
        assert_eq!(response.decisions[0].stop_loss, Some(1100.0));
    }

    #[test]
    fn should_execute_filters() {
        let p = parser();
        let mut decision = TradingDecision {
            symbol: "BTC".to_string(),
            action: ActionType::Hold,
            leverage: 1,
            position_size_usd: 100.0,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            confidence: 90,
            risk_usd: 0.0,
            reasoning: "test".to_string(),
        };
        assert!(!p.should_execute(&decision).0);

        decision.action = ActionType::OpenLong;
        assert!(p.should_execute(&decision).0);

        decision.confidence = 30;
        let (ok, reason) = p.should_execute(&decision);
        assert!(!ok);
        assert!(reason.contains("below threshold"));

        decision.confidence = 90;
        decision.position_size_usd = 0.0;
        assert!(!p.should_execute(&decision).0);

        // Close actions don't need a size.
        decision.action = ActionType::CloseLong;
        assert!(p.should_execute(&decision).0);
    }
}
