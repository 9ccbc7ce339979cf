//! Prompt construction.
//!
//! The system prompt carries eight numbered sections (role, trading mode,
//! hard constraints, frequency, entry standards, decision process, output
//! format, custom instructions). The user prompt renders the account,
//! positions, per-symbol market analysis and recent trades. Both render in
//! the strategy's language (en/zh).

use agent_core::{decision_json_schema, AiStrategyConfig, Language, RiskControls, TradingMode};
use chrono::Utc;
use market_analysis::{MarketContext, TechnicalIndicators};
use trader_trait::AccountState;

pub struct PromptBuilder {
    config: AiStrategyConfig,
    risk_controls: RiskControls,
    max_positions: usize,
}

struct SystemText {
    default_role: &'static str,
    mode_aggressive: &'static str,
    mode_balanced: &'static str,
    mode_conservative: &'static str,
    default_frequency: &'static str,
    default_entry: &'static str,
    default_process: &'static str,
    output_intro: &'static str,
    output_rules: &'static str,
    custom_note: &'static str,
}

const SYSTEM_EN: SystemText = SystemText {
    default_role: "You are a disciplined crypto perpetual-futures trading analyst. You manage \
        a sub-account on behalf of one strategy and make decisions only for its watchlist.",
    mode_aggressive: "Aggressive: prioritize opportunity capture; accept higher volatility and \
        drawdown for higher expected return.",
    mode_balanced: "Balanced: weigh opportunity against capital preservation evenly.",
    mode_conservative: "Conservative: prioritize capital preservation; trade only high-conviction \
        setups and prefer waiting over marginal entries.",
    default_frequency: "You are invoked on a fixed schedule. Do not force trades every cycle; \
        most cycles should conclude with hold or wait.",
    default_entry: "Enter only when multiple independent signals align (trend, momentum, \
        funding, volatility). Every open must carry a stop loss and a take profit.",
    default_process: "Work step by step: assess the market regime, evaluate each symbol, check \
        existing positions, then decide. Think before you output.",
    output_intro: "Respond with a single JSON object matching this schema exactly:",
    output_rules: "- Output ONLY the JSON object, no surrounding prose\n\
        - Use only actions from the schema's enumeration\n\
        - position_size_usd is notional (margin x leverage)\n\
        - stop_loss and take_profit are REQUIRED for open actions\n\
        - Decisions below the minimum confidence will not be executed",
    custom_note: "Additional operator instructions (they must never override the hard \
        constraints above):",
};

const SYSTEM_ZH: SystemText = SystemText {
    default_role: "你是一名严谨的加密货币永续合约交易分析师，代表单一策略管理子账户，只对其关注列表做出决策。",
    mode_aggressive: "激进模式：优先捕捉机会，为更高的预期收益接受更大的波动和回撤。",
    mode_balanced: "平衡模式：在机会与资本保全之间均衡权衡。",
    mode_conservative: "保守模式：优先保全资本，只交易高确信度机会，宁可等待也不勉强入场。",
    default_frequency: "你按固定周期被调用。不要每个周期都强行交易；大多数周期应以 hold 或 wait 结束。",
    default_entry: "只有当趋势、动量、资金费率、波动率等多个独立信号共振时才入场。每次开仓必须带止损和止盈。",
    default_process: "按步骤工作：评估市场状态，逐一分析标的，检查现有仓位，然后决策。先思考再输出。",
    output_intro: "请输出且仅输出一个符合以下结构的 JSON 对象：",
    output_rules: "- 只输出 JSON 对象，不要附加任何文字\n\
        - action 只能使用结构中列出的枚举值\n\
        - position_size_usd 为名义价值（保证金 × 杠杆）\n\
        - open 操作必须给出 stop_loss 和 take_profit\n\
        - 低于最低置信度的决策不会被执行",
    custom_note: "操作者的附加指令（不得覆盖上方的硬性约束）：",
};

impl PromptBuilder {
    pub fn new(config: AiStrategyConfig, max_positions: usize) -> Self {
        let risk_controls = config.risk_controls.clone();
        Self {
            config,
            risk_controls,
            max_positions,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.config.symbols
    }

    fn text(&self) -> &'static SystemText {
        match self.config.language {
            Language::Zh => &SYSTEM_ZH,
            Language::En => &SYSTEM_EN,
        }
    }

    pub fn build_system_prompt(&self) -> String {
        let t = self.text();
        let ps = &self.config.prompt_sections;
        let rc = &self.risk_controls;
        let zh = self.config.language == Language::Zh;

        let role = if ps.role_definition.is_empty() {
            t.default_role
        } else {
            ps.role_definition.as_str()
        };
        let mode = match self.config.trading_mode {
            TradingMode::Aggressive => t.mode_aggressive,
            TradingMode::Balanced => t.mode_balanced,
            TradingMode::Conservative => t.mode_conservative,
        };
        let frequency = if ps.trading_frequency.is_empty() {
            t.default_frequency
        } else {
            ps.trading_frequency.as_str()
        };
        let entry = if ps.entry_standards.is_empty() {
            t.default_entry
        } else {
            ps.entry_standards.as_str()
        };
        let process = if ps.decision_process.is_empty() {
            t.default_process
        } else {
            ps.decision_process.as_str()
        };

        let constraints = if zh {
            format!(
                "以下限制由代码强制执行，违反的决策会被拒绝或削减：\n\
                 - 最大并发仓位数: {}\n\
                 - 最大杠杆: {}x\n\
                 - 单仓最大保证金占比: {:.0}%\n\
                 - 最大总敞口: {:.0}%\n\
                 - 最低盈亏比: 1:{}\n\
                 - 最大回撤: {:.0}%\n\
                 - 最低执行置信度: {}%",
                self.max_positions,
                rc.max_leverage,
                rc.max_position_ratio * 100.0,
                rc.max_total_exposure * 100.0,
                rc.min_risk_reward_ratio,
                rc.max_drawdown_percent * 100.0,
                rc.min_confidence
            )
        } else {
            format!(
                "These limits are enforced by code; violating decisions are rejected or \
                 trimmed:\n\
                 - Max concurrent positions: {}\n\
                 - Max leverage: {}x\n\
                 - Max margin per position: {:.0}% of equity\n\
                 - Max total exposure: {:.0}% of equity\n\
                 - Min risk/reward ratio: 1:{}\n\
                 - Max drawdown: {:.0}%\n\
                 - Min confidence to execute: {}%",
                self.max_positions,
                rc.max_leverage,
                rc.max_position_ratio * 100.0,
                rc.max_total_exposure * 100.0,
                rc.min_risk_reward_ratio,
                rc.max_drawdown_percent * 100.0,
                rc.min_confidence
            )
        };

        let header = |n: u32, en: &str, zh_title: &str| {
            if zh {
                format!("## {n}. {zh_title}")
            } else {
                format!("## {n}. {en}")
            }
        };

        let mut sections = vec![
            format!("{}\n{role}", header(1, "Role", "角色定位")),
            format!("{}\n{mode}", header(2, "Trading Mode", "交易模式")),
            format!("{}\n{constraints}", header(3, "Hard Constraints", "硬性风控约束")),
            format!("{}\n{frequency}", header(4, "Trading Frequency", "交易频率")),
            format!("{}\n{entry}", header(5, "Entry Standards", "入场标准")),
            format!("{}\n{process}", header(6, "Decision Process", "决策流程")),
            format!(
                "{}\n{}\n```json\n{}\n```\n{}",
                header(7, "Output Format", "输出格式"),
                t.output_intro,
                decision_json_schema(self.config.language),
                t.output_rules
            ),
        ];
        if !self.config.custom_prompt.is_empty() {
            sections.push(format!(
                "{}\n{}\n\n{}",
                header(8, "Additional Instructions", "附加指令"),
                t.custom_note,
                self.config.custom_prompt
            ));
        }
        sections.join("\n\n")
    }

    pub fn build_user_prompt(
        &self,
        account: &AccountState,
        contexts: &[MarketContext],
        recent_trades: &[String],
    ) -> String {
        let zh = self.config.language == Language::Zh;
        let mut sections = Vec::new();

        sections.push(format!(
            "{}\nTimestamp: {} UTC",
            if zh { "# 交易决策请求" } else { "# Trading Decision Request" },
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        ));

        sections.push(self.format_account(account, zh));
        sections.push(self.format_positions(account, zh));

        if !contexts.is_empty() {
            let title = if zh { "## 市场分析" } else { "## Market Analysis" };
            let mut lines = vec![title.to_string()];
            for ctx in contexts {
                lines.push(self.format_context(ctx));
            }
            sections.push(lines.join("\n\n"));
        }

        if !recent_trades.is_empty() {
            let title = if zh { "## 近期成交" } else { "## Recent Trades" };
            let mut lines = vec![title.to_string()];
            for trade in recent_trades.iter().take(10) {
                lines.push(format!("- {trade}"));
            }
            sections.push(lines.join("\n"));
        }

        sections.push(
            if zh {
                "请基于以上信息给出本周期的交易决策，严格按输出格式返回 JSON。"
            } else {
                "Based on the information above, produce this cycle's trading decisions as JSON \
                 in the required output format."
            }
            .to_string(),
        );

        sections.join("\n\n")
    }

    fn format_account(&self, account: &AccountState, zh: bool) -> String {
        if zh {
            format!(
                "## 账户状态\n\
                 - 总权益: ${:.2}\n\
                 - 可用余额: ${:.2}\n\
                 - 已用保证金: ${:.2} ({:.1}%)\n\
                 - 未实现盈亏: ${:+.2}\n\
                 - 持仓数量: {}",
                account.equity,
                account.available_balance,
                account.total_margin_used,
                account.margin_usage_percent(),
                account.unrealized_pnl,
                account.position_count()
            )
        } else {
            format!(
                "## Account Status\n\
                 - Total equity: ${:.2}\n\
                 - Available balance: ${:.2}\n\
                 - Margin used: ${:.2} ({:.1}%)\n\
                 - Unrealized PnL: ${:+.2}\n\
                 - Open positions: {}",
                account.equity,
                account.available_balance,
                account.total_margin_used,
                account.margin_usage_percent(),
                account.unrealized_pnl,
                account.position_count()
            )
        }
    }

    fn format_positions(&self, account: &AccountState, zh: bool) -> String {
        let title = if zh { "## 当前持仓" } else { "## Current Positions" };
        if account.positions.is_empty() {
            let none = if zh { "（无持仓）" } else { "(none)" };
            return format!("{title}\n{none}");
        }
        let mut lines = vec![title.to_string()];
        for pos in &account.positions {
            lines.push(format!(
                "### {} ({})\n\
                 - size: {:.4} (${:.2})\n\
                 - entry: ${:.2} | mark: ${:.2}\n\
                 - leverage: {}x\n\
                 - unrealized: ${:+.2} ({:+.2}%)",
                pos.symbol,
                pos.side.as_str().to_uppercase(),
                pos.size,
                pos.size_usd,
                pos.entry_price,
                pos.mark_price,
                pos.leverage,
                pos.unrealized_pnl,
                pos.unrealized_pnl_percent,
            ));
        }
        lines.join("\n")
    }

    fn format_context(&self, ctx: &MarketContext) -> String {
        let current = &ctx.current;
        let spread_pct = if current.mid_price > 0.0 {
            (current.ask_price - current.bid_price) / current.mid_price * 100.0
        } else {
            0.0
        };
        let funding = current
            .funding_rate
            .map(|f| format!("{:.4}%", f * 100.0))
            .unwrap_or_else(|| "N/A".to_string());

        let mut lines = vec![format!("### {}", ctx.symbol)];
        lines.push(format!("**Price:** ${:.2}", current.mid_price));
        lines.push(format!(
            "- bid: ${:.2} | ask: ${:.2} | spread: {spread_pct:.3}%",
            current.bid_price, current.ask_price
        ));
        lines.push(format!("- 24h volume: ${:.0}", current.volume_24h));
        lines.push(format!("- funding rate: {funding}"));
        if let Some(avg) = ctx.avg_funding_rate_24h() {
            let bias = if avg > 0.0 {
                "longs paying"
            } else if avg < 0.0 {
                "shorts paying"
            } else {
                "neutral"
            };
            lines.push(format!("- avg funding 24h: {:.4}% ({bias})", avg * 100.0));
        }

        let mut timeframes: Vec<&String> = ctx.indicators.keys().collect();
        timeframes.sort_by_key(|tf| timeframe_rank(tf));
        for tf in timeframes {
            let ind = &ctx.indicators[tf];
            lines.push(format!("\n**{} indicators:**", tf.to_uppercase()));
            lines.push(format_indicators(ind));
        }

        if let Some((tf, klines)) = primary_klines(ctx) {
            lines.push(format!("\n**Recent candles ({tf}):**"));
            for k in klines.iter().rev().take(5).rev() {
                lines.push(format!(
                    "- {}: {:+.2}% (O:{:.2} H:{:.2} L:{:.2} C:{:.2})",
                    k.timestamp.format("%m-%d %H:%M"),
                    k.change_percent(),
                    k.open,
                    k.high,
                    k.low,
                    k.close
                ));
            }
        }

        lines.join("\n")
    }
}

fn format_indicators(ind: &TechnicalIndicators) -> String {
    let mut lines = Vec::new();
    if !ind.ema.is_empty() {
        let parts: Vec<String> = ind
            .ema
            .iter()
            .map(|(period, value)| format!("{period}={value:.2}"))
            .collect();
        lines.push(format!("- EMA: {} ({})", parts.join(", "), ind.ema_trend()));
    }
    if !ind.sma.is_empty() {
        let parts: Vec<String> = ind
            .sma
            .iter()
            .map(|(period, value)| format!("{period}={value:.2}"))
            .collect();
        lines.push(format!("- SMA: {}", parts.join(", ")));
    }
    if let Some(rsi) = ind.rsi {
        lines.push(format!("- RSI: {rsi:.1} ({})", ind.rsi_signal()));
    }
    if ind.macd_histogram != 0.0 {
        lines.push(format!(
            "- MACD: {:.4}, Signal: {:.4}, Histogram: {:+.4} ({})",
            ind.macd,
            ind.macd_signal_line,
            ind.macd_histogram,
            ind.macd_signal()
        ));
    }
    if let Some(atr) = ind.atr {
        lines.push(format!("- ATR: {atr:.2}"));
    }
    if let (Some(upper), Some(middle), Some(lower)) =
        (ind.bollinger_upper, ind.bollinger_middle, ind.bollinger_lower)
    {
        lines.push(format!(
            "- Bollinger: Upper={upper:.2}, Middle={middle:.2}, Lower={lower:.2}"
        ));
    }
    if lines.is_empty() {
        "- (insufficient data)".to_string()
    } else {
        lines.join("\n")
    }
}

fn timeframe_rank(tf: &str) -> u32 {
    match tf {
        "1m" => 1,
        "5m" => 2,
        "15m" => 3,
        "30m" => 4,
        "1h" => 5,
        "4h" => 6,
        "1d" => 7,
        _ => 99,
    }
}

fn primary_klines(ctx: &MarketContext) -> Option<(&str, &Vec<trader_trait::Kline>)> {
    for preferred in ["1h", "15m"] {
        if let Some(klines) = ctx.klines.get(preferred) {
            if !klines.is_empty() {
                return Some((preferred, klines));
            }
        }
    }
    ctx.klines
        .iter()
        .find(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.as_str(), v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trader_trait::MarketData;

    fn config_with_symbols() -> AiStrategyConfig {
        let mut config = AiStrategyConfig::default();
        config.symbols = vec!["BTC".to_string(), "ETH".to_string()];
        config
    }

    #[test]
    fn system_prompt_has_numbered_sections_and_schema() {
        let builder = PromptBuilder::new(config_with_symbols(), 3);
        let prompt = builder.build_system_prompt();
        for n in 1..=7 {
            assert!(prompt.contains(&format!("## {n}. ")), "missing section {n}");
        }
        assert!(prompt.contains("chain_of_thought"));
        assert!(prompt.contains("Max leverage: 5x"));
        // No custom prompt: section 8 absent.
        assert!(!prompt.contains("## 8."));
    }

    #[test]
    fn custom_prompt_appends_section_eight() {
        let mut config = config_with_symbols();
        config.custom_prompt = "Never trade on Sundays.".to_string();
        let builder = PromptBuilder::new(config, 3);
        let prompt = builder.build_system_prompt();
        assert!(prompt.contains("## 8."));
        assert!(prompt.contains("Never trade on Sundays."));
    }

    #[test]
    fn chinese_prompt_renders_chinese_headers() {
        let mut config = config_with_symbols();
        config.language = Language::Zh;
        let builder = PromptBuilder::new(config, 3);
        let prompt = builder.build_system_prompt();
        assert!(prompt.contains("角色定位"));
        assert!(prompt.contains("必须使用中文"));
    }

    #[test]
    fn user_prompt_includes_account_and_markets() {
        let builder = PromptBuilder::new(config_with_symbols(), 3);
        let account = AccountState {
            equity: 1000.0,
            available_balance: 900.0,
            total_margin_used: 100.0,
            unrealized_pnl: 5.0,
            positions: vec![],
        };
        let ctx = MarketContext::basic(
            "BTC",
            MarketData {
                symbol: "BTC".to_string(),
                mid_price: 50_000.0,
                bid_price: 49_990.0,
                ask_price: 50_010.0,
                volume_24h: 1_000_000.0,
                funding_rate: Some(0.0001),
                timestamp: Utc::now(),
            },
        );
        let prompt = builder.build_user_prompt(&account, &[ctx], &[]);
        assert!(prompt.contains("Total equity: $1000.00"));
        assert!(prompt.contains("### BTC"));
        assert!(prompt.contains("funding rate: 0.0100%"));
        assert!(prompt.contains("(none)"));
    }
}
