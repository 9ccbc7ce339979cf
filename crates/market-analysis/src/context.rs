use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;
use trader_trait::{FundingRate, Kline, MarketData};

use crate::indicators;

/// Indicator parameters; defaults match the strategy templates shipped with
/// the product (EMA 9/21/55, SMA 20, RSI 14, MACD 12/26/9, ATR 14,
/// Bollinger 20/2.0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub ema_periods: Vec<usize>,
    pub sma_periods: Vec<usize>,
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub atr_period: usize,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema_periods: vec![9, 21, 55],
            sma_periods: vec![20],
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            atr_period: 14,
            bollinger_period: 20,
            bollinger_std: 2.0,
        }
    }
}

/// Latest indicator values for one symbol/timeframe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TechnicalIndicators {
    pub ema: BTreeMap<usize, f64>,
    pub sma: BTreeMap<usize, f64>,
    pub rsi: Option<f64>,
    pub macd: f64,
    pub macd_signal_line: f64,
    pub macd_histogram: f64,
    pub atr: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_middle: Option<f64>,
    pub bollinger_lower: Option<f64>,
    pub volume_sma: Option<f64>,
}

impl TechnicalIndicators {
    /// "bullish" / "bearish" / "neutral" from EMA ordering (fast vs slow).
    pub fn ema_trend(&self) -> &'static str {
        let values: Vec<f64> = self.ema.values().copied().collect();
        if values.len() < 2 {
            return "neutral";
        }
        let fast = values[0];
        let slow = values[values.len() - 1];
        if fast > slow {
            "bullish"
        } else if fast < slow {
            "bearish"
        } else {
            "neutral"
        }
    }

    pub fn rsi_signal(&self) -> &'static str {
        match self.rsi {
            Some(v) if v >= 70.0 => "overbought",
            Some(v) if v <= 30.0 => "oversold",
            Some(_) => "neutral",
            None => "neutral",
        }
    }

    pub fn macd_signal(&self) -> &'static str {
        if self.macd_histogram > 0.0 {
            "bullish"
        } else if self.macd_histogram < 0.0 {
            "bearish"
        } else {
            "neutral"
        }
    }
}

pub struct IndicatorCalculator {
    config: IndicatorConfig,
}

impl IndicatorCalculator {
    pub fn new(config: IndicatorConfig) -> Self {
        Self { config }
    }

    pub fn calculate(&self, klines: &[Kline]) -> TechnicalIndicators {
        if klines.is_empty() {
            return TechnicalIndicators::default();
        }
        let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();
        let highs: Vec<f64> = klines.iter().map(|k| k.high).collect();
        let lows: Vec<f64> = klines.iter().map(|k| k.low).collect();
        let volumes: Vec<f64> = klines.iter().map(|k| k.volume).collect();
        let cfg = &self.config;

        let mut ema = BTreeMap::new();
        for &period in &cfg.ema_periods {
            if let Some(v) = indicators::ema(&closes, period) {
                ema.insert(period, v);
            }
        }
        let mut sma = BTreeMap::new();
        for &period in &cfg.sma_periods {
            if let Some(v) = indicators::sma(&closes, period) {
                sma.insert(period, v);
            }
        }

        let macd = indicators::macd(&closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal)
            .unwrap_or_default();
        let bollinger =
            indicators::bollinger(&closes, cfg.bollinger_period, cfg.bollinger_std);

        TechnicalIndicators {
            ema,
            sma,
            rsi: indicators::rsi(&closes, cfg.rsi_period),
            macd: macd.macd,
            macd_signal_line: macd.signal,
            macd_histogram: macd.histogram,
            atr: indicators::atr(&highs, &lows, &closes, cfg.atr_period),
            bollinger_upper: bollinger.map(|b| b.upper),
            bollinger_middle: bollinger.map(|b| b.middle),
            bollinger_lower: bollinger.map(|b| b.lower),
            volume_sma: indicators::sma(&volumes, cfg.bollinger_period),
        }
    }
}

impl Default for IndicatorCalculator {
    fn default() -> Self {
        Self::new(IndicatorConfig::default())
    }
}

/// Everything the AI engine knows about one symbol at cycle start.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub symbol: String,
    pub current: MarketData,
    /// Klines per timeframe, oldest first.
    pub klines: HashMap<String, Vec<Kline>>,
    /// Indicators per timeframe.
    pub indicators: HashMap<String, TechnicalIndicators>,
    pub funding_history: Vec<FundingRate>,
}

impl MarketContext {
    pub fn basic(symbol: impl Into<String>, current: MarketData) -> Self {
        Self {
            symbol: symbol.into(),
            current,
            klines: HashMap::new(),
            indicators: HashMap::new(),
            funding_history: Vec::new(),
        }
    }

    /// Mean funding rate over the most recent 24 entries.
    pub fn avg_funding_rate_24h(&self) -> Option<f64> {
        if self.funding_history.is_empty() {
            return None;
        }
        let window: Vec<f64> = self
            .funding_history
            .iter()
            .take(24)
            .map(|f| f.rate)
            .collect();
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }

    /// ATR for SL/TP auto-fill: prefer 1h, fall back to any timeframe.
    pub fn preferred_atr(&self) -> Option<f64> {
        for tf in ["1h", "4h", "15m", "30m", "1d"] {
            if let Some(atr) = self.indicators.get(tf).and_then(|i| i.atr) {
                return Some(atr);
            }
        }
        self.indicators.values().find_map(|i| i.atr)
    }

    /// Serializable snapshot for decision records; klines capped per
    /// timeframe to keep rows bounded.
    pub fn to_snapshot(&self, kline_limit: usize) -> serde_json::Value {
        let klines: HashMap<&String, Vec<serde_json::Value>> = self
            .klines
            .iter()
            .map(|(tf, series)| {
                let start = series.len().saturating_sub(kline_limit);
                let rows = series[start..]
                    .iter()
                    .map(|k| {
                        json!({
                            "ts": k.timestamp.to_rfc3339(),
                            "o": k.open,
                            "h": k.high,
                            "l": k.low,
                            "c": k.close,
                            "v": k.volume,
                        })
                    })
                    .collect();
                (tf, rows)
            })
            .collect();

        json!({
            "symbol": self.symbol,
            "mid_price": self.current.mid_price,
            "bid_price": self.current.bid_price,
            "ask_price": self.current.ask_price,
            "volume_24h": self.current.volume_24h,
            "funding_rate": self.current.funding_rate,
            "indicators": self.indicators,
            "klines": klines,
            "avg_funding_rate_24h": self.avg_funding_rate_24h(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn kline(close: f64) -> Kline {
        Kline {
            timestamp: Utc::now(),
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn calculator_produces_configured_indicators() {
        let klines: Vec<Kline> = (0..100).map(|i| kline(100.0 + i as f64 * 0.1)).collect();
        let ind = IndicatorCalculator::default().calculate(&klines);

        assert_eq!(ind.ema.len(), 3);
        assert!(ind.rsi.is_some());
        assert!(ind.atr.is_some());
        assert!(ind.bollinger_middle.is_some());
        assert_eq!(ind.ema_trend(), "bullish");
    }

    #[test]
    fn preferred_atr_falls_back_across_timeframes() {
        let mut ctx = MarketContext::basic(
            "BTC",
            MarketData {
                symbol: "BTC".to_string(),
                mid_price: 100.0,
                bid_price: 99.9,
                ask_price: 100.1,
                volume_24h: 0.0,
                funding_rate: None,
                timestamp: Utc::now(),
            },
        );
        assert_eq!(ctx.preferred_atr(), None);

        let mut ind = TechnicalIndicators::default();
        ind.atr = Some(2.5);
        ctx.indicators.insert("4h".to_string(), ind.clone());
        assert_eq!(ctx.preferred_atr(), Some(2.5));

        let mut one_hour = TechnicalIndicators::default();
        one_hour.atr = Some(1.5);
        ctx.indicators.insert("1h".to_string(), one_hour);
        assert_eq!(ctx.preferred_atr(), Some(1.5));
    }
}
