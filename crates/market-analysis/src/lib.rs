//! Technical-analysis kit: latest-value indicator calculations over kline
//! series, plus the `MarketContext` snapshot the AI engine feeds into its
//! prompts.

pub mod context;
pub mod indicators;

pub use context::{IndicatorCalculator, IndicatorConfig, MarketContext, TechnicalIndicators};
pub use indicators::{atr, bollinger, ema, macd, rsi, sma, BollingerBands, MacdValue};
