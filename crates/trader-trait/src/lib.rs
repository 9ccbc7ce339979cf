//! Venue capability: the `Trader` trait and its market/order types.
//!
//! Every exchange adapter implements [`Trader`]; the engines only ever see
//! this interface. The crate also ships [`MockTrader`], an in-memory
//! simulator with fees and slippage used for mock-mode agents and tests.

pub mod mock;
pub mod types;

pub use mock::MockTrader;
pub use types::{
    AccountState, FundingRate, MarketData, OrderResult, OrderSide, Position, PositionSide, Kline,
    TradeError,
};

use async_trait::async_trait;

/// Uniform interface to a trading venue.
///
/// All methods may fail with [`TradeError`]. Adapters own their connection
/// state; a trader is owned by exactly one worker at a time.
#[async_trait]
pub trait Trader: Send + Sync {
    /// Venue name for logging (e.g. "hyperliquid", "mock").
    fn exchange_name(&self) -> &str;

    async fn initialize(&self) -> Result<(), TradeError>;
    async fn close(&self) -> Result<(), TradeError>;

    // -- Account ------------------------------------------------------------
    async fn get_account_state(&self) -> Result<AccountState, TradeError>;
    async fn get_positions(&self) -> Result<Vec<Position>, TradeError>;
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, TradeError>;

    // -- Market data --------------------------------------------------------
    async fn get_market_price(&self, symbol: &str) -> Result<f64, TradeError>;
    async fn get_market_data(&self, symbol: &str) -> Result<MarketData, TradeError>;

    /// K-line data, oldest first. Default: unsupported, empty.
    async fn get_klines(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _limit: usize,
    ) -> Result<Vec<Kline>, TradeError> {
        Ok(vec![])
    }

    /// Funding-rate history, most recent first. Default: unsupported, empty.
    async fn get_funding_history(
        &self,
        _symbol: &str,
        _limit: usize,
    ) -> Result<Vec<FundingRate>, TradeError> {
        Ok(vec![])
    }

    // -- Orders -------------------------------------------------------------
    #[allow(clippy::too_many_arguments)]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        leverage: u32,
        reduce_only: bool,
        slippage: Option<f64>,
        price: Option<f64>,
    ) -> Result<OrderResult, TradeError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        price: f64,
        leverage: u32,
        reduce_only: bool,
    ) -> Result<OrderResult, TradeError>;

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        trigger_price: f64,
    ) -> Result<OrderResult, TradeError>;

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        trigger_price: f64,
    ) -> Result<OrderResult, TradeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool, TradeError>;
    async fn cancel_all_orders(&self, symbol: Option<&str>) -> Result<usize, TradeError>;

    // -- Positions ----------------------------------------------------------
    async fn close_position(
        &self,
        symbol: &str,
        size: Option<f64>,
        slippage: Option<f64>,
    ) -> Result<OrderResult, TradeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), TradeError>;

    // -- Convenience --------------------------------------------------------

    /// Open a long position sized in USD, with optional SL/TP.
    ///
    /// SL/TP placement failures never fail the entry order. SL/TP values
    /// inconsistent with the actual fill are adjusted: SL moves inside the
    /// liquidation band (`max_loss_pct = 0.5 / leverage`), TP is re-derived
    /// at a 1:1.5 risk/reward.
    async fn open_long(
        &self,
        symbol: &str,
        size_usd: f64,
        leverage: u32,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<OrderResult, TradeError> {
        open_directional(self, symbol, size_usd, leverage, stop_loss, take_profit, true).await
    }

    /// Open a short position sized in USD, with optional SL/TP.
    async fn open_short(
        &self,
        symbol: &str,
        size_usd: f64,
        leverage: u32,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<OrderResult, TradeError> {
        open_directional(self, symbol, size_usd, leverage, stop_loss, take_profit, false).await
    }
}

async fn open_directional<T: Trader + ?Sized>(
    trader: &T,
    symbol: &str,
    size_usd: f64,
    leverage: u32,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    long: bool,
) -> Result<OrderResult, TradeError> {
    let price = trader.get_market_price(symbol).await?;
    if price <= 0.0 {
        return Err(TradeError::InvalidPrice {
            symbol: symbol.to_string(),
            price,
        });
    }
    let size = size_usd / price;

    trader.set_leverage(symbol, leverage).await?;

    let entry_side = if long { OrderSide::Buy } else { OrderSide::Sell };
    let result = trader
        .place_market_order(symbol, entry_side, size, leverage, false, None, Some(price))
        .await?;

    let filled_size = match (result.success, result.filled_size) {
        (true, Some(size)) if size > 0.0 => size,
        _ => return Ok(result),
    };
    let filled_price = result.filled_price.unwrap_or(price);
    let lev = leverage.max(1) as f64;

    let mut adjusted_sl = stop_loss;
    let mut adjusted_tp = take_profit;

    // Long: SL < fill < TP. Short: TP < fill < SL.
    let sl_invalid = stop_loss.map(|sl| if long { sl >= filled_price } else { sl <= filled_price });
    if sl_invalid == Some(true) {
        let max_loss_pct = 0.5 / lev;
        let fixed = if long {
            filled_price * (1.0 - max_loss_pct)
        } else {
            filled_price * (1.0 + max_loss_pct)
        };
        tracing::warn!(
            symbol,
            stop_loss = stop_loss.unwrap_or_default(),
            filled_price,
            adjusted = fixed,
            "stop-loss inconsistent with fill price, adjusted inside liquidation band"
        );
        adjusted_sl = Some(fixed);
    }

    let tp_invalid =
        take_profit.map(|tp| if long { tp <= filled_price } else { tp >= filled_price });
    if tp_invalid == Some(true) {
        let fallback_sl = if long {
            filled_price * 0.99
        } else {
            filled_price * 1.01
        };
        let sl_distance = (filled_price - adjusted_sl.unwrap_or(fallback_sl)).abs() / filled_price;
        let rr = 1.5;
        let fixed = if long {
            filled_price * (1.0 + sl_distance * rr)
        } else {
            filled_price * (1.0 - sl_distance * rr)
        };
        tracing::warn!(
            symbol,
            take_profit = take_profit.unwrap_or_default(),
            filled_price,
            adjusted = fixed,
            "take-profit inconsistent with fill price, re-derived at 1:1.5 R/R"
        );
        adjusted_tp = Some(fixed);
    }

    let exit_side = if long { OrderSide::Sell } else { OrderSide::Buy };
    if let Some(sl) = adjusted_sl {
        if let Err(e) = trader.place_stop_loss(symbol, exit_side, filled_size, sl).await {
            tracing::error!(symbol, "failed to place stop-loss at {sl}: {e} (entry succeeded)");
        }
    }
    if let Some(tp) = adjusted_tp {
        if let Err(e) = trader
            .place_take_profit(symbol, exit_side, filled_size, tp)
            .await
        {
            tracing::error!(symbol, "failed to place take-profit at {tp}: {e} (entry succeeded)");
        }
    }

    Ok(result)
}
