//! In-memory paper-trading simulator.
//!
//! Executes orders against internal state with configurable fees and
//! slippage. Prices and klines are fed externally (`set_price`,
//! `set_klines`), so mock-mode agents and tests run without any venue
//! credentials.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::types::{
    AccountState, FundingRate, Kline, MarketData, OrderResult, OrderSide, Position, PositionSide,
    TradeError,
};
use crate::Trader;

#[derive(Debug, Clone)]
struct SimPosition {
    side: PositionSide,
    size: f64,
    entry_price: f64,
    leverage: u32,
}

#[derive(Debug, Default)]
struct SimState {
    balance: f64,
    positions: HashMap<String, SimPosition>,
    prices: HashMap<String, f64>,
    klines: HashMap<(String, String), Vec<Kline>>,
    funding: HashMap<String, Vec<FundingRate>>,
}

pub struct MockTrader {
    state: Mutex<SimState>,
    maker_fee: f64,
    taker_fee: f64,
    default_slippage: f64,
    order_seq: AtomicU64,
}

impl MockTrader {
    pub fn new(initial_balance: f64) -> Self {
        Self::with_fees(initial_balance, 0.0002, 0.0005, 0.001)
    }

    pub fn with_fees(
        initial_balance: f64,
        maker_fee: f64,
        taker_fee: f64,
        default_slippage: f64,
    ) -> Self {
        Self {
            state: Mutex::new(SimState {
                balance: initial_balance,
                ..SimState::default()
            }),
            maker_fee,
            taker_fee,
            default_slippage,
            order_seq: AtomicU64::new(1),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.lock().unwrap();
        state.prices.insert(symbol.to_uppercase(), price);
    }

    pub fn set_klines(&self, symbol: &str, timeframe: &str, klines: Vec<Kline>) {
        let mut state = self.state.lock().unwrap();
        state
            .klines
            .insert((symbol.to_uppercase(), timeframe.to_string()), klines);
    }

    pub fn set_funding_history(&self, symbol: &str, rates: Vec<FundingRate>) {
        let mut state = self.state.lock().unwrap();
        state.funding.insert(symbol.to_uppercase(), rates);
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.order_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn price_of(state: &SimState, symbol: &str) -> Result<f64, TradeError> {
        state
            .prices
            .get(symbol)
            .copied()
            .filter(|p| *p > 0.0)
            .ok_or_else(|| TradeError::InvalidPrice {
                symbol: symbol.to_string(),
                price: 0.0,
            })
    }

    fn to_position(symbol: &str, sim: &SimPosition, mark: f64) -> Position {
        let size_usd = sim.size * mark;
        let unrealized = match sim.side {
            PositionSide::Long => (mark - sim.entry_price) * sim.size,
            PositionSide::Short => (sim.entry_price - mark) * sim.size,
        };
        let margin = size_usd / sim.leverage.max(1) as f64;
        Position {
            symbol: symbol.to_string(),
            side: sim.side,
            size: sim.size,
            size_usd,
            entry_price: sim.entry_price,
            mark_price: mark,
            leverage: sim.leverage,
            unrealized_pnl: unrealized,
            unrealized_pnl_percent: if margin > 0.0 {
                unrealized / margin * 100.0
            } else {
                0.0
            },
            liquidation_price: None,
            margin_used: margin,
        }
    }

    fn close_at(
        &self,
        state: &mut SimState,
        symbol: &str,
        size: Option<f64>,
        fill_price: f64,
    ) -> Result<OrderResult, TradeError> {
        let sim = state
            .positions
            .get(symbol)
            .cloned()
            .ok_or_else(|| TradeError::PositionNotFound(symbol.to_string()))?;

        let close_size = size.unwrap_or(sim.size).min(sim.size);
        let realized = match sim.side {
            PositionSide::Long => (fill_price - sim.entry_price) * close_size,
            PositionSide::Short => (sim.entry_price - fill_price) * close_size,
        };
        let fee = close_size * fill_price * self.taker_fee;
        state.balance += realized - fee;

        if close_size >= sim.size {
            state.positions.remove(symbol);
        } else if let Some(p) = state.positions.get_mut(symbol) {
            p.size -= close_size;
        }

        Ok(OrderResult::filled(self.next_order_id(), close_size, fill_price))
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_entry(
        &self,
        state: &mut SimState,
        symbol: &str,
        side: OrderSide,
        size: f64,
        leverage: u32,
        fill_price: f64,
        fee_rate: f64,
    ) -> Result<OrderResult, TradeError> {
        let notional = size * fill_price;
        let margin = notional / leverage.max(1) as f64;
        let fee = notional * fee_rate;
        let margin_in_use: f64 = state
            .positions
            .iter()
            .map(|(s, p)| {
                let m = state.prices.get(s).copied().unwrap_or(p.entry_price);
                p.size * m / p.leverage.max(1) as f64
            })
            .sum();
        let available = state.balance - margin_in_use;
        if margin + fee > available {
            return Err(TradeError::InsufficientBalance {
                needed: margin + fee,
                available,
            });
        }
        state.balance -= fee;

        let new_side = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };
        match state.positions.get_mut(symbol) {
            Some(p) => {
                // Same-direction add: size-weighted entry.
                let total = p.size + size;
                p.entry_price = (p.size * p.entry_price + size * fill_price) / total;
                p.size = total;
                p.leverage = leverage;
            }
            None => {
                state.positions.insert(
                    symbol.to_string(),
                    SimPosition {
                        side: new_side,
                        size,
                        entry_price: fill_price,
                        leverage,
                    },
                );
            }
        }

        Ok(OrderResult::filled(self.next_order_id(), size, fill_price))
    }
}

#[async_trait]
impl Trader for MockTrader {
    fn exchange_name(&self) -> &str {
        "mock"
    }

    async fn initialize(&self) -> Result<(), TradeError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TradeError> {
        Ok(())
    }

    async fn get_account_state(&self) -> Result<AccountState, TradeError> {
        let state = self.state.lock().unwrap();
        let mut positions = Vec::new();
        let mut unrealized = 0.0;
        let mut margin_used = 0.0;
        for (symbol, sim) in &state.positions {
            let mark = state.prices.get(symbol).copied().unwrap_or(sim.entry_price);
            let pos = Self::to_position(symbol, sim, mark);
            unrealized += pos.unrealized_pnl;
            margin_used += pos.margin_used;
            positions.push(pos);
        }
        Ok(AccountState {
            equity: state.balance + unrealized,
            available_balance: (state.balance - margin_used).max(0.0),
            total_margin_used: margin_used,
            unrealized_pnl: unrealized,
            positions,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, TradeError> {
        Ok(self.get_account_state().await?.positions)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, TradeError> {
        let symbol = symbol.to_uppercase();
        let state = self.state.lock().unwrap();
        Ok(state.positions.get(&symbol).map(|sim| {
            let mark = state.prices.get(&symbol).copied().unwrap_or(sim.entry_price);
            Self::to_position(&symbol, sim, mark)
        }))
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, TradeError> {
        let symbol = symbol.to_uppercase();
        let state = self.state.lock().unwrap();
        Self::price_of(&state, &symbol)
    }

    async fn get_market_data(&self, symbol: &str) -> Result<MarketData, TradeError> {
        let symbol = symbol.to_uppercase();
        let state = self.state.lock().unwrap();
        let mid = Self::price_of(&state, &symbol)?;
        let spread = mid * 0.0005;
        Ok(MarketData {
            symbol,
            mid_price: mid,
            bid_price: mid - spread,
            ask_price: mid + spread,
            volume_24h: 0.0,
            funding_rate: None,
            timestamp: Utc::now(),
        })
    }

    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, TradeError> {
        let state = self.state.lock().unwrap();
        let key = (symbol.to_uppercase(), timeframe.to_string());
        let klines = state.klines.get(&key).cloned().unwrap_or_default();
        let start = klines.len().saturating_sub(limit);
        Ok(klines[start..].to_vec())
    }

    async fn get_funding_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<FundingRate>, TradeError> {
        let state = self.state.lock().unwrap();
        let mut rates = state
            .funding
            .get(&symbol.to_uppercase())
            .cloned()
            .unwrap_or_default();
        rates.truncate(limit);
        Ok(rates)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        leverage: u32,
        reduce_only: bool,
        slippage: Option<f64>,
        price: Option<f64>,
    ) -> Result<OrderResult, TradeError> {
        let symbol = symbol.to_uppercase();
        let mut state = self.state.lock().unwrap();
        let mark = match price {
            Some(p) if p > 0.0 => p,
            _ => Self::price_of(&state, &symbol)?,
        };
        let slip = slippage.unwrap_or(self.default_slippage);
        // Buys fill above mid, sells below.
        let fill_price = match side {
            OrderSide::Buy => mark * (1.0 + slip),
            OrderSide::Sell => mark * (1.0 - slip),
        };

        let existing = state.positions.get(&symbol).cloned();
        let reduces = reduce_only
            || matches!(
                (&existing, side),
                (Some(SimPosition { side: PositionSide::Long, .. }), OrderSide::Sell)
                    | (Some(SimPosition { side: PositionSide::Short, .. }), OrderSide::Buy)
            );

        if reduces {
            return self.close_at(&mut state, &symbol, Some(size), fill_price);
        }

        self.fill_entry(&mut state, &symbol, side, size, leverage, fill_price, self.taker_fee)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        price: f64,
        leverage: u32,
        reduce_only: bool,
    ) -> Result<OrderResult, TradeError> {
        // Simulator fills limit orders immediately at the limit price,
        // charged at the maker rate.
        let symbol = symbol.to_uppercase();
        let mut state = self.state.lock().unwrap();
        if reduce_only {
            return self.close_at(&mut state, &symbol, Some(size), price);
        }
        self.fill_entry(&mut state, &symbol, side, size, leverage, price, self.maker_fee)
    }

    async fn place_stop_loss(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _size: f64,
        _trigger_price: f64,
    ) -> Result<OrderResult, TradeError> {
        Ok(OrderResult::no_action())
    }

    async fn place_take_profit(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _size: f64,
        _trigger_price: f64,
    ) -> Result<OrderResult, TradeError> {
        Ok(OrderResult::no_action())
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<bool, TradeError> {
        Ok(true)
    }

    async fn cancel_all_orders(&self, _symbol: Option<&str>) -> Result<usize, TradeError> {
        Ok(0)
    }

    async fn close_position(
        &self,
        symbol: &str,
        size: Option<f64>,
        slippage: Option<f64>,
    ) -> Result<OrderResult, TradeError> {
        let symbol = symbol.to_uppercase();
        let mut state = self.state.lock().unwrap();
        let mark = Self::price_of(&state, &symbol)
            .or_else(|_| {
                state
                    .positions
                    .get(&symbol)
                    .map(|p| p.entry_price)
                    .ok_or_else(|| TradeError::PositionNotFound(symbol.clone()))
            })?;
        let slip = slippage.unwrap_or(self.default_slippage);
        let side = state
            .positions
            .get(&symbol)
            .map(|p| p.side)
            .ok_or_else(|| TradeError::PositionNotFound(symbol.clone()))?;
        // Closing a long sells below mid, closing a short buys above.
        let fill_price = match side {
            PositionSide::Long => mark * (1.0 - slip),
            PositionSide::Short => mark * (1.0 + slip),
        };
        self.close_at(&mut state, &symbol, size, fill_price)
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), TradeError> {
        Ok(())
    }
}
