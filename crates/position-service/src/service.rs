use std::time::Duration;

use agent_core::{format_ts, Agent, UNOWNED_AGENT_ID};
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::Serialize;
use sqlx::AnyPool;
use trader_trait::{Position, PositionSide};
use uuid::Uuid;

use crate::error::PositionError;
use crate::locks::RedisLock;
use crate::records::{position_from_row, AgentPosition, PositionStatus, POSITION_COLUMNS};

const POSITION_LOCK_PREFIX: &str = "pos_lock:";
const CAPITAL_LOCK_PREFIX: &str = "capital_lock:";
const POSITION_LOCK_HOLD: Duration = Duration::from_secs(10);
const POSITION_LOCK_WAIT: Duration = Duration::from_secs(5);
const CAPITAL_LOCK_HOLD: Duration = Duration::from_secs(15);
const CAPITAL_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Skip zombie-closing for positions opened within this window; the
/// exchange may simply not report them yet.
const ZOMBIE_GRACE_SECONDS: i64 = 300;

/// Total allocated capital across an account must stay below this share
/// of equity.
const ACCOUNT_ALLOCATION_CEILING: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct CapitalCheck {
    pub allowed: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub zombies_closed: usize,
    pub orphans_found: usize,
    pub size_synced: usize,
    pub stale_pending_removed: u64,
    pub details: Vec<String>,
}

/// Central coordination point that keeps agents on the same account from
/// interfering with each other's positions.
#[derive(Clone)]
pub struct PositionService {
    pool: AnyPool,
    redis: Option<ConnectionManager>,
}

impl PositionService {
    pub fn new(pool: AnyPool, redis: Option<ConnectionManager>) -> Self {
        Self { pool, redis }
    }

    // ------------------------------------------------------------------
    // Symbol exclusivity
    // ------------------------------------------------------------------

    /// True iff no other agent holds a pending/open record for this
    /// (account, symbol).
    pub async fn check_symbol_available(
        &self,
        account_id: Uuid,
        symbol: &str,
        exclude_agent: Option<Uuid>,
    ) -> Result<bool, PositionError> {
        let owner = self.get_symbol_owner(account_id, symbol).await?;
        Ok(match owner {
            Some(record) => exclude_agent == Some(record.agent_id),
            None => true,
        })
    }

    /// Current pending/open holder of a symbol on an account, if any.
    pub async fn get_symbol_owner(
        &self,
        account_id: Uuid,
        symbol: &str,
    ) -> Result<Option<AgentPosition>, PositionError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM agent_positions \
             WHERE account_id = $1 AND symbol = $2 AND status IN ('pending', 'open')"
        );
        let row = sqlx::query(&sql)
            .bind(account_id.to_string())
            .bind(symbol.to_uppercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    // ------------------------------------------------------------------
    // Lifecycle: claim -> confirm/accumulate -> close (or release)
    // ------------------------------------------------------------------

    /// Claim a symbol slot BEFORE placing the order (crash-safe pattern).
    ///
    /// Returns the existing record when this agent already owns the symbol
    /// (the accumulation case). Fails with `PositionConflict` when a
    /// different agent holds it. The Redis claim lock serializes racing
    /// claims; the partial unique index catches anything that slips
    /// through.
    pub async fn claim_position(
        &self,
        agent_id: Uuid,
        agent_type: &str,
        account_id: Option<Uuid>,
        symbol: &str,
        side: PositionSide,
        leverage: i64,
    ) -> Result<AgentPosition, PositionError> {
        let symbol = symbol.to_uppercase();

        let lock = match (&self.redis, account_id) {
            (Some(conn), Some(account)) => {
                let key = format!("{POSITION_LOCK_PREFIX}{account}:{symbol}");
                match RedisLock::acquire(conn, &key, POSITION_LOCK_HOLD, POSITION_LOCK_WAIT).await?
                {
                    Some(lock) => Some(lock),
                    None => {
                        return Err(PositionError::PositionConflict {
                            symbol,
                            owner_agent_id: UNOWNED_AGENT_ID,
                        })
                    }
                }
            }
            _ => None,
        };

        let result = self
            .claim_position_locked(agent_id, agent_type, account_id, &symbol, side, leverage)
            .await;

        if let Some(lock) = lock {
            lock.release().await;
        }
        result
    }

    async fn claim_position_locked(
        &self,
        agent_id: Uuid,
        agent_type: &str,
        account_id: Option<Uuid>,
        symbol: &str,
        side: PositionSide,
        leverage: i64,
    ) -> Result<AgentPosition, PositionError> {
        // Existing claim check. Without an account (mock agents) exclusivity
        // is per-agent only.
        let existing = match account_id {
            Some(account) => self.get_symbol_owner(account, symbol).await?,
            None => self.get_agent_position_for_symbol(agent_id, symbol).await?,
        };
        if let Some(record) = existing {
            if record.agent_id != agent_id {
                return Err(PositionError::PositionConflict {
                    symbol: symbol.to_string(),
                    owner_agent_id: record.agent_id,
                });
            }
            // Same agent already owns the symbol: hand the record back for
            // accumulation instead of creating a duplicate.
            return Ok(record);
        }

        let record = AgentPosition {
            id: Uuid::new_v4(),
            agent_id,
            agent_type: agent_type.to_string(),
            account_id,
            symbol: symbol.to_string(),
            side,
            size: 0.0,
            size_usd: 0.0,
            entry_price: 0.0,
            leverage,
            status: PositionStatus::Pending,
            opened_at: Utc::now(),
            close_price: None,
            realized_pnl: None,
            closed_at: None,
        };

        let inserted = sqlx::query(
            "INSERT INTO agent_positions (id, agent_id, agent_type, account_id, symbol, side, \
             size, size_usd, entry_price, leverage, status, opened_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(record.id.to_string())
        .bind(record.agent_id.to_string())
        .bind(&record.agent_type)
        .bind(record.account_id.map(|id| id.to_string()))
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.size)
        .bind(record.size_usd)
        .bind(record.entry_price)
        .bind(record.leverage)
        .bind(record.status.as_str())
        .bind(format_ts(record.opened_at))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(record),
            // Concurrent race hit the partial unique index.
            Err(e) if is_unique_violation(&e) => Err(PositionError::PositionConflict {
                symbol: symbol.to_string(),
                owner_agent_id: UNOWNED_AGENT_ID,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically check capital allocation AND claim the symbol slot.
    ///
    /// Both run under an account-level lock so two agents on different
    /// symbols cannot both pass the capital check before either claims.
    #[allow(clippy::too_many_arguments)]
    pub async fn claim_position_with_capital_check(
        &self,
        agent: &Agent,
        agent_type: &str,
        account_id: Option<Uuid>,
        symbol: &str,
        side: PositionSide,
        leverage: i64,
        account_equity: f64,
        requested_size_usd: f64,
    ) -> Result<AgentPosition, PositionError> {
        let lock = match (&self.redis, account_id) {
            (Some(conn), Some(account)) => {
                let key = format!("{CAPITAL_LOCK_PREFIX}{account}");
                match RedisLock::acquire(conn, &key, CAPITAL_LOCK_HOLD, CAPITAL_LOCK_WAIT).await? {
                    Some(lock) => Some(lock),
                    None => {
                        return Err(PositionError::CapitalExceeded(
                            "could not acquire capital allocation lock - another trade may be \
                             in progress"
                                .to_string(),
                        ))
                    }
                }
            }
            _ => None,
        };

        let result = async {
            if let Some(account) = account_id {
                if account_equity > 0.0 && agent.effective_capital(account_equity).is_some() {
                    let check = self
                        .check_capital_allocation(
                            account,
                            account_equity,
                            agent,
                            requested_size_usd,
                            leverage,
                        )
                        .await?;
                    if !check.allowed {
                        return Err(PositionError::CapitalExceeded(check.reason));
                    }
                }
            }
            // Still inside the capital lock; the per-symbol claim lock
            // nests under it (capital -> symbol ordering everywhere).
            self.claim_position(agent.id, agent_type, account_id, symbol, side, leverage)
                .await
        }
        .await;

        if let Some(lock) = lock {
            lock.release().await;
        }
        result
    }

    /// Transition a pending claim to `open` with fill data.
    pub async fn confirm_position(
        &self,
        position_id: Uuid,
        size: f64,
        size_usd: f64,
        entry_price: f64,
    ) -> Result<(), PositionError> {
        sqlx::query(
            "UPDATE agent_positions SET status = 'open', size = $1, size_usd = $2, \
             entry_price = $3 WHERE id = $4 AND status = 'pending'",
        )
        .bind(size)
        .bind(size_usd)
        .bind(entry_price)
        .bind(position_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a pending claim after a failed order. A no-op for any other
    /// status: open records are never deleted here.
    pub async fn release_claim(&self, position_id: Uuid) -> Result<(), PositionError> {
        sqlx::query("DELETE FROM agent_positions WHERE id = $1 AND status = 'pending'")
            .bind(position_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Add fill data to an existing open record, recomputing the
    /// size-weighted average entry price. Warns and returns when the
    /// record is missing or not open.
    pub async fn accumulate_position(
        &self,
        position_id: Uuid,
        additional_size: f64,
        additional_size_usd: f64,
        fill_price: f64,
    ) -> Result<(), PositionError> {
        let record = self.get_by_id(position_id).await?;
        let record = match record {
            Some(r) if r.status == PositionStatus::Open => r,
            other => {
                tracing::warn!(
                    position_id = %position_id,
                    status = other.map(|r| r.status.as_str()).unwrap_or("missing"),
                    "accumulate_position: record not found or not open"
                );
                return Ok(());
            }
        };

        let total_size = record.size + additional_size;
        let new_entry = if total_size > 0.0 && fill_price > 0.0 {
            (record.size * record.entry_price + additional_size * fill_price) / total_size
        } else if fill_price > 0.0 {
            fill_price
        } else {
            record.entry_price
        };
        let new_entry = (new_entry * 1e8).round() / 1e8;

        sqlx::query(
            "UPDATE agent_positions SET size = $1, size_usd = $2, entry_price = $3 WHERE id = $4",
        )
        .bind(total_size)
        .bind(record.size_usd + additional_size_usd)
        .bind(new_entry)
        .bind(position_id.to_string())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            symbol = %record.symbol,
            old_size = record.size,
            new_size = total_size,
            new_entry,
            "position accumulated"
        );
        Ok(())
    }

    /// Transition a record to `closed` and stamp the close time.
    pub async fn close_position_record(
        &self,
        position_id: Uuid,
        close_price: f64,
        realized_pnl: f64,
    ) -> Result<(), PositionError> {
        sqlx::query(
            "UPDATE agent_positions SET status = 'closed', close_price = $1, realized_pnl = $2, \
             closed_at = $3 WHERE id = $4",
        )
        .bind(close_price)
        .bind(realized_pnl)
        .bind(format_ts(Utc::now()))
        .bind(position_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_by_id(
        &self,
        position_id: Uuid,
    ) -> Result<Option<AgentPosition>, PositionError> {
        let sql = format!("SELECT {POSITION_COLUMNS} FROM agent_positions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(position_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    pub async fn get_agent_positions(
        &self,
        agent_id: Uuid,
        status_filter: Option<PositionStatus>,
    ) -> Result<Vec<AgentPosition>, PositionError> {
        let rows = match status_filter {
            Some(status) => {
                let sql = format!(
                    "SELECT {POSITION_COLUMNS} FROM agent_positions \
                     WHERE agent_id = $1 AND status = $2"
                );
                sqlx::query(&sql)
                    .bind(agent_id.to_string())
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql =
                    format!("SELECT {POSITION_COLUMNS} FROM agent_positions WHERE agent_id = $1");
                sqlx::query(&sql)
                    .bind(agent_id.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(position_from_row).collect()
    }

    /// The agent's pending/open record for a symbol, if any.
    pub async fn get_agent_position_for_symbol(
        &self,
        agent_id: Uuid,
        symbol: &str,
    ) -> Result<Option<AgentPosition>, PositionError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM agent_positions \
             WHERE agent_id = $1 AND symbol = $2 AND status IN ('pending', 'open')"
        );
        let row = sqlx::query(&sql)
            .bind(agent_id.to_string())
            .bind(symbol.to_uppercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    pub async fn get_account_open_positions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<AgentPosition>, PositionError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM agent_positions \
             WHERE account_id = $1 AND status IN ('pending', 'open')"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(position_from_row).collect()
    }

    pub async fn has_open_positions(&self, agent_id: Uuid) -> Result<bool, PositionError> {
        let positions = self.get_agent_positions(agent_id, None).await?;
        Ok(positions
            .iter()
            .any(|p| matches!(p.status, PositionStatus::Pending | PositionStatus::Open)))
    }

    // ------------------------------------------------------------------
    // Capital allocation
    // ------------------------------------------------------------------

    /// Validate a prospective open against the agent's own budget and the
    /// account-wide allocation ceiling.
    ///
    /// All comparisons use margin (`size_usd / leverage`) so high-leverage
    /// positions are measured consistently.
    pub async fn check_capital_allocation(
        &self,
        account_id: Uuid,
        account_equity: f64,
        agent: &Agent,
        requested_size_usd: f64,
        leverage: i64,
    ) -> Result<CapitalCheck, PositionError> {
        let effective_capital = match agent.effective_capital(account_equity) {
            Some(cap) => cap,
            None => {
                return Ok(CapitalCheck {
                    allowed: true,
                    reason: "No allocation configured".to_string(),
                })
            }
        };

        let requested_margin = requested_size_usd / leverage.max(1) as f64;

        // 1. Agent's own budget.
        let open = self
            .get_agent_positions(agent.id, Some(PositionStatus::Open))
            .await?;
        let current_used: f64 = open.iter().map(|p| p.margin()).sum();
        let new_total = current_used + requested_margin;
        if new_total > effective_capital {
            return Ok(CapitalCheck {
                allowed: false,
                reason: format!(
                    "Would exceed agent allocation: ${new_total:.2} > ${effective_capital:.2} \
                     (currently using ${current_used:.2})"
                ),
            });
        }

        // 2. Account-wide ceiling on configured allocations.
        let total_allocated = self
            .total_account_allocation(account_id, account_equity)
            .await?;
        let safe_equity = account_equity * ACCOUNT_ALLOCATION_CEILING;
        if total_allocated > safe_equity {
            return Ok(CapitalCheck {
                allowed: false,
                reason: format!(
                    "Account over-allocated: total allocated ${total_allocated:.2} > safe limit \
                     ${safe_equity:.2} (equity ${account_equity:.2})"
                ),
            });
        }

        Ok(CapitalCheck {
            allowed: true,
            reason: "OK".to_string(),
        })
    }

    /// Sum of effective capitals over non-stopped agents on the account.
    async fn total_account_allocation(
        &self,
        account_id: Uuid,
        account_equity: f64,
    ) -> Result<f64, PositionError> {
        let rows = sqlx::query(
            "SELECT allocated_capital, allocated_capital_percent FROM agents \
             WHERE account_id = $1 AND status IN ('active', 'paused', 'warning')",
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        use sqlx::Row;
        let mut total = 0.0;
        for row in rows {
            let capital: Option<f64> = row.try_get("allocated_capital")?;
            let percent: Option<f64> = row.try_get("allocated_capital_percent")?;
            if let Some(cap) = capital {
                total += cap;
            } else if let Some(pct) = percent {
                total += account_equity * pct / 100.0;
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Align the registry with exchange-reported positions.
    ///
    /// Zombies (DB open, exchange missing) are closed after a propagation
    /// grace period; orphans (exchange position nobody tracks) get an
    /// unowned record so they are visible; size drift is synced from the
    /// exchange. Stale pending claims are garbage-collected last.
    pub async fn reconcile(
        &self,
        account_id: Uuid,
        exchange_positions: &[Position],
    ) -> Result<ReconcileSummary, PositionError> {
        let mut summary = ReconcileSummary::default();
        let db_positions = self.get_account_open_positions(account_id).await?;

        let exchange_map: std::collections::HashMap<String, &Position> = exchange_positions
            .iter()
            .map(|p| (p.symbol.to_uppercase(), p))
            .collect();
        let db_symbols: std::collections::HashSet<String> =
            db_positions.iter().map(|p| p.symbol.to_uppercase()).collect();

        let now = Utc::now();
        for db_pos in &db_positions {
            let symbol = db_pos.symbol.to_uppercase();
            match exchange_map.get(&symbol) {
                None => {
                    if db_pos.status != PositionStatus::Open {
                        continue;
                    }
                    let age = (now - db_pos.opened_at).num_seconds();
                    if age < ZOMBIE_GRACE_SECONDS {
                        summary.details.push(format!(
                            "SKIP_ZOMBIE: {symbol} (agent {}) opened recently - within grace \
                             period",
                            db_pos.agent_id
                        ));
                        continue;
                    }
                    self.close_position_record(db_pos.id, 0.0, 0.0).await?;
                    summary.zombies_closed += 1;
                    summary.details.push(format!(
                        "ZOMBIE: {symbol} (agent {}) closed in DB - no matching exchange position",
                        db_pos.agent_id
                    ));
                    tracing::warn!(
                        %symbol, agent_id = %db_pos.agent_id, %account_id,
                        "reconciliation closed zombie position"
                    );
                }
                Some(ex_pos) => {
                    if (db_pos.size - ex_pos.size).abs() > 1e-8 {
                        sqlx::query(
                            "UPDATE agent_positions SET size = $1, size_usd = $2 WHERE id = $3",
                        )
                        .bind(ex_pos.size)
                        .bind(ex_pos.size_usd)
                        .bind(db_pos.id.to_string())
                        .execute(&self.pool)
                        .await?;
                        summary.size_synced += 1;
                        summary.details.push(format!(
                            "SYNC: {symbol} size {} -> {}",
                            db_pos.size, ex_pos.size
                        ));
                    }
                }
            }
        }

        // Exchange positions nobody tracks: record them under the unowned
        // agent id so manual trades stay visible.
        for (symbol, ex_pos) in &exchange_map {
            if db_symbols.contains(symbol) {
                continue;
            }
            let insert = sqlx::query(
                "INSERT INTO agent_positions (id, agent_id, agent_type, account_id, symbol, \
                 side, size, size_usd, entry_price, leverage, status, opened_at) \
                 VALUES ($1, $2, 'unknown', $3, $4, $5, $6, $7, $8, $9, 'open', $10)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(UNOWNED_AGENT_ID.to_string())
            .bind(account_id.to_string())
            .bind(symbol)
            .bind(ex_pos.side.as_str())
            .bind(ex_pos.size)
            .bind(ex_pos.size_usd)
            .bind(ex_pos.entry_price)
            .bind(ex_pos.leverage as i64)
            .bind(format_ts(now))
            .execute(&self.pool)
            .await;

            match insert {
                Ok(_) => {
                    summary.orphans_found += 1;
                    summary.details.push(format!(
                        "ORPHAN: {symbol} exists on exchange but not tracked - created unowned \
                         record"
                    ));
                    tracing::warn!(%symbol, %account_id, "reconciliation found orphan position");
                }
                Err(e) => {
                    tracing::error!(%symbol, "failed to create orphan record: {e}");
                }
            }
        }

        summary.stale_pending_removed = self.cleanup_stale_pending(300).await?;
        Ok(summary)
    }

    /// Delete pending claims older than `max_age_seconds` (crash residue
    /// between claim and order submission).
    pub async fn cleanup_stale_pending(&self, max_age_seconds: i64) -> Result<u64, PositionError> {
        let cutoff = format_ts(Utc::now() - chrono::Duration::seconds(max_age_seconds));
        let result =
            sqlx::query("DELETE FROM agent_positions WHERE status = 'pending' AND opened_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(count, "cleaned up stale pending claims");
        }
        Ok(count)
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.is_unique_violation()
    )
}
