//! Live PnL and margin accounting.
//!
//! The calculator owns the authoritative position, balance and mark-price
//! maps. Every other component reads cloned snapshots through its API.
//! Subscribers receive updates over bounded channels; a full channel drops
//! the update so the producer never blocks on user code.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::exchange::{AccountBalance, Position};
use crate::monitor::Severity;
use crate::utils::decimal::safe_div;

/// Protective floor below which a position gets a margin call.
pub const MARGIN_CALL_RATIO: Decimal = dec!(1.10);
/// Protective floor below which a position gets a margin warning.
pub const MARGIN_WARNING_RATIO: Decimal = dec!(1.30);

/// Minimum PnL move that fans out an update, in quote currency.
const MIN_EMIT_DELTA: Decimal = dec!(0.01);

const CHANNEL_CAPACITY: usize = 100;

/// Immutable per-position PnL view at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct PnlSnapshot {
    pub symbol: String,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub margin_used: Decimal,
    pub margin_ratio: Decimal,
    pub mark_price: Decimal,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub at: DateTime<Utc>,
}

/// Kind of protective margin alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MarginAlertKind {
    MarginWarning,
    MarginCall,
}

impl MarginAlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginAlertKind::MarginWarning => "margin_warning",
            MarginAlertKind::MarginCall => "margin_call",
        }
    }
}

/// Protective margin alert for one position.
#[derive(Debug, Clone)]
pub struct MarginAlert {
    pub symbol: String,
    pub kind: MarginAlertKind,
    pub current_ratio: Decimal,
    pub threshold_ratio: Decimal,
    pub message: String,
    pub severity: Severity,
    pub at: DateTime<Utc>,
}

/// Account-wide equity view for history persistence.
#[derive(Debug, Clone, Serialize)]
pub struct EquitySnapshot {
    pub total_equity: Decimal,
    pub available_balance: Decimal,
    pub used_margin: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub margin_ratio: Decimal,
    pub position_count: usize,
    pub at: DateTime<Utc>,
}

/// Daily PnL accumulator, keyed by UTC date.
#[derive(Debug, Clone)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub starting_equity: Decimal,
    pub current_equity: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarginState {
    Normal,
    Warning,
    Call,
}

#[derive(Default)]
struct CalcState {
    positions: HashMap<String, Position>,
    balances: HashMap<String, AccountBalance>,
    marks: HashMap<String, Decimal>,
    last_emitted: HashMap<String, Decimal>,
    margin_states: HashMap<String, MarginState>,
    peak_equity: Decimal,
    day: Option<NaiveDate>,
    day_start_equity: Decimal,
}

impl CalcState {
    fn equity(&self) -> Decimal {
        let cash: Decimal = self
            .balances
            .values()
            .map(|b| b.available + b.locked)
            .sum();
        let unrealized: Decimal = self.positions.values().map(|p| p.unrealized_pnl).sum();
        cash + unrealized
    }

    fn margin_used(&self) -> Decimal {
        self.positions
            .values()
            .filter(|p| p.is_open())
            .map(|p| p.margin_used())
            .sum()
    }

    fn total_unrealized(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    fn total_realized(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum::<Decimal>()
            + self.balances.values().map(|b| b.realized_pnl).sum::<Decimal>()
    }

    /// Roll the daily baseline and drawdown peak forward.
    fn refresh_aggregates(&mut self, now: DateTime<Utc>) {
        let equity = self.equity();
        let today = now.date_naive();

        if self.day != Some(today) {
            self.day = Some(today);
            self.day_start_equity = equity;
            info!(date = %today, starting_equity = %equity, "Daily PnL baseline reset");
        }
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }
}

/// The PnL & margin calculator.
pub struct PnlCalculator {
    state: RwLock<CalcState>,
    pnl_subs: RwLock<HashMap<String, mpsc::Sender<PnlSnapshot>>>,
    margin_subs: RwLock<HashMap<String, mpsc::Sender<MarginAlert>>>,
}

impl Default for PnlCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl PnlCalculator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CalcState::default()),
            pnl_subs: RwLock::new(HashMap::new()),
            margin_subs: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to PnL updates. Re-registering the same id replaces the
    /// previous subscription.
    pub async fn subscribe_pnl(&self, id: &str) -> mpsc::Receiver<PnlSnapshot> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        if self
            .pnl_subs
            .write()
            .await
            .insert(id.to_string(), tx)
            .is_some()
        {
            debug!(subscriber = %id, "Replaced existing PnL subscription");
        }
        rx
    }

    /// Subscribe to protective margin alerts.
    pub async fn subscribe_margin_alerts(&self, id: &str) -> mpsc::Receiver<MarginAlert> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        if self
            .margin_subs
            .write()
            .await
            .insert(id.to_string(), tx)
            .is_some()
        {
            debug!(subscriber = %id, "Replaced existing margin subscription");
        }
        rx
    }

    /// Ingest a position update from the reconciler or user stream.
    pub async fn update_position(&self, mut position: Position, now: DateTime<Utc>) {
        let mut state = self.state.write().await;

        if let Some(mark) = state.marks.get(&position.symbol).copied() {
            position.mark_price = mark;
        }
        position.unrealized_pnl = position.unrealized_at(position.mark_price);
        position.updated_at = now;

        if position.is_open() {
            state.positions.insert(position.symbol.clone(), position);
        } else {
            state.positions.remove(&position.symbol);
            state.last_emitted.remove(&position.symbol);
            state.margin_states.remove(&position.symbol);
        }
        state.refresh_aggregates(now);
    }

    /// Ingest a balance update.
    pub async fn update_balance(&self, balance: AccountBalance, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.balances.insert(balance.asset.clone(), balance);
        state.refresh_aggregates(now);
    }

    /// Reprice a symbol from the mark stream. Fires PnL-update and margin
    /// callbacks after the state lock is released.
    pub async fn update_mark_price(&self, symbol: &str, mark: Decimal, now: DateTime<Utc>) {
        let mut pnl_event = None;
        let mut margin_event = None;

        {
            let mut state = self.state.write().await;
            state.marks.insert(symbol.to_string(), mark);

            if let Some(pos) = state.positions.get_mut(symbol) {
                pos.mark_price = mark;
                pos.unrealized_pnl = pos.unrealized_at(mark);
                pos.updated_at = now;

                let snapshot = snapshot_of(pos, now);
                let upnl = pos.unrealized_pnl;
                let local_ratio = snapshot.margin_ratio;

                let last = state.last_emitted.get(symbol).copied();
                if last.map(|v| (upnl - v).abs() > MIN_EMIT_DELTA).unwrap_or(true) {
                    state.last_emitted.insert(symbol.to_string(), upnl);
                    pnl_event = Some(snapshot);
                }

                let new_level = if local_ratio < MARGIN_CALL_RATIO {
                    MarginState::Call
                } else if local_ratio < MARGIN_WARNING_RATIO {
                    MarginState::Warning
                } else {
                    MarginState::Normal
                };
                let old_level = state
                    .margin_states
                    .insert(symbol.to_string(), new_level)
                    .unwrap_or(MarginState::Normal);

                // Alert only when crossing into a worse band
                let worsened = matches!(
                    (old_level, new_level),
                    (MarginState::Normal, MarginState::Warning)
                        | (MarginState::Normal, MarginState::Call)
                        | (MarginState::Warning, MarginState::Call)
                );
                if worsened {
                    margin_event = Some(match new_level {
                        MarginState::Call => MarginAlert {
                            symbol: symbol.to_string(),
                            kind: MarginAlertKind::MarginCall,
                            current_ratio: local_ratio,
                            threshold_ratio: MARGIN_CALL_RATIO,
                            message: format!(
                                "{} margin ratio {:.4} below call floor {}",
                                symbol, local_ratio, MARGIN_CALL_RATIO
                            ),
                            severity: Severity::Critical,
                            at: now,
                        },
                        _ => MarginAlert {
                            symbol: symbol.to_string(),
                            kind: MarginAlertKind::MarginWarning,
                            current_ratio: local_ratio,
                            threshold_ratio: MARGIN_WARNING_RATIO,
                            message: format!(
                                "{} margin ratio {:.4} below warning floor {}",
                                symbol, local_ratio, MARGIN_WARNING_RATIO
                            ),
                            severity: Severity::Warning,
                            at: now,
                        },
                    });
                }
            }
            state.refresh_aggregates(now);
        }

        if let Some(snapshot) = pnl_event {
            for (id, tx) in self.pnl_subs.read().await.iter() {
                if tx.try_send(snapshot.clone()).is_err() {
                    debug!(subscriber = %id, "PnL channel full, dropping update");
                }
            }
        }
        if let Some(alert) = margin_event {
            warn!(
                symbol = %alert.symbol,
                kind = alert.kind.as_str(),
                ratio = %alert.current_ratio,
                "Protective margin alert"
            );
            for (id, tx) in self.margin_subs.read().await.iter() {
                if tx.try_send(alert.clone()).is_err() {
                    debug!(subscriber = %id, "Margin channel full, dropping alert");
                }
            }
        }
    }

    /// Snapshot for one symbol, `None` when flat.
    pub async fn position_snapshot(&self, symbol: &str, now: DateTime<Utc>) -> Option<PnlSnapshot> {
        let state = self.state.read().await;
        state.positions.get(symbol).map(|p| snapshot_of(p, now))
    }

    /// Snapshots for every open position.
    pub async fn snapshots(&self, now: DateTime<Utc>) -> Vec<PnlSnapshot> {
        let state = self.state.read().await;
        state
            .positions
            .values()
            .filter(|p| p.is_open())
            .map(|p| snapshot_of(p, now))
            .collect()
    }

    /// Cloned open positions.
    pub async fn positions(&self) -> Vec<Position> {
        let state = self.state.read().await;
        state
            .positions
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect()
    }

    /// Account equity: cash balances plus unrealized PnL.
    pub async fn equity(&self) -> Decimal {
        self.state.read().await.equity()
    }

    /// Total margin in use across open positions, at mark.
    pub async fn margin_used(&self) -> Decimal {
        self.state.read().await.margin_used()
    }

    /// Portfolio margin ratio `equity / margin_used`; 0 means no exposure.
    pub async fn margin_ratio(&self) -> Decimal {
        let state = self.state.read().await;
        safe_div(state.equity(), state.margin_used())
    }

    /// Margin utilization `margin_used / equity`; higher is riskier.
    pub async fn margin_utilization(&self) -> Decimal {
        let state = self.state.read().await;
        safe_div(state.margin_used(), state.equity())
    }

    pub async fn total_unrealized(&self) -> Decimal {
        self.state.read().await.total_unrealized()
    }

    pub async fn total_realized(&self) -> Decimal {
        self.state.read().await.total_realized()
    }

    /// Daily PnL relative to the day's starting equity.
    pub async fn daily_pnl(&self, now: DateTime<Utc>) -> Decimal {
        let mut state = self.state.write().await;
        state.refresh_aggregates(now);
        state.equity() - state.day_start_equity
    }

    /// Drawdown from peak equity, in [0, 1].
    pub async fn drawdown(&self) -> Decimal {
        let state = self.state.read().await;
        if state.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let dd = (state.peak_equity - state.equity()) / state.peak_equity;
        dd.max(Decimal::ZERO)
    }

    /// Account-wide view for the equity history table.
    pub async fn equity_snapshot(&self, now: DateTime<Utc>) -> EquitySnapshot {
        let state = self.state.read().await;
        let equity = state.equity();
        let margin_used = state.margin_used();
        EquitySnapshot {
            total_equity: equity,
            available_balance: state.balances.values().map(|b| b.available).sum(),
            used_margin: margin_used,
            unrealized_pnl: state.total_unrealized(),
            realized_pnl: state.total_realized(),
            margin_ratio: safe_div(equity, margin_used),
            position_count: state.positions.values().filter(|p| p.is_open()).count(),
            at: now,
        }
    }

    /// Current-day summary for the daily upsert.
    pub async fn daily_summary(&self, now: DateTime<Utc>) -> DailySummary {
        let mut state = self.state.write().await;
        state.refresh_aggregates(now);
        DailySummary {
            date: state.day.unwrap_or_else(|| now.date_naive()),
            starting_equity: state.day_start_equity,
            current_equity: state.equity(),
            realized_pnl: state.total_realized(),
            unrealized_pnl: state.total_unrealized(),
        }
    }
}

/// Per-position snapshot. The local margin ratio is taken against the margin
/// posted at entry, so a 10x long 1 BTC from 20000 marked at 19500 reads
/// (2000 - 500) / 2000 = 0.75.
fn snapshot_of(pos: &Position, now: DateTime<Utc>) -> PnlSnapshot {
    let initial_margin = pos.initial_margin();
    PnlSnapshot {
        symbol: pos.symbol.clone(),
        unrealized_pnl: pos.unrealized_pnl,
        realized_pnl: pos.realized_pnl,
        margin_used: pos.margin_used(),
        margin_ratio: safe_div(initial_margin + pos.unrealized_pnl, initial_margin),
        mark_price: pos.mark_price,
        entry_price: pos.entry_price,
        size: pos.size,
        at: now,
    }
}
