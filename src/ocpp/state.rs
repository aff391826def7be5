//! Per-charger transaction and connector state
//!
//! In-process state keyed by charge-point id, created lazily on first
//! action and kept for the process lifetime. Each charger's state is
//! mutated only by the receive loop owning that connection; the map
//! itself is shared across connections.
//!
//! The transactional rules here are the liveness-critical piece: repeated
//! Start/Stop/TransactionEvent deliveries must be answered idempotently
//! rather than corrupting connector bookkeeping. Strict mode turns state
//! violations into wire errors; lenient mode lets telemetry through with
//! an `orphaned` marker where defined.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

// ── Violations ─────────────────────────────────────────────────

/// Wire-error class of a state violation; spelled per-version at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// `OccurrenceConstraintViolation`
    OccurrenceConstraint,
    /// `FormationViolation` / `FormatViolation`
    Format,
}

/// A rejected state transition
#[derive(Debug, Clone, PartialEq)]
pub struct StateViolation {
    pub kind: ViolationKind,
    pub description: String,
}

impl StateViolation {
    fn occurrence(description: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::OccurrenceConstraint,
            description: description.into(),
        }
    }
}

// ── Records ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorState {
    pub status: String,
    pub error_code: Option<String>,
    pub last_status_at: DateTime<Utc>,
}

/// 1.6J transaction lifecycle
#[derive(Debug, Clone, PartialEq)]
enum TxState16 {
    Active,
    Stopped,
}

#[derive(Debug, Clone)]
struct Transaction16 {
    connector_id: u64,
    id_tag: String,
    meter_start: i64,
    /// Timestamps are compared verbatim for idempotency, so they stay
    /// in their wire form.
    timestamp: String,
    state: TxState16,
    stop: Option<StopRecord>,
}

#[derive(Debug, Clone, PartialEq)]
struct StopRecord {
    meter_stop: i64,
    timestamp: String,
}

/// 2.x transaction lifecycle
#[derive(Debug, Clone, PartialEq)]
enum TxState2x {
    Active,
    Ended,
}

#[derive(Debug, Clone)]
struct Transaction2x {
    evse_id: Option<u64>,
    connector_id: Option<u64>,
    id_token: Option<String>,
    started_at: String,
    state: TxState2x,
    last_seq_no: u64,
}

/// What an `activeByConnector` slot points at
#[derive(Debug, Clone, PartialEq)]
enum ActiveTx {
    V16(i64),
    V2x(String),
}

#[derive(Debug, Default)]
struct ChargePointState {
    last_boot_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    connectors: HashMap<u64, ConnectorState>,
    transaction_counter: i64,
    transactions_16: HashMap<i64, Transaction16>,
    transactions_2x: HashMap<String, Transaction2x>,
    /// Invariant: at most one active transaction per connector.
    active_by_connector: HashMap<u64, ActiveTx>,
}

// ── Requests / outcomes ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StartTxRequest {
    pub connector_id: u64,
    pub id_tag: String,
    pub meter_start: i64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub transaction_id: i64,
    pub idempotent: bool,
}

#[derive(Debug, Clone)]
pub struct StopTxRequest {
    pub transaction_id: i64,
    pub meter_stop: i64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopOutcome {
    pub idempotent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterValuesOutcome {
    /// Set in lenient mode when the referenced transaction is unknown.
    pub orphaned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEventType {
    Started,
    Updated,
    Ended,
}

#[derive(Debug, Clone)]
pub struct TxEventRequest {
    pub event_type: TxEventType,
    pub seq_no: u64,
    pub transaction_id: String,
    pub evse_id: Option<u64>,
    pub connector_id: Option<u64>,
    pub id_token: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxEventOutcome {
    pub idempotent: bool,
}

// ── Store ──────────────────────────────────────────────────────

/// In-memory per-charger state store
pub struct StateStore {
    chargers: DashMap<String, ChargePointState>,
    lenient: bool,
}

impl StateStore {
    pub fn new(lenient: bool) -> Self {
        Self {
            chargers: DashMap::new(),
            lenient,
        }
    }

    pub fn record_boot(&self, charge_point_id: &str) {
        self.chargers
            .entry(charge_point_id.to_string())
            .or_default()
            .last_boot_at = Some(Utc::now());
    }

    pub fn record_heartbeat(&self, charge_point_id: &str) {
        self.chargers
            .entry(charge_point_id.to_string())
            .or_default()
            .last_heartbeat_at = Some(Utc::now());
    }

    /// Update connector state, returning the previous status if any.
    pub fn record_connector_status(
        &self,
        charge_point_id: &str,
        connector_id: u64,
        status: &str,
        error_code: Option<&str>,
    ) -> Option<String> {
        let mut state = self.chargers.entry(charge_point_id.to_string()).or_default();
        state
            .connectors
            .insert(
                connector_id,
                ConnectorState {
                    status: status.to_string(),
                    error_code: error_code.map(str::to_string),
                    last_status_at: Utc::now(),
                },
            )
            .map(|c| c.status)
    }

    pub fn connector_status(&self, charge_point_id: &str, connector_id: u64) -> Option<ConnectorState> {
        self.chargers
            .get(charge_point_id)
            .and_then(|s| s.connectors.get(&connector_id).cloned())
    }

    // ── 1.6J transactions ──────────────────────────────────

    pub fn start_transaction(
        &self,
        charge_point_id: &str,
        req: StartTxRequest,
    ) -> Result<StartOutcome, StateViolation> {
        let mut state = self.chargers.entry(charge_point_id.to_string()).or_default();

        if let Some(ActiveTx::V16(active)) = state.active_by_connector.get(&req.connector_id).cloned() {
            let existing = state.transactions_16.get(&active);
            let matches = existing.is_some_and(|tx| {
                tx.connector_id == req.connector_id
                    && tx.id_tag == req.id_tag
                    && tx.meter_start == req.meter_start
                    && tx.timestamp == req.timestamp
            });
            if matches {
                return Ok(StartOutcome {
                    transaction_id: active,
                    idempotent: true,
                });
            }
            return Err(StateViolation::occurrence(
                "Connector already has an active transaction",
            ));
        }

        state.transaction_counter += 1;
        let transaction_id = state.transaction_counter;
        state.transactions_16.insert(
            transaction_id,
            Transaction16 {
                connector_id: req.connector_id,
                id_tag: req.id_tag,
                meter_start: req.meter_start,
                timestamp: req.timestamp,
                state: TxState16::Active,
                stop: None,
            },
        );
        state
            .active_by_connector
            .insert(req.connector_id, ActiveTx::V16(transaction_id));

        Ok(StartOutcome {
            transaction_id,
            idempotent: false,
        })
    }

    pub fn stop_transaction(
        &self,
        charge_point_id: &str,
        req: StopTxRequest,
    ) -> Result<StopOutcome, StateViolation> {
        let mut state = self.chargers.entry(charge_point_id.to_string()).or_default();

        let Some(tx) = state.transactions_16.get(&req.transaction_id).cloned() else {
            return Err(StateViolation::occurrence("Unknown transaction"));
        };

        if tx.state == TxState16::Stopped {
            let stop = StopRecord {
                meter_stop: req.meter_stop,
                timestamp: req.timestamp,
            };
            if tx.stop.as_ref() == Some(&stop) {
                return Ok(StopOutcome { idempotent: true });
            }
            return Err(StateViolation::occurrence(
                "Transaction already stopped with different values",
            ));
        }

        let connector_id = tx.connector_id;
        if let Some(tx) = state.transactions_16.get_mut(&req.transaction_id) {
            tx.state = TxState16::Stopped;
            tx.stop = Some(StopRecord {
                meter_stop: req.meter_stop,
                timestamp: req.timestamp,
            });
        }
        state.active_by_connector.remove(&connector_id);

        Ok(StopOutcome { idempotent: false })
    }

    pub fn meter_values(
        &self,
        charge_point_id: &str,
        transaction_id: Option<i64>,
    ) -> Result<MeterValuesOutcome, StateViolation> {
        let Some(transaction_id) = transaction_id else {
            return Ok(MeterValuesOutcome { orphaned: false });
        };
        let known = self
            .chargers
            .get(charge_point_id)
            .is_some_and(|s| s.transactions_16.contains_key(&transaction_id));
        if known {
            return Ok(MeterValuesOutcome { orphaned: false });
        }
        if self.lenient {
            return Ok(MeterValuesOutcome { orphaned: true });
        }
        Err(StateViolation::occurrence("Unknown transaction"))
    }

    // ── 2.x transactions ───────────────────────────────────

    pub fn transaction_event(
        &self,
        charge_point_id: &str,
        req: TxEventRequest,
    ) -> Result<TxEventOutcome, StateViolation> {
        let mut state = self.chargers.entry(charge_point_id.to_string()).or_default();
        let active_key = req.connector_id.or(req.evse_id);

        if let Some(existing) = state.transactions_2x.get(&req.transaction_id) {
            // Replays and reordered deliveries: no state change.
            if req.seq_no <= existing.last_seq_no {
                return Ok(TxEventOutcome { idempotent: true });
            }
        } else {
            match req.event_type {
                TxEventType::Started => {}
                TxEventType::Updated | TxEventType::Ended if self.lenient => {}
                TxEventType::Updated | TxEventType::Ended => {
                    return Err(StateViolation::occurrence("Unknown transaction"));
                }
            }
        }

        let idempotent = match req.event_type {
            // A repeated Started for a known transaction is acknowledged
            // without re-creating anything.
            TxEventType::Started => state.transactions_2x.contains_key(&req.transaction_id),
            _ => false,
        };

        let tx = state
            .transactions_2x
            .entry(req.transaction_id.clone())
            .or_insert_with(|| Transaction2x {
                evse_id: req.evse_id,
                connector_id: req.connector_id,
                id_token: req.id_token.clone(),
                started_at: req.timestamp.clone(),
                state: TxState2x::Active,
                last_seq_no: 0,
            });
        tx.last_seq_no = req.seq_no;
        if req.event_type == TxEventType::Ended {
            tx.state = TxState2x::Ended;
        }
        let tx_connector = tx.connector_id.or(tx.evse_id);

        match req.event_type {
            TxEventType::Started => {
                if let Some(key) = active_key {
                    state
                        .active_by_connector
                        .insert(key, ActiveTx::V2x(req.transaction_id.clone()));
                }
            }
            TxEventType::Ended => {
                if let Some(key) = active_key.or(tx_connector) {
                    state.active_by_connector.remove(&key);
                }
            }
            TxEventType::Updated => {}
        }

        Ok(TxEventOutcome { idempotent })
    }

    #[cfg(test)]
    fn active_transaction(&self, charge_point_id: &str, connector_id: u64) -> Option<String> {
        self.chargers.get(charge_point_id).and_then(|s| {
            s.active_by_connector.get(&connector_id).map(|a| match a {
                ActiveTx::V16(id) => id.to_string(),
                ActiveTx::V2x(id) => id.clone(),
            })
        })
    }
}
