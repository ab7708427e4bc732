//! Live arbitrage opportunities and the reaper that retires them.
//!
//! The scanner is the only writer of new observations, the execution gate only flips the
//! `scheduled` flag, and the reaper only removes.

use crate::arbitrage::triangle::Triangle;
use crate::audit::{AuditEvent, CompletedOpportunity, EventSink};
use crate::market::OrderRequest;
use crate::utils::float_to_string;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ArbitrageOpportunity {
    pub id: String,
    /// Triangle key plus the six-decimal profit
    pub key: String,
    pub triangle: Arc<Triangle>,
    pub profit_relative: f64,
    pub qty_before: f64,
    pub qty_after: f64,
    pub orders: [OrderRequest; 3],
    /// Free balances of coins A, B and C when first seen
    pub balances: [f64; 3],
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub frames_seen: u32,
    pub scheduled: bool,
}

/// What one scan cycle observed for a profitable triangle.
#[derive(Debug, Clone)]
pub struct Observation {
    pub triangle: Arc<Triangle>,
    pub profit_relative: f64,
    pub qty_before: f64,
    pub qty_after: f64,
    pub orders: [OrderRequest; 3],
    pub balances: [f64; 3],
}

impl Observation {
    pub fn key(&self) -> String {
        opportunity_key(&self.triangle.key, self.profit_relative)
    }
}

pub fn opportunity_key(triangle_key: &str, profit_relative: f64) -> String {
    format!("{}_{}", triangle_key, float_to_string(profit_relative))
}

impl ArbitrageOpportunity {
    pub fn to_completed(&self) -> CompletedOpportunity {
        CompletedOpportunity {
            id: self.id.clone(),
            key: self.key.clone(),
            triangle_key: self.triangle.key.clone(),
            coins: [
                self.triangle.coin_a.0.clone(),
                self.triangle.coin_b.0.clone(),
                self.triangle.coin_c.0.clone(),
            ],
            symbols: [
                self.triangle.pair_ab.symbol.clone(),
                self.triangle.pair_bc.symbol.clone(),
                self.triangle.pair_ac.symbol.clone(),
            ],
            profit_relative: self.profit_relative,
            qty_before: self.qty_before,
            qty_after: self.qty_after,
            orders: self.orders.to_vec(),
            balances: self.balances,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            lifetime_micros: (self.last_seen - self.first_seen)
                .num_microseconds()
                .unwrap_or(i64::MAX),
            frames_seen: self.frames_seen,
            scheduled: self.scheduled,
        }
    }
}

#[derive(Default)]
pub struct ArbitrageStateStore {
    entries: DashMap<String, ArbitrageOpportunity>,
}

impl ArbitrageStateStore {
    pub fn new() -> Self {
        ArbitrageStateStore {
            entries: DashMap::new(),
        }
    }

    /// Records an observation. A new key starts at zero frames; a known key has its last-seen
    /// time bumped and its frame count incremented. Returns the entry as it is after the update.
    pub fn upsert(&self, observation: Observation, now: DateTime<Utc>) -> ArbitrageOpportunity {
        let key = observation.key();
        let entry = self
            .entries
            .entry(key.clone())
            .and_modify(|opp| {
                opp.last_seen = now;
                opp.frames_seen = opp.frames_seen.saturating_add(1);
            })
            .or_insert_with(|| {
                debug!("New arb {} profit={:.6}", key, observation.profit_relative);
                ArbitrageOpportunity {
                    id: Uuid::new_v4().to_string(),
                    key: key.clone(),
                    triangle: observation.triangle,
                    profit_relative: observation.profit_relative,
                    qty_before: observation.qty_before,
                    qty_after: observation.qty_after,
                    orders: observation.orders,
                    balances: observation.balances,
                    first_seen: now,
                    last_seen: now,
                    frames_seen: 0,
                    scheduled: false,
                }
            });
        entry.value().clone()
    }

    pub fn get(&self, key: &str) -> Option<ArbitrageOpportunity> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Flags the entry for execution. False when it is unknown or was already flagged.
    pub fn mark_scheduled(&self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.scheduled => {
                entry.scheduled = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.entries.get(key).map(|e| e.scheduled).unwrap_or(false)
    }

    /// Removes every entry not seen since `now - threshold` and returns them.
    pub fn evict_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<ArbitrageOpportunity> {
        let threshold =
            ChronoDuration::from_std(threshold).unwrap_or_else(|_| ChronoDuration::max_value());
        let is_stale = |opp: &ArbitrageOpportunity| now - opp.last_seen > threshold;

        let stale_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| is_stale(e.value()))
            .map(|e| e.key().clone())
            .collect();

        stale_keys
            .into_iter()
            // Re-check under the shard lock: the scanner may have refreshed it meanwhile
            .filter_map(|key| self.entries.remove_if(&key, |_, opp| is_stale(opp)))
            .map(|(_, opp)| opp)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Periodically evicts stale opportunities and reports them as completed observations.
pub fn spawn_reaper(
    store: Arc<ArbitrageStateStore>,
    sink: Arc<dyn EventSink>,
    threshold: Duration,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reaper started: staleness threshold {:?}, tick {:?}", threshold, tick);
        let mut interval = tokio::time::interval(tick.max(Duration::from_micros(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for opp in store.evict_stale(Utc::now(), threshold) {
                        debug!("Arb {} gone after {} frames", opp.key, opp.frames_seen);
                        sink.emit(AuditEvent::ArbitrageCompleted(opp.to_completed()));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reaper stopped");
    })
}
