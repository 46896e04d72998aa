use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::LedgerError;
use crate::models::{MirrorPosition, PositionKey};

/// Bound on the processed-fill id window; oldest ids are evicted first.
const PROCESSED_FILLS_CAP: usize = 4096;

/// Shares below this count treat a mirror position as closed.
pub const DUST_SHARES: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

/// Authoritative record of mirrored positions and exposure.
///
/// All mutation goes through a single mutex so a `reserve` observes every
/// prior commit. Reservations hold capacity for in-flight orders, which keeps
/// two concurrently-arriving fills from jointly breaching a limit: the checks
/// count reserved-but-uncommitted amounts as spent.
#[derive(Clone)]
pub struct ExposureLedger {
    inner: Arc<Mutex<LedgerInner>>,
    max_total_exposure: Decimal,
}

struct LedgerInner {
    positions: HashMap<PositionKey, MirrorPosition>,
    per_leader: HashMap<String, Decimal>,
    reservations: HashMap<Uuid, Reservation>,
    processed_set: HashSet<String>,
    processed_order: VecDeque<String>,
}

struct Reservation {
    leader: String,
    amount: Decimal,
}

/// Handle for a successful reservation; consumed by `commit` or `release`.
#[derive(Debug)]
pub struct ReservationToken {
    id: Uuid,
    leader: String,
    amount: Decimal,
}

impl ReservationToken {
    pub fn amount(&self) -> Decimal {
        self.amount
    }
}

/// Why a reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveRejection {
    LeaderCapExceeded { would_be: Decimal, cap: Decimal },
    GlobalCapExceeded { would_be: Decimal, cap: Decimal },
}

impl std::fmt::Display for ReserveRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReserveRejection::LeaderCapExceeded { would_be, cap } => {
                write!(f, "exceeds allocated capital for trader: {would_be} > {cap}")
            }
            ReserveRejection::GlobalCapExceeded { would_be, cap } => {
                write!(f, "exceeds global exposure limit: {would_be} > {cap}")
            }
        }
    }
}

/// Read-only view handed to the risk manager's pure decision function.
#[derive(Debug, Clone)]
pub struct LedgerView {
    pub per_leader: HashMap<String, Decimal>,
    pub global: Decimal,
}

impl LedgerView {
    pub fn exposure_of(&self, leader: &str) -> Decimal {
        self.per_leader.get(leader).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Outcome of a position reduction.
#[derive(Debug, Clone)]
pub struct ReductionReport {
    pub sold_shares: Decimal,
    pub fraction: Decimal,
    /// Exposure released across all contributing leaders.
    pub freed_usd: Decimal,
    pub position_closed: bool,
}

/// Serialized ledger state for crash recovery. `processed_fills` is excluded;
/// the window is bounded and rebuilt from the audit log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub per_leader_exposure: HashMap<String, Decimal>,
    pub mirror_positions: Vec<MirrorPosition>,
}

impl ExposureLedger {
    pub fn new(max_total_exposure: Decimal) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerInner {
                positions: HashMap::new(),
                per_leader: HashMap::new(),
                reservations: HashMap::new(),
                processed_set: HashSet::new(),
                processed_order: VecDeque::new(),
            })),
            max_total_exposure,
        }
    }

    /// Pre-commit capacity check. Counts in-flight reservations as spent so
    /// concurrent fills cannot jointly breach a cap.
    pub async fn reserve(
        &self,
        leader: &str,
        allocated_capital: Decimal,
        amount: Decimal,
    ) -> Result<ReservationToken, ReserveRejection> {
        let mut inner = self.inner.lock().await;

        let leader_pending: Decimal = inner
            .reservations
            .values()
            .filter(|r| r.leader == leader)
            .map(|r| r.amount)
            .sum();
        let leader_exposure = inner.per_leader.get(leader).copied().unwrap_or(Decimal::ZERO);
        let leader_would_be = leader_exposure + leader_pending + amount;
        if leader_would_be > allocated_capital {
            return Err(ReserveRejection::LeaderCapExceeded {
                would_be: leader_would_be,
                cap: allocated_capital,
            });
        }

        let total_pending: Decimal = inner.reservations.values().map(|r| r.amount).sum();
        let global: Decimal = inner.per_leader.values().copied().sum();
        let global_would_be = global + total_pending + amount;
        if global_would_be > self.max_total_exposure {
            return Err(ReserveRejection::GlobalCapExceeded {
                would_be: global_would_be,
                cap: self.max_total_exposure,
            });
        }

        let id = Uuid::new_v4();
        inner.reservations.insert(
            id,
            Reservation {
                leader: leader.to_string(),
                amount,
            },
        );
        tracing::debug!(leader = %leader, amount = %amount, "Ledger: reserved");
        Ok(ReservationToken {
            id,
            leader: leader.to_string(),
            amount,
        })
    }

    /// Finalize a filled BUY mirror: exposure moves from reserved to
    /// committed, the position is created or extended, and the fill id is
    /// marked processed.
    pub async fn commit(
        &self,
        token: ReservationToken,
        trade_id: &str,
        market: &str,
        token_id: &str,
        shares: Decimal,
        price: Decimal,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        let reservation = inner
            .reservations
            .remove(&token.id)
            .ok_or(LedgerError::UnknownReservation(token.id))?;

        *inner
            .per_leader
            .entry(reservation.leader.clone())
            .or_insert(Decimal::ZERO) += reservation.amount;

        let now = Utc::now();
        let key: PositionKey = (market.to_string(), token_id.to_string());
        let position = inner.positions.entry(key).or_insert_with(|| MirrorPosition {
            market: market.to_string(),
            token_id: token_id.to_string(),
            size: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            opened_at: now,
            last_updated_at: now,
            contributing_leaders: HashMap::new(),
        });

        let new_size = position.size + shares;
        if new_size > Decimal::ZERO {
            position.avg_entry_price =
                (position.size * position.avg_entry_price + shares * price) / new_size;
        }
        position.size = new_size;
        position.last_updated_at = now;
        *position
            .contributing_leaders
            .entry(reservation.leader.clone())
            .or_insert(Decimal::ZERO) += reservation.amount;

        mark_processed_inner(&mut inner, trade_id);

        tracing::debug!(
            leader = %token.leader,
            amount = %reservation.amount,
            shares = %shares,
            "Ledger: committed"
        );
        Ok(())
    }

    /// Roll back a reservation after an executor failure.
    pub async fn release(&self, token: ReservationToken) {
        let mut inner = self.inner.lock().await;
        if inner.reservations.remove(&token.id).is_some() {
            tracing::debug!(leader = %token.leader, amount = %token.amount, "Ledger: released");
        }
    }

    /// Reduce a mirror position after a SELL fill. Every contributing
    /// leader's exposure shrinks by its proportional share of the sold
    /// fraction; the position is removed when it falls below dust.
    pub async fn apply_reduction(
        &self,
        market: &str,
        token_id: &str,
        sold_shares: Decimal,
    ) -> Option<ReductionReport> {
        let mut inner = self.inner.lock().await;
        let key: PositionKey = (market.to_string(), token_id.to_string());
        let position = inner.positions.get_mut(&key)?;
        if position.size <= Decimal::ZERO {
            return None;
        }

        let sold = sold_shares.min(position.size);
        let fraction = (sold / position.size).min(Decimal::ONE);

        let mut freed = Decimal::ZERO;
        let deltas: Vec<(String, Decimal)> = position
            .contributing_leaders
            .iter()
            .map(|(leader, contribution)| (leader.clone(), *contribution * fraction))
            .collect();

        for (leader, delta) in &deltas {
            freed += *delta;
            if let Some(contribution) = position.contributing_leaders.get_mut(leader) {
                *contribution -= *delta;
            }
        }

        position.size -= sold;
        position.last_updated_at = Utc::now();
        let closed = position.size < DUST_SHARES;
        if closed {
            inner.positions.remove(&key);
        }

        for (leader, delta) in &deltas {
            if let Some(exposure) = inner.per_leader.get_mut(leader) {
                *exposure = (*exposure - *delta).max(Decimal::ZERO);
            }
        }

        Some(ReductionReport {
            sold_shares: sold,
            fraction,
            freed_usd: freed,
            position_closed: closed,
        })
    }

    /// Record a final verdict for a fill id (accepted or rejected). Returns
    /// false when the id was already present.
    pub async fn mark_processed(&self, trade_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        mark_processed_inner(&mut inner, trade_id)
    }

    pub async fn is_processed(&self, trade_id: &str) -> bool {
        self.inner.lock().await.processed_set.contains(trade_id)
    }

    pub async fn exposure_of(&self, leader: &str) -> Decimal {
        self.inner
            .lock()
            .await
            .per_leader
            .get(leader)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Global exposure is always derived, never stored.
    pub async fn global_exposure(&self) -> Decimal {
        self.inner.lock().await.per_leader.values().copied().sum()
    }

    pub async fn position_of(&self, market: &str, token_id: &str) -> Option<MirrorPosition> {
        self.inner
            .lock()
            .await
            .positions
            .get(&(market.to_string(), token_id.to_string()))
            .cloned()
    }

    pub async fn view(&self) -> LedgerView {
        let inner = self.inner.lock().await;
        LedgerView {
            per_leader: inner.per_leader.clone(),
            global: inner.per_leader.values().copied().sum(),
        }
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.inner.lock().await;
        LedgerSnapshot {
            per_leader_exposure: inner.per_leader.clone(),
            mirror_positions: inner.positions.values().cloned().collect(),
        }
    }

    pub async fn restore(&self, snapshot: LedgerSnapshot) {
        let mut inner = self.inner.lock().await;
        inner.per_leader = snapshot.per_leader_exposure;
        inner.positions = snapshot
            .mirror_positions
            .into_iter()
            .map(|p| (p.key(), p))
            .collect();
    }
}

fn mark_processed_inner(inner: &mut LedgerInner, trade_id: &str) -> bool {
    if !inner.processed_set.insert(trade_id.to_string()) {
        return false;
    }
    inner.processed_order.push_back(trade_id.to_string());
    while inner.processed_order.len() > PROCESSED_FILLS_CAP {
        if let Some(old) = inner.processed_order.pop_front() {
            inner.processed_set.remove(&old);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(n: i64) -> Decimal {
        Decimal::from(n)
    }

    #[tokio::test]
    async fn reserve_then_release_restores_exposure() {
        let ledger = ExposureLedger::new(dec(5000));
        let before_leader = ledger.exposure_of("a").await;
        let before_global = ledger.global_exposure().await;

        let token = ledger.reserve("a", dec(2000), dec(500)).await.unwrap();
        ledger.release(token).await;

        assert_eq!(ledger.exposure_of("a").await, before_leader);
        assert_eq!(ledger.global_exposure().await, before_global);

        // Full capacity is available again.
        assert!(ledger.reserve("a", dec(2000), dec(2000)).await.is_ok());
    }

    #[tokio::test]
    async fn reserve_rejects_over_leader_cap() {
        let ledger = ExposureLedger::new(dec(10_000));
        let t = ledger.reserve("a", dec(2000), dec(1500)).await.unwrap();
        ledger
            .commit(t, "f1", "m", "tok", dec(3000), Decimal::new(50, 2))
            .await
            .unwrap();

        let err = ledger.reserve("a", dec(2000), dec(600)).await.unwrap_err();
        assert!(matches!(err, ReserveRejection::LeaderCapExceeded { .. }));
    }

    #[tokio::test]
    async fn reserve_counts_pending_reservations() {
        let ledger = ExposureLedger::new(dec(5000));
        let _held = ledger.reserve("a", dec(3000), dec(3000)).await.unwrap();

        // Second leader alone fits, but pending + requested breaches global.
        let err = ledger.reserve("b", dec(3000), dec(3000)).await.unwrap_err();
        assert!(matches!(err, ReserveRejection::GlobalCapExceeded { .. }));
    }

    #[tokio::test]
    async fn reserve_at_exact_global_cap_passes_then_next_rejects() {
        let ledger = ExposureLedger::new(dec(1000));
        let t = ledger.reserve("a", dec(1000), dec(1000)).await.unwrap();
        ledger
            .commit(t, "f1", "m", "tok", dec(2000), Decimal::new(50, 2))
            .await
            .unwrap();

        assert_eq!(ledger.global_exposure().await, dec(1000));
        let err = ledger.reserve("b", dec(1000), dec(1)).await.unwrap_err();
        assert!(matches!(err, ReserveRejection::GlobalCapExceeded { .. }));
    }

    #[tokio::test]
    async fn commit_builds_position_with_weighted_entry() {
        let ledger = ExposureLedger::new(dec(5000));

        let t = ledger.reserve("a", dec(2000), dec(10)).await.unwrap();
        ledger
            .commit(t, "f1", "m", "tok", dec(20), Decimal::new(50, 2))
            .await
            .unwrap();

        let t = ledger.reserve("a", dec(2000), dec(12)).await.unwrap();
        ledger
            .commit(t, "f2", "m", "tok", dec(20), Decimal::new(60, 2))
            .await
            .unwrap();

        let pos = ledger.position_of("m", "tok").await.unwrap();
        assert_eq!(pos.size, dec(40));
        // (20*0.50 + 20*0.60) / 40 = 0.55
        assert_eq!(pos.avg_entry_price, Decimal::new(55, 2));
        assert_eq!(ledger.exposure_of("a").await, dec(22));
    }

    #[tokio::test]
    async fn commit_without_reservation_is_an_error() {
        let ledger = ExposureLedger::new(dec(5000));
        let token = ledger.reserve("a", dec(2000), dec(10)).await.unwrap();
        let fake = ReservationToken {
            id: Uuid::new_v4(),
            leader: "a".into(),
            amount: dec(10),
        };
        assert!(matches!(
            ledger
                .commit(fake, "f1", "m", "tok", dec(20), Decimal::new(50, 2))
                .await,
            Err(LedgerError::UnknownReservation(_))
        ));
        ledger.release(token).await;
    }

    #[tokio::test]
    async fn reduction_scales_all_contributors() {
        let ledger = ExposureLedger::new(dec(5000));

        let t = ledger.reserve("a", dec(2000), dec(100)).await.unwrap();
        ledger
            .commit(t, "f1", "m", "tok", dec(200), Decimal::new(50, 2))
            .await
            .unwrap();
        let t = ledger.reserve("b", dec(2000), dec(300)).await.unwrap();
        ledger
            .commit(t, "f2", "m", "tok", dec(600), Decimal::new(50, 2))
            .await
            .unwrap();

        let report = ledger
            .apply_reduction("m", "tok", dec(400))
            .await
            .unwrap();
        assert_eq!(report.fraction, Decimal::new(5, 1));
        assert_eq!(report.freed_usd, dec(200));
        assert!(!report.position_closed);

        assert_eq!(ledger.exposure_of("a").await, dec(50));
        assert_eq!(ledger.exposure_of("b").await, dec(150));
        assert_eq!(ledger.global_exposure().await, dec(200));
        assert_eq!(ledger.position_of("m", "tok").await.unwrap().size, dec(400));
    }

    #[tokio::test]
    async fn full_reduction_removes_position() {
        let ledger = ExposureLedger::new(dec(5000));
        let t = ledger.reserve("a", dec(2000), dec(10)).await.unwrap();
        ledger
            .commit(t, "f1", "m", "tok", dec(20), Decimal::new(50, 2))
            .await
            .unwrap();

        let report = ledger.apply_reduction("m", "tok", dec(20)).await.unwrap();
        assert!(report.position_closed);
        assert!(ledger.position_of("m", "tok").await.is_none());
        assert_eq!(ledger.exposure_of("a").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn reduction_without_position_is_none() {
        let ledger = ExposureLedger::new(dec(5000));
        assert!(ledger.apply_reduction("m", "tok", dec(5)).await.is_none());
    }

    #[tokio::test]
    async fn processed_fills_dedupe_and_evict() {
        let ledger = ExposureLedger::new(dec(5000));
        assert!(ledger.mark_processed("t1").await);
        assert!(!ledger.mark_processed("t1").await);
        assert!(ledger.is_processed("t1").await);

        for i in 0..PROCESSED_FILLS_CAP {
            ledger.mark_processed(&format!("fill-{i}")).await;
        }
        // Oldest id evicted once the window overflows.
        assert!(!ledger.is_processed("t1").await);
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let ledger = ExposureLedger::new(dec(5000));
        let t = ledger.reserve("a", dec(2000), dec(10)).await.unwrap();
        ledger
            .commit(t, "f1", "m", "tok", dec(20), Decimal::new(50, 2))
            .await
            .unwrap();

        let snap = ledger.snapshot().await;
        let restored = ExposureLedger::new(dec(5000));
        restored.restore(snap).await;

        assert_eq!(restored.exposure_of("a").await, dec(10));
        assert_eq!(restored.position_of("m", "tok").await.unwrap().size, dec(20));
    }
}
