//! Sequence number allocation for proposal keys
//!
//! Handles:
//! - Local sequence tracking so concurrent submissions never share a number
//! - Release of reservations that were never accepted
//! - Resynchronization with the ledger after a conflict

use crate::error::HarnessResult;
use crate::ledger::{current_sequence_number, LedgerClient};
use crate::types::{KeyId, TransactionId};

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Sequence number handed out for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub key: KeyId,
    pub sequence_number: u64,
}

/// Why a reservation is given back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Failed before reaching the ledger
    Unsent,
    /// Ledger reported a sequence mismatch
    SequenceConflict,
    /// Ledger rejected the transaction for another reason
    Rejected,
    /// Transaction expired before inclusion
    Expired,
}

/// Per-key sequence state
struct KeySequenceState {
    /// Next sequence number to hand out
    next: u64,
    /// Reserved and not yet sealed: sequence -> submitted transaction
    outstanding: BTreeMap<u64, Option<TransactionId>>,
    /// Highest sequence number known to be consumed
    confirmed: Option<u64>,
    /// Reservations the ledger rejected
    rejections: u64,
    /// Next allocation must re-read the ledger first
    needs_resync: bool,
}

impl KeySequenceState {
    fn new(observed: u64) -> Self {
        Self {
            next: observed,
            outstanding: BTreeMap::new(),
            confirmed: observed.checked_sub(1),
            rejections: 0,
            needs_resync: false,
        }
    }

    /// Lowest number at or above `from` that is not outstanding
    fn first_free(&self, from: u64) -> u64 {
        let mut candidate = from;
        for seq in self.outstanding.range(from..).map(|(seq, _)| *seq) {
            if seq != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }
}

/// Point-in-time view of a key's allocator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSnapshot {
    pub next: u64,
    pub outstanding: Vec<u64>,
    pub confirmed: Option<u64>,
    pub rejections: u64,
}

/// Hands out sequence numbers per proposal key
pub struct SequenceNumberAllocator {
    ledger: Arc<dyn LedgerClient>,
    keys: DashMap<KeyId, Arc<Mutex<Option<KeySequenceState>>>>,
}

impl SequenceNumberAllocator {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            ledger,
            keys: DashMap::new(),
        }
    }

    fn slot(&self, key: KeyId) -> Arc<Mutex<Option<KeySequenceState>>> {
        self.keys.entry(key).or_default().clone()
    }

    /// Reserve the next sequence number for `key`.
    ///
    /// The first reservation for a key reads the ledger; later ones are local
    /// unless a release or conflict flagged the key for resynchronization.
    /// Numbers still outstanding are skipped.
    pub async fn allocate(&self, key: KeyId) -> HarnessResult<Reservation> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        let state = match guard.take() {
            Some(state) => state,
            None => {
                let observed = self.fetch(key).await?;
                debug!("Initialized sequence for key {}: {}", key, observed);
                KeySequenceState::new(observed)
            }
        };
        let state = guard.insert(state);

        if state.needs_resync {
            self.resync_locked(key, state).await?;
        }

        let sequence_number = state.first_free(state.next);
        state.next = sequence_number + 1;
        state.outstanding.insert(sequence_number, None);

        debug!("Allocated sequence {} for key {}", sequence_number, key);
        Ok(Reservation {
            key,
            sequence_number,
        })
    }

    /// Record the transaction submitted with a reservation
    pub async fn mark_submitted(&self, reservation: &Reservation, id: TransactionId) {
        let slot = self.slot(reservation.key);
        let mut guard = slot.lock().await;
        if let Some(state) = guard.as_mut() {
            state
                .outstanding
                .insert(reservation.sequence_number, Some(id));
        }
    }

    /// Transaction sealed: its sequence number is consumed
    pub async fn confirm(&self, reservation: &Reservation) {
        let slot = self.slot(reservation.key);
        let mut guard = slot.lock().await;
        if let Some(state) = guard.as_mut() {
            state.outstanding.remove(&reservation.sequence_number);
            if state
                .confirmed
                .map_or(true, |c| reservation.sequence_number > c)
            {
                state.confirmed = Some(reservation.sequence_number);
            }
        }
    }

    /// Give back a reservation that the ledger did not consume.
    ///
    /// The number is not handed out again directly; the next allocation
    /// re-reads the ledger and fills the lowest free number it still expects,
    /// so later in-flight transactions are not left waiting on the gap.
    pub async fn release(&self, reservation: &Reservation, reason: ReleaseReason) {
        let slot = self.slot(reservation.key);
        let mut guard = slot.lock().await;
        let Some(state) = guard.as_mut() else {
            return;
        };

        state.outstanding.remove(&reservation.sequence_number);
        if reason == ReleaseReason::Rejected {
            state.rejections += 1;
        }
        state.needs_resync = true;

        debug!(
            "Released sequence {} for key {} ({:?})",
            reservation.sequence_number, reservation.key, reason
        );
    }

    /// Re-read the ledger's sequence number for `key` and adjust local state
    pub async fn resync(&self, key: KeyId) -> HarnessResult<u64> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        let state = match guard.take() {
            Some(state) => state,
            None => KeySequenceState::new(self.fetch(key).await?),
        };
        let state = guard.insert(state);
        self.resync_locked(key, state).await
    }

    /// Start `key` at a known sequence number, e.g. from an external cache
    pub async fn seed(&self, key: KeyId, next: u64) {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        let state = guard.get_or_insert_with(|| KeySequenceState::new(next));
        state.next = next;
        state.needs_resync = false;
        debug!("Seeded sequence for key {}: {}", key, next);
    }

    pub async fn snapshot(&self, key: KeyId) -> Option<SequenceSnapshot> {
        let slot = self.keys.get(&key).map(|s| s.clone())?;
        let guard = slot.lock().await;
        guard.as_ref().map(|state| SequenceSnapshot {
            next: state.next,
            outstanding: state.outstanding.keys().copied().collect(),
            confirmed: state.confirmed,
            rejections: state.rejections,
        })
    }

    async fn resync_locked(&self, key: KeyId, state: &mut KeySequenceState) -> HarnessResult<u64> {
        let observed = self.fetch(key).await?;

        // Anything below the ledger's number has been consumed
        state.outstanding.retain(|seq, _| *seq >= observed);
        if let Some(consumed) = observed.checked_sub(1) {
            state.confirmed = Some(state.confirmed.map_or(consumed, |c| c.max(consumed)));
        }

        // The ledger seals in order, so the lowest free number at or above
        // its current one must be filled before anything above it can seal
        let next = state.first_free(observed);

        if next != state.next {
            if observed > state.next {
                warn!(
                    "Sequence gap for key {}: local {}, ledger {}",
                    key, state.next, observed
                );
            }
            info!(
                "Resynced key {}: next sequence {} -> {} (ledger {})",
                key, state.next, next, observed
            );
        }

        state.next = next;
        state.needs_resync = false;
        crate::metrics::record_sequence_resync();

        Ok(next)
    }

    async fn fetch(&self, key: KeyId) -> HarnessResult<u64> {
        Ok(current_sequence_number(self.ledger.as_ref(), key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{
        Account, AccountKey, HashAlgorithm, MockLedgerClient, SignatureAlgorithm,
        KEY_WEIGHT_THRESHOLD,
    };
    use crate::types::Address;
    use futures::future::join_all;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn key() -> KeyId {
        KeyId::new(Address::from_index(1), 0)
    }

    fn account(sequence_number: u64) -> Account {
        Account {
            address: key().address,
            keys: vec![AccountKey {
                index: 0,
                public_key: vec![0; 32],
                sign_algo: SignatureAlgorithm::Ed25519,
                hash_algo: HashAlgorithm::Sha3_256,
                weight: KEY_WEIGHT_THRESHOLD,
                sequence_number,
                revoked: false,
            }],
            contracts: Default::default(),
        }
    }

    /// Ledger whose key sequence is read from `observed`
    fn ledger(observed: Arc<AtomicU64>, reads: Arc<AtomicUsize>) -> Arc<dyn LedgerClient> {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_get_account().returning(move |_| {
            reads.fetch_add(1, Ordering::SeqCst);
            Ok(account(observed.load(Ordering::SeqCst)))
        });
        Arc::new(ledger)
    }

    #[tokio::test]
    async fn test_first_allocation_reads_ledger_then_counts_locally() {
        let reads = Arc::new(AtomicUsize::new(0));
        let allocator =
            SequenceNumberAllocator::new(ledger(Arc::new(AtomicU64::new(5)), reads.clone()));

        assert_eq!(allocator.allocate(key()).await.unwrap().sequence_number, 5);
        assert_eq!(allocator.allocate(key()).await.unwrap().sequence_number, 6);
        assert_eq!(allocator.allocate(key()).await.unwrap().sequence_number, 7);
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        let snapshot = allocator.snapshot(key()).await.unwrap();
        assert_eq!(snapshot.outstanding, vec![5, 6, 7]);
        assert_eq!(snapshot.confirmed, Some(4));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique_and_contiguous() {
        let allocator = Arc::new(SequenceNumberAllocator::new(ledger(
            Arc::new(AtomicU64::new(10)),
            Arc::new(AtomicUsize::new(0)),
        )));

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move { allocator.allocate(key()).await.unwrap() })
            })
            .collect();

        let numbers: Vec<u64> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().sequence_number)
            .collect();

        let unique: HashSet<_> = numbers.iter().copied().collect();
        assert_eq!(unique.len(), 64);
        assert_eq!(*numbers.iter().min().unwrap(), 10);
        assert_eq!(*numbers.iter().max().unwrap(), 73);
    }

    #[tokio::test]
    async fn test_released_gap_is_reused_when_ledger_still_expects_it() {
        let observed = Arc::new(AtomicU64::new(0));
        let allocator =
            SequenceNumberAllocator::new(ledger(observed.clone(), Arc::new(AtomicUsize::new(0))));

        let first = allocator.allocate(key()).await.unwrap();
        allocator.release(&first, ReleaseReason::Unsent).await;

        // Ledger never saw 0, so it is handed out again
        assert_eq!(allocator.allocate(key()).await.unwrap().sequence_number, 0);
    }

    #[tokio::test]
    async fn test_released_gap_below_in_flight_is_filled_first() {
        let observed = Arc::new(AtomicU64::new(0));
        let allocator =
            SequenceNumberAllocator::new(ledger(observed.clone(), Arc::new(AtomicUsize::new(0))));

        let a = allocator.allocate(key()).await.unwrap();
        let b = allocator.allocate(key()).await.unwrap();
        allocator.release(&a, ReleaseReason::Rejected).await;

        // Ledger still expects 0, and b (1) cannot seal until it is filled
        let c = allocator.allocate(key()).await.unwrap();
        assert_eq!(b.sequence_number, 1);
        assert_eq!(c.sequence_number, 0);

        // b is still in flight, so it is skipped
        let d = allocator.allocate(key()).await.unwrap();
        assert_eq!(d.sequence_number, 2);

        let snapshot = allocator.snapshot(key()).await.unwrap();
        assert_eq!(snapshot.outstanding, vec![0, 1, 2]);
        assert_eq!(snapshot.rejections, 1);
    }

    #[tokio::test]
    async fn test_resync_skips_outstanding_run_above_ledger() {
        let observed = Arc::new(AtomicU64::new(0));
        let allocator =
            SequenceNumberAllocator::new(ledger(observed.clone(), Arc::new(AtomicUsize::new(0))));

        let mut reservations = Vec::new();
        for _ in 0..4 {
            reservations.push(allocator.allocate(key()).await.unwrap());
        }
        allocator
            .release(&reservations[2], ReleaseReason::Expired)
            .await;

        // 0 and 1 sealed meanwhile; 3 is still in flight
        observed.store(2, Ordering::SeqCst);
        assert_eq!(allocator.resync(key()).await.unwrap(), 2);
        assert_eq!(allocator.allocate(key()).await.unwrap().sequence_number, 2);
        assert_eq!(allocator.allocate(key()).await.unwrap().sequence_number, 4);

        let snapshot = allocator.snapshot(key()).await.unwrap();
        assert_eq!(snapshot.outstanding, vec![2, 3, 4]);
        assert_eq!(snapshot.confirmed, Some(1));
    }

    #[tokio::test]
    async fn test_resync_after_external_submission() {
        let observed = Arc::new(AtomicU64::new(3));
        let allocator =
            SequenceNumberAllocator::new(ledger(observed.clone(), Arc::new(AtomicUsize::new(0))));

        let stale = allocator.allocate(key()).await.unwrap();
        assert_eq!(stale.sequence_number, 3);

        // Another process consumed 3 and 4
        observed.store(5, Ordering::SeqCst);
        allocator
            .release(&stale, ReleaseReason::SequenceConflict)
            .await;
        assert_eq!(allocator.resync(key()).await.unwrap(), 5);
        assert_eq!(allocator.allocate(key()).await.unwrap().sequence_number, 5);
    }

    #[tokio::test]
    async fn test_seed_overrides_initial_read() {
        let reads = Arc::new(AtomicUsize::new(0));
        let allocator =
            SequenceNumberAllocator::new(ledger(Arc::new(AtomicU64::new(9)), reads.clone()));

        allocator.seed(key(), 4).await;
        assert_eq!(allocator.allocate(key()).await.unwrap().sequence_number, 4);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_confirm_moves_high_water_mark() {
        let allocator = SequenceNumberAllocator::new(ledger(
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicUsize::new(0)),
        ));

        let a = allocator.allocate(key()).await.unwrap();
        let b = allocator.allocate(key()).await.unwrap();
        allocator.confirm(&b).await;
        allocator.confirm(&a).await;

        let snapshot = allocator.snapshot(key()).await.unwrap();
        assert_eq!(snapshot.confirmed, Some(1));
        assert!(snapshot.outstanding.is_empty());
        assert_eq!(snapshot.next, 2);
    }
}
