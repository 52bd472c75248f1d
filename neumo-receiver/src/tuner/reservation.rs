//! Exclusive and shared use of tuners.
//!
//! Every adapter has a semaphore with [`MAX_SHARED_USERS`] permits:
//! - **Exclusive**: takes all permits. Needed to send tune or DiSEqC commands.
//! - **Shared**: takes one permit, and only while the adapter is tuned to the
//!   requested mux. Many subscribers watching one mux share the adapter.
//!
//! A [`Reservation`] releases its permits when dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use neumo_protocol::AnyMux;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Maximum number of shared users of one adapter.
pub const MAX_SHARED_USERS: u32 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReservationError {
    /// The adapter is tuned to a different mux.
    #[error("Adapter {0} is tuned to a different mux")]
    MuxMismatch(u32),

    /// Nothing was tuned yet; an exclusive reservation is needed first.
    #[error("Adapter {0} is not tuned")]
    NotTuned(u32),

    #[error("No adapter {0}")]
    UnknownAdapter(u32),

    /// The adapter is in use and the caller did not want to wait.
    #[error("Adapter {0} is busy")]
    Busy(u32),

    /// No adapter can be reserved for the request.
    #[error("No free adapter")]
    NoFreeAdapter,

    #[error("Reservations closed")]
    Closed,
}

struct AdapterSlot {
    adapter_no: u32,
    semaphore: Arc<Semaphore>,
    /// Mux set by the exclusive holder; shared users must match it.
    current: RwLock<Option<AnyMux>>,
    shared_count: AtomicU32,
}

impl AdapterSlot {
    fn new(adapter_no: u32) -> Self {
        Self {
            adapter_no,
            semaphore: Arc::new(Semaphore::new(MAX_SHARED_USERS as usize)),
            current: RwLock::new(None),
            shared_count: AtomicU32::new(0),
        }
    }

    fn is_reserved(&self) -> bool {
        self.semaphore.available_permits() < MAX_SHARED_USERS as usize
    }

    fn check_mux(&self, mux: &AnyMux) -> Result<(), ReservationError> {
        match &*self.current.read() {
            Some(current) if current.matches_physical(mux) => Ok(()),
            Some(_) => Err(ReservationError::MuxMismatch(self.adapter_no)),
            None => Err(ReservationError::NotTuned(self.adapter_no)),
        }
    }
}

/// Reservation bookkeeping of all adapters.
pub struct TunerReservations {
    slots: Vec<Arc<AdapterSlot>>,
}

impl TunerReservations {
    pub fn new(adapters: impl IntoIterator<Item = u32>) -> Self {
        Self {
            slots: adapters.into_iter().map(|n| Arc::new(AdapterSlot::new(n))).collect(),
        }
    }

    fn slot(&self, adapter_no: u32) -> Result<&Arc<AdapterSlot>, ReservationError> {
        self.slots
            .iter()
            .find(|s| s.adapter_no == adapter_no)
            .ok_or(ReservationError::UnknownAdapter(adapter_no))
    }

    pub fn adapters(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().map(|s| s.adapter_no)
    }

    /// Wait until every other user released the adapter, then take it.
    pub async fn reserve_exclusive(&self, adapter_no: u32) -> Result<Reservation, ReservationError> {
        let slot = self.slot(adapter_no)?.clone();
        let permit = slot
            .semaphore
            .clone()
            .acquire_many_owned(MAX_SHARED_USERS)
            .await
            .map_err(|_| ReservationError::Closed)?;
        Ok(Reservation::exclusive(slot, permit))
    }

    pub fn try_reserve_exclusive(&self, adapter_no: u32) -> Result<Reservation, ReservationError> {
        let slot = self.slot(adapter_no)?.clone();
        let permit = slot
            .semaphore
            .clone()
            .try_acquire_many_owned(MAX_SHARED_USERS)
            .map_err(|_| ReservationError::Busy(adapter_no))?;
        Ok(Reservation::exclusive(slot, permit))
    }

    /// Join an adapter that is already tuned to `mux`.
    pub fn try_reserve_shared(&self, adapter_no: u32, mux: &AnyMux) -> Result<Reservation, ReservationError> {
        let slot = self.slot(adapter_no)?.clone();
        slot.check_mux(mux)?;
        let permit = slot
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| ReservationError::Busy(adapter_no))?;
        Ok(Reservation::shared(slot, permit))
    }

    /// Reserve an adapter for `mux`, preferring one already tuned to it.
    ///
    /// `usable` filters adapters that cannot receive the mux at all.
    pub fn reserve_for(
        &self,
        mux: &AnyMux,
        usable: impl Fn(u32) -> bool,
    ) -> Result<Reservation, ReservationError> {
        for slot in self.slots.iter().filter(|s| usable(s.adapter_no)) {
            if slot.check_mux(mux).is_ok() {
                if let Ok(r) = self.try_reserve_shared(slot.adapter_no, mux) {
                    return Ok(r);
                }
            }
        }
        for slot in self.slots.iter().filter(|s| usable(s.adapter_no)) {
            if let Ok(r) = self.try_reserve_exclusive(slot.adapter_no) {
                return Ok(r);
            }
        }
        Err(ReservationError::NoFreeAdapter)
    }

    pub fn is_reserved(&self, adapter_no: u32) -> bool {
        self.slot(adapter_no).map_or(false, |s| s.is_reserved())
    }

    pub fn shared_count(&self, adapter_no: u32) -> u32 {
        self.slot(adapter_no)
            .map_or(0, |s| s.shared_count.load(Ordering::SeqCst))
    }

    pub fn current_mux(&self, adapter_no: u32) -> Option<AnyMux> {
        self.slot(adapter_no).ok().and_then(|s| s.current.read().clone())
    }

    /// Forget the tuned mux of an adapter nobody holds, so no one joins a
    /// stopped tune. Returns false while the adapter is reserved.
    pub fn forget_mux(&self, adapter_no: u32) -> bool {
        match self.slot(adapter_no) {
            Ok(slot) if !slot.is_reserved() => {
                *slot.current.write() = None;
                true
            }
            _ => false,
        }
    }

    /// Adapters that nobody holds.
    pub fn idle_adapters(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|s| !s.is_reserved())
            .map(|s| s.adapter_no)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationKind {
    Exclusive,
    Shared,
}

/// Holds an adapter until dropped.
pub struct Reservation {
    slot: Arc<AdapterSlot>,
    permit: Option<OwnedSemaphorePermit>,
    kind: ReservationKind,
}

impl Reservation {
    fn exclusive(slot: Arc<AdapterSlot>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            slot,
            permit: Some(permit),
            kind: ReservationKind::Exclusive,
        }
    }

    fn shared(slot: Arc<AdapterSlot>, permit: OwnedSemaphorePermit) -> Self {
        slot.shared_count.fetch_add(1, Ordering::SeqCst);
        Self {
            slot,
            permit: Some(permit),
            kind: ReservationKind::Shared,
        }
    }

    pub fn adapter_no(&self) -> u32 {
        self.slot.adapter_no
    }

    pub fn kind(&self) -> ReservationKind {
        self.kind
    }

    pub fn is_exclusive(&self) -> bool {
        self.kind == ReservationKind::Exclusive
    }

    pub fn mux(&self) -> Option<AnyMux> {
        self.slot.current.read().clone()
    }

    /// Record the mux the adapter is tuned to. Only the exclusive holder may.
    pub fn set_mux(&self, mux: Option<AnyMux>) -> bool {
        if self.is_exclusive() {
            *self.slot.current.write() = mux;
            true
        } else {
            false
        }
    }

    /// Turn an exclusive reservation into a shared one on `mux`, letting
    /// others on the same mux join.
    pub fn downgrade(mut self, mux: AnyMux) -> Reservation {
        if !self.is_exclusive() {
            return self;
        }
        *self.slot.current.write() = Some(mux);
        let Some(mut permit) = self.permit.take() else {
            return self;
        };
        // give back everything except one permit
        if let Some(rest) = permit.split(MAX_SHARED_USERS as usize - 1) {
            drop(rest);
        }
        let slot = self.slot.clone();
        Reservation::shared(slot, permit)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.permit.take().is_some() && self.kind == ReservationKind::Shared {
            self.slot.shared_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("adapter_no", &self.slot.adapter_no)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_util::tuned_mux;

    fn other_mux() -> AnyMux {
        let mut m = tuned_mux();
        m.set_frequency(12_188_000);
        m
    }

    #[tokio::test]
    async fn test_exclusive_reservation() {
        let res = TunerReservations::new([0, 1]);
        let r = res.reserve_exclusive(0).await.unwrap();
        assert!(res.is_reserved(0));
        assert_eq!(res.idle_adapters(), vec![1]);
        assert_eq!(res.try_reserve_exclusive(0).unwrap_err(), ReservationError::Busy(0));
        drop(r);
        assert!(!res.is_reserved(0));
        assert_eq!(
            res.try_reserve_exclusive(7).unwrap_err(),
            ReservationError::UnknownAdapter(7)
        );
    }

    #[tokio::test]
    async fn test_shared_needs_same_mux() {
        let res = TunerReservations::new([0]);
        let mux = tuned_mux();
        assert_eq!(
            res.try_reserve_shared(0, &mux).unwrap_err(),
            ReservationError::NotTuned(0)
        );
        {
            let r = res.reserve_exclusive(0).await.unwrap();
            assert!(r.set_mux(Some(mux.clone())));
        }
        let a = res.try_reserve_shared(0, &mux).unwrap();
        let b = res.try_reserve_shared(0, &mux).unwrap();
        assert!(!a.set_mux(None));
        assert_eq!(res.shared_count(0), 2);
        assert_eq!(
            res.try_reserve_shared(0, &other_mux()).unwrap_err(),
            ReservationError::MuxMismatch(0)
        );
        // exclusive use waits for the sharers
        assert!(res.try_reserve_exclusive(0).is_err());
        drop(a);
        drop(b);
        assert_eq!(res.shared_count(0), 0);
        assert!(res.try_reserve_exclusive(0).is_ok());
    }

    #[tokio::test]
    async fn test_downgrade_lets_others_join() {
        let res = TunerReservations::new([0]);
        let mux = tuned_mux();
        let r = res.reserve_exclusive(0).await.unwrap();
        let shared = r.downgrade(mux.clone());
        assert!(!shared.is_exclusive());
        assert_eq!(res.shared_count(0), 1);
        let other = res.try_reserve_shared(0, &mux).unwrap();
        assert_eq!(res.shared_count(0), 2);
        assert_eq!(res.current_mux(0), Some(mux));
        assert!(!res.forget_mux(0));
        drop(shared);
        drop(other);
        assert!(!res.is_reserved(0));
        assert!(res.forget_mux(0));
        assert_eq!(
            res.try_reserve_shared(0, &tuned_mux()).unwrap_err(),
            ReservationError::NotTuned(0)
        );
    }

    #[tokio::test]
    async fn test_reserve_for_prefers_tuned_adapter() {
        let res = TunerReservations::new([0, 1]);
        let mux = tuned_mux();
        let first = res.reserve_exclusive(1).await.unwrap().downgrade(mux.clone());

        let second = res.reserve_for(&mux, |_| true).unwrap();
        assert_eq!(second.adapter_no(), 1);
        assert!(!second.is_exclusive());

        let third = res.reserve_for(&other_mux(), |_| true).unwrap();
        assert_eq!(third.adapter_no(), 0);
        assert!(third.is_exclusive());

        assert_eq!(
            res.reserve_for(&other_mux(), |n| n == 0).unwrap_err(),
            ReservationError::NoFreeAdapter
        );
        drop((first, second, third));
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_release() {
        let res = Arc::new(TunerReservations::new([0]));
        let mux = tuned_mux();
        res.reserve_exclusive(0).await.unwrap().set_mux(Some(mux.clone()));
        let shared = res.try_reserve_shared(0, &mux).unwrap();

        let waiter = {
            let res = res.clone();
            tokio::spawn(async move { res.reserve_exclusive(0).await.map(|r| r.adapter_no()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(shared);
        assert_eq!(waiter.await.unwrap(), Ok(0));
    }
}
