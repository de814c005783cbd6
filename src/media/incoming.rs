use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::media::{PeerId, PendingCall};

/// Incoming offers nobody has claimed yet, at most one per remote peer.
///
/// Storing never blocks, so the signaling dispatcher keeps delivering answers
/// and candidates however many offers pile up.
#[derive(Default)]
pub(crate) struct IncomingOffers {
    offers: Mutex<HashMap<PeerId, Box<dyn PendingCall>>>,
    arrived: Notify,
    closed: AtomicBool,
}

impl IncomingOffers {
    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Box<dyn PendingCall>>> {
        self.offers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `offer`, handing back an older offer from the same peer.
    pub fn push(&self, offer: Box<dyn PendingCall>) -> Option<Box<dyn PendingCall>> {
        let replaced = self.lock().insert(offer.peer().clone(), offer);
        self.arrived.notify_waiters();
        replaced
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Waits for the offer of `from`. Offers from anyone else are declined.
    /// Returns `None` once closed.
    pub async fn claim(&self, from: &PeerId) -> Option<Box<dyn PendingCall>> {
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let (claimed, others) = {
                let mut offers = self.lock();
                let claimed = offers.remove(from);
                let others: Vec<_> = offers.drain().map(|(_, offer)| offer).collect();
                (claimed, others)
            };
            for offer in others {
                warn!("Declining media call from unexpected peer {}", offer.peer());
                offer.decline().await;
            }
            if claimed.is_some() {
                return claimed;
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            arrived.await;
        }
    }

    /// Declines every unclaimed offer.
    pub async fn discard(&self) {
        let offers: Vec<_> = self.lock().drain().map(|(_, offer)| offer).collect();
        for offer in offers {
            debug!("Discarding stale offer from {}", offer.peer());
            offer.decline().await;
        }
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.arrived.notify_waiters();
        self.discard().await;
    }
}
