//! Admission control for in-flight records.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// What to do with a record when every slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Do not wait; the record goes straight to the fallback tiers.
    #[default]
    Reject,
    /// Wait for a slot to free up.
    Wait,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// Fixed-capacity gate over concurrently processed records.
#[derive(Clone)]
pub struct Admission {
    semaphore: Arc<Semaphore>,
    policy: AdmissionPolicy,
    capacity: usize,
    counters: Arc<Counters>,
}

impl Admission {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: AdmissionPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            policy,
            capacity,
            counters: Arc::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Take a slot according to the policy. `None` means rejected.
    pub async fn admit(&self) -> Option<Slot> {
        let permit = match self.policy {
            AdmissionPolicy::Reject => Arc::clone(&self.semaphore).try_acquire_owned().ok()?,
            AdmissionPolicy::Wait => Arc::clone(&self.semaphore).acquire_owned().await.ok()?,
        };

        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);

        Some(Slot {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of slots held at once.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }
}

/// A held slot; released on drop, whatever the outcome of the work.
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reject_when_full() {
        let admission = Admission::new(2, AdmissionPolicy::Reject);

        let a = admission.admit().await;
        let b = admission.admit().await;
        let c = admission.admit().await;

        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
        assert_eq!(admission.in_flight(), 2);

        drop(a);
        assert!(admission.admit().await.is_some());
        assert_eq!(admission.acquired(), 3);
        assert_eq!(admission.released(), 2);
        assert_eq!(admission.peak(), 2);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_release() {
        let admission = Admission::new(1, AdmissionPolicy::Wait);
        let held = admission.admit().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.admit().await.is_some() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap());
        assert_eq!(admission.peak(), 1);
    }

    #[test]
    fn test_zero_capacity_raised_to_one() {
        assert_eq!(Admission::new(0, AdmissionPolicy::Reject).capacity(), 1);
    }

    #[test]
    fn test_policy_deserializes_lowercase() {
        let policy: AdmissionPolicy = serde_json::from_str("\"wait\"").unwrap();
        assert_eq!(policy, AdmissionPolicy::Wait);
    }
}
