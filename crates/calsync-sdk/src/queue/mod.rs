//! Outbound sync queue
//!
//! Holds every operation the server has not acknowledged yet. Items leave the
//! active list once they reach a terminal status and stay in a bounded
//! "finished" list for the retention window so the UI can show recent
//! outcomes.
//!
//! Dequeue order is priority first, then insertion order. An item is never
//! handed out while an earlier unfinished item targets the same resource, so
//! a later edit cannot overtake an earlier one on the wire.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CalsyncError, Result};
use crate::utils::now_millis;

pub mod priority;
pub mod retry_policy;
pub mod sync_item;

pub use priority::SyncPriority;
pub use retry_policy::{RetryDecision, RetryPolicy};
pub use sync_item::{ResourceKey, SyncItemStatus, SyncItemType, SyncQueueItem};

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total_items: usize,
    pub pending_items: usize,
    pub processing_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    /// Active (pending + processing) items per priority
    pub priority_distribution: HashMap<SyncPriority, usize>,
}

/// Result of a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Back to pending, eligible again after `delay`
    Retrying { item: SyncQueueItem, delay: Duration },
    /// Retries exhausted or the error is not retryable
    Failed(SyncQueueItem),
}

#[derive(Debug)]
pub struct SyncQueue {
    /// Pending and processing items, kept sorted by (priority, sequence)
    active: Vec<SyncQueueItem>,
    /// Completed and failed items, oldest first
    finished: VecDeque<SyncQueueItem>,
    capacity: usize,
    retention: Duration,
    next_sequence: u64,
}

impl SyncQueue {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            active: Vec::new(),
            finished: VecDeque::new(),
            capacity,
            retention,
            next_sequence: 0,
        }
    }

    /// Add an item; fails with `QueueFull` when the active list is at capacity
    pub fn enqueue(&mut self, mut item: SyncQueueItem) -> Result<SyncQueueItem> {
        if self.active.len() >= self.capacity {
            warn!("sync queue full ({}), rejecting {}", self.capacity, item.id);
            return Err(CalsyncError::QueueFull(self.capacity));
        }
        item.sequence = self.bump_sequence();
        item.status = SyncItemStatus::Pending;
        item.retry_count = 0;
        debug!(
            "enqueue {} {} {} priority={} depth={}",
            item.id,
            item.item_type.event_type(),
            item.resource,
            item.priority,
            self.active.len() + 1
        );
        let snapshot = item.clone();
        self.insert_sorted(item);
        Ok(snapshot)
    }

    /// Hand out the next eligible item, marking it `processing`
    pub fn next_pending(&mut self, now: Instant) -> Option<SyncQueueItem> {
        let index = (0..self.active.len()).find(|&i| {
            let candidate = &self.active[i];
            candidate.is_due(now) && !self.blocked_by_earlier(candidate)
        })?;
        let item = &mut self.active[index];
        item.status = SyncItemStatus::Processing;
        item.retry_at = None;
        item.next_retry_at = None;
        Some(item.clone())
    }

    /// Acknowledged by the server. Pending items are accepted too: an ack can
    /// arrive after a reconnect already moved the item back to pending.
    pub fn mark_completed(&mut self, item_id: &str, now: Instant) -> Option<SyncQueueItem> {
        let index = self.active.iter().position(|item| item.id == item_id)?;
        let mut item = self.active.remove(index);
        item.status = SyncItemStatus::Completed;
        item.last_error = None;
        item.finished_at = Some(now_millis());
        item.finished_instant = Some(now);
        debug!("completed {} after {} retr(ies)", item.id, item.retry_count);
        self.finished.push_back(item.clone());
        Some(item)
    }

    /// Record a failed attempt for a `processing` item
    pub fn mark_failed(
        &mut self,
        item_id: &str,
        error: &CalsyncError,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Option<FailureOutcome> {
        let index = self
            .active
            .iter()
            .position(|item| item.id == item_id && item.status == SyncItemStatus::Processing)?;

        let item = &mut self.active[index];
        item.retry_count += 1;
        item.last_error = Some(error.to_string());

        match policy.decide(item.retry_count, error) {
            RetryDecision::RetryAfter(delay) => {
                item.status = SyncItemStatus::Pending;
                item.retry_at = Some(now + delay);
                item.next_retry_at = Some(now_millis() + delay.as_millis() as i64);
                debug!("retry {} #{} in {:?}: {}", item.id, item.retry_count, delay, error);
                Some(FailureOutcome::Retrying {
                    item: item.clone(),
                    delay,
                })
            }
            RetryDecision::GiveUp => {
                let mut item = self.active.remove(index);
                item.status = SyncItemStatus::Failed;
                item.finished_at = Some(now_millis());
                item.finished_instant = Some(now);
                item.retry_at = None;
                item.next_retry_at = None;
                warn!("item {} failed permanently after {} attempt(s): {}", item.id, item.retry_count, error);
                self.finished.push_back(item.clone());
                Some(FailureOutcome::Failed(item))
            }
        }
    }

    /// Connection lost: every in-flight item goes back to pending without
    /// consuming a retry. Returns the affected ids.
    pub fn requeue_in_flight(&mut self) -> Vec<String> {
        let mut ids = Vec::new();
        for item in self.active.iter_mut().filter(|i| i.status == SyncItemStatus::Processing) {
            item.status = SyncItemStatus::Pending;
            ids.push(item.id.clone());
        }
        if !ids.is_empty() {
            debug!("requeued {} in-flight item(s)", ids.len());
        }
        ids
    }

    /// Give a permanently failed item a fresh set of retries
    pub fn retry_failed(&mut self, item_id: &str) -> Result<SyncQueueItem> {
        let index = self
            .finished
            .iter()
            .position(|item| item.id == item_id && item.status == SyncItemStatus::Failed)
            .ok_or_else(|| CalsyncError::NotFound(format!("failed sync item {}", item_id)))?;
        if self.active.len() >= self.capacity {
            return Err(CalsyncError::QueueFull(self.capacity));
        }

        let mut item = self
            .finished
            .remove(index)
            .ok_or_else(|| CalsyncError::NotFound(format!("failed sync item {}", item_id)))?;
        item.status = SyncItemStatus::Pending;
        item.retry_count = 0;
        item.last_error = None;
        item.finished_at = None;
        item.finished_instant = None;
        item.sequence = self.bump_sequence();
        let snapshot = item.clone();
        self.insert_sorted(item);
        Ok(snapshot)
    }

    /// Drop finished items older than the retention window
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.finished.len();
        let retention = self.retention;
        self.finished
            .retain(|item| item.finished_instant.map_or(false, |at| at + retention > now));
        let pruned = before - self.finished.len();
        if pruned > 0 {
            debug!("pruned {} finished item(s)", pruned);
        }
        pruned
    }

    /// Remove every active item (shutdown)
    pub fn drain_active(&mut self) -> Vec<SyncQueueItem> {
        std::mem::take(&mut self.active)
    }

    /// Active items in dequeue order, then finished items oldest first
    pub fn snapshot(&self) -> Vec<SyncQueueItem> {
        self.active.iter().chain(self.finished.iter()).cloned().collect()
    }

    pub fn get(&self, item_id: &str) -> Option<&SyncQueueItem> {
        self.active
            .iter()
            .chain(self.finished.iter())
            .find(|item| item.id == item_id)
    }

    /// Most recent unacknowledged local edit of `resource`
    pub fn latest_unfinished(&self, resource: &ResourceKey) -> Option<&SyncQueueItem> {
        self.active
            .iter()
            .filter(|item| &item.resource == resource)
            .max_by_key(|item| item.sequence)
    }

    /// Earliest future time a backed-off item becomes eligible
    pub fn next_retry_deadline(&self, now: Instant) -> Option<Instant> {
        self.active
            .iter()
            .filter(|item| item.status == SyncItemStatus::Pending)
            .filter_map(|item| item.retry_at)
            .filter(|at| *at > now)
            .min()
    }

    pub fn processing_count(&self) -> usize {
        self.count_active(SyncItemStatus::Processing)
    }

    pub fn pending_count(&self) -> usize {
        self.count_active(SyncItemStatus::Pending)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let mut priority_distribution = HashMap::new();
        for item in &self.active {
            *priority_distribution.entry(item.priority).or_insert(0) += 1;
        }
        let finished_with = |status| self.finished.iter().filter(|i| i.status == status).count();

        QueueStats {
            total_items: self.active.len() + self.finished.len(),
            pending_items: self.pending_count(),
            processing_items: self.processing_count(),
            completed_items: finished_with(SyncItemStatus::Completed),
            failed_items: finished_with(SyncItemStatus::Failed),
            priority_distribution,
        }
    }

    fn count_active(&self, status: SyncItemStatus) -> usize {
        self.active.iter().filter(|i| i.status == status).count()
    }

    fn blocked_by_earlier(&self, candidate: &SyncQueueItem) -> bool {
        self.active
            .iter()
            .any(|other| other.resource == candidate.resource && other.sequence < candidate.sequence)
    }

    fn insert_sorted(&mut self, item: SyncQueueItem) {
        let key = (item.priority, item.sequence);
        let index = self
            .active
            .partition_point(|existing| (existing.priority, existing.sequence) < key);
        self.active.insert(index, item);
    }

    fn bump_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UpdateAction;
    use serde_json::json;

    fn queue() -> SyncQueue {
        SyncQueue::new(100, Duration::from_secs(5))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn timeout(id: &str) -> CalsyncError {
        CalsyncError::SendTimeout { item_id: id.to_string(), attempts: 1 }
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut q = queue();
        let now = Instant::now();
        let create = q.enqueue(SyncQueueItem::project_update("a", UpdateAction::Create, json!({}))).unwrap();
        let update1 = q.enqueue(SyncQueueItem::project_update("b", UpdateAction::Update, json!({}))).unwrap();
        let delete = q.enqueue(SyncQueueItem::project_update("c", UpdateAction::Delete, json!({}))).unwrap();
        let update2 = q.enqueue(SyncQueueItem::project_update("d", UpdateAction::Update, json!({}))).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.next_pending(now)).map(|i| i.id).collect();
        assert_eq!(order, vec![delete.id, update1.id, update2.id, create.id]);
        assert_eq!(q.processing_count(), 4);
    }

    #[test]
    fn test_same_resource_is_serial() {
        let mut q = queue();
        let now = Instant::now();
        let create = q.enqueue(SyncQueueItem::calendar_update("s1", "p1", UpdateAction::Create, json!({}))).unwrap();
        let delete = q.enqueue(SyncQueueItem::calendar_update("s1", "p1", UpdateAction::Delete, json!({}))).unwrap();

        // the delete outranks the create but must not overtake it
        assert_eq!(q.next_pending(now).unwrap().id, create.id);
        assert!(q.next_pending(now).is_none());
        assert_eq!(q.latest_unfinished(&ResourceKey::schedule("s1")).unwrap().id, delete.id);

        q.mark_completed(&create.id, now).unwrap();
        assert_eq!(q.next_pending(now).unwrap().id, delete.id);
    }

    #[test]
    fn test_retry_backoff_then_failure() {
        let mut q = queue();
        let p = policy();
        let mut now = Instant::now();
        let item = q.enqueue(SyncQueueItem::project_update("p1", UpdateAction::Update, json!({}))).unwrap();

        for expected_delay in [1_000u64, 2_000] {
            assert_eq!(q.next_pending(now).unwrap().id, item.id);
            match q.mark_failed(&item.id, &timeout(&item.id), &p, now).unwrap() {
                FailureOutcome::Retrying { delay, .. } => assert_eq!(delay, Duration::from_millis(expected_delay)),
                other => panic!("unexpected outcome {:?}", other),
            }
            assert!(q.next_pending(now).is_none(), "not eligible before the delay elapsed");
            assert_eq!(q.next_retry_deadline(now), Some(now + Duration::from_millis(expected_delay)));
            now += Duration::from_millis(expected_delay);
            assert_eq!(q.next_retry_deadline(now), None);
        }

        q.next_pending(now).unwrap();
        match q.mark_failed(&item.id, &timeout(&item.id), &p, now).unwrap() {
            FailureOutcome::Failed(failed) => {
                assert_eq!(failed.status, SyncItemStatus::Failed);
                assert_eq!(failed.retry_count, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(q.is_empty());

        // a second failure report for the same item is ignored
        assert!(q.mark_failed(&item.id, &timeout(&item.id), &p, now).is_none());
        assert_eq!(q.stats().failed_items, 1);
    }

    #[test]
    fn test_requeue_in_flight_keeps_retry_count() {
        let mut q = queue();
        let now = Instant::now();
        let item = q.enqueue(SyncQueueItem::project_update("p1", UpdateAction::Update, json!({}))).unwrap();
        q.next_pending(now).unwrap();

        assert_eq!(q.requeue_in_flight(), vec![item.id.clone()]);
        let again = q.next_pending(now).unwrap();
        assert_eq!(again.id, item.id);
        assert_eq!(again.retry_count, 0);
    }

    #[test]
    fn test_ack_for_requeued_item_completes_it() {
        let mut q = queue();
        let now = Instant::now();
        let item = q.enqueue(SyncQueueItem::project_update("p1", UpdateAction::Update, json!({}))).unwrap();
        q.next_pending(now).unwrap();
        q.requeue_in_flight();

        let done = q.mark_completed(&item.id, now).unwrap();
        assert_eq!(done.status, SyncItemStatus::Completed);
        assert!(q.mark_completed(&item.id, now).is_none());
    }

    #[test]
    fn test_retention_and_prune() {
        let mut q = queue();
        let now = Instant::now();
        let item = q.enqueue(SyncQueueItem::project_update("p1", UpdateAction::Update, json!({}))).unwrap();
        q.next_pending(now).unwrap();
        q.mark_completed(&item.id, now).unwrap();

        assert_eq!(q.snapshot().len(), 1);
        assert_eq!(q.prune(now + Duration::from_secs(4)), 0);
        assert_eq!(q.prune(now + Duration::from_secs(5)), 1);
        assert!(q.snapshot().is_empty());
    }

    #[test]
    fn test_capacity() {
        let mut q = SyncQueue::new(1, Duration::from_secs(1));
        q.enqueue(SyncQueueItem::project_update("p1", UpdateAction::Update, json!({}))).unwrap();
        let err = q.enqueue(SyncQueueItem::project_update("p2", UpdateAction::Update, json!({}))).unwrap_err();
        assert_eq!(err, CalsyncError::QueueFull(1));
    }

    #[test]
    fn test_retry_failed_resets_item() {
        let mut q = queue();
        let now = Instant::now();
        let item = q.enqueue(SyncQueueItem::project_update("p1", UpdateAction::Update, json!({}))).unwrap();
        q.next_pending(now).unwrap();
        let rejected = CalsyncError::SendFailed { item_id: item.id.clone(), reason: "forbidden".into() };
        assert!(matches!(q.mark_failed(&item.id, &rejected, &policy(), now), Some(FailureOutcome::Failed(_))));

        let revived = q.retry_failed(&item.id).unwrap();
        assert_eq!(revived.status, SyncItemStatus::Pending);
        assert_eq!(revived.retry_count, 0);
        assert!(q.retry_failed(&item.id).is_err());
        assert_eq!(q.next_pending(now).unwrap().id, item.id);
    }

    #[test]
    fn test_stats() {
        let mut q = queue();
        let now = Instant::now();
        q.enqueue(SyncQueueItem::project_update("p1", UpdateAction::Delete, json!({}))).unwrap();
        q.enqueue(SyncQueueItem::project_update("p2", UpdateAction::Create, json!({}))).unwrap();
        q.next_pending(now).unwrap();

        let stats = q.stats();
        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.pending_items, 1);
        assert_eq!(stats.processing_items, 1);
        assert_eq!(stats.priority_distribution.get(&SyncPriority::High), Some(&1));
        assert_eq!(stats.priority_distribution.get(&SyncPriority::Low), Some(&1));
    }
}
