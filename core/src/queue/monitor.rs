//! Plan queue: detects new submissions and hands them out in priority order.
//!
//! Ordering is `(priority, submitted_at_ms, arrival sequence)`, lowest first,
//! so priority 1 beats priority 5 and equal priorities leave in submission
//! order. A plan id is enqueued at most once for the life of the monitor
//! (or until `reset_processed_plans`).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::source::PlanSource;
use crate::clock::now_ms;
use crate::types::{ComponentHealth, ExecutionPlan, ServiceState};

/// Dequeue records kept for wait-time metrics.
const DEQUEUE_LOG_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// QueueEntry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueueEntry {
    seq: u64,
    plan: ExecutionPlan,
}

impl QueueEntry {
    fn key(&self) -> (u8, u64, u64) {
        (self.plan.priority, self.plan.submitted_at_ms, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; reverse so the smallest key pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// One row of the queue listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedPlanSummary {
    pub position: usize,
    pub plan_id: String,
    pub submission_id: String,
    pub priority: u8,
    pub test_count: usize,
    pub submitted_at_ms: u64,
}

/// Full ordered listing plus aggregate queue metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueStatus {
    pub queued_plans: usize,
    pub queued_tests: usize,
    pub seen_plans: usize,
    pub rejected_plans: u64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub avg_wait_time_ms: u64,
    pub max_wait_time_ms: u64,
    pub plans: Vec<QueuedPlanSummary>,
}

// ---------------------------------------------------------------------------
// QueueMonitor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    seen: HashSet<String>,
    next_seq: u64,
    total_enqueued: u64,
    total_dequeued: u64,
    rejected: u64,
    /// Wait time (dequeue minus submission) of recent dequeues.
    waits: VecDeque<u64>,
}

impl QueueState {
    fn push(&mut self, plan: ExecutionPlan) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.total_enqueued += 1;
        self.heap.push(QueueEntry { seq, plan });
    }

    fn is_queued(&self, plan_id: &str) -> bool {
        self.heap.iter().any(|e| e.plan.plan_id == plan_id)
    }
}

pub struct QueueMonitor {
    source: Arc<dyn PlanSource>,
    state: Mutex<QueueState>,
}

impl QueueMonitor {
    pub fn new(source: Arc<dyn PlanSource>) -> Self {
        QueueMonitor {
            source,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Read the submission store and enqueue plans not seen before.
    ///
    /// Returns the newly enqueued plans. A store that cannot be read yields
    /// an empty list.
    pub fn poll_for_new_plans(&self) -> Vec<ExecutionPlan> {
        let seen = self.state.lock().seen.clone();

        // The source is read outside the lock; ids are re-checked on insert.
        let mut submissions = match self.source.list_new_plans(&seen) {
            Ok(subs) => subs,
            Err(e) if e.is_transient() => {
                debug!(error = %e, "plan source not available");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "plan source read failed");
                return Vec::new();
            }
        };
        submissions.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.plan_id.cmp(&b.plan_id))
        });

        let mut state = self.state.lock();
        let mut added = Vec::new();
        for submission in submissions {
            if !state.seen.insert(submission.plan_id.clone()) {
                continue;
            }
            match ExecutionPlan::from_submission(submission) {
                Ok(plan) => {
                    info!(
                        plan_id = %plan.plan_id,
                        priority = plan.priority,
                        tests = plan.total_tests,
                        "plan queued"
                    );
                    added.push(plan.clone());
                    state.push(plan);
                }
                Err(e) => {
                    state.rejected += 1;
                    warn!(error = %e, "rejecting submission");
                }
            }
        }
        added
    }

    /// Poll, then pop the highest-priority plan.
    pub fn get_next_execution_plan(&self) -> Option<ExecutionPlan> {
        self.poll_for_new_plans();
        let mut state = self.state.lock();
        let entry = state.heap.pop()?;
        state.total_dequeued += 1;
        let wait = now_ms().saturating_sub(entry.plan.submitted_at_ms);
        state.waits.push_back(wait);
        if state.waits.len() > DEQUEUE_LOG_LIMIT {
            state.waits.pop_front();
        }
        Some(entry.plan)
    }

    /// Queue a plan rebuilt by startup recovery.
    ///
    /// The id is marked seen so the submission still sitting in the store is
    /// not enqueued a second time. Returns `false` if the plan is already
    /// queued.
    pub fn enqueue_recovered(&self, plan: ExecutionPlan) -> bool {
        let mut state = self.state.lock();
        if state.is_queued(&plan.plan_id) {
            return false;
        }
        state.seen.insert(plan.plan_id.clone());
        info!(
            plan_id = %plan.plan_id,
            remaining = plan.test_case_ids.len(),
            "recovered plan re-queued"
        );
        state.push(plan);
        true
    }

    /// Record a plan id as processed without queueing it. Returns `false`
    /// if it was already seen.
    pub fn mark_seen(&self, plan_id: &str) -> bool {
        self.state.lock().seen.insert(plan_id.to_string())
    }

    pub fn get_queued_plan_count(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn get_queued_test_count(&self) -> usize {
        self.state
            .lock()
            .heap
            .iter()
            .map(|e| e.plan.test_case_ids.len())
            .sum()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let state = self.state.lock();
        let mut entries: Vec<&QueueEntry> = state.heap.iter().collect();
        entries.sort_by_key(|e| e.key());

        let plans: Vec<QueuedPlanSummary> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| QueuedPlanSummary {
                position: i + 1,
                plan_id: e.plan.plan_id.clone(),
                submission_id: e.plan.submission_id.clone(),
                priority: e.plan.priority,
                test_count: e.plan.test_case_ids.len(),
                submitted_at_ms: e.plan.submitted_at_ms,
            })
            .collect();

        let avg_wait = if state.waits.is_empty() {
            0
        } else {
            state.waits.iter().sum::<u64>() / state.waits.len() as u64
        };

        QueueStatus {
            queued_plans: plans.len(),
            queued_tests: plans.iter().map(|p| p.test_count).sum(),
            seen_plans: state.seen.len(),
            rejected_plans: state.rejected,
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            avg_wait_time_ms: avg_wait,
            max_wait_time_ms: state.waits.iter().copied().max().unwrap_or(0),
            plans,
        }
    }

    /// Drop every queued plan. Returns how many were removed.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.heap.len();
        state.heap.clear();
        if removed > 0 {
            warn!(removed, "queue cleared");
        }
        removed
    }

    /// Forget which plans have been seen, so the next poll re-reads them.
    /// Plans still in the queue stay marked.
    pub fn reset_processed_plans(&self) {
        let mut state = self.state.lock();
        let queued: HashSet<String> = state.heap.iter().map(|e| e.plan.plan_id.clone()).collect();
        let forgotten = state.seen.len() - queued.len().min(state.seen.len());
        state.seen = queued;
        info!(forgotten, "processed plan set reset");
    }

    pub fn health(&self) -> ComponentHealth {
        let state = self.state.lock();
        let queued_tests: usize = state.heap.iter().map(|e| e.plan.test_case_ids.len()).sum();
        ComponentHealth::new(ServiceState::Healthy)
            .detail("queued_plans", state.heap.len())
            .detail("queued_tests", queued_tests)
            .detail("seen_plans", state.seen.len())
            .detail("rejected_plans", state.rejected)
    }
}

impl std::fmt::Debug for QueueMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMonitor")
            .field("queued_plans", &self.get_queued_plan_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::source::InMemoryPlanSource;
    use crate::types::{HardwareRequirements, PlanSubmission};

    fn submission(id: &str, priority: u8, created_at_ms: u64, tests: usize) -> PlanSubmission {
        PlanSubmission {
            plan_id: id.into(),
            submission_id: format!("sub-{}", id),
            test_case_ids: (0..tests).map(|i| format!("{}-t{}", id, i)).collect(),
            priority,
            hardware_requirements: HardwareRequirements::default(),
            created_at_ms,
        }
    }

    fn monitor() -> (Arc<InMemoryPlanSource>, QueueMonitor) {
        let source = Arc::new(InMemoryPlanSource::new());
        let monitor = QueueMonitor::new(source.clone());
        (source, monitor)
    }

    fn drain(monitor: &QueueMonitor) -> Vec<String> {
        std::iter::from_fn(|| monitor.get_next_execution_plan())
            .map(|p| p.plan_id)
            .collect()
    }

    #[test]
    fn priority_then_fifo() {
        let (source, monitor) = monitor();
        source.submit(submission("first", 5, 100, 1));
        source.submit(submission("urgent", 1, 200, 1));
        source.submit(submission("second", 5, 300, 1));
        assert_eq!(drain(&monitor), vec!["urgent", "first", "second"]);
        assert!(monitor.get_next_execution_plan().is_none());
    }

    #[test]
    fn fifo_within_priority_across_polls() {
        let (source, monitor) = monitor();
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            source.submit(submission(id, 3, 1000 + i as u64, 1));
            monitor.poll_for_new_plans();
        }
        assert_eq!(drain(&monitor), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn same_timestamp_keeps_arrival_order() {
        let (source, monitor) = monitor();
        source.submit(submission("x", 2, 500, 1));
        monitor.poll_for_new_plans();
        source.submit(submission("w", 2, 500, 1));
        monitor.poll_for_new_plans();
        assert_eq!(drain(&monitor), vec!["x", "w"]);
    }

    #[test]
    fn polling_is_idempotent() {
        let (source, monitor) = monitor();
        source.submit(submission("p1", 5, 1, 3));
        assert_eq!(monitor.poll_for_new_plans().len(), 1);
        assert!(monitor.poll_for_new_plans().is_empty());
        assert_eq!(monitor.get_queued_plan_count(), 1);
        assert_eq!(monitor.get_queued_test_count(), 3);

        // Still not re-enqueued once dequeued.
        assert!(monitor.get_next_execution_plan().is_some());
        assert!(monitor.get_next_execution_plan().is_none());
    }

    #[test]
    fn unavailable_source_yields_nothing() {
        let (source, monitor) = monitor();
        source.submit(submission("p1", 5, 1, 1));
        source.set_available(false);
        assert!(monitor.poll_for_new_plans().is_empty());
        assert!(monitor.get_next_execution_plan().is_none());
        source.set_available(true);
        assert_eq!(monitor.poll_for_new_plans().len(), 1);
    }

    #[test]
    fn invalid_submission_is_seen_but_never_queued() {
        let (source, monitor) = monitor();
        source.submit(submission("bad", 42, 1, 1));
        assert!(monitor.poll_for_new_plans().is_empty());
        let status = monitor.get_queue_status();
        assert_eq!(status.rejected_plans, 1);
        assert_eq!(status.seen_plans, 1);
        assert!(monitor.poll_for_new_plans().is_empty());
        assert_eq!(monitor.get_queue_status().rejected_plans, 1);
    }

    #[test]
    fn recovered_plan_blocks_duplicate_from_source() {
        let (source, monitor) = monitor();
        let sub = submission("p1", 5, 1, 5);
        source.submit(sub.clone());

        let mut plan = ExecutionPlan::from_submission(sub).unwrap();
        plan.test_case_ids.truncate(3);
        assert!(monitor.enqueue_recovered(plan.clone()));
        assert!(!monitor.enqueue_recovered(plan));

        assert!(monitor.poll_for_new_plans().is_empty());
        assert_eq!(monitor.get_queued_plan_count(), 1);
        assert_eq!(monitor.get_queued_test_count(), 3);
    }

    #[test]
    fn queue_status_is_ordered() {
        let (source, monitor) = monitor();
        source.submit(submission("low", 9, 1, 2));
        source.submit(submission("high", 1, 2, 1));
        source.submit(submission("mid", 5, 3, 4));
        monitor.poll_for_new_plans();

        let status = monitor.get_queue_status();
        let order: Vec<&str> = status.plans.iter().map(|p| p.plan_id.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
        assert_eq!(status.plans[0].position, 1);
        assert_eq!(status.queued_tests, 7);
        assert_eq!(status.total_enqueued, 3);
        assert_eq!(status.total_dequeued, 0);
    }

    #[test]
    fn clear_and_reset() {
        let (source, monitor) = monitor();
        source.submit(submission("p1", 5, 1, 1));
        source.submit(submission("p2", 5, 2, 1));
        monitor.poll_for_new_plans();
        assert_eq!(monitor.clear_queue(), 2);
        assert_eq!(monitor.get_queued_plan_count(), 0);

        // Cleared plans stay seen until reset.
        assert!(monitor.poll_for_new_plans().is_empty());
        monitor.reset_processed_plans();
        assert_eq!(monitor.poll_for_new_plans().len(), 2);
    }

    #[test]
    fn wait_metrics_recorded_on_dequeue() {
        let (source, monitor) = monitor();
        source.submit(submission("p1", 5, now_ms().saturating_sub(1000), 1));
        monitor.get_next_execution_plan().unwrap();
        let status = monitor.get_queue_status();
        assert_eq!(status.total_dequeued, 1);
        assert!(status.max_wait_time_ms >= 1000);
        assert_eq!(status.avg_wait_time_ms, status.max_wait_time_ms);
    }
}
