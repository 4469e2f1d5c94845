//! In-memory priority queue with a concurrency cap, a minimum gap between
//! dispatches and exponential retry backoff.
//!
//! Dispatched tasks go out on the channel returned by [`TaskQueue::new`];
//! the consumer reports each outcome exactly once through the attached
//! [`Completion`]. Outcomes are broadcast as [`QueueEvent`]s.

use scrape_hive_common::{QueueConfig, QueueStats, TaskKind};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Unit of deferred, retryable work
#[derive(Debug, Clone)]
pub struct Task<P> {
    pub id: String,
    pub kind: TaskKind,
    pub payload: P,
    /// Higher is dispatched first
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Not dispatched before this instant
    pub next_eligible: Instant,
    pub last_error: Option<String>,
}

/// Optional knobs for [`TaskQueue::enqueue`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i32,
    /// Falls back to `QueueConfig::default_max_retries`
    pub max_retries: Option<u32>,
    pub id: Option<String>,
}

impl EnqueueOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent<P> {
    Completed {
        task: Task<P>,
        result: serde_json::Value,
    },
    /// The task failed and re-enters the queue after `backoff`
    Retrying {
        task: Task<P>,
        attempt: u32,
        backoff: Duration,
    },
    /// Retries exhausted; the task is gone for good
    Failed { task: Task<P>, error: String },
}

/// A task handed to the consumer
pub struct Dispatch<P: Clone + Send + Sync + 'static> {
    pub task: Task<P>,
    pub completion: Completion<P>,
}

/// Reports the outcome of one dispatched task.
///
/// Dropping it unreported counts as a failure, so a lost handler never
/// leaves its task in flight forever.
pub struct Completion<P: Clone + Send + Sync + 'static> {
    queue: Weak<Shared<P>>,
    task_id: String,
    reported: bool,
}

impl<P: Clone + Send + Sync + 'static> Completion<P> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn success(mut self, result: serde_json::Value) {
        self.report(Ok(result));
    }

    pub fn failure(mut self, error: impl Into<String>) {
        self.report(Err(error.into()));
    }

    fn report(&mut self, outcome: Result<serde_json::Value, String>) {
        if self.reported {
            return;
        }
        self.reported = true;
        if let Some(shared) = self.queue.upgrade() {
            TaskQueue { shared }.complete(&self.task_id, outcome);
        }
    }
}

impl<P: Clone + Send + Sync + 'static> Drop for Completion<P> {
    fn drop(&mut self) {
        if !self.reported {
            self.report(Err("task dropped without reporting an outcome".to_string()));
        }
    }
}

struct Pending<P> {
    seq: u64,
    task: Task<P>,
}

// Max-heap on priority; lower sequence number wins a tie
impl<P> Ord for Pending<P> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<P> PartialOrd for Pending<P> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<P> PartialEq for Pending<P> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<P> Eq for Pending<P> {}

struct QueueState<P> {
    pending: BinaryHeap<Pending<P>>,
    /// Failed tasks waiting out their backoff
    delayed: Vec<Task<P>>,
    in_flight: HashMap<String, Task<P>>,
    paused: bool,
    last_dispatch: Option<Instant>,
    next_seq: u64,
    total_dispatched: u64,
    total_completed: u64,
    total_retried: u64,
    total_failed: u64,
}

impl<P> QueueState<P> {
    fn contains(&self, task_id: &str) -> bool {
        self.in_flight.contains_key(task_id)
            || self.delayed.iter().any(|t| t.id == task_id)
            || self.pending.iter().any(|p| p.task.id == task_id)
    }

    fn push_pending(&mut self, task: Task<P>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Pending { seq, task });
    }

    /// Move delayed tasks whose backoff has elapsed back into the heap
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].next_eligible <= now {
                let task = self.delayed.swap_remove(index);
                self.push_pending(task);
            } else {
                index += 1;
            }
        }
    }

    fn earliest_delayed(&self) -> Option<Instant> {
        self.delayed.iter().map(|t| t.next_eligible).min()
    }
}

struct Shared<P> {
    config: QueueConfig,
    state: Mutex<QueueState<P>>,
    wake: Arc<Notify>,
    events: broadcast::Sender<QueueEvent<P>>,
    stop: CancellationToken,
}

impl<P> Shared<P> {
    fn lock(&self) -> MutexGuard<'_, QueueState<P>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// What the dispatch loop does next
enum Step<P: Clone + Send + Sync + 'static> {
    Dispatch(Dispatch<P>),
    WaitUntil(Option<Instant>),
}

/// Priority task queue. Clones share the same queue.
pub struct TaskQueue<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for TaskQueue<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P: Clone + Send + Sync + 'static> TaskQueue<P> {
    /// Create the queue and start its dispatch loop.
    ///
    /// Must be called inside a tokio runtime. The loop ends on `shutdown`,
    /// when the receiver is dropped, or when every queue handle is gone.
    pub fn new(config: QueueConfig) -> (Self, mpsc::UnboundedReceiver<Dispatch<P>>) {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(QueueState {
                pending: BinaryHeap::new(),
                delayed: Vec::new(),
                in_flight: HashMap::new(),
                paused: false,
                last_dispatch: None,
                next_seq: 0,
                total_dispatched: 0,
                total_completed: 0,
                total_retried: 0,
                total_failed: 0,
            }),
            wake: Arc::new(Notify::new()),
            events,
            stop: CancellationToken::new(),
        });

        info!(
            concurrency = shared.config.concurrency,
            rate_limit = ?shared.config.rate_limit,
            "Task queue started"
        );

        tokio::spawn(Self::dispatch_loop(Arc::downgrade(&shared), dispatch_tx));

        (Self { shared }, dispatch_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent<P>> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: QueueEvent<P>) {
        let _ = self.shared.events.send(event);
    }

    /// Add a task and return its id.
    ///
    /// An explicit id that is still queued or in flight is not added twice.
    pub fn enqueue(&self, kind: TaskKind, payload: P, options: EnqueueOptions) -> String {
        let id = options
            .id
            .unwrap_or_else(|| format!("task_{}", Uuid::new_v4()));

        {
            let mut state = self.shared.lock();
            if state.contains(&id) {
                warn!(task_id = %id, "Task id already queued, ignoring duplicate");
                return id;
            }

            state.push_pending(Task {
                id: id.clone(),
                kind: kind.clone(),
                payload,
                priority: options.priority,
                retry_count: 0,
                max_retries: options
                    .max_retries
                    .unwrap_or(self.shared.config.default_max_retries),
                next_eligible: Instant::now(),
                last_error: None,
            });
        }

        debug!(task_id = %id, kind = %kind, priority = options.priority, "Task enqueued");
        self.shared.wake.notify_one();
        id
    }

    /// Remove a task that has not been dispatched yet
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.shared.lock();

        let before = state.pending.len() + state.delayed.len();
        state.pending.retain(|p| p.task.id != task_id);
        state.delayed.retain(|t| t.id != task_id);
        let removed = state.pending.len() + state.delayed.len() < before;

        if removed {
            debug!(task_id = %task_id, "Task cancelled");
        }
        removed
    }

    /// Stop dispatching; tasks in flight keep running
    pub fn pause(&self) {
        let mut state = self.shared.lock();
        if !state.paused {
            state.paused = true;
            info!("Task queue paused");
        }
    }

    pub fn resume(&self) {
        {
            let mut state = self.shared.lock();
            if !state.paused {
                return;
            }
            state.paused = false;
        }
        info!("Task queue resumed");
        self.shared.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Drop every task not yet dispatched; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.shared.lock();
        let dropped = state.pending.len() + state.delayed.len();
        state.pending.clear();
        state.delayed.clear();
        dropped
    }

    /// Tasks waiting for dispatch, including those in backoff
    pub fn queue_length(&self) -> usize {
        let state = self.shared.lock();
        state.pending.len() + state.delayed.len()
    }

    pub fn active_tasks_count(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock();
        QueueStats {
            queue_length: state.pending.len() + state.delayed.len(),
            active_tasks: state.in_flight.len(),
            backing_off: state.delayed.len(),
            paused: state.paused,
            total_dispatched: state.total_dispatched,
            total_completed: state.total_completed,
            total_retried: state.total_retried,
            total_failed: state.total_failed,
        }
    }

    /// Stop the dispatch loop for good
    pub fn shutdown(&self) {
        self.shared.stop.cancel();
    }

    /// `min(cap, base * factor^retry_count + jitter)`
    fn backoff(&self, retry_count: u32) -> Duration {
        let config = &self.shared.config;
        let exponential =
            config.backoff_base.as_secs_f64() * config.backoff_factor.powf(f64::from(retry_count));
        let jitter = config.max_jitter.as_secs_f64() * fastrand::f64();
        // Clamped before conversion: large retry counts overflow Duration
        let secs = (exponential + jitter).min(config.backoff_cap.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(config.backoff_cap)
    }

    /// Record the outcome of a dispatched task.
    ///
    /// Returns false when the id is not in flight (unknown or already reported).
    pub fn complete(&self, task_id: &str, outcome: Result<serde_json::Value, String>) -> bool {
        {
            let mut state = self.shared.lock();
            let Some(mut task) = state.in_flight.remove(task_id) else {
                debug!(task_id = %task_id, "Completion for a task not in flight");
                return false;
            };

            let event = match outcome {
                Ok(result) => {
                    state.total_completed += 1;
                    debug!(task_id = %task_id, kind = %task.kind, "Task completed");
                    QueueEvent::Completed { task, result }
                }
                Err(error) if task.retry_count < task.max_retries => {
                    task.retry_count += 1;
                    let backoff = self.backoff(task.retry_count);
                    task.next_eligible = Instant::now() + backoff;
                    task.last_error = Some(error.clone());
                    state.total_retried += 1;

                    warn!(
                        task_id = %task_id,
                        kind = %task.kind,
                        attempt = task.retry_count,
                        max_retries = task.max_retries,
                        backoff = ?backoff,
                        "Task failed, retrying: {}",
                        error
                    );

                    let attempt = task.retry_count;
                    let event = QueueEvent::Retrying {
                        task: task.clone(),
                        attempt,
                        backoff,
                    };
                    state.delayed.push(task);
                    event
                }
                Err(error) => {
                    task.last_error = Some(error.clone());
                    state.total_failed += 1;
                    warn!(
                        task_id = %task_id,
                        kind = %task.kind,
                        retries = task.retry_count,
                        "Task failed permanently: {}",
                        error
                    );
                    QueueEvent::Failed { task, error }
                }
            };

            // Sent before the lock drops so an empty queue never hides an unsent outcome
            self.emit(event);
        }

        self.shared.wake.notify_one();
        true
    }

    fn next_step(shared: &Arc<Shared<P>>) -> Step<P> {
        let mut state = shared.lock();
        let now = Instant::now();
        state.promote_due(now);

        if state.paused {
            return Step::WaitUntil(None);
        }

        let backoff_deadline = state.earliest_delayed();

        if state.pending.is_empty() || state.in_flight.len() >= shared.config.concurrency {
            return Step::WaitUntil(backoff_deadline);
        }

        if let Some(last) = state.last_dispatch {
            let ready_at = last + shared.config.rate_limit;
            if now < ready_at {
                return Step::WaitUntil(Some(ready_at));
            }
        }

        let Some(Pending { task, .. }) = state.pending.pop() else {
            return Step::WaitUntil(backoff_deadline);
        };

        state.in_flight.insert(task.id.clone(), task.clone());
        state.last_dispatch = Some(now);
        state.total_dispatched += 1;

        Step::Dispatch(Dispatch {
            completion: Completion {
                queue: Arc::downgrade(shared),
                task_id: task.id.clone(),
                reported: false,
            },
            task,
        })
    }

    async fn dispatch_loop(shared: Weak<Shared<P>>, dispatch_tx: mpsc::UnboundedSender<Dispatch<P>>) {
        loop {
            let Some(strong) = shared.upgrade() else {
                break;
            };
            if strong.stop.is_cancelled() {
                break;
            }

            let deadline = match Self::next_step(&strong) {
                Step::Dispatch(dispatch) => {
                    debug!(
                        task_id = %dispatch.task.id,
                        kind = %dispatch.task.kind,
                        priority = dispatch.task.priority,
                        attempt = dispatch.task.retry_count,
                        "Dispatching task"
                    );
                    if let Err(mpsc::error::SendError(mut undelivered)) = dispatch_tx.send(dispatch) {
                        // Consumer is gone; put the task back untouched
                        undelivered.completion.reported = true;
                        let mut state = strong.lock();
                        state.in_flight.remove(&undelivered.task.id);
                        state.push_pending(undelivered.task);
                        warn!("Task consumer dropped, stopping dispatch loop");
                        break;
                    }
                    continue;
                }
                Step::WaitUntil(deadline) => deadline,
            };

            let limit = Instant::now() + strong.config.idle_tick;
            let wake_at = deadline.map_or(limit, |d| d.min(limit));
            let stop = strong.stop.clone();
            let wake = strong.wake.clone();
            // Notify keeps a permit, so a wake-up sent after this point is not lost
            drop(strong);

            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = stop.cancelled() => break,
            }
        }

        debug!("Dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(concurrency: usize, rate_limit: Duration) -> QueueConfig {
        QueueConfig {
            concurrency,
            rate_limit,
            max_jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Dispatch<u32>>) -> Dispatch<u32> {
        tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("no dispatch")
            .expect("dispatch channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_in_priority_order() {
        let (queue, mut rx) = TaskQueue::new(config(1, Duration::ZERO));
        queue.pause();
        for priority in [1, 5, 3] {
            queue.enqueue(
                TaskKind::DetailFetch,
                priority as u32,
                EnqueueOptions::priority(priority),
            );
        }
        queue.resume();

        let mut order = Vec::new();
        for _ in 0..3 {
            let dispatch = next(&mut rx).await;
            order.push(dispatch.task.priority);
            dispatch.completion.success(json!(null));
        }
        assert_eq!(order, vec![5, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_priorities_are_fifo() {
        let (queue, mut rx) = TaskQueue::new(config(1, Duration::ZERO));
        queue.pause();
        for payload in 0..4u32 {
            queue.enqueue(TaskKind::DetailFetch, payload, EnqueueOptions::default());
        }
        queue.resume();

        for expected in 0..4u32 {
            let dispatch = next(&mut rx).await;
            assert_eq!(dispatch.task.payload, expected);
            dispatch.completion.success(json!(null));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let (queue, mut rx) = TaskQueue::new(config(1, Duration::ZERO));
        let mut events = queue.subscribe();
        let id = queue.enqueue(
            TaskKind::DetailFetch,
            7,
            EnqueueOptions {
                max_retries: Some(3),
                ..Default::default()
            },
        );

        let mut attempts = 0;
        loop {
            let dispatch = next(&mut rx).await;
            assert_eq!(dispatch.task.id, id);
            attempts += 1;
            if attempts < 3 {
                dispatch.completion.failure("selector timeout");
            } else {
                dispatch.completion.success(json!({"ok": true}));
                break;
            }
        }
        assert_eq!(attempts, 3);

        let mut backoffs = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                QueueEvent::Retrying { backoff, attempt, .. } => {
                    assert_eq!(attempt as usize, backoffs.len() + 1);
                    backoffs.push(backoff);
                }
                QueueEvent::Completed { result, .. } => {
                    assert_eq!(result, json!({"ok": true}));
                    break;
                }
                QueueEvent::Failed { .. } => panic!("task should not fail"),
            }
        }
        assert_eq!(
            backoffs,
            vec![Duration::from_millis(1500), Duration::from_millis(2250)]
        );
        assert!(backoffs[0] < backoffs[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_fires_once() {
        let (queue, mut rx) = TaskQueue::new(config(1, Duration::ZERO));
        let mut events = queue.subscribe();
        let id = queue.enqueue(
            TaskKind::EnrichmentCheck,
            1,
            EnqueueOptions {
                max_retries: Some(2),
                ..Default::default()
            },
        );

        for _ in 0..3 {
            let dispatch = next(&mut rx).await;
            assert!(dispatch.task.retry_count <= dispatch.task.max_retries);
            dispatch.completion.failure("boom");
        }

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Failed { task, error } = event {
                assert_eq!(task.id, id);
                assert_eq!(task.retry_count, 2);
                assert_eq!(error, "boom");
                failures += 1;
            }
        }
        assert_eq!(failures, 1);

        // Nothing is re-enqueued afterwards
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.queue_length(), 0);
        assert_eq!(queue.stats().total_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let (queue, _rx) = TaskQueue::<u32>::new(QueueConfig {
            max_jitter: Duration::from_secs(1),
            ..Default::default()
        });
        assert!(queue.backoff(0) >= Duration::from_secs(1));
        assert!(queue.backoff(1) >= Duration::from_millis(1500));
        for retry_count in 0..20 {
            assert!(queue.backoff(retry_count) <= Duration::from_secs(30));
        }
        assert_eq!(queue.backoff(19), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_retry_count_still_retries_at_cap() {
        let (queue, mut rx) = TaskQueue::new(config(1, Duration::ZERO));
        let mut events = queue.subscribe();
        let id = queue.enqueue(
            TaskKind::DetailFetch,
            7,
            EnqueueOptions {
                max_retries: Some(500),
                ..Default::default()
            },
        );

        let dispatch = next(&mut rx).await;
        if let Some(task) = queue.shared.lock().in_flight.get_mut(&id) {
            task.retry_count = 200;
        }
        dispatch.completion.failure("boom");

        match events.try_recv() {
            Ok(QueueEvent::Retrying {
                task,
                attempt,
                backoff,
            }) => {
                assert_eq!(task.id, id);
                assert_eq!(attempt, 201);
                assert_eq!(backoff, Duration::from_secs(30));
            }
            other => panic!("expected a retry, got {:?}", other),
        }
        assert_eq!(queue.queue_length(), 1);
        assert_eq!(queue.backoff(u32::MAX), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(next(&mut rx).await.task.retry_count, 201);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_dispatch_while_paused() {
        let (queue, mut rx) = TaskQueue::new(config(2, Duration::ZERO));
        let mut events = queue.subscribe();

        queue.enqueue(TaskKind::DetailFetch, 1, EnqueueOptions::default());
        let in_flight = next(&mut rx).await;

        queue.pause();
        queue.enqueue(TaskKind::DetailFetch, 2, EnqueueOptions::default());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        // The task already in flight still completes normally
        in_flight.completion.success(json!(null));
        assert!(matches!(
            events.recv().await.unwrap(),
            QueueEvent::Completed { .. }
        ));
        assert_eq!(queue.active_tasks_count(), 0);
        assert_eq!(queue.queue_length(), 1);

        queue.resume();
        assert_eq!(next(&mut rx).await.task.payload, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spaces_dispatches() {
        let rate_limit = Duration::from_millis(250);
        let (queue, mut rx) = TaskQueue::new(config(4, rate_limit));
        for payload in 0..4u32 {
            queue.enqueue(TaskKind::DetailFetch, payload, EnqueueOptions::default());
        }

        let mut times = Vec::new();
        let mut held = Vec::new();
        for _ in 0..4 {
            let dispatch = next(&mut rx).await;
            times.push(Instant::now());
            held.push(dispatch);
        }
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= rate_limit);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        let (queue, mut rx) = TaskQueue::new(config(2, Duration::ZERO));
        for payload in 0..3u32 {
            queue.enqueue(TaskKind::DetailFetch, payload, EnqueueOptions::default());
        }

        let first = next(&mut rx).await;
        let _second = next(&mut rx).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.active_tasks_count(), 2);

        first.completion.success(json!(null));
        assert_eq!(next(&mut rx).await.task.payload, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_before_dispatch() {
        let (queue, mut rx) = TaskQueue::new(config(1, Duration::ZERO));
        queue.pause();
        let waiting = queue.enqueue(TaskKind::DetailFetch, 1, EnqueueOptions::default());
        assert!(queue.cancel(&waiting));
        assert!(!queue.cancel(&waiting));

        let dispatched = queue.enqueue(TaskKind::DetailFetch, 2, EnqueueOptions::default());
        queue.resume();
        let dispatch = next(&mut rx).await;
        assert_eq!(dispatch.task.id, dispatched);

        assert!(!queue.cancel(&dispatched));
        assert_eq!(queue.active_tasks_count(), 1);
        assert_eq!(queue.queue_length(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_completion_counts_as_failure() {
        let (queue, mut rx) = TaskQueue::new(config(1, Duration::ZERO));
        let mut events = queue.subscribe();
        queue.enqueue(TaskKind::DetailFetch, 1, EnqueueOptions::default());

        drop(next(&mut rx).await);
        assert!(matches!(
            events.recv().await.unwrap(),
            QueueEvent::Retrying { attempt: 1, .. }
        ));
        assert_eq!(queue.active_tasks_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_explicit_id_is_ignored() {
        let (queue, _rx) = TaskQueue::<u32>::new(config(1, Duration::ZERO));
        queue.pause();
        let options = EnqueueOptions {
            id: Some("detail:abc".to_string()),
            ..Default::default()
        };
        queue.enqueue(TaskKind::DetailFetch, 1, options.clone());
        queue.enqueue(TaskKind::DetailFetch, 2, options);
        assert_eq!(queue.queue_length(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_failures_wait_for_resume() {
        let (queue, mut rx) = TaskQueue::new(config(3, Duration::ZERO));
        for payload in 0..3u32 {
            queue.enqueue(TaskKind::DetailFetch, payload, EnqueueOptions::default());
        }
        let mut in_flight = Vec::new();
        for _ in 0..3 {
            in_flight.push(next(&mut rx).await);
        }

        queue.pause();
        for dispatch in in_flight {
            dispatch.completion.failure("page closed");
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.queue_length(), 3);

        queue.resume();
        let mut payloads = Vec::new();
        for _ in 0..3 {
            let dispatch = next(&mut rx).await;
            assert_eq!(dispatch.task.retry_count, 1);
            payloads.push(dispatch.task.payload);
            dispatch.completion.success(json!(null));
        }
        payloads.sort();
        assert_eq!(payloads, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_keeps_in_flight() {
        let (queue, mut rx) = TaskQueue::new(config(1, Duration::ZERO));
        queue.enqueue(TaskKind::DetailFetch, 1, EnqueueOptions::default());
        let dispatch = next(&mut rx).await;
        queue.enqueue(TaskKind::DetailFetch, 2, EnqueueOptions::default());

        assert_eq!(queue.clear(), 1);
        assert_eq!(queue.active_tasks_count(), 1);
        assert!(queue.complete(&dispatch.task.id.clone(), Ok(json!(null))));
        assert_eq!(queue.active_tasks_count(), 0);
    }
}
