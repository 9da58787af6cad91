//! Task scheduler — bounded-concurrency executor for model calls and
//! tool handlers.
//!
//! At most `limit` tasks execute at once. Excess requests wait in a
//! priority-ordered queue (FIFO within a priority class). A failing task
//! is retried immediately up to its configured extra attempts; the final
//! failure propagates with the attempt count. If a queued task's cancel
//! token fires before it starts, it is dropped without running; in-flight
//! tasks observe their token cooperatively.
//!
//! An explicit waiter queue (mutex + oneshot wakeups) is used instead of a
//! bare semaphore: the contract requires priority ordering and dropping
//! queued-but-unstarted work on cancellation. Queue mutations are
//! serialized behind one lock, so the contract holds under true
//! multi-threaded execution.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default concurrent-task ceiling.
pub const DEFAULT_LIMIT: usize = 4;

/// Queue priority hint. Higher runs first; FIFO within a class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Background work.
    Low,
    /// Tool handlers.
    #[default]
    Normal,
    /// Model calls — a stalled model call stalls the whole run.
    High,
}

/// Per-task options.
#[derive(Clone, Debug, Default)]
pub struct TaskOptions {
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Queue priority.
    pub priority: Priority,
    /// Abort signal. Queued tasks are dropped when it fires; running
    /// tasks are expected to observe it cooperatively.
    pub cancel: Option<CancellationToken>,
}

impl TaskOptions {
    /// Options with `retries` extra attempts.
    #[must_use]
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }
}

/// Successful task completion, with the attempt count that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskOutcome<T> {
    /// The task's value.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Scheduler failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The cancel token fired before or between attempts.
    #[error("task cancelled")]
    Cancelled,

    /// All attempts failed; carries the last error text.
    #[error("task failed after {attempts} attempt(s): {reason}")]
    Exhausted {
        /// Total attempts made.
        attempts: u32,
        /// Last error seen.
        reason: String,
    },
}

struct Waiter {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower seq (older) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    running: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

struct Shared {
    limit: usize,
    state: Mutex<QueueState>,
}

impl Shared {
    /// Release one slot: hand it to the next live waiter, or decrement.
    fn release(&self) {
        let mut state = self.state.lock();
        loop {
            match state.waiters.pop() {
                Some(waiter) => {
                    // A closed channel means the waiter was cancelled
                    // while queued; skip to the next one.
                    if waiter.tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.running -= 1;
                    return;
                }
            }
        }
    }
}

/// RAII slot guard — released when dropped.
struct Permit {
    shared: Arc<Shared>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Bounded-concurrency task scheduler, shared across all runs in the
/// process. Holds no domain knowledge.
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

impl TaskScheduler {
    /// Scheduler allowing at most `limit` concurrent tasks.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                limit: limit.max(1),
                state: Mutex::new(QueueState {
                    running: 0,
                    next_seq: 0,
                    waiters: BinaryHeap::new(),
                }),
            }),
        }
    }

    /// Number of tasks currently executing.
    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }

    /// Number of tasks waiting for a slot.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// Concurrency ceiling.
    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    async fn acquire(
        &self,
        priority: Priority,
        cancel: Option<&CancellationToken>,
    ) -> Result<Permit, SchedulerError> {
        if let Some(token) = cancel
            && token.is_cancelled()
        {
            return Err(SchedulerError::Cancelled);
        }

        let mut rx = {
            let mut state = self.shared.state.lock();
            if state.running < self.shared.limit {
                state.running += 1;
                return Ok(Permit {
                    shared: Arc::clone(&self.shared),
                });
            }
            let (tx, rx) = oneshot::channel();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.waiters.push(Waiter { priority, seq, tx });
            rx
        };

        match cancel {
            None => {
                // The sender is only dropped by a cancelled-waiter sweep,
                // which cannot apply to an uncancellable waiter.
                rx.await.map_err(|_| SchedulerError::Cancelled)?;
            }
            Some(token) => {
                tokio::select! {
                    granted = &mut rx => {
                        granted.map_err(|_| SchedulerError::Cancelled)?;
                    }
                    () = token.cancelled() => {
                        // The slot may have been handed to us in the same
                        // instant; give it back if so.
                        if rx.try_recv().is_ok() {
                            self.shared.release();
                        }
                        return Err(SchedulerError::Cancelled);
                    }
                }
            }
        }

        Ok(Permit {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Run `task` under the concurrency bound.
    ///
    /// `task` is an attempt factory: it is called with the 1-based attempt
    /// number and returns the future for that attempt.
    pub async fn enqueue<T, E, F, Fut>(
        &self,
        options: TaskOptions,
        task: F,
    ) -> Result<TaskOutcome<T>, SchedulerError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let permit = self
            .acquire(options.priority, options.cancel.as_ref())
            .await?;

        let mut attempts = 0;
        loop {
            if let Some(token) = &options.cancel
                && token.is_cancelled()
            {
                counter!("scheduler_tasks_total", "outcome" => "cancelled").increment(1);
                return Err(SchedulerError::Cancelled);
            }

            attempts += 1;
            match task(attempts).await {
                Ok(value) => {
                    drop(permit);
                    counter!("scheduler_tasks_total", "outcome" => "ok").increment(1);
                    debug!(attempts, "task completed");
                    return Ok(TaskOutcome { value, attempts });
                }
                Err(e) if attempts <= options.retries => {
                    // Immediate retry, no backoff.
                    warn!(attempt = attempts, error = %e, "task attempt failed, retrying");
                }
                Err(e) => {
                    drop(permit);
                    counter!("scheduler_tasks_total", "outcome" => "failed").increment(1);
                    return Err(SchedulerError::Exhausted {
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex as PlMutex;

    /// Occupy one slot until the sender side of `release_rx` fires.
    fn spawn_blocker(
        scheduler: &Arc<TaskScheduler>,
        release_rx: oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<Result<TaskOutcome<()>, SchedulerError>> {
        let scheduler = Arc::clone(scheduler);
        let slot = Arc::new(PlMutex::new(Some(release_rx)));
        tokio::spawn(async move {
            scheduler
                .enqueue(TaskOptions::default(), move |_| {
                    let slot = Arc::clone(&slot);
                    async move {
                        // One attempt only; the receiver is taken exactly once.
                        let rx = slot.lock().take();
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                        Ok::<_, String>(())
                    }
                })
                .await
        })
    }

    async fn settle() {
        // Let spawned tasks reach their suspension points.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn runs_a_task() {
        let scheduler = TaskScheduler::new(2);
        let outcome = scheduler
            .enqueue(TaskOptions::default(), |_| async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(outcome.value, 7);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        const LIMIT: usize = 3;
        const TASKS: usize = 20;

        let scheduler = Arc::new(TaskScheduler::new(LIMIT));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let scheduler = Arc::clone(&scheduler);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                scheduler
                    .enqueue(TaskOptions::default(), |_| {
                        let current = Arc::clone(&current);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            let _ = current.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, String>(())
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= LIMIT);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let scheduler = TaskScheduler::new(1);
        let outcome = scheduler
            .enqueue(TaskOptions::with_retries(2), |attempt| async move {
                if attempt < 3 {
                    Err(format!("attempt {attempt} failed"))
                } else {
                    Ok("ok")
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, "ok");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_propagate_last_error() {
        let scheduler = TaskScheduler::new(1);
        let err = scheduler
            .enqueue(TaskOptions::with_retries(1), |attempt| async move {
                Err::<(), _>(format!("boom {attempt}"))
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::Exhausted {
                attempts: 2,
                reason: "boom 2".into(),
            }
        );
    }

    #[tokio::test]
    async fn queued_task_dropped_on_cancel() {
        let scheduler = Arc::new(TaskScheduler::new(1));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Occupy the only slot.
        let blocker = spawn_blocker(&scheduler, release_rx);
        settle().await;
        assert_eq!(scheduler.running(), 1);

        // Queue a cancellable task behind it.
        let token = CancellationToken::new();
        let queued = {
            let scheduler = Arc::clone(&scheduler);
            let options = TaskOptions {
                cancel: Some(token.clone()),
                ..TaskOptions::default()
            };
            tokio::spawn(async move {
                scheduler
                    .enqueue(options, |_| async { Ok::<_, String>("ran") })
                    .await
            })
        };
        settle().await;
        assert_eq!(scheduler.queued(), 1);

        token.cancel();
        let result = queued.await.unwrap();
        assert_eq!(result.unwrap_err(), SchedulerError::Cancelled);

        // The blocker still finishes normally.
        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        assert_eq!(scheduler.running(), 0);
        assert_eq!(scheduler.queued(), 0);
    }

    #[tokio::test]
    async fn already_cancelled_never_runs() {
        let scheduler = TaskScheduler::new(1);
        let token = CancellationToken::new();
        token.cancel();
        let ran = AtomicUsize::new(0);

        let err = scheduler
            .enqueue(
                TaskOptions {
                    cancel: Some(token),
                    ..TaskOptions::default()
                },
                |_| {
                    let _ = ran.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>(()) }
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::Cancelled);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn high_priority_jumps_the_queue() {
        let scheduler = Arc::new(TaskScheduler::new(1));
        let order = Arc::new(PlMutex::new(Vec::<&'static str>::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = spawn_blocker(&scheduler, release_rx);
        settle().await;

        // Queue a normal-priority task first, then a high-priority one.
        let normal = {
            let scheduler = Arc::clone(&scheduler);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                scheduler
                    .enqueue(TaskOptions::default(), move |_| {
                        order.lock().push("normal");
                        async { Ok::<_, String>(()) }
                    })
                    .await
            })
        };
        settle().await;
        assert_eq!(scheduler.queued(), 1);

        let high = {
            let scheduler = Arc::clone(&scheduler);
            let order = Arc::clone(&order);
            let options = TaskOptions {
                priority: Priority::High,
                ..TaskOptions::default()
            };
            tokio::spawn(async move {
                scheduler
                    .enqueue(options, move |_| {
                        order.lock().push("high");
                        async { Ok::<_, String>(()) }
                    })
                    .await
            })
        };
        settle().await;
        assert_eq!(scheduler.queued(), 2);

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        high.await.unwrap().unwrap();
        normal.await.unwrap().unwrap();

        assert_eq!(*order.lock(), vec!["high", "normal"]);
    }

    #[tokio::test]
    async fn fifo_within_priority_class() {
        let scheduler = Arc::new(TaskScheduler::new(1));
        let order = Arc::new(PlMutex::new(Vec::<u32>::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = spawn_blocker(&scheduler, release_rx);
        settle().await;

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let scheduler = Arc::clone(&scheduler);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                scheduler
                    .enqueue(TaskOptions::default(), move |_| {
                        order.lock().push(i);
                        async { Ok::<_, String>(()) }
                    })
                    .await
            }));
            // Ensure each waiter is queued before the next arrives.
            settle().await;
        }
        assert_eq!(scheduler.queued(), 4);

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn limit_floor_is_one() {
        let scheduler = TaskScheduler::new(0);
        assert_eq!(scheduler.limit(), 1);
    }
}
