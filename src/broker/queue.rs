use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::EngineError;

use super::{Job, JobKind, JobPayload, TaskBroker};

struct ReadyJob {
    priority: u8,
    seq: u64,
    job: Job,
}

impl PartialEq for ReadyJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for ReadyJob {}

impl PartialOrd for ReadyJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayedJob {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for DelayedJob {}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap turned min-heap: the soonest due time wins.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<ReadyJob>,
    delayed: BinaryHeap<DelayedJob>,
}

/// In-process durable-queue stand-in with the delivery semantics the
/// engine relies on: three logical queues, priority 0..=10, delayed
/// scheduling, at-least-once delivery with late acknowledgement, and a
/// bounded per-kind redelivery budget.
///
/// A [`Delivery`] dropped without being settled goes straight back to
/// its queue, which is what a lost worker looks like from the outside.
pub struct InProcessBroker {
    queues: HashMap<JobKind, Mutex<QueueState>>,
    notify: Notify,
    seq: AtomicU64,
}

impl InProcessBroker {
    pub fn new() -> Self {
        let mut queues = HashMap::new();
        for kind in JobKind::ALL {
            queues.insert(kind, Mutex::new(QueueState::default()));
        }
        Self {
            queues,
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    fn queue(&self, kind: JobKind) -> &Mutex<QueueState> {
        // Populated for every kind in `new`.
        &self.queues[&kind]
    }

    fn push_ready(&self, job: Job) {
        let seq = self.next_seq();
        let mut state = self.queue(job.kind()).lock();
        state.ready.push(ReadyJob {
            priority: job.priority,
            seq,
            job,
        });
        drop(state);
        self.notify.notify_one();
    }

    fn push_delayed(&self, job: Job, due: Instant) {
        let seq = self.next_seq();
        let mut state = self.queue(job.kind()).lock();
        state.delayed.push(DelayedJob { due, seq, job });
        drop(state);
        self.notify.notify_one();
    }

    /// Move due delayed jobs into the ready heaps; returns the earliest
    /// still-pending due time, if any.
    fn promote_due(&self, now: Instant) -> Option<Instant> {
        let mut next_due: Option<Instant> = None;
        for kind in JobKind::ALL {
            let mut state = self.queue(kind).lock();
            while let Some(head) = state.delayed.peek() {
                if head.due > now {
                    next_due = Some(match next_due {
                        Some(current) => current.min(head.due),
                        None => head.due,
                    });
                    break;
                }
                let Some(delayed) = state.delayed.pop() else {
                    break;
                };
                state.ready.push(ReadyJob {
                    priority: delayed.job.priority,
                    seq: delayed.seq,
                    job: delayed.job,
                });
            }
        }
        next_due
    }

    fn try_pop(self: &Arc<Self>) -> Option<Delivery> {
        for kind in JobKind::ALL {
            let mut state = self.queue(kind).lock();
            if let Some(ready) = state.ready.pop() {
                return Some(Delivery {
                    job: ready.job,
                    settled: false,
                    broker: Arc::clone(self),
                });
            }
        }
        None
    }

    /// Acquire exactly one unit of work, waiting until something is due.
    /// One consumer pulls one job at a time (prefetch 1).
    pub async fn consume(self: &Arc<Self>) -> Delivery {
        loop {
            let notified = self.notify.notified();
            let next_due = self.promote_due(Instant::now());

            if let Some(delivery) = self.try_pop() {
                return delivery;
            }

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Jobs currently queued (ready or delayed), across all queues.
    pub fn depth(&self) -> usize {
        JobKind::ALL
            .iter()
            .map(|kind| {
                let state = self.queue(*kind).lock();
                state.ready.len() + state.delayed.len()
            })
            .sum()
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBroker for InProcessBroker {
    async fn enqueue(
        &self,
        payload: JobPayload,
        priority: u8,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<String, EngineError> {
        let job = Job::new(payload, priority);
        let task_id = job.id.clone();

        let delay = scheduled_at
            .map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);

        if delay.is_zero() {
            self.push_ready(job);
        } else {
            self.push_delayed(job, Instant::now() + delay);
        }
        Ok(task_id)
    }

    async fn schedule_retry(
        &self,
        payload: JobPayload,
        delay: Duration,
    ) -> Result<String, EngineError> {
        let job = Job::new(payload, super::DEFAULT_PRIORITY);
        let task_id = job.id.clone();
        self.push_delayed(job, Instant::now() + delay);
        Ok(task_id)
    }
}

/// One in-flight unit of work.
///
/// Acknowledge with [`Delivery::ack`] only after the work reached a
/// terminal outcome; [`Delivery::nack`] returns it to the queue with a
/// delay, until the kind's delivery budget runs out. Dropping an
/// unsettled delivery requeues the job immediately (worker lost).
pub struct Delivery {
    job: Job,
    settled: bool,
    broker: Arc<InProcessBroker>,
}

impl Delivery {
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Late acknowledgement: the job is done and will not be redelivered.
    pub fn ack(mut self) {
        self.settled = true;
    }

    /// Return the job to its queue after a transient failure.
    ///
    /// Fails with [`EngineError::RetryExhausted`] when the kind's
    /// delivery budget is consumed; the job is dropped in that case.
    pub fn nack(mut self) -> Result<(), EngineError> {
        self.settled = true;

        let mut job = self.job.clone();
        job.delivery_count += 1;
        if job.delivery_count >= job.kind().max_deliveries() {
            return Err(EngineError::RetryExhausted {
                attempts: job.delivery_count,
            });
        }
        let due = Instant::now() + job.kind().retry_delay();
        self.broker.push_delayed(job, due);
        Ok(())
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut job = self.job.clone();
        job.delivery_count += 1;
        log::warn!(
            "worker lost while holding job {}; returning it to the {} queue",
            job.id,
            job.kind().queue_name()
        );
        if job.delivery_count >= job.kind().max_deliveries() {
            log::error!(
                "job {} dropped after {} deliveries",
                job.id,
                job.delivery_count
            );
            return;
        }
        self.broker.push_ready(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::CleanupTask;
    use uuid::Uuid;

    fn run_payload() -> JobPayload {
        JobPayload::RunWorkflow {
            execution_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn delivers_higher_priority_first() {
        let broker = Arc::new(InProcessBroker::new());
        let low = broker.enqueue(run_payload(), 1, None).await.unwrap();
        let high = broker.enqueue(run_payload(), 9, None).await.unwrap();

        let first = broker.consume().await;
        assert_eq!(first.job().id, high);
        first.ack();

        let second = broker.consume().await;
        assert_eq!(second.job().id, low);
        second.ack();

        assert_eq!(broker.depth(), 0);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let broker = Arc::new(InProcessBroker::new());
        let a = broker.enqueue(run_payload(), 5, None).await.unwrap();
        let b = broker.enqueue(run_payload(), 5, None).await.unwrap();

        let first = broker.consume().await;
        assert_eq!(first.job().id, a);
        first.ack();
        let second = broker.consume().await;
        assert_eq!(second.job().id, b);
        second.ack();
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_jobs_wait_until_due() {
        let broker = Arc::new(InProcessBroker::new());
        broker
            .enqueue(
                run_payload(),
                5,
                Some(Utc::now() + chrono::Duration::seconds(30)),
            )
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(60), broker.consume())
            .await
            .expect("job became due within the window");
        delivery.ack();
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_until_budget_is_spent() {
        let broker = Arc::new(InProcessBroker::new());
        broker
            .enqueue(
                JobPayload::Cleanup {
                    task: CleanupTask::OrphanedNodes,
                },
                5,
                None,
            )
            .await
            .unwrap();

        // Cleanup jobs allow three deliveries: two nacks redeliver, the
        // third settles as exhausted.
        let first = broker.consume().await;
        first.nack().unwrap();

        let second = tokio::time::timeout(Duration::from_secs(120), broker.consume())
            .await
            .expect("first redelivery");
        second.nack().unwrap();

        let third = tokio::time::timeout(Duration::from_secs(120), broker.consume())
            .await
            .expect("second redelivery");
        let err = third.nack().unwrap_err();
        assert!(matches!(err, EngineError::RetryExhausted { attempts: 3 }));
        assert_eq!(broker.depth(), 0);
    }

    #[tokio::test]
    async fn dropped_delivery_is_requeued() {
        let broker = Arc::new(InProcessBroker::new());
        broker.enqueue(run_payload(), 5, None).await.unwrap();

        {
            let _delivery = broker.consume().await;
            // Worker dies without settling.
        }

        assert_eq!(broker.depth(), 1);
        let redelivered = broker.consume().await;
        assert_eq!(redelivered.job().delivery_count, 1);
        redelivered.ack();
    }
}
