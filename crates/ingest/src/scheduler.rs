//! Bounded-parallel execution of independent units.
//!
//! [`TaskScheduler`] runs a known batch (channels of a reconciliation, messages
//! of a page) and reports per-unit outcomes by index. [`BoundedDispatcher`]
//! serves an open-ended stream of jobs, such as live listener messages.

use std::{any::Any, collections::HashMap, future::Future, sync::Arc};

use {
    tokio::{sync::Semaphore, task::JoinSet},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::progress::{ProgressSink, SyncProgress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome<T> {
    Completed(T),
    /// The unit panicked or was aborted; the payload is the panic message.
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport<T> {
    /// Position of the unit in the submitted batch.
    pub index: usize,
    pub outcome: UnitOutcome<T>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleReport<T> {
    /// Finished units in completion order.
    pub finished: Vec<UnitReport<T>>,
    pub cancelled: bool,
    /// Units never started because of cancellation.
    pub not_started: usize,
}

impl<T> ScheduleReport<T> {
    /// Finished units in submission order.
    #[must_use]
    pub fn into_ordered(mut self) -> Vec<UnitReport<T>> {
        self.finished.sort_by_key(|r| r.index);
        self.finished
    }
}

pub struct TaskScheduler {
    max_parallel: usize,
    label: String,
}

impl TaskScheduler {
    /// A bound of 0 is raised to 1.
    #[must_use]
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            label: "units".into(),
        }
    }

    /// Noun used in progress statuses, e.g. "channels".
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Run `units` with at most `max_parallel` in flight.
    ///
    /// A freed slot goes to the next queued unit as soon as any running unit
    /// completes. Progress is reported once per completion. Cancellation stops
    /// new units from starting; running units finish.
    pub async fn run<T, Fut>(
        &self,
        units: Vec<Fut>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> ScheduleReport<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let total = units.len();
        let mut queue = units.into_iter().enumerate();
        let mut running = JoinSet::new();
        let mut positions = HashMap::with_capacity(total);
        let mut finished = Vec::with_capacity(total);
        let mut started = 0usize;

        loop {
            while running.len() < self.max_parallel && !cancel.is_cancelled() {
                let Some((index, unit)) = queue.next() else {
                    break;
                };
                let handle = running.spawn(unit);
                positions.insert(handle.id(), index);
                started += 1;
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let (id, outcome) = match joined {
                Ok((id, value)) => (id, UnitOutcome::Completed(value)),
                Err(err) => {
                    let id = err.id();
                    let message = if err.is_panic() {
                        panic_message(err.into_panic())
                    } else {
                        "unit aborted".to_string()
                    };
                    (id, UnitOutcome::Panicked(message))
                },
            };
            let Some(index) = positions.remove(&id) else {
                continue;
            };
            if let UnitOutcome::Panicked(message) = &outcome {
                warn!(index, %message, "scheduled unit panicked");
            }
            finished.push(UnitReport { index, outcome });
            progress.report(SyncProgress::new(
                finished.len(),
                total,
                format!("Completed {}/{} {}", finished.len(), total, self.label),
            ));
        }

        let not_started = total - started;
        let cancelled = cancel.is_cancelled();
        if cancelled {
            debug!(not_started, "schedule cancelled");
        }
        ScheduleReport {
            finished,
            cancelled,
            not_started,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Spawns jobs with at most `max_in_flight` running, reaping finished ones as
/// new jobs arrive.
pub struct BoundedDispatcher {
    semaphore: Arc<Semaphore>,
    workers: JoinSet<()>,
}

impl BoundedDispatcher {
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
            workers: JoinSet::new(),
        }
    }

    /// Wait for a free slot and spawn `job`. Returns `false` if the job could
    /// not be scheduled, including when `cancel` fires while waiting.
    pub async fn submit<F>(&mut self, job: F, cancel: &CancellationToken) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };
        self.workers.spawn(async move {
            let _permit = permit;
            job.await;
        });
        self.reap();
        true
    }

    /// Jobs spawned and not yet reaped.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.workers.len()
    }

    /// Await every outstanding job.
    pub async fn drain(mut self) {
        while let Some(result) = self.workers.join_next().await {
            log_join_result(result);
        }
    }

    fn reap(&mut self) {
        while let Some(result) = self.workers.try_join_next() {
            log_join_result(result);
        }
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        warn!(error = %err, "dispatched job failed");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::progress::{NoProgress, ProgressLog},
        rstest::rstest,
        std::{
            sync::atomic::{AtomicUsize, Ordering},
            time::Duration,
        },
    };

    fn tracked_units(
        n: usize,
        active: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
    ) -> Vec<impl Future<Output = usize> + Send + 'static> {
        (0..n)
            .map(|i| {
                let active = Arc::clone(active);
                let peak = Arc::clone(peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5 + (i % 3) as u64)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    i
                }
            })
            .collect()
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(20)]
    #[tokio::test]
    async fn never_exceeds_bound(#[case] bound: usize) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let units = tracked_units(bound * 2 + 5, &active, &peak);

        let report = TaskScheduler::new(bound)
            .run(units, &NoProgress, &CancellationToken::new())
            .await;

        assert!(peak.load(Ordering::SeqCst) <= bound);
        assert_eq!(report.finished.len(), bound * 2 + 5);
        assert!(!report.cancelled);
        let ordered: Vec<usize> = report
            .into_ordered()
            .into_iter()
            .map(|r| match r.outcome {
                UnitOutcome::Completed(v) => v,
                UnitOutcome::Panicked(m) => panic!("{m}"),
            })
            .collect();
        assert_eq!(ordered, (0..bound * 2 + 5).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_bounded() {
        let log = ProgressLog::new();
        let units: Vec<_> = (0..7).map(|i| async move { i }).collect();
        TaskScheduler::new(2)
            .with_label("channels")
            .run(units, &log, &CancellationToken::new())
            .await;

        let entries = log.entries();
        assert_eq!(entries.len(), 7);
        assert!(entries.windows(2).all(|w| w[0].current <= w[1].current));
        assert!(entries.iter().all(|p| p.percentage <= 100));
        let last = entries.last().unwrap();
        assert_eq!(last.percentage, 100);
        assert_eq!(last.status, "Completed 7/7 channels");
    }

    async fn explode() -> u32 {
        panic!("channel exploded")
    }

    #[tokio::test]
    async fn panicking_unit_is_reported_by_index() {
        let units: Vec<std::pin::Pin<Box<dyn Future<Output = u32> + Send>>> = vec![
            Box::pin(async { 1 }),
            Box::pin(explode()),
            Box::pin(async { 3 }),
        ];
        let report = TaskScheduler::new(2)
            .run(units, &NoProgress, &CancellationToken::new())
            .await;
        let ordered = report.into_ordered();
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].outcome, UnitOutcome::Completed(1));
        assert_eq!(
            ordered[1].outcome,
            UnitOutcome::Panicked("channel exploded".into())
        );
        assert_eq!(ordered[2].outcome, UnitOutcome::Completed(3));
    }

    #[tokio::test]
    async fn cancellation_stops_new_units() {
        let cancel = CancellationToken::new();
        let units: Vec<_> = (0..10)
            .map(|i| {
                let cancel = cancel.clone();
                async move {
                    if i == 0 {
                        cancel.cancel();
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    i
                }
            })
            .collect();

        let report = TaskScheduler::new(2).run(units, &NoProgress, &cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.finished.len(), 2);
        assert_eq!(report.not_started, 8);
    }

    #[tokio::test]
    async fn dispatcher_bounds_in_flight_jobs() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = BoundedDispatcher::new(3);
        let cancel = CancellationToken::new();

        for _ in 0..12 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            let job = async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(3)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            };
            assert!(dispatcher.submit(job, &cancel).await);
        }
        dispatcher.drain().await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(done.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn waiting_for_a_slot_gives_way_to_cancellation() {
        let mut dispatcher = BoundedDispatcher::new(1);
        let cancel = CancellationToken::new();
        assert!(dispatcher.submit(std::future::pending(), &cancel).await);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });
        let submitted = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.submit(async {}, &cancel),
        )
        .await
        .unwrap();
        assert!(!submitted);
        assert_eq!(dispatcher.in_flight(), 1);
    }
}
