//! Bounded worker pool for bundle conversion
//!
//! A run lists the bundle's resources, queues one job per resource, and
//! starts `concurrency` workers that pull jobs until the queue is drained.
//! The first failing job stops the run: jobs still queued are discarded,
//! jobs already in flight finish, and the bundle is left incomplete.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::bus::PipelineBus;
use crate::config::ParserConfig;
use crate::error::{ParserError, Result};
use crate::pipeline::{convert_resource, ConversionOutcome};

/// FIFO job queue with completion tracking
///
/// Every item put on the queue must be acknowledged with [`WorkQueue::task_done`];
/// [`WorkQueue::join`] resolves once all of them have been.
#[derive(Debug)]
pub struct WorkQueue<T> {
    sender: Mutex<Option<mpsc::Sender<T>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<T>>,
    unfinished: AtomicUsize,
    cancelled: AtomicBool,
    drained: Notify,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            unfinished: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    /// Enqueue an item, waiting while the queue is full
    pub async fn put(&self, item: T) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            return Err(ParserError::Bundle("Work queue is closed".to_string()));
        };

        self.unfinished.fetch_add(1, Ordering::SeqCst);
        if sender.send(item).await.is_err() {
            self.task_done();
            return Err(ParserError::Bundle("Work queue is closed".to_string()));
        }
        Ok(())
    }

    /// Stop accepting items; `get` returns `None` once the rest are taken
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Next item, or `None` when the queue is closed and empty
    ///
    /// After [`WorkQueue::cancel`], remaining items are acknowledged and
    /// dropped instead of being returned.
    pub async fn get(&self) -> Option<T> {
        let mut receiver = self.receiver.lock().await;
        loop {
            let item = receiver.recv().await?;
            if !self.is_cancelled() {
                return Some(item);
            }
            self.task_done();
        }
    }

    /// Acknowledge one item taken with `get`
    pub fn task_done(&self) {
        let previous = self
            .unfinished
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.drained.notify_waiters(),
            Ok(_) => {},
            Err(_) => warn!("task_done called more often than items were queued"),
        }
    }

    /// Wait until every queued item has been acknowledged
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.unfinished.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Discard pending items; returns how many were dropped immediately
    pub fn cancel(&self) -> usize {
        self.cancelled.store(true, Ordering::SeqCst);
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return 0;
        };
        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            self.task_done();
            discarded += 1;
        }
        discarded
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Items queued but not yet acknowledged
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::SeqCst)
    }
}

/// Acknowledges a job when dropped, whether it succeeded or not
struct JobGuard<'a, T>(&'a WorkQueue<T>);

impl<T> Drop for JobGuard<'_, T> {
    fn drop(&mut self) {
        self.0.task_done();
    }
}

/// One resource to convert
#[derive(Debug, Clone)]
pub struct Job {
    pub resource_name: String,
    pub bundle_id: String,
    pub parser_config: Arc<ParserConfig>,
}

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub bundle_id: String,
    pub stage: String,
    /// Converted resources in completion order
    pub outcomes: Vec<ConversionOutcome>,
}

impl RunSummary {
    pub fn total_records(&self) -> u64 {
        self.outcomes.iter().map(|outcome| outcome.records).sum()
    }
}

/// Span carrying the identifiers of one run
pub fn run_span(data_registry_id: &str) -> Span {
    info_span!(
        "parser_run",
        run_id = %Uuid::new_v4(),
        data_registry_id = %data_registry_id,
        bundle_id = tracing::field::Empty,
    )
}

/// Convert every resource of the bundle named by the bus's change event
///
/// Log events are emitted inside `span`; each worker runs in a child span.
pub async fn run_parser(
    bus: Arc<dyn PipelineBus>,
    data_registry_id: &str,
    config: Arc<ParserConfig>,
    span: Span,
) -> Result<RunSummary> {
    let parent = span.clone();
    async move {
        info!(
            data_registry_id,
            concurrency = config.concurrency(),
            config_id = config.config_id(),
            "PARSER_STARTING"
        );

        match execute(bus, config, &parent).await {
            Ok(summary) => {
                info!(
                    bundle_id = %summary.bundle_id,
                    resources = summary.outcomes.len(),
                    records = summary.total_records(),
                    "PARSER_COMPLETED"
                );
                Ok(summary)
            },
            Err(e) => {
                error!(data_registry_id, error = %e, "PARSER_ERROR");
                Err(e)
            },
        }
    }
    .instrument(span)
    .await
}

async fn execute(bus: Arc<dyn PipelineBus>, config: Arc<ParserConfig>, span: &Span) -> Result<RunSummary> {
    let event = bus.get_change_event().await?;
    span.record("bundle_id", event.bundle_id.as_str());

    let metadata = bus.get_bundle_metadata(&event.bundle_id, &event.stage).await?;
    info!(bundle_id = %event.bundle_id, stage = %event.stage, metadata = %metadata, "BUNDLE_FOUND");

    let resources = bus.get_bundle_resource_list(&event.bundle_id).await?;
    info!(
        bundle_id = %event.bundle_id,
        count = resources.len(),
        resources = ?resources,
        "BUNDLE_RESOURCES"
    );
    if resources.is_empty() {
        return Err(ParserError::Bundle(format!(
            "Bundle {} has no resources to process",
            event.bundle_id
        )));
    }

    let queue = Arc::new(WorkQueue::new(resources.len()));
    for resource_name in resources {
        queue
            .put(Job {
                resource_name,
                bundle_id: event.bundle_id.clone(),
                parser_config: Arc::clone(&config),
            })
            .await?;
    }
    queue.close();

    let mut workers = JoinSet::new();
    for worker_id in 0..config.concurrency() {
        let worker = process_resource_worker(worker_id, Arc::clone(&queue), Arc::clone(&bus));
        workers.spawn(worker.instrument(info_span!(parent: span, "worker", worker_id)));
    }

    let mut outcomes = Vec::new();
    let mut failure = tokio::select! {
        _ = queue.join() => None,
        Some(e) = next_failure(&mut workers, &mut outcomes) => {
            let discarded = queue.cancel();
            warn!(discarded, "Discarding queued jobs after worker failure");
            Some(e)
        },
    };

    while let Some(joined) = workers.join_next().await {
        match worker_result(joined) {
            Ok(done) => outcomes.extend(done),
            Err(e) if failure.is_none() => {
                queue.cancel();
                failure = Some(e);
            },
            Err(e) => debug!(error = %e, "Additional worker failure"),
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }

    bus.complete_bundle(&event.bundle_id, json!({"completed_at": Utc::now().to_rfc3339()}))
        .await?;

    Ok(RunSummary {
        bundle_id: event.bundle_id,
        stage: event.stage,
        outcomes,
    })
}

type WorkerOutput = Result<Vec<ConversionOutcome>>;

fn worker_result(joined: std::result::Result<WorkerOutput, JoinError>) -> WorkerOutput {
    joined.map_err(ParserError::from).and_then(|output| output)
}

/// Collect finished workers until one fails; `None` once all succeeded
async fn next_failure(
    workers: &mut JoinSet<WorkerOutput>,
    outcomes: &mut Vec<ConversionOutcome>,
) -> Option<ParserError> {
    while let Some(joined) = workers.join_next().await {
        match worker_result(joined) {
            Ok(done) => outcomes.extend(done),
            Err(e) => return Some(e),
        }
    }
    None
}

async fn process_resource_worker(
    worker_id: usize,
    queue: Arc<WorkQueue<Job>>,
    bus: Arc<dyn PipelineBus>,
) -> WorkerOutput {
    let mut completed = Vec::new();

    while let Some(job) = queue.get().await {
        let _done = JobGuard(&queue);
        match process_job(&job, bus.as_ref()).await {
            Ok(outcome) => {
                info!(
                    resource = %outcome.resource_name,
                    output = %outcome.output_name,
                    records = outcome.records,
                    bytes = outcome.bytes,
                    "RESOURCE_COMPLETED"
                );
                completed.push(outcome);
            },
            Err(e) => {
                error!(worker_id, resource = %job.resource_name, error = %e, "WORKER_ERROR");
                return Err(ParserError::Worker {
                    resource: job.resource_name.clone(),
                    source: Box::new(e),
                });
            },
        }
    }

    debug!(worker_id, jobs = completed.len(), "Worker finished");
    Ok(completed)
}

async fn process_job(job: &Job, bus: &dyn PipelineBus) -> Result<ConversionOutcome> {
    let route = job.parser_config.resolve(&job.resource_name)?;
    debug!(
        resource = %job.resource_name,
        pattern = route.pattern(),
        strategy = route.strategy_name(),
        "Resolved parser"
    );
    convert_resource(bus, &job.bundle_id, &job.resource_name, route.parser()).await
}
