//! Worker pool: admission, concurrent processing and graceful shutdown.
//!
//! Lifecycle:
//! - created: deliveries are accepted and queued, nothing is processed
//! - running: `concurrency` processors pull from the queue
//! - draining: admission closed, processors keep emptying the queue
//! - stopping: no processor starts another message; in-flight work finishes
//! - stopped: leftovers abandoned, strategies torn down

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::broker::{BrokerConsumer, Delivery};
use crate::config::{AckMode, PriorityRule, Settings, WorkerSettings};
use crate::core::{Message, Priority, PriorityQueue, QueueStats, QueuedEntry};
use crate::error::{Error, Result};
use crate::pipeline::StrategyOrchestrator;

use super::classify::{Disposition, FailureClassifier, KeywordClassifier};

/// Pick the band for a freshly received message.
///
/// Retries go to the low band. A payload whose marker field contains the
/// rule's marker, ignoring case, is high priority. Everything else is normal.
pub fn assign_priority(message: &Message, rule: &PriorityRule) -> Priority {
    if message.retry_count > 0 {
        return Priority::Low;
    }
    let marker = rule.marker.to_lowercase();
    let privileged = !marker.is_empty()
        && message
            .payload_at(&rule.marker_path)
            .and_then(Value::as_str)
            .map_or(false, |value| value.to_lowercase().contains(marker.as_str()));
    if privileged {
        Priority::High
    } else {
        Priority::Normal
    }
}

/// Pool tuning, usually taken from [`WorkerSettings`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub concurrency: usize,
    pub max_retries: u32,
    pub ack_mode: AckMode,
    /// Zero disables periodic stats logging
    pub stats_interval: Duration,
    pub priority: PriorityRule,
}

impl PoolOptions {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            max_retries: settings.max_retries,
            ack_mode: settings.ack_mode,
            stats_interval: Duration::from_secs(settings.stats_interval_secs),
            priority: settings.priority.clone(),
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPhase {
    Created,
    Running,
    Draining,
    Stopping,
    Stopped,
}

impl fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolPhase::Created => "created",
            PoolPhase::Running => "running",
            PoolPhase::Draining => "draining",
            PoolPhase::Stopping => "stopping",
            PoolPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    abandoned: AtomicU64,
    in_flight: AtomicU64,
    /// Dequeued entries whose disposition is settled
    finished: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub phase: PoolPhase,
    pub uptime_secs: f64,
    pub concurrency: usize,
    /// Deliveries offered to `submit`
    pub received: u64,
    pub enqueued: u64,
    /// Refused for capacity or because admission was closed
    pub rejected: u64,
    /// Runs that succeeded
    pub processed: u64,
    /// Unsuccessful runs plus unparseable deliveries
    pub failed: u64,
    pub requeued: u64,
    /// Messages given up on after a failure
    pub dropped: u64,
    /// Still queued when the pool stopped
    pub abandoned: u64,
    pub in_flight: u64,
    pub queue: QueueStats,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Worker Pool Stats:")?;
        writeln!(f, "  Phase:      {}", self.phase)?;
        writeln!(f, "  Uptime:     {:.1}s", self.uptime_secs)?;
        writeln!(f, "  Processors: {}", self.concurrency)?;
        writeln!(f, "  Received:   {}", self.received)?;
        writeln!(f, "  Enqueued:   {}", self.enqueued)?;
        writeln!(f, "  Rejected:   {}", self.rejected)?;
        writeln!(f, "  Processed:  {}", self.processed)?;
        writeln!(f, "  Failed:     {}", self.failed)?;
        writeln!(f, "  Requeued:   {}", self.requeued)?;
        writeln!(f, "  Dropped:    {}", self.dropped)?;
        writeln!(f, "  Abandoned:  {}", self.abandoned)?;
        writeln!(f, "  In flight:  {}", self.in_flight)?;
        write!(f, "{}", self.queue)
    }
}

struct Shared {
    queue: Arc<PriorityQueue>,
    orchestrator: Arc<StrategyOrchestrator>,
    classifier: Arc<dyn FailureClassifier>,
    options: PoolOptions,
    counters: Counters,
    phase: Mutex<PoolPhase>,
    accepting: watch::Sender<bool>,
    stop: watch::Sender<bool>,
    /// Signalled whenever a processor settles a message
    settled: Notify,
    started_at: Instant,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, PoolPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: PoolPhase) {
        *self.phase() = phase;
        tracing::debug!(%phase, "Worker pool phase changed");
    }

    fn snapshot(&self) -> PoolStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PoolStats {
            phase: *self.phase(),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            concurrency: self.options.concurrency,
            received: load(&c.received),
            enqueued: load(&c.enqueued),
            rejected: load(&c.rejected),
            processed: load(&c.processed),
            failed: load(&c.failed),
            requeued: load(&c.requeued),
            dropped: load(&c.dropped),
            abandoned: load(&c.abandoned),
            in_flight: load(&c.in_flight),
            queue: self.queue.stats(),
        }
    }

    /// Nothing queued and every dequeued entry settled.
    fn is_idle(&self) -> bool {
        let queue = self.queue.stats();
        queue.size == 0 && queue.total_dequeued == self.counters.finished.load(Ordering::Acquire)
    }

    async fn wait_until_idle(&self) {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if self.is_idle() {
                return;
            }
            settled.await;
        }
    }

    async fn process(&self, entry: QueuedEntry, processor: usize) {
        let QueuedEntry {
            mut message,
            enqueued_at,
            ..
        } = entry;

        tracing::info!(
            processor,
            message_id = %message.id,
            priority = %message.priority,
            retry_count = message.retry_count,
            waited_ms = enqueued_at.elapsed().as_secs_f64() * 1000.0,
            "Processing message"
        );

        let result = self.orchestrator.run(&message).await;

        if result.success {
            bump(&self.counters.processed);
            if let Some(handle) = message.delivery.take() {
                if let Err(e) = handle.ack().await {
                    tracing::error!(tag = handle.tag(), "Failed to ack delivery: {}", e);
                }
            }
            tracing::info!(
                message_id = %message.id,
                elapsed_ms = result.elapsed_ms,
                "Message processed successfully"
            );
            return;
        }

        bump(&self.counters.failed);
        let error = result.errors().join("; ");
        let max_retries = self.options.max_retries;

        match self.classifier.classify(&message, &result, max_retries) {
            Disposition::Retry if message.retry_count < max_retries => {
                let delivery = message.delivery.clone();
                let message_id = message.id.clone();
                match self.queue.requeue(message, true) {
                    Ok(_) => {
                        bump(&self.counters.requeued);
                        tracing::warn!(message_id = %message_id, %error, "Message failed, requeued for retry");
                    }
                    Err(e) => {
                        bump(&self.counters.dropped);
                        tracing::error!(message_id = %message_id, %error, "Could not requeue failed message: {}", e);
                        if let Some(handle) = delivery {
                            if let Err(e) = handle.nack(true).await {
                                tracing::error!(tag = handle.tag(), "Failed to nack delivery: {}", e);
                            }
                        }
                    }
                }
            }
            _ => {
                bump(&self.counters.dropped);
                tracing::error!(
                    message_id = %message.id,
                    retry_count = message.retry_count,
                    %error,
                    "Dropping message after terminal failure"
                );
                if let Some(handle) = message.delivery.take() {
                    if let Err(e) = handle.nack(false).await {
                        tracing::error!(tag = handle.tag(), "Failed to nack delivery: {}", e);
                    }
                }
            }
        }
    }
}

async fn run_processor(shared: Arc<Shared>, processor: usize) {
    let mut stop = shared.stop.subscribe();
    tracing::debug!(processor, "Processor started");

    loop {
        if *stop.borrow_and_update() {
            break;
        }
        let entry = tokio::select! {
            biased;
            _ = stop.changed() => break,
            entry = shared.queue.dequeue() => entry,
        };

        shared.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        shared.process(entry, processor).await;
        shared.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        shared.counters.finished.fetch_add(1, Ordering::Release);
        shared.settled.notify_waiters();
    }

    tracing::debug!(processor, "Processor stopped");
}

async fn run_monitor(shared: Arc<Shared>, mut stop: watch::Receiver<bool>, interval: Duration) {
    if *stop.borrow_and_update() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let stats = shared.snapshot();
                tracing::info!(
                    phase = %stats.phase,
                    queued = stats.queue.size,
                    in_flight = stats.in_flight,
                    processed = stats.processed,
                    failed = stats.failed,
                    requeued = stats.requeued,
                    avg_wait_ms = stats.queue.avg_wait_ms,
                    "Worker pool stats"
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Concurrent processors sharing one priority queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    processors: Mutex<Vec<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<PriorityQueue>,
        orchestrator: Arc<StrategyOrchestrator>,
        classifier: Arc<dyn FailureClassifier>,
        options: PoolOptions,
    ) -> Self {
        let (accepting, _) = watch::channel(true);
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                queue,
                orchestrator,
                classifier,
                options,
                counters: Counters::default(),
                phase: Mutex::new(PoolPhase::Created),
                accepting,
                stop,
                settled: Notify::new(),
                started_at: Instant::now(),
            }),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            processors: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Build the queue and pool from settings with the keyword classifier.
    pub fn from_settings(settings: &Settings, orchestrator: Arc<StrategyOrchestrator>) -> Self {
        Self::new(
            Arc::new(PriorityQueue::new(settings.queue.max_size)),
            orchestrator,
            Arc::new(KeywordClassifier::default()),
            PoolOptions::from_settings(&settings.worker),
        )
    }

    /// Set up strategies and spawn the processors.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Config("Worker pool already started".to_string()));
        }
        if let Err(e) = self.shared.orchestrator.setup_all().await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }

        let concurrency = self.shared.options.concurrency;
        {
            let mut processors = lock(&self.processors);
            for processor in 0..concurrency {
                processors.push(tokio::spawn(run_processor(self.shared.clone(), processor)));
            }
        }

        let interval = self.shared.options.stats_interval;
        if !interval.is_zero() {
            let stop = self.shared.stop.subscribe();
            *lock(&self.monitor) = Some(tokio::spawn(run_monitor(self.shared.clone(), stop, interval)));
        }

        self.shared.set_phase(PoolPhase::Running);
        tracing::info!(
            concurrency,
            ack_mode = ?self.shared.options.ack_mode,
            "Worker pool started"
        );
        Ok(())
    }

    /// Admit one raw delivery.
    ///
    /// Unparseable bodies are rejected to the broker's dead-letter path. A
    /// delivery that cannot be queued is left un-acked so the broker
    /// redelivers it.
    pub async fn submit(&self, delivery: Delivery) -> Result<Priority> {
        let shared = &self.shared;
        bump(&shared.counters.received);

        if !self.is_accepting() {
            bump(&shared.counters.rejected);
            tracing::warn!(tag = delivery.tag(), "Not accepting deliveries, leaving un-acked");
            return Err(Error::ShuttingDown);
        }

        let (body, handle) = delivery.into_parts();
        let mut message = match Message::from_slice(&body) {
            Ok(message) => message,
            Err(e) => {
                bump(&shared.counters.failed);
                tracing::error!(tag = handle.tag(), "Discarding unparseable delivery: {}", e);
                if let Err(nack_err) = handle.nack(false).await {
                    tracing::error!(tag = handle.tag(), "Failed to nack delivery: {}", nack_err);
                }
                return Err(e);
            }
        };

        let priority = assign_priority(&message, &shared.options.priority);
        let message_id = message.id.clone();
        if shared.options.ack_mode == AckMode::OnCompletion {
            message.delivery = Some(handle.clone());
        }

        if let Err(e) = shared.queue.try_enqueue(message, priority) {
            bump(&shared.counters.rejected);
            tracing::warn!(message_id = %message_id, tag = handle.tag(), "Could not queue delivery, leaving un-acked: {}", e);
            return Err(e);
        }
        bump(&shared.counters.enqueued);

        if shared.options.ack_mode == AckMode::OnEnqueue {
            if let Err(e) = handle.ack().await {
                tracing::error!(tag = handle.tag(), "Failed to ack delivery: {}", e);
            }
        }

        tracing::info!(message_id = %message_id, %priority, "Message received and queued");
        Ok(priority)
    }

    /// Pull deliveries from `consumer` until it ends or admission closes.
    ///
    /// Waits for queue capacity before taking the next delivery. Returns the
    /// number of deliveries queued.
    pub async fn consume<C: BrokerConsumer>(&self, mut consumer: C) -> u64 {
        let mut accepting = self.shared.accepting.subscribe();
        let mut queued = 0;
        tracing::info!("Consuming deliveries");

        loop {
            if !*accepting.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;
                _ = accepting.changed() => continue,
                _ = self.shared.queue.wait_for_space() => {}
            }

            let delivery = tokio::select! {
                biased;
                _ = accepting.changed() => continue,
                delivery = consumer.next_delivery() => delivery,
            };
            let Some(delivery) = delivery else {
                tracing::info!("Delivery source exhausted");
                break;
            };

            match self.submit(delivery).await {
                Ok(_) => queued += 1,
                Err(Error::ShuttingDown) => break,
                Err(e) => tracing::warn!("Delivery not queued: {}", e),
            }
        }

        tracing::info!(queued, "Stopped consuming deliveries");
        queued
    }

    /// Stop gracefully and return the final stats.
    ///
    /// Admission closes first. Processors then drain the queue for up to
    /// `timeout`. After that no processor starts another message, and this
    /// waits for the in-flight ones. Whatever is still queued is abandoned
    /// (un-acked), and finally every strategy is torn down.
    pub async fn shutdown(&self, timeout: Duration) -> PoolStats {
        let shared = &self.shared;
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return self.stats();
        }

        shared.accepting.send_replace(false);
        shared.set_phase(PoolPhase::Draining);
        tracing::info!(
            queued = shared.queue.len(),
            timeout_secs = timeout.as_secs_f64(),
            "Shutting down worker pool"
        );

        if self.started.load(Ordering::Acquire) {
            match tokio::time::timeout(timeout, shared.wait_until_idle()).await {
                Ok(()) => tracing::info!("Queue drained"),
                Err(_) => tracing::warn!(
                    queued = shared.queue.len(),
                    "Drain timeout reached, stopping with messages still queued"
                ),
            }
        }

        shared.set_phase(PoolPhase::Stopping);
        shared.stop.send_replace(true);

        let processors = std::mem::take(&mut *lock(&self.processors));
        for processor in processors {
            if let Err(e) = processor.await {
                tracing::error!("Processor task failed: {}", e);
            }
        }
        let monitor = lock(&self.monitor).take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                tracing::error!("Stats monitor task failed: {}", e);
            }
        }

        let leftovers = shared.queue.clear();
        let ack_mode = shared.options.ack_mode;
        for entry in &leftovers {
            match ack_mode {
                AckMode::OnEnqueue => tracing::error!(
                    message_id = %entry.message.id,
                    priority = %entry.priority(),
                    ?ack_mode,
                    "Abandoning queued message; already acked, it will not be redelivered"
                ),
                AckMode::OnCompletion => tracing::warn!(
                    message_id = %entry.message.id,
                    priority = %entry.priority(),
                    ?ack_mode,
                    "Abandoning queued message; left un-acked for redelivery"
                ),
            }
        }
        shared
            .counters
            .abandoned
            .fetch_add(leftovers.len() as u64, Ordering::Relaxed);

        let teardown_failures = shared.orchestrator.teardown_all().await;
        if teardown_failures > 0 {
            tracing::warn!(teardown_failures, "Some strategies failed to tear down");
        }

        shared.set_phase(PoolPhase::Stopped);
        let stats = self.stats();
        tracing::info!("Worker pool stopped\n{}", stats);
        stats
    }

    /// Non-blocking snapshot of the counters and the queue.
    pub fn stats(&self) -> PoolStats {
        self.shared.snapshot()
    }

    pub fn phase(&self) -> PoolPhase {
        *self.shared.phase()
    }

    pub fn is_accepting(&self) -> bool {
        *self.shared.accepting.borrow()
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.shared.queue
    }

    pub fn orchestrator(&self) -> &Arc<StrategyOrchestrator> {
        &self.shared.orchestrator
    }
}
