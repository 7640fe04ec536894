// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Connection Scheduler
//!
//! Wave-based concurrent bring-up of many upstreams. Wave *n* runs every
//! still-pending client under a per-attempt deadline that doubles each wave
//! (20 s base); a bounded worker pool pulls jobs from a channel so at most
//! `max_workers` connections are in flight. Jobs that fail are requeued onto
//! the next wave; the scheduler exits when the pending set drains or the
//! wave budget is consumed.
//!
//! The scheduler does no failure-policy work of its own — auto-disable is
//! the client's accounting, applied when the health loop hands control back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::domain::error::Result;
use crate::infrastructure::client::ManagedClient;

/// Anything the scheduler can drive. The indirection exists for the wave
/// tests; production code passes managed clients.
#[async_trait]
pub trait Connectable: Send + Sync + 'static {
    fn name(&self) -> String;

    async fn connect_with_deadline(&self, deadline: Duration) -> Result<()>;

    /// Whether a failed job should be requeued. Clients that were
    /// auto-disabled or user-stopped mid-run drop out of the retry queue.
    fn wants_retry(&self) -> bool {
        true
    }
}

#[async_trait]
impl Connectable for Arc<ManagedClient> {
    fn name(&self) -> String {
        ManagedClient::name(self).to_string()
    }

    async fn connect_with_deadline(&self, deadline: Duration) -> Result<()> {
        self.connect(deadline).await
    }

    fn wants_retry(&self) -> bool {
        self.wants_connection()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_waves: usize,
    /// Wave-1 deadline; doubled every subsequent wave.
    pub base_timeout: Duration,
    pub max_workers: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_waves: 5,
            base_timeout: Duration::from_secs(20),
            max_workers: 15,
        }
    }
}

/// Min/max/avg over a set of attempt durations.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TimingStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
}

impl TimingStats {
    fn from_durations(durations: &[Duration]) -> Self {
        if durations.is_empty() {
            return Self::default();
        }
        let min = durations.iter().min().copied().unwrap_or_default();
        let max = durations.iter().max().copied().unwrap_or_default();
        let sum: Duration = durations.iter().sum();
        Self {
            count: durations.len(),
            min_ms: min.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            avg_ms: (sum / durations.len() as u32).as_millis() as u64,
        }
    }
}

/// Aggregate result of one scheduler run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WaveReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Unique clients that needed at least one retry wave.
    pub retried: usize,
    pub waves_run: usize,
    pub all_attempts: TimingStats,
    pub successful_attempts: TimingStats,
}

/// Run the wave loop over `clients`.
///
/// Ordering: no guarantees across clients; within one client the wave
/// sequence is strict because waves are sequential.
pub async fn run<T: Connectable + Clone>(clients: Vec<T>, options: &SchedulerOptions) -> WaveReport {
    let total = clients.len();
    let mut pending = clients;
    let mut retried_names: HashSet<String> = HashSet::new();
    let mut successful = 0usize;
    let mut all_timings: Vec<Duration> = Vec::new();
    let mut success_timings: Vec<Duration> = Vec::new();
    let mut waves_run = 0usize;

    for wave in 0..options.max_waves {
        if pending.is_empty() {
            break;
        }
        waves_run += 1;
        let deadline = options.base_timeout * 2u32.pow(wave as u32);
        if wave > 0 {
            for client in &pending {
                retried_names.insert(client.name());
            }
        }
        debug!(wave = wave + 1, pending = pending.len(), ?deadline, "starting connection wave");

        let outcomes = run_wave(std::mem::take(&mut pending), deadline, options.max_workers).await;

        for (client, result, elapsed) in outcomes {
            all_timings.push(elapsed);
            match result {
                Ok(()) => {
                    successful += 1;
                    success_timings.push(elapsed);
                }
                Err(err) => {
                    debug!(server = %client.name(), %err, "wave attempt failed");
                    if client.wants_retry() {
                        pending.push(client);
                    }
                }
            }
        }
    }

    let report = WaveReport {
        total,
        successful,
        failed: total - successful,
        retried: retried_names.len(),
        waves_run,
        all_attempts: TimingStats::from_durations(&all_timings),
        successful_attempts: TimingStats::from_durations(&success_timings),
    };
    info!(
        total = report.total,
        successful = report.successful,
        failed = report.failed,
        retried = report.retried,
        waves = report.waves_run,
        "connection scheduling complete"
    );
    metrics::counter!("relay_scheduler_connect_success").increment(report.successful as u64);
    metrics::counter!("relay_scheduler_connect_failed").increment(report.failed as u64);
    report
}

/// One wave: a bounded worker pool draining a job channel.
async fn run_wave<T: Connectable + Clone>(
    jobs: Vec<T>,
    deadline: Duration,
    max_workers: usize,
) -> Vec<(T, Result<()>, Duration)> {
    let job_count = jobs.len();
    let workers = max_workers.max(1).min(job_count.max(1));

    let (job_tx, job_rx) = mpsc::channel::<T>(job_count.max(1));
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (done_tx, mut done_rx) = mpsc::channel::<(T, Result<()>, Duration)>(job_count.max(1));

    for job in jobs {
        // Capacity equals the job count; this never blocks.
        let _ = job_tx.send(job).await;
    }
    drop(job_tx);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let job_rx = Arc::clone(&job_rx);
        let done_tx = done_tx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let job = { job_rx.lock().await.recv().await };
                let Some(job) = job else { break };
                let started = Instant::now();
                let result = job.connect_with_deadline(deadline).await;
                let _ = done_tx.send((job, result, started.elapsed())).await;
            }
        }));
    }
    drop(done_tx);

    let mut outcomes = Vec::with_capacity(job_count);
    while let Some(outcome) = done_rx.recv().await {
        outcomes.push(outcome);
    }
    for handle in handles {
        let _ = handle.await;
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::RelayError;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[derive(Clone)]
    struct ScriptedClient {
        name: String,
        /// Succeed on the nth attempt (1-based); `None` never succeeds.
        succeeds_on: Option<u32>,
        attempts: Arc<AtomicU32>,
    }

    impl ScriptedClient {
        fn new(name: impl Into<String>, succeeds_on: Option<u32>) -> Self {
            Self {
                name: name.into(),
                succeeds_on,
                attempts: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connectable for ScriptedClient {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn connect_with_deadline(&self, _deadline: Duration) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.succeeds_on {
                Some(n) if attempt >= n => Ok(()),
                _ => Err(RelayError::transport("scripted failure")),
            }
        }
    }

    #[tokio::test]
    async fn mixed_fleet_counters_match() {
        // 30 succeed in wave 1, 15 in wave 2, 5 never.
        let mut clients = Vec::new();
        for i in 0..30 {
            clients.push(ScriptedClient::new(format!("fast-{i}"), Some(1)));
        }
        for i in 0..15 {
            clients.push(ScriptedClient::new(format!("slow-{i}"), Some(2)));
        }
        for i in 0..5 {
            clients.push(ScriptedClient::new(format!("dead-{i}"), None));
        }

        let options = SchedulerOptions {
            max_waves: 5,
            base_timeout: Duration::from_secs(1),
            max_workers: 10,
        };
        let report = run(clients, &options).await;

        assert_eq!(report.total, 50);
        assert_eq!(report.successful, 45);
        assert_eq!(report.failed, 5);
        assert_eq!(report.retried, 20);
        assert_eq!(report.waves_run, 5);
        // Every attempt resolved within the widest wave deadline.
        assert!(report.all_attempts.max_ms <= 16_000);
    }

    #[tokio::test]
    async fn final_wave_drains_without_requeueing() {
        let clients = vec![ScriptedClient::new("dead", None)];
        let attempts = clients[0].attempts.clone();
        let options = SchedulerOptions {
            max_waves: 3,
            base_timeout: Duration::from_millis(10),
            max_workers: 2,
        };
        let report = run(clients, &options).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.waves_run, 3);
        // Exactly one attempt per wave — the last wave never requeued.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        struct GaugedClient {
            name: String,
            current: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Connectable for Arc<GaugedClient> {
            fn name(&self) -> String {
                self.name.clone()
            }

            async fn connect_with_deadline(&self, _deadline: Duration) -> Result<()> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let clients: Vec<Arc<GaugedClient>> = (0..20)
            .map(|i| {
                Arc::new(GaugedClient {
                    name: format!("c{i}"),
                    current: Arc::clone(&current),
                    peak: Arc::clone(&peak),
                })
            })
            .collect();

        let options = SchedulerOptions {
            max_waves: 1,
            base_timeout: Duration::from_secs(1),
            max_workers: 4,
        };
        let report = run(clients, &options).await;
        assert_eq!(report.successful, 20);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn clients_that_stop_wanting_retry_drop_out() {
        #[derive(Clone)]
        struct OneShot {
            attempts: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Connectable for OneShot {
            fn name(&self) -> String {
                "oneshot".into()
            }

            async fn connect_with_deadline(&self, _deadline: Duration) -> Result<()> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::transport("nope"))
            }

            fn wants_retry(&self) -> bool {
                false
            }
        }

        let client = OneShot { attempts: Arc::new(AtomicU32::new(0)) };
        let attempts = client.attempts.clone();
        let options = SchedulerOptions {
            max_waves: 5,
            base_timeout: Duration::from_millis(10),
            max_workers: 1,
        };
        let report = run(vec![client], &options).await;
        assert_eq!(report.failed, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
