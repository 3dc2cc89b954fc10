use eyre::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::ledger::RetryLedger;
use crate::queue::{JobQueue, RESERVE_TIMEOUT};
use crate::seen::SeenSet;
use crate::target::HostCatalog;
use crate::types::{JobSpec, OpenRequest};
use crate::worker::{DispatchOutcome, WorkerPool};

/// Pause between passes over the pool.
pub const IDLE_DELAY: Duration = Duration::from_millis(250);

/// What happened during one pass over all workers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub restarted: usize,
    pub retried: usize,
    pub reserved: usize,
}

impl PassStats {
    pub fn is_idle(&self) -> bool {
        self.retried == 0 && self.reserved == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Retried,
    Reserved,
    Empty,
}

/// Main control loop feeding the worker pool from the retry ledger and the
/// job queue.
#[derive(Debug)]
pub struct Dispatcher<Q> {
    queue: Q,
    pool: WorkerPool,
    ledger: Arc<RetryLedger>,
    catalog: Arc<HostCatalog>,
    seen_gate: Option<Arc<SeenSet>>,
}

impl<Q: JobQueue> Dispatcher<Q> {
    pub fn new(queue: Q, pool: WorkerPool, ledger: Arc<RetryLedger>, catalog: Arc<HostCatalog>) -> Self {
        Self {
            queue,
            pool,
            ledger,
            catalog,
            seen_gate: None,
        }
    }

    /// Skip hostnames already present in `seen` instead of probing them.
    pub fn with_seen_gate(mut self, seen: Arc<SeenSet>) -> Self {
        self.seen_gate = Some(seen);
        self
    }

    /// Give back the pool so it can be shut down.
    pub fn into_pool(self) -> WorkerPool {
        self.pool
    }

    /// Run passes forever. Only returns on a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        log::info!("[dispatch] run: workers={}", self.pool.len());
        let mut passes = 0u64;
        loop {
            let stats = self.run_pass().await?;
            passes += 1;
            if stats.is_idle() {
                log::trace!("[dispatch] idle_pass: pass={} restarted={}", passes, stats.restarted);
            } else {
                log::debug!("[dispatch] pass_complete: pass={} retried={} reserved={} restarted={} open={}",
                    passes, stats.retried, stats.reserved, stats.restarted, self.ledger.len());
            }
            sleep(IDLE_DELAY).await;
        }
    }

    /// One pass over every worker in slot order.
    pub async fn run_pass(&mut self) -> Result<PassStats> {
        let mut stats = PassStats::default();
        for slot in 0..self.pool.len() {
            if self.pool.check_health(slot).await? {
                stats.restarted += 1;
            }

            match self.take_turn(slot).await {
                Turn::Retried => stats.retried += 1,
                Turn::Reserved => stats.reserved += 1,
                Turn::Empty => {}
            }
        }
        Ok(stats)
    }

    async fn take_turn(&mut self, slot: usize) -> Turn {
        if let Some(retry) = self.ledger.claim_due(Instant::now()) {
            log::info!("[dispatch] retrying: slot={} hostname={} attempt={}",
                slot, retry.hostname, retry.request.attempts);
            self.send(slot, &retry.hostname).await;
            return Turn::Retried;
        }

        let job = match self.queue.reserve(RESERVE_TIMEOUT).await {
            Ok(Some(job)) => job,
            Ok(None) => return Turn::Empty,
            Err(e) => {
                log::error!("[dispatch] reserve_failed: slot={} error={:#}", slot, e);
                return Turn::Empty;
            }
        };
        log::debug!("[dispatch] reserved: slot={} id={} body={}", slot, job.id, job.body);

        match JobSpec::parse(&job.body) {
            Some(spec) => self.fan_out(slot, &spec).await,
            None => log::warn!("[dispatch] invalid_job: id={} body={:?} expected=path,bucket", job.id, job.body),
        }

        if let Err(e) = self.queue.delete(job.id).await {
            log::error!("[dispatch] delete_failed: id={} error={:#}", job.id, e);
        }
        Turn::Reserved
    }

    async fn fan_out(&mut self, slot: usize, spec: &JobSpec) {
        let candidates = self.catalog.resolve(&spec.bucket);
        log::debug!("[dispatch] fan_out: bucket={} source={} candidates={}",
            spec.bucket, spec.path, candidates.len());

        for candidate in candidates {
            self.ledger.open(
                &candidate.hostname,
                OpenRequest::new(candidate.provider, spec.path.clone(), Instant::now()),
            );
            self.send(slot, &candidate.hostname).await;
        }
    }

    /// Hand `hostname` to the worker in `slot`. A timed out hand-off still
    /// counts as sent; the open ledger entry covers it via retry.
    async fn send(&self, slot: usize, hostname: &str) {
        if let Some(seen) = &self.seen_gate {
            if seen.contains(hostname) {
                log::debug!("[dispatch] already_seen: hostname={}", hostname);
                self.ledger.complete(hostname);
                return;
            }
        }

        match self.pool.dispatch(slot, hostname).await {
            DispatchOutcome::Queued => log::trace!("[dispatch] sent: slot={} hostname={}", slot, hostname),
            outcome => log::warn!("[dispatch] send_unconfirmed: slot={} hostname={} outcome={:?}",
                slot, hostname, outcome),
        }
    }
}
