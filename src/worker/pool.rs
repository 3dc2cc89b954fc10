use eyre::{Result, WrapErr};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{DispatchOutcome, ScannerCommand, Worker};

/// A worker silent for longer than this is restarted.
pub const STALL_THRESHOLD: Duration = Duration::from_secs(60);

/// Fixed set of scanner processes, one per egress identity.
///
/// A slot keeps its identity across restarts.
#[derive(Debug)]
pub struct WorkerPool {
    command: ScannerCommand,
    workers: Vec<Worker>,
    responses: mpsc::UnboundedSender<String>,
    stall_threshold: Duration,
}

impl WorkerPool {
    /// Spawn one worker per source address, or a single unbound worker when
    /// `source_ips` is empty. Any spawn failure aborts the whole pool.
    pub fn start(
        command: ScannerCommand,
        source_ips: &[IpAddr],
        responses: mpsc::UnboundedSender<String>,
    ) -> Result<Self> {
        let identities: Vec<Option<IpAddr>> = if source_ips.is_empty() {
            vec![None]
        } else {
            source_ips.iter().copied().map(Some).collect()
        };

        let mut workers = Vec::with_capacity(identities.len());
        for (slot, identity) in identities.into_iter().enumerate() {
            let worker = Worker::spawn(&command, identity, responses.clone())
                .wrap_err_with(|| format!("Failed to start worker slot {}", slot))?;
            workers.push(worker);
        }

        log::info!("[pool] started: workers={}", workers.len());
        Ok(Self {
            command,
            workers,
            responses,
            stall_threshold: STALL_THRESHOLD,
        })
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, slot: usize) -> &Worker {
        &self.workers[slot]
    }

    /// Restart the worker in `slot` if it has been silent too long.
    ///
    /// Returns whether a restart happened. The replacement starts with a
    /// fresh liveness clock.
    pub async fn check_health(&mut self, slot: usize) -> Result<bool> {
        let worker = &self.workers[slot];
        if !worker.is_stalled(self.stall_threshold) {
            return Ok(false);
        }

        let silent_for = worker.clock().elapsed();
        log::warn!("[pool] worker_stalled: slot={} silent_for={}s threshold={}s",
            slot, silent_for.as_secs(), self.stall_threshold.as_secs());
        self.restart(slot).await?;
        Ok(true)
    }

    /// Tear down the worker in `slot` and replace it in place.
    pub async fn restart(&mut self, slot: usize) -> Result<()> {
        let identity = self.workers[slot].identity();
        if let Err(e) = self.workers[slot].stop().await {
            log::warn!("[pool] stop_failed: slot={} error={}", slot, e);
        }

        let replacement = Worker::spawn(&self.command, identity, self.responses.clone())
            .wrap_err_with(|| format!("Failed to restart worker slot {}", slot))?;
        log::info!("[pool] restarted: slot={} pid={:?}", slot, replacement.pid());
        self.workers[slot] = replacement;
        Ok(())
    }

    pub async fn dispatch(&self, slot: usize, hostname: &str) -> DispatchOutcome {
        self.workers[slot].dispatch(hostname).await
    }

    /// Stop every worker and wait for all of them to exit.
    pub async fn shutdown(mut self) {
        log::info!("[pool] shutting_down: workers={}", self.workers.len());
        let stops = self.workers.iter_mut().map(|worker| worker.stop());
        for (slot, result) in futures::future::join_all(stops).await.into_iter().enumerate() {
            if let Err(e) = result {
                log::warn!("[pool] stop_failed: slot={} error={}", slot, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::{echo_scanner, saturate, silent_scanner};
    use std::path::Path;
    use tokio::time::timeout;

    /// Blocks without reading on first launch, echoes like `echo_scanner`
    /// once `marker` exists.
    fn blocks_then_echoes(marker: &Path) -> ScannerCommand {
        let script = r#"if [ -e "$1" ]; then while read host; do printf '{"domain":"%s","data":{"http":{"result":{"response":{"status_code":200}}}}}\n' "$host"; done; else touch "$1"; exec sleep 60; fi"#;
        ScannerCommand::new("sh", vec![
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            marker.display().to_string(),
        ])
    }

    #[tokio::test]
    async fn test_single_unbound_worker_when_no_ips() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(echo_scanner(), &[], tx).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.worker(0).identity(), None);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_worker_per_identity() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ips: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let pool = WorkerPool::start(silent_scanner(), &ips, tx).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.worker(1).identity(), Some(ips[1]));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_aborts_pool() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let command = ScannerCommand::new("/nonexistent/scanner-binary", Vec::new());
        assert!(WorkerPool::start(command, &[], tx).is_err());
    }

    #[tokio::test]
    async fn test_healthy_worker_is_left_alone() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::start(silent_scanner(), &[], tx).unwrap();
        let pid = pool.worker(0).pid();

        assert!(!pool.check_health(0).await.unwrap());
        assert_eq!(pool.worker(0).pid(), pid);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_worker_restarts_once_and_keeps_routing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let command = echo_scanner();
        let mut pool = WorkerPool::start(command, &[], tx)
            .unwrap()
            .with_stall_threshold(Duration::from_millis(50));
        let old_pid = pool.worker(0).pid();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.check_health(0).await.unwrap());
        assert_ne!(pool.worker(0).pid(), old_pid);
        assert_eq!(pool.worker(0).identity(), None);

        // Fresh clock, so not flagged again straight away
        assert!(!pool.check_health(0).await.unwrap());

        pool.dispatch(0, "after.s3.amazonaws.com").await;
        let line = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(line.contains("after.s3.amazonaws.com"));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_discards_queued_hostnames() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::start(blocks_then_echoes(&dir.path().join("started")), &[], tx).unwrap();

        saturate(pool.worker(0), "stale").await;
        pool.restart(0).await.unwrap();

        assert_eq!(pool.dispatch(0, "fresh.s3.amazonaws.com").await, DispatchOutcome::Queued);
        let line = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(line.contains("\"domain\":\"fresh.s3.amazonaws.com\""));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        pool.shutdown().await;
    }
}
