//! Graceful shutdown on SIGINT / SIGTERM.
//!
//! Stops the scanners, lets the router drain what they already emitted,
//! closes every result file and persists the seen-set.

use eyre::{Result, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::output::OutputFileRegistry;
use crate::seen::SeenSet;
use crate::worker::WorkerPool;

/// How long the router may keep draining after the workers are gone.
pub const ROUTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for an interrupt or terminate signal and return its name.
pub async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).wrap_err("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.wrap_err("Failed to listen for SIGINT")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.wrap_err("Failed to listen for Ctrl-C")?;
        Ok("Ctrl-C")
    }
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    files: Arc<OutputFileRegistry>,
    seen: Arc<SeenSet>,
    seen_path: PathBuf,
    started: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(files: Arc<OutputFileRegistry>, seen: Arc<SeenSet>, seen_path: impl Into<PathBuf>) -> Self {
        Self {
            files,
            seen,
            seen_path: seen_path.into(),
            started: AtomicBool::new(false),
        }
    }

    /// Stop the pool, wait for the router, close files and persist the
    /// seen-set. Later calls are no-ops.
    ///
    /// A seen-set that cannot be written is returned as an error.
    pub async fn shutdown(&self, pool: WorkerPool, router: JoinHandle<u64>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            log::warn!("[shutdown] already_in_progress");
            return Ok(());
        }

        log::info!("[shutdown] stopping: workers={}", pool.len());
        pool.shutdown().await;

        let abort = router.abort_handle();
        match timeout(ROUTER_DRAIN_TIMEOUT, router).await {
            Ok(Ok(consumed)) => log::info!("[shutdown] router_drained: consumed={}", consumed),
            Ok(Err(e)) => log::warn!("[shutdown] router_failed: error={}", e),
            Err(_) => {
                log::warn!("[shutdown] router_drain_timeout: timeout={}s", ROUTER_DRAIN_TIMEOUT.as_secs());
                abort.abort();
            }
        }

        self.files.close_all();
        self.seen
            .persist(&self.seen_path)
            .wrap_err("Failed to persist seen-set at shutdown")?;

        log::info!("[shutdown] complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RetryLedger;
    use crate::router::ResponseRouter;
    use crate::target::HostCatalog;
    use crate::worker::tests::echo_scanner;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_shutdown_flushes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(OutputFileRegistry::new(dir.path()));
        let seen = Arc::new(SeenSet::new(1000, 0.0001));
        let seen_path = dir.path().join("bloom").join("candidate_set.bloom");

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(echo_scanner(), &[], tx).unwrap();
        let router = ResponseRouter::new(
            Arc::new(RetryLedger::default()),
            seen.clone(),
            files.clone(),
            Arc::new(HostCatalog::default()),
        );
        let handle = tokio::spawn(router.run(rx));

        pool.dispatch(0, "a.s3.amazonaws.com").await;
        // Give the scanner a moment to answer before it is stopped
        for _ in 0..50 {
            if seen.contains("a.s3.amazonaws.com") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let coordinator = ShutdownCoordinator::new(files.clone(), seen.clone(), &seen_path);
        coordinator.shutdown(pool, handle).await.unwrap();

        assert!(files.is_empty());
        let reloaded = SeenSet::load(&seen_path, 10, 0.1).unwrap();
        assert!(reloaded.contains("a.s3.amazonaws.com"));
        assert!(dir.path().join("200s3.amazonaws.com.txt").exists());
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(OutputFileRegistry::new(dir.path()));
        let seen = Arc::new(SeenSet::new(100, 0.01));
        let coordinator = ShutdownCoordinator::new(files, seen, dir.path().join("set.bloom"));

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let pool = WorkerPool::start(echo_scanner(), &[], tx).unwrap();
        let handle = tokio::spawn(async move {
            let mut rx = rx;
            let mut n = 0u64;
            while rx.recv().await.is_some() {
                n += 1;
            }
            n
        });
        coordinator.shutdown(pool, handle).await.unwrap();
        assert!(dir.path().join("set.bloom").exists());

        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(echo_scanner(), &[], tx).unwrap();
        let idle = tokio::spawn(async { 0u64 });
        coordinator.shutdown(pool, idle).await.unwrap();
    }
}
