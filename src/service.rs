//! Wires the components together for one listener process.

use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::ledger::RetryLedger;
use crate::output::OutputFileRegistry;
use crate::queue::{BeanstalkQueue, JobQueue};
use crate::router::ResponseRouter;
use crate::seen::SeenSet;
use crate::shutdown::{wait_for_signal, ShutdownCoordinator};
use crate::target::HostCatalog;
use crate::worker::{ScannerCommand, WorkerPool};

/// Shared state built once at startup and handed to every component.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub catalog: Arc<HostCatalog>,
    pub ledger: Arc<RetryLedger>,
    pub seen: Arc<SeenSet>,
    pub files: Arc<OutputFileRegistry>,
}

impl Context {
    /// Load the seen-set and pre-open the category files.
    pub fn build(config: Config) -> Result<Self> {
        let seen = SeenSet::load(
            &config.seen_set_path,
            config.seen_set_capacity,
            config.seen_set_false_positive_rate,
        )?;

        let catalog = HostCatalog::default();
        let files = OutputFileRegistry::new(&config.output_dir);
        files.preopen_categories(&catalog.accepted);

        Ok(Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            ledger: Arc::new(RetryLedger::default()),
            seen: Arc::new(seen),
            files: Arc::new(files),
        })
    }

    pub fn scanner_command(&self) -> ScannerCommand {
        ScannerCommand::zgrab2(
            self.config.scanner_program(),
            self.config.num_senders,
            self.config.read_limit_per_host,
        )
    }
}

/// Connect to beanstalkd and watch the configured tube.
pub async fn connect_queue(config: &Config) -> Result<BeanstalkQueue> {
    let mut queue = BeanstalkQueue::connect(&config.beanstalk_host).await?;
    queue.watch(&config.tube).await?;
    Ok(queue)
}

/// Run the listener until a termination signal, then shut down cleanly.
///
/// Returns an error if the queue or the worker pool cannot be brought up, if
/// a worker cannot be restarted, or if the seen-set cannot be persisted.
pub async fn run(config: Config) -> Result<()> {
    let queue = connect_queue(&config).await?;
    let context = Context::build(config)?;
    run_with_queue(context, queue).await
}

pub async fn run_with_queue<Q: JobQueue>(context: Context, queue: Q) -> Result<()> {
    let (responses, lines) = mpsc::unbounded_channel();
    let pool = WorkerPool::start(context.scanner_command(), &context.config.source_ips, responses)
        .wrap_err("No scanning capacity")?;

    let router = ResponseRouter::new(
        context.ledger.clone(),
        context.seen.clone(),
        context.files.clone(),
        context.catalog.clone(),
    );
    let router_handle = tokio::spawn(router.run(lines));

    let mut dispatcher = Dispatcher::new(queue, pool, context.ledger.clone(), context.catalog.clone());
    if context.config.skip_seen {
        dispatcher = dispatcher.with_seen_gate(context.seen.clone());
    }

    let coordinator = ShutdownCoordinator::new(
        context.files.clone(),
        context.seen.clone(),
        context.config.seen_set_path.clone(),
    );

    let outcome = tokio::select! {
        result = dispatcher.run() => result,
        signal = wait_for_signal() => signal.map(|name| {
            log::info!("[service] signal_received: signal={}", name);
        }),
    };

    if let Err(e) = &outcome {
        log::error!("[service] run_failed: error={:#}", e);
    }

    coordinator.shutdown(dispatcher.into_pool(), router_handle).await?;
    outcome
}
