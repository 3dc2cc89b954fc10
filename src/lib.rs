pub mod cli;
pub mod config;
pub mod dispatch;
pub mod ledger;
pub mod logging;
pub mod output;
pub mod queue;
pub mod router;
pub mod seen;
pub mod service;
pub mod shutdown;
pub mod target;
pub mod types;
pub mod worker;

// Re-export key types and functions at the crate root
pub use config::Config;
pub use dispatch::Dispatcher;
pub use ledger::{RetryLedger, MAX_RETRIES};
pub use logging::{init_logging, get_log_file_path};
pub use output::OutputFileRegistry;
pub use queue::{BeanstalkQueue, JobQueue};
pub use router::ResponseRouter;
pub use seen::SeenSet;
pub use shutdown::ShutdownCoordinator;
pub use target::HostCatalog;
pub use types::{Job, OpenRequest, ProbeResponse};
pub use worker::{ScannerCommand, Worker, WorkerPool};
