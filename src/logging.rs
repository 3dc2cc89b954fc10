use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use log::LevelFilter;

const APP_NAME: &str = "bucket-validator";

/// Initialize logging to `log_file`, or to the system-specific log file
pub fn init_logging(log_file: Option<&Path>, verbose: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let log_path = match log_file {
        Some(path) => path.to_path_buf(),
        None => get_log_file_path()?,
    };

    // Ensure the log directory exists
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    // RUST_LOG wins, --verbose bumps the default to debug
    let default_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<LevelFilter>().ok())
        .unwrap_or(default_level);

    env_logger::Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?
        )))
        .try_init()?;

    log::info!("Logging initialized to: {}", log_path.display());
    log::info!("Log level: {}", log_level);

    Ok(log_path)
}

/// Get the system-specific log file path
pub fn get_log_file_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let log_dir = if cfg!(target_os = "linux") && nix::unistd::getuid().is_root() {
        PathBuf::from("/var/log").join(APP_NAME)
    } else {
        dirs::data_local_dir()
            .ok_or("Could not find local data directory")?
            .join(APP_NAME)
            .join("logs")
    };

    Ok(log_dir.join(format!("{}.log", APP_NAME)))
}
