use eyre::{Result, WrapErr};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "listener-config.toml";

const DEFAULT_NUM_SENDERS: usize = 1000;
const DEFAULT_BEANSTALK_HOST: &str = "127.0.0.1:11300";
const DEFAULT_READ_LIMIT_KB: usize = 50;
const DEFAULT_TUBE: &str = "default";
const DEFAULT_OUTPUT_DIR: &str = "./data";
const DEFAULT_SEEN_SET_PATH: &str = "./bucket_validation/bloom/candidate_set.bloom";
const DEFAULT_SEEN_SET_CAPACITY: usize = 300_000_000;
const DEFAULT_SEEN_SET_FP_RATE: f64 = 0.000001;

/// Listener configuration. Keys keep their PascalCase names in the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    /// Concurrent senders inside each scanner process
    pub num_senders: usize,
    pub beanstalk_host: String,
    /// Per-host response read limit passed to the scanner, in KB
    pub read_limit_per_host: usize,
    /// One worker per address, or a single unbound worker when empty
    #[serde(rename = "SourceIPs")]
    pub source_ips: Vec<IpAddr>,
    pub tube: String,
    pub scanner_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub seen_set_path: PathBuf,
    pub seen_set_capacity: usize,
    pub seen_set_false_positive_rate: f64,
    /// Skip candidates already in the seen-set
    pub skip_seen: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_senders: DEFAULT_NUM_SENDERS,
            beanstalk_host: DEFAULT_BEANSTALK_HOST.to_string(),
            read_limit_per_host: DEFAULT_READ_LIMIT_KB,
            source_ips: Vec::new(),
            tube: DEFAULT_TUBE.to_string(),
            scanner_path: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            seen_set_path: PathBuf::from(DEFAULT_SEEN_SET_PATH),
            seen_set_capacity: DEFAULT_SEEN_SET_CAPACITY,
            seen_set_false_positive_rate: DEFAULT_SEEN_SET_FP_RATE,
            skip_seen: false,
        }
    }
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).wrap_err("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`. A missing file falls back to defaults unless `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config = Self::from_toml(&contents)
                    .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;
                log::info!("[config] loaded: path={}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                log::warn!("[config] not_found_using_defaults: path={}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).wrap_err_with(|| format!("Failed to read {}", path.display())),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.num_senders == 0 {
            eyre::bail!("NumSenders must be at least 1");
        }
        if self.beanstalk_host.trim().is_empty() {
            eyre::bail!("BeanstalkHost must not be empty");
        }
        if !(self.seen_set_false_positive_rate > 0.0 && self.seen_set_false_positive_rate < 1.0) {
            eyre::bail!("SeenSetFalsePositiveRate must be between 0 and 1");
        }
        if self.seen_set_capacity == 0 {
            eyre::bail!("SeenSetCapacity must be at least 1");
        }
        Ok(())
    }

    /// Configured scanner, else `$GOPATH/bin/zgrab2`, else `zgrab2` on PATH.
    pub fn scanner_program(&self) -> PathBuf {
        if let Some(path) = &self.scanner_path {
            return path.clone();
        }
        match std::env::var_os("GOPATH") {
            Some(gopath) => PathBuf::from(gopath).join("bin").join("zgrab2"),
            None => PathBuf::from("zgrab2"),
        }
    }
}
