use dashmap::DashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Status code categories pre-opened for every accepted host.
pub const STATUS_CATEGORIES: [(u16, &str); 5] = [
    (200, "public"),
    (400, "invalid_bucket"),
    (403, "private"),
    (404, "no_such_bucket"),
    (500, "error"),
];

/// Handle to an append-only result file. A disabled handle drops writes.
#[derive(Debug, Clone)]
pub struct OutputFile {
    file: Option<Arc<Mutex<File>>>,
}

impl OutputFile {
    pub fn disabled() -> Self {
        Self { file: None }
    }

    fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.file.is_none()
    }

    /// Append one line. Write failures are logged, never raised.
    pub fn append_line(&self, line: &str) {
        let Some(file) = &self.file else {
            return;
        };
        let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            log::error!("[output] write_failed: error={}", e);
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(e) = file.flush().and_then(|_| file.sync_data()) {
                log::warn!("[output] flush_failed: error={}", e);
            }
        }
    }
}

/// Lazily opened result files keyed by logical path.
#[derive(Debug)]
pub struct OutputFileRegistry {
    root: PathBuf,
    files: DashMap<String, OutputFile>,
}

impl OutputFileRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        log::debug!("[output] new: root={}", root.display());
        Self {
            root,
            files: DashMap::new(),
        }
    }

    /// Open `<root>/validation/<host>/<category>.txt` for every status
    /// category and host, registered under `<status><host>`.
    pub fn preopen_categories(&self, hosts: &[String]) {
        for (status, category) in STATUS_CATEGORIES {
            for host in hosts {
                let path = self.root.join("validation").join(host).join(format!("{}.txt", category));
                match OutputFile::open(&path) {
                    Ok(file) => {
                        self.files.insert(format!("{}{}", status, host), file);
                    }
                    Err(e) => {
                        log::error!("[output] preopen_failed: path={} error={}", path.display(), e);
                    }
                }
            }
        }
        log::info!("[output] preopened: files={}", self.files.len());
    }

    /// Cached handle for `key`, opening `<root>/<key>.txt` on first use.
    ///
    /// Keys that could resolve outside the root (`..`, absolute paths) and
    /// files that cannot be opened give a disabled handle.
    pub fn get(&self, key: &str) -> OutputFile {
        if !is_relative_key(key) {
            log::warn!("[output] traversal_refused: key={}", key);
            return OutputFile::disabled();
        }

        if let Some(file) = self.files.get(key) {
            return file.clone();
        }

        let entry = self.files.entry(key.to_string()).or_try_insert_with(|| {
            let path = self.root.join(format!("{}.txt", key));
            log::debug!("[output] opening: key={} path={}", key, path.display());
            OutputFile::open(&path).map_err(|e| {
                log::error!("[output] open_failed: path={} error={}", path.display(), e);
                e
            })
        });

        match entry {
            Ok(file) => file.clone(),
            Err(_) => OutputFile::disabled(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Flush and drop every cached file.
    pub fn close_all(&self) {
        let count = self.files.len();
        for entry in self.files.iter() {
            entry.value().flush();
        }
        self.files.clear();
        log::info!("[output] closed: files={}", count);
    }
}

/// True when every component of `key` is a plain name.
fn is_relative_key(key: &str) -> bool {
    !key.contains("..")
        && Path::new(key)
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
