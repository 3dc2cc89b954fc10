use bloomfilter::Bloom;
use eyre::{Result, WrapErr};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

// bits (u64) + hash count (u32) + two sip key pairs (4 x u64)
const HEADER_LEN: usize = 8 + 4 + 32;

/// Persisted probabilistic set of domains that produced a response.
///
/// Only grows. Loaded once at startup and written back at shutdown.
pub struct SeenSet {
    filter: Mutex<Bloom<str>>,
}

impl std::fmt::Debug for SeenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeenSet").finish_non_exhaustive()
    }
}

impl SeenSet {
    pub fn new(capacity: usize, false_positive_rate: f64) -> Self {
        log::debug!("[seen] new: capacity={} fp_rate={}", capacity, false_positive_rate);
        Self {
            filter: Mutex::new(Bloom::new_for_fp_rate(capacity, false_positive_rate)),
        }
    }

    /// Load the set from `path`. A missing or empty file gives a fresh set.
    pub fn load(path: &Path, capacity: usize, false_positive_rate: f64) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("[seen] no_existing_set: path={}", path.display());
                return Ok(Self::new(capacity, false_positive_rate));
            }
            Err(e) => return Err(e).wrap_err_with(|| format!("Failed to read seen-set {}", path.display())),
        };

        if bytes.is_empty() {
            log::info!("[seen] empty_set_file: path={}", path.display());
            return Ok(Self::new(capacity, false_positive_rate));
        }

        let set = Self::from_bytes(&bytes)
            .wrap_err_with(|| format!("Corrupt seen-set {}", path.display()))?;
        log::info!("[seen] loaded: path={} bytes={}", path.display(), bytes.len());
        Ok(set)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            eyre::bail!("seen-set header truncated: {} bytes", bytes.len());
        }

        let u64_at = |offset: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[offset..offset + 8]);
            u64::from_le_bytes(word)
        };

        let bits = u64_at(0);
        let mut k = [0u8; 4];
        k.copy_from_slice(&bytes[8..12]);
        let hashes = u32::from_le_bytes(k);
        let sip_keys = [(u64_at(12), u64_at(20)), (u64_at(28), u64_at(36))];

        let bitmap = &bytes[HEADER_LEN..];
        if (bitmap.len() as u64) * 8 < bits || hashes == 0 {
            eyre::bail!("seen-set bitmap does not match header: bits={} bytes={} hashes={}",
                bits, bitmap.len(), hashes);
        }

        Ok(Self {
            filter: Mutex::new(Bloom::from_existing(bitmap, bits, hashes, sip_keys)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bloom<str>> {
        self.filter.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, domain: &str) {
        self.lock().set(domain);
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.lock().check(domain)
    }

    /// Serialize the set to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let filter = self.lock();
        let sip_keys = filter.sip_keys();

        writer.write_all(&filter.number_of_bits().to_le_bytes())?;
        writer.write_all(&filter.number_of_hash_functions().to_le_bytes())?;
        for (k0, k1) in sip_keys {
            writer.write_all(&k0.to_le_bytes())?;
            writer.write_all(&k1.to_le_bytes())?;
        }
        writer.write_all(&filter.bitmap())?;
        Ok(())
    }

    /// Write the set to `path`, creating parent directories as needed.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .wrap_err_with(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let file = fs::File::create(path)
            .wrap_err_with(|| format!("Failed to open seen-set {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush().wrap_err("Failed to flush seen-set")?;

        log::info!("[seen] persisted: path={}", path.display());
        Ok(())
    }
}
