use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

const LOAD_ATTEMPTS: u32 = 10;
const LOAD_BACKOFF_BASE: Duration = Duration::from_millis(500);
const LOAD_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// The shared internal API key, generated by the gateway on first boot and
/// persisted at a well-known path. The gateway may rotate it; callers reload
/// on 401.
pub struct InternalKey {
    path: PathBuf,
    value: RwLock<Option<String>>,
}

impl InternalKey {
    /// Load the key with bounded retry (10 attempts, base 0.5 s, cap 30 s).
    /// A missing key is not fatal here: authenticated requests will fail
    /// and trigger a reload.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut delay = LOAD_BACKOFF_BASE;
        let mut value = None;

        for attempt in 1..=LOAD_ATTEMPTS {
            match read_key(&path) {
                Some(key) => {
                    info!(attempt, "internal api key loaded");
                    value = Some(key);
                    break;
                }
                None => {
                    warn!(attempt, attempts = LOAD_ATTEMPTS, path = %path.display(), "internal api key not ready");
                }
            }
            if attempt < LOAD_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(LOAD_BACKOFF_CAP);
            }
        }

        Self {
            path,
            value: RwLock::new(value),
        }
    }

    /// Build without waiting; used by tests with a pre-written key file.
    pub fn at(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let value = read_key(&path);
        Self {
            path,
            value: RwLock::new(value),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.value.read().clone()
    }

    /// Re-read from disk, e.g. after a 401.
    pub fn reload(&self) -> bool {
        match read_key(&self.path) {
            Some(key) => {
                *self.value.write() = Some(key);
                info!("internal api key reloaded");
                true
            }
            None => {
                warn!(path = %self.path.display(), "internal api key reload failed");
                false
            }
        }
    }
}

fn read_key(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
