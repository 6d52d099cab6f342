use ephemeral_registry::MAX_TTL;
use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Service configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub upload_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub object_ttl: Duration,
    pub max_batch_bytes: u64,
    pub tick_interval: Duration,
    pub event_buffer: usize,
    pub static_dir: Option<PathBuf>,
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3002,
            upload_dir: PathBuf::from("./uploads"),
            ledger_path: PathBuf::from("./uploads.json"),
            object_ttl: Duration::from_secs(2 * 60 * 60), // 2 hours
            max_batch_bytes: 10 * 1024 * 1024 * 1024,     // 10GB
            tick_interval: Duration::from_secs(1),
            event_buffer: 256,
            static_dir: None,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl Config {
    /// Parse configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);

        let upload_dir = lookup("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);

        let ledger_path = lookup("LEDGER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.ledger_path);

        let object_ttl = parsed("OBJECT_TTL_SECS")
            .map(Duration::from_secs)
            .filter(|ttl| *ttl <= MAX_TTL)
            .unwrap_or(defaults.object_ttl);

        let max_batch_bytes = parsed("MAX_BATCH_BYTES").unwrap_or(defaults.max_batch_bytes);

        let tick_interval = parsed("TICK_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.tick_interval);

        let event_buffer = parsed("EVENT_BUFFER")
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(defaults.event_buffer);

        let static_dir = lookup("STATIC_DIR").map(PathBuf::from);

        let cors_origins = lookup("CORS_ORIGINS")
            .map(|s| s.split(',').map(|o| o.trim().to_string()).collect())
            .unwrap_or(defaults.cors_origins);

        Self {
            port,
            upload_dir,
            ledger_path,
            object_ttl,
            max_batch_bytes,
            tick_interval,
            event_buffer,
            static_dir,
            cors_origins,
        }
    }

    /// Reject layouts the store cannot run with. The ledger must live
    /// outside the upload directory, which only ever holds content.
    pub fn validate(&self) -> Result<(), String> {
        let cwd = env::current_dir()
            .map_err(|e| format!("Cannot resolve working directory: {}", e))?;
        self.validate_in(&cwd)
    }

    fn validate_in(&self, cwd: &Path) -> Result<(), String> {
        let uploads = normalize(cwd, &self.upload_dir);
        let ledger = normalize(cwd, &self.ledger_path);
        if ledger.starts_with(&uploads) {
            return Err(format!(
                "LEDGER_PATH {:?} must be outside UPLOAD_DIR {:?}",
                self.ledger_path, self.upload_dir
            ));
        }
        Ok(())
    }
}

/// Absolute form of `path` with `.` and `..` resolved lexically
fn normalize(cwd: &Path, path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in cwd.join(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
