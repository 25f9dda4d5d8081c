use rollcall_core::DEFAULT_DISTANCE_THRESHOLD;
use rollcall_ledger::ConflictPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Directory for per-face scratch crops. Files never outlive one match.
    pub scratch_dir: PathBuf,
    /// Cosine distance at or below which a gallery face counts as a match.
    pub distance_threshold: f32,
    /// Upper bound on recognizing one photo.
    pub recognize_timeout_secs: u64,
    /// Handling of recognized students already marked present.
    pub conflict_policy: ConflictPolicy,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let conflict_policy = match var("ROLLCALL_CONFLICT_POLICY") {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(%err, "ignoring ROLLCALL_CONFLICT_POLICY");
                ConflictPolicy::default()
            }),
            None => ConflictPolicy::default(),
        };

        let bus = match var("ROLLCALL_BUS").as_deref() {
            Some("system") => BusKind::System,
            _ => BusKind::Session,
        };

        Self {
            model_dir: var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            scratch_dir: var("ROLLCALL_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("rollcall-faces")),
            distance_threshold: parse_or(&var, "ROLLCALL_DISTANCE_THRESHOLD", DEFAULT_DISTANCE_THRESHOLD),
            recognize_timeout_secs: parse_or(&var, "ROLLCALL_RECOGNIZE_TIMEOUT_SECS", 60),
            conflict_policy,
            bus,
        }
    }

    pub fn recognize_timeout(&self) -> Duration {
        Duration::from_secs(self.recognize_timeout_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
