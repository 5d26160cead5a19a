use std::path::PathBuf;
use std::time::Duration;

use rollcall_core::{EmbeddingProfile, DEFAULT_DISTANCE_THRESHOLD};

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Embedding dimensionality of the deployed recognition model.
    pub embedding_dim: usize,
    /// Model version tag; embeddings tagged with another version are rejected.
    pub model_version: String,
    /// Maximum cosine distance accepted as a match.
    pub distance_threshold: f32,
    /// Timeout applied when a caller passes 0.
    pub submit_timeout_ms: u64,
    /// SQLite busy timeout; also bounds a ledger write once issued.
    pub busy_timeout_ms: u64,
    /// External program that turns a frame on stdin into an embedding on stdout.
    pub extractor_command: Option<String>,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            db_path,
            embedding_dim: env_parse("ROLLCALL_EMBEDDING_DIM", 128),
            model_version: std::env::var("ROLLCALL_MODEL_VERSION")
                .unwrap_or_else(|_| "resnet34-128".to_string()),
            distance_threshold: checked_threshold(env_parse(
                "ROLLCALL_DISTANCE_THRESHOLD",
                DEFAULT_DISTANCE_THRESHOLD,
            )),
            submit_timeout_ms: env_parse("ROLLCALL_SUBMIT_TIMEOUT_MS", 5_000),
            busy_timeout_ms: env_parse("ROLLCALL_BUSY_TIMEOUT_MS", 2_000),
            extractor_command: std::env::var("ROLLCALL_EXTRACTOR_CMD")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            session_bus: std::env::var("ROLLCALL_BUS")
                .map(|v| v == "session")
                .unwrap_or(false),
        }
    }

    pub fn profile(&self) -> EmbeddingProfile {
        EmbeddingProfile::new(self.embedding_dim, self.model_version.clone())
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Cosine distance lives in [0, 2]; anything else falls back to the default.
fn checked_threshold(value: f32) -> f32 {
    if value.is_finite() && (0.0..=2.0).contains(&value) {
        value
    } else {
        tracing::warn!(
            value,
            default = DEFAULT_DISTANCE_THRESHOLD,
            "ROLLCALL_DISTANCE_THRESHOLD out of range; using default"
        );
        DEFAULT_DISTANCE_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_in_range_is_kept() {
        assert_eq!(checked_threshold(0.55), 0.55);
        assert_eq!(checked_threshold(0.0), 0.0);
    }

    #[test]
    fn test_threshold_out_of_range_falls_back() {
        assert_eq!(checked_threshold(-0.1), DEFAULT_DISTANCE_THRESHOLD);
        assert_eq!(checked_threshold(2.5), DEFAULT_DISTANCE_THRESHOLD);
        assert_eq!(checked_threshold(f32::NAN), DEFAULT_DISTANCE_THRESHOLD);
    }

    #[test]
    fn test_env_parse_uses_default_on_garbage() {
        std::env::set_var("ROLLCALL_TEST_DIM_GARBAGE", "many");
        assert_eq!(env_parse("ROLLCALL_TEST_DIM_GARBAGE", 128usize), 128);
        std::env::set_var("ROLLCALL_TEST_DIM_OK", "512");
        assert_eq!(env_parse("ROLLCALL_TEST_DIM_OK", 128usize), 512);
    }
}
