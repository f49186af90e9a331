use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (default: 127.0.0.1:5000).
    pub bind: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where raw left/right registration captures are kept, if anywhere.
    pub capture_dir: Option<PathBuf>,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Real-face score above which a capture counts as live.
    pub liveness_threshold: f32,
    /// Timeout in seconds for one engine call.
    pub inference_timeout_secs: u64,
    /// Number of engine worker threads.
    pub engine_workers: usize,
    /// Pending engine requests before callers wait.
    pub engine_queue: usize,
    /// Upper bound on a form-encoded request body.
    pub max_form_bytes: usize,
    /// Check model checksums before loading.
    pub verify_models: bool,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_models::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("facegate.db"));

        Self {
            bind: std::env::var("FACEGATE_BIND").unwrap_or_else(|_| "127.0.0.1:5000".to_string()),
            model_dir,
            db_path,
            capture_dir: std::env::var("FACEGATE_CAPTURE_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            similarity_threshold: env_parse("FACEGATE_SIMILARITY_THRESHOLD", 0.6),
            liveness_threshold: env_parse("FACEGATE_LIVENESS_THRESHOLD", 0.5),
            inference_timeout_secs: env_parse("FACEGATE_INFERENCE_TIMEOUT_SECS", 10),
            engine_workers: env_parse("FACEGATE_ENGINE_WORKERS", 1usize).max(1),
            engine_queue: env_parse("FACEGATE_ENGINE_QUEUE", 4usize).max(1),
            max_form_bytes: env_parse("FACEGATE_MAX_FORM_BYTES", 16 * 1024 * 1024),
            verify_models: std::env::var("FACEGATE_VERIFY_MODELS")
                .map(|v| v != "0")
                .unwrap_or(true),
        }
    }
}

/// Parsed value of `key`, or `default` when unset or unparseable.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back() {
        std::env::set_var("FACEGATE_TEST_GARBAGE_F32", "not-a-number");
        assert_eq!(env_parse("FACEGATE_TEST_GARBAGE_F32", 0.6f32), 0.6);
        assert_eq!(env_parse("FACEGATE_TEST_UNSET_U64", 10u64), 10);
    }

    #[test]
    fn test_env_parse_reads_value() {
        std::env::set_var("FACEGATE_TEST_WORKERS", " 3 ");
        assert_eq!(env_parse("FACEGATE_TEST_WORKERS", 1usize), 3);
    }
}
