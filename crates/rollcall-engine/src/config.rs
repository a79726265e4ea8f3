use rollcall_core::types::DEFAULT_MATCH_THRESHOLD;
use rollcall_core::{DetectorParams, LbphParams, MatchPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Engine configuration: TOML file (optional) overlaid with `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding face sample images and the sample index.
    pub data_dir: PathBuf,
    /// Trained model artifact.
    pub model_path: PathBuf,
    /// OpenCV Haar cascade XML used for detection.
    pub cascade_path: PathBuf,
    /// SQLite database holding the `students` identity table.
    pub identity_db: PathBuf,
    pub detector: DetectorParams,
    pub recognizer: LbphParams,
    /// Predictions are accepted only below this distance.
    pub match_threshold: f64,
    /// Retrain from the sample store at load when no usable artifact exists.
    pub retrain_on_load: bool,
    /// How long async callers wait on a worker before giving up.
    pub worker_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_root(&default_data_root())
    }
}

impl Config {
    /// Defaults with every path placed under `root`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            data_dir: root.join("face_data"),
            model_path: root.join("face_model.bin"),
            cascade_path: root.join("haarcascade_frontalface_default.xml"),
            identity_db: root.join("attendance.db"),
            detector: DetectorParams::default(),
            recognizer: LbphParams::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            retrain_on_load: false,
            worker_timeout_secs: 30,
        }
    }

    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Read a TOML file; fields it omits keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// File (when given) first, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `ROLLCALL_*` overrides from an arbitrary lookup. Unparseable
    /// values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_CASCADE_PATH") {
            self.cascade_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_IDENTITY_DB") {
            self.identity_db = PathBuf::from(v);
        }
        override_parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "ROLLCALL_SCALE_FACTOR", &mut self.detector.scale_factor);
        override_parsed(&lookup, "ROLLCALL_MIN_NEIGHBORS", &mut self.detector.min_neighbors);
        override_parsed(&lookup, "ROLLCALL_MIN_FACE_SIZE", &mut self.detector.min_face_size);
        override_parsed(&lookup, "ROLLCALL_WORKER_TIMEOUT_SECS", &mut self.worker_timeout_secs);
        if let Some(v) = lookup("ROLLCALL_RETRAIN_ON_LOAD") {
            match parse_flag(&v) {
                Some(flag) => self.retrain_on_load = flag,
                None => tracing::warn!(key = "ROLLCALL_RETRAIN_ON_LOAD", value = %v, "ignoring unparseable override"),
            }
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.match_threshold,
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
fn default_data_root() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::with_root(Path::new("/srv/rollcall"));
        assert_eq!(config.data_dir, PathBuf::from("/srv/rollcall/face_data"));
        assert_eq!(config.model_path, PathBuf::from("/srv/rollcall/face_model.bin"));
        assert_eq!(config.match_threshold, 80.0);
        assert_eq!(config.detector, DetectorParams::default());
        assert_eq!(config.recognizer, LbphParams::default());
        assert!(!config.retrain_on_load);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ROLLCALL_DATA_DIR", "/data/faces"),
            ("ROLLCALL_MATCH_THRESHOLD", "65.5"),
            ("ROLLCALL_MIN_NEIGHBORS", "3"),
            ("ROLLCALL_MIN_FACE_SIZE", "not-a-number"),
            ("ROLLCALL_RETRAIN_ON_LOAD", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::with_root(Path::new("/srv/rollcall"));
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.data_dir, PathBuf::from("/data/faces"));
        assert_eq!(config.match_threshold, 65.5);
        assert_eq!(config.detector.min_neighbors, 3);
        // Unparseable value keeps the default.
        assert_eq!(config.detector.min_face_size, 30);
        assert!(config.retrain_on_load);
        assert_eq!(config.match_policy().threshold, 65.5);
    }

    #[test]
    fn test_retrain_flag_values() {
        for (raw, expected) in [
            ("1", true),
            ("true", true),
            ("Yes", true),
            ("0", false),
            ("false", false),
            ("off", false),
            ("maybe", false),
        ] {
            let mut config = Config::with_root(Path::new("/srv/rollcall"));
            config.apply_overrides(|k| (k == "ROLLCALL_RETRAIN_ON_LOAD").then(|| raw.to_string()));
            assert_eq!(config.retrain_on_load, expected, "{raw}");
        }

        // Unrecognised values keep whatever the file said.
        let mut config = Config::with_root(Path::new("/srv/rollcall"));
        config.retrain_on_load = true;
        config.apply_overrides(|k| (k == "ROLLCALL_RETRAIN_ON_LOAD").then(|| "maybe".to_string()));
        assert!(config.retrain_on_load);
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/rollcall/samples"
match_threshold = 70.0

[detector]
min_neighbors = 4

[recognizer]
grid_x = 4
grid_y = 4
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/rollcall/samples"));
        assert_eq!(config.match_threshold, 70.0);
        assert_eq!(config.detector.min_neighbors, 4);
        assert_eq!(config.detector.scale_factor, 1.1);
        assert_eq!(config.recognizer.grid_x, 4);
        assert_eq!(config.recognizer.neighbors, 8);
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            Config::from_file("/nonexistent/rollcall.toml"),
            Err(ConfigError::Read { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "match_threshold = \"high\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }
}
