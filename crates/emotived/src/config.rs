use emotive_core::{DetectionParams, NumericType};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Listening port when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 10000;
const DEFAULT_BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_MODEL_PATH: &str = "models/emotion_model.onnx";
const DEFAULT_CASCADE_PATH: &str = "models/haarcascade_frontalface_default.xml";
/// Status codes allowed for the "no face" response.
const NO_FACE_STATUSES: [u16; 2] = [200, 422];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: defaults, then an optional TOML file, then environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Interface to bind (default: 0.0.0.0).
    pub bind_addr: IpAddr,
    /// Listening port, from `PORT` (default: 10000).
    pub port: u16,
    /// ONNX emotion model.
    pub model_path: PathBuf,
    /// Haar cascade XML.
    pub cascade_path: PathBuf,
    /// Face detection parameters (scale factor 1.1, 4 neighbours by default).
    pub detection: DetectionParams,
    /// Force the classifier input element type instead of reading it from the model.
    pub input_type: Option<NumericType>,
    /// HTTP status for the "no face detected" response: 422, or 200 for legacy clients.
    pub no_face_status: u16,
    /// Maximum accepted request body.
    pub body_limit_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            cascade_path: PathBuf::from(DEFAULT_CASCADE_PATH),
            detection: DetectionParams::default(),
            input_type: None,
            no_face_status: 422,
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
        }
    }
}

/// Optional overrides read from the file named by `EMOTIVE_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind_addr: Option<IpAddr>,
    port: Option<u16>,
    model_path: Option<PathBuf>,
    cascade_path: Option<PathBuf>,
    scale_factor: Option<f64>,
    min_neighbors: Option<u32>,
    min_face_size: Option<u32>,
    input_type: Option<String>,
    no_face_status: Option<u16>,
    body_limit_bytes: Option<usize>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `env` to resolve variables.
    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = env("EMOTIVE_CONFIG") {
            let file = FileConfig::read(Path::new(&path))?;
            config.apply_file(file)?;
            tracing::info!(path, "loaded config file");
        }

        config.apply_env(&env);
        config.detection.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.model_path {
            self.model_path = v;
        }
        if let Some(v) = file.cascade_path {
            self.cascade_path = v;
        }
        if let Some(v) = file.scale_factor {
            self.detection.scale_factor = v;
        }
        if let Some(v) = file.min_neighbors {
            self.detection.min_neighbors = v;
        }
        if let Some(v) = file.min_face_size {
            self.detection.min_size = Some((v, v));
        }
        if let Some(v) = file.input_type {
            let t = v.parse().map_err(|e| ConfigError::Invalid(format!("input_type: {e}")))?;
            self.input_type = Some(t);
        }
        if let Some(v) = file.no_face_status {
            if !NO_FACE_STATUSES.contains(&v) {
                return Err(ConfigError::Invalid(format!(
                    "no_face_status must be 200 or 422, got {v}"
                )));
            }
            self.no_face_status = v;
        }
        if let Some(v) = file.body_limit_bytes {
            self.body_limit_bytes = v;
        }
        Ok(())
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env_parse(env, "EMOTIVE_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = env_parse(env, "PORT") {
            self.port = v;
        }
        if let Some(v) = env("EMOTIVE_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = env("EMOTIVE_CASCADE_PATH") {
            self.cascade_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<f64>(env, "EMOTIVE_SCALE_FACTOR") {
            if v > 1.0 {
                self.detection.scale_factor = v;
            } else {
                tracing::warn!(value = v, "EMOTIVE_SCALE_FACTOR must be > 1; keeping default");
            }
        }
        if let Some(v) = env_parse(env, "EMOTIVE_MIN_NEIGHBORS") {
            self.detection.min_neighbors = v;
        }
        if let Some(v) = env_parse::<u32>(env, "EMOTIVE_MIN_FACE_SIZE") {
            self.detection.min_size = Some((v, v));
        }
        if let Some(v) = env_parse(env, "EMOTIVE_INPUT_TYPE") {
            self.input_type = Some(v);
        }
        if let Some(v) = env_parse::<u16>(env, "EMOTIVE_NO_FACE_STATUS") {
            if NO_FACE_STATUSES.contains(&v) {
                self.no_face_status = v;
            } else {
                tracing::warn!(value = v, "EMOTIVE_NO_FACE_STATUS must be 200 or 422; ignoring");
            }
        }
        if let Some(v) = env_parse(env, "EMOTIVE_BODY_LIMIT_BYTES") {
            self.body_limit_bytes = v;
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Parse a variable, warning and returning `None` when the value is malformed.
fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 10000);
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:10000");
        assert_eq!(config.detection, DetectionParams::default());
        assert_eq!(config.no_face_status, 422);
        assert_eq!(config.input_type, None);
    }

    #[test]
    fn test_port_from_env() {
        let config = Config::from_lookup(lookup(&[("PORT", "7000")])).unwrap();
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "seven thousand"),
            ("EMOTIVE_SCALE_FACTOR", "0.9"),
            ("EMOTIVE_NO_FACE_STATUS", "500"),
            ("EMOTIVE_INPUT_TYPE", "bfloat16"),
        ]))
        .unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.detection.scale_factor, 1.1);
        assert_eq!(config.no_face_status, 422);
        assert_eq!(config.input_type, None);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("EMOTIVE_BIND_ADDR", "127.0.0.1"),
            ("EMOTIVE_MODEL_PATH", "/srv/model.onnx"),
            ("EMOTIVE_CASCADE_PATH", "/srv/cascade.xml"),
            ("EMOTIVE_SCALE_FACTOR", "1.2"),
            ("EMOTIVE_MIN_NEIGHBORS", "6"),
            ("EMOTIVE_MIN_FACE_SIZE", "30"),
            ("EMOTIVE_INPUT_TYPE", "float64"),
            ("EMOTIVE_NO_FACE_STATUS", "200"),
            ("EMOTIVE_BODY_LIMIT_BYTES", "1024"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:10000");
        assert_eq!(config.model_path, PathBuf::from("/srv/model.onnx"));
        assert_eq!(config.cascade_path, PathBuf::from("/srv/cascade.xml"));
        assert_eq!(config.detection.scale_factor, 1.2);
        assert_eq!(config.detection.min_neighbors, 6);
        assert_eq!(config.detection.min_size, Some((30, 30)));
        assert_eq!(config.input_type, Some(NumericType::Float64));
        assert_eq!(config.no_face_status, 200);
        assert_eq!(config.body_limit_bytes, 1024);
    }

    #[test]
    fn test_float16_input_type() {
        let config = Config::from_lookup(lookup(&[("EMOTIVE_INPUT_TYPE", "float16")])).unwrap();
        assert_eq!(config.input_type, Some(NumericType::Float16));
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emotived.toml");
        std::fs::write(
            &path,
            "port = 8080\nmin_neighbors = 3\nno_face_status = 200\nmodel_path = \"/opt/m.onnx\"\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let config = Config::from_lookup(lookup(&[
            ("EMOTIVE_CONFIG", path_str.as_str()),
            ("PORT", "9090"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9090, "env wins over file");
        assert_eq!(config.detection.min_neighbors, 3);
        assert_eq!(config.no_face_status, 200);
        assert_eq!(config.model_path, PathBuf::from("/opt/m.onnx"));
    }

    #[test]
    fn test_file_errors_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bad_key = dir.path().join("bad_key.toml");
        std::fs::write(&bad_key, "prot = 1\n").unwrap();
        let bad_status = dir.path().join("bad_status.toml");
        std::fs::write(&bad_status, "no_face_status = 404\n").unwrap();
        let bad_scale = dir.path().join("bad_scale.toml");
        std::fs::write(&bad_scale, "scale_factor = 1.0\n").unwrap();

        for (path, want) in [(&bad_key, "parse"), (&bad_status, "invalid"), (&bad_scale, "invalid")] {
            let p = path.to_string_lossy().into_owned();
            let err = Config::from_lookup(lookup(&[("EMOTIVE_CONFIG", p.as_str())])).unwrap_err();
            match want {
                "parse" => assert!(matches!(err, ConfigError::Parse(_)), "{err}"),
                _ => assert!(matches!(err, ConfigError::Invalid(_)), "{err}"),
            }
        }

        let missing = Config::from_lookup(lookup(&[("EMOTIVE_CONFIG", "/nonexistent/emotived.toml")]));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
