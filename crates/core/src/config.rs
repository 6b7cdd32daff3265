//! Config file loading.
//!
//! The format is picked from the file extension: `.toml`, `.yaml`/`.yml` or
//! `.json`. Anything else is rejected rather than guessed.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::result::Result;

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Detect the format from a path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Parse `content` in this format.
    ///
    /// # Errors
    ///
    /// Returns the format-specific parse error.
    pub fn parse<T: DeserializeOwned>(self, content: &str) -> Result<T> {
        match self {
            Self::Toml => toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string())),
            Self::Yaml => {
                serde_yaml::from_str(content).map_err(|e| Error::yaml_parse_failed(e.to_string()))
            }
            Self::Json => {
                serde_json::from_str(content).map_err(|e| Error::json_parse_failed(e.to_string()))
            }
        }
    }
}

/// Load and deserialize a configuration file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, its extension is unknown,
/// or its content does not match `T`.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let format = ConfigFormat::from_path(path).ok_or_else(|| Error::unsupported_format(path))?;
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
    tracing::debug!(path = %path.display(), format = ?format, "Loading config file");
    format.parse(&content)
}

/// Serialization helper for `Duration` as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serialization helper for `Duration` as milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde::Deserialize;
    use std::io::Write;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(with = "duration_secs")]
        interval: Duration,
    }

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.YML")), Some(ConfigFormat::Yaml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), Some(ConfigFormat::Json));
        assert_eq!(ConfigFormat::from_path(Path::new("a.ini")), None);
        assert_eq!(ConfigFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn test_load_toml() {
        let file = write_temp(".toml", "name = \"demo\"\ninterval = 180\n");
        let sample: Sample = load_file(file.path()).unwrap();
        assert_eq!(sample.name, "demo");
        assert_eq!(sample.interval, Duration::from_secs(180));
    }

    #[test]
    fn test_load_yaml() {
        let file = write_temp(".yaml", "name: demo\ninterval: 5\n");
        let sample: Sample = load_file(file.path()).unwrap();
        assert_eq!(sample.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let file = write_temp(".ini", "name = demo");
        let result: Result<Sample> = load_file(file.path());
        assert!(matches!(result, Err(Error::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_load_reports_parse_error() {
        let file = write_temp(".toml", "name = ");
        let result: Result<Sample> = load_file(file.path());
        assert!(matches!(result, Err(Error::TomlParseFailed { .. })));
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<Sample> = load_file(Path::new("/nonexistent/keel.toml"));
        assert!(matches!(result, Err(Error::FileReadFailed { .. })));
    }
}
