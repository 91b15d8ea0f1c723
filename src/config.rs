//! Configuration loading for the transcription pipeline.
//!
//! Settings come from environment variables, optionally seeded from a
//! `KEY=VALUE` config file (`--config`). Environment variables win over file
//! entries. Unknown keys are ignored; malformed values are configuration
//! errors that name the offending key.

use crate::defaults;
use crate::error::{Result, TranskriboError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Supported transcription backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    Cloud,
    LocalOffline,
    LocalLarge,
}

impl FromStr for BackendChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cloud" => Ok(BackendChoice::Cloud),
            "local_offline" => Ok(BackendChoice::LocalOffline),
            "local_large" => Ok(BackendChoice::LocalLarge),
            other => Err(format!(
                "unknown backend '{other}' (expected cloud, local_offline, or local_large)"
            )),
        }
    }
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendChoice::Cloud => "cloud",
            BackendChoice::LocalOffline => "local_offline",
            BackendChoice::LocalLarge => "local_large",
        };
        write!(f, "{name}")
    }
}

/// Input level monitoring thresholds.
#[derive(Debug, Clone, Serialize)]
pub struct LevelMonitorSettings {
    pub enabled: bool,
    pub silence_threshold_dbfs: f64,
    pub silence_duration_seconds: f64,
    pub clip_threshold_dbfs: f64,
    pub clip_hold_seconds: f64,
}

impl Default for LevelMonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            silence_threshold_dbfs: defaults::LEVEL_SILENCE_THRESHOLD_DBFS,
            silence_duration_seconds: defaults::LEVEL_SILENCE_DURATION_SECONDS,
            clip_threshold_dbfs: defaults::LEVEL_CLIP_THRESHOLD_DBFS,
            clip_hold_seconds: defaults::LEVEL_CLIP_HOLD_SECONDS,
        }
    }
}

/// Audio capture configuration.
#[derive(Debug, Clone, Serialize)]
pub struct AudioSettings {
    /// Fixed device index; None selects the system default.
    pub device_index: Option<usize>,
    /// Pin a device whose name contains this substring (resolved per bind).
    pub device_name: Option<String>,
    /// Pipeline sample rate.
    pub sample_rate: u32,
    /// Native device rate; the capture stream resamples to `sample_rate`.
    pub device_sample_rate: u32,
    pub channels: u16,
    pub chunk_duration_seconds: f64,
    pub device_check_interval: f64,
    pub level: LevelMonitorSettings,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            device_index: None,
            device_name: None,
            sample_rate: defaults::SAMPLE_RATE,
            device_sample_rate: defaults::SAMPLE_RATE,
            channels: 1,
            chunk_duration_seconds: defaults::CHUNK_DURATION_SECONDS,
            device_check_interval: defaults::DEVICE_CHECK_INTERVAL_SECONDS,
            level: LevelMonitorSettings::default(),
        }
    }
}

impl AudioSettings {
    /// Samples per frame at the pipeline rate.
    pub fn frame_samples(&self) -> usize {
        ((self.sample_rate as f64 * self.chunk_duration_seconds).round() as usize).max(1)
    }

    /// Samples per frame at the native device rate.
    pub fn device_frame_samples(&self) -> usize {
        ((self.device_sample_rate as f64 * self.chunk_duration_seconds).round() as usize).max(1)
    }
}

/// Streaming cloud recognizer configuration.
#[derive(Debug, Clone, Serialize)]
pub struct CloudSettings {
    #[serde(serialize_with = "mask_secret")]
    pub api_key: String,
    pub connection_url: String,
    /// Token exchange endpoint; the long-lived key is swapped here for a
    /// short-lived bearer before each connection attempt.
    pub auth_url: String,
    pub language: String,
    pub jwt_ttl_seconds: u64,
    pub enable_diarization: bool,
}

/// Embedded offline recognizer configuration.
#[derive(Debug, Clone, Serialize)]
pub struct OfflineSettings {
    pub model_path: PathBuf,
}

/// Windowed local recognizer configuration.
#[derive(Debug, Clone, Serialize)]
pub struct WindowedSettings {
    pub model_path: PathBuf,
    pub language: String,
    pub window_seconds: f64,
}

/// Caption endpoint configuration.
#[derive(Debug, Clone, Serialize)]
pub struct CaptionSettings {
    pub enabled: bool,
    pub post_url: Option<String>,
    pub min_post_interval_seconds: f64,
}

impl CaptionSettings {
    /// Posting is active only with both the switch on and a URL configured.
    pub fn is_active(&self) -> bool {
        self.enabled && self.post_url.is_some()
    }
}

impl Default for CaptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            post_url: None,
            min_post_interval_seconds: defaults::CAPTION_MIN_POST_INTERVAL_SECONDS,
        }
    }
}

/// Transcript file persistence.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscriptLogSettings {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    pub overwrite: bool,
}

impl TranscriptLogSettings {
    pub fn is_active(&self) -> bool {
        self.enabled && self.path.is_some()
    }
}

/// Caption board (HTTP + WebSocket) configuration.
#[derive(Debug, Clone, Serialize)]
pub struct WebSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub open_browser: bool,
    pub web_root: PathBuf,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: defaults::WEB_UI_HOST.to_string(),
            port: defaults::WEB_UI_PORT,
            open_browser: false,
            web_root: PathBuf::from("web"),
        }
    }
}

/// Translation provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationProvider {
    Libre,
    Google,
}

impl FromStr for TranslationProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "libre" => Ok(TranslationProvider::Libre),
            "google" => Ok(TranslationProvider::Google),
            other => Err(format!(
                "unknown translation provider '{other}' (expected libre or google)"
            )),
        }
    }
}

/// Machine translation configuration.
#[derive(Debug, Clone, Serialize)]
pub struct TranslationSettings {
    pub enabled: bool,
    pub provider: TranslationProvider,
    pub source_language: String,
    pub targets: Vec<String>,
    pub default_visibility: HashMap<String, bool>,
    pub timeout_seconds: f64,
    pub libre_url: String,
    #[serde(serialize_with = "mask_optional_secret")]
    pub libre_api_key: Option<String>,
    #[serde(serialize_with = "mask_optional_secret")]
    pub google_api_key: Option<String>,
}

impl TranslationSettings {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.targets.is_empty()
    }
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: TranslationProvider::Libre,
            source_language: defaults::SOURCE_LANGUAGE.to_string(),
            targets: Vec::new(),
            default_visibility: HashMap::new(),
            timeout_seconds: defaults::TRANSLATION_TIMEOUT_SECONDS,
            libre_url: "https://libretranslate.de".to_string(),
            libre_api_key: None,
            google_api_key: None,
        }
    }
}

/// Discord webhook configuration.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookSettings {
    pub enabled: bool,
    #[serde(serialize_with = "mask_optional_secret")]
    pub url: Option<String>,
    pub username: String,
    pub flush_interval_seconds: f64,
    pub max_chars: usize,
}

impl WebhookSettings {
    pub fn is_active(&self) -> bool {
        self.enabled && self.url.is_some()
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            username: defaults::WEBHOOK_USERNAME.to_string(),
            flush_interval_seconds: defaults::WEBHOOK_FLUSH_INTERVAL_SECONDS,
            max_chars: defaults::WEBHOOK_MAX_CHARS,
        }
    }
}

/// Process-wide logging configuration.
#[derive(Debug, Clone, Serialize)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Aggregated settings for the transcription pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub backend: BackendChoice,
    pub audio: AudioSettings,
    pub cloud: Option<CloudSettings>,
    pub offline: Option<OfflineSettings>,
    pub windowed: Option<WindowedSettings>,
    pub caption: CaptionSettings,
    pub transcript_log: TranscriptLogSettings,
    pub web: WebSettings,
    pub translation: TranslationSettings,
    pub webhook: WebhookSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from the process environment, optionally seeded from a
    /// `KEY=VALUE` file. Environment variables win over file entries, and
    /// CLI overrides win over both (so an overridden backend is validated
    /// like a configured one).
    pub fn load(config_file: Option<&Path>, overrides: &[(&str, String)]) -> Result<Self> {
        let mut map = match config_file {
            Some(path) => read_key_value_file(path)?,
            None => HashMap::new(),
        };
        for (key, value) in std::env::vars() {
            map.insert(key, value);
        }
        for (key, value) in overrides {
            map.insert(key.to_string(), value.clone());
        }
        Self::from_map(&map)
    }

    /// Build settings from a flat key/value map. Exposed for tests.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let backend: BackendChoice = get_parsed(map, "TRANSCRIPTION_BACKEND", BackendChoice::Cloud)?;

        let channels: u16 = get_parsed(map, "AUDIO_CHANNELS", 1)?;
        if channels != 1 {
            return Err(TranskriboError::ConfigInvalidValue {
                key: "AUDIO_CHANNELS".to_string(),
                message: format!("must be 1 (mono), got {channels}"),
            });
        }

        let sample_rate: u32 = get_parsed(map, "AUDIO_SAMPLE_RATE", defaults::SAMPLE_RATE)?;
        let audio = AudioSettings {
            device_index: get_optional_parsed(map, "AUDIO_DEVICE_INDEX")?,
            device_name: get_nonempty(map, "AUDIO_DEVICE_NAME"),
            sample_rate,
            device_sample_rate: get_parsed(map, "AUDIO_DEVICE_SAMPLE_RATE", sample_rate)?,
            channels,
            chunk_duration_seconds: get_positive(
                map,
                "AUDIO_CHUNK_DURATION_SECONDS",
                defaults::CHUNK_DURATION_SECONDS,
            )?,
            device_check_interval: get_positive(
                map,
                "AUDIO_DEVICE_CHECK_INTERVAL",
                defaults::DEVICE_CHECK_INTERVAL_SECONDS,
            )?,
            level: LevelMonitorSettings {
                enabled: get_bool(map, "AUDIO_LEVEL_MONITOR_ENABLED", true)?,
                silence_threshold_dbfs: get_parsed(
                    map,
                    "AUDIO_LEVEL_SILENCE_THRESHOLD_DBFS",
                    defaults::LEVEL_SILENCE_THRESHOLD_DBFS,
                )?,
                silence_duration_seconds: get_positive(
                    map,
                    "AUDIO_LEVEL_SILENCE_DURATION_SECONDS",
                    defaults::LEVEL_SILENCE_DURATION_SECONDS,
                )?,
                // A clip threshold above full scale can never fire.
                clip_threshold_dbfs: get_parsed(
                    map,
                    "AUDIO_LEVEL_CLIP_THRESHOLD_DBFS",
                    defaults::LEVEL_CLIP_THRESHOLD_DBFS,
                )?
                .min(0.0),
                clip_hold_seconds: get_positive(
                    map,
                    "AUDIO_LEVEL_CLIP_HOLD_SECONDS",
                    defaults::LEVEL_CLIP_HOLD_SECONDS,
                )?,
            },
        };

        let cloud = match (get_nonempty(map, "CLOUD_API_KEY"), backend) {
            (None, BackendChoice::Cloud) => {
                return Err(TranskriboError::ConfigMissingKey {
                    key: "CLOUD_API_KEY".to_string(),
                    hint: "required by the cloud backend".to_string(),
                });
            }
            (None, _) => None,
            (Some(api_key), _) => {
                let connection_url = get_nonempty(map, "CLOUD_CONNECTION_URL").ok_or_else(|| {
                    TranskriboError::ConfigMissingKey {
                        key: "CLOUD_CONNECTION_URL".to_string(),
                        hint: "wss:// realtime endpoint for the cloud backend".to_string(),
                    }
                })?;
                Some(CloudSettings {
                    api_key,
                    auth_url: get_string(
                        map,
                        "CLOUD_AUTH_URL",
                        &derive_auth_url(&connection_url),
                    ),
                    connection_url,
                    language: get_string(map, "CLOUD_LANGUAGE", defaults::SOURCE_LANGUAGE),
                    jwt_ttl_seconds: get_parsed(
                        map,
                        "CLOUD_JWT_TTL_SECONDS",
                        defaults::CLOUD_JWT_TTL_SECONDS,
                    )?,
                    enable_diarization: get_bool(map, "CLOUD_ENABLE_DIARIZATION", true)?,
                })
            }
        };

        let offline = match get_nonempty(map, "LOCAL_MODEL_PATH") {
            Some(path) => Some(OfflineSettings {
                model_path: PathBuf::from(path),
            }),
            None if backend == BackendChoice::LocalOffline => {
                return Err(TranskriboError::ConfigMissingKey {
                    key: "LOCAL_MODEL_PATH".to_string(),
                    hint: "directory of the offline recognizer model".to_string(),
                });
            }
            None => None,
        };

        let windowed = {
            let explicit_path = get_nonempty(map, "LOCAL_LARGE_MODEL_PATH");
            let size = get_string(map, "LOCAL_LARGE_MODEL_SIZE", "medium");
            if explicit_path.is_some() || backend == BackendChoice::LocalLarge {
                let model_path = explicit_path
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(format!("models/ggml-{size}.bin")));
                Some(WindowedSettings {
                    model_path,
                    language: get_string(map, "CLOUD_LANGUAGE", defaults::SOURCE_LANGUAGE),
                    window_seconds: get_positive(
                        map,
                        "LOCAL_LARGE_WINDOW_SECONDS",
                        defaults::LOCAL_LARGE_WINDOW_SECONDS,
                    )?,
                })
            } else {
                None
            }
        };

        let caption = CaptionSettings {
            enabled: get_bool(map, "CAPTION_ENABLED", true)?,
            post_url: get_nonempty(map, "CAPTION_POST_URL"),
            min_post_interval_seconds: get_positive(
                map,
                "CAPTION_MIN_POST_INTERVAL_SECONDS",
                defaults::CAPTION_MIN_POST_INTERVAL_SECONDS,
            )?,
        };

        let log_path = get_nonempty(map, "TRANSCRIPT_LOG_PATH");
        let transcript_log = TranscriptLogSettings {
            enabled: get_bool(map, "TRANSCRIPT_LOG_ENABLED", false)? || log_path.is_some(),
            path: log_path.map(PathBuf::from),
            overwrite: get_bool(map, "TRANSCRIPT_LOG_OVERWRITE", false)?,
        };

        let web = WebSettings {
            enabled: get_bool(map, "WEB_UI_ENABLED", true)?,
            host: get_string(map, "WEB_UI_HOST", defaults::WEB_UI_HOST),
            port: get_parsed(map, "WEB_UI_PORT", defaults::WEB_UI_PORT)?,
            open_browser: get_bool(map, "WEB_UI_OPEN_BROWSER", false)?,
            web_root: PathBuf::from(get_string(map, "WEB_UI_ROOT", "web")),
        };

        let targets = parse_list(map.get("TRANSLATION_TARGETS").map(String::as_str));
        let translation = TranslationSettings {
            enabled: get_bool(map, "TRANSLATION_ENABLED", !targets.is_empty())?,
            provider: get_parsed(map, "TRANSLATION_PROVIDER", TranslationProvider::Libre)?,
            source_language: get_string(
                map,
                "TRANSLATION_SOURCE_LANGUAGE",
                defaults::SOURCE_LANGUAGE,
            ),
            default_visibility: parse_visibility(
                map.get("TRANSLATION_DEFAULT_VISIBILITY").map(String::as_str),
                &targets,
            ),
            targets,
            timeout_seconds: get_positive(
                map,
                "TRANSLATION_TIMEOUT_SECONDS",
                defaults::TRANSLATION_TIMEOUT_SECONDS,
            )?,
            libre_url: get_string(map, "LIBRETRANSLATE_URL", "https://libretranslate.de")
                .trim_end_matches('/')
                .to_string(),
            libre_api_key: get_nonempty(map, "LIBRETRANSLATE_API_KEY"),
            google_api_key: get_nonempty(map, "GOOGLE_TRANSLATE_API_KEY"),
        };

        let webhook = WebhookSettings {
            enabled: get_bool(map, "WEBHOOK_ENABLED", false)?,
            url: get_nonempty(map, "WEBHOOK_URL"),
            username: get_string(map, "WEBHOOK_USERNAME", defaults::WEBHOOK_USERNAME),
            flush_interval_seconds: get_positive(
                map,
                "WEBHOOK_FLUSH_INTERVAL",
                defaults::WEBHOOK_FLUSH_INTERVAL_SECONDS,
            )?,
            max_chars: get_parsed(map, "WEBHOOK_MAX_CHARS", defaults::WEBHOOK_MAX_CHARS)?,
        };

        let logging = LoggingSettings {
            level: get_string(map, "LOG_LEVEL", "info"),
            file: get_nonempty(map, "LOG_FILE").map(PathBuf::from),
        };

        Ok(Settings {
            backend,
            audio,
            cloud,
            offline,
            windowed,
            caption,
            transcript_log,
            web,
            translation,
            webhook,
            logging,
        })
    }

    /// Effective configuration with secret fields masked, for `--show-config`.
    pub fn to_masked_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TranskriboError::Other(format!("failed to render config: {e}")))
    }
}

/// Serde helper: always render secrets redacted.
fn mask_secret<S: serde::Serializer>(_: &String, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str("***redacted***")
}

fn mask_optional_secret<S: serde::Serializer>(
    value: &Option<String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_str("***redacted***"),
        None => serializer.serialize_none(),
    }
}

/// The token exchange endpoint defaults to `https://<ws host>/v1/api_keys`.
fn derive_auth_url(connection_url: &str) -> String {
    let host = connection_url
        .trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .split('/')
        .next()
        .unwrap_or_default();
    format!("https://{host}/v1/api_keys")
}

/// Parse a `KEY=VALUE` file. Blank lines and `#` comments are skipped.
fn read_key_value_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents = fs::read_to_string(path).map_err(|_| TranskriboError::ConfigFileNotFound {
        path: path.display().to_string(),
    })?;

    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok(map)
}

fn get_string(map: &HashMap<String, String>, key: &str, default: &str) -> String {
    map.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string())
}

fn get_nonempty(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn get_parsed<T>(map: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get_nonempty(map, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| TranskriboError::ConfigInvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
    }
}

fn get_optional_parsed<T>(map: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get_nonempty(map, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| TranskriboError::ConfigInvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            }),
    }
}

fn get_positive(map: &HashMap<String, String>, key: &str, default: f64) -> Result<f64> {
    let value: f64 = get_parsed(map, key, default)?;
    if value <= 0.0 {
        return Err(TranskriboError::ConfigInvalidValue {
            key: key.to_string(),
            message: format!("must be positive, got {value}"),
        });
    }
    Ok(value)
}

fn get_bool(map: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match get_nonempty(map, key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(TranskriboError::ConfigInvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{other}'"),
            }),
        },
    }
}

/// Parse a comma- or semicolon-separated language list.
fn parse_list(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.replace(';', ",")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `lang:bool` entries; a bare `lang` means visible. Languages not
/// mentioned default to visible.
fn parse_visibility(raw: Option<&str>, targets: &[String]) -> HashMap<String, bool> {
    let mut visibility: HashMap<String, bool> = HashMap::new();
    if let Some(raw) = raw {
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once(':') {
                Some((lang, state)) => {
                    let lang = lang.trim();
                    if !lang.is_empty() {
                        let on = matches!(
                            state.trim().to_ascii_lowercase().as_str(),
                            "1" | "true" | "yes" | "on"
                        );
                        visibility.insert(lang.to_string(), on);
                    }
                }
                None => {
                    visibility.insert(entry.to_string(), true);
                }
            }
        }
    }
    for target in targets {
        visibility.entry(target.clone()).or_insert(true);
    }
    visibility
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("CLOUD_API_KEY".to_string(), "sk-test-key-0123456789".to_string());
        map.insert(
            "CLOUD_CONNECTION_URL".to_string(),
            "wss://rt.example.com/v2".to_string(),
        );
        map
    }

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::from_map(&base_map()).unwrap();
        assert_eq!(settings.backend, BackendChoice::Cloud);
        assert_eq!(settings.audio.sample_rate, 16000);
        assert_eq!(settings.audio.device_sample_rate, 16000);
        assert_eq!(settings.audio.chunk_duration_seconds, 0.5);
        assert_eq!(settings.web.port, 8765);
        assert!(settings.web.enabled);
        assert!(!settings.webhook.is_active());
        assert!(!settings.translation.is_active());
        assert!(!settings.caption.is_active());
    }

    #[test]
    fn test_frame_samples() {
        let settings = Settings::from_map(&base_map()).unwrap();
        assert_eq!(settings.audio.frame_samples(), 8000);
    }

    #[test]
    fn test_device_sample_rate_follows_pipeline_rate() {
        let mut map = base_map();
        map.insert("AUDIO_SAMPLE_RATE".to_string(), "48000".to_string());
        let settings = Settings::from_map(&map).unwrap();
        assert_eq!(settings.audio.device_sample_rate, 48000);

        map.insert("AUDIO_DEVICE_SAMPLE_RATE".to_string(), "44100".to_string());
        let settings = Settings::from_map(&map).unwrap();
        assert_eq!(settings.audio.sample_rate, 48000);
        assert_eq!(settings.audio.device_sample_rate, 44100);
    }

    #[test]
    fn test_cloud_backend_requires_api_key() {
        let map = HashMap::new();
        let err = Settings::from_map(&map).unwrap_err();
        match err {
            TranskriboError::ConfigMissingKey { key, .. } => assert_eq!(key, "CLOUD_API_KEY"),
            other => panic!("expected ConfigMissingKey, got {other:?}"),
        }
    }

    #[test]
    fn test_cloud_backend_requires_connection_url() {
        let mut map = HashMap::new();
        map.insert("CLOUD_API_KEY".to_string(), "sk-test-key-0123456789".to_string());
        let err = Settings::from_map(&map).unwrap_err();
        match err {
            TranskriboError::ConfigMissingKey { key, .. } => {
                assert_eq!(key, "CLOUD_CONNECTION_URL");
            }
            other => panic!("expected ConfigMissingKey, got {other:?}"),
        }
    }

    #[test]
    fn test_offline_backend_requires_model_path() {
        let mut map = HashMap::new();
        map.insert("TRANSCRIPTION_BACKEND".to_string(), "local_offline".to_string());
        let err = Settings::from_map(&map).unwrap_err();
        match err {
            TranskriboError::ConfigMissingKey { key, .. } => assert_eq!(key, "LOCAL_MODEL_PATH"),
            other => panic!("expected ConfigMissingKey, got {other:?}"),
        }
    }

    #[test]
    fn test_local_large_derives_model_path_from_size() {
        let mut map = HashMap::new();
        map.insert("TRANSCRIPTION_BACKEND".to_string(), "local_large".to_string());
        map.insert("LOCAL_LARGE_MODEL_SIZE".to_string(), "small".to_string());
        let settings = Settings::from_map(&map).unwrap();
        let windowed = settings.windowed.unwrap();
        assert_eq!(windowed.model_path, PathBuf::from("models/ggml-small.bin"));
        assert_eq!(windowed.window_seconds, 6.0);
    }

    #[test]
    fn test_channels_must_be_mono() {
        let mut map = base_map();
        map.insert("AUDIO_CHANNELS".to_string(), "2".to_string());
        let err = Settings::from_map(&map).unwrap_err();
        match err {
            TranskriboError::ConfigInvalidValue { key, .. } => assert_eq!(key, "AUDIO_CHANNELS"),
            other => panic!("expected ConfigInvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_number_names_key() {
        let mut map = base_map();
        map.insert("AUDIO_SAMPLE_RATE".to_string(), "fast".to_string());
        let err = Settings::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("AUDIO_SAMPLE_RATE"));
    }

    #[test]
    fn test_negative_interval_rejected() {
        let mut map = base_map();
        map.insert(
            "CAPTION_MIN_POST_INTERVAL_SECONDS".to_string(),
            "-1.0".to_string(),
        );
        assert!(Settings::from_map(&map).is_err());
    }

    #[test]
    fn test_translation_targets_enable_translation() {
        let mut map = base_map();
        map.insert("TRANSLATION_TARGETS".to_string(), "ja, ko;en".to_string());
        let settings = Settings::from_map(&map).unwrap();
        assert!(settings.translation.is_active());
        assert_eq!(settings.translation.targets, vec!["ja", "ko", "en"]);
    }

    #[test]
    fn test_translation_visibility_parsing() {
        let mut map = base_map();
        map.insert("TRANSLATION_TARGETS".to_string(), "ja,ko".to_string());
        map.insert(
            "TRANSLATION_DEFAULT_VISIBILITY".to_string(),
            "ja:false, ko".to_string(),
        );
        let settings = Settings::from_map(&map).unwrap();
        assert_eq!(settings.translation.default_visibility.get("ja"), Some(&false));
        assert_eq!(settings.translation.default_visibility.get("ko"), Some(&true));
    }

    #[test]
    fn test_unmentioned_targets_default_visible() {
        let mut map = base_map();
        map.insert("TRANSLATION_TARGETS".to_string(), "ja,ko".to_string());
        map.insert("TRANSLATION_DEFAULT_VISIBILITY".to_string(), "ja:false".to_string());
        let settings = Settings::from_map(&map).unwrap();
        assert_eq!(settings.translation.default_visibility.get("ko"), Some(&true));
    }

    #[test]
    fn test_transcript_log_path_implies_enabled() {
        let mut map = base_map();
        map.insert("TRANSCRIPT_LOG_PATH".to_string(), "/tmp/meet.log".to_string());
        let settings = Settings::from_map(&map).unwrap();
        assert!(settings.transcript_log.is_active());
    }

    #[test]
    fn test_bool_parsing_variants() {
        for (raw, expected) in [("1", true), ("Yes", true), ("on", true), ("0", false), ("No", false)] {
            let mut map = base_map();
            map.insert("WEBHOOK_ENABLED".to_string(), raw.to_string());
            let settings = Settings::from_map(&map).unwrap();
            assert_eq!(settings.webhook.enabled, expected, "raw={raw}");
        }
    }

    #[test]
    fn test_bool_parse_error_names_key() {
        let mut map = base_map();
        map.insert("WEB_UI_ENABLED".to_string(), "maybe".to_string());
        let err = Settings::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("WEB_UI_ENABLED"));
    }

    #[test]
    fn test_derive_auth_url() {
        assert_eq!(
            derive_auth_url("wss://eu2.rt.example.com/v2"),
            "https://eu2.rt.example.com/v1/api_keys"
        );
    }

    #[test]
    fn test_masked_dump_hides_secrets() {
        let mut map = base_map();
        map.insert("LIBRETRANSLATE_API_KEY".to_string(), "lt-secret".to_string());
        let settings = Settings::from_map(&map).unwrap();
        let dump = settings.to_masked_json().unwrap();
        assert!(!dump.contains("sk-test-key-0123456789"));
        assert!(!dump.contains("lt-secret"));
        assert!(dump.contains("***redacted***"));
    }

    #[test]
    fn test_key_value_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transkribo.env");
        fs::write(
            &path,
            "# meeting setup\nWEB_UI_PORT=9001\nWEBHOOK_URL=\"https://discord.example/hook\"\n\n",
        )
        .unwrap();
        let map = read_key_value_file(&path).unwrap();
        assert_eq!(map.get("WEB_UI_PORT"), Some(&"9001".to_string()));
        assert_eq!(
            map.get("WEBHOOK_URL"),
            Some(&"https://discord.example/hook".to_string())
        );
    }

    #[test]
    fn test_missing_config_file_is_config_error() {
        let err = read_key_value_file(Path::new("/nonexistent/transkribo.env")).unwrap_err();
        assert!(err.is_config_error());
    }
}
