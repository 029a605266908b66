//! Configuration loading: TOML file, then environment, then validation.
//!
//! The default file lives at `$CONFIG_DIR/callrelay/config.toml`. A missing
//! default file is not an error; a missing explicit `--config` path is.

pub mod schema;

pub use schema::{
    Config, DuplexMode, GatewayConfig, GreetingMode, ProtocolVersion, RealtimeConfig, RelayConfig,
    TurnDetection,
};

use anyhow::{bail, Context, Result};
use serde::de::{DeserializeOwned, IntoDeserializer};
use std::path::{Path, PathBuf};

use crate::relay::realtime::session_url;

/// `$CONFIG_DIR/callrelay/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "callrelay")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Config {
    /// Load from `path` (or the default location), overlay the process
    /// environment, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Overlay values from an environment-like lookup. Unset keys are left
    /// alone; a set key that does not parse is an error.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        if let Some(key) = get("OPENAI_API_KEY") {
            self.realtime.api_key = Some(key);
        }
        if let Some(url) = get("BASE_URL") {
            self.gateway.public_base_url = Some(url);
        }
        if let Some(host) = get("CALLRELAY_HOST") {
            self.gateway.host = host;
        }
        let port = ["CALLRELAY_PORT", "PORT"]
            .into_iter()
            .find_map(|key| get(key).map(|value| (key, value)));
        if let Some((key, port)) = port {
            self.gateway.port = parse_number(key, &port)?;
        }
        if let Some(max) = get("CALLRELAY_MAX_CALLS") {
            self.gateway.max_concurrent_calls = parse_number("CALLRELAY_MAX_CALLS", &max)?;
        }

        if let Some(ms) = get("CALLRELAY_SILENCE_DEBOUNCE_MS") {
            self.relay.silence_debounce_ms = parse_number("CALLRELAY_SILENCE_DEBOUNCE_MS", &ms)?;
        }
        if let Some(gate) = get("CALLRELAY_LOUDNESS_GATE") {
            self.relay.loudness_gate = parse_number("CALLRELAY_LOUDNESS_GATE", &gate)?;
        }
        if let Some(ms) = get("CALLRELAY_SUSTAINED_VOICE_MS") {
            self.relay.sustained_voice_ms = parse_number("CALLRELAY_SUSTAINED_VOICE_MS", &ms)?;
        }
        if let Some(ms) = get("CALLRELAY_FRAME_MS") {
            self.relay.frame_ms = parse_number("CALLRELAY_FRAME_MS", &ms)?;
        }
        if let Some(mode) = get("CALLRELAY_DUPLEX") {
            self.relay.duplex = parse_variant("CALLRELAY_DUPLEX", &mode)?;
        }

        if let Some(model) = get("CALLRELAY_MODEL") {
            self.realtime.model = model;
        }
        if let Some(voice) = get("CALLRELAY_VOICE") {
            self.realtime.voice = voice;
        }
        if let Some(protocol) = get("CALLRELAY_PROTOCOL") {
            self.realtime.protocol = parse_variant("CALLRELAY_PROTOCOL", &protocol)?;
        }
        if let Some(mode) = get("CALLRELAY_TURN_DETECTION") {
            self.realtime.turn_detection = parse_variant("CALLRELAY_TURN_DETECTION", &mode)?;
        }
        Ok(())
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        let relay = &self.relay;
        if relay.frame_ms == 0 {
            bail!("relay.frame_ms must be greater than 0");
        }
        if relay.sustained_voice_ms == 0 {
            bail!("relay.sustained_voice_ms must be greater than 0");
        }
        if relay.silence_debounce_ms == 0 {
            bail!("relay.silence_debounce_ms must be greater than 0");
        }
        if !relay.loudness_gate.is_finite() || relay.loudness_gate < 0.0 {
            bail!(
                "relay.loudness_gate must be a non-negative number, got {}",
                relay.loudness_gate
            );
        }
        if relay.greeting == GreetingMode::Scripted
            && relay.greeting_text.as_deref().is_none_or(|t| t.trim().is_empty())
        {
            bail!("relay.greeting = \"scripted\" requires relay.greeting_text");
        }

        let realtime = &self.realtime;
        if !(realtime.url.starts_with("wss://") || realtime.url.starts_with("ws://")) {
            bail!("realtime.url must be a ws:// or wss:// URL, got {}", realtime.url);
        }
        session_url(&realtime.url, &realtime.model)
            .map_err(|e| anyhow::anyhow!("realtime.url is not usable: {e}"))?;
        if realtime.model.trim().is_empty() {
            bail!("realtime.model must not be empty");
        }
        if realtime.handshake_timeout_ms == 0 {
            bail!("realtime.handshake_timeout_ms must be greater than 0");
        }
        Ok(())
    }

    /// Serving calls needs credentials; `check-config` does not.
    pub fn require_api_key(&self) -> Result<()> {
        match self.realtime.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(()),
            _ => bail!("No realtime API key configured. Set OPENAI_API_KEY or realtime.api_key"),
        }
    }

    /// Copy safe to print: secrets masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.realtime.api_key.is_some() {
            copy.realtime.api_key = Some("***".into());
        }
        copy
    }

    pub fn to_redacted_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.redacted()).context("Failed to serialize config")
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value for {key}: {raw:?} ({e})"))
}

fn parse_variant<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    let de: serde::de::value::StrDeserializer<'_, serde::de::value::Error> =
        raw.into_deserializer();
    T::deserialize(de).map_err(|e| anyhow::anyhow!("Invalid value for {key}: {raw:?} ({e})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = Config::default();
        config
            .apply_overrides_from(env(&[
                ("OPENAI_API_KEY", "sk-env"),
                ("BASE_URL", "https://relay.example.com"),
                ("CALLRELAY_SILENCE_DEBOUNCE_MS", "600"),
                ("CALLRELAY_LOUDNESS_GATE", "6500.5"),
                ("CALLRELAY_SUSTAINED_VOICE_MS", "160"),
                ("CALLRELAY_FRAME_MS", "10"),
                ("CALLRELAY_DUPLEX", "full"),
                ("CALLRELAY_PROTOCOL", "ga"),
                ("CALLRELAY_TURN_DETECTION", "server_vad"),
                ("PORT", "10000"),
            ]))
            .unwrap();

        assert_eq!(config.realtime.api_key.as_deref(), Some("sk-env"));
        assert_eq!(
            config.gateway.public_base_url.as_deref(),
            Some("https://relay.example.com")
        );
        assert_eq!(config.relay.silence_debounce_ms, 600);
        assert!((config.relay.loudness_gate - 6500.5).abs() < f64::EPSILON);
        assert_eq!(config.relay.sustained_voice_ms, 160);
        assert_eq!(config.relay.frame_ms, 10);
        assert_eq!(config.relay.duplex, DuplexMode::Full);
        assert_eq!(config.realtime.protocol, ProtocolVersion::Ga);
        assert_eq!(config.realtime.turn_detection, TurnDetection::ServerVad);
        assert_eq!(config.gateway.port, 10000);
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut config = Config::default();
        config
            .apply_overrides_from(env(&[("OPENAI_API_KEY", "  "), ("CALLRELAY_FRAME_MS", "")]))
            .unwrap();
        assert!(config.realtime.api_key.is_none());
        assert_eq!(config.relay.frame_ms, 20);
    }

    #[test]
    fn malformed_env_values_are_errors() {
        let mut config = Config::default();
        let err = config
            .apply_overrides_from(env(&[("CALLRELAY_FRAME_MS", "twenty")]))
            .unwrap_err();
        assert!(err.to_string().contains("CALLRELAY_FRAME_MS"));

        let err = config
            .apply_overrides_from(env(&[("CALLRELAY_DUPLEX", "half")]))
            .unwrap_err();
        assert!(err.to_string().contains("CALLRELAY_DUPLEX"));
    }

    #[test]
    fn malformed_port_names_the_variable_read() {
        let mut config = Config::default();
        let err = config
            .apply_overrides_from(env(&[("PORT", "http")]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("PORT"));
        assert!(!err.contains("CALLRELAY_PORT"));

        let err = config
            .apply_overrides_from(env(&[("CALLRELAY_PORT", "x"), ("PORT", "8080")]))
            .unwrap_err();
        assert!(err.to_string().contains("CALLRELAY_PORT"));
    }

    #[test]
    fn realtime_url_without_path_is_accepted() {
        let mut config = Config::default();
        config.realtime.url = "wss://relay.example".into();
        config.validate().unwrap();

        config.realtime.url = "ws://bad host/v1".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_degenerate_timings() {
        for mutate in [
            (|c: &mut Config| c.relay.frame_ms = 0) as fn(&mut Config),
            |c| c.relay.sustained_voice_ms = 0,
            |c| c.relay.silence_debounce_ms = 0,
            |c| c.relay.loudness_gate = -1.0,
            |c| c.relay.loudness_gate = f64::NAN,
            |c| c.realtime.handshake_timeout_ms = 0,
            |c| c.realtime.url = "https://api.openai.com".into(),
        ] {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn scripted_greeting_needs_text() {
        let mut config = Config::default();
        config.relay.greeting = GreetingMode::Scripted;
        assert!(config.validate().is_err());
        config.relay.greeting_text = Some("Welcome!".into());
        config.validate().unwrap();
    }

    #[test]
    fn api_key_required_only_for_serving() {
        let mut config = Config::default();
        assert!(config.require_api_key().is_err());
        config.realtime.api_key = Some("sk-test".into());
        config.require_api_key().unwrap();
    }

    #[test]
    fn redacted_masks_api_key() {
        let mut config = Config::default();
        config.realtime.api_key = Some("sk-secret".into());
        let rendered = config.to_redacted_toml().unwrap();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("***"));
        assert!(rendered.contains("silence_debounce_ms = 450"));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[gateway]\nport = 9090\n\n[relay]\nsustained_voice_ms = 200\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.gateway.port, 9090);
        assert_eq!(config.relay.sustained_voice_ms, 200);
        assert_eq!(config.relay.silence_debounce_ms, 450);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(dir.path().join("nope.toml").as_path())).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay\nframe_ms = ").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
