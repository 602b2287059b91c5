//! Client configuration
//!
//! Loaded from TOML; every field has a default so a partial file works.
//!
//! ```toml
//! [connection]
//! username = "listener"
//! ping_interval_ms = 1000
//!
//! [audio]
//! frame_duration_ms = 10
//!
//! [jitter]
//! target_frames = 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::buffer::JitterSettings;
use crate::audio::mixer::MixerSettings;
use crate::audio::pacer::PacerSettings;
use crate::constants::{
    DEFAULT_FRAME_DURATION_MS, DEFAULT_JITTER_TARGET_FRAMES, DEFAULT_PING_INTERVAL_MS, LOCAL_BUFFER_FRAMES,
    PACER_GAP_FRAMES, TALK_END_THRESHOLD,
};
use crate::error::{Error, Result};
use crate::protocol::MessageType;

/// Top-level client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub audio: AudioConfig,
    pub jitter: JitterConfig,
}

/// Handshake and keep-alive settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub username: String,
    /// Client release string sent in `Version`
    pub release: String,
    pub ping_interval_ms: u64,
    /// Message types that must arrive before the connection is ready
    pub bootstrap: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            username: "mumble-voice".to_string(),
            release: concat!("mumble-voice ", env!("CARGO_PKG_VERSION")).to_string(),
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            bootstrap: vec!["ServerSync".to_string(), "ServerConfig".to_string()],
        }
    }
}

/// Frame cadence and stream sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Wire frame length; encoders and remote senders use 10 ms frames
    pub frame_duration_ms: u64,
    pub local_buffer_frames: usize,
    pub talk_end_threshold: u32,
    pub pacer_gap_frames: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            local_buffer_frames: LOCAL_BUFFER_FRAMES,
            talk_end_threshold: TALK_END_THRESHOLD,
            pacer_gap_frames: PACER_GAP_FRAMES,
        }
    }
}

/// Per-speaker jitter buffer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    pub target_frames: usize,
    pub max_padding_frames: u32,
    pub max_sequence_gap: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            target_frames: DEFAULT_JITTER_TARGET_FRAMES,
            max_padding_frames: 2,
            max_sequence_gap: 100,
        }
    }
}

impl ClientConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the default location, falling back to defaults if absent
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// `<config dir>/mumble-voice/config.toml` on this platform
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "mumble-voice").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (
                self.audio.frame_duration_ms != DEFAULT_FRAME_DURATION_MS,
                "audio.frame_duration_ms must be 10",
            ),
            (self.audio.local_buffer_frames == 0, "audio.local_buffer_frames must be positive"),
            (self.audio.talk_end_threshold == 0, "audio.talk_end_threshold must be positive"),
            (self.audio.pacer_gap_frames == 0, "audio.pacer_gap_frames must be positive"),
            (self.connection.ping_interval_ms == 0, "connection.ping_interval_ms must be positive"),
            (self.jitter.target_frames == 0, "jitter.target_frames must be positive"),
        ];
        if let Some((_, message)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(Error::Config((*message).to_string()));
        }

        if let Some(unknown) = self
            .connection
            .bootstrap
            .iter()
            .find(|name| MessageType::from_name(name).is_none())
        {
            return Err(Error::Config(format!("Unknown bootstrap message type: {}", unknown)));
        }
        Ok(())
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.audio.frame_duration_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.connection.ping_interval_ms)
    }

    /// Bootstrap checklist as message types; unknown names are skipped
    pub fn bootstrap_types(&self) -> Vec<MessageType> {
        self.connection
            .bootstrap
            .iter()
            .filter_map(|name| MessageType::from_name(name))
            .collect()
    }

    pub fn jitter_settings(&self) -> JitterSettings {
        JitterSettings {
            target_frames: self.jitter.target_frames,
            max_padding_frames: self.jitter.max_padding_frames,
            max_sequence_gap: self.jitter.max_sequence_gap,
        }
    }

    pub fn mixer_settings(&self) -> MixerSettings {
        MixerSettings {
            frame_duration: self.frame_duration(),
            talk_end_threshold: self.audio.talk_end_threshold,
            jitter: self.jitter_settings(),
        }
    }

    pub fn pacer_settings(&self) -> PacerSettings {
        PacerSettings {
            frame_duration: self.frame_duration(),
            local_buffer_frames: self.audio.local_buffer_frames,
            gap_frames: self.audio.pacer_gap_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_cadence() {
        let config = ClientConfig::default();
        assert_eq!(config.frame_duration(), Duration::from_millis(10));
        assert_eq!(config.audio.local_buffer_frames, 10);
        assert_eq!(config.audio.talk_end_threshold, 20);
        assert_eq!(
            config.bootstrap_types(),
            vec![MessageType::ServerSync, MessageType::ServerConfig]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            [connection]
            username = "alice"

            [jitter]
            target_frames = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.username, "alice");
        assert_eq!(config.jitter.target_frames, 4);
        assert_eq!(config.audio, AudioConfig::default());
    }

    #[test]
    fn test_validation_errors() {
        for duration in [0, 20, 60] {
            let err = ClientConfig::from_toml_str(&format!("[audio]\nframe_duration_ms = {duration}\n")).unwrap_err();
            assert!(matches!(err, Error::Config(ref m) if m.contains("frame_duration_ms")));
        }
        assert!(ClientConfig::from_toml_str("[audio]\nframe_duration_ms = 10\n").is_ok());

        let err = ClientConfig::from_toml_str("[connection]\nbootstrap = [\"Nope\"]\n").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("Nope")));

        assert!(matches!(
            ClientConfig::from_toml_str("audio = 3"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = ClientConfig::default();
        config.connection.username = "bob".to_string();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ClientConfig::from_toml_str(&text).unwrap(), config);
    }
}
