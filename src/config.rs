//! Runtime configuration
//!
//! The gateway is configured from an optional JSON file passed on the
//! command line and from JSON bodies POSTed to the `config` endpoint. Both
//! use the same field names, so the wire format and the file format are one
//! and the same.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, VodError};

/// Gateway configuration.
///
/// Numeric window parameters are in chunks, idle times in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Whether a configuration has been loaded (file or `config` POST).
    /// Requests other than the side channels are refused until then.
    #[serde(skip)]
    pub configured: bool,

    /// Shut the server down when a client reports a different version.
    #[serde(skip)]
    pub version_monitor: bool,

    /// Bind address.
    pub bind: String,

    /// FFmpeg binary.
    pub ffmpeg: String,
    /// FFprobe binary.
    pub ffprobe: String,
    /// Temp files directory.
    #[serde(rename = "tempdir")]
    pub temp_dir: String,

    /// Size of each chunk in seconds.
    pub chunk_size: i64,
    /// How many *chunks* to look behind before restarting transcoding.
    pub look_behind: i64,
    /// Number of chunks in goal to restart encoding.
    pub goal_buffer_min: i64,
    /// Number of chunks in goal to stop encoding.
    pub goal_buffer_max: i64,

    /// Number of seconds to wait before shutting down encoding.
    pub stream_idle_time: i64,
    /// Number of seconds to wait before shutting down a client.
    pub manager_idle_time: i64,

    /// Quality factor (CRF / global_quality / cq depending on the encoder).
    pub qf: u32,

    // Hardware acceleration configuration

    /// VA-API
    pub vaapi: bool,
    pub vaapi_low_power: bool,

    /// NVENC
    pub nvenc: bool,
    #[serde(rename = "nvencTemporalAQ")]
    pub nvenc_temporal_aq: bool,
    /// NVENC scaler: `cuda` or `npp`.
    pub nvenc_scale: String,

    /// Disable autorotation and apply a manual transpose filter instead.
    pub use_transpose: bool,
    /// Force the transpose to run in software.
    pub force_sw_transpose: bool,

    /// Fix the GOP size instead of forcing a keyframe per chunk.
    pub use_gop_size: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            configured: false,
            version_monitor: false,
            bind: ":47788".to_string(),
            ffmpeg: String::new(),
            ffprobe: String::new(),
            temp_dir: String::new(),
            chunk_size: 3,
            look_behind: 3,
            goal_buffer_min: 1,
            goal_buffer_max: 4,
            stream_idle_time: 60,
            manager_idle_time: 60,
            qf: 24,
            vaapi: false,
            vaapi_low_power: false,
            nvenc: false,
            nvenc_temporal_aq: false,
            nvenc_scale: "cuda".to_string(),
            use_transpose: false,
            force_sw_transpose: false,
            use_gop_size: false,
        }
    }
}

impl Config {
    /// Merge a JSON document into this configuration, returning the merged
    /// copy. Fields absent from the document keep their current values; the
    /// result is marked configured.
    pub fn merge_json(&self, body: &[u8]) -> Result<Config> {
        let mut base = serde_json::to_value(self)?;
        let patch: serde_json::Value = serde_json::from_slice(body)?;

        let (Some(base_map), Some(patch_map)) = (base.as_object_mut(), patch.as_object()) else {
            return Err(VodError::Config("expected a JSON object".to_string()));
        };
        for (key, value) in patch_map {
            base_map.insert(key.clone(), value.clone());
        }

        let mut merged: Config = serde_json::from_value(base)?;
        merged.configured = true;
        merged.version_monitor = self.version_monitor;
        Ok(merged)
    }

    /// Load a JSON config file over the current values.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let content = std::fs::read(path.as_ref())?;
        *self = self.merge_json(&content)?;
        tracing::info!(config = ?self, "configuration loaded");
        Ok(())
    }

    /// Locate ffmpeg/ffprobe on PATH if unset, and pick a temp directory.
    pub fn auto_detect(&mut self) -> Result<()> {
        if self.ffmpeg.is_empty() || self.ffprobe.is_empty() {
            let ffmpeg = which::which("ffmpeg")
                .map_err(|_| VodError::Config("could not find ffmpeg".to_string()))?;
            let ffprobe = which::which("ffprobe")
                .map_err(|_| VodError::Config("could not find ffprobe".to_string()))?;
            self.ffmpeg = ffmpeg.to_string_lossy().into_owned();
            self.ffprobe = ffprobe.to_string_lossy().into_owned();
        }

        if self.temp_dir.is_empty() {
            self.temp_dir = std::env::temp_dir()
                .join("go-vod")
                .to_string_lossy()
                .into_owned();
        }

        tracing::info!(config = ?self, "configuration");
        Ok(())
    }

    /// Bind address as accepted by the TCP listener. A bare `:port` means
    /// all interfaces.
    pub fn socket_addr(&self) -> String {
        if self.bind.starts_with(':') {
            format!("0.0.0.0{}", self.bind)
        } else {
            self.bind.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind, ":47788");
        assert_eq!(config.chunk_size, 3);
        assert_eq!(config.look_behind, 3);
        assert_eq!(config.goal_buffer_min, 1);
        assert_eq!(config.goal_buffer_max, 4);
        assert_eq!(config.stream_idle_time, 60);
        assert_eq!(config.manager_idle_time, 60);
        assert!(!config.configured);
    }

    #[test]
    fn test_merge_json_overrides_and_keeps() {
        let config = Config::default();
        let merged = config
            .merge_json(br#"{"chunkSize": 5, "vaapi": true, "tempdir": "/tmp/x"}"#)
            .unwrap();

        assert_eq!(merged.chunk_size, 5);
        assert!(merged.vaapi);
        assert_eq!(merged.temp_dir, "/tmp/x");
        // untouched fields keep their previous values
        assert_eq!(merged.look_behind, 3);
        assert!(merged.configured);
    }

    #[test]
    fn test_merge_json_rejects_non_object() {
        let config = Config::default();
        assert!(config.merge_json(b"[1, 2]").is_err());
        assert!(config.merge_json(b"not json").is_err());
    }

    #[test]
    fn test_merge_preserves_version_monitor() {
        let mut config = Config::default();
        config.version_monitor = true;
        let merged = config.merge_json(br#"{"chunkSize": 4}"#).unwrap();
        assert!(merged.version_monitor);
    }

    #[test]
    fn test_socket_addr() {
        let mut config = Config::default();
        assert_eq!(config.socket_addr(), "0.0.0.0:47788");

        config.bind = "127.0.0.1:8080".to_string();
        assert_eq!(config.socket_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_camel_case_field_names() {
        let config = Config::default();
        let value = serde_json::to_value(&config).unwrap();
        let map = value.as_object().unwrap();
        for key in [
            "bind",
            "ffmpeg",
            "ffprobe",
            "tempdir",
            "chunkSize",
            "lookBehind",
            "goalBufferMin",
            "goalBufferMax",
            "streamIdleTime",
            "managerIdleTime",
            "qf",
            "vaapi",
            "vaapiLowPower",
            "nvenc",
            "nvencTemporalAQ",
            "nvencScale",
            "useTranspose",
            "forceSwTranspose",
            "useGopSize",
        ] {
            assert!(map.contains_key(key), "missing key {key}");
        }
        // internal flags never hit the wire
        assert!(!map.contains_key("configured"));
        assert!(!map.contains_key("versionMonitor"));
    }
}
