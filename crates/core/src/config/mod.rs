use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    compositor::Compositor,
    convolver::{ConvolverKind, DEFAULT_FACTOR, DEFAULT_FRAGMENT_SIZE},
    Result, Sample,
};

/// Top-level configuration for one convolution engine and its mixer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: ConvolverKind,
    pub fragment_size: usize,
    pub factor: usize,
    pub sample_rate: u32,
    pub wet_db: Sample,
    pub dry_db: Sample,
    pub width: Sample,
    pub lr_balance: Sample,
    /// Low-pass cutoff in Hz, `0` disables it.
    pub lpf_hz: Sample,
    /// High-pass cutoff in Hz, `0` disables it.
    pub hpf_hz: Sample,
    /// Positive values delay the wet path, negative values the dry path.
    pub initial_delay: i64,
    /// Wait for late background bursts instead of dropping them.
    pub offline: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: ConvolverKind::default(),
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            factor: DEFAULT_FACTOR,
            sample_rate: 48_000,
            wet_db: 0.0,
            dry_db: 0.0,
            width: 1.0,
            lr_balance: 0.0,
            lpf_hz: 0.0,
            hpf_hz: 0.0,
            initial_delay: 0,
            offline: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        debug!(path = %path.display(), ?config, "loaded engine config");
        Ok(config)
    }

    /// Builds an unloaded compositor with every mixer parameter applied.
    pub fn build(&self) -> Result<Compositor> {
        let convolver = self.model.build(self.fragment_size, self.factor)?;
        let mut compositor = Compositor::new(convolver, self.sample_rate as Sample)?;
        compositor.set_wet(self.wet_db);
        compositor.set_dry(self.dry_db);
        compositor.set_width(self.width);
        compositor.set_lr_balance(self.lr_balance);
        compositor.set_lpf(self.lpf_hz);
        compositor.set_hpf(self.hpf_hz);
        compositor.set_initial_delay(self.initial_delay)?;
        compositor.set_offline(self.offline);
        Ok(compositor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "model": "zero-latency", "wet_db": -3.0 }"#)
            .unwrap();
        assert_eq!(config.model, ConvolverKind::ZeroLatency);
        assert_eq!(config.wet_db, -3.0);
        assert_eq!(config.fragment_size, 1024);
        assert_eq!(config.factor, 16);
        assert_eq!(config.sample_rate, 48_000);
        assert!(!config.offline);
    }

    #[test]
    fn parses_every_model_name() {
        let config = EngineConfig::from_json_str(r#"{ "model": "single-block" }"#).unwrap();
        assert_eq!(config.model, ConvolverKind::SingleBlock);
        let config = EngineConfig::from_json_str(r#"{ "model": "direct" }"#).unwrap();
        assert_eq!(config.model, ConvolverKind::Direct);
    }

    #[test]
    fn rejects_unknown_models() {
        let err = EngineConfig::from_json_str(r#"{ "model": "overlap-save" }"#).unwrap_err();
        assert!(matches!(err, crate::ImpulserError::Config(_)));
    }

    #[test]
    fn builds_a_configured_compositor() {
        let config = EngineConfig {
            model: ConvolverKind::SingleTier,
            fragment_size: 100,
            lr_balance: -2.0,
            initial_delay: -10,
            hpf_hz: 20.0,
            ..EngineConfig::default()
        };
        let compositor = config.build().unwrap();
        assert_eq!(compositor.fragment_size(), 128);
        assert_eq!(compositor.latency(), 128);
        assert_eq!(compositor.lr_balance(), -1.0);
        assert_eq!(compositor.initial_delay(), -10);
        assert_eq!(compositor.hpf(), 20.0);
    }

    #[test]
    fn reads_from_disk() {
        let path = std::env::temp_dir().join(format!("impulser-config-{}.json", std::process::id()));
        let config = EngineConfig {
            model: ConvolverKind::TwoTierThreaded,
            ..EngineConfig::default()
        };
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = EngineConfig::from_path(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
