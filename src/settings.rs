use crate::vr::device::DEFAULT_HMD_CAPS;
use crate::vr::{HmdCaps, LayerFlags, VrError, VrResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(#[from] VrError),
}

/// Rejects zero, negative and NaN values for `setting`.
pub fn check_positive(setting: &'static str, value: f32) -> VrResult<f32> {
    if value > 0.0 {
        Ok(value)
    } else {
        Err(VrError::NonPositive { setting, value })
    }
}

/// User-tunable headset configuration. Missing JSON fields take their
/// default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadsetSettings {
    pub head_scale: f32,
    pub screen_percentage: f32,
    pub mirror_percentage: f32,
    pub mirrored: bool,
    pub monoscopic: bool,
    pub positional_tracking: bool,
    pub low_persistence: bool,
    pub dynamic_prediction: bool,
    pub high_quality_layer: bool,
}

impl Default for HeadsetSettings {
    fn default() -> Self {
        Self {
            head_scale: 1.0,
            screen_percentage: 1.0,
            mirror_percentage: 0.5,
            mirrored: true,
            monoscopic: false,
            positional_tracking: true,
            low_persistence: DEFAULT_HMD_CAPS.contains(HmdCaps::LOW_PERSISTENCE),
            dynamic_prediction: DEFAULT_HMD_CAPS.contains(HmdCaps::DYNAMIC_PREDICTION),
            high_quality_layer: true,
        }
    }
}

impl HeadsetSettings {
    pub fn validate(&self) -> VrResult<()> {
        check_positive("head scale", self.head_scale)?;
        check_positive("screen percentage", self.screen_percentage)?;
        check_positive("mirror percentage", self.mirror_percentage)?;
        Ok(())
    }

    /// Display capabilities these settings ask the runtime for.
    pub fn hmd_caps(&self) -> HmdCaps {
        let mut caps = HmdCaps::empty();
        caps.set(HmdCaps::LOW_PERSISTENCE, self.low_persistence);
        caps.set(HmdCaps::DYNAMIC_PREDICTION, self.dynamic_prediction);
        caps.set(HmdCaps::NO_MIRROR_TO_WINDOW, !self.mirrored);
        caps
    }

    pub fn layer_flags(&self) -> LayerFlags {
        if self.high_quality_layer {
            LayerFlags::HIGH_QUALITY
        } else {
            LayerFlags::empty()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json_string(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let settings = Self::from_json_str(&json)?;
        log::info!("[headset] loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        self.validate()?;
        let path = path.as_ref();
        fs::write(path, self.to_json_string()?)?;
        log::info!("[headset] saved settings to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = HeadsetSettings::default();
        settings.validate().expect("defaults validate");
        assert_eq!(settings.hmd_caps(), DEFAULT_HMD_CAPS);
        assert_eq!(settings.layer_flags(), LayerFlags::HIGH_QUALITY);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = HeadsetSettings::from_json_str(r#"{ "screen_percentage": 1.25, "mirrored": false }"#)
            .expect("partial settings parse");

        assert_eq!(settings.screen_percentage, 1.25);
        assert!(!settings.mirrored);
        assert_eq!(settings.head_scale, 1.0);
        assert!(settings.hmd_caps().contains(HmdCaps::NO_MIRROR_TO_WINDOW));
    }

    #[test]
    fn non_positive_values_are_rejected() {
        let err = HeadsetSettings::from_json_str(r#"{ "head_scale": 0.0 }"#).unwrap_err();
        match err {
            SettingsError::Invalid(VrError::NonPositive { setting, value }) => {
                assert_eq!(setting, "head scale");
                assert_eq!(value, 0.0);
            }
            other => panic!("unexpected settings error: {other}"),
        }

        assert!(check_positive("mirror percentage", -0.5).is_err());
        assert!(check_positive("mirror percentage", f32::NAN).is_err());
    }

    #[test]
    fn settings_persist_through_file() {
        let tmp_dir = tempfile::tempdir().expect("tmpdir");
        let path = tmp_dir.path().join("headset.json");
        let settings = HeadsetSettings {
            head_scale: 2.0,
            monoscopic: true,
            ..HeadsetSettings::default()
        };

        settings.save(&path).expect("save settings");
        let loaded = HeadsetSettings::load(&path).expect("load settings");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn missing_file_is_io_error() {
        let tmp_dir = tempfile::tempdir().expect("tmpdir");
        let err = HeadsetSettings::load(tmp_dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
    }
}
