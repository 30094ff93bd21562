//! Configuration surface: camera calibration, sensor modality, and the
//! tracking thresholds derived from them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Sensor modality of the input stream.
///
/// The modality selects behavior at four points only: map initialization,
/// last-frame stereo augmentation, keyframe stereo augmentation, and the
/// projection search radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensor {
    Monocular,
    Stereo,
    Rgbd,
}

impl Sensor {
    pub fn is_monocular(&self) -> bool {
        matches!(self, Sensor::Monocular)
    }

    /// True for the modalities that carry per-keypoint depth.
    pub fn has_depth(&self) -> bool {
        !self.is_monocular()
    }
}

/// Channel order of incoming color images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOrder {
    Bgr,
    Rgb,
}

/// Camera calibration block (`Camera.*` keys).
#[derive(Debug, Clone, Deserialize)]
pub struct CameraSettings {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    /// Optional third radial coefficient.
    #[serde(default)]
    pub k3: f64,
    /// Stereo baseline times fx, in pixel units.
    #[serde(default)]
    pub bf: f64,
    /// Target frame rate; used as the keyframe-insertion `max_frames`.
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// 0 = BGR, 1 = RGB.
    #[serde(default, rename = "RGB")]
    pub rgb: u8,
}

fn default_fps() -> f64 {
    30.0
}

/// ORB extractor block (`ORBextractor.*` keys). The extractor itself is a
/// collaborator; these values parameterize it and the scale pyramid the
/// tracker shares with it.
#[derive(Debug, Clone, Deserialize)]
pub struct OrbSettings {
    #[serde(rename = "nFeatures")]
    pub n_features: u32,
    #[serde(rename = "scaleFactor")]
    pub scale_factor: f64,
    #[serde(rename = "nLevels")]
    pub n_levels: u32,
    #[serde(rename = "iniThFAST")]
    pub ini_th_fast: u32,
    #[serde(rename = "minThFAST")]
    pub min_th_fast: u32,
}

impl Default for OrbSettings {
    fn default() -> Self {
        Self {
            n_features: 1000,
            scale_factor: 1.2,
            n_levels: 8,
            ini_th_fast: 20,
            min_th_fast: 7,
        }
    }
}

/// Full configuration for one run.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub sensor: Sensor,
    #[serde(rename = "Camera")]
    pub camera: CameraSettings,
    #[serde(rename = "ORBextractor", default)]
    pub orb: OrbSettings,
    /// Multiplier on the baseline; close-point cutoff = bf/fx * ThDepth.
    #[serde(rename = "ThDepth", default = "default_th_depth")]
    pub th_depth_factor: f64,
    /// Depth-map to meters scale (RGB-D). 0 or missing means 1.
    #[serde(rename = "DepthMapFactor", default)]
    pub depth_map_factor: f64,
    /// Localization-only mode: no keyframe insertion, map stays frozen.
    #[serde(default)]
    pub localization_only: bool,
}

fn default_th_depth() -> f64 {
    35.0
}

impl Settings {
    /// Load and validate settings from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())
            .with_context(|| format!("failed to open settings file {:?}", path.as_ref()))?;
        let settings: Settings =
            serde_yaml::from_reader(file).context("failed to parse settings YAML")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let settings: Settings =
            serde_yaml::from_str(text).context("failed to parse settings YAML")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.camera.fx <= 0.0 || self.camera.fy <= 0.0 {
            bail!("invalid focal length: fx={}, fy={}", self.camera.fx, self.camera.fy);
        }
        if self.camera.fps <= 0.0 {
            bail!("invalid frame rate: {}", self.camera.fps);
        }
        if self.sensor.has_depth() && self.camera.bf <= 0.0 {
            bail!("stereo/RGB-D requires Camera.bf > 0, got {}", self.camera.bf);
        }
        if self.orb.scale_factor <= 1.0 {
            bail!("ORB scale factor must be > 1, got {}", self.orb.scale_factor);
        }
        if self.orb.n_levels == 0 {
            bail!("ORB pyramid needs at least one level");
        }
        Ok(())
    }

    pub fn color_order(&self) -> ColorOrder {
        if self.camera.rgb != 0 {
            ColorOrder::Rgb
        } else {
            ColorOrder::Bgr
        }
    }

    /// Close-point depth cutoff in meters.
    pub fn th_depth(&self) -> f64 {
        self.camera.bf / self.camera.fx * self.th_depth_factor
    }

    /// Depth-map scale with the 0-means-1 convention.
    pub fn depth_scale(&self) -> f64 {
        if self.depth_map_factor.abs() < 1e-9 {
            1.0
        } else {
            1.0 / self.depth_map_factor
        }
    }

    /// Keyframe-insertion window: at most this many frames between keyframes.
    pub fn max_frames(&self) -> u64 {
        self.camera.fps as u64
    }

    pub fn min_frames(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
sensor: rgbd
Camera:
  fx: 517.306408
  fy: 516.469215
  cx: 318.643040
  cy: 255.313989
  k1: 0.262383
  k2: -0.953104
  p1: -0.005358
  p2: 0.002628
  k3: 1.163314
  bf: 40.0
  fps: 30.0
  RGB: 1
ORBextractor:
  nFeatures: 1000
  scaleFactor: 1.2
  nLevels: 8
  iniThFAST: 20
  minThFAST: 7
ThDepth: 40.0
DepthMapFactor: 5000.0
"#;

    #[test]
    fn parse_full_settings() {
        let s = Settings::from_yaml_str(YAML).unwrap();
        assert_eq!(s.sensor, Sensor::Rgbd);
        assert_eq!(s.camera.rgb, 1);
        assert_eq!(s.color_order(), ColorOrder::Rgb);
        assert_eq!(s.orb.n_features, 1000);
        assert_eq!(s.max_frames(), 30);
        assert!((s.th_depth() - 40.0 / 517.306408 * 40.0).abs() < 1e-9);
        assert!((s.depth_scale() - 1.0 / 5000.0).abs() < 1e-12);
    }

    #[test]
    fn depth_factor_zero_means_unit_scale() {
        let mut s = Settings::from_yaml_str(YAML).unwrap();
        s.depth_map_factor = 0.0;
        assert_eq!(s.depth_scale(), 1.0);
    }

    #[test]
    fn missing_k3_defaults_to_zero() {
        let yaml = r#"
sensor: monocular
Camera:
  fx: 500.0
  fy: 500.0
  cx: 320.0
  cy: 240.0
"#;
        let s = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(s.camera.k3, 0.0);
        assert_eq!(s.camera.fps, 30.0);
        assert_eq!(s.color_order(), ColorOrder::Bgr);
    }

    #[test]
    fn rejects_bad_calibration() {
        let yaml = r#"
sensor: monocular
Camera:
  fx: -1.0
  fy: 500.0
  cx: 320.0
  cy: 240.0
"#;
        assert!(Settings::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn stereo_requires_baseline() {
        let yaml = r#"
sensor: stereo
Camera:
  fx: 500.0
  fy: 500.0
  cx: 320.0
  cy: 240.0
"#;
        assert!(Settings::from_yaml_str(yaml).is_err());
    }
}
