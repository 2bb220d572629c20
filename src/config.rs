use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::features::keypoint::Roi;
use crate::matching::MatchOptions;

const DEFAULT_BASE_PATH: &str = "../images/";
const DEFAULT_PREFIX: &str = "KITTI/2011_09_26/image_00/data/000000";
const DEFAULT_FILE_TYPE: &str = ".png";
const DEFAULT_START_INDEX: usize = 0;
const DEFAULT_END_INDEX: usize = 9;
const DEFAULT_FILL_WIDTH: usize = 4;
const DEFAULT_BUFFER_SIZE: usize = 2;
const DEFAULT_ROI: Roi = Roi {
    x: 535,
    y: 180,
    width: 180,
    height: 150,
};
const DEFAULT_RATIO: f32 = 0.8;
const DEFAULT_OUTPUT_DIR: &str = "matches";

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "FEATRACK_CONFIG";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    images: Option<ImagesFile>,
    buffer: Option<BufferFile>,
    roi: Option<RoiFile>,
    keypoints: Option<KeypointsFile>,
    matching: Option<MatchingFile>,
    visualization: Option<VisualizationFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ImagesFile {
    base_path: Option<String>,
    prefix: Option<String>,
    file_type: Option<String>,
    start_index: Option<usize>,
    end_index: Option<usize>,
    fill_width: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BufferFile {
    size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RoiFile {
    enabled: Option<bool>,
    x: Option<i32>,
    y: Option<i32>,
    width: Option<i32>,
    height: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct KeypointsFile {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MatchingFile {
    ratio: Option<f32>,
    cross_check: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VisualizationFile {
    output_dir: Option<PathBuf>,
}

/// Location and naming of the input image sequence
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSequence {
    pub base_path: String,
    pub prefix: String,
    pub file_type: String,
    pub start_index: usize,
    pub end_index: usize,
    /// Digits the index is zero padded to
    pub fill_width: usize,
}

impl ImageSequence {
    /// `base_path + prefix + zero padded index + file_type`
    pub fn path(&self, index: usize) -> PathBuf {
        PathBuf::from(format!(
            "{}{}{:0width$}{}",
            self.base_path,
            self.prefix,
            index,
            self.file_type,
            width = self.fill_width
        ))
    }

    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        self.start_index..=self.end_index
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub images: ImageSequence,
    pub buffer_size: usize,
    /// Keypoints outside are discarded, `None` keeps all of them
    pub roi: Option<Roi>,
    /// Keep only this many keypoints per frame
    pub keypoint_limit: Option<usize>,
    pub matching: MatchOptions,
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        // the defaults always validate
        Self::from_file(ConfigFile::default())
    }
}

impl Config {
    /// Reads the file at `path`, or at `$FEATRACK_CONFIG` when no path is given,
    /// then applies environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let file = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file);
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document, without environment overrides
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        let config = Self::from_file(file);
        config.validate()?;
        Ok(config)
    }

    fn from_file(file: ConfigFile) -> Self {
        let images = file.images.unwrap_or_default();
        let roi = file.roi.unwrap_or_default();
        let matching = file.matching.unwrap_or_default();

        Self {
            images: ImageSequence {
                base_path: images.base_path.unwrap_or_else(|| DEFAULT_BASE_PATH.to_string()),
                prefix: images.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
                file_type: images.file_type.unwrap_or_else(|| DEFAULT_FILE_TYPE.to_string()),
                start_index: images.start_index.unwrap_or(DEFAULT_START_INDEX),
                end_index: images.end_index.unwrap_or(DEFAULT_END_INDEX),
                fill_width: images.fill_width.unwrap_or(DEFAULT_FILL_WIDTH),
            },
            buffer_size: file
                .buffer
                .and_then(|buffer| buffer.size)
                .unwrap_or(DEFAULT_BUFFER_SIZE),
            roi: roi.enabled.unwrap_or(true).then(|| Roi {
                x: roi.x.unwrap_or(DEFAULT_ROI.x),
                y: roi.y.unwrap_or(DEFAULT_ROI.y),
                width: roi.width.unwrap_or(DEFAULT_ROI.width),
                height: roi.height.unwrap_or(DEFAULT_ROI.height),
            }),
            keypoint_limit: file.keypoints.and_then(|keypoints| keypoints.limit),
            matching: MatchOptions {
                ratio: matching.ratio.unwrap_or(DEFAULT_RATIO),
                cross_check: matching.cross_check.unwrap_or(true),
            },
            output_dir: file
                .visualization
                .and_then(|visualization| visualization.output_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
        }
    }

    fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("FEATRACK_IMAGE_PATH") {
            if !path.trim().is_empty() {
                self.images.base_path = path;
            }
        }
        if let Some(end) = var("FEATRACK_END_INDEX") {
            self.images.end_index = end.trim().parse().map_err(|_| {
                Error::Config("FEATRACK_END_INDEX must be a non-negative integer".to_string())
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.images.end_index < self.images.start_index {
            return Err(Error::Config(format!(
                "end_index {} is before start_index {}",
                self.images.end_index, self.images.start_index
            )));
        }
        if self.buffer_size < 2 {
            return Err(Error::Config(
                "buffer size must hold at least two frames".to_string(),
            ));
        }
        if !(self.matching.ratio > 0.0 && self.matching.ratio <= 1.0) {
            return Err(Error::Config(format!(
                "matching ratio {} must be in (0, 1]",
                self.matching.ratio
            )));
        }
        if let Some(roi) = self.roi {
            if roi.width <= 0 || roi.height <= 0 {
                return Err(Error::Config(
                    "roi width and height must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid config file {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_follow_the_kitti_setup() {
        let config = Config::default();
        assert_eq!(
            config.images.path(3),
            PathBuf::from("../images/KITTI/2011_09_26/image_00/data/0000000003.png")
        );
        assert_eq!(config.images.indices(), 0..=9);
        assert_eq!(config.buffer_size, 2);
        assert_eq!(config.roi, Some(Roi::new(535, 180, 180, 150)));
        assert_eq!(config.keypoint_limit, None);
        assert_eq!(config.matching, MatchOptions::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [images]
            base_path = "/data/"
            prefix = "seq_"
            fill_width = 2
            end_index = 4

            [roi]
            enabled = false

            [keypoints]
            limit = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.images.path(7), PathBuf::from("/data/seq_07.png"));
        assert_eq!(config.images.indices(), 0..=4);
        assert_eq!(config.roi, None);
        assert_eq!(config.keypoint_limit, Some(50));
        assert_eq!(config.output_dir, PathBuf::from("matches"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for raw in [
            "[images]\nstart_index = 5\nend_index = 2",
            "[buffer]\nsize = 1",
            "[matching]\nratio = 0.0",
            "[matching]\nratio = 1.5",
            "[roi]\nwidth = 0",
            "[unknown]\nkey = 1",
        ] {
            assert!(
                matches!(Config::from_toml_str(raw), Err(Error::Config(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn environment_overrides() {
        let vars = HashMap::from([
            ("FEATRACK_IMAGE_PATH", "/mnt/images/"),
            ("FEATRACK_END_INDEX", "3"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.images.base_path, "/mnt/images/");
        assert_eq!(config.images.end_index, 3);

        let mut config = Config::default();
        let err = config.apply_env(|key| (key == "FEATRACK_END_INDEX").then(|| "ten".to_string()));
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
