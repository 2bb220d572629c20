use std::fmt;
use std::str::FromStr;

use image::GrayImage;

use crate::algorithms::{
    akaze::Akaze,
    brisk::Brisk,
    corners::{Fast, Harris, ShiTomasi},
    orb::Orb,
    sift::Sift,
};
use crate::error::Error;
use crate::features::keypoint::KeyPoint;

/// Keypoint detectors selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorType {
    ShiTomasi,
    Harris,
    Fast,
    Brisk,
    Orb,
    Akaze,
    Sift,
}

impl DetectorType {
    pub const ALL: [DetectorType; 7] = [
        Self::ShiTomasi,
        Self::Harris,
        Self::Fast,
        Self::Brisk,
        Self::Orb,
        Self::Akaze,
        Self::Sift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShiTomasi => "SHITOMASI",
            Self::Harris => "HARRIS",
            Self::Fast => "FAST",
            Self::Brisk => "BRISK",
            Self::Orb => "ORB",
            Self::Akaze => "AKAZE",
            Self::Sift => "SIFT",
        }
    }

    /// Runs the detector with its default parameters
    pub fn detect(&self, image: &GrayImage) -> Vec<KeyPoint> {
        match self {
            Self::ShiTomasi => ShiTomasi::default().detect(image),
            Self::Harris => Harris::default().detect(image),
            Self::Fast => Fast::default().detect(image),
            Self::Brisk => Brisk::default().detect(image),
            Self::Orb => Orb::default().detect(image),
            Self::Akaze => Akaze::default().detect(image),
            Self::Sift => Sift::default().detect(image),
        }
    }

    /// Whether the keypoints come out sorted by decreasing quality
    pub fn is_sorted_by_quality(&self) -> bool {
        matches!(self, Self::ShiTomasi)
    }
}

impl FromStr for DetectorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|detector| detector.as_str() == s)
            .ok_or_else(|| Error::UnknownDetector(s.to_string()))
    }
}

impl fmt::Display for DetectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exactly_the_documented_names() {
        for detector in DetectorType::ALL {
            assert_eq!(detector.as_str().parse::<DetectorType>().unwrap(), detector);
        }
        assert!(matches!(
            "harris".parse::<DetectorType>(),
            Err(Error::UnknownDetector(name)) if name == "harris"
        ));
        assert!("SURF".parse::<DetectorType>().is_err());
    }

    #[test]
    fn unknown_detector_message() {
        let err = "SURF".parse::<DetectorType>().unwrap_err();
        assert_eq!(err.to_string(), "Detector SURF not known to this program.");
    }
}
