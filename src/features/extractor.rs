use std::fmt;
use std::str::FromStr;

use image::GrayImage;
use log::trace;

use crate::algorithms::{akaze::Akaze, brief::Brief, brisk::Brisk, freak::Freak, orb::Orb, sift::Sift};
use crate::error::{Error, Result};
use crate::features::descriptor::{DescriptorCategory, Descriptors};
use crate::features::keypoint::KeyPoint;

/// Descriptor extractors selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Brisk,
    Brief,
    Orb,
    Freak,
    Akaze,
    Sift,
}

impl DescriptorType {
    pub const ALL: [DescriptorType; 6] = [
        Self::Brisk,
        Self::Brief,
        Self::Orb,
        Self::Freak,
        Self::Akaze,
        Self::Sift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brisk => "BRISK",
            Self::Brief => "BRIEF",
            Self::Orb => "ORB",
            Self::Freak => "FREAK",
            Self::Akaze => "AKAZE",
            Self::Sift => "SIFT",
        }
    }

    /// Gradient histograms for SIFT, bit strings for everything else
    pub fn category(&self) -> DescriptorCategory {
        match self {
            Self::Sift => DescriptorCategory::Hog,
            _ => DescriptorCategory::Binary,
        }
    }

    /// Describes `keypoints` in `image`.
    ///
    /// Keypoints the sampling pattern cannot cover are removed, so row `i` of the
    /// result always belongs to `keypoints[i]`.
    pub fn compute(&self, image: &GrayImage, keypoints: &mut Vec<KeyPoint>) -> Result<Descriptors> {
        let before = keypoints.len();
        let descriptors = match self {
            Self::Brisk => Descriptors::Binary(Brisk::default().compute(image, keypoints)),
            Self::Brief => Descriptors::Binary(Brief::default().compute(image, keypoints)),
            Self::Orb => Descriptors::Binary(Orb::default().compute(image, keypoints)),
            Self::Freak => Descriptors::Binary(Freak::default().compute(image, keypoints)),
            Self::Akaze => Descriptors::Binary(Akaze::default().compute(image, keypoints)?),
            Self::Sift => Descriptors::Float(Sift::default().compute(image, keypoints)),
        };
        trace!(
            "{} kept {} of {} keypoints",
            self.as_str(),
            keypoints.len(),
            before
        );
        debug_assert_eq!(descriptors.len(), keypoints.len());
        Ok(descriptors)
    }
}

impl FromStr for DescriptorType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|descriptor| descriptor.as_str() == s)
            .ok_or_else(|| Error::UnknownDescriptor(s.to_string()))
    }
}

impl fmt::Display for DescriptorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn parses_exactly_the_documented_names() {
        for descriptor in DescriptorType::ALL {
            assert_eq!(descriptor.as_str().parse::<DescriptorType>().unwrap(), descriptor);
        }
        assert!(matches!(
            "SURF".parse::<DescriptorType>(),
            Err(Error::UnknownDescriptor(_))
        ));
    }

    #[test]
    fn only_sift_is_hog() {
        for descriptor in DescriptorType::ALL {
            let expected = if descriptor == DescriptorType::Sift {
                DescriptorCategory::Hog
            } else {
                DescriptorCategory::Binary
            };
            assert_eq!(descriptor.category(), expected);
        }
    }

    #[test]
    fn rows_stay_aligned_with_keypoints() {
        let image = GrayImage::from_fn(160, 120, |x, y| Luma([((x * 7 + y * 11) % 251) as u8]));
        for descriptor in [
            DescriptorType::Brisk,
            DescriptorType::Brief,
            DescriptorType::Orb,
            DescriptorType::Freak,
            DescriptorType::Sift,
        ] {
            let mut keypoints = vec![
                KeyPoint::new(2.0, 2.0, 7.0),
                KeyPoint::new(80.0, 60.0, 7.0),
                KeyPoint::new(159.0, 119.0, 7.0),
            ];
            let descriptors = descriptor.compute(&image, &mut keypoints).unwrap();
            assert_eq!(descriptors.len(), keypoints.len(), "{descriptor}");
            assert_eq!(descriptors.category(), descriptor.category());
            assert!(!keypoints.is_empty(), "{descriptor}");
        }
    }

    #[test]
    fn akaze_rejects_foreign_keypoints() {
        let image = GrayImage::from_pixel(64, 64, Luma([100]));
        let mut keypoints = vec![KeyPoint::new(32.0, 32.0, 7.0)];
        assert!(matches!(
            DescriptorType::Akaze.compute(&image, &mut keypoints),
            Err(Error::IncompatibleKeypoints { .. })
        ));
    }
}
