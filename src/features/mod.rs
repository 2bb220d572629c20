//! Keypoints, descriptors and the named detector/descriptor front ends

pub mod descriptor;
pub mod detector;
pub mod extractor;
pub mod keypoint;

pub use descriptor::{DescriptorCategory, Descriptors};
pub use detector::DetectorType;
pub use extractor::DescriptorType;
pub use keypoint::{KeyPoint, Roi};
