use image::GrayImage;

use crate::features::{descriptor::Descriptors, keypoint::KeyPoint};
use crate::matching::Match;

/// Everything computed for one camera image
#[derive(Debug, Clone, Default)]
pub struct DataFrame {
    pub image: GrayImage,
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Descriptors,
    /// Matches against the previous frame, `query_idx` indexes the previous frame
    pub matches: Vec<Match>,
}

impl DataFrame {
    pub fn new(image: GrayImage) -> Self {
        Self {
            image,
            ..Default::default()
        }
    }
}
