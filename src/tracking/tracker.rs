use std::path::Path;
use std::time::Instant;

use image::GrayImage;
use log::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::features::keypoint::{retain_best, Roi};
use crate::features::{DescriptorType, DetectorType};
use crate::matching::{match_descriptors, MatchOptions, MatcherType, SelectorType};
use crate::tracking::buffer::DataBuffer;
use crate::tracking::frame::DataFrame;
use crate::tracking::report::FrameReport;

/// Algorithm choice for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipeline {
    pub detector: DetectorType,
    pub descriptor: DescriptorType,
    pub matcher: MatcherType,
    pub selector: SelectorType,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            detector: DetectorType::Harris,
            descriptor: DescriptorType::Brief,
            matcher: MatcherType::BruteForce,
            selector: SelectorType::NearestNeighbour,
        }
    }
}

/// Loads an image from disk as 8 bit grayscale
pub fn load_frame(path: &Path) -> Result<GrayImage> {
    let image = image::open(path).map_err(|source| Error::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image.to_luma8())
}

/// Detects, describes and matches keypoints frame after frame
pub struct Tracker {
    pub pipeline: Pipeline,
    roi: Option<Roi>,
    keypoint_limit: Option<usize>,
    options: MatchOptions,
    buffer: DataBuffer<DataFrame>,
}

impl Tracker {
    pub fn new(pipeline: Pipeline, config: &Config) -> Result<Self> {
        Ok(Self {
            pipeline,
            roi: config.roi,
            keypoint_limit: config.keypoint_limit,
            options: config.matching,
            buffer: DataBuffer::new(config.buffer_size)?,
        })
    }

    pub fn buffer(&self) -> &DataBuffer<DataFrame> {
        &self.buffer
    }

    /// Runs the whole pipeline on the next image of the sequence
    pub fn process(&mut self, image: GrayImage) -> Result<FrameReport> {
        let Pipeline {
            detector,
            descriptor,
            matcher,
            selector,
        } = self.pipeline;
        let mut frame = DataFrame::new(image);

        let start = Instant::now();
        let mut keypoints = detector.detect(&frame.image);
        let detector_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "{} detection with n={} keypoints in {:.3} ms",
            detector,
            keypoints.len(),
            detector_ms
        );

        let total = keypoints.len();
        let vehicle = match self.roi {
            Some(roi) => {
                keypoints = roi.crop(keypoints);
                keypoints.len()
            }
            None => 0,
        };

        if let Some(limit) = self.keypoint_limit {
            // Shi-Tomasi keypoints are already sorted by quality
            if detector.is_sorted_by_quality() {
                keypoints.truncate(limit);
            } else {
                retain_best(&mut keypoints, limit);
            }
            debug!("NOTE: keypoints have been limited to {}", keypoints.len());
        }

        let start = Instant::now();
        frame.descriptors = descriptor.compute(&frame.image, &mut keypoints)?;
        let descriptor_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "{} descriptor extraction in {:.3} ms",
            descriptor, descriptor_ms
        );
        frame.keypoints = keypoints;

        self.buffer.push(frame);

        let mut matches = 0;
        if let Some((previous, current)) = self.buffer.previous_and_newest_mut() {
            current.matches = match_descriptors(
                &previous.descriptors,
                &current.descriptors,
                matcher,
                selector,
                self.options,
            )?;
            matches = current.matches.len();
            debug!("{} {} matching found {} matches", matcher, selector, matches);
        }

        Ok(FrameReport {
            detector,
            descriptor,
            matcher,
            total,
            vehicle,
            matches,
            detector_ms,
            descriptor_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn rectangles(shift: u32) -> GrayImage {
        let boxes = [(40, 40, 20, 20), (90, 50, 22, 18), (60, 72, 14, 16)];
        GrayImage::from_fn(160, 120, |x, y| {
            let inside = boxes.iter().any(|&(bx, by, w, h)| {
                x >= bx + shift && x < bx + shift + w && y >= by && y < by + h
            });
            Luma([if inside { 220 } else { 20 }])
        })
    }

    fn fast_brief() -> Pipeline {
        Pipeline {
            detector: DetectorType::Fast,
            ..Default::default()
        }
    }

    fn config(roi: Option<Roi>, keypoint_limit: Option<usize>) -> Config {
        Config {
            roi,
            keypoint_limit,
            ..Default::default()
        }
    }

    #[test]
    fn first_frame_has_no_matches() {
        let mut tracker = Tracker::new(fast_brief(), &config(None, None)).unwrap();
        let report = tracker.process(rectangles(0)).unwrap();
        assert!(report.total > 0);
        assert_eq!(report.vehicle, 0);
        assert_eq!(report.matches, 0);
        assert_eq!(tracker.buffer().len(), 1);
    }

    #[test]
    fn consecutive_frames_are_matched() {
        let mut tracker = Tracker::new(fast_brief(), &config(None, None)).unwrap();
        tracker.process(rectangles(0)).unwrap();
        let report = tracker.process(rectangles(2)).unwrap();
        assert!(report.matches > 0);

        let current = tracker.buffer().newest().unwrap();
        let previous = tracker.buffer().previous().unwrap();
        assert_eq!(current.matches.len(), report.matches);
        for found in &current.matches {
            assert!(found.query_idx < previous.keypoints.len());
            assert!(found.train_idx < current.keypoints.len());
        }

        tracker.process(rectangles(4)).unwrap();
        assert_eq!(tracker.buffer().len(), 2);
    }

    #[test]
    fn roi_counts_keypoints_on_vehicle() {
        let roi = Roi::new(0, 0, 80, 120);
        let mut tracker = Tracker::new(fast_brief(), &config(Some(roi), None)).unwrap();
        let report = tracker.process(rectangles(0)).unwrap();
        assert!(report.vehicle > 0);
        assert!(report.vehicle < report.total);
        let frame = tracker.buffer().newest().unwrap();
        assert!(frame.keypoints.iter().all(|kp| roi.contains(&kp.point)));
    }

    #[test]
    fn keypoint_limit_caps_descriptors() {
        let mut tracker = Tracker::new(fast_brief(), &config(None, Some(3))).unwrap();
        let report = tracker.process(rectangles(0)).unwrap();
        assert!(report.total > 3);
        let frame = tracker.buffer().newest().unwrap();
        assert_eq!(frame.keypoints.len(), 3);
        assert_eq!(frame.descriptors.len(), 3);
    }

    #[test]
    fn missing_image_is_an_image_error() {
        let err = load_frame(Path::new("does/not/exist.png")).unwrap_err();
        assert!(matches!(err, Error::Image { .. }));
    }
}
