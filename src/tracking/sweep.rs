use std::io::Write;

use log::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::features::{DescriptorType, DetectorType};
use crate::matching::{MatcherType, SelectorType};
use crate::tracking::report::{self, FrameReport};
use crate::tracking::system::System;
use crate::tracking::tracker::Pipeline;

/// Means over all frames of one detector/descriptor combination
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub detector: DetectorType,
    pub descriptor: DescriptorType,
    pub frames: usize,
    pub total: f64,
    pub vehicle: f64,
    pub matches: f64,
    pub detector_ms: f64,
    pub descriptor_ms: f64,
}

impl Summary {
    fn of(detector: DetectorType, descriptor: DescriptorType, reports: &[FrameReport]) -> Self {
        let frames = reports.len();
        let mean = |value: fn(&FrameReport) -> f64| {
            if frames == 0 {
                0.0
            } else {
                reports.iter().map(value).sum::<f64>() / frames as f64
            }
        };
        Self {
            detector,
            descriptor,
            frames,
            total: mean(|r| r.total as f64),
            vehicle: mean(|r| r.vehicle as f64),
            matches: mean(|r| r.matches as f64),
            detector_ms: mean(|r| r.detector_ms),
            descriptor_ms: mean(|r| r.descriptor_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Summary),
    Invalid {
        detector: DetectorType,
        descriptor: DescriptorType,
    },
}

/// AKAZE descriptors need the scale space layers of AKAZE keypoints
pub fn is_compatible(detector: DetectorType, descriptor: DescriptorType) -> bool {
    descriptor != DescriptorType::Akaze || detector == DetectorType::Akaze
}

/// Runs every detector and descriptor combination over the sequence.
///
/// Report lines and `Invalid combination|<det>|<desc>` lines go to `out`. When
/// `csv` is given, every frame of a completed combination becomes a row, and
/// each combination is followed by a row holding one empty field.
pub fn sweep<W: Write>(
    config: &Config,
    matcher: MatcherType,
    selector: SelectorType,
    out: &mut W,
    csv: Option<&mut dyn Write>,
) -> Result<Vec<Outcome>> {
    let mut csv = csv.map(report::csv_writer).transpose()?;

    let mut outcomes = Vec::new();
    for detector in DetectorType::ALL {
        for descriptor in DescriptorType::ALL {
            let system = System::new(
                Pipeline {
                    detector,
                    descriptor,
                    matcher,
                    selector,
                },
                config.clone(),
                false,
            );

            let reports = if is_compatible(detector, descriptor) {
                system.track(|_, _, _| Ok(()))
            } else {
                Err(Error::IncompatibleKeypoints {
                    descriptor: descriptor.as_str(),
                    reason: format!("{detector} keypoints carry no AKAZE scale level"),
                })
            };

            let reports = match reports {
                Ok(reports) => reports,
                Err(e) => {
                    warn!("skipping {detector} + {descriptor}: {e}");
                    writeln!(out, "Invalid combination|{detector}|{descriptor}")?;
                    outcomes.push(Outcome::Invalid {
                        detector,
                        descriptor,
                    });
                    continue;
                }
            };

            for report in &reports {
                writeln!(out, "{report}")?;
            }
            if let Some(csv) = csv.as_mut() {
                for (image, report) in reports.iter().enumerate() {
                    csv.serialize(report.csv_row(image))?;
                }
                csv.write_record([""])?;
            }

            let summary = Summary::of(detector, descriptor, &reports);
            info!(
                "{}+{}: total {:.1}, vehicle {:.1}, matches {:.1}, detector {:.3} ms, descriptor {:.3} ms",
                detector,
                descriptor,
                summary.total,
                summary.vehicle,
                summary.matches,
                summary.detector_ms,
                summary.descriptor_ms
            );
            outcomes.push(Outcome::Completed(summary));
        }
    }
    if let Some(csv) = csv.as_mut() {
        csv.flush()?;
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(total: usize, matches: usize, detector_ms: f64) -> FrameReport {
        FrameReport {
            detector: DetectorType::Fast,
            descriptor: DescriptorType::Orb,
            matcher: MatcherType::BruteForce,
            total,
            vehicle: total / 2,
            matches,
            detector_ms,
            descriptor_ms: 1.0,
        }
    }

    #[test]
    fn akaze_descriptor_needs_akaze_keypoints() {
        for detector in DetectorType::ALL {
            for descriptor in DescriptorType::ALL {
                let expected =
                    descriptor != DescriptorType::Akaze || detector == DetectorType::Akaze;
                assert_eq!(is_compatible(detector, descriptor), expected);
            }
        }
    }

    #[test]
    fn summary_averages_frames() {
        let reports = [report(100, 0, 2.0), report(200, 40, 4.0)];
        let summary = Summary::of(DetectorType::Fast, DescriptorType::Orb, &reports);
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.total, 150.0);
        assert_eq!(summary.vehicle, 75.0);
        assert_eq!(summary.matches, 20.0);
        assert_eq!(summary.detector_ms, 3.0);
        assert_eq!(summary.descriptor_ms, 1.0);

        let empty = Summary::of(DetectorType::Fast, DescriptorType::Orb, &[]);
        assert_eq!(empty.total, 0.0);
    }
}
