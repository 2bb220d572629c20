use std::fmt;
use std::io::Write;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result as CrateResult};
use crate::features::{DescriptorType, DetectorType};
use crate::matching::MatcherType;

/// Columns of the per-frame CSV written by the sweep
pub const CSV_HEADER: [&str; 8] = [
    "Detector",
    "Descriptor",
    "Image",
    "Total Keypoints",
    "Keypoints on vehicle",
    "Detector Time",
    "Descriptor Time",
    "Matches",
];

/// Counts and timings of one processed frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub detector: DetectorType,
    pub descriptor: DescriptorType,
    pub matcher: MatcherType,
    /// Keypoints found in the whole image
    pub total: usize,
    /// Keypoints inside the region of interest
    pub vehicle: usize,
    pub matches: usize,
    pub detector_ms: f64,
    pub descriptor_ms: f64,
}

/// A report in [`CSV_HEADER`] column order
#[derive(Debug, Serialize)]
pub struct CsvRow {
    pub detector: &'static str,
    pub descriptor: &'static str,
    /// Position of the frame within its combination
    pub image: usize,
    pub total: usize,
    pub vehicle: usize,
    pub detector_ms: f64,
    pub descriptor_ms: f64,
    pub matches: usize,
}

impl FrameReport {
    pub fn csv_row(&self, image: usize) -> CsvRow {
        CsvRow {
            detector: self.detector.as_str(),
            descriptor: self.descriptor.as_str(),
            image,
            total: self.total,
            vehicle: self.vehicle,
            detector_ms: self.detector_ms,
            descriptor_ms: self.descriptor_ms,
            matches: self.matches,
        }
    }
}

/// CSV writer over `out` with the header row already written.
///
/// Rows end in CRLF and may differ in length, since combinations are
/// separated by a row holding one empty field.
pub fn csv_writer<W: Write>(out: W) -> CrateResult<csv::Writer<W>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .terminator(csv::Terminator::CRLF)
        .from_writer(out);
    writer.write_record(CSV_HEADER)?;
    Ok(writer)
}

impl fmt::Display for FrameReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Detector:{}|Descriptor:{}|Matcher:{}|Total:{}|Vehicle:{}|Matches:{}|Time Detector[ms]:{}|Time Descriptor[ms]:{}",
            self.detector,
            self.descriptor,
            self.matcher,
            self.total,
            self.vehicle,
            self.matches,
            self.detector_ms,
            self.descriptor_ms
        )
    }
}

fn field<'a>(parts: &mut impl Iterator<Item = &'a str>, key: &str) -> Result<&'a str, Error> {
    let part = parts
        .next()
        .ok_or_else(|| Error::Report(format!("missing `{key}`")))?;
    part.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| Error::Report(format!("expected `{key}:`, found `{part}`")))
}

fn number<T: FromStr>(value: &str, key: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::Report(format!("`{key}` is not a number: `{value}`")))
}

impl FromStr for FrameReport {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.trim().split('|');
        let report = Self {
            detector: field(&mut parts, "Detector")?.parse()?,
            descriptor: field(&mut parts, "Descriptor")?.parse()?,
            matcher: field(&mut parts, "Matcher")?.parse()?,
            total: number(field(&mut parts, "Total")?, "Total")?,
            vehicle: number(field(&mut parts, "Vehicle")?, "Vehicle")?,
            matches: number(field(&mut parts, "Matches")?, "Matches")?,
            detector_ms: number(field(&mut parts, "Time Detector[ms]")?, "Time Detector[ms]")?,
            descriptor_ms: number(field(&mut parts, "Time Descriptor[ms]")?, "Time Descriptor[ms]")?,
        };
        if let Some(extra) = parts.next() {
            return Err(Error::Report(format!("unexpected field `{extra}`")));
        }
        Ok(report)
    }
}
