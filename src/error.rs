use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Detector {0} not known to this program.")]
    UnknownDetector(String),

    #[error("Descriptor {0} not known to this program.")]
    UnknownDescriptor(String),

    #[error("Matcher type {0} not known!")]
    UnknownMatcher(String),

    #[error("Selector type {0} not known!")]
    UnknownSelector(String),

    /// The descriptor cannot be computed on keypoints from this detector.
    #[error("{descriptor} descriptor cannot describe these keypoints: {reason}")]
    IncompatibleKeypoints {
        descriptor: &'static str,
        reason: String,
    },

    #[error("descriptors of different categories cannot be matched ({0} vs {1})")]
    DescriptorMismatch(&'static str, &'static str),

    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed report line: {0}")]
    Report(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
