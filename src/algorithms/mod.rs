//! Native implementations of the corner detectors, scale space detectors
//! and binary/gradient descriptors behind the named front ends

pub mod akaze;
pub mod brief;
pub mod brisk;
pub mod corners;
pub mod float_image;
pub mod freak;
pub mod orb;
pub(crate) mod sampling;
pub mod sift;
