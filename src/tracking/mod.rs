//! Frame by frame tracking pipeline and its drivers

pub mod buffer;
pub mod frame;
pub mod report;
pub mod sweep;
pub mod system;
pub mod tracker;
pub mod visualize;

pub use buffer::DataBuffer;
pub use frame::DataFrame;
pub use report::FrameReport;
pub use system::System;
pub use tracker::{Pipeline, Tracker};
