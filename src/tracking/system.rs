use std::io::Write;

use log::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::tracking::report::FrameReport;
use crate::tracking::tracker::{load_frame, Pipeline, Tracker};
use crate::tracking::visualize;

/// `true`, `True` and `TRUE` turn visualization on, anything else turns it off
pub fn parse_visualize(value: &str) -> bool {
    matches!(value, "true" | "True" | "TRUE")
}

/// Runs one pipeline over the configured image sequence
pub struct System {
    pub pipeline: Pipeline,
    pub config: Config,
    pub visualize: bool,
}

impl System {
    pub fn new(pipeline: Pipeline, config: Config, visualize: bool) -> Self {
        Self {
            pipeline,
            config,
            visualize,
        }
    }

    /// Prints the chosen algorithms followed by one report line per frame
    pub fn run<W: Write>(&self, out: &mut W) -> Result<Vec<FrameReport>> {
        let Pipeline {
            detector,
            descriptor,
            matcher,
            selector,
        } = self.pipeline;
        writeln!(out, "Using detector: {detector}")?;
        writeln!(out, "Using descriptor: {descriptor}")?;
        writeln!(out, "Using matcher: {matcher}")?;
        writeln!(out, "Using selector: {selector}")?;
        writeln!(out, "Using descriptor type: {}", descriptor.category())?;

        let reports = self.track(|index, tracker, report| {
            writeln!(out, "{report}")?;
            if self.visualize {
                save_matches(&self.config, index, tracker)?;
            }
            Ok(())
        })?;
        info!("processed {} frames", reports.len());
        Ok(reports)
    }

    /// Feeds every image of the sequence through a fresh tracker, calling
    /// `on_frame` with the image index after each one.
    pub fn track<F>(&self, mut on_frame: F) -> Result<Vec<FrameReport>>
    where
        F: FnMut(usize, &Tracker, &FrameReport) -> Result<()>,
    {
        let mut tracker = Tracker::new(self.pipeline, &self.config)?;
        let mut reports = Vec::new();
        for index in self.config.images.indices() {
            let path = self.config.images.path(index);
            debug!("loading {}", path.display());
            let report = tracker.process(load_frame(&path)?)?;
            on_frame(index, &tracker, &report)?;
            reports.push(report);
        }
        Ok(reports)
    }
}

fn save_matches(config: &Config, index: usize, tracker: &Tracker) -> Result<()> {
    let buffer = tracker.buffer();
    if let (Some(previous), Some(current)) = (buffer.previous(), buffer.newest()) {
        let path = visualize::match_image_path(&config.output_dir, index);
        visualize::save(&visualize::draw_matches(previous, current), &path)?;
        debug!("wrote {}", path.display());
    }
    Ok(())
}
