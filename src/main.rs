use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use featrack::config::Config;
use featrack::features::{DescriptorType, DetectorType};
use featrack::matching::{MatcherType, SelectorType};
use featrack::tracking::system::parse_visualize;
use featrack::tracking::{sweep, Pipeline, System};

#[derive(Parser, Debug)]
#[command(name = "featrack", about = "2D feature tracking over an image sequence")]
struct Args {
    /// Write side-by-side match images (`true`, `True` or `TRUE`)
    #[arg(default_value = "true")]
    visualize: String,

    /// SHITOMASI, HARRIS, FAST, BRISK, ORB, AKAZE or SIFT
    #[arg(default_value = "HARRIS")]
    detector: DetectorType,

    /// BRISK, BRIEF, ORB, FREAK, AKAZE or SIFT
    #[arg(default_value = "BRIEF")]
    descriptor: DescriptorType,

    /// MAT_BF or MAT_FLANN
    #[arg(default_value = "MAT_BF")]
    matcher: MatcherType,

    /// SEL_NN or SEL_KNN
    #[arg(default_value = "SEL_NN")]
    selector: SelectorType,

    /// TOML configuration, defaults to $FEATRACK_CONFIG
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run every detector and descriptor combination
    #[arg(long)]
    sweep: bool,

    /// CSV file for the per-frame sweep results
    #[arg(long, requires = "sweep")]
    csv: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.sweep {
        let mut csv = match &args.csv {
            Some(path) => Some(BufWriter::new(
                File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
            )),
            None => None,
        };
        let outcomes = sweep::sweep(
            &config,
            args.matcher,
            args.selector,
            &mut out,
            csv.as_mut().map(|writer| writer as &mut dyn Write),
        )?;
        if let Some(writer) = csv.as_mut() {
            writer.flush()?;
        }
        info!("sweep finished with {} combinations", outcomes.len());
        return Ok(());
    }

    let pipeline = Pipeline {
        detector: args.detector,
        descriptor: args.descriptor,
        matcher: args.matcher,
        selector: args.selector,
    };
    System::new(pipeline, config, parse_visualize(&args.visualize)).run(&mut out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn names_are_validated_while_parsing() {
        let err = Args::try_parse_from(["featrack", "true", "SURF"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
        assert!(err.to_string().contains("Detector SURF not known to this program."));

        let err = Args::try_parse_from(["featrack", "true", "FAST", "BRIEF", "MAT_KD"]).unwrap_err();
        assert!(err.to_string().contains("Matcher type MAT_KD not known!"));
    }

    #[test]
    fn positionals_default_to_harris_brief() {
        let args = Args::try_parse_from(["featrack"]).unwrap();
        assert_eq!(args.visualize, "true");
        assert_eq!(args.detector, DetectorType::Harris);
        assert_eq!(args.descriptor, DescriptorType::Brief);
        assert_eq!(args.matcher, MatcherType::BruteForce);
        assert_eq!(args.selector, SelectorType::NearestNeighbour);

        let args =
            Args::try_parse_from(["featrack", "false", "SIFT", "SIFT", "MAT_FLANN", "SEL_KNN"]).unwrap();
        assert_eq!(args.detector, DetectorType::Sift);
        assert_eq!(args.selector, SelectorType::KNearest);
    }

    #[test]
    fn csv_output_needs_sweep() {
        assert!(Args::try_parse_from(["featrack", "--csv", "out.csv"]).is_err());
        let args = Args::try_parse_from(["featrack", "--sweep", "--csv", "out.csv"]).unwrap();
        assert!(args.sweep);
        assert_eq!(args.csv, Some(PathBuf::from("out.csv")));
    }
}
