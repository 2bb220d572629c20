use std::path::Path;

use featrack::config::Config;
use featrack::features::{DescriptorType, DetectorType};
use featrack::matching::{MatcherType, SelectorType};
use featrack::tracking::report::{FrameReport, CSV_HEADER};
use featrack::tracking::sweep::{self, Outcome};
use featrack::tracking::{Pipeline, System};
use featrack::Error;
use image::{GrayImage, Luma};
use tempfile::TempDir;

const FRAMES: usize = 3;

/// Bright boxes drifting right on a dark background
fn frame(shift: u32) -> GrayImage {
    let boxes = [(34, 30, 20, 18), (70, 36, 16, 22), (50, 58, 12, 12)];
    GrayImage::from_fn(128, 96, |x, y| {
        let inside = boxes
            .iter()
            .any(|&(bx, by, w, h)| x >= bx + shift && x < bx + shift + w && y >= by && y < by + h);
        Luma([if inside { 230 } else { 25 }])
    })
}

fn write_sequence(dir: &Path) {
    for index in 0..FRAMES {
        frame(index as u32)
            .save(dir.join(format!("img_{index:02}.png")))
            .unwrap();
    }
}

fn config(dir: &Path, end_index: usize) -> Config {
    let raw = format!(
        r#"
        [images]
        base_path = '{}/'
        prefix = "img_"
        fill_width = 2
        end_index = {end_index}

        [roi]
        x = 0
        y = 0
        width = 64
        height = 96

        [visualization]
        output_dir = '{}'
        "#,
        dir.display(),
        dir.join("out").display()
    );
    Config::from_toml_str(&raw).unwrap()
}

fn sequence() -> (TempDir, Config) {
    let dir = tempfile::tempdir().unwrap();
    write_sequence(dir.path());
    let config = config(dir.path(), FRAMES - 1);
    (dir, config)
}

#[test]
fn prints_settings_then_one_report_per_frame() {
    let (dir, config) = sequence();
    let pipeline = Pipeline {
        detector: DetectorType::Fast,
        descriptor: DescriptorType::Brief,
        matcher: MatcherType::BruteForce,
        selector: SelectorType::NearestNeighbour,
    };

    let mut out = Vec::new();
    let reports = System::new(pipeline, config, true).run(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let lines = out.lines().collect::<Vec<_>>();

    assert_eq!(
        &lines[..5],
        &[
            "Using detector: FAST",
            "Using descriptor: BRIEF",
            "Using matcher: MAT_BF",
            "Using selector: SEL_NN",
            "Using descriptor type: DES_BINARY",
        ]
    );
    assert_eq!(lines.len(), 5 + FRAMES);

    let parsed = lines[5..]
        .iter()
        .map(|line| line.parse::<FrameReport>().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(parsed.len(), reports.len());
    assert_eq!(parsed[0].matches, 0);
    for report in &parsed {
        assert!(report.total > 0);
        assert!(report.vehicle <= report.total);
    }
    assert!(parsed[1..].iter().all(|report| report.matches > 0));

    let out_dir = dir.path().join("out");
    assert!(!out_dir.join("matches_0000.png").exists());
    assert!(out_dir.join("matches_0001.png").exists());
    assert!(out_dir.join("matches_0002.png").exists());
}

#[test]
fn sift_reports_hog_descriptors() {
    let (_dir, config) = sequence();
    let pipeline = Pipeline {
        detector: DetectorType::Sift,
        descriptor: DescriptorType::Sift,
        matcher: MatcherType::Flann,
        selector: SelectorType::KNearest,
    };
    let mut out = Vec::new();
    let reports = System::new(pipeline, config, false).run(&mut out).unwrap();
    assert_eq!(reports.len(), FRAMES);
    assert!(String::from_utf8(out)
        .unwrap()
        .contains("Using descriptor type: DES_HOG"));
}

#[test]
fn missing_frame_stops_the_run() {
    let (dir, _) = sequence();
    let config = config(dir.path(), FRAMES);
    let mut out = Vec::new();
    let err = System::new(Pipeline::default(), config, false)
        .run(&mut out)
        .unwrap_err();
    match err {
        Error::Image { path, .. } => assert!(path.ends_with("img_03.png")),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn config_file_is_loaded_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("featrack.toml");
    std::fs::write(&path, "[images]\nend_index = 4\n\n[matching]\nratio = 0.7\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.images.indices(), 0..=4);
    assert_eq!(config.matching.ratio, 0.7);

    assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
}

#[test]
fn sweep_skips_akaze_descriptors_on_foreign_keypoints() {
    let (_dir, config) = sequence();
    let mut out = Vec::new();
    let mut csv = Vec::new();
    let outcomes = sweep::sweep(
        &config,
        MatcherType::BruteForce,
        SelectorType::KNearest,
        &mut out,
        Some(&mut csv as &mut dyn std::io::Write),
    )
    .unwrap();

    assert_eq!(outcomes.len(), DetectorType::ALL.len() * DescriptorType::ALL.len());
    let invalid = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            Outcome::Invalid {
                detector,
                descriptor,
            } => Some((*detector, *descriptor)),
            Outcome::Completed(_) => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(invalid.len(), DetectorType::ALL.len() - 1);
    assert!(invalid
        .iter()
        .all(|&(detector, descriptor)| descriptor == DescriptorType::Akaze
            && detector != DetectorType::Akaze));

    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("Invalid combination|HARRIS|AKAZE"));
    assert!(!out.contains("Invalid combination|AKAZE|AKAZE"));

    let csv = String::from_utf8(csv).unwrap();
    let rows = csv.lines().collect::<Vec<_>>();
    let completed = outcomes.len() - invalid.len();
    assert!(csv.ends_with("\"\"\r\n"));
    assert_eq!(rows[0], CSV_HEADER.join(","));
    assert_eq!(rows.len(), 1 + completed * (FRAMES + 1));
    assert!(rows[1].starts_with("SHITOMASI,BRISK,0,"));
    assert!(rows[FRAMES].starts_with(&format!("SHITOMASI,BRISK,{},", FRAMES - 1)));
    // combinations are separated by a row with one empty field
    assert_eq!(rows[1 + FRAMES], "\"\"");
    assert!(rows.iter().all(|row| !row.is_empty()));
}
