//! crackdiff-bench: CLI tool for comparing two images and inspecting the
//! pipeline.
//!
//! Aligns a current image onto a baseline image with configurable
//! parameters, printing detailed per-stage diagnostics. Useful for:
//!
//! - Comparing matcher strategies (`Orb` vs `Patch` vs no alignment)
//! - Tuning the ratio test, RANSAC threshold and diff threshold
//! - Measuring per-stage durations to identify bottlenecks
//! - Seeing how the blob-area filter changes what gets highlighted
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin crackdiff-bench -- [OPTIONS] <BASELINE> <CURRENT>
//! ```
//!
//! Set `RUST_LOG=debug` for stage-level logging on stderr.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use crackdiff_pipeline::diagnostics::PipelineDiagnostics;
use crackdiff_pipeline::{
    CompareConfig, CompareOutcome, DownsampleFilter, FeatureMatcherKind, GrayImage, Pipeline,
    PipelineError, RgbaImage,
};
use tracing_subscriber::EnvFilter;

/// Image comparison experimentation and diagnostics for crackdiff.
///
/// Aligns CURRENT onto BASELINE, highlights what changed, and prints
/// per-stage timing and count diagnostics.
#[derive(Parser)]
#[command(name = "crackdiff-bench", version)]
struct Cli {
    /// Path to the baseline image (PNG, JPEG, BMP, WebP).
    baseline: PathBuf,

    /// Path to the current image.
    current: PathBuf,

    /// Maximum dimension in pixels after downsampling.
    #[arg(long, default_value_t = CompareConfig::DEFAULT_MAX_DIMENSION, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    max_dimension: u32,

    /// Downsample filter (none, nearest, triangle, catmull-rom, gaussian, lanczos3).
    #[arg(long, value_enum, default_value_t = CLI_DEFAULT_FILTER)]
    downsample_filter: Filter,

    /// Feature detector / matcher strategy.
    #[arg(long, value_enum, default_value_t = Matcher::Orb)]
    matcher: Matcher,

    /// Maximum keypoints per image.
    #[arg(long, default_value_t = CompareConfig::DEFAULT_MAX_KEYPOINTS)]
    max_keypoints: usize,

    /// Lowe ratio-test threshold.
    #[arg(long, default_value_t = CompareConfig::DEFAULT_MATCH_RATIO)]
    match_ratio: f32,

    /// Minimum matches before a homography is attempted.
    #[arg(long, default_value_t = CompareConfig::DEFAULT_MIN_MATCHES)]
    min_matches: usize,

    /// RANSAC reprojection threshold in pixels.
    #[arg(long, default_value_t = CompareConfig::DEFAULT_RANSAC_THRESHOLD)]
    ransac_threshold: f64,

    /// RANSAC sampler seed.
    #[arg(long, default_value_t = CompareConfig::DEFAULT_RANSAC_SEED)]
    seed: u64,

    /// Blurred difference at or above which a pixel counts as changed.
    #[arg(long, default_value_t = CompareConfig::DEFAULT_DIFF_THRESHOLD)]
    diff_threshold: u8,

    /// Morphological closing passes.
    #[arg(long, default_value_t = CompareConfig::DEFAULT_CLOSE_ITERATIONS)]
    close_iterations: u8,

    /// Smallest changed region kept, in pixels.
    #[arg(long, default_value_t = CompareConfig::DEFAULT_MIN_BLOB_AREA)]
    min_blob_area: u32,

    /// Write the highlighted image as PNG.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Write the binary change mask as PNG.
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full compare config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `CompareConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,
}

/// Detector / matcher strategy selection.
#[derive(Clone, Copy, ValueEnum)]
enum Matcher {
    /// FAST + Harris on a pyramid with rotated BRIEF descriptors.
    Orb,
    /// Same keypoints with normalized patch descriptors.
    Patch,
    /// No alignment: resize and compare directly.
    Disabled,
}

/// Downsample resampling filter selection.
#[derive(Clone, Copy, ValueEnum)]
enum Filter {
    /// Skip downsampling regardless of image size.
    None,
    /// Nearest-neighbor (fastest, blocky).
    Nearest,
    /// Bilinear interpolation (fast, decent quality).
    Triangle,
    /// Bicubic Catmull-Rom (moderate, good quality).
    CatmullRom,
    /// Gaussian (moderate, smooth).
    Gaussian,
    /// Lanczos with 3 lobes (slowest, sharpest).
    Lanczos3,
}

/// Maps a [`DownsampleFilter`] to the local CLI [`Filter`] enum.
const fn filter_from_pipeline(f: DownsampleFilter) -> Filter {
    match f {
        DownsampleFilter::None => Filter::None,
        DownsampleFilter::Nearest => Filter::Nearest,
        DownsampleFilter::Triangle => Filter::Triangle,
        DownsampleFilter::CatmullRom => Filter::CatmullRom,
        DownsampleFilter::Gaussian => Filter::Gaussian,
        DownsampleFilter::Lanczos3 => Filter::Lanczos3,
    }
}

/// The CLI default filter, derived from
/// [`CompareConfig::DEFAULT_DOWNSAMPLE_FILTER`] so the two cannot
/// silently diverge.
const CLI_DEFAULT_FILTER: Filter = filter_from_pipeline(CompareConfig::DEFAULT_DOWNSAMPLE_FILTER);

/// Build a [`CompareConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored. Otherwise, a config is
/// assembled from the individual flags.
fn config_from_cli(cli: &Cli) -> Result<CompareConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(CompareConfig {
        max_dimension: cli.max_dimension,
        downsample_filter: match cli.downsample_filter {
            Filter::None => DownsampleFilter::None,
            Filter::Nearest => DownsampleFilter::Nearest,
            Filter::Triangle => DownsampleFilter::Triangle,
            Filter::CatmullRom => DownsampleFilter::CatmullRom,
            Filter::Gaussian => DownsampleFilter::Gaussian,
            Filter::Lanczos3 => DownsampleFilter::Lanczos3,
        },
        feature_matcher: match cli.matcher {
            Matcher::Orb => FeatureMatcherKind::Orb,
            Matcher::Patch => FeatureMatcherKind::Patch,
            Matcher::Disabled => FeatureMatcherKind::Disabled,
        },
        max_keypoints: cli.max_keypoints,
        match_ratio: cli.match_ratio,
        min_matches: cli.min_matches,
        ransac_threshold: cli.ransac_threshold,
        ransac_seed: cli.seed,
        diff_threshold: cli.diff_threshold,
        close_iterations: cli.close_iterations,
        min_blob_area: cli.min_blob_area,
        ..CompareConfig::default()
    })
}

/// Run every stage, keeping the change mask alongside the outcome.
fn compare_with_mask(
    baseline: RgbaImage,
    current: RgbaImage,
    config: &CompareConfig,
) -> Result<(CompareOutcome, GrayImage), PipelineError> {
    let diffed = Pipeline::new(baseline, current, config.clone())
        .preprocess()?
        .detect_features()
        .match_features()
        .estimate()
        .align()
        .diff()?;
    let mask = diffed.change().mask.clone();
    Ok((diffed.highlight()?.into_outcome(), mask))
}

fn read_image(path: &std::path::Path) -> Result<RgbaImage, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    eprintln!("Image: {} ({} bytes)", path.display(), bytes.len());
    crackdiff_pipeline::grayscale::decode(&bytes)
        .map_err(|e| format!("Error decoding {}: {e}", path.display()))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let images = read_image(&cli.baseline).and_then(|b| Ok((b, read_image(&cli.current)?)));
    let (baseline, current) = match images {
        Ok(pair) => pair,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!("Config: {config:#?}");
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match compare_with_mask(baseline.clone(), current.clone(), &config) {
            Ok((outcome, mask)) => {
                let diagnostics = &outcome.report.diagnostics;
                if cli.json {
                    match serde_json::to_string_pretty(&outcome.report) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing report: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                    if let Some(reason) = &outcome.report.fallback_reason {
                        println!("Fallback reason: {reason}");
                    }
                }

                // Write images on the first run only.
                if run == 0 {
                    if let Some(ref path) = cli.output {
                        match crackdiff_io::raster::write_png(&outcome.image, path) {
                            Ok(()) => eprintln!("Highlight written to {}", path.display()),
                            Err(e) => eprintln!("Error writing highlight: {e}"),
                        }
                    }
                    if let Some(ref path) = cli.mask {
                        let written = crackdiff_io::raster::encode_mask_png(&mask).and_then(|png| {
                            std::fs::write(path, png).map_err(|e| crackdiff_io::RasterError::Write {
                                path: path.display().to_string(),
                                message: e.to_string(),
                            })
                        });
                        match written {
                            Ok(()) => eprintln!("Mask written to {}", path.display()),
                            Err(e) => eprintln!("Error writing mask: {e}"),
                        }
                    }
                }

                all_diagnostics.push(outcome.report.diagnostics);
            }
            Err(e) => {
                eprintln!("Pipeline error: {e}");
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    // Print summary when multiple runs.
    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Function pointer type for extracting a stage duration from diagnostics.
type StageExtractor = fn(&PipelineDiagnostics) -> Option<std::time::Duration>;

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[PipelineDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let stage_extractors: &[(&str, StageExtractor)] = &[
        ("Preprocess", |d| Some(d.preprocess.duration)),
        ("Feature Detection", |d| {
            d.feature_detection.as_ref().map(|s| s.duration)
        }),
        ("Matching", |d| d.matching.as_ref().map(|s| s.duration)),
        ("Estimation", |d| d.estimation.as_ref().map(|s| s.duration)),
        ("Alignment", |d| Some(d.alignment.duration)),
        ("Diff", |d| Some(d.diff.duration)),
        ("Highlight", |d| Some(d.highlight.duration)),
    ];

    for (name, extractor) in stage_extractors {
        let stage_durations: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(extractor)
            .map(|dur| dur.as_secs_f64() * 1000.0)
            .collect();

        if stage_durations.is_empty() {
            continue;
        }

        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}
