//! # CLI Module
//!
//! Command-line driver for the image load wizard.
//!
//! ## Usage
//! ```bash
//! # Show what the wizard knows about a file
//! io-wizard inspect scan.png
//!
//! # Register an overlay against a main image
//! io-wizard register main.png overlay.png
//!
//! # Pick the metric and starting point
//! io-wizard register main.png overlay.png --metric mean-squares --init identity
//!
//! # JSON output
//! io-wizard register main.png overlay.png --output json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use console::{style, Term};
use image_load_wizard::core::image::ImageFormat;
use image_load_wizard::core::registration::{
    AffineTransform, RegistrationInit, RegistrationMetric, RegistrationMode, RegistrationReport,
    WorkerState,
};
use image_load_wizard::core::wizard::{
    ImageLoadWizardModel, MainImageLoadDelegate, Observer, OverlayLoadDelegate, SummaryItem,
    WizardHints,
};
use image_load_wizard::error::{ImageIoError, Result, WizardError};
use image_load_wizard::events::{EventKind, SourceId};
use indicatif::{ProgressBar, ProgressStyle};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often the foreground polls a running registration
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Image IO wizard - load images, inspect them, register overlays
#[derive(Parser, Debug)]
#[command(name = "io-wizard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load an image and print its summary
    Inspect {
        /// Image to load
        path: PathBuf,

        /// Force a format instead of detecting it
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Register an overlay image against a main image
    Register {
        /// Main (reference) image
        reference: PathBuf,

        /// Overlay image to align
        overlay: PathBuf,

        /// Transform family [default: rigid]
        #[arg(short, long)]
        mode: Option<Mode>,

        /// Similarity metric [default: mutual-information]
        #[arg(long)]
        metric: Option<Metric>,

        /// Starting transform [default: moments]
        #[arg(long)]
        init: Option<Init>,

        /// Starting translation for `--init manual`
        #[arg(long, num_args = 2, value_names = ["DX", "DY"], allow_negative_numbers = true)]
        shift: Option<Vec<f64>>,

        /// Maximum optimizer iterations
        #[arg(short, long)]
        iterations: Option<u64>,

        /// JSON file with wizard hints (defaults, remembered formats)
        #[arg(long)]
        hints: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "pretty")]
        output: OutputFormat,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Rotation and translation
    Rigid,
    /// Full 2x2 matrix and translation
    Affine,
    /// Free-form deformation (not supported by the optimizer)
    Deformable,
}

impl From<Mode> for RegistrationMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Rigid => RegistrationMode::Rigid,
            Mode::Affine => RegistrationMode::Affine,
            Mode::Deformable => RegistrationMode::Deformable,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Metric {
    /// Works across modalities (default)
    MutualInformation,
    /// Linear intensity relationship
    CrossCorrelation,
    /// Same modality, same intensity scale
    MeanSquares,
}

impl From<Metric> for RegistrationMetric {
    fn from(metric: Metric) -> Self {
        match metric {
            Metric::MutualInformation => RegistrationMetric::MutualInformation,
            Metric::CrossCorrelation => RegistrationMetric::CrossCorrelation,
            Metric::MeanSquares => RegistrationMetric::MeanSquares,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Init {
    /// Start from the identity transform
    Identity,
    /// Align the intensity centroids first (default)
    Moments,
    /// Start from `--shift`
    Manual,
}

impl From<Init> for RegistrationInit {
    fn from(init: Init) -> Self {
        match init {
            Init::Identity => RegistrationInit::Identity,
            Init::Moments => RegistrationInit::Moments,
            Init::Manual => RegistrationInit::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with colors
    Pretty,
    /// JSON output for scripting
    Json,
}

/// Run the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { path, format } => run_inspect(&path, format.as_deref()),
        Commands::Register {
            reference,
            overlay,
            mode,
            metric,
            init,
            shift,
            iterations,
            hints,
            output,
            verbose,
        } => {
            let mut hints = load_hints(hints.as_deref())?;
            let mut config = hints.registration.clone();
            if let Some(mode) = mode {
                config = config.mode(mode.into());
            }
            if let Some(metric) = metric {
                config = config.metric(metric.into());
            }
            if let Some(init) = init {
                config = config.init(init.into());
            }
            if let Some(iterations) = iterations {
                config = config.max_iterations(iterations);
            }
            if let Some([dx, dy]) = shift.as_deref().and_then(|s| <[f64; 2]>::try_from(s).ok()) {
                config = config.manual_transform(AffineTransform::translation(dx, dy));
            }
            hints.registration = config;
            run_register(&reference, &overlay, hints, output, verbose)
        }
    }
}

fn load_hints(path: Option<&Path>) -> Result<WizardHints> {
    let Some(path) = path else {
        return Ok(WizardHints::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| WizardError::Config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| WizardError::Config(format!("{}: {}", path.display(), e)))
}

fn run_inspect(path: &Path, format: Option<&str>) -> Result<()> {
    let term = Term::stdout();
    let mut wizard = ImageLoadWizardModel::new(WizardHints::default());
    wizard.initialize_for_load(Box::new(MainImageLoadDelegate::new()));

    let forced = match format {
        Some(name) => Some(wizard.file_format_by_name(name).ok_or_else(|| {
            WizardError::Config(format!(
                "unknown format '{}', expected one of: {}",
                name,
                ImageFormat::ALL.map(|f| f.name()).join(", ")
            ))
        })?),
        None => None,
    };
    wizard.set_selected_format(forced);
    wizard.load_image(path)?;

    for item in SummaryItem::ALL {
        term.write_line(&format!(
            "  {:<14} {}",
            style(item.label()).bold(),
            wizard.summary_item(item)
        ))
        .ok();
    }
    print_warnings(&term, wizard.warnings());
    Ok(())
}

/// Counts notifications so the poll loop knows when to redraw.
#[derive(Default)]
struct ProgressTicks {
    progress: Cell<u64>,
    state_changes: Cell<u64>,
}

impl Observer for ProgressTicks {
    fn notify(&self, kind: EventKind, _source: Option<SourceId>) {
        if kind.is_a(EventKind::RegistrationProgress) {
            self.progress.set(self.progress.get() + 1);
        } else if kind.is_a(EventKind::StateChange) {
            self.state_changes.set(self.state_changes.get() + 1);
        }
    }
}

fn run_register(
    reference: &Path,
    overlay: &Path,
    hints: WizardHints,
    output: OutputFormat,
    verbose: bool,
) -> Result<()> {
    let term = Term::stderr();
    let pretty = matches!(output, OutputFormat::Pretty);

    if pretty {
        term.write_line(&format!(
            "{} {}",
            style("Image Load Wizard").bold().cyan(),
            style(concat!("v", env!("CARGO_PKG_VERSION"))).dim()
        ))
        .ok();
        term.write_line("").ok();
    }

    // Main image first; its pixels become the registration reference
    let mut main = ImageLoadWizardModel::new(hints.clone());
    main.initialize_for_load(Box::new(MainImageLoadDelegate::new()));
    main.load_image(reference)?;
    main.finalize()?;
    let reference_pixels = main
        .loaded_image()
        .map(|image| image.pixels())
        .ok_or(ImageIoError::NoImageLoaded)?;

    let mut wizard = ImageLoadWizardModel::new(hints);
    wizard.initialize_for_load(Box::new(OverlayLoadDelegate::new(reference_pixels)));
    wizard.load_image(overlay)?;
    if pretty {
        print_warnings(&term, wizard.warnings());
    }

    let ticks = Arc::new(ProgressTicks::default());
    wizard.add_observer(&ticks);

    let max_iterations = wizard.registration_config().max_iterations;
    let progress = if pretty {
        let pb = ProgressBar::new(max_iterations);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
        );
        Some(pb)
    } else {
        None
    };

    wizard.perform_registration()?;

    // Foreground poll loop: never blocks on the worker
    loop {
        let delivered = wizard.process_events();
        if delivered > 0 {
            if let (Some(pb), Some(reading)) = (&progress, wizard.registration_progress()) {
                if reading.has_result {
                    pb.set_position(reading.iteration);
                    if verbose {
                        let offset = wizard
                            .registration_preview_transform()
                            .map(|t| t.offset)
                            .unwrap_or_default();
                        pb.set_message(format!(
                            "objective {:.6}  offset ({:.2}, {:.2})",
                            reading.value, offset[0], offset[1]
                        ));
                    }
                }
            }
        }
        if wizard.registration_state().is_terminal() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    wizard.process_events();
    if let Some(pb) = &progress {
        pb.finish_and_clear();
    }

    let state = wizard.registration_state();
    if state == WorkerState::Converged {
        wizard.update_image_transform_from_registration()?;
    }
    wizard.finalize()?;

    let report = wizard
        .registration_report()
        .ok_or_else(|| WizardError::Config("registration never started".to_string()))?;

    match output {
        OutputFormat::Pretty => print_pretty_report(&term, &report, ticks.progress.get(), verbose),
        OutputFormat::Json => print_json_report(&report)?,
    }

    match wizard.registration_failure() {
        Some(failure) if state == WorkerState::Failed => Err(failure.into()),
        _ => Ok(()),
    }
}

fn print_warnings(term: &Term, warnings: &[String]) {
    for warning in warnings {
        term.write_line(&format!("  {} {}", style("!").yellow().bold(), warning))
            .ok();
    }
}

fn print_pretty_report(term: &Term, report: &RegistrationReport, ticks: u64, verbose: bool) {
    let marker = match report.state {
        WorkerState::Converged => style("✓").green().bold(),
        WorkerState::Cancelled => style("○").yellow().bold(),
        _ => style("✗").red().bold(),
    };
    term.write_line(&format!("{} Registration {}", marker, report.state))
        .ok();
    term.write_line("").ok();

    term.write_line(&format!(
        "  {} iterations",
        style(report.iterations).cyan()
    ))
    .ok();

    if let Some(objective) = report.objective {
        term.write_line(&format!("  {} final objective", style(format!("{:.6}", objective)).cyan()))
            .ok();
    }

    if let Some(transform) = &report.transform {
        term.write_line(&format!(
            "  {} translation, {} rotation",
            style(format!("({:.2}, {:.2})", transform.offset[0], transform.offset[1])).yellow(),
            style(format!("{:.2}°", transform.angle().to_degrees())).yellow()
        ))
        .ok();
    }

    if let (Some(started), Some(finished)) = (report.started_at, report.finished_at) {
        let elapsed = finished - started;
        term.write_line(&format!(
            "  {:.2}s elapsed",
            elapsed.num_milliseconds() as f64 / 1000.0
        ))
        .ok();
    }

    if let Some(failure) = &report.failure {
        term.write_line(&format!("  {} {}", style("Failure:").red(), failure))
            .ok();
    }

    if verbose {
        term.write_line(&format!(
            "  {} {} progress notifications, run {}",
            style("Debug:").dim(),
            ticks,
            report.run_id
        ))
        .ok();
    }
}

fn print_json_report(report: &RegistrationReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| WizardError::Config(format!("cannot serialize report: {}", e)))?;
    println!("{}", json);
    Ok(())
}
