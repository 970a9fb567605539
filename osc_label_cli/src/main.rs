use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use osc_label::{
    calibrate_thresholds, label_maneuvers, retain_relevant_objects, CalibrationResult,
    CoordinateFrame, EntityLabels, EquirectangularFrame, JsonScenarioSerializer, LabelingConfig,
    LabelingOutput, LaneTable, ManeuverKind, ObjectFilter, PlanarFrame, RenderOptions,
    ScenarioSerializer, Thresholds, TrajectoryTable, TriggerStyle,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Maneuver labeling CLI for recorded trajectories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Label maneuvers and write the scenario handoff JSON
    Label(LabelArgs),
    /// Calibrate per-entity acceleration thresholds only
    Calibrate(CalibrateArgs),
}

#[derive(Parser, Debug)]
struct LabelArgs {
    /// Normalized trajectory CSV
    #[arg(value_hint = ValueHint::FilePath)]
    trajectories: PathBuf,

    /// Lane boundary CSV (pairs of lat/lon columns)
    #[arg(long, value_hint = ValueHint::FilePath)]
    lanes: Option<PathBuf>,

    /// Output JSON path (`-` for stdout)
    #[arg(short, long, default_value = "scenario.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Fixed acceleration threshold for every entity
    #[arg(long, conflicts_with = "optimize")]
    threshold: Option<f64>,

    /// Calibrate a threshold per entity before labeling
    #[arg(long, action = ArgAction::SetTrue)]
    optimize: bool,

    /// Optional CSV for the calibration result
    #[arg(long, value_hint = ValueHint::FilePath)]
    calibration_output: Option<PathBuf>,

    /// Directory for per-entity mask and interval CSVs
    #[arg(long, value_hint = ValueHint::DirPath)]
    maneuver_dir: Option<PathBuf>,

    /// Trigger style for longitudinal actions
    #[arg(long, value_enum, default_value_t = TriggerOpt::Time)]
    longitudinal_trigger: TriggerOpt,

    /// Trigger style for lane changes
    #[arg(long, value_enum, default_value_t = TriggerOpt::Position)]
    lateral_trigger: TriggerOpt,

    /// Radius of position triggers
    #[arg(long, default_value_t = 2.0)]
    trigger_radius: f64,

    /// Scenario format version stamped into the output
    #[arg(long, default_value = "1.0")]
    osc_version: String,

    /// Pretty-print the output JSON
    #[arg(long, action = ArgAction::SetTrue)]
    pretty: bool,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct CalibrateArgs {
    /// Normalized trajectory CSV
    #[arg(value_hint = ValueHint::FilePath)]
    trajectories: PathBuf,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "calibration.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Base configuration JSON; flags below override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Sample interval in seconds
    #[arg(long)]
    sample_interval: Option<f64>,

    /// Recorded speed units per base unit (3.6 for km/h)
    #[arg(long)]
    speed_unit_factor: Option<f64>,

    /// Default acceleration threshold
    #[arg(long)]
    acceleration_threshold: Option<f64>,

    /// Minimum run length in samples
    #[arg(long)]
    min_run_length: Option<f64>,

    /// Speed above which a start no longer applies (recorded units)
    #[arg(long)]
    start_speed_ceiling: Option<f64>,

    /// Trailing smoothing window in samples
    #[arg(long)]
    smoothing_window: Option<usize>,

    /// Backward shift of the smoothed acceleration in samples
    #[arg(long)]
    smoothing_shift: Option<usize>,

    /// Candidate thresholds for calibration (comma separated)
    #[arg(long)]
    candidates: Option<String>,

    /// Score given to a candidate whose reconstruction cannot be compared
    #[arg(long)]
    mismatch_penalty: Option<f64>,

    /// Seed for class label selection
    #[arg(long)]
    class_seed: Option<u64>,

    /// Latitude of the tangent-plane origin (geodetic input)
    #[arg(long, requires = "origin_lon")]
    origin_lat: Option<f64>,

    /// Longitude of the tangent-plane origin (geodetic input)
    #[arg(long, requires = "origin_lat")]
    origin_lon: Option<f64>,

    /// Easting offset subtracted from planar input
    #[arg(long, default_value_t = 0.0)]
    offset_x: f64,

    /// Northing offset subtracted from planar input
    #[arg(long, default_value_t = 0.0)]
    offset_y: f64,

    /// Drop objects with too few samples, ego shadows or implausible jumps
    #[arg(long, action = ArgAction::SetTrue)]
    filter_objects: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TriggerOpt {
    Time,
    Position,
}

impl From<TriggerOpt> for TriggerStyle {
    fn from(value: TriggerOpt) -> Self {
        match value {
            TriggerOpt::Time => TriggerStyle::Time,
            TriggerOpt::Position => TriggerStyle::Position,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Label(args) => args.common.verbose,
        Command::Calibrate(args) => args.common.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Label(args) => handle_label(args),
        Command::Calibrate(args) => handle_calibrate(args),
    }
}

impl CommonArgs {
    fn timed(&self) -> bool {
        self.profile || self.verbose
    }

    fn config(&self) -> Result<LabelingConfig> {
        let mut cfg = match self.config.as_ref() {
            Some(path) => load_config(path)?,
            None => LabelingConfig::default(),
        };
        if let Some(v) = self.sample_interval {
            cfg.sample_interval_s = v;
        }
        if let Some(v) = self.speed_unit_factor {
            cfg.speed_unit_factor = v;
        }
        if let Some(v) = self.acceleration_threshold {
            cfg.acceleration_threshold = v;
        }
        if let Some(v) = self.min_run_length {
            cfg.min_run_length = v;
        }
        if let Some(v) = self.start_speed_ceiling {
            cfg.start_speed_ceiling = v;
        }
        if let Some(v) = self.smoothing_window {
            cfg.smoothing_window = v;
        }
        if let Some(v) = self.smoothing_shift {
            cfg.smoothing_shift = v;
        }
        if let Some(list) = self.candidates.as_ref() {
            cfg.candidate_thresholds = parse_candidate_list(list)?;
        }
        if let Some(v) = self.mismatch_penalty {
            cfg.mismatch_penalty = v;
        }
        if let Some(v) = self.class_seed {
            cfg.class_seed = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn frame(&self) -> Box<dyn CoordinateFrame> {
        match (self.origin_lat, self.origin_lon) {
            (Some(origin_lat), Some(origin_lon)) => Box::new(EquirectangularFrame {
                origin_lat,
                origin_lon,
            }),
            _ => Box::new(PlanarFrame {
                offset_x: self.offset_x,
                offset_y: self.offset_y,
            }),
        }
    }

    fn load_table(&self, path: &Path, cfg: &LabelingConfig) -> Result<TrajectoryTable> {
        let t_read = Instant::now();
        let columns = read_numeric_columns(path, true)?;
        let table = TrajectoryTable::from_named_columns(columns)
            .with_context(|| format!("failed to group columns of {}", path.display()))?;
        if self.timed() {
            info!(
                "Read stage: {:.1} ms ({} samples, {} objects)",
                t_read.elapsed().as_secs_f64() * 1000.0,
                table.len(),
                table.objects.len()
            );
        }
        if !self.filter_objects {
            return Ok(table);
        }
        let (filtered, removed) = retain_relevant_objects(&table, &ObjectFilter::default(), cfg)?;
        info!("Removed {} irrelevant objects", removed);
        Ok(filtered)
    }
}

fn handle_label(args: LabelArgs) -> Result<()> {
    let common = &args.common;
    let cfg = common.config()?;
    let frame = common.frame();
    let table = common.load_table(&args.trajectories, &cfg)?;

    let lanes = match args.lanes.as_ref() {
        Some(path) => {
            let columns = read_numeric_columns(path, false)?;
            LaneTable::from_columns(columns.into_iter().map(|(_, c)| c).collect())
                .with_context(|| format!("invalid lane table {}", path.display()))?
        }
        None => {
            warn!("No lane table supplied; lane changes will not be detected");
            LaneTable::default()
        }
    };

    let thresholds = if args.optimize {
        let t_cal = Instant::now();
        let result = calibrate_thresholds(&table, frame.as_ref(), &cfg)?;
        if common.timed() {
            info!(
                "Calibration stage: {:.1} ms",
                t_cal.elapsed().as_secs_f64() * 1000.0
            );
        }
        if let Some(path) = args.calibration_output.as_ref() {
            write_calibration(&result, path)?;
        }
        Thresholds::from(&result)
    } else {
        Thresholds::Fixed(args.threshold.unwrap_or(cfg.acceleration_threshold))
    };

    let t_label = Instant::now();
    let output = label_maneuvers(&table, &lanes, &thresholds, frame.as_ref(), &cfg)?;
    if common.timed() {
        info!(
            "Labeling stage: {:.1} ms",
            t_label.elapsed().as_secs_f64() * 1000.0
        );
    }
    log_summary(&output);

    if let Some(dir) = args.maneuver_dir.as_ref() {
        write_maneuver_tables(&output, dir)?;
    }

    let options = RenderOptions {
        longitudinal_trigger: args.longitudinal_trigger.into(),
        lateral_trigger: args.lateral_trigger.into(),
        trigger_radius: args.trigger_radius,
        format_version: args.osc_version.clone(),
    };
    let serializer = JsonScenarioSerializer {
        pretty: args.pretty,
    };
    let rendered = serializer.render(&output, &options)?;
    write_text(&args.output, &rendered)?;
    if args.output.as_os_str() != "-" {
        info!("Scenario written to {}", args.output.display());
    }
    Ok(())
}

fn handle_calibrate(args: CalibrateArgs) -> Result<()> {
    let common = &args.common;
    let cfg = common.config()?;
    let frame = common.frame();
    let table = common.load_table(&args.trajectories, &cfg)?;

    let t_cal = Instant::now();
    let result = calibrate_thresholds(&table, frame.as_ref(), &cfg)?;
    if common.timed() {
        info!(
            "Calibration stage: {:.1} ms",
            t_cal.elapsed().as_secs_f64() * 1000.0
        );
    }
    for t in &result.thresholds {
        info!("{}: threshold {:.2} (rmse {:.4})", t.role, t.threshold, t.rmse);
    }

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_calibration_rows(&result, &mut writer)
    } else {
        write_calibration(&result, &args.output)
    }
}

fn load_config(path: &Path) -> Result<LabelingConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a valid config", path.display()))
}

fn parse_candidate_list(input: &str) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: f64 = trimmed
            .parse()
            .with_context(|| format!("invalid candidate threshold '{}'", trimmed))?;
        out.push(value);
    }
    if out.is_empty() {
        return Err(anyhow!("--candidates list was empty"));
    }
    Ok(out)
}

fn parse_cell(raw: &str) -> Option<Option<f64>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return Some(None);
    }
    let value: f64 = trimmed.parse().ok()?;
    Some(value.is_finite().then_some(value))
}

/// Reads a headed CSV into numeric columns; empty and `nan` cells are absent.
///
/// With `skip_text` a column holding non-numeric text is dropped (timestamps,
/// labels); otherwise it is an error.
fn read_numeric_columns(path: &Path, skip_text: bool) -> Result<Vec<(String, Vec<Option<f64>>)>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut columns: Vec<Option<Vec<Option<f64>>>> = vec![Some(Vec::new()); headers.len()];
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{}: bad row {}", path.display(), row + 1))?;
        for (col, slot) in columns.iter_mut().enumerate() {
            let Some(values) = slot.as_mut() else {
                continue;
            };
            let raw = record.get(col).unwrap_or("");
            match parse_cell(raw) {
                Some(v) => values.push(v),
                None if skip_text => {
                    warn!("{}: column '{}' is not numeric, ignoring it", path.display(), headers[col]);
                    *slot = None;
                }
                None => {
                    return Err(anyhow!(
                        "{}: non-numeric value '{}' in column '{}' at row {}",
                        path.display(),
                        raw,
                        headers[col],
                        row + 1
                    ))
                }
            }
        }
    }

    Ok(headers
        .into_iter()
        .zip(columns)
        .filter_map(|(name, values)| values.map(|v| (name, v)))
        .collect())
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{}", text)?;
        return Ok(());
    }
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

fn write_calibration(result: &CalibrationResult, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_calibration_rows(result, &mut writer)?;
    info!("Calibration written to {}", path.display());
    Ok(())
}

fn write_calibration_rows<W: Write>(
    result: &CalibrationResult,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record(["role", "threshold", "rmse"])?;
    for t in &result.thresholds {
        writer.write_record([
            t.role.to_string(),
            format!("{:.2}", t.threshold),
            format!("{:.4}", t.rmse),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

const MASK_KINDS: [ManeuverKind; 9] = [
    ManeuverKind::LaneChangeLeft,
    ManeuverKind::LaneChangeRight,
    ManeuverKind::Accelerate,
    ManeuverKind::Start,
    ManeuverKind::KeepVelocity,
    ManeuverKind::Standstill,
    ManeuverKind::Decelerate,
    ManeuverKind::Stop,
    ManeuverKind::Reversing,
];

fn mask_value(labels: &EntityLabels, kind: ManeuverKind, index: usize) -> bool {
    let mask = match kind {
        ManeuverKind::LaneChangeLeft => Some(labels.lateral_masks.left.as_slice()),
        ManeuverKind::LaneChangeRight => Some(labels.lateral_masks.right.as_slice()),
        other => labels.longitudinal_masks.get(other),
    };
    mask.and_then(|m| m.get(index)).copied().unwrap_or(false)
}

fn write_maneuver_tables(output: &LabelingOutput, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    for labels in output.entities() {
        let mask_path = dir.join(format!("maneuvers_{}.csv", labels.role));
        let file = File::create(&mask_path)
            .with_context(|| format!("failed to create {}", mask_path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        let mut header = vec!["index".to_string()];
        header.extend(MASK_KINDS.iter().map(|k| k.label().to_string()));
        writer.write_record(&header)?;
        for i in 0..labels.longitudinal_masks.len() {
            let mut row = vec![i.to_string()];
            row.extend(
                MASK_KINDS
                    .iter()
                    .map(|k| u8::from(mask_value(labels, *k, i)).to_string()),
            );
            writer.write_record(&row)?;
        }
        writer.flush()?;

        let interval_path = dir.join(format!("intervals_{}.csv", labels.role));
        let file = File::create(&interval_path)
            .with_context(|| format!("failed to create {}", interval_path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record([
            "start_index",
            "end_index",
            "kind",
            "trigger_x",
            "trigger_y",
            "target_speed",
            "rate",
        ])?;
        for iv in labels.longitudinal.iter().chain(labels.lateral.iter()) {
            let (x, y) = match iv.trigger {
                Some(p) => (format!("{:.3}", p.x), format!("{:.3}", p.y)),
                None => (String::new(), String::new()),
            };
            writer.write_record([
                iv.start_index.to_string(),
                iv.end_index.to_string(),
                iv.kind.label().to_string(),
                x,
                y,
                format!("{:.4}", iv.target_speed),
                format!("{:.4}", iv.rate),
            ])?;
        }
        writer.flush()?;
    }
    info!("Maneuver tables written to {}", dir.display());
    Ok(())
}

fn log_summary(output: &LabelingOutput) {
    for labels in output.entities() {
        let class = labels.class_label.as_deref().unwrap_or("-");
        info!(
            "{} [{}]: {} longitudinal, {} lateral (threshold {:.2})",
            labels.role,
            class,
            labels.longitudinal.len(),
            labels.lateral.len(),
            labels.threshold
        );
    }
}
