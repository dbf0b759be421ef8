use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use ridetime::{
    simulate_route, BikePhysics, FilterConfig, RatioModel, RideParams, RideSummary, Route,
    RouteStats, SegmentRow, StepMode, TrackPoint, VelocityTable,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ride time and energy simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate a ride over one or more GPX files
    Simulate(SimulateArgs),
    /// Print the effective ride parameters as JSON
    Params(ParamsArgs),
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// GPX files to ride
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Ride parameters JSON (missing fields take defaults)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Per-segment CSV path (`-` for stdout)
    #[arg(short, long, default_value = "segments.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Ride summary JSON path
    #[arg(long, value_hint = ValueHint::FilePath)]
    summary: Option<PathBuf>,

    /// Integration stepping scheme
    #[arg(long, value_enum)]
    step_mode: Option<StepModeOpt>,

    /// Velocity at the start of the route (m/s)
    #[arg(long)]
    start_speed: Option<f64>,

    /// Wind speed (m/s)
    #[arg(long)]
    wind_speed: Option<f64>,

    /// Direction the wind blows from (degrees, 0 = north)
    #[arg(long)]
    wind_from: Option<f64>,

    /// Uphill power cap (W)
    #[arg(long)]
    power_cap: Option<f64>,

    /// Skip every grade filter
    #[arg(long, action = ArgAction::SetTrue)]
    no_filter: bool,

    /// Solve targets without the precomputed velocity table
    #[arg(long, action = ArgAction::SetTrue)]
    no_table: bool,

    /// Log stage timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ParamsArgs {
    /// Ride parameters JSON to merge over the defaults
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Output path (stdout when omitted)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StepModeOpt {
    Velocity,
    Distance,
    Time,
}

impl From<StepModeOpt> for StepMode {
    fn from(value: StepModeOpt) -> Self {
        match value {
            StepModeOpt::Velocity => StepMode::Velocity,
            StepModeOpt::Distance => StepMode::Distance,
            StepModeOpt::Time => StepMode::Time,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Simulate(args) => args.verbose,
        Command::Params(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Simulate(args) => handle_simulate(args),
        Command::Params(args) => handle_params(args),
    }
}

/// One simulated input, as written to the summary JSON.
#[derive(Serialize)]
struct RideReport {
    file: String,
    fingerprint: String,
    stats: RouteStats,
    summary: RideSummary,
}

fn handle_simulate(args: SimulateArgs) -> Result<()> {
    if args.inputs.is_empty() {
        return Err(anyhow!("no input files supplied"));
    }

    let mut params = load_params(args.config.as_deref())?;
    apply_overrides(&mut params, &args);
    params.validate().context("invalid ride parameters")?;
    let fingerprint = params.fingerprint()?;
    debug!("Parameter fingerprint {}", fingerprint);

    let motion = BikePhysics::new(&params.physics);
    let ratio = RatioModel::new(&params.ratio);
    let t_table = Instant::now();
    let table = if args.no_table {
        None
    } else {
        Some(VelocityTable::build(&params.policy, &motion, &ratio))
    };
    if args.profile && table.is_some() {
        info!(
            "Velocity table: {:.1} ms",
            t_table.elapsed().as_secs_f64() * 1000.0
        );
    }

    let t_ride = Instant::now();
    let routes: Vec<(PathBuf, Route)> = args
        .inputs
        .par_iter()
        .map(|path| -> Result<(PathBuf, Route)> {
            let points = read_track(path)?;
            let route = simulate_route(&points, &params, &motion, &ratio, table.as_ref())
                .with_context(|| format!("failed to simulate {}", path.display()))?;
            Ok((path.clone(), route))
        })
        .collect::<Result<Vec<_>>>()?;
    if args.profile || args.verbose {
        info!(
            "Ride stage: {:.1} ms ({} file(s))",
            t_ride.elapsed().as_secs_f64() * 1000.0,
            routes.len()
        );
    }

    let mut reports = Vec::with_capacity(routes.len());
    for (path, route) in &routes {
        let summary = RideSummary::from_route(route);
        log_summary(path, &summary);
        if summary.no_force_segments > 0 {
            warn!(
                "{}: {} segment(s) stalled with no net force",
                path.display(),
                summary.no_force_segments
            );
        }
        reports.push(RideReport {
            file: path.display().to_string(),
            fingerprint: fingerprint.clone(),
            stats: route.stats.clone(),
            summary,
        });
    }

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_segment_rows(&routes, &mut writer)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_segment_rows(&routes, &mut writer)?;
        info!("Segments written to {}", args.output.display());
    }

    if let Some(path) = args.summary.as_ref() {
        let json = serde_json::to_string_pretty(&reports)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }
    Ok(())
}

fn handle_params(args: ParamsArgs) -> Result<()> {
    let params = load_params(args.config.as_deref())?;
    params.validate().context("invalid ride parameters")?;
    debug!("Parameter fingerprint {}", params.fingerprint()?);
    let json = serde_json::to_string_pretty(&params)?;
    match args.output.as_ref() {
        Some(path) => {
            fs::write(path, json + "\n")
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Parameters written to {}", path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            writeln!(handle, "{}", json)?;
        }
    }
    Ok(())
}

fn load_params(path: Option<&Path>) -> Result<RideParams> {
    let Some(path) = path else {
        return Ok(RideParams::default());
    };
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn apply_overrides(params: &mut RideParams, args: &SimulateArgs) {
    if let Some(mode) = args.step_mode {
        params.integrator.mode = mode.into();
    }
    if let Some(v) = args.start_speed {
        params.integrator.start_velocity_mps = Some(v);
    }
    if let Some(speed) = args.wind_speed {
        params.wind.speed_mps = speed;
    }
    if let Some(from) = args.wind_from {
        params.wind.from_deg = from;
    }
    if let Some(cap) = args.power_cap {
        params.policy.uphill_power_cap_w = cap;
    }
    if args.no_filter {
        params.filter = FilterConfig::disabled();
    }
}

fn read_track(path: &Path) -> Result<Vec<TrackPoint>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let points = parse_gpx(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))?;
    debug!("{}: {} point(s) with elevation", path.display(), points.len());
    Ok(points)
}

/// Track points from every track segment, or from the routes when the file
/// carries no tracks. Points without elevation are dropped.
fn parse_gpx<R: Read>(reader: R) -> Result<Vec<TrackPoint>> {
    let gpx = gpx::read(reader).map_err(|e| anyhow!("GPX parse error: {}", e))?;
    let mut waypoints: Vec<gpx::Waypoint> = gpx
        .tracks
        .into_iter()
        .flat_map(|track| track.segments)
        .flat_map(|segment| segment.points)
        .collect();
    if waypoints.is_empty() {
        waypoints = gpx
            .routes
            .into_iter()
            .flat_map(|route| route.points)
            .collect();
    }

    let total = waypoints.len();
    let points: Vec<TrackPoint> = waypoints
        .iter()
        .filter_map(|wp| {
            let elevation = wp.elevation?;
            let point = wp.point();
            Some(TrackPoint::new(point.y(), point.x(), elevation))
        })
        .collect();
    if points.len() < total {
        debug!("Skipped {} point(s) without elevation", total - points.len());
    }
    Ok(points)
}

fn write_segment_rows<W: Write>(
    routes: &[(PathBuf, Route)],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "file",
        "index",
        "lat",
        "lon",
        "elevation_m",
        "original_elevation_m",
        "grade",
        "distance_m",
        "head_wind_mps",
        "target_velocity_mps",
        "target_power_w",
        "velocity_ceiling_mps",
        "entry_ceiling_mps",
        "entry_velocity_mps",
        "exit_velocity_mps",
        "time_s",
        "rider_energy_j",
        "drag_energy_j",
        "braking_energy_j",
        "steps",
        "trace",
    ])?;

    for (path, route) in routes {
        let file = path.display().to_string();
        for row in SegmentRow::from_route(route) {
            writer.write_record([
                file.clone(),
                row.index.to_string(),
                format!("{:.6}", row.lat),
                format!("{:.6}", row.lon),
                format!("{:.2}", row.elevation_m),
                format!("{:.2}", row.original_elevation_m),
                format!("{:.4}", row.grade),
                format!("{:.2}", row.distance_m),
                format!("{:.2}", row.head_wind_mps),
                format!("{:.3}", row.target_velocity_mps),
                format!("{:.1}", row.target_power_w),
                format!("{:.3}", row.velocity_ceiling_mps),
                format!("{:.3}", row.entry_ceiling_mps),
                format!("{:.3}", row.entry_velocity_mps),
                format!("{:.3}", row.exit_velocity_mps),
                format!("{:.3}", row.time_s),
                format!("{:.1}", row.rider_energy_j),
                format!("{:.1}", row.drag_energy_j),
                format!("{:.1}", row.braking_energy_j),
                row.steps.to_string(),
                row.trace,
            ])?;
        }
    }

    writer.flush()?;
    Ok(())
}

fn log_summary(path: &Path, summary: &RideSummary) {
    info!(
        "{}: {:.2} km in {} ({} segments, +{:.0} m / -{:.0} m, {:.1} km/h avg, {:.0} W avg)",
        path.display(),
        summary.distance_m / 1000.0,
        format_duration(summary.time_s),
        summary.segments,
        summary.elevation_gain_m,
        summary.elevation_loss_m,
        summary.average_speed_mps * 3.6,
        summary.average_power_w
    );
    debug!(
        "{}: riding {} / freewheel {} / braking {}, {} steps, max residual {:.2e}",
        path.display(),
        format_duration(summary.rider_time_s),
        format_duration(summary.freewheel_time_s),
        format_duration(summary.brake_time_s),
        summary.steps,
        summary.max_energy_residual
    );
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="ridetime" xmlns="http://www.topografix.com/GPX/1/1">"#;

    #[test]
    fn test_parse_gpx_skips_points_without_elevation() {
        let xml = format!(
            "{}<trk><trkseg>\
             <trkpt lat=\"45.0\" lon=\"6.0\"><ele>100.0</ele></trkpt>\
             <trkpt lat=\"45.001\" lon=\"6.0\"></trkpt>\
             <trkpt lat=\"45.002\" lon=\"6.0\"><ele>102.5</ele></trkpt>\
             </trkseg></trk></gpx>",
            HEADER
        );
        let points = parse_gpx(xml.as_bytes()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].lat, 45.002);
        assert_eq!(points[1].lon, 6.0);
        assert_eq!(points[1].elevation, 102.5);
    }

    #[test]
    fn test_parse_gpx_falls_back_to_routes() {
        let xml = format!(
            "{}<rte>\
             <rtept lat=\"46.0\" lon=\"7.0\"><ele>10.0</ele></rtept>\
             <rtept lat=\"46.001\" lon=\"7.0\"><ele>11.0</ele></rtept>\
             </rte></gpx>",
            HEADER
        );
        let points = parse_gpx(xml.as_bytes()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].elevation, 10.0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(3725.4), "1:02:05");
        assert_eq!(format_duration(59.6), "0:01:00");
    }
}
