//! `relief`: ingest lidar point clouds and produce elevation tiles.

use anyhow::Context;
use clap::{Parser, Subcommand};
use relief_dem::{
    ChainOptions, ReliefConfig, ReliefError, TileCoord, TileFormat, TileQuery, TileService,
};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Lidar rasterizer and elevation tile synthesizer")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Grid cache directory, overriding the configuration
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print collected metrics to stderr on exit
    #[cfg(feature = "prometheus")]
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rasterize a point cloud (.xyz, .txt, .csv or .las) into the cache
    Ingest {
        /// Point-cloud file
        file: PathBuf,

        /// Catalog id (default: the file stem)
        #[arg(long)]
        id: Option<String>,

        /// Cell size in native CRS units (default: from the configuration)
        #[arg(long)]
        cell_size: Option<f64>,
    },

    /// Produce one elevation tile
    Tile {
        z: i32,
        x: i64,
        y: i64,

        /// raw or rgb-elevation
        #[arg(long, default_value = "rgb-elevation")]
        format: TileFormat,

        /// Value written into pixels without data
        #[arg(long, default_value_t = relief_dem::DEFAULT_NODATA, allow_hyphen_values = true)]
        nodata: f32,

        /// Query the remote elevation coverage service
        #[arg(long)]
        remote_coverage: bool,

        /// Skip cached grids
        #[arg(long)]
        no_cache: bool,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Sample elevations along a path of lon,lat points
    Profile {
        /// Vertices as lon,lat
        #[arg(required = true, num_args = 2.., allow_hyphen_values = true)]
        points: Vec<LonLat>,
    },

    /// List the cached grids
    Catalog,

    /// Show where a tile lands and which grids it overlaps
    TileInfo { z: i32, x: i64, y: i64 },
}

/// A `lon,lat` pair.
#[derive(Debug, Clone, Copy)]
struct LonLat(f64, f64);

impl FromStr for LonLat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lon, lat) = s
            .split_once(',')
            .ok_or_else(|| format!("expected lon,lat, got {:?}", s))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<f64>()
                .map_err(|e| format!("{:?}: {}", v, e))
        };
        Ok(LonLat(parse(lon)?, parse(lat)?))
    }
}

fn load_config(args: &Args) -> anyhow::Result<ReliefConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ReliefConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let service = TileService::open(config).context("opening the grid cache")?;

    match &args.command {
        Command::Ingest { file, id, cell_size } => {
            let report = service
                .ingest_file(file, id.as_deref(), *cell_size)
                .with_context(|| format!("ingesting {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Tile {
            z,
            x,
            y,
            format,
            nodata,
            remote_coverage,
            no_cache,
            output,
        } => {
            if !nodata.is_finite() {
                return Err(ReliefError::InvalidParameter(format!(
                    "nodata must be a finite number, got {}",
                    nodata
                ))
                .into());
            }
            let query = TileQuery {
                tile: TileCoord::new(*z, *x, *y)?,
                format: *format,
                options: ChainOptions {
                    allow_cache: !no_cache,
                    allow_remote_coverage: *remote_coverage,
                    nodata: *nodata,
                },
            };
            let tile = service
                .read_tile(&query)
                .with_context(|| format!("reading tile {}", query.tile))?;
            info!(
                tile = %query.tile,
                provenance = %tile.provenance,
                source = %tile.source,
                content_type = tile.content_type,
                bytes = tile.bytes.len(),
                "Tile ready"
            );
            match output {
                Some(path) => fs::write(path, &tile.bytes)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => std::io::stdout().lock().write_all(&tile.bytes)?,
            }
        }
        Command::Profile { points } => {
            let path: Vec<(f64, f64)> = points.iter().map(|p| (p.0, p.1)).collect();
            let samples = service.profile(&path)?;
            println!("{}", serde_json::to_string_pretty(&samples)?);
        }
        Command::Catalog => {
            println!("{}", serde_json::to_string_pretty(&service.list()?)?);
        }
        Command::TileInfo { z, x, y } => {
            let tile = TileCoord::new(*z, *x, *y)?;
            println!("{}", serde_json::to_string_pretty(&service.tile_diagnostics(&tile)?)?);
        }
    }

    Ok(())
}

/// Exit status for a failed run: 2 when the request itself was bad, as for
/// command-line usage errors, 1 otherwise.
fn exit_status(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<ReliefError>() {
        Some(e) if e.is_caller_error() => 2,
        _ => 1,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    #[cfg(feature = "prometheus")]
    let recorder = match relief_metrics::install_prometheus_recorder() {
        Ok(recorder) => recorder,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = run(&args);

    #[cfg(feature = "prometheus")]
    {
        if args.metrics {
            eprintln!("{}", recorder.render());
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        let bad_request = anyhow::Error::from(ReliefError::InvalidParameter("cell size".into()))
            .context("ingesting block.xyz");
        assert_eq!(exit_status(&bad_request), 2);

        let no_data = anyhow::Error::from(ReliefError::NoCoverage("tile 14/8852/5549".into()));
        assert_eq!(exit_status(&no_data), 1);

        assert_eq!(exit_status(&anyhow::anyhow!("disk full")), 1);
    }

    #[test]
    fn test_lon_lat_parsing() {
        let p: LonLat = "14.42, 50.08".parse().unwrap();
        assert_eq!((p.0, p.1), (14.42, 50.08));
        assert!("14.42".parse::<LonLat>().is_err());
    }
}
