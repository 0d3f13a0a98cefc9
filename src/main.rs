use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};
use ndarray_npy::write_npy;

use network_dataset_loader::config::parse_date;
use network_dataset_loader::{
    DataLoader, DatePolicy, Hemisphere, LoaderOptions, NpyMasks, SplitDates,
};

#[derive(Parser, Debug)]
#[command(name = "network-dataset-loader", version = "0.1.0")]
struct Args {
    /// Name of the loader configuration, read from loader.<name>.json
    name: String,

    /// Hemisphere the dataset covers
    #[arg(value_enum)]
    hemisphere: Hemisphere,

    /// Only write the dataset configuration, do not generate any data
    #[arg(short = 'c', long)]
    cfg_only: bool,

    /// Generate samples without writing shards
    #[arg(short = 'd', long)]
    dry: bool,

    /// Batches kept in flight per worker
    #[arg(long, default_value = "2")]
    futures_per_worker: usize,

    /// Identifier of the generated dataset (defaults to the configuration name)
    #[arg(short = 'n', long)]
    forecast_name: Option<String>,

    /// Number of forecast days per sample
    #[arg(long, default_value = "93")]
    forecast_days: usize,

    /// Default lag for every daily variable
    #[arg(short = 'l', long, default_value = "2")]
    lag: usize,

    /// Per-variable lag, as VAR=N (repeatable)
    #[arg(long = "lag-override", value_name = "VAR=N")]
    lag_override: Vec<String>,

    /// Samples written to each shard
    #[arg(short = 'b', long, default_value = "8")]
    output_batch_size: usize,

    /// Skip shards that already exist and count their records
    #[arg(short = 'p', long)]
    pickup: bool,

    /// Number of generation workers
    #[arg(short = 'w', long, default_value = "2")]
    workers: usize,

    /// Debug level logging unless RUST_LOG says otherwise
    #[arg(short = 'v', long)]
    verbose: bool,

    /// JSON file with train/val/test date lists restricting generation
    #[arg(long)]
    dates_override: Option<PathBuf>,

    /// How per-source date lists are combined
    #[arg(long, value_enum, default_value = "intersection")]
    date_policy: DatePolicy,

    /// Disable per-leadtime loss weight scaling
    #[arg(long)]
    no_loss_weight_days: bool,

    /// Daily channel observed to build targets
    #[arg(long, default_value = "siconca_abs")]
    target: String,

    /// Loader configuration path (defaults to loader.<name>.json)
    #[arg(long)]
    loader_config: Option<PathBuf>,

    /// Directory the dataset configuration is written to
    #[arg(long, default_value = ".")]
    dataset_config_path: PathBuf,

    /// Root directory of generated shards
    #[arg(long, default_value = "./network_datasets")]
    network_datasets_path: PathBuf,

    /// Directory holding active_grid_cell_mask_MM.npy files
    #[arg(long, default_value = "./masks")]
    masks_dir: PathBuf,

    /// Generate a single sample for this date (YYYY_MM_DD) and save it as npy
    #[arg(long)]
    sample_date: Option<String>,

    /// Output directory for --sample-date
    #[arg(long, default_value = "./sample_output")]
    sample_output: PathBuf,
}

fn parse_lag_overrides(entries: &[String]) -> Result<BTreeMap<String, usize>> {
    let mut out = BTreeMap::new();
    for entry in entries {
        let (var, lag) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("lag override {:?} is not of the form VAR=N", entry))?;
        let lag: usize = lag
            .trim()
            .parse()
            .with_context(|| format!("lag override {:?} has an invalid lag", entry))?;
        out.insert(var.trim().to_string(), lag);
    }
    Ok(out)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose && std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(log::LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(log::LevelFilter::Info);
    }
    logger.format_timestamp_secs().init();
    info!("=== network-dataset-loader start ===");
    info!("Parsed command-line args: {:?}", args);

    let identifier = args.forecast_name.clone().unwrap_or_else(|| args.name.clone());
    let configuration_path = args
        .loader_config
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("loader.{}.json", args.name)));

    let mut options = LoaderOptions::new(configuration_path, identifier, args.lag);
    options.hemisphere = args.hemisphere;
    options.var_lag_override = parse_lag_overrides(&args.lag_override)?;
    options.dataset_config_path = args.dataset_config_path.clone();
    options.path = args.network_datasets_path.clone();
    options.dry = args.dry;
    options.futures_per_worker = args.futures_per_worker;
    options.generate_workers = args.workers;
    options.loss_weight_days = !args.no_loss_weight_days;
    options.n_forecast_days = args.forecast_days;
    options.output_batch_size = args.output_batch_size;
    options.date_policy = args.date_policy;
    options.target = args.target.clone();

    let dates_override = match &args.dates_override {
        Some(path) => {
            let dates = SplitDates::override_from_path(path)?;
            if dates.is_empty() {
                warn!("Dates override {:?} lists no dates, ignoring it", path);
                None
            } else {
                Some(dates)
            }
        }
        None => None,
    };

    let masks = NpyMasks::new(&args.masks_dir);
    let loader = DataLoader::new(options, &masks)?;

    if args.cfg_only {
        let path = loader.write_dataset_config_only()?;
        info!("Dataset configuration written to {:?}", path);
    } else if let Some(date) = &args.sample_date {
        let date = parse_date(date)?;
        let sample = loader.generate_sample(date)?;
        fs::create_dir_all(&args.sample_output)
            .with_context(|| format!("creating {:?}", args.sample_output))?;
        write_npy(args.sample_output.join("x.npy"), &sample.x)?;
        write_npy(args.sample_output.join("y.npy"), &sample.y)?;
        write_npy(args.sample_output.join("sample_weights.npy"), &sample.sample_weights)?;
        info!("Sample for {} saved to {:?}", date, args.sample_output);
    } else {
        let pool = loader.worker_pool()?;
        let summary = loader.generate(&pool, dates_override.as_ref(), args.pickup)?;
        info!(
            "Generated {} train, {} val and {} test samples",
            summary.counts.train, summary.counts.val, summary.counts.test
        );
        info!("Dataset configuration written to {:?}", summary.manifest_path);
    }

    info!("=== network-dataset-loader done ===");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lag_overrides_parse() {
        let parsed =
            parse_lag_overrides(&["siconca=3".to_string(), " tas = 1".to_string()]).unwrap();
        assert_eq!(parsed.get("siconca"), Some(&3));
        assert_eq!(parsed.get("tas"), Some(&1));
        assert!(parse_lag_overrides(&["siconca".to_string()]).is_err());
        assert!(parse_lag_overrides(&["siconca=x".to_string()]).is_err());
    }

    #[test]
    fn cli_defaults() {
        let args = Args::parse_from(["network-dataset-loader", "demo", "north"]);
        assert_eq!(args.forecast_days, 93);
        assert_eq!(args.lag, 2);
        assert_eq!(args.output_batch_size, 8);
        assert_eq!(args.workers, 2);
        assert_eq!(args.date_policy, DatePolicy::Intersection);
        assert!(!args.pickup);
    }
}
