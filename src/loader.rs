//! Orchestration of a generation run: per-split date selection, batching,
//! bounded submission to the worker pool, pickup of existing shards and the
//! final dataset manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

use crate::batch::{generate_and_write, BatchData, BatchJob, BatchOutput};
use crate::channels::ChannelLayout;
use crate::config::{DatePolicy, Hemisphere, LoaderConfig, Split, SplitDates};
use crate::error::ConfigError;
use crate::manifest::{DatasetManifest, LoaderPath, SplitCounts};
use crate::masks::{MaskProvider, MaskStack};
use crate::pool::{Pending, WorkerPool};
use crate::record::count_records;
use crate::sample::{generate_sample, Sample, SampleParams};

pub const IMPLEMENTATION: &str = "DataLoader";

/// Construction parameters of a [`DataLoader`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderOptions {
    pub configuration_path: PathBuf,
    pub identifier: String,
    pub hemisphere: Hemisphere,
    pub var_lag: usize,
    pub var_lag_override: BTreeMap<String, usize>,
    /// Directory receiving `dataset_config.<identifier>.json`.
    pub dataset_config_path: PathBuf,
    /// Root of the shard tree; shards go under `<path>/<identifier>/<hemisphere>/<split>`.
    pub path: PathBuf,
    pub dry: bool,
    pub futures_per_worker: usize,
    pub generate_workers: usize,
    pub loss_weight_days: bool,
    pub n_forecast_days: usize,
    pub output_batch_size: usize,
    pub date_policy: DatePolicy,
    pub target: String,
}

impl LoaderOptions {
    pub fn new(configuration_path: impl Into<PathBuf>, identifier: impl Into<String>, var_lag: usize) -> Self {
        LoaderOptions {
            configuration_path: configuration_path.into(),
            identifier: identifier.into(),
            hemisphere: Hemisphere::North,
            var_lag,
            var_lag_override: BTreeMap::new(),
            dataset_config_path: PathBuf::from("."),
            path: PathBuf::from("network_datasets"),
            dry: false,
            futures_per_worker: 2,
            generate_workers: 8,
            loss_weight_days: true,
            n_forecast_days: 93,
            output_batch_size: 32,
            date_policy: DatePolicy::default(),
            target: "siconca_abs".to_string(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.output_batch_size == 0 {
            return Err(ConfigError::Zero("output batch size"));
        }
        if self.generate_workers == 0 {
            return Err(ConfigError::Zero("generate workers"));
        }
        if self.futures_per_worker == 0 {
            return Err(ConfigError::Zero("futures per worker"));
        }
        Ok(())
    }

    /// Most batch jobs allowed in flight at once.
    pub fn in_flight_cap(&self) -> usize {
        self.generate_workers * self.futures_per_worker
    }
}

#[derive(Debug, Clone)]
pub struct GenerationSummary {
    pub counts: SplitCounts,
    pub times: Vec<Duration>,
    pub manifest_path: PathBuf,
}

impl GenerationSummary {
    pub fn average_time(&self) -> Option<Duration> {
        if self.times.is_empty() {
            return None;
        }
        Some(self.times.iter().sum::<Duration>() / self.times.len() as u32)
    }
}

pub struct DataLoader {
    options: LoaderOptions,
    config: LoaderConfig,
    layout: Arc<ChannelLayout>,
    masks: Arc<MaskStack>,
    missing_dates: Arc<BTreeSet<NaiveDate>>,
}

impl DataLoader {
    pub fn new(options: LoaderOptions, masks: &dyn MaskProvider) -> Result<Self> {
        let config = LoaderConfig::load(&options.configuration_path)?;
        let mask_stack = MaskStack::load(masks, config.grid_shape())
            .context("loading active cell masks")?;
        Self::from_parts(options, config, mask_stack)
    }

    pub fn from_parts(options: LoaderOptions, config: LoaderConfig, masks: MaskStack) -> Result<Self> {
        options.validate()?;
        config.validate()?;
        let layout = ChannelLayout::build(&config, options.var_lag, &options.var_lag_override)?;

        match layout.get(&options.target) {
            Some(c) if c.is_lagged() => {}
            _ => warn!(
                "Target variable {} is not a lagged channel, targets will be zero-filled",
                options.target
            ),
        }
        info!(
            "Loader {} built with {} channels over {} planes",
            options.identifier,
            layout.channels().len(),
            layout.num_channels()
        );

        let missing_dates = config.missing_dates.iter().copied().collect();
        Ok(DataLoader {
            options,
            config,
            layout: Arc::new(layout),
            masks: Arc::new(masks),
            missing_dates: Arc::new(missing_dates),
        })
    }

    /// Rebuilds the loader that produced a dataset from its manifest, for
    /// inference-time sample generation.
    pub fn from_manifest(manifest_path: &Path, masks: &dyn MaskProvider) -> Result<Self> {
        let manifest = DatasetManifest::load(manifest_path)?;
        let mut options = LoaderOptions::new(
            manifest.loader_config.clone(),
            manifest.identifier.clone(),
            manifest.var_lag,
        );
        options.hemisphere = if manifest.south {
            Hemisphere::South
        } else {
            Hemisphere::North
        };
        options.var_lag_override = manifest.var_lag_override.clone();
        options.dataset_config_path = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if let Some(dataset_dir) = manifest.loader_path.path().and_then(Path::parent) {
            options.path = dataset_dir.to_path_buf();
        }
        options.loss_weight_days = manifest.loss_weight_days;
        options.n_forecast_days = manifest.n_forecast_days;
        options.output_batch_size = manifest.output_batch_size;
        options.date_policy = manifest.date_policy;
        if let Some(target) = &manifest.target {
            options.target = target.clone();
        }

        let loader = DataLoader::new(options, masks)?;
        if loader.num_channels() != manifest.num_channels {
            return Err(anyhow!(
                "configuration {:?} yields {} channels but the dataset was built with {}",
                manifest.loader_config,
                loader.num_channels(),
                manifest.num_channels
            ));
        }
        Ok(loader)
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn num_channels(&self) -> usize {
        self.layout.num_channels()
    }

    /// `<path>/<identifier>`
    pub fn dataset_dir(&self) -> PathBuf {
        self.options.path.join(&self.options.identifier)
    }

    pub fn split_dir(&self, split: Split) -> PathBuf {
        self.dataset_dir()
            .join(self.options.hemisphere.as_str())
            .join(split.as_str())
    }

    pub fn shard_path(&self, split: Split, index: usize) -> PathBuf {
        self.split_dir(split).join(format!("{:08}.tfrecord", index))
    }

    pub fn sample_params(&self, data_check: bool) -> SampleParams {
        SampleParams {
            shape: self.config.grid_shape(),
            dtype: self.config.dtype,
            n_forecast_days: self.options.n_forecast_days,
            loss_weight_days: self.options.loss_weight_days,
            target: self.options.target.clone(),
            data_check,
        }
    }

    /// Sorted forecast dates for `split`, restricted to the override when given.
    pub fn forecast_dates(&self, split: Split, dates_override: Option<&SplitDates>) -> Vec<NaiveDate> {
        let dates = self.config.split_dates(split, self.options.date_policy);
        match dates_override {
            Some(over) => {
                info!("{} available {} dates", dates.len(), split);
                let wanted: BTreeSet<NaiveDate> = over.get(split).iter().copied().collect();
                dates.into_iter().filter(|d| wanted.contains(d)).collect()
            }
            None => dates,
        }
    }

    /// Pool sized by `generate_workers`, the size [`DataLoader::generate`] expects.
    pub fn worker_pool(&self) -> Result<WorkerPool> {
        WorkerPool::new(self.options.generate_workers)
    }

    /// Generates every split into shards and writes the manifest.
    pub fn generate(
        &self,
        pool: &WorkerPool,
        dates_override: Option<&SplitDates>,
        pickup: bool,
    ) -> Result<GenerationSummary> {
        if pool.workers() != self.options.generate_workers {
            bail!(
                "worker pool has {} threads but the loader is configured for {} workers",
                pool.workers(),
                self.options.generate_workers
            );
        }
        let cap = self.options.in_flight_cap();
        let mut counts = SplitCounts::default();
        let mut times: Vec<Duration> = Vec::new();

        let data = Arc::new(BatchData::open(&self.layout)?);

        for split in Split::ALL {
            let forecast_dates = self.forecast_dates(split, dates_override);
            let split_dir = self.split_dir(split);
            fs::create_dir_all(&split_dir)
                .with_context(|| format!("creating output directory {:?}", split_dir))?;

            let n_batches = forecast_dates.len().div_ceil(self.options.output_batch_size);
            info!(
                "{} {} dates to process in {} batches, generating cache data.",
                forecast_dates.len(),
                split,
                n_batches
            );

            let pb = progress_bar(n_batches, split);
            let mut in_flight: Vec<Pending<BatchOutput>> = Vec::new();

            for (index, dates) in forecast_dates
                .chunks(self.options.output_batch_size)
                .enumerate()
            {
                let path = self.shard_path(split, index);
                if pickup && path.exists() {
                    let existing = count_records(&path).with_context(|| {
                        format!("existing shard {:?} is unreadable, delete it and rerun", path)
                    })?;
                    warn!("Skipping {:?} on pickup run ({} samples already present)", path, existing);
                    counts.add(split, existing);
                    pb.inc(1);
                    continue;
                }

                let job = BatchJob {
                    split,
                    index,
                    path,
                    layout: Arc::clone(&self.layout),
                    data: Arc::clone(&data),
                    dates: dates.to_vec(),
                    params: self.sample_params(true),
                    missing_dates: Arc::clone(&self.missing_dates),
                    dry: self.options.dry,
                };
                let masks = Arc::clone(&self.masks);
                in_flight.push(pool.submit(
                    format!("{} batch #{}", split, index),
                    move || generate_and_write(&job, &masks),
                ));

                // Keeps the number of outstanding jobs bounded.
                if in_flight.len() >= cap {
                    gather_batches(pool, std::mem::take(&mut in_flight), split, &mut counts, &mut times, &pb)?;
                }
            }

            gather_batches(pool, in_flight, split, &mut counts, &mut times, &pb)?;
            pb.finish_with_message(format!("{} done", split));
            info!("[{}] => {} samples", split, counts.get(split));
        }

        let manifest_path = self.write_dataset_config(counts, true)?;
        let summary = GenerationSummary {
            counts,
            times,
            manifest_path,
        };
        if let Some(avg) = summary.average_time() {
            info!("Average sample generation time: {:?}", avg);
        }
        Ok(summary)
    }

    /// Writes the manifest with the counts generation would produce, without
    /// generating any data.
    pub fn write_dataset_config_only(&self) -> Result<PathBuf> {
        info!("Writing dataset configuration without data generation");
        let mut counts = SplitCounts::default();
        for split in Split::ALL {
            let n = self.forecast_dates(split, None).len();
            info!("{} {} dates in total, NOT generating cache data.", n, split);
            counts.add(split, n);
        }
        self.write_dataset_config(counts, false)
    }

    /// Builds one sample without the batch machinery. No data check is applied.
    pub fn generate_sample(&self, date: NaiveDate) -> Result<Sample> {
        self.generate_samples(&[date])?
            .pop()
            .ok_or_else(|| anyhow!("no sample generated for {}", date))
    }

    /// Builds samples for several dates, opening the backing data once.
    pub fn generate_samples(&self, dates: &[NaiveDate]) -> Result<Vec<Sample>> {
        let data = BatchData::open(&self.layout)?;
        let inputs = data.inputs(&self.layout, &self.masks, &self.missing_dates);
        let params = self.sample_params(false);
        dates
            .iter()
            .map(|date| {
                generate_sample(*date, &inputs, &params)
                    .with_context(|| format!("generating sample for {}", date))
            })
            .collect()
    }

    pub fn manifest(&self, counts: SplitCounts, network_dataset: bool) -> DatasetManifest {
        let (rows, cols) = self.config.grid_shape();
        DatasetManifest {
            identifier: self.options.identifier.clone(),
            implementation: IMPLEMENTATION.to_string(),
            channels: self.layout.labels(),
            counts,
            dtype: self.config.dtype,
            loader_config: self.options.configuration_path.clone(),
            missing_dates: self.config.missing_dates.clone(),
            n_forecast_days: self.options.n_forecast_days,
            north: self.options.hemisphere.is_north(),
            num_channels: self.num_channels(),
            shape: vec![rows, cols],
            south: self.options.hemisphere.is_south(),
            loader_path: if network_dataset {
                LoaderPath::Materialised(self.dataset_dir())
            } else {
                LoaderPath::NotMaterialised(false)
            },
            loss_weight_days: self.options.loss_weight_days,
            output_batch_size: self.options.output_batch_size,
            var_lag: self.options.var_lag,
            var_lag_override: self.options.var_lag_override.clone(),
            date_policy: self.options.date_policy,
            target: Some(self.options.target.clone()),
        }
    }

    fn write_dataset_config(&self, counts: SplitCounts, network_dataset: bool) -> Result<PathBuf> {
        self.manifest(counts, network_dataset)
            .write(&self.options.dataset_config_path)
    }
}

fn progress_bar(len: usize, split: Split) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}/{len:3} {msg}")
            .map(|s| s.progress_chars("##-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message(split.to_string());
    pb
}

fn gather_batches(
    pool: &WorkerPool,
    in_flight: Vec<Pending<BatchOutput>>,
    split: Split,
    counts: &mut SplitCounts,
    times: &mut Vec<Duration>,
    pb: &ProgressBar,
) -> Result<()> {
    if in_flight.is_empty() {
        return Ok(());
    }
    for output in pool.gather(in_flight)? {
        info!("Finished output {:?}", output.path);
        counts.add(split, output.count);
        times.extend(output.times);
        pb.inc(1);
    }
    Ok(())
}
