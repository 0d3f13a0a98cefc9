use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{debug, info, warn};

use crate::channels::ChannelLayout;
use crate::config::Split;
use crate::dataset::{DailyDataset, StaticFields};
use crate::error::SampleError;
use crate::masks::MaskStack;
use crate::record::ShardWriter;
use crate::sample::{generate_sample, SampleInputs, SampleParams};

/// Backing data of a run. Opened once and shared read-only by every batch.
#[derive(Debug)]
pub struct BatchData {
    pub lagged: DailyDataset,
    pub trends: DailyDataset,
    pub statics: StaticFields,
}

impl BatchData {
    pub fn open(layout: &ChannelLayout) -> Result<Self> {
        let lagged = DailyDataset::open(layout.channels().iter().filter(|c| c.is_lagged()))
            .context("opening lagged variable dataset")?;
        let trends = DailyDataset::open(layout.channels().iter().filter(|c| c.is_trend()))
            .context("opening linear trend dataset")?;
        let statics = StaticFields::open(layout.meta_channels()).context("opening meta fields")?;
        Ok(BatchData {
            lagged,
            trends,
            statics,
        })
    }

    pub fn inputs<'a>(
        &'a self,
        layout: &'a ChannelLayout,
        masks: &'a MaskStack,
        missing_dates: &'a BTreeSet<NaiveDate>,
    ) -> SampleInputs<'a> {
        SampleInputs {
            layout,
            lagged: &self.lagged,
            trends: &self.trends,
            statics: &self.statics,
            masks,
            missing_dates,
        }
    }
}

/// One shard's worth of work. Shared state is held through `Arc`s.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub split: Split,
    pub index: usize,
    pub path: PathBuf,
    pub layout: Arc<ChannelLayout>,
    pub data: Arc<BatchData>,
    pub dates: Vec<NaiveDate>,
    pub params: SampleParams,
    pub missing_dates: Arc<BTreeSet<NaiveDate>>,
    pub dry: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    pub path: PathBuf,
    pub count: usize,
    pub times: Vec<Duration>,
}

/// Generates every date of the job and appends the samples to its shard.
/// Skipped samples are left out; the shard is closed whatever happens.
pub fn generate_and_write(job: &BatchJob, masks: &MaskStack) -> Result<BatchOutput> {
    let inputs = job.data.inputs(&job.layout, masks, &job.missing_dates);

    let mut writer = if job.dry {
        None
    } else {
        Some(ShardWriter::create(&job.path)?)
    };
    let outcome = write_dates(job, &inputs, writer.as_mut());
    let finished = writer.map(|w| w.finish()).transpose();
    let (count, times) = outcome?;
    finished?;

    info!(
        "[{} batch #{}] => {} of {} samples generated{}",
        job.split,
        job.index,
        count,
        job.dates.len(),
        if job.dry { " (dry run)" } else { "" }
    );
    Ok(BatchOutput {
        path: job.path.clone(),
        count,
        times,
    })
}

fn write_dates(
    job: &BatchJob,
    inputs: &SampleInputs<'_>,
    mut writer: Option<&mut ShardWriter>,
) -> Result<(usize, Vec<Duration>)> {
    let mut count = 0;
    let mut times = Vec::with_capacity(job.dates.len());

    for date in &job.dates {
        let start = Instant::now();
        match generate_sample(*date, inputs, &job.params) {
            Ok(sample) => {
                if let Some(w) = writer.as_deref_mut() {
                    w.write_sample(&sample)?;
                }
                count += 1;
            }
            Err(SampleError::Skipped { date, reason }) => {
                warn!("[{} batch #{}] => skipping {}: {}", job.split, job.index, date, reason);
                continue;
            }
            Err(SampleError::Failed(e)) => {
                return Err(e.context(format!("generating sample for {}", date)));
            }
        }
        let elapsed = start.elapsed();
        debug!("Time taken to produce {}: {:?}", date, elapsed);
        times.push(elapsed);
    }
    Ok((count, times))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dtype, LoaderConfig};
    use crate::dataset::{epoch_days, time_path};
    use crate::record::{count_records, ShardReader};
    use ndarray::{Array1, Array2, Array3};
    use ndarray_npy::write_npy;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// `siconca_abs.npy` over January 2020 with day 10 carrying a NaN at (0, 0).
    fn write_siconca(dir: &Path) -> PathBuf {
        let file = dir.join("siconca_abs.npy");
        let mut data = Array3::from_shape_fn((31, 3, 3), |(t, _, _)| t as f32 / 100.0);
        data[(9, 0, 0)] = f32::NAN;
        write_npy(&file, &data).unwrap();
        let times: Array1<i64> = (0..31).map(|n| epoch_days(d(2020, 1, 1)) + n).collect();
        write_npy(time_path(&file), &times).unwrap();
        file
    }

    fn job(dir: &Path, dates: Vec<NaiveDate>, dry: bool) -> BatchJob {
        let file = write_siconca(dir);
        let config: LoaderConfig = serde_json::from_value(json!({
            "sources": {"osisaf": {"abs": ["siconca"], "var_files": {"siconca": [file]}}},
            "dtype": "float32",
            "shape": [3, 3]
        }))
        .unwrap();
        let layout = ChannelLayout::build(&config, 1, &BTreeMap::new()).unwrap();
        BatchJob {
            split: Split::Train,
            index: 0,
            path: dir.join("00000000.tfrecord"),
            data: Arc::new(BatchData::open(&layout).unwrap()),
            layout: Arc::new(layout),
            dates,
            params: SampleParams {
                shape: (3, 3),
                dtype: Dtype::Float32,
                n_forecast_days: 1,
                loss_weight_days: false,
                target: "siconca_abs".to_string(),
                data_check: true,
            },
            missing_dates: Arc::new(BTreeSet::new()),
            dry,
        }
    }

    fn masks() -> MaskStack {
        MaskStack::from_masks(vec![Array2::from_elem((3, 3), true); 12], (3, 3)).unwrap()
    }

    #[test]
    fn skipped_dates_are_left_out_of_the_shard() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), vec![d(2020, 1, 9), d(2020, 1, 10), d(2020, 1, 11)], false);

        let out = generate_and_write(&job, &masks()).unwrap();
        assert_eq!(out.count, 2);
        assert_eq!(out.times.len(), 2);
        assert_eq!(out.path, job.path);
        assert_eq!(count_records(&job.path).unwrap(), 2);

        let mut reader = ShardReader::open(&job.path).unwrap();
        let first = reader.read_example().unwrap().unwrap();
        assert_eq!(first.floats("x").unwrap(), &[0.08f32; 9]);
        let second = reader.read_example().unwrap().unwrap();
        assert_eq!(second.floats("y").unwrap(), &[0.10f32; 9]);
    }

    #[test]
    fn dry_run_generates_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), vec![d(2020, 1, 2), d(2020, 1, 3)], true);

        let out = generate_and_write(&job, &masks()).unwrap();
        assert_eq!(out.count, 2);
        assert_eq!(out.times.len(), 2);
        assert!(!job.path.exists());
    }
}
