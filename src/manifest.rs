//! `dataset_config.<identifier>.json`, the description of a generated
//! dataset read back by training and inference.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::{date_list, DatePolicy, Dtype, Split};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCounts {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

impl SplitCounts {
    pub fn get(&self, split: Split) -> usize {
        match split {
            Split::Train => self.train,
            Split::Val => self.val,
            Split::Test => self.test,
        }
    }

    pub fn add(&mut self, split: Split, n: usize) {
        match split {
            Split::Train => self.train += n,
            Split::Val => self.val += n,
            Split::Test => self.test += n,
        }
    }
}

/// Where the shards live, or `false` when no cache directory was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoaderPath {
    Materialised(PathBuf),
    NotMaterialised(bool),
}

impl LoaderPath {
    pub fn path(&self) -> Option<&Path> {
        match self {
            LoaderPath::Materialised(p) => Some(p.as_path()),
            LoaderPath::NotMaterialised(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub identifier: String,
    pub implementation: String,
    /// One label per input plane, in column order.
    pub channels: Vec<String>,
    pub counts: SplitCounts,
    pub dtype: Dtype,
    pub loader_config: PathBuf,
    #[serde(with = "date_list")]
    pub missing_dates: Vec<NaiveDate>,
    pub n_forecast_days: usize,
    pub north: bool,
    pub num_channels: usize,
    pub shape: Vec<usize>,
    pub south: bool,
    pub loader_path: LoaderPath,
    pub loss_weight_days: bool,
    pub output_batch_size: usize,
    pub var_lag: usize,
    pub var_lag_override: BTreeMap<String, usize>,
    #[serde(default)]
    pub date_policy: DatePolicy,
    #[serde(default)]
    pub target: Option<String>,
}

impl DatasetManifest {
    pub fn path_for(dir: &Path, identifier: &str) -> PathBuf {
        dir.join(format!("dataset_config.{}.json", identifier))
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating dataset config directory {:?}", dir))?;
        let path = Self::path_for(dir, &self.identifier);
        info!("Writing configuration to {:?}", path);
        let file = File::create(&path).with_context(|| format!("creating {:?}", path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("writing dataset config {:?}", path))?;
        writer.flush()?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading dataset config {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing dataset config {:?}", path))
    }

    pub fn grid_shape(&self) -> Option<(usize, usize)> {
        match self.shape.as_slice() {
            [r, c] => Some((*r, *c)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(loader_path: LoaderPath) -> DatasetManifest {
        DatasetManifest {
            identifier: "demo".to_string(),
            implementation: "DataLoader".to_string(),
            channels: vec!["sic_abs_1".into(), "sic_abs_2".into(), "land_1".into()],
            counts: SplitCounts {
                train: 1,
                val: 0,
                test: 0,
            },
            dtype: Dtype::Float32,
            loader_config: PathBuf::from("loader.demo.json"),
            missing_dates: vec![NaiveDate::from_ymd_opt(2020, 1, 7).unwrap()],
            n_forecast_days: 3,
            north: true,
            num_channels: 3,
            shape: vec![10, 10],
            south: false,
            loader_path,
            loss_weight_days: true,
            output_batch_size: 8,
            var_lag: 2,
            var_lag_override: BTreeMap::new(),
            date_policy: DatePolicy::Intersection,
            target: Some("sic_abs".to_string()),
        }
    }

    #[test]
    fn absent_cache_serialises_as_false() {
        let value = serde_json::to_value(manifest(LoaderPath::NotMaterialised(false))).unwrap();
        assert_eq!(value["loader_path"], serde_json::json!(false));
        assert_eq!(value["dtype"], "float32");
        assert_eq!(value["missing_dates"], serde_json::json!(["2020_01_07"]));
        assert_eq!(value["counts"]["train"], 1);
    }

    #[test]
    fn written_manifest_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let original = manifest(LoaderPath::Materialised(PathBuf::from("network_datasets/demo")));
        let path = original.write(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("dataset_config.demo.json"));

        let loaded = DatasetManifest::load(&path).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.loader_path.path(), Some(Path::new("network_datasets/demo")));
        assert_eq!(loaded.grid_shape(), Some((10, 10)));
    }
}
