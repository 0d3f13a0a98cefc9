use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use log::info;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Date format shared with the preprocessing stage that writes the configuration.
pub const DATE_FORMAT: &str = "%Y_%m_%d";

pub fn parse_date(value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| ConfigError::InvalidDate {
        value: value.to_string(),
        format: DATE_FORMAT,
    })
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Serde adapter for lists of `DATE_FORMAT` strings.
pub mod date_list {
    use super::*;

    pub fn serialize<S: Serializer>(dates: &[NaiveDate], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(dates.iter().map(format_date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<NaiveDate>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|s| parse_date(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Hemisphere {
    North,
    South,
}

impl Hemisphere {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hemisphere::North => "north",
            Hemisphere::South => "south",
        }
    }

    pub fn is_north(&self) -> bool {
        matches!(self, Hemisphere::North)
    }

    pub fn is_south(&self) -> bool {
        matches!(self, Hemisphere::South)
    }
}

/// How the per-split forecast dates are combined across source identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DatePolicy {
    /// A date is eligible only when every identity lists it.
    #[default]
    Intersection,
    /// Any identity listing a date makes it eligible; gaps become zero planes.
    Union,
}

/// Numeric type of generated tensors. Shard records carry float32 lists, so
/// that is the only supported working type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dtype {
    Float32,
}

impl Dtype {
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::Float32 => "float32",
        }
    }
}

impl TryFrom<String> for Dtype {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "float32" => Ok(Dtype::Float32),
            _ => Err(ConfigError::UnsupportedDtype(value)),
        }
    }
}

impl From<Dtype> for String {
    fn from(dtype: Dtype) -> Self {
        dtype.name().to_string()
    }
}

/// Forward day offsets sampled by a linear-trend channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrendSteps {
    Offsets(Vec<i64>),
    /// Shorthand for the offsets `0..n`.
    Count(usize),
}

impl Default for TrendSteps {
    fn default() -> Self {
        TrendSteps::Offsets(Vec::new())
    }
}

impl TrendSteps {
    pub fn offsets(&self) -> Vec<i64> {
        match self {
            TrendSteps::Offsets(v) => v.clone(),
            TrendSteps::Count(n) => (0..*n as i64).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitDates {
    #[serde(default, with = "date_list")]
    pub train: Vec<NaiveDate>,
    #[serde(default, with = "date_list")]
    pub val: Vec<NaiveDate>,
    #[serde(default, with = "date_list")]
    pub test: Vec<NaiveDate>,
}

impl SplitDates {
    pub fn get(&self, split: Split) -> &[NaiveDate] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }

    pub fn get_mut(&mut self, split: Split) -> &mut Vec<NaiveDate> {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
            Split::Test => &mut self.test,
        }
    }

    pub fn is_empty(&self) -> bool {
        Split::ALL.iter().all(|s| self.get(*s).is_empty())
    }

    /// Validates an externally supplied override: an object with exactly the
    /// keys `train`, `val` and `test`, each a list of date strings.
    pub fn from_override(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let obj = value.as_object().ok_or_else(|| {
            ConfigError::MalformedOverride(format!("expected an object, got {}", value))
        })?;

        let unexpected: Vec<&String> = obj
            .keys()
            .filter(|k| !Split::ALL.iter().any(|s| s.as_str() == k.as_str()))
            .collect();
        if !unexpected.is_empty() {
            return Err(ConfigError::MalformedOverride(format!(
                "unexpected keys {:?}",
                unexpected
            )));
        }

        let mut out = SplitDates::default();
        for split in Split::ALL {
            let list = obj
                .get(split.as_str())
                .ok_or_else(|| ConfigError::MalformedOverride(format!("missing {}", split)))?
                .as_array()
                .ok_or_else(|| {
                    ConfigError::MalformedOverride(format!("{} needs to be a list", split))
                })?;
            for entry in list {
                let s = entry.as_str().ok_or_else(|| {
                    ConfigError::MalformedOverride(format!("{} entry {} is not a string", split, entry))
                })?;
                out.get_mut(split).push(parse_date(s)?);
            }
        }
        Ok(out)
    }

    pub fn override_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = read_config_file(path)?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_override(&value)
    }
}

/// One data source identity (e.g. `osisaf`, `era5`) in the loader configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub abs: Vec<String>,
    #[serde(default)]
    pub anom: Vec<String>,
    #[serde(default)]
    pub linear_trends: Vec<String>,
    #[serde(default)]
    pub linear_trend_steps: TrendSteps,
    #[serde(default)]
    pub meta: Vec<String>,
    #[serde(default)]
    pub var_files: BTreeMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub dates: SplitDates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub identifier: Option<String>,
    pub sources: BTreeMap<String, SourceConfig>,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    #[serde(default, with = "date_list")]
    pub missing_dates: Vec<NaiveDate>,
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl LoaderConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = read_config_file(path)?;
        info!("Loading configuration {:?}", path);
        let config: LoaderConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shape.len() != 2 || self.shape.iter().any(|d| *d == 0) {
            return Err(ConfigError::InvalidShape(self.shape.clone()));
        }
        Ok(())
    }

    /// `(rows, cols)` of every grid plane.
    pub fn grid_shape(&self) -> (usize, usize) {
        (self.shape[0], self.shape[1])
    }

    /// Sorted, deduplicated forecast dates for `split` under `policy`.
    pub fn split_dates(&self, split: Split, policy: DatePolicy) -> Vec<NaiveDate> {
        let mut per_source = self
            .sources
            .values()
            .map(|s| s.dates.get(split).iter().copied().collect::<BTreeSet<_>>());

        let combined = match policy {
            DatePolicy::Union => per_source.fold(BTreeSet::new(), |mut acc, s| {
                acc.extend(s);
                acc
            }),
            DatePolicy::Intersection => match per_source.next() {
                Some(first) => per_source.fold(first, |acc, s| &acc & &s),
                None => BTreeSet::new(),
            },
        };
        combined.into_iter().collect()
    }
}
