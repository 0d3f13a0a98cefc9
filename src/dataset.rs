//! Backing arrays for generation.
//!
//! Each daily variable lives in `<var>.npy` as a `(time, rows, cols)` float32
//! array, with its time coordinate in `<var>.time.npy` as int64 days since
//! 1970-01-01. Variables are looked up by the name of the channel that owns
//! the file, whatever the file itself is called.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use log::debug;
use memmap2::Mmap;
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use ndarray_npy::{read_npy, ViewNpyExt};

use crate::channels::{Channel, ChannelKind, MetaKind};

/// A per-date lookup over named gridded variables.
pub trait DailySource {
    /// `None` when the variable or the date is absent.
    fn plane(&self, variable: &str, date: NaiveDate) -> Option<ArrayView2<'_, f32>>;
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn date_from_epoch_days(days: i64) -> NaiveDate {
    epoch() + Duration::days(days)
}

pub fn epoch_days(date: NaiveDate) -> i64 {
    (date - epoch()).num_days()
}

/// Path of the time-coordinate sidecar for a backing file.
pub fn time_path(file: &Path) -> PathBuf {
    file.with_extension("time.npy")
}

fn read_time_index(file: &Path, expected: usize) -> Result<HashMap<NaiveDate, usize>> {
    let tpath = time_path(file);
    let times: Array1<i64> =
        read_npy(&tpath).with_context(|| format!("reading time coordinate {:?}", tpath))?;
    if times.len() != expected {
        bail!(
            "time coordinate {:?} has {} entries but {:?} has {} steps",
            tpath,
            times.len(),
            file,
            expected
        );
    }
    Ok(times
        .iter()
        .enumerate()
        .map(|(i, d)| (date_from_epoch_days(*d), i))
        .collect())
}

#[derive(Debug)]
enum Storage {
    Owned(Array3<f32>),
    Mapped(Mmap),
}

/// One daily variable. Opened archives stay memory-mapped, so a plane is
/// only paged in when a sample reads it.
#[derive(Debug)]
pub struct DailyVariable {
    storage: Storage,
    index: HashMap<NaiveDate, usize>,
}

impl DailyVariable {
    pub fn new(data: Array3<f32>, dates: &[NaiveDate]) -> Result<Self> {
        if data.len_of(Axis(0)) != dates.len() {
            bail!(
                "{} dates supplied for {} time steps",
                dates.len(),
                data.len_of(Axis(0))
            );
        }
        let index = dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        Ok(DailyVariable {
            storage: Storage::Owned(data),
            index,
        })
    }

    pub fn open(file: &Path) -> Result<Self> {
        let handle = File::open(file).with_context(|| format!("opening daily variable {:?}", file))?;
        // SAFETY: mapped read-only; archives are not rewritten while a run reads them.
        let mmap = unsafe { Mmap::map(&handle) }
            .with_context(|| format!("mapping daily variable {:?}", file))?;
        let steps = ArrayView3::<f32>::view_npy(&mmap[..])
            .with_context(|| format!("reading daily variable {:?}", file))?
            .len_of(Axis(0));
        let index = read_time_index(file, steps)?;
        Ok(DailyVariable {
            storage: Storage::Mapped(mmap),
            index,
        })
    }

    pub fn plane(&self, date: NaiveDate) -> Option<ArrayView2<'_, f32>> {
        let i = *self.index.get(&date)?;
        let data = match &self.storage {
            Storage::Owned(data) => data.view(),
            Storage::Mapped(mmap) => ArrayView3::<f32>::view_npy(&mmap[..]).ok()?,
        };
        Some(data.index_axis_move(Axis(0), i))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Daily variables keyed by the channel that reads them.
#[derive(Debug, Default)]
pub struct DailyDataset {
    vars: BTreeMap<String, DailyVariable>,
}

impl DailyDataset {
    pub fn open<'a>(channels: impl IntoIterator<Item = &'a Channel>) -> Result<Self> {
        let mut ds = DailyDataset::default();
        for channel in channels {
            let Some(file) = channel.file() else {
                continue;
            };
            let var = DailyVariable::open(file)?;
            debug!("Opened {} with {} time steps from {:?}", channel.name, var.len(), file);
            ds.vars.insert(channel.name.clone(), var);
        }
        Ok(ds)
    }

    pub fn insert(&mut self, name: impl Into<String>, var: DailyVariable) {
        self.vars.insert(name.into(), var);
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(|k| k.as_str())
    }
}

impl DailySource for DailyDataset {
    fn plane(&self, variable: &str, date: NaiveDate) -> Option<ArrayView2<'_, f32>> {
        self.vars.get(variable).and_then(|v| v.plane(date))
    }
}

#[derive(Debug, Clone)]
pub enum StaticField {
    Grid(Array2<f32>),
    /// Scalar per reference-year date.
    Cyclical(HashMap<NaiveDate, f32>),
}

/// Non-temporal inputs keyed by meta channel name.
#[derive(Debug, Clone, Default)]
pub struct StaticFields {
    fields: BTreeMap<String, StaticField>,
}

impl StaticFields {
    pub fn open<'a>(channels: impl IntoIterator<Item = &'a Channel>) -> Result<Self> {
        let mut out = StaticFields::default();
        for channel in channels {
            let ChannelKind::Meta(kind) = channel.kind else {
                continue;
            };
            let Some(file) = channel.file() else {
                continue;
            };
            let field = match kind {
                MetaKind::Field => StaticField::Grid(
                    read_npy(file).with_context(|| format!("reading meta field {:?}", file))?,
                ),
                MetaKind::Cyclical => {
                    let values: Array1<f32> = read_npy(file)
                        .with_context(|| format!("reading cyclical meta {:?}", file))?;
                    let index = read_time_index(file, values.len())?;
                    StaticField::Cyclical(index.into_iter().map(|(d, i)| (d, values[i])).collect())
                }
            };
            out.fields.insert(channel.name.clone(), field);
        }
        Ok(out)
    }

    pub fn insert(&mut self, name: impl Into<String>, field: StaticField) {
        self.fields.insert(name.into(), field);
    }

    pub fn get(&self, name: &str) -> Option<&StaticField> {
        self.fields.get(name)
    }
}
