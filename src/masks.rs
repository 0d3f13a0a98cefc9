use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{Array2, ArrayView2};
use ndarray_npy::read_npy;

/// Supplies the active-cell grid for a calendar month (1 ..= 12).
pub trait MaskProvider {
    fn active_cell_mask(&self, month: u32) -> Result<Array2<bool>>;
}

/// Reads `active_grid_cell_mask_MM.npy` files from one directory.
#[derive(Debug, Clone)]
pub struct NpyMasks {
    dir: PathBuf,
}

impl NpyMasks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        NpyMasks { dir: dir.into() }
    }

    pub fn mask_path(dir: &Path, month: u32) -> PathBuf {
        dir.join(format!("active_grid_cell_mask_{:02}.npy", month))
    }
}

impl MaskProvider for NpyMasks {
    fn active_cell_mask(&self, month: u32) -> Result<Array2<bool>> {
        let path = Self::mask_path(&self.dir, month);
        read_npy(&path).with_context(|| format!("reading active cell mask {:?}", path))
    }
}

/// Twelve monthly masks already cast to the working dtype. Built once and
/// shared read-only by every batch task.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskStack {
    months: Vec<Array2<f32>>,
}

impl MaskStack {
    pub fn load(provider: &dyn MaskProvider, shape: (usize, usize)) -> Result<Self> {
        let months = (1..=12)
            .map(|month| provider.active_cell_mask(month))
            .collect::<Result<Vec<_>>>()?;
        Self::from_masks(months, shape)
    }

    pub fn from_masks(masks: Vec<Array2<bool>>, shape: (usize, usize)) -> Result<Self> {
        if masks.len() != 12 {
            bail!("expected 12 monthly masks, got {}", masks.len());
        }
        let mut months = Vec::with_capacity(12);
        for (i, mask) in masks.into_iter().enumerate() {
            if mask.dim() != shape {
                bail!(
                    "mask for month {} has shape {:?}, expected {:?}",
                    i + 1,
                    mask.dim(),
                    shape
                );
            }
            months.push(mask.mapv(|v| if v { 1.0 } else { 0.0 }));
        }
        Ok(MaskStack { months })
    }

    /// Mask for calendar month `month` (1 ..= 12).
    pub fn month(&self, month: u32) -> ArrayView2<'_, f32> {
        self.months[(month as usize).clamp(1, 12) - 1].view()
    }
}
