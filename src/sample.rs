//! Assembly of one `(x, y, sample_weights)` triple for a forecast date.

use std::collections::BTreeSet;

use anyhow::anyhow;
use chrono::{Datelike, Duration, NaiveDate};
use ndarray::{stack, Array2, Array3, Array4, ArrayView2, Axis};

use crate::channels::{ChannelKind, ChannelLayout, MetaKind};
use crate::config::Dtype;
use crate::dataset::{DailySource, StaticField, StaticFields};
use crate::error::SampleError;
use crate::masks::MaskStack;

/// Total weight mass per leadtime when loss weighting is on. Scales March
/// (fewest active cells) by 1 and September by roughly 1.77.
pub const LOSS_WEIGHT_REFERENCE: f32 = 33928.0;

/// Leap year used to look up cyclical meta values by month and day.
pub const CYCLICAL_REFERENCE_YEAR: i32 = 2012;

#[derive(Debug, Clone, PartialEq)]
pub struct SampleParams {
    pub shape: (usize, usize),
    pub dtype: Dtype,
    pub n_forecast_days: usize,
    pub loss_weight_days: bool,
    /// Daily variable observed at each leadtime to build `y`.
    pub target: String,
    /// Skip samples whose target is NaN where the weight is non-zero.
    pub data_check: bool,
}

/// Everything a sample reads from. All borrowed, nothing is mutated.
#[derive(Clone, Copy)]
pub struct SampleInputs<'a> {
    pub layout: &'a ChannelLayout,
    pub lagged: &'a dyn DailySource,
    pub trends: &'a dyn DailySource,
    pub statics: &'a StaticFields,
    pub masks: &'a MaskStack,
    pub missing_dates: &'a BTreeSet<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// `(rows, cols, num_channels)`
    pub x: Array3<f32>,
    /// `(rows, cols, n_forecast_days, 1)`
    pub y: Array4<f32>,
    /// Same shape as `y`.
    pub sample_weights: Array4<f32>,
}

pub fn generate_sample(
    forecast_date: NaiveDate,
    inputs: &SampleInputs<'_>,
    params: &SampleParams,
) -> Result<Sample, SampleError> {
    let shape = params.shape;
    let leadtimes: Vec<NaiveDate> = (0..params.n_forecast_days)
        .map(|n| forecast_date + Duration::days(n as i64))
        .collect();

    let mut targets = Vec::with_capacity(leadtimes.len());
    let mut weights = Vec::with_capacity(leadtimes.len());
    for day in &leadtimes {
        match inputs.lagged.plane(&params.target, *day) {
            Some(plane) => {
                targets.push(lookup(Some(plane), shape, &params.target)?);
                weights.push(leadtime_weight(*day, inputs, params));
            }
            // No observation: the zero target must not carry any loss.
            None => {
                targets.push(Array2::zeros(shape));
                weights.push(Array2::zeros(shape));
            }
        }
    }
    let y = stack_planes(&targets, shape)?.insert_axis(Axis(3));
    let sample_weights = stack_planes(&weights, shape)?.insert_axis(Axis(3));

    let mut planes: Vec<Array2<f32>> = Vec::with_capacity(inputs.layout.num_channels());
    for channel in inputs.layout.channels() {
        match &channel.kind {
            ChannelKind::Lagged(_) => {
                for n in 0..channel.width {
                    let day = forecast_date - Duration::days(n as i64);
                    planes.push(lookup(inputs.lagged.plane(&channel.name, day), shape, &channel.name)?);
                }
            }
            ChannelKind::LinearTrend { steps } => {
                let offsets: Vec<i64> = if steps.is_empty() {
                    (0..channel.width as i64).collect()
                } else {
                    steps.clone()
                };
                for offset in offsets {
                    let day = forecast_date + Duration::days(offset);
                    planes.push(lookup(inputs.trends.plane(&channel.name, day), shape, &channel.name)?);
                }
            }
            ChannelKind::Meta(kind) => {
                planes.push(meta_plane(&channel.name, *kind, forecast_date, inputs.statics, shape)?);
            }
        }
    }
    let mut x = stack_planes(&planes, shape)?;
    x.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });

    if params.data_check
        && y
            .iter()
            .zip(sample_weights.iter())
            .any(|(t, w)| t.is_nan() && *w != 0.0)
    {
        return Err(SampleError::Skipped {
            date: forecast_date,
            reason: "NaNs in output with non-zero weights".to_string(),
        });
    }

    Ok(Sample {
        x,
        y,
        sample_weights,
    })
}

fn leadtime_weight(day: NaiveDate, inputs: &SampleInputs<'_>, params: &SampleParams) -> Array2<f32> {
    if inputs.missing_dates.contains(&day) {
        return Array2::zeros(params.shape);
    }
    // Zero loss outside the active grid cells of that month.
    let mut weight = inputs.masks.month(day.month()).to_owned();
    if params.loss_weight_days {
        let total = weight.sum();
        if total > 0.0 {
            weight *= LOSS_WEIGHT_REFERENCE / total;
        }
    }
    weight
}

fn meta_plane(
    name: &str,
    kind: MetaKind,
    forecast_date: NaiveDate,
    statics: &StaticFields,
    shape: (usize, usize),
) -> Result<Array2<f32>, SampleError> {
    match (kind, statics.get(name)) {
        (MetaKind::Cyclical, Some(StaticField::Cyclical(values))) => {
            let value = NaiveDate::from_ymd_opt(
                CYCLICAL_REFERENCE_YEAR,
                forecast_date.month(),
                forecast_date.day(),
            )
            .and_then(|ref_date| values.get(&ref_date).copied())
            .unwrap_or(0.0);
            Ok(Array2::from_elem(shape, value))
        }
        (MetaKind::Field, Some(StaticField::Grid(grid))) => lookup(Some(grid.view()), shape, name),
        _ => Ok(Array2::zeros(shape)),
    }
}

/// Owned copy of a looked-up plane, or zeros when the lookup missed.
fn lookup(
    plane: Option<ArrayView2<'_, f32>>,
    shape: (usize, usize),
    name: &str,
) -> Result<Array2<f32>, SampleError> {
    match plane {
        Some(p) if p.dim() == shape => Ok(p.to_owned()),
        Some(p) => Err(SampleError::Failed(anyhow!(
            "{} plane has shape {:?}, expected {:?}",
            name,
            p.dim(),
            shape
        ))),
        None => Ok(Array2::zeros(shape)),
    }
}

fn stack_planes(planes: &[Array2<f32>], shape: (usize, usize)) -> Result<Array3<f32>, SampleError> {
    if planes.is_empty() {
        return Ok(Array3::zeros((shape.0, shape.1, 0)));
    }
    let views: Vec<ArrayView2<'_, f32>> = planes.iter().map(|p| p.view()).collect();
    stack(Axis(2), &views).map_err(|e| SampleError::Failed(anyhow!("stacking planes: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DailyDataset, DailyVariable};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    const SHAPE: (usize, usize) = (4, 5);

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    struct Fixture {
        layout: ChannelLayout,
        lagged: DailyDataset,
        trends: DailyDataset,
        statics: StaticFields,
        masks: MaskStack,
        missing: BTreeSet<NaiveDate>,
    }

    impl Fixture {
        fn inputs(&self) -> SampleInputs<'_> {
            SampleInputs {
                layout: &self.layout,
                lagged: &self.lagged,
                trends: &self.trends,
                statics: &self.statics,
                masks: &self.masks,
                missing_dates: &self.missing,
            }
        }
    }

    fn params() -> SampleParams {
        SampleParams {
            shape: SHAPE,
            dtype: Dtype::Float32,
            n_forecast_days: 3,
            loss_weight_days: false,
            target: "siconca_abs".to_string(),
            data_check: true,
        }
    }

    /// Daily series where every cell of day `n` (from 2020-01-01) equals `base + n`.
    fn series(base: f32, days: usize) -> DailyVariable {
        let dates: Vec<NaiveDate> = (0..days)
            .map(|n| d(2020, 1, 1) + Duration::days(n as i64))
            .collect();
        let data = Array3::from_shape_fn((days, SHAPE.0, SHAPE.1), |(t, _, _)| base + t as f32);
        DailyVariable::new(data, &dates).unwrap()
    }

    fn fixture() -> Fixture {
        let config = serde_json::from_value(json!({
            "sources": {
                "osisaf": {
                    "abs": ["siconca"],
                    "linear_trends": ["siconca"],
                    "linear_trend_steps": [0, 2],
                    "meta": ["cos", "land"],
                    "var_files": {
                        "siconca": ["/d/siconca_abs.npy", "/d/siconca_linear_trend.npy"],
                        "cos": ["/d/cos.npy"],
                        "land": ["/d/land.npy"]
                    }
                }
            },
            "dtype": "float32",
            "shape": [4, 5]
        }))
        .unwrap();
        let layout = ChannelLayout::build(&config, 2, &BTreeMap::new()).unwrap();

        let mut lagged = DailyDataset::default();
        lagged.insert("siconca_abs", series(0.0, 40));
        let mut trends = DailyDataset::default();
        trends.insert("siconca_linear_trend", series(1000.0, 40));

        let mut statics = StaticFields::default();
        let mut cycle = HashMap::new();
        cycle.insert(d(2012, 1, 10), 0.5f32);
        statics.insert("cos", StaticField::Cyclical(cycle));
        statics.insert(
            "land",
            StaticField::Grid(Array2::from_shape_fn(SHAPE, |(r, c)| (r * 10 + c) as f32)),
        );

        let masks = MaskStack::from_masks(
            (1..=12)
                .map(|m| Array2::from_shape_fn(SHAPE, |(r, _)| r < 1 + (m % 3)))
                .collect(),
            SHAPE,
        )
        .unwrap();

        Fixture {
            layout,
            lagged,
            trends,
            statics,
            masks,
            missing: BTreeSet::new(),
        }
    }

    #[test]
    fn assembles_channels_in_layout_order() {
        let fx = fixture();
        let sample = generate_sample(d(2020, 1, 10), &fx.inputs(), &params()).unwrap();

        assert_eq!(sample.x.dim(), (4, 5, 6));
        assert_eq!(sample.y.dim(), (4, 5, 3, 1));
        assert_eq!(sample.sample_weights.dim(), (4, 5, 3, 1));

        // siconca_abs_1, siconca_abs_2: day 9 and day 8 (0-based from Jan 1)
        assert_eq!(sample.x[(0, 0, 0)], 9.0);
        assert_eq!(sample.x[(0, 0, 1)], 8.0);
        // linear trend steps 0 and 2 forward
        assert_eq!(sample.x[(2, 3, 2)], 1009.0);
        assert_eq!(sample.x[(2, 3, 3)], 1011.0);
        // cos broadcast, then land field
        assert!(sample.x.index_axis(Axis(2), 4).iter().all(|v| *v == 0.5));
        assert_eq!(sample.x[(3, 4, 5)], 34.0);

        // target leadtimes go forward from the forecast date
        assert_eq!(sample.y[(1, 1, 0, 0)], 9.0);
        assert_eq!(sample.y[(1, 1, 2, 0)], 11.0);
    }

    #[test]
    fn generation_is_pure() {
        let fx = fixture();
        let a = generate_sample(d(2020, 1, 20), &fx.inputs(), &params()).unwrap();
        let b = generate_sample(d(2020, 1, 20), &fx.inputs(), &params()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_dates_have_zero_weight() {
        let mut fx = fixture();
        fx.missing.insert(d(2020, 1, 11));
        let mut p = params();
        p.loss_weight_days = true;
        let sample = generate_sample(d(2020, 1, 10), &fx.inputs(), &p).unwrap();

        let w = sample.sample_weights.index_axis(Axis(3), 0);
        assert!(w.index_axis(Axis(2), 1).iter().all(|v| *v == 0.0));
        assert!(w.index_axis(Axis(2), 0).sum() > 0.0);
        assert!(w.index_axis(Axis(2), 2).sum() > 0.0);
    }

    #[test]
    fn unweighted_mask_is_cast_directly() {
        let fx = fixture();
        let sample = generate_sample(d(2020, 1, 10), &fx.inputs(), &params()).unwrap();
        // January mask: first two rows active
        let w = sample.sample_weights.index_axis(Axis(3), 0);
        let lead0 = w.index_axis(Axis(2), 0);
        assert_eq!(lead0[(1, 0)], 1.0);
        assert_eq!(lead0[(2, 0)], 0.0);
        assert_eq!(lead0.sum(), 10.0);
    }

    #[test]
    fn loss_weighting_normalises_every_month() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut fx = fixture();
        fx.masks = MaskStack::from_masks(
            (0..12)
                .map(|_| Array2::from_shape_fn(SHAPE, |_| rng.gen_bool(0.6)))
                .map(|mut m| {
                    m[(0, 0)] = true;
                    m
                })
                .collect(),
            SHAPE,
        )
        .unwrap();
        fx.lagged.insert("siconca_abs", series(0.0, 366));
        let mut p = params();
        p.loss_weight_days = true;
        p.n_forecast_days = 1;

        for month in 1..=12 {
            let sample = generate_sample(d(2020, month, 15), &fx.inputs(), &p).unwrap();
            let total = sample.sample_weights.sum();
            assert!(
                (total - LOSS_WEIGHT_REFERENCE).abs() / LOSS_WEIGHT_REFERENCE < 1e-5,
                "month {} summed to {}",
                month,
                total
            );
        }
    }

    #[test]
    fn unobserved_leadtimes_carry_no_weight() {
        let fx = fixture();
        let mut p = params();
        p.loss_weight_days = true;
        // siconca_abs runs to 2020-02-09, so only the first leadtime is observed
        let sample = generate_sample(d(2020, 2, 9), &fx.inputs(), &p).unwrap();

        let y = sample.y.index_axis(Axis(3), 0);
        let w = sample.sample_weights.index_axis(Axis(3), 0);
        assert!((w.index_axis(Axis(2), 0).sum() - LOSS_WEIGHT_REFERENCE).abs() < 1e-2);
        for lead in 1..3 {
            assert!(y.index_axis(Axis(2), lead).iter().all(|v| *v == 0.0));
            assert_eq!(w.index_axis(Axis(2), lead).sum(), 0.0);
        }
    }

    #[test]
    fn lookup_misses_become_zero_planes() {
        let fx = fixture();
        // 2019 dates are absent from every source
        let sample = generate_sample(d(2019, 6, 1), &fx.inputs(), &params()).unwrap();
        for c in 0..4 {
            assert!(sample.x.index_axis(Axis(2), c).iter().all(|v| *v == 0.0));
        }
        assert!(sample.y.iter().all(|v| *v == 0.0));
        assert!(!sample.x.iter().any(|v| v.is_nan()));
    }

    #[test]
    fn nan_inputs_are_zero_filled() {
        let mut fx = fixture();
        let mut var = Array3::from_elem((1, SHAPE.0, SHAPE.1), 2.0f32);
        var[(0, 1, 1)] = f32::NAN;
        fx.lagged
            .insert("siconca_abs", DailyVariable::new(var, &[d(2020, 3, 1)]).unwrap());
        let mut p = params();
        p.n_forecast_days = 0;

        let sample = generate_sample(d(2020, 3, 1), &fx.inputs(), &p).unwrap();
        assert_eq!(sample.x[(1, 1, 0)], 0.0);
        assert_eq!(sample.x[(0, 0, 0)], 2.0);
    }

    #[test]
    fn nan_target_under_weight_is_skipped_when_checking() {
        let mut fx = fixture();
        let mut var = Array3::from_elem((1, SHAPE.0, SHAPE.1), 0.3f32);
        var[(0, 0, 0)] = f32::NAN;
        fx.lagged
            .insert("siconca_abs", DailyVariable::new(var, &[d(2020, 1, 10)]).unwrap());
        let mut p = params();
        p.n_forecast_days = 1;

        let err = generate_sample(d(2020, 1, 10), &fx.inputs(), &p).unwrap_err();
        assert!(err.is_skip());

        p.data_check = false;
        let sample = generate_sample(d(2020, 1, 10), &fx.inputs(), &p).unwrap();
        assert!(sample.y[(0, 0, 0, 0)].is_nan());

        // NaN outside the active cells does not trigger a skip
        p.data_check = true;
        fx.missing.insert(d(2020, 1, 10));
        assert!(generate_sample(d(2020, 1, 10), &fx.inputs(), &p).is_ok());
    }

    #[test]
    fn wrong_plane_shape_is_a_failure() {
        let mut fx = fixture();
        fx.lagged.insert(
            "siconca_abs",
            DailyVariable::new(Array3::zeros((1, 2, 2)), &[d(2020, 1, 10)]).unwrap(),
        );
        let err = generate_sample(d(2020, 1, 10), &fx.inputs(), &params()).unwrap_err();
        assert!(!err.is_skip());
    }
}
