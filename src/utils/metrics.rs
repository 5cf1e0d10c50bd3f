//! Forecast error metrics over paired prediction / truth maps
//!
//! Cells where the truth is non-finite or negative carry no measurement and
//! are skipped, as are cells where the prediction itself is non-finite.

use chrono::NaiveDateTime;
use ndarray::{ArrayBase, ArrayD, Data, Dimension, Zip};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::data::timestamp::format_key;
use crate::error::{TecError, TecResult};

/// Running absolute/squared error sums
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ForecastMetrics {
    pub count: usize,
    pub abs_sum: f64,
    pub sq_sum: f64,
}

impl ForecastMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every valid cell of a prediction/truth pair
    pub fn update<S1, S2, D>(&mut self, prediction: &ArrayBase<S1, D>, truth: &ArrayBase<S2, D>) -> TecResult<()>
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
        D: Dimension,
    {
        if prediction.shape() != truth.shape() {
            return Err(TecError::Config(format!(
                "prediction shape {:?} differs from truth shape {:?}",
                prediction.shape(),
                truth.shape()
            )));
        }
        Zip::from(prediction).and(truth).for_each(|&p, &t| {
            if t.is_finite() && t >= 0.0 && p.is_finite() {
                let err = (p - t) as f64;
                self.count += 1;
                self.abs_sum += err.abs();
                self.sq_sum += err * err;
            }
        });
        Ok(())
    }

    pub fn merge(&mut self, other: &ForecastMetrics) {
        self.count += other.count;
        self.abs_sum += other.abs_sum;
        self.sq_sum += other.sq_sum;
    }

    /// Mean absolute error, `None` without valid cells
    pub fn mae(&self) -> Option<f64> {
        (self.count > 0).then(|| self.abs_sum / self.count as f64)
    }

    /// Root mean squared error, `None` without valid cells
    pub fn rmse(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.sq_sum / self.count as f64).sqrt())
    }
}

impl fmt::Display for ForecastMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mae(), self.rmse()) {
            (Some(mae), Some(rmse)) => write!(f, "MAE {:.4}, RMSE {:.4} over {} cells", mae, rmse, self.count),
            _ => write!(f, "no valid cells"),
        }
    }
}

/// Per-anchor and overall metrics for matching prediction/truth sets
///
/// Anchors present on only one side are skipped and returned separately.
pub fn compare_sets(
    predictions: &BTreeMap<NaiveDateTime, ArrayD<f32>>,
    truths: &BTreeMap<NaiveDateTime, ArrayD<f32>>,
) -> TecResult<(ForecastMetrics, BTreeMap<NaiveDateTime, ForecastMetrics>, Vec<String>)> {
    let mut overall = ForecastMetrics::new();
    let mut per_anchor = BTreeMap::new();
    let mut unmatched = Vec::new();
    for (anchor, pred) in predictions {
        let Some(truth) = truths.get(anchor) else {
            unmatched.push(format_key(anchor));
            continue;
        };
        let mut m = ForecastMetrics::new();
        m.update(pred, truth)?;
        overall.merge(&m);
        per_anchor.insert(*anchor, m);
    }
    unmatched.extend(
        truths
            .keys()
            .filter(|k| !predictions.contains_key(*k))
            .map(format_key),
    );
    Ok((overall, per_anchor, unmatched))
}
