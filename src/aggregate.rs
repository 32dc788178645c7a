//! Robust aggregation of admitted gradients
//!
//! All statistics are coordinate-wise and accumulate in f64. An empty
//! admitted set always yields the zero vector of the round dimension, so a
//! validator that admitted nothing still commits to something deterministic.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::GradientVector;

pub const DEFAULT_TRIM_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AggregationMode {
    #[default]
    Mean,
    Median,
    /// Drop `floor(trim_ratio * n)` lowest and highest values per coordinate
    TrimmedMean { trim_ratio: f64 },
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationMode::Mean => write!(f, "mean"),
            AggregationMode::Median => write!(f, "median"),
            AggregationMode::TrimmedMean { trim_ratio } => write!(f, "trimmed-mean({trim_ratio})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("vector {index} has dimension {got}, expected {expected}")]
    DimensionMismatch { index: usize, expected: usize, got: usize },
}

/// Combine `admitted` into one vector of length `grad_dim`.
///
/// Fails if any admitted vector has a different length.
pub fn aggregate(
    admitted: &[GradientVector],
    mode: AggregationMode,
    grad_dim: usize,
) -> Result<GradientVector, AggregateError> {
    if let Some((index, v)) = admitted.iter().enumerate().find(|(_, v)| v.dim() != grad_dim) {
        return Err(AggregateError::DimensionMismatch {
            index,
            expected: grad_dim,
            got: v.dim(),
        });
    }

    if admitted.is_empty() {
        return Ok(GradientVector::zeros(grad_dim));
    }

    let combined = match mode {
        AggregationMode::Mean => mean(admitted, grad_dim),
        AggregationMode::Median => per_coordinate(admitted, grad_dim, median_of_sorted),
        AggregationMode::TrimmedMean { trim_ratio } => {
            let n = admitted.len();
            let k = (trim_ratio * n as f64).floor() as usize;
            if k == 0 || n <= 2 * k {
                mean(admitted, grad_dim)
            } else {
                per_coordinate(admitted, grad_dim, |sorted| {
                    let kept = &sorted[k..n - k];
                    kept.iter().sum::<f64>() / kept.len() as f64
                })
            }
        }
    };
    Ok(combined)
}

fn mean(admitted: &[GradientVector], grad_dim: usize) -> GradientVector {
    let mut sums = vec![0.0f64; grad_dim];
    for vector in admitted {
        for (sum, &v) in sums.iter_mut().zip(vector.as_slice()) {
            *sum += v as f64;
        }
    }
    let n = admitted.len() as f64;
    GradientVector::new(sums.into_iter().map(|s| (s / n) as f32).collect())
}

fn per_coordinate<F>(admitted: &[GradientVector], grad_dim: usize, statistic: F) -> GradientVector
where
    F: Fn(&[f64]) -> f64,
{
    let mut column = Vec::with_capacity(admitted.len());
    let values = (0..grad_dim)
        .map(|j| {
            column.clear();
            column.extend(admitted.iter().map(|v| v.as_slice()[j] as f64));
            column.sort_by(|a, b| a.total_cmp(b));
            statistic(&column) as f32
        })
        .collect();
    GradientVector::new(values)
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}
