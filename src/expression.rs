//! Expression vectors and the per-cell math applied to them.

use crate::error::{LoadError, Result};
use rayon::prelude::*;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

/// One gene's expression across every cell. Immutable once built; clones
/// share storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionVector(Arc<[f32]>);

impl ExpressionVector {
    pub fn empty() -> Self {
        ExpressionVector(Arc::from(Vec::new()))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl Deref for ExpressionVector {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl From<Vec<f32>> for ExpressionVector {
    fn from(values: Vec<f32>) -> Self {
        ExpressionVector(Arc::from(values))
    }
}

/// How several genes are combined into one intensity per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationMode {
    #[default]
    Sum,
    Average,
    Min,
    Max,
}

/// Per-value transform applied after aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformMode {
    #[default]
    Linear,
    Log1p,
}

impl FromStr for AggregationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(AggregationMode::Sum),
            "average" | "mean" => Ok(AggregationMode::Average),
            "min" => Ok(AggregationMode::Min),
            "max" => Ok(AggregationMode::Max),
            other => Err(format!("unknown aggregation '{}' (sum, average, min, max)", other)),
        }
    }
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationMode::Sum => "sum",
            AggregationMode::Average => "average",
            AggregationMode::Min => "min",
            AggregationMode::Max => "max",
        };
        f.write_str(name)
    }
}

impl FromStr for TransformMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(TransformMode::Linear),
            "log1p" => Ok(TransformMode::Log1p),
            other => Err(format!("unknown transform '{}' (linear, log1p)", other)),
        }
    }
}

impl fmt::Display for TransformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransformMode::Linear => "linear",
            TransformMode::Log1p => "log1p",
        })
    }
}

/// Elementwise reduction across equal-length vectors.
///
/// An empty input gives a zero-length vector. Min and max are seeded with
/// +inf and -inf.
pub fn aggregate(vectors: &[ExpressionVector], mode: AggregationMode) -> Result<ExpressionVector> {
    let Some(first) = vectors.first() else {
        return Ok(ExpressionVector::empty());
    };
    let n = first.len();
    if let Some(bad) = vectors.iter().find(|v| v.len() != n) {
        return Err(LoadError::InvalidInput(format!(
            "cannot aggregate vectors of length {} and {}",
            n,
            bad.len()
        )));
    }

    let count = vectors.len() as f32;
    let out: Vec<f32> = (0..n)
        .into_par_iter()
        .map(|i| {
            let column = vectors.iter().map(|v| v[i]);
            match mode {
                AggregationMode::Sum => column.sum(),
                AggregationMode::Average => column.sum::<f32>() / count,
                AggregationMode::Min => column.fold(f32::INFINITY, f32::min),
                AggregationMode::Max => column.fold(f32::NEG_INFINITY, f32::max),
            }
        })
        .collect();
    Ok(out.into())
}

/// Apply `mode` to every value, producing a new vector.
pub fn transform(vector: &ExpressionVector, mode: TransformMode) -> ExpressionVector {
    match mode {
        TransformMode::Linear => vector.clone(),
        TransformMode::Log1p => vector
            .iter()
            .map(|&v| if v >= 0.0 { v.ln_1p() } else { 0.0 })
            .collect::<Vec<f32>>()
            .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(values: &[f32]) -> ExpressionVector {
        values.to_vec().into()
    }

    #[test]
    fn aggregates_elementwise() {
        let inputs = [v(&[1.0, 0.0, 4.0]), v(&[3.0, 2.0, -1.0])];
        assert_eq!(*aggregate(&inputs, AggregationMode::Sum).unwrap(), [4.0, 2.0, 3.0]);
        assert_eq!(*aggregate(&inputs, AggregationMode::Average).unwrap(), [2.0, 1.0, 1.5]);
        assert_eq!(*aggregate(&inputs, AggregationMode::Min).unwrap(), [1.0, 0.0, -1.0]);
        assert_eq!(*aggregate(&inputs, AggregationMode::Max).unwrap(), [3.0, 2.0, 4.0]);
    }

    #[test]
    fn empty_input_gives_empty_vector() {
        for mode in [
            AggregationMode::Sum,
            AggregationMode::Average,
            AggregationMode::Min,
            AggregationMode::Max,
        ] {
            assert!(aggregate(&[], mode).unwrap().is_empty());
        }
    }

    #[test]
    fn unequal_lengths_are_rejected() {
        let inputs = [v(&[1.0]), v(&[1.0, 2.0])];
        assert!(matches!(
            aggregate(&inputs, AggregationMode::Sum),
            Err(LoadError::InvalidInput(_))
        ));
    }

    #[test]
    fn log1p_matches_natural_log() {
        let out = transform(&v(&[0.0, 1.0, 2.0, 4.0, 8.0]), TransformMode::Log1p);
        let expected = [0.0f32, 2f32.ln(), 3f32.ln(), 5f32.ln(), 9f32.ln()];
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
        }
        assert!((out[4] - 2.197).abs() < 1e-3);
    }

    #[test]
    fn log1p_clamps_negatives_and_leaves_input_alone() {
        let input = v(&[-1.0, -2.0]);
        assert_eq!(*transform(&input, TransformMode::Log1p), [0.0, 0.0]);
        assert_eq!(*input, [-1.0, -2.0]);
        assert_eq!(transform(&input, TransformMode::Linear), input);
    }

    #[test]
    fn modes_parse_from_cli_names() {
        assert_eq!("mean".parse::<AggregationMode>().unwrap(), AggregationMode::Average);
        assert_eq!("LOG1P".parse::<TransformMode>().unwrap(), TransformMode::Log1p);
        assert!("log2".parse::<TransformMode>().is_err());
        assert_eq!(AggregationMode::Max.to_string(), "max");
    }
}
