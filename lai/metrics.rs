//! Accuracy and objective measures over label, haplotype and genotype matrices.

use crate::error::{LaiError, check_shape};
use crate::types::{AncestryState, MISSING_GENOTYPE};
use ndarray::{Array2, ArrayView2, Zip};

/// Fraction of cells on which two matrices agree.
pub fn diploid_sim(found: ArrayView2<u8>, truth: ArrayView2<u8>) -> Result<f64, LaiError> {
    check_shape("diploid similarity", truth.dim(), found.dim())?;
    let total = found.len();
    if total == 0 {
        return Ok(0.0);
    }
    let equal = Zip::from(&found)
        .and(&truth)
        .fold(0usize, |acc, a, b| acc + usize::from(a == b));
    Ok(equal as f64 / total as f64)
}

/// Collapses each individual's haplotype pair into one code per SNP: the first
/// haplotype's alternate allele counts 4, the second's counts 5.
pub fn compress_haplotypes(h: ArrayView2<u8>) -> Result<Array2<u8>, LaiError> {
    if h.nrows() % 2 != 0 {
        return Err(LaiError::OddHaplotypeCount {
            workflow: "haplotype compression",
            rows: h.nrows(),
        });
    }
    let n = h.nrows() / 2;
    Ok(Array2::from_shape_fn((n, h.ncols()), |(i, j)| {
        4 * u8::from(h[[2 * i, j]] == 1) + 5 * u8::from(h[[2 * i + 1, j]] == 1)
    }))
}

/// Fraction of heterozygous transitions whose phase disagrees with the truth.
///
/// Per individual, the switch indicator at a heterozygous SNP is the change
/// of compressed code since the previous heterozygous SNP; the first
/// heterozygous SNP of each individual carries no switch.
pub fn switch_error_rate(found: ArrayView2<u8>, truth: ArrayView2<u8>) -> Result<f64, LaiError> {
    check_shape("switch error rate", truth.dim(), found.dim())?;
    let found = compress_haplotypes(found)?;
    let truth = compress_haplotypes(truth)?;

    let mut possible = 0usize;
    let mut disagreements = 0usize;
    for (found_row, truth_row) in found.rows().into_iter().zip(truth.rows()) {
        let mut previous: Option<(u8, u8)> = None;
        for (&f, &t) in found_row.iter().zip(truth_row) {
            if t != 4 && t != 5 {
                continue;
            }
            if let Some((pf, pt)) = previous {
                possible += 1;
                if f.abs_diff(pf) != t.abs_diff(pt) {
                    disagreements += 1;
                }
            }
            previous = Some((f, t));
        }
    }
    if possible == 0 {
        return Ok(0.0);
    }
    Ok(disagreements as f64 / possible as f64)
}

/// Fraction of masked-but-known genotypes that were imputed incorrectly.
pub fn imputation_error_rate(
    found: ArrayView2<u8>,
    truth: ArrayView2<u8>,
    masked: ArrayView2<u8>,
) -> Result<f64, LaiError> {
    check_shape("imputation error rate", truth.dim(), found.dim())?;
    check_shape("imputation error rate mask", truth.dim(), masked.dim())?;
    let (hidden, wrong) = Zip::from(&found).and(&truth).and(&masked).fold(
        (0usize, 0usize),
        |(hidden, wrong), &f, &t, &nan| {
            if nan == MISSING_GENOTYPE && t != MISSING_GENOTYPE {
                (hidden + 1, wrong + usize::from(f != t))
            } else {
                (hidden, wrong)
            }
        },
    );
    if hidden == 0 {
        return Ok(0.0);
    }
    Ok(wrong as f64 / hidden as f64)
}

/// The two terms of the penalized least-squares objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveCost {
    pub fit: f64,
    pub penalty: f64,
}

impl ObjectiveCost {
    pub fn total(&self) -> f64 {
        self.fit + self.penalty
    }
}

/// `sum (H - A[S])^2` and `penalty * #label changes along each row`.
pub fn cost_error_l2(state: &AncestryState, penalty: f32) -> Result<ObjectiveCost, LaiError> {
    check_shape("objective", state.s.dim(), state.h.dim())?;
    let k = state.n_clusters();
    let mut fit = 0.0f64;
    for ((row, j), &label) in state.s.indexed_iter() {
        let label = label as usize;
        if label >= k {
            return Err(LaiError::SelectionOutOfRange { label, clusters: k });
        }
        let diff = f64::from(state.h[[row, j]]) - f64::from(state.a[[label, j]]);
        fit += diff * diff;
    }
    let changes: usize = state
        .s
        .rows()
        .into_iter()
        .map(|r| r.windows(2).into_iter().filter(|w| w[0] != w[1]).count())
        .sum();
    Ok(ObjectiveCost {
        fit,
        penalty: f64::from(penalty) * changes as f64,
    })
}
