//! Turns accumulated population votes into ancestry calls.

use crate::error::LaiError;
use crate::types::{MISSING_LABEL, ParamError};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, ArrayView3, ArrayViewMut1, Axis, Zip};

/// Winning population and its vote count per haplotype row and SNP.
#[derive(Debug, Clone, PartialEq)]
pub struct AncestryCall {
    pub labels: Array2<u8>,
    pub confidence: Array2<u32>,
}

/// Argmax over the population axis of a `(populations, rows, snps)` tensor.
/// Ties go to the lowest population index.
pub fn majority_vote(counts: ArrayView3<u32>) -> AncestryCall {
    let (k, rows, m) = counts.dim();
    let mut labels = Array2::<u8>::zeros((rows, m));
    let mut confidence = Array2::<u32>::zeros((rows, m));
    Zip::indexed(&mut labels)
        .and(&mut confidence)
        .for_each(|(r, j), label, conf| {
            let mut best = 0usize;
            for p in 1..k {
                if counts[[p, r, j]] > counts[[best, r, j]] {
                    best = p;
                }
            }
            if k > 0 {
                *label = best as u8;
                *conf = counts[[best, r, j]];
            }
        });
    AncestryCall { labels, confidence }
}

/// `rate_vote * (max - min) + min` over the whole confidence matrix.
pub fn vote_threshold(confidence: ArrayView2<u32>, rate_vote: f64) -> f64 {
    let (min, max) = confidence
        .iter()
        .fold((u32::MAX, 0u32), |(lo, hi), &c| (lo.min(c), hi.max(c)));
    if min > max {
        return 0.0;
    }
    rate_vote * f64::from(max - min) + f64::from(min)
}

/// Unordered pair code `max * (max + 1) / 2 + min`. `MISSING_LABEL` is reserved.
pub fn encode_pair(a: u8, b: u8) -> Result<u8, LaiError> {
    let (hi, lo) = (u32::from(a.max(b)), u32::from(a.min(b)));
    let code = hi * (hi + 1) / 2 + lo;
    u8::try_from(code)
        .ok()
        .filter(|&c| c != MISSING_LABEL)
        .ok_or(LaiError::LabelCodeOverflow(a, b))
}

/// Collapses each individual's two label rows into one row of pair codes.
pub fn encode_haplotype_pairs(labels: ArrayView2<u8>) -> Result<Array2<u8>, LaiError> {
    if labels.nrows() % 2 != 0 {
        return Err(LaiError::OddHaplotypeCount {
            workflow: "label pair encoding",
            rows: labels.nrows(),
        });
    }
    let n = labels.nrows() / 2;
    let mut codes = Array2::<u8>::zeros((n, labels.ncols()));
    for ((i, j), code) in codes.indexed_iter_mut() {
        *code = encode_pair(labels[[2 * i, j]], labels[[2 * i + 1, j]])?;
    }
    Ok(codes)
}

/// Keeps the pair codes whose two haplotype votes both clear the threshold,
/// then fills the rest from the nearest confident SNP of the same individual.
pub fn vote_and_impute(call: &AncestryCall, rate_vote: f64) -> Result<Array2<u8>, LaiError> {
    if !(0.0..=1.0).contains(&rate_vote) {
        return Err(ParamError::OutOfUnitRange {
            name: "rate_vote",
            value: rate_vote,
        }
        .into());
    }
    let threshold = vote_threshold(call.confidence.view(), rate_vote);
    let mut codes = encode_haplotype_pairs(call.labels.view())?;
    let conf = &call.confidence;
    for ((i, j), code) in codes.indexed_iter_mut() {
        let confident = f64::from(conf[[2 * i, j]]) >= threshold
            && f64::from(conf[[2 * i + 1, j]]) >= threshold;
        if !confident {
            *code = MISSING_LABEL;
        }
    }
    codes
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(impute_nearest);
    Ok(codes)
}

/// Replaces every `MISSING_LABEL` with the value of the nearest known cell;
/// equidistant gaps take the right neighbour. A row without any known cell
/// is left as is.
pub fn impute_nearest(mut row: ArrayViewMut1<u8>) {
    let known: Vec<usize> = row
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v != MISSING_LABEL)
        .map(|(j, _)| j)
        .collect();
    if known.is_empty() {
        return;
    }
    for j in 0..row.len() {
        if row[j] != MISSING_LABEL {
            continue;
        }
        let next = known.partition_point(|&p| p < j);
        let source = match (next.checked_sub(1).map(|i| known[i]), known.get(next)) {
            (Some(left), Some(&right)) if j - left < right - j => left,
            (_, Some(&right)) => right,
            (Some(left), None) => left,
            (None, None) => continue,
        };
        row[j] = row[source];
    }
}
