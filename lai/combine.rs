//! Reduces several independent trial outcomes to one genotype or haplotype call.

use crate::error::{LaiError, check_shape};
use crate::pipeline::TrialResult;
use ndarray::{Array2, ArrayView2};

fn collapsed_genotypes(runs: &[TrialResult]) -> Result<Vec<Array2<u8>>, LaiError> {
    let first = runs.first().ok_or(LaiError::NoRuns)?;
    let shape = first.state.h.dim();
    runs.iter()
        .map(|run| {
            check_shape("combined run haplotypes", shape, run.state.h.dim())?;
            let h = &run.state.h;
            let n = h.nrows() / 2;
            Ok(Array2::from_shape_fn((n, h.ncols()), |(i, j)| {
                h[[2 * i, j]].saturating_add(h[[2 * i + 1, j]])
            }))
        })
        .collect()
}

/// Most frequent genotype per cell across runs; ties go to the smaller value.
pub fn genotype_vote(runs: &[TrialResult]) -> Result<Array2<u8>, LaiError> {
    let genotypes = collapsed_genotypes(runs)?;
    let dim = genotypes[0].dim();
    Ok(Array2::from_shape_fn(dim, |idx| {
        let mut counts = [0usize; 3];
        for g in &genotypes {
            if let Some(slot) = counts.get_mut(g[idx] as usize) {
                *slot += 1;
            }
        }
        let mut best = 0usize;
        for value in 1..3 {
            if counts[value] > counts[best] {
                best = value;
            }
        }
        best as u8
    }))
}

/// Rounded mean genotype per cell across runs.
pub fn genotype_mean(runs: &[TrialResult]) -> Result<Array2<u8>, LaiError> {
    let genotypes = collapsed_genotypes(runs)?;
    let dim = genotypes[0].dim();
    let count = genotypes.len() as f64;
    Ok(Array2::from_shape_fn(dim, |idx| {
        let total: f64 = genotypes.iter().map(|g| f64::from(g[idx])).sum();
        round_half_even(total / count) as u8
    }))
}

fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
        r - x.signum()
    } else {
        r
    }
}

/// Phase consensus across runs.
///
/// At every heterozygous site of the first run's genotype, each run votes
/// on whether its phase switched since the individual's previous
/// heterozygous site; a tie counts as a switch. The consensus haplotypes are
/// rebuilt per individual by the running parity of the winning switches,
/// starting with allele 1 on the first haplotype. Homozygous sites keep the
/// first run's alleles.
pub fn haplotype_consensus(runs: &[TrialResult]) -> Result<Array2<u8>, LaiError> {
    let first = runs.first().ok_or(LaiError::NoRuns)?;
    let shape = first.state.h.dim();
    let heterozygous = first.state.g.mapv(|g| g == 1);

    let (n, m) = heterozygous.dim();
    let mut balance = Array2::<i64>::zeros((n, m));
    for run in runs {
        check_shape("combined run haplotypes", shape, run.state.h.dim())?;
        tally_switches(run.state.h.view(), heterozygous.view(), &mut balance);
    }

    let mut consensus = first.state.h.clone();
    for i in 0..n {
        let mut parity = false;
        let mut seen_first = false;
        for j in 0..m {
            if !heterozygous[[i, j]] {
                continue;
            }
            if seen_first && balance[[i, j]] >= 0 {
                parity = !parity;
            }
            seen_first = true;
            let (h1, h2) = if parity { (0, 1) } else { (1, 0) };
            consensus[[2 * i, j]] = h1;
            consensus[[2 * i + 1, j]] = h2;
        }
    }
    Ok(consensus)
}

fn tally_switches(h: ArrayView2<u8>, heterozygous: ArrayView2<bool>, balance: &mut Array2<i64>) {
    for (i, het_row) in heterozygous.rows().into_iter().enumerate() {
        let mut previous: Option<u8> = None;
        for (j, &het) in het_row.iter().enumerate() {
            if !het {
                continue;
            }
            let code = 4 * u8::from(h[[2 * i, j]] == 1) + 5 * u8::from(h[[2 * i + 1, j]] == 1);
            let switched = previous.is_some_and(|p| p != code);
            balance[[i, j]] += if switched { 1 } else { -1 };
            previous = Some(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AncestryState, ParamOverrides, Params};
    use ndarray::array;

    fn run(g: Array2<u8>, h: Array2<u8>) -> TrialResult {
        let m = g.ncols();
        let rows = h.nrows();
        TrialResult {
            state: AncestryState {
                g,
                h,
                a: Array2::zeros((1, m)),
                s: Array2::zeros((rows, m)),
            },
            params: Params::resolve(&ParamOverrides::default(), 0).unwrap(),
        }
    }

    #[test]
    fn vote_takes_the_mode_with_low_ties() {
        let g = array![[1u8, 1, 1]];
        let runs = vec![
            run(g.clone(), array![[1u8, 1, 0], [1, 0, 0]]),
            run(g.clone(), array![[1u8, 0, 1], [1, 0, 0]]),
            run(g.clone(), array![[0u8, 0, 1], [1, 0, 1]]),
            run(g, array![[0u8, 1, 0], [0, 0, 1]]),
        ];
        // Column 0: 2, 2, 1, 0 -> 2. Column 1: 1, 0, 0, 1 -> tie -> 0.
        // Column 2: 0, 1, 2, 1 -> 1.
        assert_eq!(genotype_vote(&runs).unwrap(), array![[2u8, 0, 1]]);
        assert_eq!(genotype_mean(&runs).unwrap(), array![[1u8, 0, 1]]);
    }

    #[test]
    fn empty_run_lists_are_rejected() {
        assert!(matches!(genotype_vote(&[]), Err(LaiError::NoRuns)));
        assert!(matches!(haplotype_consensus(&[]), Err(LaiError::NoRuns)));
    }

    #[test]
    fn consensus_follows_the_majority_phase() {
        let g = array![[1u8, 2, 1, 1]];
        let runs = vec![
            run(g.clone(), array![[1u8, 1, 1, 0], [0, 1, 0, 1]]),
            run(g.clone(), array![[0u8, 1, 0, 1], [1, 1, 1, 0]]),
            run(g, array![[1u8, 1, 0, 0], [0, 1, 1, 1]]),
        ];
        // Switch votes: SNP 2 -> no, no, yes; SNP 3 -> yes, yes, no.
        let consensus = haplotype_consensus(&runs).unwrap();
        assert_eq!(consensus, array![[1u8, 1, 1, 0], [0, 1, 0, 1]]);
    }
}
