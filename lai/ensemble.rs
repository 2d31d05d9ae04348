//! Bootstrap aggregation of reference-copying calls across a penalty sweep.

use crate::config::EnsembleConfig;
use crate::error::{LaiError, check_shape, with_thread_pool};
use crate::pipeline::{Pipeline, PipelineKind};
use crate::progress::{NoopSweepProgress, SweepProgress, SweepStage};
use crate::types::{
    Fixtures, MISSING_LABEL, ParamError, ParamOverrides, derive_seed, genotypes_from_haplotypes,
};
use crate::vote::{AncestryCall, majority_vote, vote_and_impute};
use log::{debug, info};
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;

/// Largest number of reference populations whose indices fit a label byte.
pub const MAX_POPULATIONS: usize = MISSING_LABEL as usize;

// ========================================================================================
//                                    Vote counts
// ========================================================================================

/// Votes per population, haplotype row and SNP.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteCounts {
    counts: Array3<u32>,
}

impl VoteCounts {
    pub fn zeros(populations: usize, rows: usize, snps: usize) -> Self {
        Self {
            counts: Array3::zeros((populations, rows, snps)),
        }
    }

    /// `(populations, rows, snps)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.counts.dim()
    }

    /// Adds one vote per cell for the population named in `labels`.
    pub fn record(&mut self, labels: ArrayView2<u8>) -> Result<(), LaiError> {
        let (k, rows, m) = self.shape();
        check_shape("population labels", (rows, m), labels.dim())?;
        for ((r, j), &label) in labels.indexed_iter() {
            let p = label as usize;
            if p >= k {
                return Err(LaiError::SelectionOutOfRange {
                    label: p,
                    clusters: k,
                });
            }
            self.counts[[p, r, j]] += 1;
        }
        Ok(())
    }

    /// Element-wise sum of two tallies of the same shape.
    pub fn merge(mut self, other: VoteCounts) -> VoteCounts {
        self.counts += &other.counts;
        self
    }

    pub fn as_array(&self) -> ArrayView3<u32> {
        self.counts.view()
    }

    pub fn into_inner(self) -> Array3<u32> {
        self.counts
    }
}

// ========================================================================================
//                                  Reference panel
// ========================================================================================

/// Maps copied reference rows back to the population that contributed them.
pub fn clusters_to_populations(
    s: ArrayView2<u32>,
    sizes: &[usize],
) -> Result<Array2<u8>, LaiError> {
    let ends: Vec<usize> = sizes
        .iter()
        .scan(0usize, |acc, &n| {
            *acc += n;
            Some(*acc)
        })
        .collect();
    let total = ends.last().copied().unwrap_or(0);
    let mut labels = Array2::<u8>::zeros(s.dim());
    for (label, &row) in labels.iter_mut().zip(s.iter()) {
        let row = row as usize;
        if row >= total {
            return Err(LaiError::SelectionOutOfRange {
                label: row,
                clusters: total,
            });
        }
        *label = ends.partition_point(|&end| end <= row) as u8;
    }
    Ok(labels)
}

/// Resamples the rows of `h` with replacement.
pub fn bootstrap(h: ArrayView2<u8>, rng: &mut StdRng) -> Array2<u8> {
    let n = h.nrows();
    let picks: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
    h.select(Axis(0), &picks)
}

struct ReferencePanel<'a> {
    refs: &'a [Array2<u8>],
    sizes: Vec<usize>,
    admixed: Array2<u8>,
    genotypes: Array2<u8>,
    num_threads: usize,
}

impl<'a> ReferencePanel<'a> {
    fn new(
        refs: &'a [Array2<u8>],
        admixed: ArrayView2<u8>,
        num_threads: usize,
    ) -> Result<Self, LaiError> {
        if refs.is_empty() {
            return Err(LaiError::NoReferencePopulations);
        }
        if refs.len() > MAX_POPULATIONS {
            return Err(LaiError::TooManyPopulations {
                found: refs.len(),
                max: MAX_POPULATIONS,
            });
        }
        let m = admixed.ncols();
        for (index, h) in refs.iter().enumerate() {
            if h.nrows() == 0 {
                return Err(LaiError::EmptyReferencePopulation { index });
            }
            check_shape("reference haplotypes", (h.nrows(), m), h.dim())?;
        }
        let genotypes =
            genotypes_from_haplotypes(admixed).ok_or(LaiError::OddHaplotypeCount {
                workflow: "bootstrap voting",
                rows: admixed.nrows(),
            })?;
        Ok(Self {
            refs,
            sizes: refs.iter().map(Array2::nrows).collect(),
            admixed: admixed.to_owned(),
            genotypes,
            num_threads,
        })
    }

    fn empty_counts(&self) -> VoteCounts {
        let (rows, m) = self.admixed.dim();
        VoteCounts::zeros(self.refs.len(), rows, m)
    }

    /// One reference-copying call on an optionally resampled panel.
    fn trial(&self, penalty: f64, resample: bool, seed: u64) -> Result<Array2<u8>, LaiError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let total: usize = self.sizes.iter().sum();
        let m = self.admixed.ncols();
        let mut a_in = Array2::<f32>::zeros((total, m));
        let mut offset = 0;
        for h in self.refs {
            let block = s![offset..offset + h.nrows(), ..];
            if resample {
                a_in.slice_mut(block)
                    .assign(&bootstrap(h.view(), &mut rng).mapv(f32::from));
            } else {
                a_in.slice_mut(block).assign(&h.mapv(f32::from));
            }
            offset += h.nrows();
        }

        let overrides = ParamOverrides::default()
            .with_penalty(penalty)
            .with_nbclust(total as i64)
            .with_nb_iter(1)
            .with_num_threads(self.num_threads as i64);
        let fixtures = Fixtures {
            a_in: Some(a_in),
            h_in: Some(self.admixed.clone()),
            weights: Some(Array1::ones(m)),
        };
        let result = Pipeline::named(PipelineKind::FixedAhKnn).run(
            &self.genotypes,
            &overrides,
            fixtures,
            rng.next_u64(),
        )?;
        clusters_to_populations(result.state.s.view(), &self.sizes)
    }
}

// ========================================================================================
//                                   Bagging sweep
// ========================================================================================

#[derive(Debug, Clone, Copy)]
struct Trial {
    lambda_index: usize,
    penalty: f64,
    index: usize,
}

fn schedule(lambdas: &[f64], nbrun: usize) -> Vec<Trial> {
    let per_lambda = nbrun.max(1);
    lambdas
        .iter()
        .enumerate()
        .flat_map(|(lambda_index, &penalty)| {
            (0..per_lambda).map(move |index| Trial {
                lambda_index,
                penalty,
                index,
            })
        })
        .collect()
}

fn accumulate(
    panel: &ReferencePanel<'_>,
    trials: &[Trial],
    resample: bool,
    seed: u64,
    progress: &dyn SweepProgress,
) -> Result<VoteCounts, LaiError> {
    trials
        .par_iter()
        .try_fold(
            || panel.empty_counts(),
            |mut acc, trial| {
                let trial_seed =
                    derive_seed(seed, &[trial.lambda_index as u64, trial.index as u64]);
                let labels = panel.trial(trial.penalty, resample, trial_seed)?;
                acc.record(labels.view())?;
                progress.on_stage_advance(SweepStage::Bagging, 1);
                Ok(acc)
            },
        )
        .try_reduce(|| panel.empty_counts(), |a, b| Ok(a.merge(b)))
}

fn validate_lambdas(lambdas: &[f64]) -> Result<(), ParamError> {
    if lambdas.is_empty() {
        return Err(ParamError::EmptyLambdaRange);
    }
    match lambdas.iter().find(|l| !l.is_finite() || **l < 0.0) {
        Some(&bad) => Err(ParamError::InvalidLambda(bad)),
        None => Ok(()),
    }
}

/// Adds the votes of `nbrun` bootstrap trials at one penalty to `counts`.
/// With `nbrun <= 1` a single trial runs on the unresampled references.
pub fn bootstrap_votes(
    refs: &[Array2<u8>],
    admixed: ArrayView2<u8>,
    penalty: f64,
    num_threads: usize,
    nbrun: usize,
    seed: u64,
    counts: &mut VoteCounts,
) -> Result<(), LaiError> {
    validate_lambdas(&[penalty])?;
    let panel = ReferencePanel::new(refs, admixed, num_threads)?;
    let (k, rows, m) = counts.shape();
    check_shape("vote count populations and rows", (refs.len(), admixed.nrows()), (k, rows))?;
    check_shape("vote count columns", (admixed.ncols(), 1), (m, 1))?;
    let trials = schedule(&[penalty], nbrun);
    let delta = with_thread_pool(num_threads, || {
        accumulate(&panel, &trials, nbrun > 1, seed, &NoopSweepProgress)
    })?;
    counts.counts += &delta.counts;
    Ok(())
}

/// Runs the bagging runner once per penalty of `config.lambdas` into one
/// running vote tally.
pub fn lambda_sweep(
    refs: &[Array2<u8>],
    admixed: ArrayView2<u8>,
    config: &EnsembleConfig,
    progress: &dyn SweepProgress,
) -> Result<VoteCounts, LaiError> {
    validate_lambdas(&config.lambdas)?;
    let panel = ReferencePanel::new(refs, admixed, config.num_threads)?;
    let trials = schedule(&config.lambdas, config.nb_bagging);
    info!(
        "Bagging {} trials ({} penalties) over {} reference populations and {} admixed haplotypes.",
        trials.len(),
        config.lambdas.len(),
        refs.len(),
        admixed.nrows()
    );
    progress.on_stage_start(SweepStage::Bagging, trials.len());
    let counts = with_thread_pool(config.num_threads, || {
        accumulate(
            &panel,
            &trials,
            config.nb_bagging > 1,
            config.seed,
            progress,
        )
    })?;
    progress.on_stage_finish(SweepStage::Bagging);
    debug!("Vote tally shape {:?}.", counts.shape());
    Ok(counts)
}

// ========================================================================================
//                                  Ancestry calls
// ========================================================================================

/// Sweeps `admixed`, padded with an all-zero haplotype when its row count
/// is odd.
fn padded_sweep(
    refs: &[Array2<u8>],
    admixed: ArrayView2<u8>,
    config: &EnsembleConfig,
    progress: &dyn SweepProgress,
) -> Result<VoteCounts, LaiError> {
    let rows = admixed.nrows();
    if rows % 2 == 0 {
        return lambda_sweep(refs, admixed, config, progress);
    }
    debug!("Padding {rows} admixed haplotypes with one all-zero haplotype.");
    let mut padded = Array2::<u8>::zeros((rows + 1, admixed.ncols()));
    padded.slice_mut(s![..rows, ..]).assign(&admixed);
    lambda_sweep(refs, padded.view(), config, progress)
}

fn first_rows(call: AncestryCall, rows: usize) -> AncestryCall {
    if call.labels.nrows() == rows {
        return call;
    }
    AncestryCall {
        labels: call.labels.slice(s![..rows, ..]).to_owned(),
        confidence: call.confidence.slice(s![..rows, ..]).to_owned(),
    }
}

/// Majority ancestry call per admixed haplotype and SNP.
///
/// An odd admixed panel is padded with an all-zero haplotype for the sweep;
/// the padding row is dropped from the result.
pub fn local_ancestry(
    refs: &[Array2<u8>],
    admixed: ArrayView2<u8>,
    config: &EnsembleConfig,
    progress: &dyn SweepProgress,
) -> Result<AncestryCall, LaiError> {
    config.validate()?;
    let counts = padded_sweep(refs, admixed, config, progress)?;
    Ok(first_rows(majority_vote(counts.as_array()), admixed.nrows()))
}

/// The raw majority call together with its thresholded, imputed pair codes
/// (one row per individual).
///
/// An odd admixed panel is padded with an all-zero haplotype; the raw call
/// drops the padding row, while the last pair code pairs the final real
/// haplotype with it.
pub fn local_ancestry_imputed(
    refs: &[Array2<u8>],
    admixed: ArrayView2<u8>,
    config: &EnsembleConfig,
    progress: &dyn SweepProgress,
) -> Result<(Array2<u8>, AncestryCall), LaiError> {
    config.validate()?;
    let counts = padded_sweep(refs, admixed, config, progress)?;
    let raw = majority_vote(counts.as_array());
    let imputed = vote_and_impute(&raw, config.rate_vote)?;
    Ok((imputed, first_rows(raw, admixed.nrows())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn panels() -> (Vec<Array2<u8>>, Array2<u8>) {
        let refs = vec![Array2::ones((4, 6)), Array2::zeros((3, 6))];
        let admixed = array![[0u8, 0, 0, 0, 0, 0], [1, 1, 1, 1, 1, 1]];
        (refs, admixed)
    }

    #[test]
    fn cluster_rows_map_to_their_population() {
        let s = array![[0u32, 1, 2, 3], [4, 5, 6, 2]];
        let labels = clusters_to_populations(s.view(), &[2, 1, 4]).unwrap();
        assert_eq!(labels, array![[0u8, 0, 1, 2], [2, 2, 2, 1]]);
        let beyond = array![[7u32]];
        assert!(matches!(
            clusters_to_populations(beyond.view(), &[2, 1, 4]),
            Err(LaiError::SelectionOutOfRange { label: 7, clusters: 7 })
        ));
    }

    #[test]
    fn bootstrap_keeps_shape_and_draws_existing_rows() {
        let h = array![[0u8, 0], [1, 1], [0, 1]];
        let mut rng = StdRng::seed_from_u64(3);
        let resampled = bootstrap(h.view(), &mut rng);
        assert_eq!(resampled.dim(), h.dim());
        for row in resampled.rows() {
            assert!(h.rows().into_iter().any(|r| r == row));
        }
    }

    #[test]
    fn every_trial_votes_once_per_cell() {
        let (refs, admixed) = panels();
        let mut counts = VoteCounts::zeros(2, 2, 6);
        bootstrap_votes(&refs, admixed.view(), 2.0, 2, 5, 1, &mut counts).unwrap();
        let totals = counts.as_array().sum_axis(Axis(0));
        assert!(totals.iter().all(|&t| t == 5));
        assert!(counts.as_array().slice(s![1, 0, ..]).iter().all(|&c| c == 5));
        assert!(counts.as_array().slice(s![0, 1, ..]).iter().all(|&c| c == 5));

        bootstrap_votes(&refs, admixed.view(), 2.0, 1, 0, 1, &mut counts).unwrap();
        let totals = counts.as_array().sum_axis(Axis(0));
        assert!(totals.iter().all(|&t| t == 6));
    }

    #[test]
    fn sweep_is_reproducible_and_thread_independent() {
        let refs = vec![
            array![[0u8, 1, 0, 1, 1], [0, 1, 1, 1, 0], [1, 1, 0, 0, 0]],
            array![[1u8, 0, 1, 0, 0], [1, 0, 0, 1, 1]],
        ];
        let admixed = array![[0u8, 1, 0, 0, 1], [1, 0, 1, 1, 0]];
        let config = EnsembleConfig {
            lambdas: vec![1.5, 3.0],
            nb_bagging: 4,
            num_threads: 1,
            ..EnsembleConfig::default()
        };
        let serial = lambda_sweep(&refs, admixed.view(), &config, &NoopSweepProgress).unwrap();
        let parallel = lambda_sweep(
            &refs,
            admixed.view(),
            &EnsembleConfig {
                num_threads: 3,
                ..config.clone()
            },
            &NoopSweepProgress,
        )
        .unwrap();
        assert_eq!(serial, parallel);
        let totals = serial.as_array().sum_axis(Axis(0));
        assert!(totals.iter().all(|&t| t == 8));
    }

    #[test]
    fn odd_panels_are_padded_then_trimmed() {
        let (refs, _) = panels();
        let admixed = array![[0u8, 0, 0, 0, 0, 0], [1, 1, 1, 1, 1, 1], [0, 0, 0, 1, 1, 1]];
        let config = EnsembleConfig {
            lambdas: vec![2.0],
            nb_bagging: 2,
            ..EnsembleConfig::default()
        };
        let call = local_ancestry(&refs, admixed.view(), &config, &NoopSweepProgress).unwrap();
        assert_eq!(call.labels.dim(), (3, 6));
        assert!(call.labels.row(0).iter().all(|&l| l == 1));
        assert!(call.labels.row(1).iter().all(|&l| l == 0));

        let (imputed, raw) =
            local_ancestry_imputed(&refs, admixed.view(), &config, &NoopSweepProgress).unwrap();
        assert_eq!(raw.labels, call.labels);
        assert_eq!(raw.confidence.dim(), (3, 6));
        assert_eq!(imputed.dim(), (2, 6));
        assert!(imputed.row(0).iter().all(|&c| c == 1));
    }

    #[test]
    fn malformed_panels_are_rejected() {
        let admixed = array![[0u8, 1], [1, 0]];
        let config = EnsembleConfig::default();
        assert!(matches!(
            lambda_sweep(&[], admixed.view(), &config, &NoopSweepProgress),
            Err(LaiError::NoReferencePopulations)
        ));
        let empty = vec![Array2::<u8>::zeros((0, 2))];
        assert!(matches!(
            lambda_sweep(&empty, admixed.view(), &config, &NoopSweepProgress),
            Err(LaiError::EmptyReferencePopulation { index: 0 })
        ));
        let narrow = vec![Array2::<u8>::zeros((2, 3))];
        assert!(matches!(
            lambda_sweep(&narrow, admixed.view(), &config, &NoopSweepProgress),
            Err(LaiError::ShapeMismatch { .. })
        ));
    }
}
