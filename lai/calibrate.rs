//! Per-individual penalty search for the phase-correction workflow.
//!
//! An individual's imputed ancestry codes are treated as a genotype row and
//! re-explained by two pseudo-populations (all-0 and all-1) under a joint
//! selection/haplotype model. The penalty is bisected so that the resulting
//! label pairs still reproduce the observed codes.

use crate::config::EnsembleConfig;
use crate::ensemble::{clusters_to_populations, local_ancestry_imputed};
use crate::error::{LaiError, with_thread_pool};
use crate::metrics::diploid_sim;
use crate::pipeline::{Pipeline, PipelineKind};
use crate::progress::{SweepProgress, SweepStage};
use crate::types::{
    Fixtures, MISSING_LABEL, ParamError, ParamOverrides, derive_seed, genotypes_from_haplotypes,
};
use crate::vote::AncestryCall;
use log::{debug, info, warn};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis, s};

const SMOOTHING_STREAM: u64 = 0x5300_7700;

/// Outcome of one phase-correction call.
#[derive(Debug, Clone)]
pub struct LambdaFit {
    /// Pseudo-population label per haplotype row and SNP.
    pub labels: Array2<u8>,
    pub selection: Array2<u32>,
    pub haplotypes: Array2<u8>,
    pub lambda: f64,
}

/// Bisection bounds and the similarity that lets the penalty grow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LambdaSearch {
    pub threshold: f64,
    pub min_lambda: f64,
    pub max_lambda: f64,
}

impl Default for LambdaSearch {
    fn default() -> Self {
        Self {
            threshold: 0.90,
            min_lambda: 1.0,
            max_lambda: 500.0,
        }
    }
}

impl LambdaSearch {
    pub fn from_config(config: &EnsembleConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_lambda: config.min_lambda,
            max_lambda: config.max_lambda,
        }
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ParamError::OutOfUnitRange {
                name: "threshold",
                value: self.threshold,
            });
        }
        for bound in [self.min_lambda, self.max_lambda] {
            if !bound.is_finite() || bound < 0.0 {
                return Err(ParamError::InvalidLambda(bound));
            }
        }
        if self.min_lambda > self.max_lambda {
            return Err(ParamError::InvertedLambdaBounds {
                min: self.min_lambda,
                max: self.max_lambda,
            });
        }
        Ok(())
    }
}

/// Explains `observed` (one code row per individual) with the two
/// pseudo-populations at penalty `lambda`, sibling hops included.
pub fn phase_correct(
    observed: ArrayView2<u8>,
    lambda: f64,
    num_threads: usize,
    seed: u64,
) -> Result<LambdaFit, LaiError> {
    let m = observed.ncols();
    let mut a_in = Array2::<f32>::zeros((2, m));
    a_in.row_mut(1).fill(1.0);
    let overrides = ParamOverrides::default()
        .with_penalty(lambda)
        .with_small_penalty(lambda)
        .with_nbclust(2)
        .with_nb_iter(1)
        .with_num_threads(num_threads as i64);
    let fixtures = Fixtures {
        a_in: Some(a_in),
        ..Fixtures::default()
    };
    let result = Pipeline::named(PipelineKind::FixedAJoin).run(
        &observed.to_owned(),
        &overrides,
        fixtures,
        seed,
    )?;
    let labels = clusters_to_populations(result.state.s.view(), &[1, 1])?;
    Ok(LambdaFit {
        labels,
        selection: result.state.s,
        haplotypes: result.state.h,
        lambda,
    })
}

/// Bisects the penalty between the search bounds.
///
/// While the interval is wider than one, the midpoint is tried: when the
/// collapsed labels agree with `observed` on more than `threshold` of the
/// cells the lower bound moves up to the midpoint, otherwise the upper bound
/// moves down to it. The final call runs at the lower bound.
pub fn find_lambda(
    observed: ArrayView2<u8>,
    search: &LambdaSearch,
    num_threads: usize,
    seed: u64,
) -> Result<LambdaFit, LaiError> {
    search.validate()?;
    let (mut lo, mut hi) = (search.min_lambda, search.max_lambda);
    let mut step = 0u64;
    loop {
        let step_seed = derive_seed(seed, &[step]);
        if hi - lo <= 1.0 {
            return phase_correct(observed, lo, num_threads, step_seed);
        }
        let mid = (hi - lo) / 2.0 + lo;
        let fit = phase_correct(observed, mid, num_threads, step_seed)?;
        let collapsed =
            genotypes_from_haplotypes(fit.labels.view()).ok_or(LaiError::OddHaplotypeCount {
                workflow: "lambda search",
                rows: fit.labels.nrows(),
            })?;
        let sim = diploid_sim(collapsed.view(), observed)?;
        debug!("lambda {mid:.3}: similarity {sim:.4} in [{lo:.3}, {hi:.3}]");
        if sim > search.threshold {
            lo = mid;
        } else {
            hi = mid;
        }
        step += 1;
    }
}

/// Phase-corrected ancestry call.
#[derive(Debug, Clone)]
pub struct SmoothedCall {
    /// Two rows per individual. With two reference populations the labels
    /// are population indices; rows of individuals without any confident
    /// call are `MISSING_LABEL`.
    pub labels: Array2<u8>,
    /// Penalty chosen per individual, `None` when the search was skipped.
    pub lambdas: Vec<Option<f64>>,
    /// Thresholded, imputed pair codes the search ran on.
    pub imputed: Array2<u8>,
    pub raw: AncestryCall,
}

/// Bagging, vote imputation and a per-individual penalty search.
pub fn smooth(
    refs: &[Array2<u8>],
    admixed: ArrayView2<u8>,
    config: &EnsembleConfig,
    progress: &dyn SweepProgress,
) -> Result<SmoothedCall, LaiError> {
    if admixed.nrows() % 2 != 0 {
        return Err(LaiError::OddHaplotypeCount {
            workflow: "phase correction",
            rows: admixed.nrows(),
        });
    }
    let search = LambdaSearch::from_config(config);
    search.validate()?;
    let (imputed, raw) = local_ancestry_imputed(refs, admixed, config, progress)?;
    let (n, m) = imputed.dim();
    info!("Phase-correcting {n} individuals over {m} SNPs.");

    progress.on_stage_start(SweepStage::Smoothing, n);
    let fits = with_thread_pool(config.num_threads, || {
        imputed
            .axis_iter(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(i, row)| {
                let fit = if row.iter().all(|&c| c == MISSING_LABEL) {
                    warn!("Individual {i} has no confident ancestry call; leaving it unlabelled.");
                    None
                } else {
                    let seed = derive_seed(config.seed, &[SMOOTHING_STREAM, i as u64]);
                    let observed = row.insert_axis(Axis(0));
                    Some(find_lambda(observed, &search, config.num_threads, seed)?)
                };
                progress.on_stage_advance(SweepStage::Smoothing, 1);
                Ok(fit)
            })
            .collect::<Result<Vec<_>, LaiError>>()
    })?;
    progress.on_stage_finish(SweepStage::Smoothing);

    let mut labels = Array2::from_elem((2 * n, m), MISSING_LABEL);
    let mut lambdas = Vec::with_capacity(n);
    for (i, fit) in fits.into_iter().enumerate() {
        match fit {
            Some(fit) => {
                labels.slice_mut(s![2 * i..2 * i + 2, ..]).assign(&fit.labels);
                lambdas.push(Some(fit.lambda));
            }
            None => lambdas.push(None),
        }
    }
    Ok(SmoothedCall {
        labels,
        lambdas,
        imputed,
        raw,
    })
}
