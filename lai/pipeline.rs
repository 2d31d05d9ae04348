//! Parameter initialization, state allocation, state initialization and
//! optimization chained into one trial.

use crate::combine::genotype_vote;
use crate::error::{LaiError, with_thread_pool};
use crate::init::DataInitializer;
use crate::metrics::imputation_error_rate;
use crate::opti::{Optimizer, OptimizerKind, RunLog};
use crate::types::{
    AncestryState, Fixtures, MISSING_GENOTYPE, ParamError, ParamOverrides, Params, derive_seed,
};
use itertools::iproduct;
use log::{debug, info};
use ndarray::{Array2, s};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

const CROSS_VALIDATION_STREAM: u64 = 0xC0FF_EE00;

/// Final state and parameters of one pipeline trial.
#[derive(Debug, Clone)]
pub struct TrialResult {
    pub state: AncestryState,
    pub params: Params,
}

/// Settings of the `(penalty, nbclust)` grid search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrossValidation {
    /// Fraction of observed genotypes hidden per grid cell.
    pub p_sampling: f64,
    pub w_h: f64,
    pub nb_iter: i64,
    pub runs_per_cell: usize,
    /// Only the first `max_columns` SNPs take part in the search.
    pub max_columns: usize,
}

impl Default for CrossValidation {
    fn default() -> Self {
        Self {
            p_sampling: 0.1,
            w_h: 100.0,
            nb_iter: 20,
            runs_per_cell: 20,
            max_columns: 5000,
        }
    }
}

impl CrossValidation {
    pub fn validate(&self) -> Result<(), ParamError> {
        if !(0.0..=1.0).contains(&self.p_sampling) {
            return Err(ParamError::OutOfUnitRange {
                name: "p_sampling",
                value: self.p_sampling,
            });
        }
        Ok(())
    }

    /// `1.0, 1.2, ..., 2.8`.
    pub fn penalty_grid() -> Vec<f64> {
        (0..10).map(|i| 1.0 + 0.2 * i as f64).collect()
    }

    /// `5, 15, ...` strictly below `max(10, n / 2)`.
    pub fn cluster_grid(n_individuals: usize) -> Vec<i64> {
        let upper = (n_individuals as f64 / 2.0).max(10.0);
        (5i64..)
            .step_by(10)
            .take_while(|&c| (c as f64) < upper)
            .collect()
    }
}

/// Where a trial's parameters come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamInit {
    /// Defaults plus overrides.
    Classic,
    /// One grid search per call of [`Pipeline::run_many`], shared by its runs.
    CrossValidate(CrossValidation),
    /// A fresh grid search for every single trial.
    CrossValidateEach(CrossValidation),
}

/// Named pipeline configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Classic,
    ClassicProb,
    ClassicSha,
    Grad,
    OldH,
    CrossValidate,
    CrossValidateEach,
    CrossAg,
    JoinAg,
    JoinThenClassic,
    JoinThenClassicSampling,
    JoinThenClassicKMeans,
    JoinKMeansBalance,
    Tree,
    TreeJoin,
    TreeOldH,
    FixedAJoin,
    FixedAhKnn,
}

impl PipelineKind {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::ClassicProb => "classic_prob",
            Self::ClassicSha => "classic_sha",
            Self::Grad => "grad",
            Self::OldH => "old_h",
            Self::CrossValidate => "crossvalidate",
            Self::CrossValidateEach => "crosseachvalidate",
            Self::CrossAg => "cross_ag",
            Self::JoinAg => "join_ag",
            Self::JoinThenClassic => "join_then_classic",
            Self::JoinThenClassicSampling => "join_then_classic_withsampling",
            Self::JoinThenClassicKMeans => "join_then_classic_initkmeans",
            Self::JoinKMeansBalance => "join_initkmeans_balance",
            Self::Tree => "tree",
            Self::TreeJoin => "tree_join",
            Self::TreeOldH => "tree_oldh",
            Self::FixedAJoin => "fixed_a_join",
            Self::FixedAhKnn => "fixed_ah_knn",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub param_init: ParamInit,
    pub data_init: DataInitializer,
    pub optimizer: Optimizer,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        param_init: ParamInit,
        data_init: DataInitializer,
        optimizer: Optimizer,
    ) -> Self {
        Self {
            name: name.into(),
            param_init,
            data_init,
            optimizer,
        }
    }

    pub fn named(kind: PipelineKind) -> Self {
        use DataInitializer as D;
        use OptimizerKind as O;
        let cv = || ParamInit::CrossValidate(CrossValidation::default());
        let (param_init, data_init, optimizer) = match kind {
            PipelineKind::Classic => (ParamInit::Classic, D::RANDOM, O::Classic),
            PipelineKind::ClassicProb => (ParamInit::Classic, D::RANDOM, O::ClassicProb),
            PipelineKind::ClassicSha => (ParamInit::Classic, D::RANDOM, O::ClassicSha),
            PipelineKind::Grad => (ParamInit::Classic, D::RANDOM, O::Grad),
            PipelineKind::OldH => (ParamInit::Classic, D::RANDOM, O::OldH),
            PipelineKind::CrossValidate => (cv(), D::RANDOM, O::Classic),
            PipelineKind::CrossValidateEach => (
                ParamInit::CrossValidateEach(CrossValidation::default()),
                D::RANDOM,
                O::Classic,
            ),
            PipelineKind::CrossAg => (cv(), D::FROM_GENOTYPES, O::Classic),
            PipelineKind::JoinAg => (ParamInit::Classic, D::FROM_GENOTYPES, O::Join),
            PipelineKind::JoinThenClassic => (cv(), D::FROM_GENOTYPES, O::JoinThenClassic),
            PipelineKind::JoinThenClassicSampling => {
                (cv(), D::FROM_GENOTYPES, O::JoinThenClassicSampling)
            }
            PipelineKind::JoinThenClassicKMeans => (cv(), D::KMEANS, O::JoinThenClassic),
            PipelineKind::JoinKMeansBalance => (ParamInit::Classic, D::KMEANS, O::JoinBalance),
            PipelineKind::Tree => (ParamInit::Classic, D::TREE, O::Classic),
            PipelineKind::TreeJoin => (ParamInit::Classic, D::TREE, O::Join),
            PipelineKind::TreeOldH => (ParamInit::Classic, D::TREE, O::OldH),
            PipelineKind::FixedAJoin => (ParamInit::Classic, D::FIXED_PROFILE, O::FixedAJoin),
            PipelineKind::FixedAhKnn => (
                ParamInit::Classic,
                D::FIXED_PROFILE_AND_HAPLOTYPES,
                O::FixedAhKnn,
            ),
        };
        Self::new(kind.describe(), param_init, data_init, Optimizer::new(optimizer))
    }

    /// Runs one trial on the genotype matrix `g`.
    pub fn run(
        &self,
        g: &Array2<u8>,
        overrides: &ParamOverrides,
        fixtures: Fixtures,
        seed: u64,
    ) -> Result<TrialResult, LaiError> {
        let resolved = self.initial_params(g, overrides, seed)?;
        self.trial(g, &resolved, fixtures, seed)
    }

    /// Runs `nbrun` independently seeded trials, in parallel on a pool sized
    /// by the `num_threads` override, in run order.
    pub fn run_many(
        &self,
        g: &Array2<u8>,
        nbrun: usize,
        overrides: &ParamOverrides,
        fixtures: &Fixtures,
        seed: u64,
    ) -> Result<Vec<TrialResult>, LaiError> {
        let shared = match &self.param_init {
            ParamInit::CrossValidateEach(_) => None,
            _ => Some(self.initial_params(g, overrides, seed)?),
        };
        let threads = overrides.num_threads.map_or(1, |t| t.max(1) as usize);
        with_thread_pool(threads, || {
            (0..nbrun)
                .into_par_iter()
                .map(|run| {
                    let run_seed = derive_seed(seed, &[run as u64]);
                    let resolved = match &shared {
                        Some(p) => p.clone(),
                        None => self.initial_params(g, overrides, run_seed)?,
                    };
                    self.trial(g, &resolved, fixtures.clone(), run_seed)
                })
                .collect()
        })
    }

    fn initial_params(
        &self,
        g: &Array2<u8>,
        overrides: &ParamOverrides,
        seed: u64,
    ) -> Result<ParamOverrides, LaiError> {
        match &self.param_init {
            ParamInit::Classic => Ok(overrides.clone()),
            ParamInit::CrossValidate(cv) | ParamInit::CrossValidateEach(cv) => {
                let selected = cross_validate_params(g, cv, overrides, seed)?;
                Ok(overrides.layered_over(&selected))
            }
        }
    }

    fn trial(
        &self,
        g: &Array2<u8>,
        overrides: &ParamOverrides,
        fixtures: Fixtures,
        seed: u64,
    ) -> Result<TrialResult, LaiError> {
        let params = Params::resolve(overrides, seed)?.with_fixtures(fixtures);
        let state = with_thread_pool(params.num_threads, || {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut state = AncestryState::zeroed(g.clone(), params.nbclust);
            self.data_init.apply(&mut state, &params, &mut rng)?;
            let log = RunLog::new(format!("{} seed {seed:#x}", self.name)).with_cost_trace(true);
            self.optimizer.run(&mut state, &params, &mut rng, &log)?;
            Ok(state)
        })?;
        Ok(TrialResult { state, params })
    }
}

/// Hides a random `p_sampling` fraction of the observed genotypes.
pub fn mask_genotypes(g: &Array2<u8>, p_sampling: f64, rng: &mut StdRng) -> Array2<u8> {
    g.mapv(|x| {
        if x != MISSING_GENOTYPE && rng.gen_bool(p_sampling) {
            MISSING_GENOTYPE
        } else {
            x
        }
    })
}

/// Grid-searches `(penalty, nbclust)` by imputation accuracy of the
/// genotype vote on a masked copy of `g`. Explicit `w_h` and `nb_iter`
/// overrides are used for every grid cell.
pub fn cross_validate_params(
    g: &Array2<u8>,
    cv: &CrossValidation,
    explicit: &ParamOverrides,
    seed: u64,
) -> Result<ParamOverrides, LaiError> {
    cv.validate()?;
    let (n, m) = g.dim();
    let truth = g.slice(s![.., ..m.min(cv.max_columns)]).to_owned();
    let w_h = explicit.w_h.unwrap_or(cv.w_h);
    let nb_iter = explicit.nb_iter.unwrap_or(cv.nb_iter);
    let grid: Vec<(f64, i64)> =
        iproduct!(CrossValidation::penalty_grid(), CrossValidation::cluster_grid(n)).collect();
    info!(
        "Cross-validating {} parameter pairs on {} x {} genotypes.",
        grid.len(),
        truth.nrows(),
        truth.ncols()
    );

    let classic = Pipeline::named(PipelineKind::Classic);
    let errors: Vec<f64> = grid
        .par_iter()
        .enumerate()
        .map(|(cell, &(penalty, nbclust))| {
            let mut rng = StdRng::seed_from_u64(derive_seed(
                seed,
                &[CROSS_VALIDATION_STREAM, cell as u64],
            ));
            let masked = mask_genotypes(&truth, cv.p_sampling, &mut rng);
            let overrides = ParamOverrides {
                penalty: Some(penalty),
                nbclust: Some(nbclust),
                w_h: Some(w_h),
                nb_iter: Some(nb_iter),
                ..explicit.clone()
            };
            let runs = classic.run_many(
                &masked,
                cv.runs_per_cell,
                &overrides,
                &Fixtures::default(),
                rng.next_u64(),
            )?;
            let voted = genotype_vote(&runs)?;
            let error = imputation_error_rate(voted.view(), truth.view(), masked.view())?;
            debug!("penalty {penalty:.1}, nbclust {nbclust}: imputation error {error:.4}");
            Ok(error)
        })
        .collect::<Result<_, LaiError>>()?;

    let mut best = 0usize;
    for (cell, &error) in errors.iter().enumerate() {
        if error < errors[best] {
            best = cell;
        }
    }
    let (penalty, nbclust) = grid[best];
    info!(
        "Selected penalty {penalty:.1} and {nbclust} clusters (imputation error {:.4}).",
        errors[best]
    );
    Ok(ParamOverrides {
        penalty: Some(penalty),
        nbclust: Some(nbclust),
        w_h: Some(w_h),
        nb_iter: Some(nb_iter),
        ..ParamOverrides::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelError, MatrixKind, StepKernel};
    use ndarray::array;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn genotypes() -> Array2<u8> {
        array![
            [0u8, 0, 1, 2, 2, 1, 0, 0],
            [2, 2, 1, 0, 0, 1, 2, 2],
            [1, 1, 1, 1, 1, 1, 1, 1],
            [0, 2, 0, 2, 0, 2, 0, 2],
            [2, 2, 2, 1, 0, 0, 0, 1]
        ]
    }

    #[test]
    fn grids_follow_the_documented_ranges() {
        let penalties = CrossValidation::penalty_grid();
        assert_eq!(penalties.len(), 10);
        assert!((penalties[9] - 2.8).abs() < 1e-9);
        assert_eq!(CrossValidation::cluster_grid(4), vec![5]);
        assert_eq!(CrossValidation::cluster_grid(60), vec![5, 15, 25]);
    }

    #[test]
    fn runs_are_reproducible_per_seed() {
        let pipeline = Pipeline::named(PipelineKind::Classic);
        let overrides = ParamOverrides::default().with_nbclust(3).with_nb_iter(2);
        let a = pipeline
            .run_many(&genotypes(), 3, &overrides, &Fixtures::default(), 9)
            .unwrap();
        let b = pipeline
            .run_many(&genotypes(), 3, &overrides, &Fixtures::default(), 9)
            .unwrap();
        assert_eq!(a.len(), 3);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.state.s, y.state.s);
            assert_eq!(x.state.h, y.state.h);
            assert_eq!(x.params.nbclust, 3);
        }
    }

    #[test]
    fn invalid_overrides_fail_before_any_work() {
        let pipeline = Pipeline::named(PipelineKind::Classic);
        let err = pipeline
            .run(
                &genotypes(),
                &ParamOverrides::default().with_nb_iter(0),
                Fixtures::default(),
                0,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LaiError::Params(ParamError::NonPositiveIterations(0))
        ));
    }

    #[test]
    fn every_unsupervised_pipeline_completes() {
        for kind in [
            PipelineKind::Classic,
            PipelineKind::ClassicProb,
            PipelineKind::ClassicSha,
            PipelineKind::Grad,
            PipelineKind::OldH,
            PipelineKind::JoinAg,
            PipelineKind::JoinKMeansBalance,
            PipelineKind::Tree,
            PipelineKind::TreeJoin,
            PipelineKind::TreeOldH,
        ] {
            let result = Pipeline::named(kind)
                .run(
                    &genotypes(),
                    &ParamOverrides::default().with_nbclust(2).with_nb_iter(2),
                    Fixtures::default(),
                    4,
                )
                .unwrap_or_else(|e| panic!("{kind}: {e}"));
            assert_eq!(result.state.s.dim(), (10, 8), "{kind}");
        }
    }

    #[test]
    fn cross_validation_respects_explicit_overrides() {
        let cv = CrossValidation {
            runs_per_cell: 2,
            nb_iter: 2,
            ..CrossValidation::default()
        };
        let selected =
            cross_validate_params(&genotypes(), &cv, &ParamOverrides::default(), 3).unwrap();
        assert_eq!(selected.nbclust, Some(5));
        assert_eq!(selected.nb_iter, Some(2));
        let penalty = selected.penalty.unwrap();
        assert!((1.0..2.9).contains(&penalty));

        let pipeline = Pipeline::new(
            "cv",
            ParamInit::CrossValidate(cv),
            DataInitializer::RANDOM,
            Optimizer::new(OptimizerKind::Classic),
        );
        let result = pipeline
            .run(
                &genotypes(),
                &ParamOverrides::default().with_penalty(7.0),
                Fixtures::default(),
                3,
            )
            .unwrap();
        assert_eq!(result.params.penalty, 7.0);
        assert_eq!(result.params.nbclust, 5);
    }

    #[derive(Debug)]
    struct PoolWidth(Arc<AtomicUsize>);

    impl StepKernel for PoolWidth {
        fn name(&self) -> &'static str {
            "pool width"
        }
        fn target(&self) -> MatrixKind {
            MatrixKind::Selection
        }
        fn update(
            &self,
            _state: &mut AncestryState,
            _params: &Params,
            _rng: &mut StdRng,
        ) -> Result<(), KernelError> {
            self.0.store(rayon::current_num_threads(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn trials_run_on_a_pool_of_the_requested_width() {
        let seen = Arc::new(AtomicUsize::new(0));
        let kernel: Arc<dyn StepKernel> = Arc::new(PoolWidth(Arc::clone(&seen)));
        let pipeline = Pipeline::new(
            "width",
            ParamInit::Classic,
            DataInitializer::RANDOM,
            Optimizer::custom("width", Vec::new(), vec![kernel]),
        );
        for threads in [3, 1] {
            let overrides = ParamOverrides::default()
                .with_nbclust(2)
                .with_nb_iter(1)
                .with_num_threads(threads);
            pipeline
                .run(&genotypes(), &overrides, Fixtures::default(), 1)
                .unwrap();
            assert_eq!(seen.load(Ordering::SeqCst), threads as usize);
            pipeline
                .run_many(&genotypes(), 2, &overrides, &Fixtures::default(), 1)
                .unwrap();
            assert_eq!(seen.load(Ordering::SeqCst), threads as usize);
        }
    }

    #[test]
    fn masking_only_hides_observed_cells() {
        let g = array![[0u8, 3, 1, 2], [3, 3, 0, 1]];
        let mut rng = StdRng::seed_from_u64(0);
        let all = mask_genotypes(&g, 1.0, &mut rng);
        assert!(all.iter().all(|&x| x == MISSING_GENOTYPE));
        let none = mask_genotypes(&g, 0.0, &mut rng);
        assert_eq!(none, g);
    }
}
