//! Fixed-order kernel schedules.

use crate::kernel::{
    BalanceSA, EstimateA, EstimateAGrad, EstimateH, EstimateS, EstimateSH, EstimateSHKnn,
    EstimateSKnn, KernelError, StepKernel,
};
use crate::metrics::cost_error_l2;
use crate::types::{AncestryState, Params};
use log::{Level, debug, log_enabled, trace};
use rand::rngs::StdRng;
use std::fmt;
use std::sync::Arc;

/// Named schedules of the alternating optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizerKind {
    /// S, A, H (random switch).
    Classic,
    /// S, A, H (probabilistic switch).
    ClassicProb,
    /// S, H (random switch), A.
    ClassicSha,
    /// S, damped A, H (random switch).
    Grad,
    /// SH, H (deterministic), A.
    Join,
    /// SH, H (deterministic), label balancing, damped A.
    JoinBalance,
    /// S, A, H (deterministic).
    OldH,
    /// One joint iteration, then S, A, H (deterministic).
    JoinThenClassic,
    /// One joint iteration, then S, A, H, all with random switches.
    JoinThenClassicSampling,
    /// SH with sibling hops, H (deterministic); `A` stays fixed.
    FixedAJoin,
    /// Reference copying; `A` and `H` stay fixed.
    FixedAhKnn,
}

impl OptimizerKind {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::ClassicProb => "classic_prob",
            Self::ClassicSha => "classic_sha",
            Self::Grad => "grad",
            Self::Join => "join",
            Self::JoinBalance => "join_balance",
            Self::OldH => "old_h",
            Self::JoinThenClassic => "join_then_classic",
            Self::JoinThenClassicSampling => "join_then_classic_sampling",
            Self::FixedAJoin => "fixed_a_join",
            Self::FixedAhKnn => "fixed_ah_knn",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Logging context handed to the optimizer by its caller.
#[derive(Debug, Clone)]
pub struct RunLog {
    pub label: String,
    /// Compute and log the objective after every iteration (debug level).
    pub trace_cost: bool,
}

impl RunLog {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            trace_cost: false,
        }
    }

    pub fn silent() -> Self {
        Self::new("")
    }

    pub fn with_cost_trace(mut self, enabled: bool) -> Self {
        self.trace_cost = enabled;
        self
    }
}

type Schedule = Vec<Arc<dyn StepKernel>>;

/// A warmup schedule for the first iteration followed by the main schedule
/// for the rest. An empty warmup runs the main schedule every iteration.
#[derive(Debug, Clone)]
pub struct Optimizer {
    name: String,
    warmup: Schedule,
    schedule: Schedule,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind) -> Self {
        fn k<K: StepKernel + 'static>(kernel: K) -> Arc<dyn StepKernel> {
            Arc::new(kernel)
        }
        let (warmup, schedule): (Schedule, Schedule) = match kind {
            OptimizerKind::Classic => (vec![], vec![k(EstimateS), k(EstimateA), k(EstimateH::RANDOM)]),
            OptimizerKind::ClassicProb => (
                vec![],
                vec![k(EstimateS), k(EstimateA), k(EstimateH::PROBABILISTIC)],
            ),
            OptimizerKind::ClassicSha => (vec![], vec![k(EstimateS), k(EstimateH::RANDOM), k(EstimateA)]),
            OptimizerKind::Grad => (
                vec![],
                vec![k(EstimateS), k(EstimateAGrad), k(EstimateH::RANDOM)],
            ),
            OptimizerKind::Join => (
                vec![],
                vec![k(EstimateSH), k(EstimateH::DETERMINISTIC), k(EstimateA)],
            ),
            OptimizerKind::JoinBalance => (
                vec![],
                vec![
                    k(EstimateSH),
                    k(EstimateH::DETERMINISTIC),
                    k(BalanceSA),
                    k(EstimateAGrad),
                ],
            ),
            OptimizerKind::OldH => (
                vec![],
                vec![k(EstimateS), k(EstimateA), k(EstimateH::DETERMINISTIC)],
            ),
            OptimizerKind::JoinThenClassic => (
                vec![k(EstimateSH), k(EstimateH::DETERMINISTIC), k(EstimateA)],
                vec![k(EstimateS), k(EstimateA), k(EstimateH::DETERMINISTIC)],
            ),
            OptimizerKind::JoinThenClassicSampling => (
                vec![k(EstimateSH), k(EstimateH::RANDOM), k(EstimateA)],
                vec![k(EstimateS), k(EstimateA), k(EstimateH::RANDOM)],
            ),
            OptimizerKind::FixedAJoin => (vec![], vec![k(EstimateSHKnn), k(EstimateH::DETERMINISTIC)]),
            OptimizerKind::FixedAhKnn => (vec![], vec![k(EstimateSKnn)]),
        };
        Self {
            name: kind.describe().to_string(),
            warmup,
            schedule,
        }
    }

    /// Builds an optimizer from explicit kernel lists.
    pub fn custom(name: impl Into<String>, warmup: Schedule, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            warmup,
            schedule,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `params.nb_iter` iterations. The first kernel error aborts the run.
    pub fn run(
        &self,
        state: &mut AncestryState,
        params: &Params,
        rng: &mut StdRng,
        log: &RunLog,
    ) -> Result<(), KernelError> {
        for iter in 0..params.nb_iter {
            let kernels = if iter == 0 && !self.warmup.is_empty() {
                &self.warmup
            } else {
                &self.schedule
            };
            for kernel in kernels {
                trace!("[{}] iter {iter}: {}", log.label, kernel.name());
                kernel.update(state, params, rng)?;
            }
            if log.trace_cost && log_enabled!(Level::Debug) {
                match cost_error_l2(state, params.penalty) {
                    Ok(cost) => debug!(
                        "[{}] {} iter {iter}, cost: fit {:.4}, penalty {:.4}",
                        log.label, self.name, cost.fit, cost.penalty
                    ),
                    Err(e) => debug!("[{}] iter {iter}, cost unavailable: {e}", log.label),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::DataInitializer;
    use crate::types::{MISSING_GENOTYPE, ParamOverrides};
    use ndarray::array;
    use rand::SeedableRng;

    #[derive(Debug)]
    struct Failing;

    impl StepKernel for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn target(&self) -> crate::kernel::MatrixKind {
            crate::kernel::MatrixKind::Profile
        }
        fn update(
            &self,
            _state: &mut AncestryState,
            _params: &Params,
            _rng: &mut StdRng,
        ) -> Result<(), KernelError> {
            Err(KernelError {
                kernel: "failing",
                matrix: self.target(),
                parameter: "w_h",
                value: "-1".into(),
                message: "boom".into(),
            })
        }
    }

    fn fixture_state() -> (AncestryState, Params) {
        let g = array![
            [0u8, 0, 1, 2, 2, 1],
            [2, 2, 1, 0, 0, MISSING_GENOTYPE],
            [1, 1, 1, 1, 1, 1],
            [0, 2, 0, 2, 0, 2]
        ];
        let params = Params::resolve(
            &ParamOverrides::default().with_nbclust(2).with_nb_iter(3),
            5,
        )
        .unwrap();
        let mut state = AncestryState::zeroed(g, 2);
        let mut rng = StdRng::seed_from_u64(1);
        DataInitializer::RANDOM
            .apply(&mut state, &params, &mut rng)
            .unwrap();
        (state, params)
    }

    #[test]
    fn every_unsupervised_schedule_keeps_state_consistent() {
        for kind in [
            OptimizerKind::Classic,
            OptimizerKind::ClassicProb,
            OptimizerKind::ClassicSha,
            OptimizerKind::Grad,
            OptimizerKind::Join,
            OptimizerKind::JoinBalance,
            OptimizerKind::OldH,
            OptimizerKind::JoinThenClassic,
            OptimizerKind::JoinThenClassicSampling,
        ] {
            let (mut state, params) = fixture_state();
            let mut rng = StdRng::seed_from_u64(2);
            Optimizer::new(kind)
                .run(&mut state, &params, &mut rng, &RunLog::new(kind.describe()).with_cost_trace(true))
                .unwrap();
            assert!(state.s.iter().all(|&l| l < 2), "{kind}");
            assert!(state.a.iter().all(|&x| (0.0..=1.0).contains(&x)), "{kind}");
            for ((i, j), &g) in state.g.indexed_iter() {
                if g != MISSING_GENOTYPE {
                    assert_eq!(state.h[[2 * i, j]] + state.h[[2 * i + 1, j]], g, "{kind}");
                }
            }
        }
    }

    #[test]
    fn kernel_errors_abort_the_run() {
        let (mut state, params) = fixture_state();
        let optimizer = Optimizer::custom("broken", vec![], vec![Arc::new(EstimateS), Arc::new(Failing)]);
        let err = optimizer
            .run(&mut state, &params, &mut StdRng::seed_from_u64(0), &RunLog::silent())
            .unwrap_err();
        assert_eq!(err.kernel, "failing");
        assert_eq!(err.parameter, "w_h");
    }
}
