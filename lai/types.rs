use ndarray::{Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Genotype value marking an unobserved call.
pub const MISSING_GENOTYPE: u8 = 3;
/// Haplotype allele or ancestry label marking an unknown cell.
pub const MISSING_LABEL: u8 = 255;

pub const DEFAULT_PENALTY: f64 = 2.0;
pub const DEFAULT_NBCLUST: i64 = 10;
pub const DEFAULT_W_H: f64 = 100.0;
pub const DEFAULT_NB_ITER: i64 = 10;
pub const DEFAULT_SMALL_PENALTY: f64 = 0.0;
pub const DEFAULT_ETA: f64 = 0.1;
pub const DEFAULT_SEED: u64 = 42;

/// Returns true for any genotype the kernels treat as unobserved.
#[inline]
pub fn is_missing_genotype(g: u8) -> bool {
    g > 2
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("Penalty must be a non-negative number, but was {0}.")]
    InvalidPenalty(f64),
    #[error("Small penalty must be a non-negative number, but was {0}.")]
    InvalidSmallPenalty(f64),
    #[error("Number of clusters must be non-negative, but was {0}.")]
    NegativeClusterCount(i64),
    #[error("Homozygous weight w_h must be a non-negative number, but was {0}.")]
    InvalidHomozygousWeight(f64),
    #[error("Number of iterations must be positive, but was {0}.")]
    NonPositiveIterations(i64),
    #[error("Thread count must be positive, but was {0}.")]
    NonPositiveThreads(i64),
    #[error("{name} must lie in [0, 1], but was {value}.")]
    OutOfUnitRange { name: &'static str, value: f64 },
    #[error("The lambda range is empty.")]
    EmptyLambdaRange,
    #[error("Lambda values must be finite and non-negative, but found {0}.")]
    InvalidLambda(f64),
    #[error("Lambda bounds are inverted: min_lambda ({min}) > max_lambda ({max}).")]
    InvertedLambdaBounds { min: f64, max: f64 },
}

/// Caller-supplied parameter values layered over the defaults.
///
/// Every field is optional so that a TOML file, the command line and the
/// cross-validation grid can each contribute only what they know.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParamOverrides {
    pub penalty: Option<f64>,
    pub nbclust: Option<i64>,
    pub w_h: Option<f64>,
    pub nb_iter: Option<i64>,
    pub num_threads: Option<i64>,
    pub small_penalty: Option<f64>,
    pub eta: Option<f64>,
}

impl ParamOverrides {
    pub fn with_penalty(mut self, penalty: f64) -> Self {
        self.penalty = Some(penalty);
        self
    }

    pub fn with_nbclust(mut self, nbclust: i64) -> Self {
        self.nbclust = Some(nbclust);
        self
    }

    pub fn with_w_h(mut self, w_h: f64) -> Self {
        self.w_h = Some(w_h);
        self
    }

    pub fn with_nb_iter(mut self, nb_iter: i64) -> Self {
        self.nb_iter = Some(nb_iter);
        self
    }

    pub fn with_num_threads(mut self, num_threads: i64) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn with_small_penalty(mut self, small_penalty: f64) -> Self {
        self.small_penalty = Some(small_penalty);
        self
    }

    /// Fills every unset field of `self` from `base`.
    pub fn layered_over(&self, base: &ParamOverrides) -> ParamOverrides {
        ParamOverrides {
            penalty: self.penalty.or(base.penalty),
            nbclust: self.nbclust.or(base.nbclust),
            w_h: self.w_h.or(base.w_h),
            nb_iter: self.nb_iter.or(base.nb_iter),
            num_threads: self.num_threads.or(base.num_threads),
            small_penalty: self.small_penalty.or(base.small_penalty),
            eta: self.eta.or(base.eta),
        }
    }
}

/// Workflow-specific arrays that stay fixed for the lifetime of a trial.
#[derive(Debug, Clone, Default)]
pub struct Fixtures {
    /// Fixed cluster profile, one row per cluster.
    pub a_in: Option<Array2<f32>>,
    /// Fixed haplotypes, two rows per individual.
    pub h_in: Option<Array2<u8>>,
    /// Per-SNP mismatch weights for reference copying.
    pub weights: Option<Array1<f32>>,
}

/// The validated parameter record of one trial.
#[derive(Debug, Clone)]
pub struct Params {
    pub penalty: f32,
    pub nbclust: usize,
    pub w_h: f32,
    pub nb_iter: usize,
    pub num_threads: usize,
    pub small_penalty: f32,
    pub eta: f32,
    pub seed: u64,
    pub fixtures: Fixtures,
}

impl Params {
    /// Resolves overrides against the defaults, rejecting invalid values.
    pub fn resolve(overrides: &ParamOverrides, seed: u64) -> Result<Self, ParamError> {
        let penalty = overrides.penalty.unwrap_or(DEFAULT_PENALTY);
        if !penalty.is_finite() || penalty < 0.0 {
            return Err(ParamError::InvalidPenalty(penalty));
        }
        let small_penalty = overrides.small_penalty.unwrap_or(DEFAULT_SMALL_PENALTY);
        if !small_penalty.is_finite() || small_penalty < 0.0 {
            return Err(ParamError::InvalidSmallPenalty(small_penalty));
        }
        let nbclust = overrides.nbclust.unwrap_or(DEFAULT_NBCLUST);
        if nbclust < 0 {
            return Err(ParamError::NegativeClusterCount(nbclust));
        }
        let w_h = overrides.w_h.unwrap_or(DEFAULT_W_H);
        if !w_h.is_finite() || w_h < 0.0 {
            return Err(ParamError::InvalidHomozygousWeight(w_h));
        }
        let nb_iter = overrides.nb_iter.unwrap_or(DEFAULT_NB_ITER);
        if nb_iter <= 0 {
            return Err(ParamError::NonPositiveIterations(nb_iter));
        }
        let num_threads = overrides.num_threads.unwrap_or(1);
        if num_threads <= 0 {
            return Err(ParamError::NonPositiveThreads(num_threads));
        }
        let eta = overrides.eta.unwrap_or(DEFAULT_ETA);
        if !(0.0..=1.0).contains(&eta) {
            return Err(ParamError::OutOfUnitRange { name: "eta", value: eta });
        }

        Ok(Self {
            penalty: penalty as f32,
            nbclust: nbclust as usize,
            w_h: w_h as f32,
            nb_iter: nb_iter as usize,
            num_threads: num_threads as usize,
            small_penalty: small_penalty as f32,
            eta: eta as f32,
            seed,
            fixtures: Fixtures::default(),
        })
    }

    pub fn with_fixtures(mut self, fixtures: Fixtures) -> Self {
        self.fixtures = fixtures;
        self
    }
}

/// The four matrices a trial optimizes.
///
/// `g` is n x m, `h` and `s` are 2n x m, `a` is k x m.
#[derive(Debug, Clone)]
pub struct AncestryState {
    pub g: Array2<u8>,
    pub h: Array2<u8>,
    pub a: Array2<f32>,
    pub s: Array2<u32>,
}

impl AncestryState {
    /// Allocates zeroed `H`, `A` and `S` matching the genotype matrix.
    pub fn zeroed(g: Array2<u8>, nbclust: usize) -> Self {
        let (n, m) = g.dim();
        Self {
            h: Array2::zeros((2 * n, m)),
            a: Array2::zeros((nbclust, m)),
            s: Array2::zeros((2 * n, m)),
            g,
        }
    }

    pub fn n_individuals(&self) -> usize {
        self.g.nrows()
    }

    pub fn n_snps(&self) -> usize {
        self.g.ncols()
    }

    pub fn n_clusters(&self) -> usize {
        self.a.nrows()
    }
}

/// Sums each individual's two haplotype rows into a genotype row.
///
/// A cell is missing when either allele is unknown.
pub fn genotypes_from_haplotypes(h: ArrayView2<u8>) -> Option<Array2<u8>> {
    if h.nrows() % 2 != 0 {
        return None;
    }
    let n = h.nrows() / 2;
    let mut g = Array2::zeros((n, h.ncols()));
    for ((i, j), cell) in g.indexed_iter_mut() {
        let (a1, a2) = (h[[2 * i, j]], h[[2 * i + 1, j]]);
        *cell = if a1 > 1 || a2 > 1 { MISSING_GENOTYPE } else { a1 + a2 };
    }
    Some(g)
}

/// Seed of the stream at coordinates `parts` under `base`: each coordinate
/// offsets the first draw of the previous level's generator.
pub fn derive_seed(base: u64, parts: &[u64]) -> u64 {
    parts
        .iter()
        .fold(StdRng::seed_from_u64(base).next_u64(), |acc, &part| {
            StdRng::seed_from_u64(acc.wrapping_add(part)).next_u64()
        })
}
