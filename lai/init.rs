//! Starting points for the alternating optimization.

use crate::error::{LaiError, check_shape};
use crate::tree::PathTree;
use crate::types::{AncestryState, Params, is_missing_genotype};
use ndarray::{Array2, ArrayView2, Axis, ShapeError, concatenate, s};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::seq::index::sample;

/// How the cluster profile `A` is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileInit {
    /// Independent 0/1 draws.
    Random,
    /// Every even cluster all ones, every odd cluster all zeros.
    Deterministic,
    /// Each column copies the homozygous calls of `k` distinct random individuals.
    FromGenotypes,
    /// Distinct genotype paths of growing windows around a random split column.
    Tree,
    /// Centroids of a k-means clustering of `G / 2`.
    KMeans,
    /// The profile supplied in the parameter fixtures.
    Fixed,
}

/// How the haplotypes `H` are seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HaplotypeInit {
    /// Heterozygous calls phased by a fair coin.
    Random,
    /// Heterozygous calls put allele 1 on the second haplotype.
    Deterministic,
    /// The haplotypes supplied in the parameter fixtures.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataInitializer {
    pub profile: ProfileInit,
    pub haplotypes: HaplotypeInit,
}

impl DataInitializer {
    pub const RANDOM: Self = Self::new(ProfileInit::Random, HaplotypeInit::Random);
    pub const DETERMINISTIC: Self = Self::new(ProfileInit::Deterministic, HaplotypeInit::Random);
    pub const FROM_GENOTYPES: Self = Self::new(ProfileInit::FromGenotypes, HaplotypeInit::Random);
    pub const TREE: Self = Self::new(ProfileInit::Tree, HaplotypeInit::Random);
    pub const KMEANS: Self = Self::new(ProfileInit::KMeans, HaplotypeInit::Random);
    pub const FIXED_PROFILE: Self = Self::new(ProfileInit::Fixed, HaplotypeInit::Random);
    pub const FIXED_PROFILE_AND_HAPLOTYPES: Self =
        Self::new(ProfileInit::Fixed, HaplotypeInit::Fixed);

    pub const fn new(profile: ProfileInit, haplotypes: HaplotypeInit) -> Self {
        Self {
            profile,
            haplotypes,
        }
    }

    /// Fills `A` and `H` of a freshly zeroed state.
    pub fn apply(
        &self,
        state: &mut AncestryState,
        params: &Params,
        rng: &mut StdRng,
    ) -> Result<(), LaiError> {
        let (k, m) = (params.nbclust, state.n_snps());
        state.a = match self.profile {
            ProfileInit::Random => init_a_random(k, m, rng),
            ProfileInit::Deterministic => init_a_deterministic(k, m),
            ProfileInit::FromGenotypes => init_a_from_genotypes(state.g.view(), k, rng)?,
            ProfileInit::Tree => init_a_tree(state.g.view(), k, rng)?,
            ProfileInit::KMeans => init_a_kmeans(state.g.view(), k, rng)?,
            ProfileInit::Fixed => {
                let a_in = params
                    .fixtures
                    .a_in
                    .as_ref()
                    .ok_or(LaiError::MissingFixture("a_in"))?;
                check_shape("fixed cluster profile", (k, m), a_in.dim())?;
                a_in.clone()
            }
        };
        let h_shape = (2 * state.n_individuals(), m);
        state.h = match self.haplotypes {
            HaplotypeInit::Random => init_h_random(state.g.view(), rng),
            HaplotypeInit::Deterministic => init_h_deterministic(state.g.view()),
            HaplotypeInit::Fixed => {
                let h_in = params
                    .fixtures
                    .h_in
                    .as_ref()
                    .ok_or(LaiError::MissingFixture("h_in"))?;
                check_shape("fixed haplotypes", h_shape, h_in.dim())?;
                h_in.clone()
            }
        };
        Ok(())
    }
}

pub fn init_a_random(k: usize, m: usize, rng: &mut StdRng) -> Array2<f32> {
    Array2::from_shape_fn((k, m), |_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 })
}

pub fn init_a_deterministic(k: usize, m: usize) -> Array2<f32> {
    Array2::from_shape_fn((k, m), |(l, _)| if l % 2 == 0 { 1.0 } else { 0.0 })
}

pub fn init_a_from_genotypes(
    g: ArrayView2<u8>,
    k: usize,
    rng: &mut StdRng,
) -> Result<Array2<f32>, LaiError> {
    let (n, m) = g.dim();
    if k > n {
        return Err(LaiError::TooFewIndividuals {
            initializer: "profile from genotypes",
            requested: k,
            available: n,
        });
    }
    let mut a = Array2::zeros((k, m));
    for j in 0..m {
        for (l, ind) in sample(rng, n, k).into_iter().enumerate() {
            a[[l, j]] = match g[[ind, j]] {
                0 => 0.0,
                2 => 1.0,
                _ => {
                    if rng.gen_bool(0.5) {
                        1.0
                    } else {
                        0.0
                    }
                }
            };
        }
    }
    Ok(a)
}

/// Tree-split profile: windows grow leftward from a random split column and
/// rightward from it until they admit at least `k` distinct allele paths.
pub fn init_a_tree(
    g: ArrayView2<u8>,
    k: usize,
    rng: &mut StdRng,
) -> Result<Array2<f32>, LaiError> {
    let m = g.ncols();
    let split = if m >= 3 { rng.gen_range(1..m - 1) } else { 0 };

    let mut head = g.slice(s![.., ..split]).to_owned();
    head.invert_axis(Axis(1));
    let mut head_paths = window_paths(head.view(), k, rng)?;
    head_paths.invert_axis(Axis(1));
    let tail_paths = window_paths(g.slice(s![.., split..]), k, rng)?;

    let joined = concatenate(Axis(1), &[head_paths.view(), tail_paths.view()])?;
    Ok(joined.mapv(f32::from))
}

/// Concatenates, window by window, exactly `k` shuffled allele paths.
fn window_paths(
    g: ArrayView2<u8>,
    k: usize,
    rng: &mut StdRng,
) -> Result<Array2<u8>, ShapeError> {
    let m = g.ncols();
    let mut out = Array2::<u8>::zeros((k, m));
    if g.nrows() == 0 {
        return Ok(out);
    }
    let mut start = 0usize;
    while start < m {
        let mut end = start + 1;
        let mut tree = PathTree::build(g.slice(s![.., start..end]));
        while tree.width() < k && end < m {
            end += 1;
            tree = PathTree::build(g.slice(s![.., start..end]));
        }

        let paths = tree.paths()?;
        let mut rows: Vec<usize> = (0..paths.nrows()).collect();
        while rows.len() < k {
            rows.push(rng.gen_range(0..paths.nrows()));
        }
        rows.shuffle(rng);
        rows.truncate(k);
        for (l, &src) in rows.iter().enumerate() {
            out.slice_mut(s![l, start..end]).assign(&paths.row(src));
        }
        start = end;
    }
    Ok(out)
}

/// k-means++ seeding followed by Lloyd iterations over `G / 2`.
pub fn init_a_kmeans(
    g: ArrayView2<u8>,
    k: usize,
    rng: &mut StdRng,
) -> Result<Array2<f32>, LaiError> {
    let (n, m) = g.dim();
    if k > n || k == 0 {
        return Err(LaiError::TooFewIndividuals {
            initializer: "k-means profile",
            requested: k,
            available: n,
        });
    }
    let data = g.mapv(|x| {
        if is_missing_genotype(x) {
            0.5
        } else {
            f64::from(x) / 2.0
        }
    });
    let sq_dist = |i: usize, c: &Array2<f64>, l: usize| -> f64 {
        data.row(i)
            .iter()
            .zip(c.row(l))
            .map(|(x, y)| (x - y) * (x - y))
            .sum()
    };

    let mut centroids = Array2::<f64>::zeros((k, m));
    centroids.row_mut(0).assign(&data.row(rng.gen_range(0..n)));
    for c in 1..k {
        let dists: Vec<f64> = (0..n)
            .map(|i| (0..c).map(|l| sq_dist(i, &centroids, l)).fold(f64::INFINITY, f64::min))
            .collect();
        let total: f64 = dists.iter().sum();
        let chosen = if total == 0.0 {
            c % n
        } else {
            let threshold = rng.gen_range(0.0..total);
            let mut cumulative = 0.0;
            dists
                .iter()
                .position(|&d| {
                    cumulative += d;
                    cumulative >= threshold
                })
                .unwrap_or(n - 1)
        };
        centroids.row_mut(c).assign(&data.row(chosen));
    }

    const MAX_ITER: usize = 300;
    const TOLERANCE: f64 = 1e-4;
    let mut labels = vec![0usize; n];
    for _ in 0..MAX_ITER {
        for (i, label) in labels.iter_mut().enumerate() {
            let mut best = (f64::INFINITY, 0usize);
            for l in 0..k {
                let d = sq_dist(i, &centroids, l);
                if d < best.0 {
                    best = (d, l);
                }
            }
            *label = best.1;
        }
        let mut updated = Array2::<f64>::zeros((k, m));
        let mut counts = vec![0usize; k];
        for (i, &l) in labels.iter().enumerate() {
            counts[l] += 1;
            let mut row = updated.row_mut(l);
            row += &data.row(i);
        }
        for l in 0..k {
            if counts[l] > 0 {
                updated.row_mut(l).mapv_inplace(|x| x / counts[l] as f64);
            } else {
                updated.row_mut(l).assign(&centroids.row(l));
            }
        }
        let shift = (&updated - &centroids)
            .rows()
            .into_iter()
            .map(|r| r.dot(&r).sqrt())
            .fold(0.0f64, f64::max);
        centroids = updated;
        if shift < TOLERANCE {
            break;
        }
    }
    Ok(centroids.mapv(|x| x.clamp(0.0, 1.0) as f32))
}

/// Homozygous sites take `G / 2` on both haplotypes; heterozygous sites put
/// allele 1 on the second haplotype; missing sites start at 0.
pub fn init_h_deterministic(g: ArrayView2<u8>) -> Array2<u8> {
    let (n, m) = g.dim();
    Array2::from_shape_fn((2 * n, m), |(row, j)| match g[[row / 2, j]] {
        0 => 0,
        2 => 1,
        1 => (row % 2) as u8,
        _ => 0,
    })
}

/// Like [`init_h_deterministic`] but heterozygous sites are phased at random.
pub fn init_h_random(g: ArrayView2<u8>, rng: &mut StdRng) -> Array2<u8> {
    let (n, m) = g.dim();
    let mut h = Array2::zeros((2 * n, m));
    for ((i, j), &gij) in g.indexed_iter() {
        let (h1, h2) = match gij {
            0 => (0, 0),
            2 => (1, 1),
            1 => {
                if rng.gen_bool(0.5) {
                    (1, 0)
                } else {
                    (0, 1)
                }
            }
            _ => (0, 0),
        };
        h[[2 * i, j]] = h1;
        h[[2 * i + 1, j]] = h2;
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fixtures, MISSING_GENOTYPE, ParamOverrides};
    use ndarray::array;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    fn genotypes() -> Array2<u8> {
        array![
            [0u8, 1, 2, 2, 0, 1],
            [2, 1, 0, 0, 2, MISSING_GENOTYPE],
            [1, 1, 1, 0, 0, 2],
            [0, 0, 2, 1, 1, 1]
        ]
    }

    fn assert_pairs_sum_to_genotype(g: &Array2<u8>, h: &Array2<u8>) {
        for ((i, j), &gij) in g.indexed_iter() {
            if gij != MISSING_GENOTYPE {
                assert_eq!(h[[2 * i, j]] + h[[2 * i + 1, j]], gij);
            }
        }
    }

    #[test]
    fn haplotype_initializers_respect_genotypes() {
        let g = genotypes();
        assert_pairs_sum_to_genotype(&g, &init_h_random(g.view(), &mut rng()));
        let deter = init_h_deterministic(g.view());
        assert_pairs_sum_to_genotype(&g, &deter);
        assert_eq!(deter[[0, 1]], 0);
        assert_eq!(deter[[1, 1]], 1);
    }

    #[test]
    fn deterministic_profile_alternates_rows() {
        let a = init_a_deterministic(3, 2);
        assert_eq!(a, array![[1.0f32, 1.0], [0.0, 0.0], [1.0, 1.0]]);
    }

    #[test]
    fn genotype_profile_copies_homozygous_calls() {
        let g = array![[0u8, 2], [0, 2], [0, 2]];
        let a = init_a_from_genotypes(g.view(), 2, &mut rng()).unwrap();
        assert_eq!(a, array![[0.0f32, 1.0], [0.0, 1.0]]);
        assert!(matches!(
            init_a_from_genotypes(g.view(), 4, &mut rng()),
            Err(LaiError::TooFewIndividuals { requested: 4, .. })
        ));
    }

    #[test]
    fn tree_profile_has_requested_shape_and_binary_values() {
        let g = genotypes();
        let a = init_a_tree(g.view(), 3, &mut rng()).unwrap();
        assert_eq!(a.dim(), (3, 6));
        assert!(a.iter().all(|&x| x == 0.0 || x == 1.0));
    }

    #[test]
    fn tree_profile_of_an_empty_panel_is_zero() {
        let no_individuals = Array2::<u8>::zeros((0, 4));
        let a = init_a_tree(no_individuals.view(), 2, &mut rng()).unwrap();
        assert_eq!(a, Array2::<f32>::zeros((2, 4)));
        let no_snps = Array2::<u8>::zeros((3, 0));
        assert_eq!(init_a_tree(no_snps.view(), 2, &mut rng()).unwrap().dim(), (2, 0));
    }

    #[test]
    fn tree_windows_reproduce_homozygous_columns() {
        // With one individual and k = 1 every window is a single path.
        let g = array![[0u8, 2, 2, 0, 2]];
        let a = init_a_tree(g.view(), 1, &mut rng()).unwrap();
        assert_eq!(a, array![[0.0f32, 1.0, 1.0, 0.0, 1.0]]);
    }

    #[test]
    fn kmeans_separates_distinct_groups() {
        let g = array![[0u8, 0, 0, 0], [0, 0, 0, 0], [2, 2, 2, 2], [2, 2, 2, 2]];
        let a = init_a_kmeans(g.view(), 2, &mut rng()).unwrap();
        let mut rows: Vec<f32> = a.rows().into_iter().map(|r| r[0]).collect();
        rows.sort_by(|x, y| x.total_cmp(y));
        assert_eq!(rows, vec![0.0, 1.0]);
    }

    #[test]
    fn fixed_fixtures_are_shape_checked() {
        let g = genotypes();
        let mut state = AncestryState::zeroed(g, 2);
        let params = Params::resolve(&ParamOverrides::default().with_nbclust(2), 0)
            .unwrap()
            .with_fixtures(Fixtures {
                a_in: Some(Array2::zeros((2, 5))),
                ..Fixtures::default()
            });
        let err = DataInitializer::FIXED_PROFILE
            .apply(&mut state, &params, &mut rng())
            .unwrap_err();
        assert!(matches!(
            err,
            LaiError::ShapeMismatch {
                expected: (2, 6),
                found: (2, 5),
                ..
            }
        ));

        let missing = Params::resolve(&ParamOverrides::default().with_nbclust(2), 0).unwrap();
        assert!(matches!(
            DataInitializer::FIXED_PROFILE.apply(&mut state, &missing, &mut rng()),
            Err(LaiError::MissingFixture("a_in"))
        ));
    }
}
