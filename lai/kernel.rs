//! Single-iteration updates of the trial matrices.
//!
//! Each kernel reads the current [`AncestryState`] and rewrites one matrix in
//! place. Kernels validate their contract up front and never fail halfway
//! through an update, so a returned error leaves the state untouched.

use crate::assignment::max_weight_assignment;
use crate::types::{AncestryState, Params, is_missing_genotype};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::fmt;
use thiserror::Error;

/// The matrix a kernel rewrites.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatrixKind {
    Selection,
    Profile,
    Haplotype,
}

impl MatrixKind {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Selection => "S",
            Self::Profile => "A",
            Self::Haplotype => "H",
        }
    }
}

impl fmt::Display for MatrixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Kernel '{kernel}' could not update {matrix} ({parameter} = {value}): {message}")]
pub struct KernelError {
    pub kernel: &'static str,
    pub matrix: MatrixKind,
    pub parameter: &'static str,
    pub value: String,
    pub message: String,
}

/// One step of the alternating optimization.
pub trait StepKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn target(&self) -> MatrixKind;
    fn update(
        &self,
        state: &mut AncestryState,
        params: &Params,
        rng: &mut StdRng,
    ) -> Result<(), KernelError>;
}

struct Contract {
    kernel: &'static str,
    matrix: MatrixKind,
}

impl Contract {
    fn of<K: StepKernel + ?Sized>(kernel: &K) -> Self {
        Self {
            kernel: kernel.name(),
            matrix: kernel.target(),
        }
    }

    fn fail(&self, parameter: &'static str, value: impl ToString, message: impl Into<String>) -> KernelError {
        KernelError {
            kernel: self.kernel,
            matrix: self.matrix,
            parameter,
            value: value.to_string(),
            message: message.into(),
        }
    }

    fn non_negative(&self, parameter: &'static str, value: f32) -> Result<(), KernelError> {
        if value.is_finite() && value >= 0.0 {
            Ok(())
        } else {
            Err(self.fail(parameter, value, "must be a finite, non-negative number"))
        }
    }

    /// Checks `H`, `S` are 2n x m and `A` has m columns and at least one row.
    fn shapes(&self, state: &AncestryState) -> Result<(), KernelError> {
        let (n, m) = state.g.dim();
        if state.a.nrows() == 0 {
            return Err(self.fail("nbclust", 0, "at least one cluster is required"));
        }
        if state.a.ncols() != m {
            return Err(self.fail(
                "A.cols",
                state.a.ncols(),
                format!("profile must have {m} columns"),
            ));
        }
        if state.h.dim() != (2 * n, m) {
            return Err(self.fail(
                "H.shape",
                format!("{:?}", state.h.dim()),
                format!("haplotypes must be {:?}", (2 * n, m)),
            ));
        }
        if state.s.dim() != (2 * n, m) {
            return Err(self.fail(
                "S.shape",
                format!("{:?}", state.s.dim()),
                format!("selection must be {:?}", (2 * n, m)),
            ));
        }
        Ok(())
    }

    fn selection_in_range(&self, state: &AncestryState) -> Result<(), KernelError> {
        let k = state.a.nrows();
        match state.s.iter().copied().find(|&l| l as usize >= k) {
            Some(bad) => Err(self.fail(
                "S",
                bad,
                format!("selection indexes a cluster outside 0..{k}"),
            )),
            None => Ok(()),
        }
    }
}

#[inline]
fn sq(x: f32) -> f32 {
    x * x
}

/// First index of the smallest value; ties resolve to the lowest index.
fn first_min(values: &[f32]) -> (f32, usize) {
    let mut best = (f32::MAX, 0usize);
    for (idx, &v) in values.iter().enumerate() {
        if v < best.0 {
            best = (v, idx);
        }
    }
    best
}

// ========================================================================================
//                                  Selection kernels
// ========================================================================================

/// Viterbi segmentation of every haplotype row over the cluster profiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateS;

impl StepKernel for EstimateS {
    fn name(&self) -> &'static str {
        "estimate_s"
    }

    fn target(&self) -> MatrixKind {
        MatrixKind::Selection
    }

    fn update(
        &self,
        state: &mut AncestryState,
        params: &Params,
        _rng: &mut StdRng,
    ) -> Result<(), KernelError> {
        let contract = Contract::of(self);
        contract.non_negative("penalty", params.penalty)?;
        contract.shapes(state)?;

        let (g, h, a) = (&state.g, &state.h, &state.a);
        let penalty = params.penalty;
        state
            .s
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, s_row)| {
                viterbi_row(h.row(row), g.row(row / 2), a.view(), penalty, s_row);
            });
        Ok(())
    }
}

fn viterbi_row(
    h: ArrayView1<u8>,
    g: ArrayView1<u8>,
    a: ArrayView2<f32>,
    penalty: f32,
    mut out: ArrayViewMut1<u32>,
) {
    let (k, m) = a.dim();
    if m == 0 {
        return;
    }
    let mut cost: Vec<f32> = (0..k).map(|l| sq(h[0] as f32 - a[[l, 0]])).collect();
    let mut next = vec![0.0f32; k];
    let mut path = vec![0u32; k * m];
    let (mut mini, mut mini_idx) = first_min(&cost);

    for j in 1..m {
        let back = &mut path[j * k..(j + 1) * k];
        if is_missing_genotype(g[j]) {
            for (l, p) in back.iter_mut().enumerate() {
                *p = l as u32;
            }
            continue;
        }
        let hj = h[j] as f32;
        let jump = mini + penalty;
        for l in 0..k {
            let error = sq(hj - a[[l, j]]);
            if l == mini_idx {
                next[l] = cost[l] + error;
                back[l] = mini_idx as u32;
            } else if jump < cost[l] {
                next[l] = jump + error;
                back[l] = mini_idx as u32;
            } else {
                next[l] = cost[l] + error;
                back[l] = l as u32;
            }
        }
        std::mem::swap(&mut cost, &mut next);
        (mini, mini_idx) = first_min(&cost);
    }

    let mut idx = mini_idx;
    for j in (0..m).rev() {
        out[j] = idx as u32;
        idx = path[j * k + idx] as usize;
    }
}

/// Joint segmentation of both haplotypes of an individual over cluster pairs.
///
/// The haplotypes are implied by the genotype and the profiles, so this kernel
/// also resolves phase; follow it with [`EstimateH`] to materialize `H`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateSH;

impl StepKernel for EstimateSH {
    fn name(&self) -> &'static str {
        "estimate_sh"
    }

    fn target(&self) -> MatrixKind {
        MatrixKind::Selection
    }

    fn update(
        &self,
        state: &mut AncestryState,
        params: &Params,
        _rng: &mut StdRng,
    ) -> Result<(), KernelError> {
        let contract = Contract::of(self);
        contract.non_negative("penalty", params.penalty)?;
        contract.shapes(state)?;
        joint_update(state, params.penalty, None);
        Ok(())
    }
}

/// [`EstimateSH`] with cheap hops between the two haplotypes of the same
/// reference individual (rows `2r` and `2r + 1` of `A`).
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateSHKnn;

impl StepKernel for EstimateSHKnn {
    fn name(&self) -> &'static str {
        "estimate_sh_knn"
    }

    fn target(&self) -> MatrixKind {
        MatrixKind::Selection
    }

    fn update(
        &self,
        state: &mut AncestryState,
        params: &Params,
        _rng: &mut StdRng,
    ) -> Result<(), KernelError> {
        let contract = Contract::of(self);
        contract.non_negative("penalty", params.penalty)?;
        contract.non_negative("small_penalty", params.small_penalty)?;
        contract.shapes(state)?;
        joint_update(state, params.penalty, Some(params.small_penalty));
        Ok(())
    }
}

fn joint_update(state: &mut AncestryState, penalty: f32, sibling_penalty: Option<f32>) {
    let (g, a) = (&state.g, &state.a);
    state
        .s
        .axis_chunks_iter_mut(Axis(0), 2)
        .into_par_iter()
        .enumerate()
        .for_each(|(ind, pair)| {
            joint_viterbi(g.row(ind), a.view(), penalty, sibling_penalty, pair);
        });
}

/// Haplotype pair implied by a genotype and the two cluster frequencies.
#[inline]
fn implied_alleles(g: u8, a1: f32, a2: f32) -> (f32, f32) {
    if g == 0 || g == 2 {
        let half = (g / 2) as f32;
        (half, half)
    } else if a1 >= a2 {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    }
}

#[inline]
fn sibling(l: usize) -> usize {
    l ^ 1
}

/// Running minima over one column of pair costs. Ties resolve to the last
/// pair visited.
struct PairMinima {
    over_k1: Vec<(f32, usize)>,
    over_k2: Vec<(f32, usize)>,
    both: (f32, usize),
}

impl PairMinima {
    fn new(k: usize) -> Self {
        Self {
            over_k1: vec![(f32::MAX, 0); k],
            over_k2: vec![(f32::MAX, 0); k],
            both: (f32::MAX, 0),
        }
    }

    fn observe(&mut self, k1: usize, k2: usize, k: usize, cost: f32) {
        if self.over_k1[k2].0 >= cost {
            self.over_k1[k2] = (cost, k1);
        }
        if self.over_k2[k1].0 >= cost {
            self.over_k2[k1] = (cost, k2);
        }
        if self.both.0 >= cost {
            self.both = (cost, k1 * k + k2);
        }
    }
}

fn joint_viterbi(
    g: ArrayView1<u8>,
    a: ArrayView2<f32>,
    penalty: f32,
    sibling_penalty: Option<f32>,
    mut out: ArrayViewMut2<u32>,
) {
    let (k, m) = a.dim();
    if m == 0 {
        return;
    }
    let pairs = k * k;
    let mut cost = vec![0.0f32; pairs];
    let mut next = vec![0.0f32; pairs];
    let mut path = vec![0u32; pairs * m];

    let mut minima = PairMinima::new(k);
    for k1 in 0..k {
        for k2 in 0..k {
            let (a1, a2) = (a[[k1, 0]], a[[k2, 0]]);
            let (h1, h2) = implied_alleles(g[0], a1, a2);
            let c = sq(h1 - a1) + sq(h2 - a2);
            cost[k1 * k + k2] = c;
            minima.observe(k1, k2, k, c);
        }
    }

    for j in 1..m {
        let missing = is_missing_genotype(g[j]);
        let back = &mut path[j * pairs..(j + 1) * pairs];
        let mut fresh = PairMinima::new(k);
        for k1 in 0..k {
            for k2 in 0..k {
                let idx = k1 * k + k2;
                if missing {
                    next[idx] = cost[idx];
                    back[idx] = idx as u32;
                } else {
                    let (a1, a2) = (a[[k1, j]], a[[k2, j]]);
                    let (h1, h2) = implied_alleles(g[j], a1, a2);
                    let error = sq(h1 - a1) + sq(h2 - a2);

                    let (min_k1, arg_k1) = minima.over_k1[k2];
                    let (min_k2, arg_k2) = minima.over_k2[k1];
                    let (min_both, arg_both) = minima.both;
                    let mut best = (cost[idx], idx);
                    let mut consider = |candidate: f32, from: usize| {
                        if candidate < best.0 {
                            best = (candidate, from);
                        }
                    };
                    consider(penalty + min_k1, arg_k1 * k + k2);
                    consider(penalty + min_k2, k1 * k + arg_k2);
                    consider(2.0 * penalty + min_both, arg_both);
                    if let Some(small) = sibling_penalty {
                        let (s1, s2) = (sibling(k1), sibling(k2));
                        if s1 < k {
                            consider(cost[s1 * k + k2] + small, s1 * k + k2);
                        }
                        if s2 < k {
                            consider(cost[k1 * k + s2] + small, k1 * k + s2);
                        }
                        if s1 < k && s2 < k {
                            consider(cost[s1 * k + s2] + small, s1 * k + s2);
                        }
                    }
                    next[idx] = best.0 + error;
                    back[idx] = best.1 as u32;
                }
                fresh.observe(k1, k2, k, next[idx]);
            }
        }
        std::mem::swap(&mut cost, &mut next);
        minima = fresh;
    }

    let mut idx = minima.both.1;
    for j in (0..m).rev() {
        out[[0, j]] = (idx / k) as u32;
        out[[1, j]] = (idx % k) as u32;
        idx = path[j * pairs + idx] as usize;
    }
}

/// Reference copying: each admixed haplotype picks, per SNP, the reference
/// row it copies from. `A` holds the stacked reference haplotypes and `H` the
/// admixed haplotypes; both stay fixed.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateSKnn;

impl StepKernel for EstimateSKnn {
    fn name(&self) -> &'static str {
        "estimate_s_knn"
    }

    fn target(&self) -> MatrixKind {
        MatrixKind::Selection
    }

    fn update(
        &self,
        state: &mut AncestryState,
        params: &Params,
        _rng: &mut StdRng,
    ) -> Result<(), KernelError> {
        let contract = Contract::of(self);
        contract.non_negative("penalty", params.penalty)?;
        contract.shapes(state)?;
        let m = state.n_snps();
        let ones;
        let weights = match &params.fixtures.weights {
            Some(w) if w.len() != m => {
                return Err(contract.fail(
                    "weights.len",
                    w.len(),
                    format!("expected one weight per SNP ({m})"),
                ));
            }
            Some(w) => w,
            None => {
                ones = Array1::<f32>::ones(m);
                &ones
            }
        };

        let (h, a) = (&state.h, &state.a);
        let penalty = params.penalty;
        state
            .s
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, s_row)| {
                copy_path_row(h.row(row), a.view(), weights.view(), penalty, s_row);
            });
        Ok(())
    }
}

fn copy_path_row(
    h: ArrayView1<u8>,
    a: ArrayView2<f32>,
    weights: ArrayView1<f32>,
    penalty: f32,
    mut out: ArrayViewMut1<u32>,
) {
    let (k, m) = a.dim();
    if m == 0 {
        return;
    }
    let mismatch = |l: usize, j: usize| -> f32 {
        if a[[l, j]] != h[j] as f32 { 1.0 } else { 0.0 }
    };

    let mut cost: Vec<f32> = if h[0] <= 1 {
        (0..k).map(|l| mismatch(l, 0)).collect()
    } else {
        vec![0.0; k]
    };
    let mut next = vec![0.0f32; k];
    let mut path = vec![0u32; k * m];
    let (mut mini, mut min_idx) = first_min(&cost);

    for j in 1..m {
        let back = &mut path[j * k..(j + 1) * k];
        let jump = mini + penalty;
        let observed = h[j] <= 1;
        for l in 0..k {
            let carried = cost[l].min(jump);
            next[l] = if observed {
                weights[j] * mismatch(l, j) + carried
            } else {
                carried
            };
            back[l] = if cost[l] - jump <= 0.0 { l as u32 } else { min_idx as u32 };
        }
        std::mem::swap(&mut cost, &mut next);
        if observed {
            (mini, min_idx) = first_min(&cost);
        }
    }

    let mut idx = min_idx;
    for j in (0..m).rev() {
        out[j] = idx as u32;
        idx = path[j * k + idx] as usize;
    }
}

/// Relabels clusters column by column so that consecutive SNPs agree as much
/// as possible, permuting the profile rows to match.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceSA;

impl StepKernel for BalanceSA {
    fn name(&self) -> &'static str {
        "balance_sa"
    }

    fn target(&self) -> MatrixKind {
        MatrixKind::Selection
    }

    fn update(
        &self,
        state: &mut AncestryState,
        _params: &Params,
        _rng: &mut StdRng,
    ) -> Result<(), KernelError> {
        let contract = Contract::of(self);
        contract.shapes(state)?;
        contract.selection_in_range(state)?;

        let k = state.n_clusters();
        let mut weights = Array2::<f64>::zeros((k, k));
        for j in 1..state.n_snps() {
            weights.fill(0.0);
            for row in 0..state.s.nrows() {
                let prev = state.s[[row, j - 1]] as usize;
                let curr = state.s[[row, j]] as usize;
                weights[[prev, curr]] += 1.0;
            }
            // perm[x] = y: label y in column j continues label x from column j-1.
            let perm = max_weight_assignment(&weights);
            let mut relabel = vec![0u32; k];
            for (x, &y) in perm.iter().enumerate() {
                relabel[y] = x as u32;
            }
            for label in state.s.column_mut(j) {
                *label = relabel[*label as usize];
            }
            let column: Vec<f32> = perm.iter().map(|&y| state.a[[y, j]]).collect();
            for (x, value) in column.into_iter().enumerate() {
                state.a[[x, j]] = value;
            }
        }
        Ok(())
    }
}

// ========================================================================================
//                                  Profile kernels
// ========================================================================================

/// Per-column allele counts of every cluster, weighting homozygous calls by `w_h`.
fn cluster_counts(state: &AncestryState, j: usize, w_h: f32, n1: &mut [f32], n0: &mut [f32]) {
    n1.fill(0.0);
    n0.fill(0.0);
    for row in 0..state.h.nrows() {
        let weight = match state.g[[row / 2, j]] {
            1 => 1.0,
            0 | 2 => w_h,
            _ => continue,
        };
        let l = state.s[[row, j]] as usize;
        if state.h[[row, j]] == 0 {
            n0[l] += weight;
        } else {
            n1[l] += weight;
        }
    }
}

/// Maximum-likelihood cluster frequencies given `S` and `H`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateA;

impl StepKernel for EstimateA {
    fn name(&self) -> &'static str {
        "estimate_a"
    }

    fn target(&self) -> MatrixKind {
        MatrixKind::Profile
    }

    fn update(
        &self,
        state: &mut AncestryState,
        params: &Params,
        _rng: &mut StdRng,
    ) -> Result<(), KernelError> {
        let contract = Contract::of(self);
        contract.non_negative("w_h", params.w_h)?;
        contract.shapes(state)?;
        contract.selection_in_range(state)?;
        update_profile(state, params.w_h, |_, n1, n0| {
            if n1 + n0 == 0.0 { Some(0.5) } else { Some(n1 / (n1 + n0)) }
        });
        Ok(())
    }
}

/// Damped frequency update: `A <- (1 - eta) A + eta * n1 / (n1 + n0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateAGrad;

impl StepKernel for EstimateAGrad {
    fn name(&self) -> &'static str {
        "estimate_a_grad"
    }

    fn target(&self) -> MatrixKind {
        MatrixKind::Profile
    }

    fn update(
        &self,
        state: &mut AncestryState,
        params: &Params,
        _rng: &mut StdRng,
    ) -> Result<(), KernelError> {
        let contract = Contract::of(self);
        contract.non_negative("w_h", params.w_h)?;
        if !(0.0..=1.0).contains(&params.eta) {
            return Err(contract.fail("eta", params.eta, "step size must lie in [0, 1]"));
        }
        contract.shapes(state)?;
        contract.selection_in_range(state)?;
        let eta = params.eta;
        update_profile(state, params.w_h, |current, n1, n0| {
            let card = n1 + n0;
            (card != 0.0).then(|| (1.0 - eta) * current + eta * n1 / card)
        });
        Ok(())
    }
}

fn update_profile<F>(state: &mut AncestryState, w_h: f32, rule: F)
where
    F: Fn(f32, f32, f32) -> Option<f32> + Sync,
{
    let k = state.n_clusters();
    let mut profile = std::mem::take(&mut state.a);
    let snapshot = &*state;
    profile
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .enumerate()
        .for_each(|(j, mut column)| {
            let mut n1 = vec![0.0f32; k];
            let mut n0 = vec![0.0f32; k];
            cluster_counts(snapshot, j, w_h, &mut n1, &mut n0);
            for l in 0..k {
                if let Some(value) = rule(column[l], n1[l], n0[l]) {
                    column[l] = value;
                }
            }
        });
    state.a = profile;
}

// ========================================================================================
//                                  Haplotype kernel
// ========================================================================================

/// How a heterozygous genotype is split between the two haplotypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchRule {
    /// Allele 1 goes to the first haplotype with probability `a1 / (a1 + a2)`.
    Random,
    /// Allele 1 goes to the first haplotype with the posterior probability
    /// `a1 (1 - a2) / (a1 (1 - a2) + a2 (1 - a1))`.
    Probabilistic,
    /// Allele 1 goes to the haplotype whose cluster frequency is higher.
    Deterministic,
}

impl SwitchRule {
    fn first_carries_allele(self, a1: f32, a2: f32, rng: &mut StdRng) -> bool {
        let p = match self {
            Self::Deterministic => return a1 >= a2,
            Self::Random => {
                let norm = a1 + a2;
                if norm <= 0.001 { 0.5 } else { a1 / norm }
            }
            Self::Probabilistic => {
                let (w1, w2) = (a1 * (1.0 - a2), a2 * (1.0 - a1));
                let norm = w1 + w2;
                if norm <= 0.001 { 0.5 } else { w1 / norm }
            }
        };
        rng.gen_range(0.0f32..=1.0) <= p
    }
}

/// Phases every individual given `S` and `A`. Homozygous sites take `G / 2`,
/// missing genotypes take the rounded cluster frequencies.
#[derive(Debug, Clone, Copy)]
pub struct EstimateH {
    pub rule: SwitchRule,
}

impl EstimateH {
    pub const RANDOM: Self = Self {
        rule: SwitchRule::Random,
    };
    pub const PROBABILISTIC: Self = Self {
        rule: SwitchRule::Probabilistic,
    };
    pub const DETERMINISTIC: Self = Self {
        rule: SwitchRule::Deterministic,
    };
}

impl StepKernel for EstimateH {
    fn name(&self) -> &'static str {
        match self.rule {
            SwitchRule::Random => "estimate_h_random",
            SwitchRule::Probabilistic => "estimate_h_prob",
            SwitchRule::Deterministic => "estimate_h_deter",
        }
    }

    fn target(&self) -> MatrixKind {
        MatrixKind::Haplotype
    }

    fn update(
        &self,
        state: &mut AncestryState,
        _params: &Params,
        rng: &mut StdRng,
    ) -> Result<(), KernelError> {
        let contract = Contract::of(self);
        contract.shapes(state)?;
        contract.selection_in_range(state)?;

        let rule = self.rule;
        let seeds: Vec<u64> = (0..state.n_individuals()).map(|_| rng.next_u64()).collect();
        let (g, a, s) = (&state.g, &state.a, &state.s);
        state
            .h
            .axis_chunks_iter_mut(Axis(0), 2)
            .into_par_iter()
            .enumerate()
            .for_each(|(ind, mut pair)| {
                let mut local = StdRng::seed_from_u64(seeds[ind]);
                for j in 0..g.ncols() {
                    let a1 = a[[s[[2 * ind, j]] as usize, j]];
                    let a2 = a[[s[[2 * ind + 1, j]] as usize, j]];
                    let (h1, h2) = match g[[ind, j]] {
                        0 => (0, 0),
                        2 => (1, 1),
                        1 => {
                            if rule.first_carries_allele(a1, a2, &mut local) {
                                (1, 0)
                            } else {
                                (0, 1)
                            }
                        }
                        _ => ((a1 + 0.5) as u8, (a2 + 0.5) as u8),
                    };
                    pair[[0, j]] = h1;
                    pair[[1, j]] = h2;
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MISSING_GENOTYPE, ParamOverrides};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn params(penalty: f64) -> Params {
        Params::resolve(&ParamOverrides::default().with_penalty(penalty), 0).unwrap()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(3)
    }

    fn fixture(a: Array2<f32>) -> AncestryState {
        let g = array![[2u8, 2, 0, 0], [1, 1, 0, 0], [1, 1, 1, 1]];
        let h = array![
            [1u8, 1, 0, 0],
            [1, 1, 0, 0],
            [1, 0, 0, 0],
            [0, 1, 0, 0],
            [1, 1, 1, 1],
            [0, 0, 0, 0]
        ];
        AncestryState {
            g,
            h,
            s: Array2::zeros((6, 4)),
            a,
        }
    }

    #[test]
    fn viterbi_follows_profiles_without_penalty() {
        let mut state = fixture(array![[1.0f32, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 1.0]]);
        EstimateS.update(&mut state, &params(0.0), &mut rng()).unwrap();
        let expected = array![
            [0u32, 0, 0, 0],
            [0, 0, 0, 0],
            [0, 1, 0, 0],
            [1, 0, 0, 0],
            [0, 0, 1, 1],
            [1, 1, 0, 0]
        ];
        assert_eq!(state.s, expected);
    }

    #[test]
    fn viterbi_stays_put_under_large_penalty() {
        let mut state = fixture(array![[1.0f32, 1.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]]);
        EstimateS.update(&mut state, &params(5.0), &mut rng()).unwrap();
        for row in [0, 1, 2, 4] {
            assert!(state.s.row(row).iter().all(|&l| l == 0), "row {row}");
        }
        assert!(state.s.row(5).iter().all(|&l| l == 1));
    }

    #[test]
    fn viterbi_carries_through_missing_genotypes() {
        let mut state = AncestryState {
            g: array![[0u8, MISSING_GENOTYPE, 0]],
            h: array![[0u8, 1, 0], [0, 1, 0]],
            a: array![[0.0f32, 1.0, 0.0], [1.0, 1.0, 1.0]],
            s: Array2::zeros((2, 3)),
        };
        EstimateS.update(&mut state, &params(0.5), &mut rng()).unwrap();
        assert_eq!(state.s, Array2::<u32>::zeros((2, 3)));
    }

    #[test]
    fn negative_penalty_is_reported_with_context() {
        let mut state = fixture(Array2::zeros((2, 4)));
        let mut p = params(1.0);
        p.penalty = -1.0;
        let err = EstimateS.update(&mut state, &p, &mut rng()).unwrap_err();
        assert_eq!(err.matrix, MatrixKind::Selection);
        assert_eq!(err.parameter, "penalty");
        assert_eq!(err.value, "-1");
    }

    #[test]
    fn profile_shape_mismatch_is_reported() {
        let mut state = fixture(Array2::zeros((2, 3)));
        let err = EstimateA.update(&mut state, &params(1.0), &mut rng()).unwrap_err();
        assert_eq!(err.parameter, "A.cols");
    }

    #[test]
    fn joint_kernel_pairs_complementary_profiles() {
        let mut state = AncestryState {
            g: array![[1u8, 1, 1, 1, 1]],
            h: Array2::zeros((2, 5)),
            a: array![[0.0f32, 0.0, 0.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0, 1.0]],
            s: Array2::zeros((2, 5)),
        };
        EstimateSH.update(&mut state, &params(1.0), &mut rng()).unwrap();
        assert!(state.s.row(0).iter().all(|&l| l == 1));
        assert!(state.s.row(1).iter().all(|&l| l == 0));

        EstimateH::DETERMINISTIC
            .update(&mut state, &params(1.0), &mut rng())
            .unwrap();
        assert!(state.h.row(0).iter().all(|&x| x == 1));
        assert!(state.h.row(1).iter().all(|&x| x == 0));
    }

    #[test]
    fn sibling_hops_are_cheaper_than_jumps() {
        // One reference individual carrying two haplotypes; the admixed
        // individual switches between them halfway.
        let a = array![[1.0f32, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 1.0]];
        let mut state = AncestryState {
            g: array![[2u8, 2, 2, 2]],
            h: Array2::zeros((2, 4)),
            a,
            s: Array2::zeros((2, 4)),
        };
        let mut p = params(10.0);
        p.small_penalty = 0.1;
        EstimateSHKnn.update(&mut state, &p, &mut rng()).unwrap();
        assert_eq!(state.s.row(0), array![0u32, 0, 1, 1]);
        assert_eq!(state.s.row(1), array![0u32, 0, 1, 1]);
    }

    #[test]
    fn reference_copying_tracks_the_matching_row() {
        let a = array![[1.0f32, 1.0, 1.0, 1.0], [0.0, 0.0, 0.0, 0.0]];
        let mut state = AncestryState {
            g: array![[1u8, 1, 1, 1]],
            h: array![[0u8, 0, 0, 0], [1, 1, 255, 1]],
            a,
            s: Array2::zeros((2, 4)),
        };
        EstimateSKnn.update(&mut state, &params(2.0), &mut rng()).unwrap();
        assert_eq!(state.s.row(0), array![1u32, 1, 1, 1]);
        assert_eq!(state.s.row(1), array![0u32, 0, 0, 0]);
    }

    #[test]
    fn reference_copying_rejects_misaligned_weights() {
        let mut state = AncestryState {
            g: array![[1u8, 1]],
            h: array![[0u8, 0], [1, 1]],
            a: array![[1.0f32, 1.0]],
            s: Array2::zeros((2, 2)),
        };
        let mut p = params(1.0);
        p.fixtures.weights = Some(Array1::ones(3));
        let err = EstimateSKnn.update(&mut state, &p, &mut rng()).unwrap_err();
        assert_eq!(err.parameter, "weights.len");
    }

    #[test]
    fn profile_estimate_weights_homozygous_sites() {
        let mut state = AncestryState {
            g: array![[2u8, 1], [0, 1]],
            h: array![[1u8, 1], [1, 0], [0, 0], [0, 1]],
            a: Array2::zeros((2, 2)),
            s: array![[0u32, 0], [0, 0], [0, 1], [1, 1]],
        };
        EstimateA.update(&mut state, &params(1.0), &mut rng()).unwrap();
        // Column 0: cluster 0 sees two homozygous 1s and one homozygous 0.
        assert_abs_diff_eq!(state.a[[0, 0]], 200.0 / 300.0, epsilon = 1e-6);
        assert_abs_diff_eq!(state.a[[1, 0]], 0.0, epsilon = 1e-6);
        // Column 1: cluster 0 holds 1 and 0; cluster 1 holds 0 and 1.
        assert_abs_diff_eq!(state.a[[0, 1]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(state.a[[1, 1]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn unobserved_clusters_default_to_one_half() {
        let mut state = AncestryState {
            g: array![[2u8]],
            h: array![[1u8], [1]],
            a: Array2::zeros((3, 1)),
            s: array![[0u32], [0]],
        };
        EstimateA.update(&mut state, &params(1.0), &mut rng()).unwrap();
        assert_eq!(state.a.column(0).to_vec(), vec![1.0, 0.5, 0.5]);
    }

    #[test]
    fn gradient_step_moves_toward_frequency() {
        let mut state = AncestryState {
            g: array![[1u8]],
            h: array![[1u8], [0]],
            a: array![[0.0f32], [0.5]],
            s: array![[0u32], [0]],
        };
        EstimateAGrad.update(&mut state, &params(1.0), &mut rng()).unwrap();
        assert_abs_diff_eq!(state.a[[0, 0]], 0.05, epsilon = 1e-6);
        assert_abs_diff_eq!(state.a[[1, 0]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn selection_out_of_range_is_rejected() {
        let mut state = AncestryState {
            g: array![[1u8]],
            h: array![[1u8], [0]],
            a: array![[0.5f32]],
            s: array![[0u32], [4]],
        };
        let err = EstimateA.update(&mut state, &params(1.0), &mut rng()).unwrap_err();
        assert_eq!(err.parameter, "S");
        assert_eq!(err.value, "4");
    }

    #[test]
    fn balancing_aligns_swapped_columns() {
        let mut state = AncestryState {
            g: array![[1u8, 1, 1], [1, 1, 1]],
            h: Array2::zeros((4, 3)),
            a: array![[0.1f32, 0.9, 0.1], [0.8, 0.2, 0.8]],
            s: array![[0u32, 1, 0], [0, 1, 0], [1, 0, 1], [1, 0, 1]],
        };
        BalanceSA.update(&mut state, &params(1.0), &mut rng()).unwrap();
        assert_eq!(state.s.column(1).to_vec(), vec![0, 0, 1, 1]);
        assert_eq!(state.s.column(2).to_vec(), vec![0, 0, 1, 1]);
        assert_eq!(state.a, array![[0.1f32, 0.2, 0.1], [0.8, 0.9, 0.8]]);
    }

    #[test]
    fn haplotype_pairs_sum_to_genotype() {
        let g = array![[0u8, 1, 2, 1, MISSING_GENOTYPE], [1, 1, 0, 2, 1]];
        let mut state = AncestryState {
            h: Array2::zeros((4, 5)),
            a: array![[0.3f32, 0.6, 0.2, 0.9, 0.8], [0.7, 0.1, 0.5, 0.4, 0.2]],
            s: array![[0u32, 0, 1, 1, 0], [1, 1, 0, 0, 1], [0, 1, 0, 1, 0], [1, 0, 1, 0, 1]],
            g,
        };
        for kernel in [
            EstimateH::RANDOM,
            EstimateH::PROBABILISTIC,
            EstimateH::DETERMINISTIC,
        ] {
            kernel.update(&mut state, &params(1.0), &mut rng()).unwrap();
            for i in 0..2 {
                for j in 0..5 {
                    let g = state.g[[i, j]];
                    if g != MISSING_GENOTYPE {
                        assert_eq!(state.h[[2 * i, j]] + state.h[[2 * i + 1, j]], g);
                    }
                }
            }
            // Missing genotype rounds the cluster frequencies: 0.8 -> 1, 0.2 -> 0.
            assert_eq!(state.h[[0, 4]], 1);
            assert_eq!(state.h[[1, 4]], 0);
        }
    }
}
