use lanc::pipeline::{Pipeline, PipelineKind};
use lanc::types::{Fixtures, MISSING_GENOTYPE, ParamOverrides, genotypes_from_haplotypes};
use ndarray::Array2;
use proptest::prelude::*;

const UNSUPERVISED: [PipelineKind; 7] = [
    PipelineKind::Classic,
    PipelineKind::ClassicProb,
    PipelineKind::ClassicSha,
    PipelineKind::Grad,
    PipelineKind::OldH,
    PipelineKind::Tree,
    PipelineKind::TreeJoin,
];

fn genotype_matrix() -> impl Strategy<Value = Array2<u8>> {
    (1usize..4, 1usize..9).prop_flat_map(|(n, m)| {
        prop::collection::vec(prop_oneof![4 => 0u8..3, 1 => Just(MISSING_GENOTYPE)], n * m)
            .prop_map(move |v| Array2::from_shape_vec((n, m), v).unwrap())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn haplotype_pairs_reproduce_observed_genotypes(
        g in genotype_matrix(),
        kind_index in 0usize..UNSUPERVISED.len(),
        seed in any::<u64>(),
    ) {
        let overrides = ParamOverrides::default().with_nbclust(2).with_nb_iter(2);
        let result = Pipeline::named(UNSUPERVISED[kind_index])
            .run(&g, &overrides, Fixtures::default(), seed)
            .unwrap();
        let state = &result.state;

        prop_assert!(state.h.iter().all(|&a| a <= 1));
        prop_assert!(state.s.iter().all(|&l| (l as usize) < state.n_clusters()));
        prop_assert!(state.a.iter().all(|&f| (0.0..=1.0).contains(&f)));

        let rebuilt = genotypes_from_haplotypes(state.h.view()).unwrap();
        for ((i, j), &observed) in g.indexed_iter() {
            if observed != MISSING_GENOTYPE {
                prop_assert_eq!(rebuilt[[i, j]], observed, "cell ({}, {})", i, j);
            }
        }
    }
}

#[test]
fn same_seed_same_trial() {
    let g = ndarray::array![[0u8, 1, 2, 1, 0, 3], [2, 1, 0, 1, 2, 2], [1, 1, 1, 0, 0, 2]];
    let overrides = ParamOverrides::default().with_nbclust(2).with_nb_iter(3);
    let pipeline = Pipeline::named(PipelineKind::Classic);
    let a = pipeline.run_many(&g, 3, &overrides, &Fixtures::default(), 5).unwrap();
    let b = pipeline.run_many(&g, 3, &overrides, &Fixtures::default(), 5).unwrap();
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.state.h, y.state.h);
        assert_eq!(x.state.s, y.state.s);
    }
}
