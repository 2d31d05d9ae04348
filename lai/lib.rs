#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod assignment;
pub mod calibrate;
pub mod combine;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod init;
pub mod io;
pub mod kernel;
pub mod metrics;
pub mod opti;
pub mod pipeline;
pub mod progress;
pub mod tree;
pub mod types;
pub mod vote;

pub use calibrate::{LambdaFit, LambdaSearch, SmoothedCall, find_lambda, phase_correct, smooth};
pub use config::{ConfigError, EnsembleConfig, default_lambda_range};
pub use ensemble::{VoteCounts, bootstrap_votes, lambda_sweep, local_ancestry, local_ancestry_imputed};
pub use error::LaiError;
pub use io::{DataError, DataFormat, load_haplotypes, save_labels};
pub use pipeline::{Pipeline, PipelineKind, TrialResult};
pub use types::{AncestryState, Fixtures, MISSING_GENOTYPE, MISSING_LABEL, ParamOverrides, Params};
pub use vote::{AncestryCall, majority_vote, vote_and_impute};
