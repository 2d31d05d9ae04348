use crate::config::ConfigError;
use crate::io::DataError;
use crate::kernel::KernelError;
use crate::types::ParamError;
use thiserror::Error;

/// Umbrella error for every workflow in the crate.
#[derive(Error, Debug)]
pub enum LaiError {
    #[error("Invalid parameters: {0}")]
    Params(#[from] ParamError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Array layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),
    #[error("{context}: expected shape {expected:?}, found {found:?}.")]
    ShapeMismatch {
        context: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error(
        "{workflow} requires haplotypes of a diploid species, but the admixed panel has {rows} rows (must be even)."
    )]
    OddHaplotypeCount { workflow: &'static str, rows: usize },
    #[error("At least one reference population is required.")]
    NoReferencePopulations,
    #[error("At most {max} reference populations fit in a label byte, but {found} were given.")]
    TooManyPopulations { found: usize, max: usize },
    #[error("Reference population {index} has no haplotypes.")]
    EmptyReferencePopulation { index: usize },
    #[error("The selected initializer needs the '{0}' fixture, which was not supplied.")]
    MissingFixture(&'static str),
    #[error("Cannot combine an empty list of runs.")]
    NoRuns,
    #[error("Initializer '{initializer}' cannot draw {requested} clusters from {available} individuals.")]
    TooFewIndividuals {
        initializer: &'static str,
        requested: usize,
        available: usize,
    },
    #[error("Selection label {label} is out of range for {clusters} clusters.")]
    SelectionOutOfRange { label: usize, clusters: usize },
    #[error("Label pair ({0}, {1}) does not fit in a single-byte code.")]
    LabelCodeOverflow(u8, u8),
    #[error("Failed to build a thread pool with {threads} threads: {message}")]
    ThreadPool { threads: usize, message: String },
}

pub(crate) fn check_shape(
    context: &'static str,
    expected: (usize, usize),
    found: (usize, usize),
) -> Result<(), LaiError> {
    if expected == found {
        Ok(())
    } else {
        Err(LaiError::ShapeMismatch {
            context,
            expected,
            found,
        })
    }
}

/// Runs `op` inside a rayon pool sized by the thread-count hint. A caller
/// already inside a pool of that size keeps it.
pub(crate) fn with_thread_pool<T, F>(threads: usize, op: F) -> Result<T, LaiError>
where
    F: FnOnce() -> Result<T, LaiError> + Send,
    T: Send,
{
    let threads = threads.max(1);
    if rayon::current_thread_index().is_some() && rayon::current_num_threads() == threads {
        return op();
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| LaiError::ThreadPool {
            threads,
            message: e.to_string(),
        })?;
    pool.install(op)
}
