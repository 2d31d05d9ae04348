#![deny(unused_variables)]
#![deny(unused_imports)]

use clap::Parser;
use lanc::calibrate::smooth;
use lanc::config::EnsembleConfig;
use lanc::ensemble::local_ancestry;
use lanc::io::{DataFormat, load_haplotypes, save_labels};
use lanc::progress::ConsoleSweepProgress;
use log::info;
use std::error::Error;
use std::path::PathBuf;
use std::process;

/// Local ancestry inference for admixed haplotypes.
///
/// Haplotype matrices hold haplotypes in rows and SNPs in columns; the
/// inferred ancestries of the admixed haplotypes are stored the same way.
/// In text input, missing values are encoded as 255 or NA.
///
/// Example: lanc -r H_ceu.npy H_yri.npy -a H_mex.npy -f npy -o out.npy -n 8 -v
#[derive(Parser, Debug)]
#[command(name = "lanc", version, about, long_about)]
struct Cli {
    /// Files storing the reference haplotypes, one file per population.
    #[arg(short = 'r', long = "ref", num_args = 1.., required = true)]
    refs: Vec<PathBuf>,

    /// File storing the admixed haplotypes.
    #[arg(short = 'a', long = "adm")]
    adm: PathBuf,

    /// Input format shared by every file: npy, txt or vcf (.vcf or .vcf.gz).
    #[arg(short = 'f', long = "format", default_value = "npy")]
    format: DataFormat,

    /// Output file; written as text when it ends with '.txt', NPY otherwise.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Number of CPU cores to use. Defaults to every available core.
    #[arg(short = 'n', long = "ncore")]
    ncore: Option<usize>,

    /// Run the phase-correction module after the bagging sweep (diploid data only).
    #[arg(long = "phase-correction", visible_alias = "pc")]
    phase_correction: bool,

    /// Log workflow progress.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Base seed for every random draw.
    #[arg(long)]
    seed: Option<u64>,

    /// TOML file with ensemble settings; command-line flags take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bootstrap trials per penalty value.
    #[arg(long = "nb-bagging")]
    nb_bagging: Option<usize>,

    /// Confidence threshold position between the lowest and highest vote count.
    #[arg(long = "rate-vote")]
    rate_vote: Option<f64>,

    /// Similarity above which the phase-correction search raises its penalty.
    #[arg(long)]
    threshold: Option<f64>,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn resolve_config(cli: &Cli) -> Result<EnsembleConfig, Box<dyn Error>> {
    let defaults = EnsembleConfig {
        num_threads: num_cpus::get(),
        ..EnsembleConfig::default()
    };
    let mut config = match &cli.config {
        Some(path) => EnsembleConfig::load_over(path, &defaults)?,
        None => defaults,
    };
    if let Some(ncore) = cli.ncore {
        config.num_threads = ncore;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(nb_bagging) = cli.nb_bagging {
        config.nb_bagging = nb_bagging;
    }
    if let Some(rate_vote) = cli.rate_vote {
        config.rate_vote = rate_vote;
    }
    if let Some(threshold) = cli.threshold {
        config.threshold = threshold;
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&cli)?;
    info!(
        "Using {} threads, seed {}, {} bagging trials per penalty",
        config.num_threads, config.seed, config.nb_bagging
    );

    info!("Using {} reference populations", cli.refs.len());
    let refs = cli
        .refs
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let h = load_haplotypes(path, cli.format)?;
            info!("Reference haplotype matrix {index}: {} x {}", h.nrows(), h.ncols());
            Ok(h)
        })
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    let admixed = load_haplotypes(&cli.adm, cli.format)?;
    info!("Admixed haplotype matrix: {} x {}", admixed.nrows(), admixed.ncols());

    let progress = ConsoleSweepProgress::new();
    let labels = if cli.phase_correction {
        info!("Running the bagging sweep with phase correction");
        smooth(&refs, admixed.view(), &config, &progress)?.labels
    } else {
        info!("Running the bagging sweep");
        local_ancestry(&refs, admixed.view(), &config, &progress)?.labels
    };

    save_labels(&cli.output, labels.view())?;
    Ok(())
}

fn print_error_chain(error: &dyn Error) {
    eprintln!("Error: {error}");
    let mut source = error.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        print_error_chain(e.as_ref());
        process::exit(1);
    }
}
