//! jpmml-bridge CLI
//!
//! Score a delimited table of input records against a PMML model.

use std::fs::File;
use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use jpmml_bridge::{destroy_runtime, make_evaluator, BackendKind, EvaluatorOptions, Table};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jpmml-bridge")]
#[command(author, version, about = "Score CSV records against a PMML model", long_about = None)]
struct Cli {
    /// PMML model file
    model: PathBuf,

    /// Transport for reaching the model evaluator
    #[arg(long, default_value = "gateway")]
    backend: BackendKind,

    /// Transpile the model to generated bytecode before scoring
    #[arg(long)]
    transpile: bool,

    /// Input CSV file (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output CSV file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Field separator for input and output
    #[arg(long, default_value = ",")]
    sep: char,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let backend = cli.backend;

    let outcome = run(cli);
    if backend == BackendKind::Gateway {
        if let Err(e) = destroy_runtime(backend) {
            tracing::warn!("gateway teardown failed: {e}");
        }
    }
    if let Err(e) = outcome {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let sep = u8::try_from(cli.sep).context("separator must be a single ASCII character")?;

    let table = match &cli.input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
            Table::read_csv(file, sep)?
        }
        None => Table::read_csv(io::stdin().lock(), sep)?,
    };
    tracing::info!(
        rows = table.n_rows(),
        columns = table.n_columns(),
        "input table loaded"
    );

    let options = EvaluatorOptions {
        backend: cli.backend,
        transpile: cli.transpile,
        ..EvaluatorOptions::default()
    };
    let evaluator = make_evaluator(&cli.model, &options)
        .with_context(|| format!("cannot build an evaluator for {}", cli.model.display()))?;

    let results = evaluator.evaluate_all(&table)?;
    tracing::info!(
        rows = results.n_rows(),
        columns = results.n_columns(),
        "scoring finished"
    );

    match &cli.output {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
            results.write_csv(file, sep)?;
        }
        None => results.write_csv(io::stdout().lock(), sep)?,
    }
    Ok(())
}
