//! tdcpv CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use tdcpv_core::LogDensityModel;
use tdcpv_inference::{MaximumLikelihoodEstimator, ToySampler, pull};
use tdcpv_model::{AnalysisSpecV0, CompiledAnalysis, CpFitModel, Workspace, compile_model};

#[derive(Parser)]
#[command(name = "tdcpv")]
#[command(about = "Time-dependent CP-violation toy generation and fits")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate toy datasets
    Generate {
        /// Analysis configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Seed of the first toy; toy `i` uses `seed + i`
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Output workspace. With `--toys N > 1`, toy `i` is written to `<stem>_<i>.<ext>`.
        #[arg(short, long)]
        output: PathBuf,

        /// Number of toys
        #[arg(long, default_value = "1")]
        toys: usize,
    },

    /// Fit a dataset
    Fit {
        /// Analysis configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Workspace holding the dataset
        #[arg(short, long)]
        data: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compile a configuration and report its parameters and cells
    Validate {
        /// Analysis configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Generate { config, seed, output, toys } => cmd_generate(&config, seed, &output, toys),
        Commands::Fit { config, data, output } => cmd_fit(&config, &data, output.as_ref()),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Version => {
            println!("tdcpv {}", tdcpv_core::VERSION);
            Ok(())
        }
    }
}

fn load_analysis(path: &Path) -> Result<CompiledAnalysis> {
    tracing::info!(path = %path.display(), "loading configuration");
    let spec = AnalysisSpecV0::from_path(path)
        .with_context(|| format!("failed to read configuration {}", path.display()))?;
    let analysis = compile_model(&spec).with_context(|| format!("failed to compile {}", path.display()))?;
    tracing::info!(
        processes = analysis.processes.len(),
        parameters = analysis.context.parameters().len(),
        "configuration compiled"
    );
    Ok(analysis)
}

fn toy_path(output: &Path, index: usize, n_toys: usize) -> PathBuf {
    if n_toys <= 1 {
        return output.to_path_buf();
    }
    let stem = output.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "toy".into());
    let name = match output.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    output.with_file_name(name)
}

fn cmd_generate(config: &Path, seed: u64, output: &Path, toys: usize) -> Result<()> {
    if toys == 0 {
        anyhow::bail!("--toys must be >= 1");
    }
    let analysis = load_analysis(config)?;
    let sampler = ToySampler::new(&analysis)?;
    let params = analysis.context.values();
    for i in 0..toys {
        let toy_seed = seed.wrapping_add(i as u64);
        let toy = sampler.generate(&params, toy_seed).with_context(|| format!("toy {i} (seed {toy_seed})"))?;
        let n_events = toy.events.n_events();
        let path = toy_path(output, i, toys);
        toy.into_workspace(analysis.context.parameters())?
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(toy = i, seed = toy_seed, events = n_events, path = %path.display(), "toy written");
    }
    Ok(())
}

fn cmd_fit(config: &Path, data: &Path, output: Option<&PathBuf>) -> Result<()> {
    let analysis = load_analysis(config)?;
    let ws = Workspace::load(data).with_context(|| format!("failed to read workspace {}", data.display()))?;
    let events = ws.event_store()?;
    let model = CpFitModel::new(&analysis, &events)?;
    tracing::info!(events = model.n_events(), free = model.dim(), "fitting");

    let result = MaximumLikelihoodEstimator::new().fit(&model)?;
    tracing::info!(nll = result.nll, converged = result.converged, "fit complete");

    // Pulls against the values stored with the dataset (the generation point for toys).
    let pulls: serde_json::Map<String, serde_json::Value> = result
        .parameter_names
        .iter()
        .zip(result.parameters.iter().zip(&result.uncertainties))
        .filter_map(|(name, (&value, &error))| {
            let truth = ws.parameter(name)?.value;
            pull(value, truth, error).map(|p| (name.clone(), serde_json::json!(p)))
        })
        .collect();

    let output_json = serde_json::json!({
        "parameter_names": result.parameter_names,
        "bestfit": result.parameters,
        "uncertainties": result.uncertainties,
        "nll": result.nll,
        "converged": result.converged,
        "n_iter": result.n_iter,
        "covariance": result.covariance,
        "pulls": pulls,
    });
    write_json(output, output_json)
}

fn cmd_validate(config: &Path) -> Result<()> {
    let analysis = load_analysis(config)?;
    let generation = ToySampler::new(&analysis).err().map(|e| e.to_string());
    let params = analysis.context.parameters();
    let cells: Vec<serde_json::Value> = analysis
        .components()
        .map(|c| {
            serde_json::json!({
                "name": c.name(),
                "process": c.process(),
                "submode": c.submode(),
                "charge": c.charge(),
                "yield": params[c.yield_param().0].value,
            })
        })
        .collect();
    let output_json = serde_json::json!({
        "parameters": params,
        "free_parameters": params.iter().filter(|p| !p.constant).count(),
        "cells": cells,
        "observables": analysis.layout.observables().iter().map(|o| &o.name).collect::<Vec<_>>(),
        "generation_error": generation,
    });
    write_json(None, output_json)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
