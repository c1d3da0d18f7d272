//! Command line front end: fuzz a module or replay a recorded sequence.

mod logging;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use morph_core::{FuzzerConfig, ReplayConfig};
use morph_fuzz::{Fact, Fuzzer, FuzzerStatus, Replayer, TransformationSequence};
use morph_ir::Module;
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "morph-runner", version, about = "Semantics-preserving IR fuzzer")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fuzz a module and record the transformations applied
    Fuzz {
        /// Module to fuzz (JSON, or bincode for `.bin`)
        module: PathBuf,
        /// Fuzzer configuration (JSON); defaults are used for missing fields
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides the seed in the configuration
        #[arg(long)]
        seed: Option<u64>,
        /// Facts known to hold for the input module (JSON list)
        #[arg(long)]
        facts: Option<PathBuf>,
        /// Directory the fuzzed module, sequence and summary are written to
        #[arg(long, default_value = "morph-out")]
        out_dir: PathBuf,
    },
    /// Re-apply a recorded sequence to a module
    Replay {
        /// Module the sequence was recorded against (JSON, or bincode for `.bin`)
        module: PathBuf,
        /// Recorded sequence; `.bin` files are read as bincode, others as JSON
        transformations: PathBuf,
        /// First overflow id of the recording run
        #[arg(long)]
        first_overflow_id: u32,
        /// Replay only this many records
        #[arg(long)]
        count: Option<usize>,
        #[arg(long)]
        facts: Option<PathBuf>,
        /// Validate after every applied record
        #[arg(long)]
        validate: bool,
        /// Where to write the resulting module (JSON)
        #[arg(long, default_value = "replayed.json")]
        out: PathBuf,
    },
}

/// Written next to the fuzzed module so a run can be replayed
#[derive(Serialize)]
struct FuzzSummary {
    seed: u64,
    status: FuzzerStatus,
    first_overflow_id: u32,
    num_transformations: usize,
    facts: Vec<Fact>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.json_logs)?;

    match cli.command {
        Command::Fuzz {
            module,
            config,
            seed,
            facts,
            out_dir,
        } => fuzz(&module, config.as_deref(), seed, facts.as_deref(), &out_dir),
        Command::Replay {
            module,
            transformations,
            first_overflow_id,
            count,
            facts,
            validate,
            out,
        } => {
            let config = ReplayConfig {
                first_overflow_id,
                num_transformations_to_apply: count,
                validate_after_each_transformation: validate,
            };
            replay(&module, &transformations, facts.as_deref(), &config, &out)
        }
    }
}

fn fuzz(
    module_path: &Path,
    config_path: Option<&Path>,
    seed: Option<u64>,
    facts_path: Option<&Path>,
    out_dir: &Path,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => serde_json::from_str::<FuzzerConfig>(&read(path)?)
            .with_context(|| format!("parsing config {}", path.display()))?,
        None => FuzzerConfig::default(),
    };
    if let Some(seed) = seed {
        config.seed = seed;
    }
    let module = load_module(module_path)?;
    let facts = load_facts(facts_path)?;

    let seed = config.seed;
    let result = Fuzzer::new(config).run(module, &facts)?;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    result.module.save(&out_dir.join("module.json"))?;
    fs::write(
        out_dir.join("transformations.json"),
        result.transformations.to_json()?,
    )?;
    fs::write(
        out_dir.join("transformations.bin"),
        result.transformations.to_bytes()?,
    )?;
    let summary = FuzzSummary {
        seed,
        status: result.status,
        first_overflow_id: result.first_overflow_id,
        num_transformations: result.transformations.len(),
        facts: result.facts,
    };
    fs::write(
        out_dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;

    info!(
        "Wrote {} transformations to {}",
        summary.num_transformations,
        out_dir.display()
    );
    Ok(())
}

fn replay(
    module_path: &Path,
    transformations_path: &Path,
    facts_path: Option<&Path>,
    config: &ReplayConfig,
    out: &Path,
) -> Result<()> {
    let module = load_module(module_path)?;
    let facts = load_facts(facts_path)?;
    let sequence = if transformations_path.extension().is_some_and(|ext| ext == "bin") {
        let bytes = fs::read(transformations_path)
            .with_context(|| format!("reading {}", transformations_path.display()))?;
        TransformationSequence::from_bytes(&bytes)?
    } else {
        TransformationSequence::from_json(&read(transformations_path)?)?
    };

    let result = Replayer::replay(module, &facts, &sequence, config)?;
    result
        .module
        .save(out)
        .with_context(|| format!("writing {}", out.display()))?;
    info!(
        "Replayed {} transformations ({} skipped) into {}",
        result.applied.len(),
        result.skipped,
        out.display()
    );
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn load_module(path: &Path) -> Result<Module> {
    Module::load(path).with_context(|| format!("loading module {}", path.display()))
}

fn load_facts(path: Option<&Path>) -> Result<Vec<Fact>> {
    match path {
        Some(path) => serde_json::from_str(&read(path)?)
            .with_context(|| format!("parsing facts {}", path.display())),
        None => Ok(Vec::new()),
    }
}
