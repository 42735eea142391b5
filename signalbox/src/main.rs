// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Command-line driver: load the three configuration documents, run one
//! simulation, print the report.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use shunt_config::{load_model, load_system, load_task};
use shunt_engine::Engine;
use shunt_track::Writer;
use shunt_track::tracker::{SpanFilter, TextTracker, Tracker, dev_null_tracker};

#[derive(Parser, Debug)]
#[command(about = "Predict step time, memory and network utilization for an ML workload.")]
struct Args {
    /// Model architecture configuration file (.toml or .json).
    #[arg(long)]
    model_cfg: PathBuf,

    /// System configuration file (.toml or .json).
    #[arg(long)]
    system_cfg: PathBuf,

    /// Task configuration file (.toml or .json).
    #[arg(long)]
    task_cfg: PathBuf,

    /// Override the task's iteration count.
    #[arg(long)]
    iterations: Option<u32>,

    /// Write the step timeline to this file ('-' for stdout).
    #[arg(short = 't', long)]
    trace_file: Option<String>,

    /// Only trace spans whose name matches this regular expression.
    #[arg(long)]
    trace_filter: Option<String>,

    /// Emit the report as JSON instead of the text summary.
    #[arg(long)]
    json: bool,

    /// Configure the logging level for the log messages.
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,
}

fn build_tracker(args: &Args) -> Result<Tracker> {
    let Some(trace_file) = &args.trace_file else {
        return Ok(dev_null_tracker());
    };

    let filter = match &args.trace_filter {
        Some(regex) => {
            let mut filter = SpanFilter::none();
            filter.add_filter(regex, true);
            filter
        }
        None => SpanFilter::all(),
    };

    let writer: Writer = if trace_file == "-" {
        Box::new(BufWriter::new(io::stdout()))
    } else {
        Box::new(BufWriter::new(File::create(trace_file)?))
    };
    Ok(Arc::new(TextTracker::new(Arc::new(filter), writer)))
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let level = shunt_track::str_to_level(&args.log_level);
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level.to_level_filter())
        .init();

    let model = load_model(&args.model_cfg)?;
    let system = load_system(&args.system_cfg)?;
    let mut task = load_task(&args.task_cfg)?;
    if let Some(iterations) = args.iterations {
        task.iterations = iterations;
    }

    log::info!(
        "running '{}' / '{}' / '{}'",
        model.name,
        system.name,
        task.name
    );

    let tracker = build_tracker(&args)?;
    let engine = Engine::new(&tracker);
    let report = engine.simulate(&model, &system, &task)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }

    if !report.conditions.is_empty() {
        log::warn!("run completed with {} condition(s)", report.conditions.len());
    }
    Ok(())
}
