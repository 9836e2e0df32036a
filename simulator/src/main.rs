use anyhow::Context;
use basinmet::processing::schema::Schema;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use workflow::config::WorkflowConfig;
use workflow::runner::{load_capture, summarize, Runner};

mod generator;
mod workflow;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// Message statistics and feature counts
    Summary,
    /// Core record set, one JSON row per line
    Core,
    /// Derived record set, one JSON row per line
    Derived,
    /// Column/unit table as markdown
    Units,
    /// Full session report as JSON
    Report,
}

#[derive(Parser)]
#[command(author, version, about = "Basin atmospheric-feature workflow driver")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Replay a decoded capture (one JSON message per line) instead of generating one
    #[arg(long)]
    capture: Option<PathBuf>,
    #[arg(long, default_value_t = 6)]
    aircraft: usize,
    #[arg(long, default_value_t = 7_200.0)]
    duration_s: f64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, value_enum, default_value_t = Emit::Summary)]
    emit: Emit,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let workflow_config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::from_args(args.aircraft, args.duration_s, args.seed)
    };

    if args.emit == Emit::Units {
        let schema = Schema::new(&workflow_config.pipeline.normalizer)
            .context("building output schema")?;
        print!("{}", schema.units_markdown());
        return Ok(());
    }

    let runner = Runner::new(workflow_config);
    let messages = match &args.capture {
        Some(path) => load_capture(path)?,
        None => runner.synthesize()?,
    };

    let runtime = TokioBuilder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating session runtime")?;
    let report = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                log::warn!("interrupt received, sealing open bins early");
                on_signal.cancel();
            }
        });
        runner.execute(messages, cancel).await
    })?;

    match args.emit {
        Emit::Summary => print!("{}", summarize(&report)),
        Emit::Core => {
            for row in &report.records.core {
                println!("{}", serde_json::to_string(row).context("serializing core row")?);
            }
        }
        Emit::Derived => {
            for row in &report.records.derived {
                println!("{}", serde_json::to_string(row).context("serializing derived row")?);
            }
        }
        Emit::Report => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing session report")?
        ),
        Emit::Units => {}
    }
    Ok(())
}
