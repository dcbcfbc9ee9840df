use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use colored::Colorize;
use eyre::Context;
use log::info;
use tokio_util::sync::CancellationToken;

use locpipe::cache::CacheStore;
use locpipe::cli::{CacheCommands, Cli, Commands};
use locpipe::codec::schema::{default_schema, PlaceholderSchema};
use locpipe::config::PipelineConfig;
use locpipe::cost;
use locpipe::error::{LlmErrorKind, LocPipeError};
use locpipe::glossary::GlossaryIndex;
use locpipe::pipeline::{Pipeline, RunStatus};
use locpipe::pricing::PricingBook;
use locpipe::repair::QaKind;
use locpipe::router::ModelRouter;
use locpipe::trace::TraceSink;
use locpipe::transport::{HttpTransport, LlmRequest, LlmResult, LlmTransport};

fn setup_logging() -> eyre::Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("locpipe")
        .join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("locpipe.log");
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Placeholder transport for stages that never reach the wire (freeze,
/// qa, rehydrate, cost). Calling it is a configuration bug.
struct OfflineTransport;

#[async_trait]
impl LlmTransport for OfflineTransport {
    async fn chat(&self, _request: &LlmRequest) -> locpipe::Result<LlmResult> {
        Err(LocPipeError::llm(
            LlmErrorKind::Config,
            "this command does not use the LLM; set LLM_BASE_URL/LLM_API_KEY for LLM stages",
            None,
        ))
    }
}

fn needs_llm(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Translate { .. }
            | Commands::SoftQa { .. }
            | Commands::Repair { .. }
            | Commands::Run { .. }
    )
}

fn build_pipeline(cli: &Cli, cancel: CancellationToken) -> locpipe::Result<Pipeline> {
    let mut config = PipelineConfig::load(&cli.config)?;
    if cli.no_cache {
        config.cache.enabled = false;
    }
    if std::env::var("LLM_TIMEOUT_S").is_ok() {
        let secs = HttpTransport::env_timeout().as_secs();
        config.batch.defaults.normal.timeout_s = secs;
        config.batch.defaults.long_text.timeout_s = secs.max(config.batch.defaults.long_text.timeout_s);
    }

    let schema = match &cli.schema {
        Some(path) => PlaceholderSchema::load(path)?,
        None => default_schema(),
    };
    let glossary = GlossaryIndex::load(&cli.glossary)?;
    let router = if cli.routing.exists() {
        ModelRouter::load(&cli.routing)?
    } else {
        ModelRouter::disabled()
    };
    let style_guide = fs::read_to_string(&cli.style).unwrap_or_default();

    let transport: Arc<dyn LlmTransport> = if needs_llm(&cli.command) {
        Arc::new(HttpTransport::from_env()?)
    } else {
        Arc::new(OfflineTransport)
    };

    Pipeline::new(
        config,
        schema.compile(),
        glossary,
        router,
        transport,
        Arc::new(TraceSink::from_env()),
        &cli.output_dir,
        style_guide,
        cancel,
    )
}

async fn run(cli: Cli) -> locpipe::Result<i32> {
    // Cache maintenance and cost aggregation do not need the pipeline.
    match &cli.command {
        Commands::Cache { command } => {
            let mut config = PipelineConfig::load(&cli.config)?;
            if cli.no_cache {
                config.cache.enabled = false;
            }
            let cache = CacheStore::open(config.cache)?;
            match command {
                CacheCommands::Stats => {
                    let stats = cache.stats();
                    let (used, cap) = cache.size();
                    println!("{}", "Cache statistics".bold());
                    println!("  entries:   {}", cache.entry_count());
                    println!("  hits:      {}", stats.hits);
                    println!("  misses:    {}", stats.misses);
                    println!(
                        "  size:      {:.2} MB / {:.0} MB",
                        used as f64 / 1_048_576.0,
                        cap as f64 / 1_048_576.0
                    );
                }
                CacheCommands::Clear => {
                    let removed = cache.clear();
                    println!("{} {} cache entries", "Cleared".green(), removed);
                }
            }
            return Ok(0);
        }
        Commands::Cost {
            trace,
            pricing,
            out_json,
            out_md,
            lines,
        } => {
            let book = if pricing.exists() {
                PricingBook::load(pricing)?
            } else {
                PricingBook::empty()
            };
            let summary = cost::aggregate_file(trace, &book, *lines)?;
            cost::write_reports(&summary, out_json, out_md)?;
            println!(
                "{} {} calls, {} tokens, ${:.6}",
                "Aggregated".green(),
                summary.usage.total_calls,
                summary.tokens.total_tokens,
                summary.cost.total_cost
            );
            if !summary.pricing.missing_models.is_empty() {
                println!(
                    "{} no pricing for: {}",
                    "warning:".yellow(),
                    summary.pricing.missing_models.join(", ")
                );
            }
            return Ok(0);
        }
        _ => {}
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} finishing in-flight batches...", "interrupted,".yellow());
            ctrl_c_cancel.cancel();
        }
    });

    let pipeline = build_pipeline(&cli, cancel)?;

    match cli.command {
        Commands::Freeze { input, draft, map } => {
            let outcome = pipeline.freeze_file(&input, &draft, &map)?;
            println!(
                "{} {} rows ({} PH, {} TAG tokens)",
                "Froze".green(),
                outcome.rows,
                outcome.ph_count,
                outcome.tag_count
            );
            if outcome.sanity_warnings > 0 {
                println!(
                    "{} {} source balance warnings (see qa_early_report.json)",
                    "warning:".yellow(),
                    outcome.sanity_warnings
                );
            }
            Ok(0)
        }
        Commands::Translate {
            input,
            output,
            force_model,
        } => {
            let outcome = pipeline.translate_file(&input, &output, force_model).await?;
            println!(
                "{} {} rows ({} from cache)",
                "Translated".green(),
                outcome.translated,
                outcome.cache_hits
            );
            if !outcome.failed_ids.is_empty() {
                println!(
                    "{} {} rows failed: {}",
                    "warning:".yellow(),
                    outcome.failed_ids.len(),
                    outcome.failed_ids.join(", ")
                );
                return Ok(1);
            }
            Ok(0)
        }
        Commands::Qa { input, map, report } => {
            let qa = pipeline.hard_qa_file(&input, &map, &report)?;
            if qa.has_errors {
                println!(
                    "{} {} errors across {} rows (report: {})",
                    "QA failed:".red(),
                    qa.errors.len(),
                    qa.total_rows,
                    report.display()
                );
                Ok(1)
            } else {
                println!("{} {} rows clean", "QA passed:".green(), qa.total_rows);
                Ok(0)
            }
        }
        Commands::SoftQa { input, tasks } => {
            let outcome = pipeline.soft_qa_file(&input, &tasks).await?;
            println!(
                "{} {} rows reviewed, {} with issues ({} major)",
                "Soft QA".green(),
                outcome.reviewed,
                outcome.rows_with_issues(),
                outcome.major_count()
            );
            Ok(0)
        }
        Commands::Repair {
            input,
            report,
            output,
            qa_type,
        } => {
            let kind = if qa_type == "soft" { QaKind::Soft } else { QaKind::Hard };
            let outcome = pipeline.repair_file(&input, &report, &output, kind).await?;
            println!(
                "{} {} repaired, {} escalated (of {})",
                "Repair done:".green(),
                outcome.stats.repaired,
                outcome.stats.escalated,
                outcome.stats.total_tasks
            );
            Ok(if outcome.stats.escalated > 0 { 1 } else { 0 })
        }
        Commands::Rehydrate {
            input,
            map,
            output,
            overwrite,
        } => {
            let outcome = pipeline.rehydrate_file(&input, &map, &output, overwrite)?;
            println!(
                "{} {} rows, {} tokens restored",
                "Rehydrated".green(),
                outcome.rows,
                outcome.tokens_restored
            );
            Ok(0)
        }
        Commands::Run {
            input,
            output,
            soft_qa,
        } => {
            let status = pipeline.run_all(&input, &output, soft_qa).await?;
            match status {
                RunStatus::Success => {
                    println!("{} final CSV: {}", "Pipeline complete.".green(), output.display());
                    Ok(0)
                }
                RunStatus::QaFailed => {
                    println!(
                        "{} QA errors remain after repair; see {}",
                        "Pipeline finished with errors.".red(),
                        pipeline.output_dir().join("qa_hard_report.json").display()
                    );
                    Ok(1)
                }
            }
        }
        Commands::Cache { .. } | Commands::Cost { .. } => unreachable!("handled above"),
    }
}

fn exit_code_for(err: &LocPipeError) -> i32 {
    match err {
        LocPipeError::Config(_) => 2,
        LocPipeError::Llm {
            kind: LlmErrorKind::Config,
            ..
        } => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = setup_logging() {
        eprintln!("{} {}", "error:".red(), e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "error:".red(), e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}
