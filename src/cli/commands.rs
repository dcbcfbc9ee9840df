//! CLI command definitions using clap.
//!
//! One subcommand per pipeline stage plus `run` for the whole flow:
//! - freeze: tokenize placeholders into a draft CSV + map
//! - translate: batch-translate a draft CSV
//! - qa / soft-qa: hard validation and LLM review
//! - repair: multi-round repair of QA failures
//! - rehydrate: restore original placeholders into the final CSV
//! - cost: aggregate the trace into a billing report
//! - cache: inspect or clear the translation cache

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// locpipe - localization pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "locpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline config YAML (batching, cache, repair rounds)
    #[arg(short, long, global = true, default_value = "config/pipeline.yaml")]
    pub config: PathBuf,

    /// Placeholder schema YAML
    #[arg(long, global = true)]
    pub schema: Option<PathBuf>,

    /// Glossary YAML
    #[arg(long, global = true, default_value = "data/glossary.yaml")]
    pub glossary: PathBuf,

    /// Model routing YAML
    #[arg(long, global = true, default_value = "config/llm_routing.yaml")]
    pub routing: PathBuf,

    /// Style guide text file injected into prompts
    #[arg(long, global = true, default_value = "workflow/style_guide.md")]
    pub style: PathBuf,

    /// Directory for checkpoints, reports, and markers
    #[arg(long, global = true, default_value = "data/run")]
    pub output_dir: PathBuf,

    /// Disable the translation cache for this invocation
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Freeze placeholders/tags into tokens, producing a draft CSV and map
    Freeze {
        /// Input CSV (string_id + source_text columns)
        #[arg(short, long)]
        input: PathBuf,

        /// Output draft CSV with the tokenized column
        #[arg(short, long)]
        draft: PathBuf,

        /// Output placeholder map JSON
        #[arg(short, long)]
        map: PathBuf,
    },

    /// Translate a draft CSV through the configured models
    Translate {
        /// Draft CSV from `freeze`
        #[arg(short, long)]
        input: PathBuf,

        /// Output translated CSV
        #[arg(short, long)]
        output: PathBuf,

        /// Bypass routing and force this model
        #[arg(long)]
        force_model: Option<String>,
    },

    /// Run hard QA checks on a translated CSV
    Qa {
        /// Translated CSV
        #[arg(short, long)]
        input: PathBuf,

        /// Placeholder map JSON from `freeze`
        #[arg(short, long)]
        map: PathBuf,

        /// Output report JSON
        #[arg(short, long, default_value = "data/qa_hard_report.json")]
        report: PathBuf,
    },

    /// LLM-backed stylistic review; emits repair tasks
    SoftQa {
        /// Translated CSV
        #[arg(short, long)]
        input: PathBuf,

        /// Output repair tasks JSONL
        #[arg(short, long, default_value = "data/repair_tasks.jsonl")]
        tasks: PathBuf,
    },

    /// Repair rows flagged by a QA report
    Repair {
        /// Translated CSV
        #[arg(short, long)]
        input: PathBuf,

        /// QA report JSON driving the repair tasks
        #[arg(short, long)]
        report: PathBuf,

        /// Output repaired CSV
        #[arg(short, long)]
        output: PathBuf,

        /// Which QA stage produced the report
        #[arg(long, default_value = "hard", value_parser = ["hard", "soft"])]
        qa_type: String,
    },

    /// Replace tokens with their original placeholders
    Rehydrate {
        /// Translated (and repaired) CSV
        #[arg(short, long)]
        input: PathBuf,

        /// Placeholder map JSON from `freeze`
        #[arg(short, long)]
        map: PathBuf,

        /// Output final CSV
        #[arg(short, long)]
        output: PathBuf,

        /// Overwrite the target column instead of adding rehydrated_text
        #[arg(long)]
        overwrite: bool,
    },

    /// Aggregate the LLM trace into cost reports
    Cost {
        /// Trace JSONL file
        #[arg(short, long, default_value = "data/llm_trace.jsonl")]
        trace: PathBuf,

        /// Pricing config YAML
        #[arg(short, long, default_value = "config/pricing.yaml")]
        pricing: PathBuf,

        /// Output summary JSON
        #[arg(long, default_value = "data/metrics_summary.json")]
        out_json: PathBuf,

        /// Output Markdown report
        #[arg(long, default_value = "data/metrics_report.md")]
        out_md: PathBuf,

        /// Output line count for cost-per-1k-lines
        #[arg(long)]
        lines: Option<u64>,
    },

    /// Translation cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Full pipeline: freeze, translate, QA, repair, rehydrate
    Run {
        /// Input CSV
        #[arg(short, long)]
        input: PathBuf,

        /// Output final CSV
        #[arg(short, long)]
        output: PathBuf,

        /// Include the LLM stylistic review pass
        #[arg(long)]
        soft_qa: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Print hit/miss statistics and size
    Stats,
    /// Delete every cached translation
    Clear,
}
