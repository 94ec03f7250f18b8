//! Checkflow CLI
//!
//! Runs serialized programs under checked execution.
//!
//! Usage:
//!   `checkflow run --program <program.json> --args <args.json> [--policy <policy.yaml>]`
//!   `checkflow inspect --program <program.json> [--policy <policy.yaml>]`

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use checkflow::{check_error, checkify_with, CheckRegistry, Checked, CheckifyConfig, ErrorSet};
use checkflow_tools::{load_args, load_policy, load_program, RunReport};

#[derive(Parser, Debug)]
#[command(name = "checkflow")]
#[command(about = "Run programs with runtime error checks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Instrument a program, run it and report the first error
    Run {
        /// JSON-serialized program
        #[arg(long)]
        program: PathBuf,

        /// JSON argument list
        #[arg(long)]
        args: PathBuf,

        /// Check policy YAML
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Override the policy's error set (e.g. float_checks, all_checks)
        #[arg(long)]
        errors: Option<String>,

        /// Exit with status 1 if an error was triggered
        #[arg(long)]
        strict: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Instrument a program and list its checks
    Inspect {
        /// JSON-serialized program
        #[arg(long)]
        program: PathBuf,

        /// Check policy YAML
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Override the policy's error set
        #[arg(long)]
        errors: Option<String>,

        /// Also print the instrumented program
        #[arg(long)]
        listing: bool,
    },
}

fn main() {
    checkflow_tools::init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            program,
            args,
            policy,
            errors,
            strict,
            json,
        } => {
            let checked = instrument(&program, policy, errors);
            let args = match load_args(&args) {
                Ok(a) => a,
                Err(e) => {
                    error!("{}", e);
                    process::exit(1);
                }
            };
            let (report, outputs) = match checked.call(&args) {
                Ok(r) => r,
                Err(e) => {
                    error!("Evaluation failed: {}", e);
                    process::exit(1);
                }
            };

            if json {
                match serde_json::to_string_pretty(&RunReport::new(&report, &outputs)) {
                    Ok(text) => println!("{text}"),
                    Err(e) => {
                        error!("Failed to encode report: {}", e);
                        process::exit(1);
                    }
                }
            } else {
                for (i, value) in outputs.iter().enumerate() {
                    info!("output {}: {}", i, value);
                }
                match report.get() {
                    Some(message) => warn!("{}", message),
                    None => info!("no error"),
                }
            }

            if strict {
                if let Err(failure) = check_error(&report) {
                    error!("Check failed: {}", failure);
                    process::exit(1);
                }
            }
        }

        Command::Inspect {
            program,
            policy,
            errors,
            listing,
        } => {
            let checked = instrument(&program, policy, errors);
            let schema = checked.schema();
            info!(
                "{} check sites, payload width {}",
                schema.len(),
                schema.width()
            );
            for (code, slot) in schema.slots().iter().enumerate() {
                info!("  [{}] {:<5} {}", code, slot.category.name(), slot.template);
            }
            info!("Reachable messages:");
            for message in checked.messages() {
                info!("  {}", message);
            }
            if listing {
                println!("{}", checked.function().pretty_print());
            }
        }
    }
}

fn instrument(program: &Path, policy: Option<PathBuf>, errors: Option<String>) -> Checked {
    let func = match load_program(program) {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    let mut config: CheckifyConfig = match load_policy(policy.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    if let Some(name) = errors {
        match ErrorSet::from_name(&name) {
            Some(set) => config.errors = set,
            None => {
                error!("Unknown error set '{}'", name);
                process::exit(1);
            }
        }
    }
    if !config.metadata.name.is_empty() {
        info!("Using policy: {}", config.metadata.name);
    }

    match checkify_with(&func, &config, &CheckRegistry::builtin()) {
        Ok(c) => c,
        Err(e) => {
            error!("Instrumentation failed: {}", e);
            process::exit(1);
        }
    }
}
