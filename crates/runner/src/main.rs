mod artifacts;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use batchforge_core::{BatchError, BatchStatus, JobExecution, JobExecutionId, JobParameters};
use batchforge_engine::{JobDefinitionSource, JobOperator, JsonDefinitionSource, OperatorConfig};

#[derive(Parser, Debug)]
#[command(name = "batchforge")]
#[command(about = "Run chunk-oriented batch jobs from JSON definitions", long_about = None)]
struct Cli {
    /// Directory holding `<job>.json` definitions
    #[arg(long, global = true, default_value = "jobs")]
    definitions: PathBuf,
    /// Persist checkpoints under this directory (overrides BATCHFORGE_CHECKPOINT_DIR)
    #[arg(long, global = true)]
    checkpoint_dir: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List the job definitions found in the definitions directory
    List,
    /// Print a definition after validating it
    Show { job: String },
    /// Start a job and wait for it to finish
    Run {
        job: String,
        /// Job parameter as key=value (may repeat)
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Request a stop after this many milliseconds
        #[arg(long)]
        stop_after_ms: Option<u64>,
        /// Restart the execution once if it stopped or failed
        #[arg(long)]
        restart: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
}

fn parse_params(raw: &[String]) -> anyhow::Result<JobParameters> {
    raw.iter()
        .map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .with_context(|| format!("parameter '{kv}' is not key=value"))
        })
        .collect()
}

/// Stop `execution_id` unless it has already finished.
fn stop_if_running(operator: &JobOperator, execution_id: JobExecutionId) -> anyhow::Result<()> {
    match operator.stop_and_wait(execution_id, operator.config().stop_timeout) {
        Ok(status) => {
            info!(execution_id = %execution_id, %status, "stop requested");
            Ok(())
        }
        Err(BatchError::NoSuchJobExecution(_)) => {
            info!(execution_id = %execution_id, "job finished before the stop");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_snapshot(execution: &JobExecution) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(execution)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    batchforge_observability::init();
    let cli = Cli::parse();

    let definitions = JsonDefinitionSource::new(&cli.definitions);
    match cli.cmd {
        Cmd::List => {
            for name in definitions.job_names() {
                println!("{name}");
            }
            Ok(())
        }
        Cmd::Show { job } => {
            let definition = definitions
                .load(&job)?
                .with_context(|| format!("no definition for '{job}' in {}", cli.definitions.display()))?;
            println!("{}", serde_json::to_string_pretty(&definition)?);
            Ok(())
        }
        Cmd::Run {
            job,
            params,
            stop_after_ms,
            restart,
            timeout_secs,
        } => {
            let mut config = OperatorConfig::from_env();
            if let Some(dir) = cli.checkpoint_dir {
                config = config.with_checkpoint_dir(dir);
            }
            let timeout = Duration::from_secs(timeout_secs);
            let operator = JobOperator::from_config(definitions, artifacts::registry(), config)?;

            let mut execution = operator.start(&job, parse_params(&params)?)?;
            info!(job = %job, execution_id = %execution.id, "job submitted");

            if let Some(ms) = stop_after_ms {
                operator.wait_for_status(execution.id, &[BatchStatus::Completed, BatchStatus::Failed], Duration::from_millis(ms))?;
                stop_if_running(&operator, execution.id)?;
            }

            let mut snapshot = operator.wait_until_finished(execution.id, timeout)?;
            if restart && matches!(snapshot.status, BatchStatus::Stopped | BatchStatus::Failed) {
                execution = operator.restart(execution.id)?;
                info!(job = %job, execution_id = %execution.id, "job restarted");
                snapshot = operator.wait_until_finished(execution.id, timeout)?;
            }

            operator.shutdown(operator.config().stop_timeout)?;
            print_snapshot(&snapshot)?;

            match snapshot.status {
                BatchStatus::Completed | BatchStatus::Stopped => Ok(()),
                status if status.is_active() => bail!("job still {status} after {timeout_secs}s"),
                status => bail!(
                    "job ended {status}: {}",
                    snapshot.failure.as_deref().unwrap_or("no cause recorded")
                ),
            }
        }
    }
}
