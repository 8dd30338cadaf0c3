// Local demo harness for the agent worker pool, mirroring the Run/Version
// split in onefuzz-supervisor/src/main.rs. Not a service: it submits a small
// batch of demo tasks, prints the event stream, then shuts down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use agent_worker_pool::config::{PoolConfig, ResourceLimits};
use agent_worker_pool::pool::AgentWorkerPool;
use agent_worker_pool::task::{Priority, TaskSpec, TaskType};
use agent_worker_pool::worker::ProcessRunner;

#[derive(Parser, Debug)]
#[command(name = "agent-worker-pool", version, about = "Local agent worker pool demo harness")]
struct Opt {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spin up the pool against a demo task source and print its event stream.
    Run(RunOpt),
    /// Print the crate version.
    Version,
}

#[derive(Args, Debug)]
struct RunOpt {
    /// Path to a PoolConfig YAML/JSON document; built-in defaults otherwise.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Working directory root under which each worker gets its own subdir.
    #[arg(long, value_name = "PATH", default_value = "./agent-worker-pool-data")]
    base_dir: PathBuf,

    /// Shell command to submit as a demo task; may be repeated.
    #[arg(long = "task", value_name = "COMMAND")]
    tasks: Vec<String>,

    /// Seconds to let the pool run before shutting down.
    #[arg(long, default_value_t = 5)]
    run_secs: u64,
}

fn main() -> Result<()> {
    env_logger::init();

    let opt = Opt::parse();
    match opt.command {
        Command::Run(run_opt) => run(run_opt)?,
        Command::Version => println!("{}", env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}

fn run(opt: RunOpt) -> Result<()> {
    let config = match &opt.config {
        Some(path) => PoolConfig::from_file(path)?,
        None => PoolConfig::default(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_demo(config, opt.base_dir, opt.tasks, opt.run_secs))
}

async fn run_demo(config: PoolConfig, base_dir: PathBuf, tasks: Vec<String>, run_secs: u64) -> Result<()> {
    let pool = Arc::new(AgentWorkerPool::new(
        config,
        ResourceLimits::default(),
        base_dir,
        Arc::new(ProcessRunner),
    )?);

    let mut events = pool.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => log::warn!("failed to serialize event: {err}"),
            }
        }
    });

    pool.initialize().await?;

    let commands = if tasks.is_empty() {
        vec!["echo hello from the agent worker pool".to_string()]
    } else {
        tasks
    };
    for command in commands {
        pool.submit_task(TaskSpec {
            task_type: TaskType::Shell,
            priority: Priority::Medium,
            command,
            ..Default::default()
        })
        .await?;
    }

    tokio::time::sleep(Duration::from_secs(run_secs)).await;

    pool.shutdown().await?;
    printer.abort();
    Ok(())
}
