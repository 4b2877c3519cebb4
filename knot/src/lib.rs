/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use anyhow::{self, Context};
use console::{style, Term};
use structopt::StructOpt;
use thiserror::Error;
use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use knot_engine::{ExecutionConfig, Goal, Scheduler};
use knot_metrics::scoped_metric;
use knot_rules::{Params, Value};
use knot_store::{PathGlobs, StrictGlobMatching, Store};

pub mod goals;

use goals::{DigestGoal, ListGoal, RunGoal, RunRequest};

/// Environment variables forwarded to processes started by `knot run`.
const FORWARDED_ENV: &[&str] = &["PATH", "HOME", "LANG"];

#[derive(Debug, PartialEq, Eq)]
pub enum DebugMode {
    /// Print the compiled rule graph before running.
    List,
    Stats,
}

#[derive(Error, Debug)]
#[error("Unknown debug setting '{0}'")]
pub struct DebugModeError(String);

impl std::str::FromStr for DebugMode {
    type Err = DebugModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stats" => Ok(DebugMode::Stats),
            "list" => Ok(DebugMode::List),
            e => Err(DebugModeError(e.to_owned())),
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "knot", about = "A rule-based build engine.")]
pub struct Config {
    /// Change to this directory before doing anything else.
    #[structopt(short = "C", parse(from_os_str))]
    pub execution_dir: Option<PathBuf>,

    /// How many processes to run at once. Defaults to the number of CPUs.
    #[structopt(short = "j")]
    pub parallelism: Option<usize>,

    /// Debug modes: list, stats.
    #[structopt(short = "d", number_of_values = 1)]
    pub debug_modes: Vec<DebugMode>,

    /// Write the memo graph in graphviz format to this file after running.
    #[structopt(long, parse(from_os_str))]
    pub visualize: Option<PathBuf>,

    /// Log more. Repeat for even more. `KNOT_LOG` takes precedence.
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// List the files matching globs.
    List {
        #[structopt(required = true)]
        globs: Vec<String>,
    },
    /// Print the digest of the files matching globs.
    Digest {
        #[structopt(required = true)]
        globs: Vec<String>,
    },
    /// Run a process in a sandbox holding only its inputs, then write its outputs back.
    Run {
        /// Globs of files to place in the sandbox.
        #[structopt(long = "input", number_of_values = 1)]
        inputs: Vec<String>,
        /// Files the process produces, relative to the sandbox.
        #[structopt(long = "output", number_of_values = 1)]
        outputs: Vec<String>,
        /// Kill the process after this many seconds.
        #[structopt(long)]
        timeout: Option<u64>,
        #[structopt(required = true, last = true)]
        argv: Vec<String>,
    },
}

/// Installs the global tracing subscriber. Logs go to stderr.
pub fn init_logging(verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("KNOT_LOG")
        .from_env()
        .context("parsing KNOT_LOG")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

fn glob_params(globs: Vec<String>, origin: &str) -> Params {
    let globs = PathGlobs::new(globs).with_strict_match(StrictGlobMatching::Warn(origin.to_owned()));
    Params::new(vec![Value::new(globs)])
}

fn run_request(
    argv: Vec<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    timeout: Option<u64>,
) -> RunRequest {
    let env: BTreeMap<String, String> = FORWARDED_ENV
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect();
    RunRequest {
        argv,
        inputs: PathGlobs::new(inputs)
            .with_strict_match(StrictGlobMatching::Error("the --input option".to_owned())),
        outputs,
        env,
        timeout: timeout.map(Duration::from_secs),
    }
}

async fn execute(scheduler: &Scheduler, command: Command) -> anyhow::Result<i32> {
    scoped_metric!("goal");
    let session = scheduler.session();
    let stdout = Term::stdout();
    match command {
        Command::List { globs } => {
            let goal: ListGoal = session
                .product_request(glob_params(globs, "knot list"))
                .await?;
            stdout.write_str(&goal.to_string())?;
            Ok(goal.exit_code())
        }
        Command::Digest { globs } => {
            let goal: DigestGoal = session
                .product_request(glob_params(globs, "knot digest"))
                .await?;
            stdout.write_str(&goal.to_string())?;
            Ok(goal.exit_code())
        }
        Command::Run {
            inputs,
            outputs,
            timeout,
            argv,
        } => {
            let request = run_request(argv, inputs, outputs, timeout);
            let goal: RunGoal = session
                .product_request(Params::new(vec![Value::new(request)]))
                .await?;
            io::stdout().write_all(&goal.stdout)?;
            io::stderr().write_all(&goal.stderr)?;
            let stderr = Term::stderr();
            for path in &goal.written {
                stderr.write_line(&format!("{} {}", style("Wrote").green(), path.display()))?;
            }
            if goal.exit_code() != 0 {
                stderr.write_line(&format!(
                    "{} process exited with {}",
                    style("Failed:").red(),
                    goal.exit_code()
                ))?;
            }
            Ok(goal.exit_code())
        }
    }
}

/// Runs one command and returns the exit code for the process.
pub fn run(config: Config) -> anyhow::Result<i32> {
    if let Some(dir) = &config.execution_dir {
        std::env::set_current_dir(&dir)
            .with_context(|| format!("changing to {} for -C", dir.display()))?;
    }

    let metrics_enabled = config.debug_modes.iter().any(|v| v == &DebugMode::Stats);
    if metrics_enabled {
        knot_metrics::enable();
    }

    let build_root = std::env::current_dir().context("finding the build root")?;
    let execution = ExecutionConfig {
        build_root,
        process_parallelism: config.parallelism.unwrap_or_else(num_cpus::get),
        ..ExecutionConfig::default()
    };
    let scheduler = {
        scoped_metric!("rule_graph");
        Scheduler::new(goals::tasks(), Store::new(), execution)?
    };
    if config.debug_modes.contains(&DebugMode::List) {
        Term::stderr().write_str(&scheduler.rule_graph().to_string())?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting the runtime")?;
    let exit_code = runtime.block_on(execute(&scheduler, config.command))?;
    debug!(exit_code, nodes = scheduler.graph_len(), "finished");

    if let Some(path) = &config.visualize {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        scheduler.visualize(io::BufWriter::new(file))?;
    }
    if metrics_enabled {
        knot_metrics::dump();
    }
    Ok(exit_code)
}
