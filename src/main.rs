use std::io::{Stdout, Write};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use console::style;
use tasuki::clean::{CleanOptions, clean};
use tasuki::loader::{ParType, RunConfig, TaskFile, TaskSet};
use tasuki::{
    ConsoleReporter, DependencyStore, ExitRequest, FileStore, ProcessRunner, ProcessSpawner,
    RunOptions, Runner, Strategy, TaskDispatcher, ThreadRunner, worker,
};

const DEP_FILE: &str = ".tasuki.db";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Task file, relative paths in it are resolved from its directory.
    #[arg(short, long, global = true, default_value = "tasks.json")]
    file: Utf8PathBuf,

    /// File keeping the state of past runs.
    #[arg(long, global = true)]
    dep_file: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run tasks, the default when no command is given.
    Run(RunArgs),
    /// Undo what tasks produced and forget their state.
    Clean(CleanArgs),
    /// List the tasks in the task file.
    List,
    /// Serve orders from a process pool.
    #[command(hide = true)]
    Worker,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Number of parallel workers, 0 runs sequentially.
    #[arg(short = 'n', long)]
    num_process: Option<usize>,

    #[arg(short = 'P', long, value_enum)]
    par_type: Option<ParType>,

    /// Keep running tasks that do not depend on a failed one.
    #[arg(short, long = "continue")]
    continue_on_error: bool,

    /// Execute tasks even if they are up to date.
    #[arg(short, long)]
    always_execute: bool,

    /// Task names or targets.
    tasks: Vec<String>,
}

#[derive(Args, Debug)]
struct CleanArgs {
    /// Print what would be cleaned.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Clean the task dependencies too.
    #[arg(long)]
    clean_dep: bool,

    /// Clean every task.
    #[arg(short, long)]
    all: bool,

    /// Task names or targets.
    tasks: Vec<String>,
}

#[cfg(feature = "logging")]
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    #[cfg(feature = "logging")]
    init_logging();

    let cli = Cli::parse();

    let file = enter_task_dir(&cli.file)?;
    let TaskFile { config, tasks } = TaskFile::load(&file)?;
    let set = TaskSet::new(tasks)?;

    let dep_file = cli
        .dep_file
        .or_else(|| config.dep_file.clone())
        .unwrap_or_else(|| Utf8PathBuf::from(DEP_FILE));

    let command = match cli.command {
        _ if worker::is_worker() => Command::Worker,
        Some(command) => command,
        None => Command::Run(RunArgs::default()),
    };

    let code = match command {
        Command::Run(args) => run(set, &config, &file, &dep_file, args)?,
        Command::Clean(args) => run_clean(&set, &config, &dep_file, args)?,
        Command::List => list(&set)?,
        Command::Worker => {
            worker::serve_stdio(&set.into_map())?;
            return Ok(());
        }
    };

    std::process::exit(code)
}

/// Moves into the directory of the task file, returning its name there.
fn enter_task_dir(path: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    let name = path
        .file_name()
        .with_context(|| format!("'{path}' is not a file"))?;
    if let Some(dir) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
        std::env::set_current_dir(dir)
            .with_context(|| format!("entering '{dir}'"))?;
    }
    Ok(Utf8PathBuf::from(name))
}

fn run(
    set: TaskSet,
    config: &RunConfig,
    file: &Utf8Path,
    dep_file: &Utf8Path,
    args: RunArgs,
) -> anyhow::Result<i32> {
    let selected = set.select(&args.tasks, config.default_tasks.as_deref())?;

    let mut options = RunOptions::from(config);
    options.continue_on_error |= args.continue_on_error;
    options.always_execute |= args.always_execute;
    let num_process = args.num_process.unwrap_or(config.num_process);
    let mut par_type = args.par_type.unwrap_or(config.par_type);

    let available = ProcessRunner::<FileStore, ConsoleReporter<Stdout>>::available();
    if num_process > 0 && par_type == ParType::Process && !available {
        tracing::warn!("process pool not available, using threads");
        par_type = ParType::Thread;
    }

    let store = FileStore::open(dep_file)?;
    let reporter = ConsoleReporter::stdout();
    let mut dispatcher = TaskDispatcher::new(set.into_map(), selected);

    tracing::info!("running with {num_process} workers ({par_type:?})");
    let result = match (num_process, par_type) {
        (0, _) => {
            let mut runner = Runner::new(store, reporter, options);
            runner.run_all(&mut dispatcher)
        }
        (n, ParType::Thread) => {
            let mut runner = ThreadRunner::new(store, reporter, options, n);
            runner.run_all(&mut dispatcher)
        }
        (n, ParType::Process) => {
            let program = std::env::current_exe()?;
            let spawner = ProcessSpawner::new(program, ["--file", file.as_str(), "worker"]);
            let mut runner = ProcessRunner::new(store, reporter, options, n, spawner);
            runner.run_all(&mut dispatcher)
        }
    };

    Ok(match result {
        Ok(result) => result.code(),
        Err(ExitRequest(code)) => code,
    })
}

fn run_clean(
    set: &TaskSet,
    config: &RunConfig,
    dep_file: &Utf8Path,
    args: CleanArgs,
) -> anyhow::Result<i32> {
    let options = CleanOptions {
        dryrun: args.dry_run,
        clean_dep: args.clean_dep,
        clean_all: args.all,
    };

    let mut store = FileStore::open(dep_file)?;
    let mut out = std::io::stdout().lock();
    let defaults = config.default_tasks.as_deref();
    let failures = clean(set, &mut store, &args.tasks, defaults, options, &mut out)?;
    store.close()?;

    Ok(if failures.is_empty() { 0 } else { 2 })
}

fn list(set: &TaskSet) -> anyhow::Result<i32> {
    let tasks: Vec<_> = set
        .iter()
        .filter(|task| !task.is_subtask && !task.name.starts_with('_'))
        .collect();
    let width = tasks.iter().map(|task| task.name.len()).max().unwrap_or(0);

    let mut out = std::io::stdout().lock();
    for task in tasks {
        let doc = task.doc.as_deref().unwrap_or("");
        writeln!(out, "{:<width$}   {}", style(&task.name).bold(), doc)?;
    }

    Ok(0)
}
