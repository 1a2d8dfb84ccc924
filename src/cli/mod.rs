#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{self, Config};
use crate::error::CtrlLordError;
use crate::output::table::Table;
use crate::playbook::history::{RunHistory, StepState};
use crate::playbook::loader::{find_playbook, load_playbooks};
use crate::playbook::manager::RunManager;
use crate::playbook::model::Playbook;
use crate::playbook::params::ParamCache;
use crate::playbook::runner::RunEvent;
use crate::task::backend::backend_from_config;
use crate::task::generator::TaskGenerator;
use crate::task::model::{TaskPayload, TaskRecord};
use crate::task::queue::{QueueEvent, TaskQueue};
use crate::task::storage::TaskStorage;

#[derive(Debug, Parser)]
#[command(
    name = "ctrllord",
    version,
    about = "Quick task capture and shell playbook runner"
)]
pub struct Cli {
    /// Debug logging on stderr (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Use this config file instead of ~/.config/ctrllord/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Task(TaskArgs),
    #[command(alias = "pb")]
    Playbook(PlaybookArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub cmd: TaskCmd,
}

#[derive(Debug, Subcommand)]
pub enum TaskCmd {
    /// Submit one task through the configured backend
    Submit(TaskSubmitArgs),
    /// Tasks created today (UTC)
    Today(TaskTodayArgs),
    /// Expand a one-line summary into a ticket draft
    Generate(TaskGenerateArgs),
}

#[derive(Debug, Parser)]
pub struct TaskSubmitArgs {
    pub summary: String,
    #[arg(short, long)]
    pub description: Option<String>,
    /// Issue type, one of task.issue_types (defaults to the first)
    #[arg(short = 't', long = "type")]
    pub issue_type: Option<String>,
    #[arg(short, long, default_value = "")]
    pub component: String,
    /// Fill description and type from the ticket generator first
    #[arg(short, long)]
    pub generate: bool,
}

#[derive(Debug, Parser)]
pub struct TaskTodayArgs {
    #[arg(long, conflicts_with = "csv")]
    pub json: bool,
    #[arg(long)]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct TaskGenerateArgs {
    pub summary: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct PlaybookArgs {
    #[command(subcommand)]
    pub cmd: PlaybookCmd,
}

#[derive(Debug, Subcommand)]
pub enum PlaybookCmd {
    #[command(alias = "ls")]
    List(PlaybookListArgs),
    Show(PlaybookShowArgs),
    Run(PlaybookRunArgs),
}

#[derive(Debug, Parser)]
pub struct PlaybookListArgs {
    #[arg(long, conflicts_with = "csv")]
    pub json: bool,
    #[arg(long)]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct PlaybookShowArgs {
    /// Playbook name or unique case-insensitive part of it
    pub name: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct PlaybookRunArgs {
    /// Playbook name or unique case-insensitive part of it
    pub name: String,
    /// Parameter value, exported to every step as an environment variable
    #[arg(short = 'p', long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,
    /// Do not remember the parameter values for the next run
    #[arg(long)]
    pub no_save: bool,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Set(ConfigSetArgs),
    Get(ConfigGetArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = cli.config;
    match cli.cmd {
        Commands::Completion(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "ctrllord", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(args) => cmd_config(args, config_path.as_deref()),
        Commands::Task(args) => cmd_task(args, config_path).await,
        Commands::Playbook(args) => cmd_playbook(args, config_path).await,
        Commands::Version => Ok(cmd_version()),
    }
}

async fn load_cfg(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let cfg = tokio::task::spawn_blocking(move || -> anyhow::Result<Config> {
        match path {
            Some(p) => config::load_path(&p),
            None => {
                let (cfg, _doc, _paths) = config::load()?;
                Ok(cfg)
            }
        }
    })
    .await??;
    Ok(cfg)
}

fn cmd_config(args: ConfigArgs, path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config::default_paths()?.config_file,
    };
    match args.cmd {
        ConfigCmd::List => {
            print!("{}", config::list_resolved_toml_at_path(&path)?);
        }
        ConfigCmd::Set(set) => {
            config::set_value_string_at_path(&path, &set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
        }
        ConfigCmd::Get(get) => match config::get_value_string_at_path(&path, &get.key)? {
            Some(v) => println!("{v}"),
            None => anyhow::bail!(
                "configuration key '{}' not found - use 'ctrllord config list' to see available keys",
                get.key
            ),
        },
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_task(args: TaskArgs, config_path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let cfg = load_cfg(config_path).await?;
    match args.cmd {
        TaskCmd::Submit(args) => task_submit(&cfg, args).await,
        TaskCmd::Today(args) => task_today(&cfg, &args).await,
        TaskCmd::Generate(args) => {
            let draft = TaskGenerator::from_config(&cfg.llm)?
                .generate(&args.summary)
                .await;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&draft)?);
            } else {
                println!("{} [{}]\n\n{}", draft.summary, draft.issue_type, draft.description);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Picks the issue type for a submission. An explicit type must be one of
/// `configured`. A drafted type that is not configured is replaced by the
/// first configured type. Matching ignores case and returns the configured
/// spelling.
fn resolve_issue_type(
    configured: &[String],
    explicit: Option<&str>,
    drafted: Option<&str>,
) -> Result<String, CtrlLordError> {
    let lookup = |wanted: &str| {
        configured
            .iter()
            .find(|t| t.trim().eq_ignore_ascii_case(wanted.trim()))
            .cloned()
    };
    if let Some(wanted) = explicit {
        return lookup(wanted).ok_or_else(|| {
            CtrlLordError::InvalidPayload(format!(
                "issue type '{wanted}' is not one of task.issue_types ({})",
                configured.join(", ")
            ))
        });
    }
    if let Some(wanted) = drafted
        && let Some(found) = lookup(wanted)
    {
        return Ok(found);
    }
    let first = configured
        .iter()
        .find(|t| !t.trim().is_empty())
        .cloned()
        .ok_or_else(|| CtrlLordError::InvalidPayload("task.issue_types is empty".to_owned()))?;
    if let Some(wanted) = drafted {
        warn!(drafted = %wanted, using = %first, "generated issue type is not configured");
    }
    Ok(first)
}

async fn task_submit(cfg: &Config, args: TaskSubmitArgs) -> anyhow::Result<ExitCode> {
    let mut summary = args.summary;
    let mut description = args.description;
    let mut drafted_type = None;
    if args.generate {
        let draft = TaskGenerator::from_config(&cfg.llm)?
            .generate(&summary)
            .await;
        summary = draft.summary;
        description.get_or_insert(draft.description);
        drafted_type = Some(draft.issue_type);
    }
    let issue_type = resolve_issue_type(
        &cfg.task.issue_types,
        args.issue_type.as_deref(),
        drafted_type.as_deref(),
    )?;
    if !args.component.is_empty() && !cfg.task.components.contains(&args.component) {
        warn!(component = %args.component, "component is not listed in task.components");
    }

    let payload = TaskPayload::new(
        &summary,
        description.unwrap_or_default(),
        issue_type,
        args.component,
    )?;

    let (queue, mut events) = TaskQueue::spawn(backend_from_config(cfg)?);
    queue.enqueue(payload)?;
    queue.stop()?;
    queue.join().await;

    let mut code = ExitCode::SUCCESS;
    while let Some(event) = events.recv().await {
        match event {
            QueueEvent::Completed(result) => println!("{}  {}", result.key, result.url),
            QueueEvent::Failed { error, payload } => {
                eprintln!("failed to create '{}': {error}", payload.summary);
                code = ExitCode::from(1);
            }
            QueueEvent::ReloadFailed { error } => warn!("reload failed: {error}"),
        }
    }
    Ok(code)
}

async fn task_today(cfg: &Config, args: &TaskTodayArgs) -> anyhow::Result<ExitCode> {
    let storage = TaskStorage::new(config::expand_path(&cfg.task.data_dir)?);
    let dir = storage.dir().to_path_buf();
    let records: Vec<TaskRecord> = tokio::task::spawn_blocking(move || storage.today()).await??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut table = Table::new(["KEY", "TYPE", "SUMMARY", "CREATED"]).max_cell_width(60);
    for r in &records {
        table.row([
            r.result.key.as_str(),
            r.result.issue_type.as_str(),
            r.result.summary.as_str(),
            r.created_at.as_str(),
        ]);
    }
    if args.csv {
        table.print_csv()?;
    } else if table.is_empty() {
        println!("No tasks created today in {}", dir.display());
    } else {
        table.print()?;
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_playbook(
    args: PlaybookArgs,
    config_path: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let cfg = load_cfg(config_path).await?;
    let dir = config::expand_path(&cfg.playbooks.dir)?;
    let playbooks = tokio::task::spawn_blocking(move || load_playbooks(&dir)).await??;

    match args.cmd {
        PlaybookCmd::List(args) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&playbooks)?);
                return Ok(ExitCode::SUCCESS);
            }
            let mut table = Table::new(["NAME", "STEPS", "DESCRIPTION", "FILE"]).max_cell_width(50);
            for pb in &playbooks {
                table.row([
                    pb.name.clone(),
                    pb.steps.len().to_string(),
                    pb.description.clone(),
                    pb.file_path.display().to_string(),
                ]);
            }
            if args.csv {
                table.print_csv()?;
            } else if table.is_empty() {
                println!("No playbooks in {}", cfg.playbooks.dir);
            } else {
                table.print()?;
            }
            Ok(ExitCode::SUCCESS)
        }
        PlaybookCmd::Show(args) => {
            let pb = find_playbook(&playbooks, &args.name)?;
            let cache = ParamCache::new(config::expand_path(&cfg.playbooks.param_cache)?);
            if args.json {
                println!("{}", serde_json::to_string_pretty(pb)?);
            } else {
                print_playbook(pb, &cache.prefill(pb));
            }
            Ok(ExitCode::SUCCESS)
        }
        PlaybookCmd::Run(args) => {
            let pb = find_playbook(&playbooks, &args.name)?.clone();
            playbook_run(&cfg, pb, &args).await
        }
    }
}

fn print_playbook(pb: &Playbook, values: &BTreeMap<String, String>) {
    println!("{}", pb.name);
    if !pb.description.is_empty() {
        println!("  {}", pb.description);
    }
    println!("  file: {}", pb.file_path.display());
    println!("  cwd:  {}", pb.cwd.display());
    if !pb.params.is_empty() {
        println!("params:");
        for p in &pb.params {
            let value = values.get(&p.name).map_or("", String::as_str);
            println!("  {} ({}) = {value}", p.name, p.label);
        }
    }
    println!("steps:");
    for (i, step) in pb.steps.iter().enumerate() {
        println!("  {}. {}", i + 1, step.name);
        for line in step.run.lines() {
            println!("       {line}");
        }
    }
}

async fn playbook_run(
    cfg: &Config,
    pb: Playbook,
    args: &PlaybookRunArgs,
) -> anyhow::Result<ExitCode> {
    let cache = ParamCache::new(config::expand_path(&cfg.playbooks.param_cache)?);
    let mut values = cache.prefill(&pb);
    for raw in &args.params {
        let (name, value) = parse_param(raw)?;
        if !pb.params.iter().any(|p| p.name == name) {
            warn!(param = %name, playbook = %pb.name, "parameter is not declared by the playbook");
        }
        values.insert(name, value);
    }
    if !args.no_save
        && !values.is_empty()
        && let Err(e) = cache.save(&pb.file_path, &values)
    {
        warn!("failed to save playbook params: {e:#}");
    }

    let mut manager = RunManager::from_config(&cfg.playbooks);
    let (run_id, mut events) = manager.start(&pb, values)?;
    let mut history = RunHistory::new();
    history.begin(run_id, &pb);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;
    let total = pb.steps.len();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_run_event(&event, total);
                history.apply(&pb.file_path, &event);
            }
            _ = &mut ctrl_c, if !stopping => {
                eprintln!("stopping '{}'...", pb.name);
                manager.stop(&pb.file_path);
                stopping = true;
            }
        }
    }

    let outcome = manager
        .join(&pb.file_path)
        .await
        .context("playbook run vanished")?;
    if let Some(snapshot) = history.get(&pb.file_path) {
        let done = snapshot
            .steps
            .iter()
            .filter(|s| s.state == StepState::Success)
            .count();
        eprintln!("{done}/{total} steps succeeded ({})", snapshot.run_id);
    }
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_run_event(event: &RunEvent, total: usize) {
    match event {
        RunEvent::StepStarted { index, name } => println!("==> [{}/{total}] {name}", index + 1),
        RunEvent::LogLine(line) => println!("{line}"),
        RunEvent::StepFinished { success: false, index } => {
            println!("<== step {} failed", index + 1);
        }
        RunEvent::StepFinished { .. } => {}
        RunEvent::RunFinished { cancelled: true, .. } => println!("== stopped"),
        RunEvent::RunFinished { success, .. } => {
            println!("== {}", if *success { "done" } else { "failed" });
        }
    }
}

fn parse_param(raw: &str) -> Result<(String, String), CtrlLordError> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_owned(), value.to_owned()))
        }
        _ => Err(CtrlLordError::InvalidParam(raw.to_owned())),
    }
}

fn cmd_version() -> ExitCode {
    println!("ctrllord version {}", env!("CARGO_PKG_VERSION"));
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_params_parse_into_pairs() {
        let cli = Cli::parse_from([
            "ctrllord", "playbook", "run", "deploy", "-p", "ENV=prod", "--param", "TAG=a=b",
        ]);
        let Commands::Playbook(PlaybookArgs {
            cmd: PlaybookCmd::Run(args),
        }) = cli.cmd
        else {
            panic!("expected playbook run");
        };
        let parsed: Vec<_> = args.params.iter().map(|p| parse_param(p).unwrap()).collect();
        assert_eq!(
            parsed,
            vec![
                ("ENV".to_owned(), "prod".to_owned()),
                ("TAG".to_owned(), "a=b".to_owned())
            ]
        );
    }

    #[test]
    fn malformed_params_are_rejected() {
        assert!(matches!(
            parse_param("NOVALUE"),
            Err(CtrlLordError::InvalidParam(_))
        ));
        assert!(parse_param("=x").is_err());
        assert_eq!(parse_param("EMPTY=").unwrap(), ("EMPTY".to_owned(), String::new()));
    }

    #[test]
    fn submit_flags_parse() {
        let cli = Cli::parse_from([
            "ctrllord", "-v", "task", "submit", "Fix login", "-t", "Bug", "--generate",
        ]);
        assert!(cli.verbose);
        let Commands::Task(TaskArgs {
            cmd: TaskCmd::Submit(args),
        }) = cli.cmd
        else {
            panic!("expected task submit");
        };
        assert_eq!(args.summary, "Fix login");
        assert_eq!(args.issue_type.as_deref(), Some("Bug"));
        assert!(args.generate);
        assert_eq!(args.component, "");
    }

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[test]
    fn unconfigured_issue_type_is_rejected() {
        let configured = types(&["Task", "Bug"]);
        let err = resolve_issue_type(&configured, Some("Epic"), None).unwrap_err();
        assert!(matches!(err, CtrlLordError::InvalidPayload(msg) if msg.contains("Epic")));
        // An explicit type wins over the draft, so a bad one is not rescued.
        assert!(resolve_issue_type(&configured, Some("Epic"), Some("Bug")).is_err());
        assert_eq!(
            resolve_issue_type(&configured, Some("bug"), None).unwrap(),
            "Bug"
        );
    }

    #[test]
    fn drafted_issue_type_falls_back_to_first_configured() {
        let configured = types(&["Task", "Bug"]);
        assert_eq!(
            resolve_issue_type(&configured, None, Some("Story")).unwrap(),
            "Task"
        );
        assert_eq!(
            resolve_issue_type(&configured, None, Some("Bug")).unwrap(),
            "Bug"
        );
        assert_eq!(resolve_issue_type(&configured, None, None).unwrap(), "Task");
        assert!(matches!(
            resolve_issue_type(&[], None, Some("Task")),
            Err(CtrlLordError::InvalidPayload(_))
        ));
    }

    #[test]
    fn config_commands_use_override_path() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("config.toml");
        let set = ConfigArgs {
            cmd: ConfigCmd::Set(ConfigSetArgs {
                key: "playbooks.shell".to_owned(),
                value: "zsh".to_owned(),
            }),
        };
        cmd_config(set, Some(&path)).unwrap();
        assert_eq!(
            config::get_value_string_at_path(&path, "playbooks.shell").unwrap(),
            Some("zsh".to_owned())
        );
    }
}
