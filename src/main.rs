use anyhow::Context;
use clap::Parser;
use move_clippy_incremental::cli::{Args, CheckArgs, Command, OutputFormat, WatchArgs};
use move_clippy_incremental::config::{self, WorkspaceConfig};
use move_clippy_incremental::diagnostics::{
    ConsoleSink, Diagnostic, DiagnosticSink, MemorySink, render_pretty,
};
use move_clippy_incremental::level::Severity;
use move_clippy_incremental::location::normalize_path;
use move_clippy_incremental::orchestrator::{
    BuildDelta, BuildOrchestrator, FileChange, ProjectId,
};
use move_clippy_incremental::ruleset::ParsedRuleSet;
use move_clippy_incremental::watch::{FsChangeNotifier, SourceWatcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

fn main() -> ExitCode {
    move_clippy_incremental::telemetry::init_tracing();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    match args.command {
        Command::ListRules { ruleset } => {
            list_rules(&ruleset)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check(check) => check_command(args.config.as_deref(), check),
        Command::Watch(watch) => watch_command(args.config.as_deref(), watch),
    }
}

fn list_rules(path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read rule set: {}", path.display()))?;
    let set = ParsedRuleSet::parse(&bytes, &path.display().to_string())?;

    let mut rules: Vec<_> = set.rules.iter().collect();
    rules.sort_by(|a, b| a.id().cmp(b.id()));
    for rule in rules {
        println!(
            "{}\t{}\t{}\t{}",
            rule.id(),
            rule.definition.priority,
            rule.severity().as_str(),
            rule.definition.message
        );
    }
    Ok(())
}

fn load_workspace(explicit: Option<&Path>) -> anyhow::Result<(PathBuf, WorkspaceConfig)> {
    let start_dir = std::env::current_dir().context("failed to read current directory")?;
    let Some((path, cfg)) = config::load_config(explicit, &start_dir)? else {
        anyhow::bail!(
            "no {} found in {} or its parents",
            config::DEFAULT_CONFIG_FILE_NAME,
            start_dir.display()
        );
    };
    let base_dir = normalize_path(path.parent().unwrap_or(Path::new(".")));
    Ok((base_dir, cfg))
}

fn selected_projects(
    orchestrator: &BuildOrchestrator,
    requested: &[String],
) -> anyhow::Result<Vec<ProjectId>> {
    if requested.is_empty() {
        return Ok(orchestrator.initially_enabled());
    }
    let known = orchestrator.projects();
    requested
        .iter()
        .map(|name| {
            let id = ProjectId::new(name.clone());
            anyhow::ensure!(known.contains(&id), "unknown project `{name}`");
            Ok(id)
        })
        .collect()
}

fn check_command(explicit: Option<&Path>, args: CheckArgs) -> anyhow::Result<ExitCode> {
    let (base_dir, cfg) = load_workspace(explicit)?;
    let sink = Arc::new(MemorySink::new());
    let orchestrator =
        BuildOrchestrator::from_config(&cfg, &base_dir, sink.clone() as Arc<dyn DiagnosticSink>)?;

    let projects = selected_projects(&orchestrator, &args.projects)?;
    for project in &projects {
        orchestrator.enable(project)?;
    }
    orchestrator.wait_idle();

    let mut failed = 0usize;
    for project in &projects {
        if let Some(summary) = orchestrator.last_summary(project) {
            failed += summary.failed;
            for warning in &summary.warnings {
                eprintln!("warning: {project}: {warning}");
            }
        }
    }

    let diagnostics = sink.all();
    print_diagnostics(&diagnostics, args.format)?;
    orchestrator.shutdown();

    let has_error = diagnostics.iter().any(|d| d.severity == Severity::Error);
    if failed > 0 {
        eprintln!("{failed} file(s) could not be analyzed");
    }
    if has_error || (args.deny_warnings && !diagnostics.is_empty()) {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_diagnostics(diagnostics: &[Diagnostic], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(diagnostics)?),
        OutputFormat::Pretty => {
            for diagnostic in diagnostics {
                println!("{}", render_pretty(diagnostic));
            }
        }
    }
    Ok(())
}

fn watch_command(explicit: Option<&Path>, args: WatchArgs) -> anyhow::Result<ExitCode> {
    let (base_dir, cfg) = load_workspace(explicit)?;
    let sink = Arc::new(ConsoleSink::new(args.format.into()));
    let orchestrator = BuildOrchestrator::from_config(&cfg, &base_dir, sink)?;
    let _rule_watcher = FsChangeNotifier::attach(orchestrator.analyzer().cache())
        .context("failed to watch rule-set files")?;

    let projects = selected_projects(&orchestrator, &args.projects)?;
    let mut roots = BTreeMap::new();
    let mut extensions = Vec::new();
    for project in &projects {
        let settings = orchestrator.settings(project)?;
        extensions.extend(settings.extensions.iter().cloned());
        roots.insert(project.clone(), normalize_path(&settings.root));
        orchestrator.enable(project)?;
    }
    orchestrator.wait_idle();
    extensions.sort();
    extensions.dedup();

    let known = orchestrator.analyzer().processor().tracked_files();
    let root_list: Vec<PathBuf> = roots.values().cloned().collect();
    let mut watcher = SourceWatcher::new(&root_list, &extensions, known)
        .context("failed to watch project sources")?;
    tracing::info!(projects = projects.len(), "watching for changes");

    loop {
        let Some(changes) = watcher.next_changes(Duration::from_secs(1)) else {
            continue;
        };
        let mut by_project: BTreeMap<ProjectId, Vec<FileChange>> = BTreeMap::new();
        for change in changes {
            if let Some((project, _)) = roots.iter().find(|(_, root)| change.path.starts_with(root)) {
                by_project.entry(project.clone()).or_default().push(change);
            }
        }
        for (project, changes) in by_project {
            orchestrator.on_build(&project, BuildDelta::incremental(changes))?;
        }
    }
}
