use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use tasknotes_core::config::EffectiveSettings;
use tasknotes_core::frontmatter::{FieldValue, Header};
use tasknotes_core::record::{Container, Family, NoteKind, Record, TaskStatus};
use tasknotes_core::store::{parse_field_assignment, RecordStore, RepairReport, StoreError};
use tasknotes_core::workspace::{
    init_global, init_local, resolve, resolve_global_home, ResolveRequest, Workspace,
    WorkspaceError,
};

const LOG_ENV: &str = "TASKNOTES_LOG";

#[derive(Parser)]
#[command(name = "tasknotes", version, about = "Plain-markdown tasks and notes")]
struct Cli {
    /// Use the global workspace instead of discovering one from the current directory
    #[arg(long, global = true)]
    global: bool,
    /// Start discovery from this directory
    #[arg(short = 'C', long = "dir", global = true, value_name = "PATH")]
    dir: Option<PathBuf>,
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a workspace here (or the global one with --global)
    Init,
    /// Show which workspace would be used
    Where {
        #[arg(long)]
        json: bool,
    },
    /// Create a task
    Add {
        title: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Extra header field, key=value
        #[arg(long = "field")]
        fields: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Create a note
    Note {
        title: String,
        #[arg(long, default_value = "daily")]
        kind: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// List tasks (or notes)
    List {
        #[arg(long)]
        notes: bool,
        /// Only this status (or note kind)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print a record
    Show {
        query: String,
        #[arg(long)]
        notes: bool,
        #[arg(long)]
        json: bool,
    },
    /// Move a task to active
    Start { query: String },
    /// Move a task to completed
    Done { query: String },
    /// Move a record to another status or kind
    Move {
        query: String,
        target: String,
        #[arg(long)]
        notes: bool,
    },
    /// Set a header field
    Set {
        query: String,
        field: String,
        #[arg(required = true, num_args = 1..)]
        value: Vec<String>,
        #[arg(long)]
        notes: bool,
    },
    /// Move completed tasks older than --days into archived
    Archive {
        #[arg(long)]
        days: u32,
    },
    /// Clean up after interrupted moves and manual edits
    Repair {
        #[arg(long)]
        json: bool,
    },
    /// Open a record in your editor
    Edit {
        query: String,
        #[arg(long)]
        notes: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            if let Some(hint) = remedy(&err) {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn remedy(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(err) = err.downcast_ref::<WorkspaceError>() {
        return err.remedy();
    }
    if let Some(err) = err.downcast_ref::<StoreError>() {
        return err.remedy();
    }
    None
}

fn run(cli: Cli) -> Result<()> {
    let start = match cli.dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("reading current directory")?,
    };

    if let Command::Init = cli.command {
        let workspace = if cli.global {
            let home = resolve_global_home().ok_or(WorkspaceError::NoGlobalHome)?;
            init_global(&start.join(home))?
        } else {
            init_local(&start)?
        };
        println!("Initialized {} workspace", workspace.mode.as_str());
        println!("tasks: {}", workspace.tasks_root.display());
        println!("notes: {}", workspace.notes_root.display());
        return Ok(());
    }

    let workspace = resolve(&ResolveRequest::from_env(&start, cli.global))?;
    for warning in &workspace.warnings {
        eprintln!("warning: {}", warning);
    }
    let settings = EffectiveSettings::load(&workspace);
    let store = RecordStore::new(workspace).with_allocator_options(settings.allocator_options());

    match cli.command {
        Command::Init => unreachable!("handled above"),
        Command::Where { json } => print_where(store.workspace(), json),
        Command::Add {
            title,
            status,
            tags,
            fields,
            json,
        } => {
            let status = match status {
                Some(raw) => raw.parse::<TaskStatus>().map_err(|err| anyhow!(err))?,
                None => settings.default_task_status(),
            };
            let extra = extra_fields(&tags, &fields)?;
            let record = store.create(Container::Task(status), &title, &extra)?;
            print_created(&record, json)
        }
        Command::Note {
            title,
            kind,
            tags,
            json,
        } => {
            let kind = kind.parse::<NoteKind>().map_err(|err| anyhow!(err))?;
            let extra = extra_fields(&tags, &[])?;
            let record = store.create(Container::Note(kind), &title, &extra)?;
            print_created(&record, json)
        }
        Command::List {
            notes,
            status,
            json,
        } => {
            let family = family(notes);
            let container = status
                .as_deref()
                .map(|raw| parse_container(family, raw))
                .transpose()?;
            let records = store.list(family, container)?;
            if json {
                let values: Vec<_> = records.iter().map(|r| r.to_json_value(false)).collect();
                println!("{}", serde_json::to_string_pretty(&values)?);
            } else {
                for record in &records {
                    println!("{}", record.render_line());
                }
            }
            Ok(())
        }
        Command::Show { query, notes, json } => {
            let record = store.find(family(notes), &query)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record.to_json_value(true))?);
            } else {
                let text = std::fs::read_to_string(&record.path)
                    .with_context(|| format!("reading {}", record.path.display()))?;
                print!("{}", text);
            }
            Ok(())
        }
        Command::Start { query } => {
            move_record(&store, Family::Tasks, &query, TaskStatus::Active.into())
        }
        Command::Done { query } => {
            move_record(&store, Family::Tasks, &query, TaskStatus::Completed.into())
        }
        Command::Move {
            query,
            target,
            notes,
        } => {
            let family = family(notes);
            let target = parse_container(family, &target)?;
            move_record(&store, family, &query, target)
        }
        Command::Set {
            query,
            field,
            value,
            notes,
        } => {
            let record = store.find(family(notes), &query)?;
            let (key, value) = parse_field_assignment(&format!("{}={}", field, value.join(" ")))?;
            let updated = store.set_field(&record, &key, value)?;
            let shown = updated
                .header
                .get(&key)
                .map(FieldValue::as_formatted)
                .unwrap_or_default();
            println!("{}: {} = {}", updated.id, key, shown);
            Ok(())
        }
        Command::Archive { days } => {
            let count = store.archive_older_than(days)?;
            println!("Archived {} task(s)", count);
            Ok(())
        }
        Command::Repair { json } => {
            let report = store.repair()?;
            print_repair(&report, json)
        }
        Command::Edit { query, notes } => {
            let record = store.find(family(notes), &query)?;
            open_in_editor(settings.editor(), &record.path)
        }
    }
}

fn family(notes: bool) -> Family {
    if notes {
        Family::Notes
    } else {
        Family::Tasks
    }
}

fn parse_container(family: Family, raw: &str) -> Result<Container> {
    family.parse_container(raw).ok_or_else(|| {
        let names: Vec<&str> = family.containers().iter().map(|c| c.dir_name()).collect();
        anyhow!(
            "unknown {} container '{}' (expected one of: {})",
            family,
            raw.trim(),
            names.join(", ")
        )
    })
}

fn extra_fields(tags: &[String], fields: &[String]) -> Result<Header> {
    let mut header = Header::new();
    if !tags.is_empty() {
        let tags: Vec<String> = tags
            .iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        header.insert("tags", FieldValue::List(tags));
    }
    for raw in fields {
        let (key, value) = parse_field_assignment(raw)?;
        header.insert(key, value);
    }
    Ok(header)
}

fn move_record(store: &RecordStore, family: Family, query: &str, target: Container) -> Result<()> {
    let record = store.find(family, query)?;
    if record.container == target {
        println!("{} already in {}", record.id, target);
        return Ok(());
    }
    let moved = store.transition(&record, target)?;
    println!("{}: {} -> {}", moved.id, record.container, moved.container);
    Ok(())
}

fn print_created(record: &Record, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&record.to_json_value(false))?);
    } else {
        println!("Created {} {}", record.id, record.path.display());
    }
    Ok(())
}

fn print_where(workspace: &Workspace, json: bool) -> Result<()> {
    if json {
        let value = json!({
            "mode": workspace.mode.as_str(),
            "tasks_root": workspace.tasks_root,
            "notes_root": workspace.notes_root,
            "config_dir": workspace.config_dir,
            "warnings": workspace.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("mode: {}", workspace.mode.as_str());
    println!("tasks: {}", workspace.tasks_root.display());
    println!("notes: {}", workspace.notes_root.display());
    if let Some(dir) = workspace.config_dir.as_ref() {
        println!("config: {}", dir.display());
    }
    Ok(())
}

fn print_repair(report: &RepairReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if report.is_clean() {
        println!("Nothing to repair");
        return Ok(());
    }
    for path in &report.removed_temp_files {
        println!("removed temp file {}", path.display());
    }
    for path in &report.removed_duplicates {
        println!("removed duplicate {}", path.display());
    }
    for path in &report.fixed_headers {
        println!("fixed header {}", path.display());
    }
    for id in &report.duplicate_ids {
        println!("duplicate id {} (resolve by hand)", id);
    }
    for path in &report.name_conflicts {
        println!("name shared by another record {} (resolve by hand)", path.display());
    }
    for path in &report.unreadable {
        println!("unreadable {}", path.display());
    }
    Ok(())
}

/// Config `editor`, then `VISUAL`, then `EDITOR`.
fn resolve_editor(configured: Option<String>) -> Option<String> {
    configured.or_else(|| {
        ["VISUAL", "EDITOR"].iter().find_map(|name| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    })
}

fn open_in_editor(configured: Option<String>, path: &Path) -> Result<()> {
    let command = resolve_editor(configured)
        .ok_or_else(|| {
            anyhow!("no editor configured; set `editor` in config.toml, VISUAL or EDITOR")
        })?;
    let words = shell_words::split(&command)
        .with_context(|| format!("parsing editor command '{}'", command))?;
    let Some((program, args)) = words.split_first() else {
        bail!("editor command is empty");
    };
    let program = which::which(program)
        .with_context(|| format!("editor '{}' not found on PATH", program))?;
    debug!(editor = %program.display(), path = %path.display(), "launching editor");
    let status = std::process::Command::new(&program)
        .args(args)
        .arg(path)
        .status()
        .with_context(|| format!("launching {}", program.display()))?;
    if !status.success() {
        bail!("editor exited with {}", status);
    }
    Ok(())
}
