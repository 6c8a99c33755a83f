use std::{
    collections::{BTreeSet, HashSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use org_edit::core::{Document, Position};
use org_edit::session::{Applied, CycleDirection, RequestKind};
use org_edit::{EditorConfig, NomOutlineParser, Outcome, OutlineParser, Session};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "org-edit",
    about = "Structural edits on Org outlines from the command line",
    version
)]
struct Cli {
    /// Editor configuration (JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print the node tree.
    Parse(ParseArgs),

    /// Cycle the TODO keyword of the heading at the cursor.
    Todo(TodoArgs),

    /// Raise the heading at the cursor one or more levels.
    Promote(LevelArgs),

    /// Lower the heading at the cursor one or more levels.
    Demote(LevelArgs),

    /// Step the timestamp field under the cursor.
    AdjustDate(AdjustDateArgs),

    /// Insert a sibling heading after the current subtree.
    InsertHeading(CursorArgs),

    /// Toggle the checkbox of the list item at the cursor.
    ToggleCheckbox(CursorArgs),

    /// Move the subtree at the cursor to its archive file.
    Archive(ArchiveArgs),

    /// Resolve the link under the cursor.
    Link(CursorArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct CursorArgs {
    /// Org file to edit.
    file: PathBuf,
    /// Cursor line (1-based).
    #[arg(long)]
    line: usize,
    /// Cursor column (1-based).
    #[arg(long, default_value_t = 1)]
    col: usize,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

impl CursorArgs {
    fn position(&self) -> Result<Position> {
        if self.line == 0 || self.col == 0 {
            anyhow::bail!("--line and --col are 1-based");
        }
        Ok(Position::new(self.line - 1, self.col - 1))
    }
}

#[derive(Debug, Args)]
struct TodoArgs {
    #[command(flatten)]
    cursor: CursorArgs,
    /// Cycle backwards.
    #[arg(long)]
    prev: bool,
    /// Note text for a closing or repeat note, when one is requested.
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
struct LevelArgs {
    #[command(flatten)]
    cursor: CursorArgs,
    /// Number of levels to shift.
    #[arg(long, default_value_t = 1)]
    count: u8,
    /// Shift the whole subtree instead of the heading alone.
    #[arg(long)]
    subtree: bool,
}

#[derive(Debug, Args)]
struct AdjustDateArgs {
    #[command(flatten)]
    cursor: CursorArgs,
    /// Steps to apply; negative moves backwards.
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    by: i64,
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    #[command(flatten)]
    cursor: CursorArgs,
    /// Append the archived subtree here instead of the configured location.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &config),
        Commands::Todo(args) => handle_todo(args, config),
        Commands::Promote(args) => handle_level(args, config, true),
        Commands::Demote(args) => handle_level(args, config, false),
        Commands::AdjustDate(args) => {
            let pos = args.cursor.position()?;
            handle_edit(&args.cursor, config, |s| Ok(s.adjust_date_part(pos, args.by)?))
        }
        Commands::InsertHeading(args) => {
            let pos = args.position()?;
            handle_edit(&args, config, |s| Ok(s.insert_heading(pos)?))
        }
        Commands::ToggleCheckbox(args) => {
            let pos = args.position()?;
            handle_edit(&args, config, |s| Ok(s.toggle_checkbox(pos)?))
        }
        Commands::Archive(args) => handle_archive(args, config),
        Commands::Link(args) => handle_link(args, config),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "org_edit=debug" } else { "org_edit=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EditorConfig> {
    match path {
        Some(path) => EditorConfig::load(path).with_context(|| format!("loading config {:?}", path)),
        None => Ok(EditorConfig::default()),
    }
}

fn handle_parse(args: ParseArgs, config: &EditorConfig) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let parser = NomOutlineParser::new(config.clone());
    let mut parsed = Vec::new();
    for path in expanded {
        debug!(?path, "parsing");
        let doc = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        parsed.push((path, doc));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a Document,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                document: doc,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, doc)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", doc);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn open_session(file: &Path, config: EditorConfig) -> Result<Session> {
    let text = fs::read_to_string(file).with_context(|| format!("reading {:?}", file))?;
    let session = Session::new(&text, config)
        .and_then(|s| s.with_path(file))
        .with_context(|| format!("parsing {:?}", file))?;
    Ok(session)
}

/// Run one operation and write or print the resulting text.
fn handle_edit(
    cursor: &CursorArgs,
    config: EditorConfig,
    op: impl FnOnce(&mut Session) -> Result<Outcome>,
) -> Result<()> {
    let mut session = open_session(&cursor.file, config)?;
    let outcome = op(&mut session)?;
    report(&outcome)?;
    finish(&session, cursor)
}

fn handle_todo(args: TodoArgs, config: EditorConfig) -> Result<()> {
    let TodoArgs { cursor, prev, note } = args;
    let pos = cursor.position()?;
    let direction = if prev {
        CycleDirection::Prev
    } else {
        CycleDirection::Next
    };
    handle_edit(&cursor, config, |session| {
        let outcome = session.cycle_todo(pos, direction)?;
        if let Outcome::Applied(Applied {
            followup: Some(request),
            ..
        }) = &outcome
        {
            if matches!(request.kind, RequestKind::ClosingNote { .. }) {
                if note.is_none() {
                    info!("note requested; pass --note to record one");
                }
                session.respond(request, note)?;
            }
        }
        Ok(outcome)
    })
}

fn handle_level(args: LevelArgs, config: EditorConfig, up: bool) -> Result<()> {
    let LevelArgs {
        cursor,
        count,
        subtree,
    } = args;
    let pos = cursor.position()?;
    handle_edit(&cursor, config, |session| {
        let outcome = if up {
            session.promote(pos, count, subtree)?
        } else {
            session.demote(pos, count, subtree)?
        };
        Ok(outcome)
    })
}

fn handle_archive(args: ArchiveArgs, config: EditorConfig) -> Result<()> {
    let ArchiveArgs { cursor, output } = args;
    let pos = cursor.position()?;
    let mut session = open_session(&cursor.file, config)?;
    match session.archive_subtree(pos)? {
        Outcome::Archived(archived) => {
            let target = output
                .or_else(|| cursor.in_place.then(|| PathBuf::from(&archived.target_file)));
            match target {
                Some(target) => {
                    append_to(&target, &archived.text)?;
                    info!(archive = ?target, "archived subtree");
                }
                None => {
                    info!(archive = %archived.target_file, "dry run, archive not written");
                    eprint!("{}", archived.text);
                }
            }
        }
        other => report(&other)?,
    }
    finish(&session, &cursor)
}

fn handle_link(args: CursorArgs, config: EditorConfig) -> Result<()> {
    let pos = args.position()?;
    let session = open_session(&args.file, config)?;
    let outcome = session.open_link_in_document(pos)?;
    match &outcome {
        Outcome::Resolved(resolution) => println!("{}", serde_json::to_string_pretty(resolution)?),
        Outcome::PassThrough => anyhow::bail!("no link at {}:{}", args.line, args.col),
        other => report(other)?,
    }
    Ok(())
}

fn report(outcome: &Outcome) -> Result<()> {
    match outcome {
        Outcome::Warning(msg) => warn!("{msg}"),
        Outcome::PassThrough => info!("nothing to do at the cursor"),
        Outcome::NoOp => debug!("no changes"),
        Outcome::Request(request) => {
            eprintln!("{}", serde_json::to_string_pretty(request)?);
        }
        Outcome::Applied(applied) => {
            debug!(edits = applied.edits.len(), events = applied.events.len(), "applied");
        }
        Outcome::Resolved(_) | Outcome::Archived(_) => {}
    }
    Ok(())
}

fn finish(session: &Session, cursor: &CursorArgs) -> Result<()> {
    let text = session.text();
    if cursor.in_place {
        fs::write(&cursor.file, text.as_bytes())
            .with_context(|| format!("writing {:?}", cursor.file))?;
    } else {
        print!("{text}");
    }
    Ok(())
}

/// Append `text`, starting on a fresh line when the file lacks a trailing newline.
fn append_to(path: &Path, text: &str) -> Result<()> {
    let needs_break = match fs::read(path) {
        Ok(existing) => existing.last().is_some_and(|b| *b != b'\n'),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
    };
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {:?}", path))?;
    if needs_break {
        file.write_all(b"\n")
            .with_context(|| format!("writing {:?}", path))?;
    }
    file.write_all(text.as_bytes())
        .with_context(|| format!("writing {:?}", path))
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(?canonical, "scanning directory");
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut HashSet::new())?;
            found.sort();
            for file in found {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn is_org(path: &Path) -> bool {
    path.extension().map(|ext| ext == "org").unwrap_or(false)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_org(&canonical) {
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cursor(file: &Path, line: usize, col: usize) -> CursorArgs {
        CursorArgs {
            file: file.to_path_buf(),
            line,
            col,
            in_place: true,
        }
    }

    #[test]
    fn cursor_positions_are_one_based() {
        let args = cursor(Path::new("x.org"), 3, 5);
        assert_eq!(args.position().unwrap(), Position::new(2, 4));
        assert!(cursor(Path::new("x.org"), 0, 1).position().is_err());
    }

    #[test]
    fn demote_in_place_rewrites_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("notes.org");
        fs::write(&file, "* A\n** B\n").expect("write notes");

        handle_level(
            LevelArgs {
                cursor: cursor(&file, 1, 1),
                count: 1,
                subtree: true,
            },
            EditorConfig::default(),
            false,
        )
        .expect("demote");

        assert_eq!(fs::read_to_string(&file).expect("read back"), "** A\n*** B\n");
    }

    #[test]
    fn todo_with_note_records_closing_note() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("tasks.org");
        fs::write(&file, "* TODO Ship it\n").expect("write tasks");
        let config = EditorConfig::from_json_str(r#"{"log_done": "note"}"#).expect("config");

        handle_todo(
            TodoArgs {
                cursor: cursor(&file, 1, 1),
                prev: false,
                note: Some("shipped".into()),
            },
            config,
        )
        .expect("todo");

        let text = fs::read_to_string(&file).expect("read back");
        assert!(text.starts_with("* DONE Ship it\nCLOSED: ["));
        assert!(text.ends_with("\\\\\n  shipped\n"));
    }

    #[test]
    fn archive_appends_to_output_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("work.org");
        let archive = tmp.path().join("done.org");
        fs::write(&file, "* DONE Old\n* Keep\n").expect("write work");
        fs::write(&archive, "* Earlier\n").expect("write archive");

        handle_archive(
            ArchiveArgs {
                cursor: cursor(&file, 1, 1),
                output: Some(archive.clone()),
            },
            EditorConfig::default(),
        )
        .expect("archive");

        assert_eq!(fs::read_to_string(&file).expect("read work"), "* Keep\n");
        let archived = fs::read_to_string(&archive).expect("read archive");
        assert!(archived.starts_with("* Earlier\n* DONE Old\n:PROPERTIES:\n"));
        assert!(archived.contains(":ARCHIVE_CATEGORY: work\n"));
    }

    #[test]
    fn archive_without_in_place_or_output_writes_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("work.org");
        fs::write(&file, "* DONE Old\n* Keep\n").expect("write work");

        handle_archive(
            ArchiveArgs {
                cursor: CursorArgs {
                    in_place: false,
                    ..cursor(&file, 1, 1)
                },
                output: None,
            },
            EditorConfig::default(),
        )
        .expect("archive");

        assert_eq!(fs::read_to_string(&file).expect("read work"), "* DONE Old\n* Keep\n");
        assert!(!tmp.path().join("work.org_archive").exists());
    }

    #[test]
    fn archive_in_place_uses_configured_location() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("work.org");
        fs::write(&file, "* DONE Old\n* Keep\n").expect("write work");

        handle_archive(
            ArchiveArgs {
                cursor: cursor(&file, 1, 1),
                output: None,
            },
            EditorConfig::default(),
        )
        .expect("archive");

        assert_eq!(fs::read_to_string(&file).expect("read work"), "* Keep\n");
        let archive = fs::read_to_string(tmp.path().join("work.org_archive")).expect("read archive");
        assert!(archive.starts_with("* DONE Old\n:PROPERTIES:\n"));
    }

    #[test]
    fn append_starts_on_a_fresh_line() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let target = tmp.path().join("archive.org");
        fs::write(&target, "* Earlier").expect("write archive");
        append_to(&target, "* Next\n").expect("append");
        assert_eq!(fs::read_to_string(&target).expect("read"), "* Earlier\n* Next\n");

        let fresh = tmp.path().join("new.org");
        append_to(&fresh, "* First\n").expect("append new");
        assert_eq!(fs::read_to_string(&fresh).expect("read new"), "* First\n");
    }

    #[test]
    fn expand_inputs_finds_org_files_in_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("nested");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(tmp.path().join("a.org"), "* A\n").expect("write a");
        fs::write(nested.join("b.org"), "* B\n").expect("write b");
        fs::write(tmp.path().join("c.txt"), "ignored").expect("write c");

        let found = expand_inputs(&[tmp.path().to_path_buf()]).expect("expand");
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.org", "b.org"]);
        assert!(expand_inputs(&[tmp.path().join("c.txt")]).is_err());
    }
}
