use std::{
    collections::{BTreeSet, HashSet},
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use log::{debug, info};
use outline::agenda::{self, AgendaItem, AgendaRange, AgendaWhenKind};
use outline::core::{HeadingId, ParserConfig, Range, Token};
use outline::dates::DateAndTime;
use outline::index::{DocumentIndex, EditOutcome, OutlineView};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(
    name = "outline",
    about = "Outline markup tooling built on the outline crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Parser configuration (JSON) with planning and finished keywords.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Tokenize files and list every token.
    Tokens(InputArgs),

    /// Print the heading outline of each file.
    Outline(InputArgs),

    /// List scheduled and deadline headings.
    Agenda(AgendaArgs),

    /// Parse a planning fragment such as `SCHEDULED: <2018-12-05 Wed>`.
    Date(DateArgs),

    /// Apply one edit incrementally and check it against a full parse.
    Replay(ReplayArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of plain text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    /// Input Org files to include in the agenda.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Inclusive start date (YYYY-MM-DD); repeating items are expanded.
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct DateArgs {
    /// Planning fragment, timestamp, time range or date range.
    fragment: String,
    /// Emit JSON instead of the normalized planning string.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    /// File whose contents seed the document.
    file: PathBuf,
    /// Byte offset of the edit.
    #[arg(long)]
    at: usize,
    /// Number of bytes removed at the offset.
    #[arg(long, default_value_t = 0)]
    delete: usize,
    /// Text inserted at the offset.
    #[arg(long, default_value = "")]
    insert: String,
    /// Emit JSON instead of a summary.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Tokens(args) => handle_tokens(args, &config),
        Commands::Outline(args) => handle_outline(args, &config),
        Commands::Agenda(args) => handle_agenda(args, &config),
        Commands::Date(args) => handle_date(args),
        Commands::Replay(args) => handle_replay(args, &config),
    }
}

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn load_config(path: Option<&Path>) -> Result<ParserConfig> {
    match path {
        Some(path) => {
            info!("Loading parser config {:?}", path);
            ParserConfig::from_path(path)
        }
        None => Ok(ParserConfig::default()),
    }
}

fn load_documents(inputs: &[PathBuf], config: &ParserConfig) -> Result<Vec<(PathBuf, DocumentIndex)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }
    let mut out = Vec::new();
    for path in expanded {
        debug!("Parsing {:?}", path);
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        out.push((path, DocumentIndex::attach(text, config)));
    }
    Ok(out)
}

fn print_sections(docs: &[(PathBuf, DocumentIndex)], render: impl Fn(&DocumentIndex) -> String) {
    for (idx, (path, index)) in docs.iter().enumerate() {
        if docs.len() > 1 {
            println!("== {} ==", path.display());
        }
        print!("{}", render(index));
        if docs.len() > 1 && idx + 1 < docs.len() {
            println!();
        }
    }
}

/* ------------------------------- tokens ------------------------------- */

fn handle_tokens(args: InputArgs, config: &ParserConfig) -> Result<()> {
    let InputArgs { inputs, json } = args;
    let docs = load_documents(&inputs, config)?;

    if json {
        #[derive(Serialize)]
        struct JsonOutput<'a> {
            path: String,
            tokens: &'a [Token],
        }

        let payload: Vec<JsonOutput<'_>> = docs
            .iter()
            .map(|(path, index)| JsonOutput {
                path: path.display().to_string(),
                tokens: index.tokens(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_sections(&docs, render_tokens);
    }
    Ok(())
}

fn render_tokens(index: &DocumentIndex) -> String {
    let mut out = String::new();
    for token in index.tokens() {
        let range = token.range();
        let _ = writeln!(
            out,
            "{:>6}..{:<6} {:<20} {}",
            range.start,
            range.end(),
            token.kind_name(),
            snippet(range.slice(index.text()))
        );
    }
    out
}

fn snippet(text: &str) -> String {
    let first = text.lines().next().unwrap_or("");
    let mut out: String = first.chars().take(60).collect();
    if out.len() < text.len() {
        out.push('…');
    }
    out
}

/* ------------------------------- outline ------------------------------- */

#[derive(Debug, Serialize)]
struct HeadingView {
    id: HeadingId,
    level: usize,
    title: String,
    planning: Option<String>,
    priority: Option<char>,
    tags: Vec<String>,
    schedule: Option<DateAndTime>,
    due: Option<DateAndTime>,
    paragraph_range: Range,
}

fn heading_views(index: &DocumentIndex) -> Vec<HeadingView> {
    let text = index.text();
    index
        .headings()
        .iter()
        .map(|h| HeadingView {
            id: h.id,
            level: h.level(),
            title: h.title(text).to_string(),
            planning: h.planning(text).map(str::to_string),
            priority: h.priority(text),
            tags: h.tags(text).into_iter().map(str::to_string).collect(),
            schedule: h.schedule(text),
            due: h.due(text),
            paragraph_range: h.paragraph_range,
        })
        .collect()
}

fn handle_outline(args: InputArgs, config: &ParserConfig) -> Result<()> {
    let InputArgs { inputs, json } = args;
    let docs = load_documents(&inputs, config)?;

    if json {
        #[derive(Serialize)]
        struct JsonOutput {
            path: String,
            headings: Vec<HeadingView>,
        }

        let payload: Vec<JsonOutput> = docs
            .iter()
            .map(|(path, index)| JsonOutput {
                path: path.display().to_string(),
                headings: heading_views(index),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_sections(&docs, render_outline);
    }
    Ok(())
}

fn render_outline(index: &DocumentIndex) -> String {
    let mut out = String::new();
    for view in heading_views(index) {
        let mut line = format!("{}* ", "  ".repeat(view.level - 1));
        if let Some(planning) = &view.planning {
            line.push_str(planning);
            line.push(' ');
        }
        if let Some(priority) = view.priority {
            let _ = write!(line, "[#{priority}] ");
        }
        line.push_str(&view.title);
        if !view.tags.is_empty() {
            let _ = write!(line, " :{}:", view.tags.join(":"));
        }
        for date in view.schedule.iter().chain(&view.due) {
            let _ = write!(line, "  {}", date.mark_string());
        }
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

/* ------------------------------- agenda ------------------------------- */

fn handle_agenda(args: AgendaArgs, config: &ParserConfig) -> Result<()> {
    let AgendaArgs {
        inputs,
        from,
        to,
        json,
    } = args;
    let docs = load_documents(&inputs, config)?;
    let items: Vec<AgendaItem> = docs
        .iter()
        .flat_map(|(_, index)| agenda::project(index, config))
        .collect();

    let range = match (from, to) {
        (None, None) => None,
        (from, to) => Some(AgendaRange {
            from: from.unwrap_or(NaiveDate::MIN),
            to: to.unwrap_or(NaiveDate::MAX),
        }),
    };
    let selected: Vec<(chrono::NaiveDateTime, &AgendaItem)> = match &range {
        Some(range) => agenda::within(&items, range),
        None => {
            let mut all: Vec<_> = items.iter().map(|item| (item.date.date, item)).collect();
            all.sort_by_key(|(at, _)| *at);
            all
        }
    };

    if selected.is_empty() {
        eprintln!("No agenda items found for the provided inputs.");
        return Ok(());
    }

    if json {
        #[derive(Serialize)]
        struct JsonItem<'a> {
            occurs: chrono::NaiveDateTime,
            #[serde(flatten)]
            item: &'a AgendaItem,
        }

        let payload: Vec<JsonItem<'_>> = selected
            .iter()
            .map(|(occurs, item)| JsonItem {
                occurs: *occurs,
                item,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (occurs, item) in selected {
            println!("{}", agenda_line(occurs, item));
        }
    }
    Ok(())
}

fn agenda_line(occurs: chrono::NaiveDateTime, item: &AgendaItem) -> String {
    let kind = match item.when_kind {
        AgendaWhenKind::Scheduled => "SCHEDULED",
        AgendaWhenKind::Deadline => "DEADLINE",
    };
    let when = if item.date.include_time {
        occurs.format("%Y-%m-%d %H:%M").to_string()
    } else {
        occurs.format("%Y-%m-%d").to_string()
    };
    let planning = item.planning.as_deref().unwrap_or("");
    let tags = if item.tags.is_empty() {
        String::new()
    } else {
        format!(" :{}:", item.tags.join(":"))
    };
    format!("{when:<16} {kind:<10} {planning:<8} {}{tags}", item.title)
}

/* -------------------------------- date -------------------------------- */

fn handle_date(args: DateArgs) -> Result<()> {
    let DateArgs { fragment, json } = args;
    let Some(date) = DateAndTime::parse(&fragment) else {
        anyhow::bail!("{:?} is not a planning date", fragment);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&date)?);
    } else {
        println!("{}", date.mark_string());
        println!("duration: {}s", date.duration);
        println!("repeat:   {:?}", date.repeat);
    }
    Ok(())
}

/* ------------------------------- replay ------------------------------- */

fn replay(
    text: String,
    config: &ParserConfig,
    at: usize,
    delete: usize,
    insert: &str,
) -> Result<(DocumentIndex, EditOutcome)> {
    let mut index = DocumentIndex::attach(text, config);
    let outcome = index
        .replace(Range::new(at, delete), insert)
        .with_context(|| format!("applying edit at {at} (delete {delete})"))?;
    let full = DocumentIndex::attach(index.text(), config);
    if index.tokens() != full.tokens() {
        anyhow::bail!(
            "incremental tokens diverge from a full parse after re-parsing {:?}",
            outcome.reparse_range
        );
    }
    Ok((index, outcome))
}

fn handle_replay(args: ReplayArgs, config: &ParserConfig) -> Result<()> {
    let ReplayArgs {
        file,
        at,
        delete,
        insert,
        json,
    } = args;
    let text = fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
    let (index, outcome) = replay(text, config, at, delete, &insert)?;

    if json {
        #[derive(Serialize)]
        struct JsonOutput {
            outcome: EditOutcome,
            tokens: usize,
            headings: usize,
        }

        let payload = JsonOutput {
            outcome,
            tokens: index.tokens().len(),
            headings: index.headings().len(),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        let range = outcome.reparse_range;
        println!(
            "re-parsed {}..{}: {} tokens removed, {} inserted; {} tokens, {} headings, matches full parse",
            range.start,
            range.end(),
            outcome.removed,
            outcome.inserted,
            index.tokens().len(),
            index.headings().len()
        );
    }
    Ok(())
}

/* -------------------------------- inputs -------------------------------- */

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!("Scanning directory {:?}", canonical);
            for file in collect_org_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org_file(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn is_org_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "org")
}

fn collect_org_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
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
    } else if metadata.is_file() && is_org_file(&canonical) {
        debug!("Found org file {:?}", canonical);
        out.push(canonical);
    }
    Ok(())
}
