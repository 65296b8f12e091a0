use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use env_logger::Builder;
use linepatch::{
    apply_ops, find_all_anchors, find_anchor, patch_file, read_document, rewrite_document,
    rewrite_file, write_document, AnchorPattern, ApplyOptions, Document, Encoding, PatchOp,
    RewriteRule,
};
use log::{info, warn, Level, LevelFilter};
use std::io::Write;
use std::path::{Path, PathBuf};

// --- Main Application Entry Point ---

fn main() {
    // 1. Parse command-line arguments using `clap`.
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    // 2. Call the main logic function. All complex logic and error handling
    //    is inside `run`.
    if let Err(e) = run(cli) {
        // Using {:?} ensures the full error chain from `anyhow` is printed.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Contains the primary logic of the application.
fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Find {
            file,
            pattern,
            regex,
            all,
            from,
            to,
            encoding,
        } => run_find(&file, &pattern, regex, all, from, to, encoding),
        Command::Rewrite {
            file,
            patterns,
            replacements,
            common,
        } => run_rewrite(&file, &patterns, &replacements, &common),
        Command::Insert {
            file,
            locator,
            text,
            common,
        } => {
            let doc = read_document(&file, common.encoding.into())?;
            let index = match resolve_locator(&doc, &locator)? {
                // Splice directly after the anchor line.
                Position::Anchor(idx) => idx + 1,
                // --line N means "after the first N lines"; 0 is the top.
                Position::Line(n) => n,
            };
            let ops = vec![PatchOp::insert_after(index, text)];
            run_edit(&file, &ops, &common)
        }
        Command::Replace {
            file,
            locator,
            count,
            text,
            common,
        } => {
            let doc = read_document(&file, common.encoding.into())?;
            let start = resolve_start(&doc, &locator)?;
            let ops = vec![PatchOp::replace_range(start, count, text)];
            run_edit(&file, &ops, &common)
        }
        Command::Delete {
            file,
            locator,
            count,
            common,
        } => {
            let doc = read_document(&file, common.encoding.into())?;
            let start = resolve_start(&doc, &locator)?;
            let ops = vec![PatchOp::delete_range(start, count)];
            run_edit(&file, &ops, &common)
        }
    }
}

// --- Subcommand Logic ---

fn run_find(
    file: &Path,
    pattern: &str,
    regex: bool,
    all: bool,
    from: Option<usize>,
    to: Option<usize>,
    encoding: EncodingArg,
) -> Result<()> {
    let doc = read_document(file, encoding.into())?;
    let mut anchor = build_pattern(pattern, regex)?;

    // --from/--to are 1-based inclusive; the library scope is [start, end).
    if from.is_some() || to.is_some() {
        let from = from.unwrap_or(1);
        if from == 0 {
            return Err(anyhow!("--from is 1-based; 0 is not a valid line number."));
        }
        let to = to.unwrap_or(doc.len());
        anchor = anchor.scoped(from - 1, to);
    }

    let hits = if all {
        find_all_anchors(&doc, &anchor)?
    } else {
        find_anchor(&doc, &anchor)?.into_iter().collect()
    };

    if hits.is_empty() {
        warn!("No line matches '{}' in '{}'.", pattern, file.display());
        std::process::exit(1);
    }
    for idx in hits {
        // 1-based line numbers, grep-style.
        println!("{}: {}", idx + 1, doc.line(idx).unwrap_or_default());
    }
    Ok(())
}

fn run_rewrite(
    file: &Path,
    patterns: &[String],
    replacements: &[String],
    common: &EditCommon,
) -> Result<()> {
    if patterns.len() != replacements.len() {
        return Err(anyhow!(
            "Got {} pattern(s) but {} replacement(s); each --pattern needs a matching --replacement.",
            patterns.len(),
            replacements.len()
        ));
    }
    let rules = patterns
        .iter()
        .zip(replacements)
        .map(|(p, r)| RewriteRule::new(p, r.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to compile rewrite rules")?;
    info!("Compiled {} rewrite rule(s).", rules.len());

    if common.dry_run {
        let options = ApplyOptions::builder().dry_run(true).build();
        let outcome = rewrite_file(file, common.encoding.into(), &rules, options)?;
        if let Some(diff) = outcome.diff {
            print_diff(file, &diff);
        }
        info!("DRY RUN completed. No files were modified.");
        return Ok(());
    }

    match &common.output {
        Some(output) => {
            let mut doc = read_document(file, common.encoding.into())?;
            let changed = rewrite_document(&mut doc, &rules);
            write_document(&doc, output)?;
            report_changed(changed, output);
        }
        None => {
            let outcome =
                rewrite_file(file, common.encoding.into(), &rules, ApplyOptions::default())?;
            report_changed(outcome.changed, file);
        }
    }
    Ok(())
}

/// Applies a prepared operation batch, honoring dry-run and output redirection.
fn run_edit(file: &Path, ops: &[PatchOp], common: &EditCommon) -> Result<()> {
    if common.dry_run {
        let options = ApplyOptions::builder().dry_run(true).build();
        let outcome = patch_file(file, common.encoding.into(), ops, options)?;
        if let Some(diff) = outcome.diff {
            print_diff(file, &diff);
        }
        info!("DRY RUN completed. No files were modified.");
        return Ok(());
    }

    match &common.output {
        Some(output) => {
            let mut doc = read_document(file, common.encoding.into())?;
            apply_ops(&mut doc, ops)?;
            write_document(&doc, output)?;
            info!("Wrote '{}'.", output.display());
        }
        None => {
            patch_file(file, common.encoding.into(), ops, ApplyOptions::default())?;
        }
    }
    Ok(())
}

// --- Helper Structs and Functions ---

/// Where a locator resolved: an anchor's own line, or a user-supplied
/// 1-based line count.
enum Position {
    Anchor(usize),
    Line(usize),
}

fn build_pattern(pattern: &str, regex: bool) -> Result<AnchorPattern> {
    if regex {
        AnchorPattern::regex(pattern).context("Failed to compile anchor pattern")
    } else {
        Ok(AnchorPattern::literal(pattern))
    }
}

/// Resolves `--line`/`--anchor` to a position in the document.
fn resolve_locator(doc: &Document, locator: &Locator) -> Result<Position> {
    match (&locator.line, &locator.anchor) {
        (Some(_), Some(_)) => Err(anyhow!("--line and --anchor are mutually exclusive.")),
        (Some(n), None) => Ok(Position::Line(*n)),
        (None, Some(anchor)) => {
            let pattern = build_pattern(anchor, locator.regex)?;
            match find_anchor(doc, &pattern)? {
                Some(idx) => Ok(Position::Anchor(idx)),
                // Not-found is a sentinel in the library; for a single-shot
                // CLI edit it means there is nothing to edit.
                None => Err(anyhow!("Anchor '{}' not found in the document.", anchor)),
            }
        }
        (None, None) => Err(anyhow!("Specify a position with --line or --anchor.")),
    }
}

/// Resolves a locator to a 0-based start line for replace/delete.
fn resolve_start(doc: &Document, locator: &Locator) -> Result<usize> {
    match resolve_locator(doc, locator)? {
        Position::Anchor(idx) => Ok(idx),
        Position::Line(n) => {
            if n == 0 {
                return Err(anyhow!("--line is 1-based; 0 is not a valid line number."));
            }
            Ok(n - 1)
        }
    }
}

fn print_diff(file: &Path, diff: &str) {
    println!("----- Proposed Changes for {} -----", file.display());
    print!("{}", diff);
    println!("------------------------------------");
}

fn report_changed(changed: bool, path: &Path) {
    if changed {
        info!("Rewrote '{}'.", path.display());
    } else {
        info!("No rule matched; '{}' is unchanged.", path.display());
    }
}

/// Configures the global logger from the `-v` count.
fn setup_logging(verbose: u8) {
    let log_level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}

// --- Argument Definitions ---

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Anchor-based line editing for text documents.",
    long_about = "Locates positions by marker text instead of hard-coded line numbers, applies \
                  structural edits with automatic index drift correction, and preserves the \
                  document's encoding and line-ending style."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Increase logging verbosity. Can be used multiple times.
    /// -v for info, -vv for debug, -vvv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true, long_help = "Increase logging verbosity.\n-v for info, -vv for debug, -vvv for trace.")]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the line numbers (and lines) matching an anchor pattern.
    Find {
        /// The document to search.
        file: PathBuf,
        /// The anchor: a substring, or a regex with --regex.
        pattern: String,
        /// Interpret the pattern as a regular expression.
        #[arg(short, long)]
        regex: bool,
        /// Print every match instead of only the first.
        #[arg(short, long)]
        all: bool,
        /// First line of the search scope (1-based, inclusive).
        #[arg(long)]
        from: Option<usize>,
        /// Last line of the search scope (1-based, inclusive).
        #[arg(long)]
        to: Option<usize>,
        /// The encoding used to read the document.
        #[arg(long, value_enum, default_value_t = EncodingArg::Utf8)]
        encoding: EncodingArg,
    },
    /// Apply ordered regex substitutions to the whole document text.
    Rewrite {
        /// The document to rewrite.
        file: PathBuf,
        /// A pattern to match; repeat to chain rules in order.
        #[arg(short, long = "pattern", required = true)]
        patterns: Vec<String>,
        /// The replacement for the pattern at the same position ($1 etc. expand).
        #[arg(short = 's', long = "replacement", required = true)]
        replacements: Vec<String>,
        #[command(flatten)]
        common: EditCommon,
    },
    /// Insert a block of lines after an anchor or line number.
    Insert {
        /// The document to edit.
        file: PathBuf,
        #[command(flatten)]
        locator: Locator,
        /// A line of the block to insert; repeat for multi-line blocks.
        #[arg(short, long = "text", required = true)]
        text: Vec<String>,
        #[command(flatten)]
        common: EditCommon,
    },
    /// Replace a run of lines starting at an anchor or line number.
    Replace {
        /// The document to edit.
        file: PathBuf,
        #[command(flatten)]
        locator: Locator,
        /// How many lines to replace.
        #[arg(short, long, default_value_t = 1)]
        count: usize,
        /// A line of the replacement block; repeat for multi-line blocks.
        #[arg(short, long = "text", required = true)]
        text: Vec<String>,
        #[command(flatten)]
        common: EditCommon,
    },
    /// Delete a run of lines starting at an anchor or line number.
    Delete {
        /// The document to edit.
        file: PathBuf,
        #[command(flatten)]
        locator: Locator,
        /// How many lines to delete.
        #[arg(short, long, default_value_t = 1)]
        count: usize,
        #[command(flatten)]
        common: EditCommon,
    },
}

/// Picks the position an edit applies at.
#[derive(clap::Args, Debug)]
struct Locator {
    /// A 1-based line number (for insert: the block goes after this many
    /// lines, so 0 inserts at the top).
    #[arg(long)]
    line: Option<usize>,
    /// Anchor text; the first matching line is used.
    #[arg(long)]
    anchor: Option<String>,
    /// Interpret the anchor as a regular expression.
    #[arg(long, requires = "anchor")]
    regex: bool,
}

/// Flags shared by every editing subcommand.
#[derive(clap::Args, Debug)]
struct EditCommon {
    /// Show what would be done, but don't modify files.
    #[arg(short = 'n', long)]
    dry_run: bool,
    /// Write the result here instead of editing the file in place.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// The encoding used to read and write the document.
    #[arg(long, value_enum, default_value_t = EncodingArg::Utf8)]
    encoding: EncodingArg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EncodingArg {
    Utf8,
    Latin1,
}

impl std::fmt::Display for EncodingArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingArg::Utf8 => write!(f, "utf8"),
            EncodingArg::Latin1 => write!(f, "latin1"),
        }
    }
}

impl From<EncodingArg> for Encoding {
    fn from(value: EncodingArg) -> Self {
        match value {
            EncodingArg::Utf8 => Encoding::Utf8,
            EncodingArg::Latin1 => Encoding::Latin1,
        }
    }
}
