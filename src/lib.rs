//! A line-oriented, anchor-based document transformation engine.
//!
//! `linepatch` edits text documents the way a careful human does: it loads the
//! document as an ordered sequence of lines, finds the places that matter by
//! searching for *anchors* (literal markers or regex patterns) instead of
//! trusting hard-coded line numbers, and then applies structural edits whose
//! indices are automatically corrected for the lines that earlier edits in the
//! same batch inserted or removed.
//!
//! This makes a batch of edits authored against the *original* document remain
//! valid no matter how much the edits themselves shift the line numbering — a
//! common source of off-by-N bugs in ad-hoc migration scripts.
//!
//! ## Getting Started
//!
//! The most common use case is to read a document, locate an anchor, and apply
//! a batch of structural edits:
//!
//! ```rust
//! use linepatch::{apply_ops, find_anchor, AnchorPattern, Document, PatchOp};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut doc = Document::from_text("<html>\n<head>\n</head>\n<body>\n</body>\n");
//!
//! // Find where to splice by marker, not by guessed line number.
//! let head_end = find_anchor(&doc, &AnchorPattern::literal("</head>"))?
//!     .expect("document has a head");
//!
//! // Both operations are authored against the original numbering. The
//! // sequencer translates the second index past the lines the first inserted.
//! let ops = vec![
//!     PatchOp::insert_after(head_end, ["  <script src=\"app.js\"></script>"]),
//!     PatchOp::insert_after(4, ["  <main></main>"]),
//! ];
//! let report = apply_ops(&mut doc, &ops)?;
//!
//! assert_eq!(report.net_drift(), 2);
//! assert_eq!(
//!     doc.lines(),
//!     [
//!         "<html>",
//!         "<head>",
//!         "  <script src=\"app.js\"></script>",
//!         "</head>",
//!         "<body>",
//!         "  <main></main>",
//!         "</body>",
//!     ]
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### The Transformation Workflow
//!
//! A transformation run owns exactly one [`Document`] and goes through three
//! stages:
//!
//! 1. **Read:** [`Document::from_bytes`] (or [`read_document`] for files)
//!    decodes the source, records its encoding, line-ending convention, and
//!    whether it ended with a newline, and splits it into lines.
//! 2. **Transform:** either locate anchors with [`find_anchor`] /
//!    [`find_all_anchors`] and apply an ordered [`PatchOp`] batch with
//!    [`apply_ops`], or run the whole text through an ordered list of
//!    [`RewriteRule`]s with [`rewrite_text`] / [`rewrite_document`].
//! 3. **Write:** [`Document::to_bytes`] (or [`write_document`]) re-serializes
//!    the lines with the recorded encoding and line-ending style, bit-for-bit
//!    identical to the source when nothing was changed.
//!
//! ### Drift Tracking
//!
//! The central correctness property lives in [`apply_ops`]: operation indices
//! are authored in original, pre-patch coordinates, and the sequencer keeps a
//! running *drift* (the net line-count change of the operations applied so
//! far) which it adds to each authored index before applying it. A batch
//! either applies completely or not at all — a failed bounds check leaves the
//! document untouched.
//!
//! ### Guarded Rewrites
//!
//! [`RewriteRule`]s generalize the "replace, but only when the captured value
//! is the sentinel" pattern found in migration scripts. Each rule carries an
//! optional guard over the regex captures; matches whose guard rejects are
//! preserved verbatim. Because guards test for the *pre-rewrite* marker, a
//! full rule list can be re-applied to already-transformed text as a no-op,
//! which makes reprocessing safe.
//!
//! ```rust
//! use linepatch::{rewrite_text, RewriteRule};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rules = vec![RewriteRule::new(r"(\d+) widgets", "{N} widgets")?
//!     .with_guard(|caps| &caps[1] == "8")];
//!
//! assert_eq!(rewrite_text("Ship 8 widgets, 9 widgets", &rules), "Ship {N} widgets, 9 widgets");
//! // Idempotent: the guard no longer matches anything on a second pass.
//! let once = rewrite_text("Ship 8 widgets now, 8 widgets later", &rules);
//! assert_eq!(rewrite_text(&once, &rules), once);
//! # Ok(())
//! # }
//! ```

use log::{debug, info, trace, warn};
use regex::{Captures, Regex};
use similar::udiff::unified_diff;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// --- Error Types ---

/// A regex pattern failed to compile.
///
/// Raised eagerly when an [`AnchorPattern`] or [`RewriteRule`] is constructed,
/// never during a search or an apply.
#[derive(Error, Debug)]
#[error("invalid pattern '{pattern}': {source}")]
pub struct PatternError {
    /// The pattern text that failed to compile.
    pub pattern: String,
    #[source]
    source: regex::Error,
}

/// An index or range fell outside the document bounds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// A caller-supplied anchor scope does not satisfy
    /// `0 <= start <= end <= len`.
    #[error("scope {start}..{end} is invalid for a document of {len} lines")]
    InvalidScope {
        start: usize,
        end: usize,
        len: usize,
    },
    /// An operation's effective position, after drift correction, falls
    /// outside the current document. The batch it belonged to was not applied.
    #[error(
        "operation {op_index} spans {span} line(s) at effective index {effective_start}, outside a document of {len} lines"
    )]
    OutOfBounds {
        /// 0-based index of the offending operation within its batch.
        op_index: usize,
        /// The drift-corrected start position the operation resolved to.
        effective_start: i64,
        /// The number of lines the operation covers.
        span: usize,
        /// The document length at the time the operation was attempted.
        len: usize,
    },
}

/// The document bytes could not be decoded, or the transformed text could not
/// be re-encoded, under the recorded encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The source bytes are not valid in the recorded encoding.
    #[error("invalid {encoding} sequence at byte {position}")]
    Decode {
        encoding: Encoding,
        /// Byte offset of the first invalid sequence.
        position: usize,
    },
    /// A character of the transformed text has no representation in the
    /// recorded encoding.
    #[error("character '{ch}' at position {position} is not representable in {encoding}")]
    Encode {
        encoding: Encoding,
        /// Character offset within the serialized text.
        position: usize,
        ch: char,
    },
}

/// Errors surfaced by the file-level pipeline ([`read_document`],
/// [`write_document`], [`patch_file`], [`rewrite_file`]).
///
/// All of these are fatal to the current run: no partial write occurs.
#[derive(Error, Debug)]
pub enum TransformError {
    /// The source document for a transformation could not be found.
    #[error("target file not found: {0}")]
    TargetNotFound(PathBuf),
    /// The user does not have permission to read or write the path.
    #[error("permission denied for path: {path:?}")]
    PermissionDenied { path: PathBuf },
    /// The target path exists but is a directory, not a file.
    #[error("target path is a directory, not a file: {path:?}")]
    TargetIsDirectory { path: PathBuf },
    /// An I/O error occurred while reading or writing the document.
    #[error("I/O error while processing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The document could not be decoded or re-encoded.
    #[error("encoding error in {path:?}: {source}")]
    Encoding {
        path: PathBuf,
        #[source]
        source: EncodingError,
    },
    /// An operation in the batch fell outside the document bounds.
    #[error(transparent)]
    Range(#[from] RangeError),
}

/// Converts a `std::io::Error` into a more specific `TransformError`.
fn map_io_error(path: PathBuf, e: std::io::Error) -> TransformError {
    match e.kind() {
        std::io::ErrorKind::NotFound => TransformError::TargetNotFound(path),
        std::io::ErrorKind::PermissionDenied => TransformError::PermissionDenied { path },
        std::io::ErrorKind::IsADirectory => TransformError::TargetIsDirectory { path },
        _ => TransformError::Io { path, source: e },
    }
}

// --- Data Structures ---

/// The line-ending convention of a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    /// Unix-style `\n`.
    Lf,
    /// Windows-style `\r\n`.
    Crlf,
}

impl LineEnding {
    /// The terminator string this convention attaches to each line.
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::Crlf => "\r\n",
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineEnding::Lf => write!(f, "LF"),
            LineEnding::Crlf => write!(f, "CRLF"),
        }
    }
}

/// The byte encoding of a [`Document`].
///
/// UTF-8 covers every document the engine was built for; Latin-1 is carried
/// for sources that predate it. Decoding Latin-1 cannot fail; encoding to it
/// fails for any character above U+00FF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Latin1,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Utf8 => write!(f, "UTF-8"),
            Encoding::Latin1 => write!(f, "Latin-1"),
        }
    }
}

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// An ordered, mutable sequence of text lines with a recorded encoding and
/// line-ending convention.
///
/// Lines never contain line-ending characters; terminators are stripped on
/// read and reattached on write. Whether the source ended with a terminator is
/// captured at read time so that [`Document::to_bytes`] can reproduce the
/// source bit-for-bit when nothing was changed.
///
/// The line sequence itself is private: a `Document` is mutated only through
/// [`apply_ops`] and [`rewrite_document`], which is what makes the
/// all-or-nothing batch guarantee enforceable.
///
/// # Example
///
/// ```
/// # use linepatch::{Document, Encoding, LineEnding};
/// let doc = Document::from_bytes(b"alpha\r\nbeta\r\n", Encoding::Utf8).unwrap();
/// assert_eq!(doc.lines(), ["alpha", "beta"]);
/// assert_eq!(doc.line_ending(), LineEnding::Crlf);
/// assert!(doc.has_trailing_newline());
/// assert_eq!(doc.to_bytes().unwrap(), b"alpha\r\nbeta\r\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    lines: Vec<String>,
    encoding: Encoding,
    line_ending: LineEnding,
    trailing_newline: bool,
    bom: bool,
}

impl Document {
    /// Decodes `bytes` under `encoding` and splits the result into lines.
    ///
    /// The line-ending convention is taken from the first terminator seen
    /// (defaulting to LF for single-line documents), a UTF-8 BOM is recorded
    /// and stripped, and the presence of a trailing terminator is captured.
    ///
    /// Sources that mix terminator styles are normalized to the detected
    /// convention on write; consistently-terminated sources round-trip
    /// bit-for-bit.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::Decode`] with the offending byte position if
    /// the bytes are not valid in `encoding`.
    pub fn from_bytes(bytes: &[u8], encoding: Encoding) -> Result<Self, EncodingError> {
        let (payload, bom) = match encoding {
            Encoding::Utf8 => match bytes.strip_prefix(UTF8_BOM) {
                Some(rest) => (rest, true),
                None => (bytes, false),
            },
            Encoding::Latin1 => (bytes, false),
        };
        let text = decode(payload, encoding).map_err(|position| EncodingError::Decode {
            encoding,
            position: position + if bom { UTF8_BOM.len() } else { 0 },
        })?;

        let line_ending = detect_line_ending(&text);
        let (lines, trailing_newline) = split_document_text(&text);
        trace!(
            "Decoded {} bytes into {} {} lines (trailing newline: {}, BOM: {})",
            bytes.len(),
            lines.len(),
            line_ending,
            trailing_newline,
            bom
        );
        Ok(Self {
            lines,
            encoding,
            line_ending,
            trailing_newline,
            bom,
        })
    }

    /// Builds a UTF-8 document from in-memory text, detecting the line-ending
    /// convention and trailing-terminator flag from the text itself.
    pub fn from_text(text: &str) -> Self {
        let line_ending = detect_line_ending(text);
        let (lines, trailing_newline) = split_document_text(text);
        Self {
            lines,
            encoding: Encoding::Utf8,
            line_ending,
            trailing_newline,
            bom: false,
        }
    }

    /// Builds a UTF-8, LF-terminated document directly from lines.
    ///
    /// The lines must not contain line-ending characters.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            encoding: Encoding::Utf8,
            line_ending: LineEnding::Lf,
            trailing_newline: true,
            bom: false,
        }
    }

    /// The document's lines, without terminators.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// A single line by 0-based index.
    pub fn line(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    /// The number of lines in the document.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the document has no lines at all.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The recorded byte encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// The recorded line-ending convention.
    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    /// Whether the source ended with a line terminator.
    pub fn has_trailing_newline(&self) -> bool {
        self.trailing_newline
    }

    /// The document's logical text: lines joined with `\n`, without a
    /// trailing terminator.
    ///
    /// This is the form the [`RewriteRule`] engine operates on; the recorded
    /// line-ending convention only matters at the byte boundary.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Serializes the document back to bytes.
    ///
    /// Lines are joined with the recorded line ending, a trailing terminator
    /// is appended only if the source had one, the BOM is re-emitted if one
    /// was read, and the result is encoded under the recorded encoding.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::Encode`] naming the offending character
    /// position if the text cannot be represented in the recorded encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let sep = self.line_ending.as_str();
        let mut text = self.lines.join(sep);
        if self.trailing_newline && !self.lines.is_empty() {
            text.push_str(sep);
        }
        let mut out = if self.bom {
            UTF8_BOM.to_vec()
        } else {
            Vec::new()
        };
        encode(&text, self.encoding, &mut out)?;
        Ok(out)
    }

    /// The text as it would appear on disk, minus encoding. Used for diff
    /// previews, where LF-joined output keeps the diff readable.
    fn display_text(&self) -> String {
        let mut text = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            text.push('\n');
        }
        text
    }

    /// Replaces the line sequence wholesale. Only the sequencer and the
    /// rewrite engine go through here, after their own validation.
    fn set_lines(&mut self, lines: Vec<String>) {
        self.lines = lines;
    }
}

/// Splits logical text into terminator-free lines plus a trailing-newline flag.
fn split_document_text(text: &str) -> (Vec<String>, bool) {
    if text.is_empty() {
        return (Vec::new(), false);
    }
    let trailing = text.ends_with('\n');
    let body = if trailing {
        &text[..text.len() - 1]
    } else {
        text
    };
    let lines = body
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
        .collect();
    (lines, trailing)
}

/// Picks the line-ending convention from the first terminator in `text`.
fn detect_line_ending(text: &str) -> LineEnding {
    match text.find('\n') {
        Some(idx) if idx > 0 && text.as_bytes()[idx - 1] == b'\r' => LineEnding::Crlf,
        _ => LineEnding::Lf,
    }
}

/// Decodes raw bytes to text, returning the offending byte offset on failure.
fn decode(bytes: &[u8], encoding: Encoding) -> Result<String, usize> {
    match encoding {
        Encoding::Utf8 => std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| e.valid_up_to()),
        // Latin-1 maps every byte directly onto U+0000..=U+00FF.
        Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
    }
}

/// Encodes text into `out`, returning the offending character on failure.
fn encode(text: &str, encoding: Encoding, out: &mut Vec<u8>) -> Result<(), EncodingError> {
    match encoding {
        Encoding::Utf8 => {
            out.extend_from_slice(text.as_bytes());
            Ok(())
        }
        Encoding::Latin1 => {
            for (position, ch) in text.chars().enumerate() {
                if (ch as u32) <= 0xFF {
                    out.push(ch as u8);
                } else {
                    return Err(EncodingError::Encode {
                        encoding,
                        position,
                        ch,
                    });
                }
            }
            Ok(())
        }
    }
}

// --- Anchor Locator ---

/// How an [`AnchorPattern`] matches a line.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// A substring test.
    Literal(String),
    /// An unanchored regex match test. Anchor the pattern itself (`^`, `$`)
    /// to pin it to line boundaries.
    Pattern(Regex),
}

impl Matcher {
    fn matches(&self, line: &str) -> bool {
        match self {
            Matcher::Literal(needle) => line.contains(needle.as_str()),
            Matcher::Pattern(re) => re.is_match(line),
        }
    }
}

/// A marker used to locate a position in a document's line sequence.
///
/// Supplied by the caller per search; immutable once built. An optional
/// `[start, end)` scope restricts the search to a sub-range of the document.
///
/// # Example
///
/// ```
/// # use linepatch::{find_anchor, find_all_anchors, AnchorPattern, Document};
/// let doc = Document::from_lines(["a", "MARKER", "b", "MARKER"]);
///
/// let pattern = AnchorPattern::literal("MARKER");
/// assert_eq!(find_anchor(&doc, &pattern).unwrap(), Some(1));
/// assert_eq!(find_all_anchors(&doc, &pattern).unwrap(), vec![1, 3]);
/// assert_eq!(find_anchor(&doc, &AnchorPattern::literal("NOPE")).unwrap(), None);
/// ```
#[derive(Debug, Clone)]
pub struct AnchorPattern {
    matcher: Matcher,
    scope: Option<(usize, usize)>,
}

impl AnchorPattern {
    /// A pattern matching any line that contains `needle`.
    pub fn literal(needle: impl Into<String>) -> Self {
        Self {
            matcher: Matcher::Literal(needle.into()),
            scope: None,
        }
    }

    /// A pattern matching any line the compiled regex matches.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if the pattern does not compile. The failure
    /// happens here, at construction, never during a search.
    pub fn regex(pattern: &str) -> Result<Self, PatternError> {
        let re = Regex::new(pattern).map_err(|source| PatternError {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            matcher: Matcher::Pattern(re),
            scope: None,
        })
    }

    /// Restricts the search to the line range `[start, end)`.
    ///
    /// The range is validated against the document at search time; an invalid
    /// range is a [`RangeError::InvalidScope`].
    pub fn scoped(mut self, start: usize, end: usize) -> Self {
        self.scope = Some((start, end));
        self
    }
}

/// Resolves and validates a pattern's scope against the document length.
fn resolve_scope(scope: Option<(usize, usize)>, len: usize) -> Result<(usize, usize), RangeError> {
    match scope {
        None => Ok((0, len)),
        Some((start, end)) if start <= end && end <= len => Ok((start, end)),
        Some((start, end)) => Err(RangeError::InvalidScope { start, end, len }),
    }
}

/// Finds the first line matching `pattern`, scanning in index order.
///
/// Returns `Ok(None)` when nothing matches — "not found" is a valid,
/// non-exceptional result the caller must branch on, distinct from every
/// failure.
///
/// # Errors
///
/// Returns [`RangeError::InvalidScope`] if the pattern carries a scope that
/// does not fit the document.
pub fn find_anchor(doc: &Document, pattern: &AnchorPattern) -> Result<Option<usize>, RangeError> {
    let (start, end) = resolve_scope(pattern.scope, doc.len())?;
    let hit = doc.lines[start..end]
        .iter()
        .position(|line| pattern.matcher.matches(line))
        .map(|offset| start + offset);
    trace!("find_anchor over lines {}..{}: {:?}", start, end, hit);
    Ok(hit)
}

/// Finds every line matching `pattern`, in index order.
///
/// An empty vector is the "not found" sentinel, not an error.
///
/// # Errors
///
/// Returns [`RangeError::InvalidScope`] if the pattern carries a scope that
/// does not fit the document.
pub fn find_all_anchors(doc: &Document, pattern: &AnchorPattern) -> Result<Vec<usize>, RangeError> {
    let (start, end) = resolve_scope(pattern.scope, doc.len())?;
    let hits: Vec<usize> = doc.lines[start..end]
        .iter()
        .enumerate()
        .filter(|(_, line)| pattern.matcher.matches(line))
        .map(|(offset, _)| start + offset)
        .collect();
    trace!("find_all_anchors over lines {}..{}: {:?}", start, end, hits);
    Ok(hits)
}

// --- Rewrite Rule Engine ---

enum Replacement {
    /// A template expanded with `$n` / `${name}` capture references.
    Template(String),
    /// A replacement computed from the captures.
    Compute(Box<dyn Fn(&Captures) -> String + Send + Sync>),
}

type Guard = Box<dyn Fn(&Captures) -> bool + Send + Sync>;

/// A conditional pattern substitution over the whole document text.
///
/// Each rule scans for all non-overlapping matches of its pattern. For every
/// match the guard (if any) is evaluated over the captures: if it rejects, the
/// original text of that span is preserved verbatim; if it accepts, the span
/// is replaced by the rule's template (with `$n` capture expansion) or by the
/// computed string.
///
/// Guards are what make a rule list idempotent: a guard that tests for the
/// pre-rewrite marker value stops matching once the marker has been replaced,
/// so re-running the full list over already-transformed text changes nothing.
///
/// # Example
///
/// ```
/// # use linepatch::RewriteRule;
/// // Rewrite "N widgets" only when N is the sentinel value 8.
/// let rule = RewriteRule::new(r"(\d+) widgets", "{N} widgets")
///     .unwrap()
///     .with_guard(|caps| &caps[1] == "8");
/// assert_eq!(
///     rule.apply("Ship 8 widgets now, 8 widgets later"),
///     "Ship {N} widgets now, {N} widgets later"
/// );
/// assert_eq!(rule.apply("Ship 8 widgets, 9 widgets"), "Ship {N} widgets, 9 widgets");
/// ```
pub struct RewriteRule {
    pattern: Regex,
    guard: Option<Guard>,
    replacement: Replacement,
}

impl fmt::Debug for RewriteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let replacement: &dyn fmt::Debug = match &self.replacement {
            Replacement::Template(t) => t,
            Replacement::Compute(_) => &"<computed>",
        };
        f.debug_struct("RewriteRule")
            .field("pattern", &self.pattern.as_str())
            .field("guarded", &self.guard.is_some())
            .field("replacement", replacement)
            .finish()
    }
}

impl RewriteRule {
    /// A rule replacing each accepted match with `template`.
    ///
    /// The template may reference captures with `$1`, `${name}`, etc., per the
    /// `regex` crate's expansion syntax; everything else is literal.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if the pattern does not compile. Malformed
    /// patterns fail here, at construction, never at apply time.
    pub fn new(pattern: &str, template: impl Into<String>) -> Result<Self, PatternError> {
        let re = Regex::new(pattern).map_err(|source| PatternError {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: re,
            guard: None,
            replacement: Replacement::Template(template.into()),
        })
    }

    /// A rule whose replacement is computed from the captures of each match.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if the pattern does not compile.
    pub fn computed<F>(pattern: &str, compute: F) -> Result<Self, PatternError>
    where
        F: Fn(&Captures) -> String + Send + Sync + 'static,
    {
        let re = Regex::new(pattern).map_err(|source| PatternError {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: re,
            guard: None,
            replacement: Replacement::Compute(Box::new(compute)),
        })
    }

    /// Attaches a guard predicate. A match is rewritten only when the guard
    /// accepts its captures.
    pub fn with_guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&Captures) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Box::new(guard));
        self
    }

    /// The source text of the rule's pattern.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Applies this single rule to `text`, returning the rewritten text.
    pub fn apply(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, |caps: &Captures| {
                if let Some(guard) = &self.guard {
                    if !guard(caps) {
                        // Rejected by the guard: keep the span verbatim.
                        return caps[0].to_string();
                    }
                }
                match &self.replacement {
                    Replacement::Template(template) => {
                        let mut expanded = String::new();
                        caps.expand(template, &mut expanded);
                        expanded
                    }
                    Replacement::Compute(compute) => compute(caps),
                }
            })
            .into_owned()
    }
}

/// Applies an ordered list of rewrite rules to `text`.
///
/// Rules execute strictly in list order; rule *k+1* sees the output of rule
/// *k* applied to the whole text. Order rules from most-specific to
/// least-specific when patterns could otherwise re-match already-rewritten
/// text.
pub fn rewrite_text(text: &str, rules: &[RewriteRule]) -> String {
    let mut current = text.to_string();
    for (i, rule) in rules.iter().enumerate() {
        let next = rule.apply(&current);
        if next != current {
            debug!("Rule {} ('{}') changed the text.", i + 1, rule.pattern());
        } else {
            trace!("Rule {} ('{}') matched nothing.", i + 1, rule.pattern());
        }
        current = next;
    }
    current
}

/// Runs the rewrite engine over a document's logical text and replaces its
/// lines with the result.
///
/// The document's encoding, line-ending convention, and trailing-newline flag
/// are untouched. Any line-ending characters a replacement introduces are
/// normalized away to preserve the invariant that lines carry no terminators.
///
/// Returns `true` if the document changed.
pub fn rewrite_document(doc: &mut Document, rules: &[RewriteRule]) -> bool {
    let before = doc.text();
    let after = rewrite_text(&before, rules);
    if after == before {
        return false;
    }
    let (lines, _) = split_document_text(&after);
    doc.set_lines(lines);
    true
}

// --- Patch Operation Sequencer ---

/// A structural edit against a [`Document`], authored in original, pre-patch
/// line coordinates.
///
/// [`apply_ops`] translates authored coordinates to current ones at apply
/// time; callers never renumber operations by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    /// Inserts `block` after the first `index` existing lines
    /// (`index == 0` inserts at the top of the document).
    InsertAfter { index: usize, block: Vec<String> },
    /// Replaces `count` lines starting at `start` with `block`.
    ReplaceRange {
        start: usize,
        count: usize,
        block: Vec<String>,
    },
    /// Deletes `count` lines starting at `start`.
    DeleteRange { start: usize, count: usize },
}

impl PatchOp {
    /// Convenience constructor for [`PatchOp::InsertAfter`].
    pub fn insert_after<I, S>(index: usize, block: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PatchOp::InsertAfter {
            index,
            block: block.into_iter().map(Into::into).collect(),
        }
    }

    /// Convenience constructor for [`PatchOp::ReplaceRange`].
    pub fn replace_range<I, S>(start: usize, count: usize, block: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PatchOp::ReplaceRange {
            start,
            count,
            block: block.into_iter().map(Into::into).collect(),
        }
    }

    /// Convenience constructor for [`PatchOp::DeleteRange`].
    pub fn delete_range(start: usize, count: usize) -> Self {
        PatchOp::DeleteRange { start, count }
    }

    /// The net line-count change this operation contributes to the drift.
    fn delta(&self) -> i64 {
        match self {
            PatchOp::InsertAfter { block, .. } => block.len() as i64,
            PatchOp::ReplaceRange { count, block, .. } => block.len() as i64 - *count as i64,
            PatchOp::DeleteRange { count, .. } => -(*count as i64),
        }
    }
}

/// How a single operation in a batch was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpApplied {
    /// 0-based index of the operation within its batch.
    pub op_index: usize,
    /// The drift-corrected position the operation actually spliced at.
    pub effective_start: usize,
    /// Lines removed by the operation.
    pub lines_removed: usize,
    /// Lines inserted by the operation.
    pub lines_added: usize,
}

/// Per-operation results of a successfully applied batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// One entry per operation, in application order.
    pub applied: Vec<OpApplied>,
}

impl ApplyReport {
    /// The cumulative net line-count change of the whole batch.
    pub fn net_drift(&self) -> i64 {
        self.applied
            .iter()
            .map(|op| op.lines_added as i64 - op.lines_removed as i64)
            .sum()
    }
}

/// Applies an ordered batch of operations to a document, translating each
/// authored index past the line-count changes of the operations before it.
///
/// The batch is all-or-nothing: operations run against a working copy, and the
/// document's line sequence is replaced only when every operation applied. A
/// bounds violation aborts the batch with [`RangeError::OutOfBounds`] naming
/// the offending operation, leaving the document byte-identical to before the
/// call.
///
/// Given the same document and operation list, the result is always
/// byte-identical.
///
/// # Example
///
/// The worked drift example: both operations are authored against the
/// original four-line document, and the second one's index is translated past
/// the net line the first one added.
///
/// ```
/// # use linepatch::{apply_ops, Document, PatchOp};
/// let mut doc = Document::from_lines(["A", "B", "C", "D"]);
/// let ops = vec![
///     PatchOp::replace_range(1, 1, ["X", "Y"]),
///     PatchOp::insert_after(3, ["Z"]),
/// ];
/// apply_ops(&mut doc, &ops).unwrap();
/// assert_eq!(doc.lines(), ["A", "X", "Y", "C", "Z", "D"]);
/// ```
pub fn apply_ops(doc: &mut Document, ops: &[PatchOp]) -> Result<ApplyReport, RangeError> {
    let mut working = doc.lines.clone();
    let mut drift: i64 = 0;
    let mut report = ApplyReport::default();

    for (op_index, op) in ops.iter().enumerate() {
        let len = working.len();
        let (authored_start, removed, block): (usize, usize, &[String]) = match op {
            PatchOp::InsertAfter { index, block } => (*index, 0, block),
            PatchOp::ReplaceRange {
                start,
                count,
                block,
            } => (*start, *count, block),
            PatchOp::DeleteRange { start, count } => (*start, *count, &[]),
        };

        let effective_start = authored_start as i64 + drift;
        let effective_end = effective_start + removed as i64;
        if effective_start < 0 || effective_end > len as i64 {
            warn!(
                "Operation {} out of bounds: effective lines {}..{} against {} lines.",
                op_index, effective_start, effective_end, len
            );
            return Err(RangeError::OutOfBounds {
                op_index,
                effective_start,
                span: removed,
                len,
            });
        }

        let start = effective_start as usize;
        trace!(
            "Operation {}: authored start {} + drift {} -> splice {}..{} ({} in, {} out)",
            op_index,
            authored_start,
            drift,
            start,
            start + removed,
            block.len(),
            removed
        );
        working.splice(start..start + removed, block.iter().cloned());

        drift += op.delta();
        report.applied.push(OpApplied {
            op_index,
            effective_start: start,
            lines_removed: removed,
            lines_added: block.len(),
        });
    }

    debug!("Applied {} operation(s), net drift {}.", ops.len(), drift);
    doc.set_lines(working);
    Ok(report)
}

// --- File Pipeline ---

/// Options for configuring the file-level pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// If `true`, no file is modified; a unified diff of the proposed changes
    /// is returned instead.
    pub dry_run: bool,
    /// The number of context lines around each change in dry-run diffs.
    pub diff_context: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            diff_context: 3,
        }
    }
}

impl ApplyOptions {
    /// Creates a new builder for `ApplyOptions`.
    ///
    /// # Example
    ///
    /// ```
    /// # use linepatch::ApplyOptions;
    /// let options = ApplyOptions::builder().dry_run(true).diff_context(5).build();
    /// assert!(options.dry_run);
    /// assert_eq!(options.diff_context, 5);
    /// ```
    pub fn builder() -> ApplyOptionsBuilder {
        ApplyOptionsBuilder::default()
    }
}

/// A builder for creating `ApplyOptions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptionsBuilder {
    dry_run: Option<bool>,
    diff_context: Option<usize>,
}

impl ApplyOptionsBuilder {
    /// If `true`, no file is modified; a diff of the proposed changes is
    /// returned instead.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    /// Sets the number of context lines in dry-run diffs.
    pub fn diff_context(mut self, diff_context: usize) -> Self {
        self.diff_context = Some(diff_context);
        self
    }

    /// Builds the `ApplyOptions`.
    pub fn build(self) -> ApplyOptions {
        let default = ApplyOptions::default();
        ApplyOptions {
            dry_run: self.dry_run.unwrap_or(default.dry_run),
            diff_context: self.diff_context.unwrap_or(default.diff_context),
        }
    }
}

/// The result of a [`patch_file`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Per-operation details of the applied batch.
    pub report: ApplyReport,
    /// The unified diff of the proposed changes. Only populated when
    /// `dry_run` was set in [`ApplyOptions`].
    pub diff: Option<String>,
}

/// The result of a [`rewrite_file`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// Whether any rule changed the document.
    pub changed: bool,
    /// The unified diff of the proposed changes. Only populated when
    /// `dry_run` was set in [`ApplyOptions`].
    pub diff: Option<String>,
}

/// Reads a document from disk under the given encoding.
///
/// The file handle is opened, fully consumed, and released before this
/// function returns; nothing is held across the transformation stages.
pub fn read_document(path: &Path, encoding: Encoding) -> Result<Document, TransformError> {
    trace!("Reading '{}' as {}", path.display(), encoding);
    if path.is_dir() {
        return Err(TransformError::TargetIsDirectory {
            path: path.to_path_buf(),
        });
    }
    let bytes = fs::read(path).map_err(|e| map_io_error(path.to_path_buf(), e))?;
    Document::from_bytes(&bytes, encoding).map_err(|source| TransformError::Encoding {
        path: path.to_path_buf(),
        source,
    })
}

/// Serializes a document and writes it to disk wholesale.
pub fn write_document(doc: &Document, path: &Path) -> Result<(), TransformError> {
    let bytes = doc.to_bytes().map_err(|source| TransformError::Encoding {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, bytes).map_err(|e| map_io_error(path.to_path_buf(), e))?;
    trace!("Wrote '{}'", path.display());
    Ok(())
}

/// Reads a file, applies an operation batch, and writes the result back.
///
/// A convenience wrapper around [`read_document`], [`apply_ops`], and
/// [`write_document`] for callers that patch files in place. In dry-run mode
/// the file is left untouched and a unified diff of the proposed changes is
/// returned in the outcome.
///
/// # Errors
///
/// Any [`TransformError`] is fatal to the run; in particular a [`RangeError`]
/// from the sequencer aborts before anything is written.
pub fn patch_file(
    path: &Path,
    encoding: Encoding,
    ops: &[PatchOp],
    options: ApplyOptions,
) -> Result<PatchOutcome, TransformError> {
    info!("Patching '{}'", path.display());
    let mut doc = read_document(path, encoding)?;
    let before = doc.display_text();

    let report = apply_ops(&mut doc, ops)?;

    let diff = if options.dry_run {
        info!("  DRY RUN: leaving '{}' untouched.", path.display());
        Some(preview_diff(&before, &doc.display_text(), options.diff_context))
    } else {
        write_document(&doc, path)?;
        info!(
            "  Applied {} operation(s) to '{}'.",
            report.applied.len(),
            path.display()
        );
        None
    };

    Ok(PatchOutcome { report, diff })
}

/// Reads a file, runs the rewrite engine over it, and writes the result back.
///
/// The counterpart of [`patch_file`] for text-level, anchor-free rewriting.
pub fn rewrite_file(
    path: &Path,
    encoding: Encoding,
    rules: &[RewriteRule],
    options: ApplyOptions,
) -> Result<RewriteOutcome, TransformError> {
    info!("Rewriting '{}'", path.display());
    let mut doc = read_document(path, encoding)?;
    let before = doc.display_text();

    let changed = rewrite_document(&mut doc, rules);
    if !changed {
        debug!("  No rule changed '{}'.", path.display());
    }

    let diff = if options.dry_run {
        info!("  DRY RUN: leaving '{}' untouched.", path.display());
        Some(preview_diff(&before, &doc.display_text(), options.diff_context))
    } else {
        if changed {
            write_document(&doc, path)?;
        }
        None
    };

    Ok(RewriteOutcome { changed, diff })
}

/// Renders a unified diff between the original and transformed text.
fn preview_diff(before: &str, after: &str, context: usize) -> String {
    unified_diff(
        similar::Algorithm::default(),
        before,
        after,
        context,
        Some(("a", "b")),
    )
    .to_string()
}
