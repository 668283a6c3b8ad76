//! Heading-aware markdown chunker.
//!
//! Splits a [`Document`]'s normalized text into [`Chunk`]s aligned to the
//! document's heading structure. Every chunk carries the full heading path
//! of the section it came from.
//!
//! # Algorithm
//!
//! 1. Parse ATX headings (`#` through `######`) into a heading stack.
//!    Lines inside fenced code blocks are never headings; an unterminated
//!    fence is a [`RagError::Chunking`] error.
//! 2. Accumulate body text under the deepest enclosing heading. Text before
//!    the first heading forms an implicit section with an empty path.
//! 3. A heading always starts a new chunk. Empty sections are dropped.
//!    Sections shorter than `min_chars` are folded into the next section
//!    and listed in its `also_covers`.
//! 4. A section longer than `max_chars` is split on paragraph boundaries,
//!    then sentences, then whitespace, then characters, into pieces of at
//!    most `max_chars - overlap_chars` characters. Each piece after the
//!    first is prefixed with a word-aligned tail of the previous piece.
//!
//! All lengths are measured in `char`s.
//!
//! # Example
//!
//! ```rust
//! use knowledge_rag_core::chunk::{chunk_document, ChunkingParams};
//! use knowledge_rag_core::models::Document;
//!
//! let doc = Document {
//!     source: "hr/overtime.md".into(),
//!     title: "Overtime".into(),
//!     text: "# Overtime\nPaid at 1.5x after 40 hours.".into(),
//!     modified_at: 0,
//!     extra: Default::default(),
//! };
//! let chunks = chunk_document(&doc, &ChunkingParams::default()).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].metadata.heading_path, vec!["Overtime"]);
//! ```

use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};
use crate::models::{Chunk, ChunkMetadata, Document};

/// Size limits for chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    /// Maximum chunk length, overlap prefix included.
    pub max_chars: usize,
    /// Upper bound on the prefix repeated from the previous chunk.
    pub overlap_chars: usize,
    /// Sections shorter than this are merged forward. `0` disables merging.
    pub min_chars: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            overlap_chars: 200,
            min_chars: 0,
        }
    }
}

impl ChunkingParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(RagError::Config("chunking.max_chars must be > 0".into()));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(RagError::Config(
                "chunking.overlap_chars must be < chunking.max_chars".into(),
            ));
        }
        if self.min_chars >= self.max_chars {
            return Err(RagError::Config(
                "chunking.min_chars must be < chunking.max_chars".into(),
            ));
        }
        Ok(())
    }

    /// Length budget for the fresh (non-overlap) part of a piece.
    fn piece_budget(&self) -> usize {
        self.max_chars - self.overlap_chars
    }
}

/// Split a document into ordered chunks.
///
/// # Errors
///
/// - [`RagError::Config`] if `params` is invalid.
/// - [`RagError::Chunking`] if a fenced code block is never closed.
pub fn chunk_document(doc: &Document, params: &ChunkingParams) -> Result<Vec<Chunk>> {
    params.validate()?;
    let sections = parse_sections(&doc.source, &doc.text)?;
    let sections = merge_small_sections(sections, params.min_chars);

    let mut chunks = Vec::new();
    for section in sections {
        for (text, overlap) in split_section(&section.body, params) {
            let fingerprint = fingerprint(&doc.source, &section.heading_path, &text);
            let char_len = text.chars().count();
            let chunk_index = chunks.len();
            chunks.push(Chunk {
                fingerprint,
                text,
                overlap,
                metadata: ChunkMetadata {
                    source: doc.source.clone(),
                    title: doc.title.clone(),
                    heading_path: section.heading_path.clone(),
                    chunk_index,
                    char_len,
                    also_covers: section.also_covers.clone(),
                    extra: doc.extra.clone(),
                },
            });
        }
    }
    Ok(chunks)
}

/// Content fingerprint: hex SHA-256 over source, heading path, and text.
pub fn fingerprint(source: &str, heading_path: &[String], text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    for (i, heading) in heading_path.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1fu8]);
        }
        hasher.update(heading.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============ Structure parsing ============

#[derive(Debug, Clone, PartialEq)]
struct Section {
    heading_path: Vec<String>,
    /// The raw heading line; `None` for the implicit leading section.
    heading_line: Option<String>,
    body: String,
    also_covers: Vec<String>,
}

impl Section {
    fn title(&self) -> Option<&str> {
        self.heading_line
            .as_ref()
            .and_then(|_| self.heading_path.last().map(String::as_str))
    }

    /// The section as plain text, heading line included.
    fn render(&self) -> String {
        match &self.heading_line {
            Some(h) => format!("{}\n\n{}", h, self.body),
            None => self.body.clone(),
        }
    }
}

/// Parse an ATX heading line, returning `(level, title)`.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let level = rest.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let after = &rest[level..];
    if !after.is_empty() && !after.starts_with([' ', '\t']) {
        return None;
    }
    let mut title = after.trim();
    // Optional closing sequence: a run of '#' preceded by whitespace.
    let stripped = title.trim_end_matches('#');
    if stripped.len() < title.len() && (stripped.is_empty() || stripped.ends_with([' ', '\t'])) {
        title = stripped.trim_end();
    }
    Some((level, title.to_string()))
}

/// Detect a code fence opener/closer, returning `(fence char, run length)`.
fn parse_fence(line: &str) -> Option<(char, usize)> {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let ch = trimmed.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let run = trimmed.chars().take_while(|&c| c == ch).count();
    if run < 3 {
        return None;
    }
    Some((ch, run))
}

/// Line-by-line fenced code block state.
///
/// An opener is three or more backticks or tildes indented by at most three
/// spaces. The block closes on a line with the same character, a run at
/// least as long, and nothing after it. The loader and the chunker share
/// this so they agree on what is code.
#[derive(Debug, Clone, Default)]
pub struct FenceTracker {
    open: Option<(char, usize, usize)>,
    line_no: usize,
}

impl FenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance past `line`. Returns `true` when the line is part of a fenced
    /// block: its opener, its contents or its closer.
    pub fn feed(&mut self, line: &str) -> bool {
        self.line_no += 1;
        if let Some((ch, run, _)) = self.open {
            if let Some((c, r)) = parse_fence(line) {
                let rest = line.trim_start_matches(' ')[r..].trim();
                if c == ch && r >= run && rest.is_empty() {
                    self.open = None;
                }
            }
            return true;
        }
        if let Some((ch, run)) = parse_fence(line) {
            self.open = Some((ch, run, self.line_no));
            return true;
        }
        false
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// 1-based line number of a block that is still open.
    pub fn opened_at(&self) -> Option<usize> {
        self.open.map(|(_, _, line)| line)
    }
}

fn parse_sections(source: &str, text: &str) -> Result<Vec<Section>> {
    let mut sections = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current = Section {
        heading_path: Vec::new(),
        heading_line: None,
        body: String::new(),
        also_covers: Vec::new(),
    };
    let mut fences = FenceTracker::new();

    for line in text.lines() {
        if fences.feed(line) {
            push_line(&mut current.body, line);
            continue;
        }

        if let Some((level, title)) = parse_heading(line) {
            sections.push(current);
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, title));
            current = Section {
                heading_path: stack.iter().map(|(_, t)| t.clone()).collect(),
                heading_line: Some(line.trim().to_string()),
                body: String::new(),
                also_covers: Vec::new(),
            };
            continue;
        }

        push_line(&mut current.body, line);
    }

    if let Some(opened_at) = fences.opened_at() {
        return Err(RagError::Chunking {
            path: source.to_string(),
            reason: format!("unterminated code fence opened at line {}", opened_at),
        });
    }
    sections.push(current);

    Ok(sections
        .into_iter()
        .map(|mut s| {
            s.body = trim_blank_lines(&s.body).to_string();
            s
        })
        .filter(|s| !s.body.is_empty())
        .collect())
}

fn push_line(body: &mut String, line: &str) {
    if !body.is_empty() {
        body.push('\n');
    }
    body.push_str(line);
}

/// Strip leading blank lines and trailing whitespace, keeping the first
/// line's indentation.
fn trim_blank_lines(s: &str) -> &str {
    let mut start = 0;
    for line in s.split_inclusive('\n') {
        if line.trim().is_empty() {
            start += line.len();
        } else {
            break;
        }
    }
    s[start..].trim_end()
}

/// Fold sections shorter than `min_chars` into their successor.
fn merge_small_sections(sections: Vec<Section>, min_chars: usize) -> Vec<Section> {
    if min_chars == 0 {
        return sections;
    }
    let mut out = Vec::with_capacity(sections.len());
    let mut pending: Vec<Section> = Vec::new();

    for section in sections {
        if section.body.chars().count() < min_chars {
            pending.push(section);
            continue;
        }
        if pending.is_empty() {
            out.push(section);
            continue;
        }
        let mut carried: Vec<String> = pending.iter().map(Section::render).collect();
        let mut also_covers: Vec<String> = pending
            .iter()
            .filter_map(|s| s.title().map(str::to_string))
            .collect();
        carried.push(section.body);
        also_covers.extend(section.also_covers);
        out.push(Section {
            heading_path: section.heading_path,
            heading_line: section.heading_line,
            body: carried.join("\n\n"),
            also_covers,
        });
        pending.clear();
    }

    // Trailing undersized sections have no successor: emit them together
    // under the first one's heading.
    if !pending.is_empty() {
        let first = pending.remove(0);
        let mut body = first.body.clone();
        let mut also_covers = Vec::new();
        for s in &pending {
            body.push_str("\n\n");
            body.push_str(&s.render());
            if let Some(t) = s.title() {
                also_covers.push(t.to_string());
            }
        }
        out.push(Section {
            heading_path: first.heading_path,
            heading_line: first.heading_line,
            body,
            also_covers,
        });
    }
    out
}

// ============ Size splitting ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Paragraph,
    Sentence,
    Word,
}

impl Boundary {
    fn finer(self) -> Option<Boundary> {
        match self {
            Boundary::Paragraph => Some(Boundary::Sentence),
            Boundary::Sentence => Some(Boundary::Word),
            Boundary::Word => None,
        }
    }
}

/// Split a section body into `(text, overlap)` pairs.
fn split_section(body: &str, params: &ChunkingParams) -> Vec<(String, usize)> {
    if char_len(body) <= params.max_chars {
        return vec![(body.to_string(), 0)];
    }

    let mut ranges = Vec::new();
    split_to_budget(
        body,
        0,
        body.len(),
        params.piece_budget(),
        Some(Boundary::Paragraph),
        &mut ranges,
    );

    let mut out = Vec::with_capacity(ranges.len());
    let mut prev: Option<&str> = None;
    for (start, end) in ranges {
        let piece = &body[start..end];
        let tail = match prev {
            Some(p) if params.overlap_chars > 1 => overlap_tail(p, params.overlap_chars - 1),
            _ => "",
        };
        if tail.is_empty() {
            out.push((piece.to_string(), 0));
        } else {
            out.push((format!("{} {}", tail, piece), char_len(tail) + 1));
        }
        prev = Some(piece);
    }
    out
}

/// Pack the units of `text[start..end]` at `boundary` into byte ranges of
/// at most `budget` chars, recursing to finer boundaries for oversized units.
fn split_to_budget(
    text: &str,
    start: usize,
    end: usize,
    budget: usize,
    boundary: Option<Boundary>,
    out: &mut Vec<(usize, usize)>,
) {
    if char_len(&text[start..end]) <= budget {
        out.push((start, end));
        return;
    }
    let Some(boundary) = boundary else {
        hard_split(text, start, end, budget, out);
        return;
    };

    let mut buf: Option<(usize, usize)> = None;
    for (us, ue) in unit_ranges(text, start, end, boundary) {
        if char_len(&text[us..ue]) > budget {
            if let Some(b) = buf.take() {
                out.push(b);
            }
            split_to_budget(text, us, ue, budget, boundary.finer(), out);
            continue;
        }
        buf = match buf {
            Some((bs, _)) if char_len(&text[bs..ue]) <= budget => Some((bs, ue)),
            Some(b) => {
                out.push(b);
                Some((us, ue))
            }
            None => Some((us, ue)),
        };
    }
    if let Some(b) = buf {
        out.push(b);
    }
}

/// Split into consecutive ranges of exactly `budget` chars (last may be shorter).
fn hard_split(text: &str, start: usize, end: usize, budget: usize, out: &mut Vec<(usize, usize)>) {
    let mut piece_start = start;
    let mut count = 0;
    for (i, _) in text[start..end].char_indices() {
        if count == budget {
            out.push((piece_start, start + i));
            piece_start = start + i;
            count = 0;
        }
        count += 1;
    }
    if piece_start < end {
        out.push((piece_start, end));
    }
}

/// Whitespace-trimmed unit ranges within `text[start..end]`.
fn unit_ranges(text: &str, start: usize, end: usize, boundary: Boundary) -> Vec<(usize, usize)> {
    let slice = &text[start..end];
    let mut cuts = Vec::new();
    match boundary {
        Boundary::Paragraph => {
            for (i, _) in slice.match_indices("\n\n") {
                cuts.push((i, i + 2));
            }
        }
        Boundary::Sentence => {
            let mut iter = slice.char_indices().peekable();
            while let Some((i, c)) = iter.next() {
                if c == '\n' {
                    cuts.push((i, i + 1));
                } else if matches!(c, '.' | '!' | '?') {
                    if let Some(&(j, next)) = iter.peek() {
                        if next.is_whitespace() {
                            cuts.push((j, j));
                        }
                    }
                }
            }
        }
        Boundary::Word => {
            for (i, c) in slice.char_indices() {
                if c.is_whitespace() {
                    cuts.push((i, i + c.len_utf8()));
                }
            }
        }
    }

    let mut ranges = Vec::new();
    let mut unit_start = 0;
    for (cut_start, cut_end) in cuts {
        if cut_start < unit_start {
            continue;
        }
        if let Some(r) = trimmed(slice, unit_start, cut_start) {
            ranges.push((start + r.0, start + r.1));
        }
        unit_start = cut_end;
    }
    if let Some(r) = trimmed(slice, unit_start, slice.len()) {
        ranges.push((start + r.0, start + r.1));
    }
    ranges
}

fn trimmed(s: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let part = &s[start..end];
    let lead = part.len() - part.trim_start().len();
    let body = part.trim();
    if body.is_empty() {
        None
    } else {
        Some((start + lead, start + lead + body.len()))
    }
}

/// The last `max` chars of `piece`, advanced to a word start when the cut
/// falls inside a word.
fn overlap_tail(piece: &str, max: usize) -> &str {
    let total = char_len(piece);
    if total <= max {
        return piece.trim();
    }
    let cut = piece
        .char_indices()
        .nth(total - max)
        .map(|(i, _)| i)
        .unwrap_or(piece.len());
    let mut tail = &piece[cut..];
    let mid_word = piece[..cut]
        .chars()
        .next_back()
        .is_some_and(|c| !c.is_whitespace());
    if mid_word {
        tail = match tail.find(char::is_whitespace) {
            Some(ws) => &tail[ws..],
            None => "",
        };
    }
    tail.trim()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
