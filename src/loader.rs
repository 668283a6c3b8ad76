//! Markdown document discovery and normalization.
//!
//! Walks a documents directory (sorted by file name, so runs are
//! deterministic), filters paths through include/exclude globs, and yields
//! one [`Document`] per matching file. Files are read lazily as the
//! iterator advances; a file that cannot be read or is not UTF-8 yields a
//! [`RagError::Load`] item instead of ending the walk.
//!
//! Normalization keeps the markdown structure the chunker needs (headings,
//! blank-line paragraphs, code fences) and removes noise outside code
//! fences: front matter, HTML comments, image links and HTML tags.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use walkdir::WalkDir;

use knowledge_rag_core::chunk::FenceTracker;
use knowledge_rag_core::error::{RagError, Result};
use knowledge_rag_core::models::{Document, Metadata};

use crate::config::DocumentsConfig;

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/node_modules/**", "**/target/**"];

/// Discovers and loads markdown documents under a root directory.
pub struct DocumentLoader {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl DocumentLoader {
    pub fn new(
        root: impl Into<PathBuf>,
        include_globs: &[String],
        exclude_globs: &[String],
        follow_symlinks: bool,
    ) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(RagError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("documents directory does not exist: {}", root.display()),
            )));
        }

        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(exclude_globs.iter().cloned());

        Ok(Self {
            root,
            include: build_globset(include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks,
        })
    }

    pub fn from_config(config: &DocumentsConfig) -> Result<Self> {
        Self::new(
            config.root.clone(),
            &config.include_globs,
            &config.exclude_globs,
            config.follow_symlinks,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily load every matching document.
    pub fn documents(&self) -> impl Iterator<Item = Result<Document>> + '_ {
        self.paths().map(move |entry| {
            let (path, source) = entry?;
            load_document(&path, &source)
        })
    }

    /// Matching file paths with their `/`-separated relative source ids.
    pub fn paths(&self) -> impl Iterator<Item = Result<(PathBuf, String)>> + '_ {
        WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        let path = e.path().map(|p| self.source_id(p)).unwrap_or_default();
                        return Some(Err(RagError::Load {
                            path,
                            reason: e.to_string(),
                        }));
                    }
                };
                if !entry.file_type().is_file() {
                    return None;
                }
                let path = entry.path();
                let source = self.source_id(path);

                if self.exclude.is_match(&source) || !self.include.is_match(&source) {
                    return None;
                }
                Some(Ok((path.to_path_buf(), source)))
            })
    }

    /// `/`-separated path relative to the root. Empty for the root itself.
    fn source_id(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| RagError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| RagError::Config(format!("invalid glob set: {}", e)))
}

/// Read and normalize one file.
pub fn load_document(path: &Path, source: &str) -> Result<Document> {
    let load_err = |reason: String| RagError::Load {
        path: source.to_string(),
        reason,
    };

    let bytes = std::fs::read(path).map_err(|e| load_err(e.to_string()))?;
    let raw = String::from_utf8(bytes).map_err(|_| load_err("not valid UTF-8".to_string()))?;

    let modified_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let text = normalize(&raw);
    let title = extract_title(&text).unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| source.to_string())
    });

    let mut extra = Metadata::new();
    extra.insert("size_bytes".into(), (raw.len() as i64).into());

    Ok(Document {
        source: source.to_string(),
        title,
        text,
        modified_at,
        extra,
    })
}

struct Patterns {
    front_matter: Regex,
    html_comment: Regex,
    image_link: Regex,
    html_tag: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        front_matter: Regex::new(r"(?s)\A---[ \t]*\n.*?\n---[ \t]*(?:\n|\z)").unwrap(),
        html_comment: Regex::new(r"(?s)<!--.*?-->").unwrap(),
        image_link: Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap(),
        html_tag: Regex::new(r"</?[A-Za-z][A-Za-z0-9-]*(?:\s[^<>]*)?/?>").unwrap(),
    })
}

/// Normalize raw markdown text.
pub fn normalize(raw: &str) -> String {
    let p = patterns();
    let text = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = p.front_matter.replace(&text, "");

    // Prose runs are cleaned; fenced code is copied verbatim.
    let mut out = String::with_capacity(text.len());
    let mut prose = String::new();
    let mut fences = FenceTracker::new();
    for line in text.split_inclusive('\n') {
        let was_open = fences.is_open();
        if fences.feed(line) {
            if !was_open {
                out.push_str(&clean_prose(&prose));
                prose.clear();
            }
            out.push_str(line);
        } else {
            prose.push_str(line);
        }
    }
    out.push_str(&clean_prose(&prose));

    let mut lines: Vec<&str> = out.lines().map(str::trim_end).collect();
    while lines.first().is_some_and(|l| l.is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

fn clean_prose(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let p = patterns();
    let text = p.html_comment.replace_all(text, "");
    let text = p.image_link.replace_all(&text, "");
    p.html_tag.replace_all(&text, "").into_owned()
}

/// First level-1 ATX heading outside code fences.
fn extract_title(text: &str) -> Option<String> {
    let mut fences = FenceTracker::new();
    for line in text.lines() {
        if fences.feed(line) {
            continue;
        }
        if let Some(rest) = line.strip_prefix("# ") {
            let title = rest.trim().trim_end_matches('#').trim();
            if !title.is_empty() {
                return Some(title.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &[u8]) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn loader(dir: &Path) -> DocumentLoader {
        DocumentLoader::new(dir, &["**/*.md".to_string()], &[], false).unwrap()
    }

    #[test]
    fn test_missing_root_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let result = DocumentLoader::new(tmp.path().join("nope"), &["**/*.md".into()], &[], false);
        assert!(matches!(result, Err(RagError::Io(_))));
    }

    #[test]
    fn test_walk_is_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "b.md", b"# B\nbody");
        write(tmp.path(), "a.md", b"# A\nbody");
        write(tmp.path(), "sub/c.md", b"# C\nbody");
        write(tmp.path(), "notes.txt", b"ignored");
        write(tmp.path(), "node_modules/pkg/readme.md", b"# vendored");

        let sources: Vec<String> = loader(tmp.path())
            .documents()
            .map(|d| d.unwrap().source)
            .collect();
        assert_eq!(sources, vec!["a.md", "b.md", "sub/c.md"]);
    }

    #[test]
    fn test_exclude_globs() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "keep.md", b"keep");
        write(tmp.path(), "drafts/skip.md", b"skip");
        let loader =
            DocumentLoader::new(tmp.path(), &["**/*.md".into()], &["drafts/**".into()], false)
                .unwrap();
        let sources: Vec<String> = loader.documents().map(|d| d.unwrap().source).collect();
        assert_eq!(sources, vec!["keep.md"]);
    }

    #[test]
    fn test_invalid_utf8_yields_load_error_and_continues() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", &[0xff, 0xfe, 0x00, 0x41]);
        write(tmp.path(), "b.md", b"# Fine\ntext");
        let items: Vec<_> = loader(tmp.path()).documents().collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Err(RagError::Load { path, .. }) if path == "a.md"));
        assert_eq!(items[1].as_ref().unwrap().title, "Fine");
    }

    #[test]
    fn test_title_falls_back_to_file_stem() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "handbook.md", b"## Only a subsection\ntext");
        let doc = loader(tmp.path()).documents().next().unwrap().unwrap();
        assert_eq!(doc.title, "handbook");
    }

    #[test]
    fn test_normalize_strips_noise() {
        let raw = "\u{feff}---\ntitle: x\n---\r\n# Policy  \r\n\r\n<!-- hidden -->Text with ![img](a.png) and <b>bold</b>.\r\n";
        assert_eq!(normalize(raw), "# Policy\n\nText with  and bold.");
    }

    #[test]
    fn test_normalize_keeps_code_fences() {
        let raw = "# Code\n\n```rust\nlet v: Vec<String> = vec![];\n```\n<span>after</span>\n";
        let out = normalize(raw);
        assert!(out.contains("let v: Vec<String> = vec![];"));
        assert!(out.ends_with("```\nafter"));
    }

    #[test]
    fn test_normalize_matches_chunker_fences() {
        let raw = "# T\n\n~~~\n```\n<b>kept</b>\n~~~\n\nafter <i>x</i>";
        let out = normalize(raw);
        assert!(out.contains("```\n<b>kept</b>\n~~~"), "{}", out);
        assert!(out.ends_with("after x"), "{}", out);

        let indented = "Intro\n\n    ```\n<b>gone</b>";
        assert_eq!(normalize(indented), "Intro\n\n    ```\ngone");
    }

    #[test]
    fn test_title_ignores_fenced_heading() {
        assert_eq!(
            extract_title("```\n# not a title\n```\n# Real"),
            Some("Real".to_string())
        );
    }
}
