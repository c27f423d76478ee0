//! Tolerant parser for unified and `git diff` output.
//!
//! Malformed input never fails: unknown lines inside a hunk become context, unparseable hunk
//! headers fall back to `-1,0 +1,0`, and text without any file headers but with `@@` markers is
//! returned as a single anonymous [`FileDiff`].

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::diff::DiffStats;

static GIT_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(.*?) b/(.*?)$").unwrap());
static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@@\s+-(\d+)(?:,(\d+))?\s+\+(\d+)(?:,(\d+))?\s+@@(.*)").unwrap()
});

const DEV_NULL: &str = "/dev/null";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffLineType {
    Context,
    Added,
    Deleted,
    Header,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub line_type: DiffLineType,
    pub content: String,
    pub old_line_number: Option<u32>,
    pub new_line_number: Option<u32>,
}

/// A block of a file diff introduced by `@@ -o,oc +n,nc @@`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffHunk {
    pub old_start: u32,
    pub old_line_count: u32,
    pub new_start: u32,
    pub new_line_count: u32,
    pub lines: Vec<DiffLine>,
    /// The raw `@@ ... @@` line, including any trailing section text.
    pub header: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileDiff {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<DiffHunk>,
    pub is_new_file: bool,
    pub is_deleted_file: bool,
    pub is_binary_file: bool,
    pub is_renamed: bool,
    pub old_mode: Option<String>,
    pub new_mode: Option<String>,
}

impl FileDiff {
    /// The path after the change, or the old path for deletions.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }

    #[must_use]
    pub fn stats(&self) -> DiffStats {
        let mut stats = DiffStats::default();
        for line in self.hunks.iter().flat_map(|h| &h.lines) {
            match line.line_type {
                DiffLineType::Added => stats.added_lines += 1,
                DiffLineType::Deleted => stats.deleted_lines += 1,
                DiffLineType::Context => stats.context_lines += 1,
                DiffLineType::Header => {}
            }
        }
        stats
    }
}

/// Stateless diff text parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffParser;

impl DiffParser {
    #[must_use]
    pub fn parse(text: &str) -> Vec<FileDiff> {
        let lines: Vec<&str> = text.lines().collect();
        let mut files = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            if lines[i].starts_with("diff --git ") {
                let (file, next) = parse_git_block(&lines, i);
                files.push(file);
                i = next;
            } else if is_file_header(&lines, i) {
                let (file, next) = parse_plain_block(&lines, i);
                files.push(file);
                i = next;
            } else {
                i += 1;
            }
        }

        if files.is_empty() && text.contains("@@") {
            let (hunks, _) = parse_hunks(&lines, 0);
            if !hunks.is_empty() {
                tracing::debug!(hunks = hunks.len(), "diff has hunks but no file headers");
                files.push(FileDiff {
                    hunks,
                    ..FileDiff::default()
                });
            }
        }

        files
    }
}

/// `---` immediately followed by `+++`. Inside a hunk this only counts once the header's line
/// counts are used up.
fn is_file_header(lines: &[&str], i: usize) -> bool {
    lines[i].starts_with("---") && lines.get(i + 1).is_some_and(|l| l.starts_with("+++"))
}

fn parse_git_block(lines: &[&str], start: usize) -> (FileDiff, usize) {
    let mut file = FileDiff::default();
    if let Some(caps) = GIT_HEADER_RE.captures(lines[start]) {
        file.old_path = Some(caps[1].to_owned());
        file.new_path = Some(caps[2].to_owned());
    } else {
        tracing::debug!(line = lines[start], "unrecognised git diff header");
    }

    let mut i = start + 1;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("diff --git ") || line.starts_with("@@") {
            break;
        }
        if let Some(mode) = line.strip_prefix("new file mode ") {
            file.is_new_file = true;
            file.new_mode = Some(mode.trim().to_owned());
        } else if let Some(mode) = line.strip_prefix("deleted file mode ") {
            file.is_deleted_file = true;
            file.old_mode = Some(mode.trim().to_owned());
        } else if let Some(mode) = line.strip_prefix("old mode ") {
            file.old_mode = Some(mode.trim().to_owned());
        } else if let Some(mode) = line.strip_prefix("new mode ") {
            file.new_mode = Some(mode.trim().to_owned());
        } else if let Some(path) = line.strip_prefix("rename from ") {
            file.is_renamed = true;
            file.old_path = Some(path.trim().to_owned());
        } else if let Some(path) = line.strip_prefix("rename to ") {
            file.is_renamed = true;
            file.new_path = Some(path.trim().to_owned());
        } else if line.starts_with("Binary files ") {
            file.is_binary_file = true;
            return (file, i + 1);
        } else if is_file_header(lines, i) {
            apply_header_paths(&mut file, lines[i], lines[i + 1]);
            i += 2;
            break;
        }
        i += 1;
    }

    let (hunks, next) = parse_hunks(lines, i);
    file.hunks = hunks;
    (file, next)
}

fn parse_plain_block(lines: &[&str], start: usize) -> (FileDiff, usize) {
    let mut file = FileDiff::default();
    apply_header_paths(&mut file, lines[start], lines[start + 1]);
    let (hunks, next) = parse_hunks(lines, start + 2);
    file.hunks = hunks;
    (file, next)
}

fn apply_header_paths(file: &mut FileDiff, old_line: &str, new_line: &str) {
    match extract_path(old_line) {
        Some(path) => file.old_path = Some(path),
        None => {
            file.old_path = None;
            file.is_new_file = true;
        }
    }
    match extract_path(new_line) {
        Some(path) => file.new_path = Some(path),
        None => {
            file.new_path = None;
            file.is_deleted_file = true;
        }
    }
}

/// Path from a `--- a/x` / `+++ b/x` line. Trailing tab-separated timestamps are dropped and
/// `/dev/null` resolves to `None`.
fn extract_path(line: &str) -> Option<String> {
    let (_, rest) = line.split_once(char::is_whitespace)?;
    let path = rest.trim_start().split('\t').next().unwrap_or_default().trim_end();
    if path.is_empty() || path == DEV_NULL {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_owned())
}

fn parse_hunks(lines: &[&str], start: usize) -> (Vec<DiffHunk>, usize) {
    let mut hunks = Vec::new();
    let mut i = start;
    while i < lines.len() {
        if lines[i].starts_with("diff --git ") || is_file_header(lines, i) {
            break;
        }
        if lines[i].starts_with("@@") {
            let (hunk, next) = parse_hunk(lines, i);
            hunks.push(hunk);
            i = next;
        } else {
            i += 1;
        }
    }
    (hunks, i)
}

fn parse_hunk(lines: &[&str], start: usize) -> (DiffHunk, usize) {
    let header = lines[start];
    let counts = parse_hunk_header(header);
    let (old_start, old_line_count, new_start, new_line_count) =
        counts.unwrap_or((1, 0, 1, 0));
    let mut old_line = old_start;
    let mut new_line = new_start;
    // lines the header still promises; while any remain, `---`/`+++` pairs are body lines
    let mut old_left = old_line_count;
    let mut new_left = new_line_count;
    let mut body = Vec::new();

    let mut i = start + 1;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("@@") || line.starts_with("diff --git ") {
            break;
        }
        let owed = counts.is_some() && (old_left > 0 || new_left > 0);
        if !owed && is_file_header(lines, i) {
            break;
        }
        let diff_line = if let Some(content) = line.strip_prefix('+') {
            let l = DiffLine {
                line_type: DiffLineType::Added,
                content: content.to_owned(),
                old_line_number: None,
                new_line_number: Some(new_line),
            };
            new_line = new_line.saturating_add(1);
            new_left = new_left.saturating_sub(1);
            l
        } else if let Some(content) = line.strip_prefix('-') {
            let l = DiffLine {
                line_type: DiffLineType::Deleted,
                content: content.to_owned(),
                old_line_number: Some(old_line),
                new_line_number: None,
            };
            old_line = old_line.saturating_add(1);
            old_left = old_left.saturating_sub(1);
            l
        } else {
            let l = DiffLine {
                line_type: DiffLineType::Context,
                content: line.strip_prefix(' ').unwrap_or(line).to_owned(),
                old_line_number: Some(old_line),
                new_line_number: Some(new_line),
            };
            old_line = old_line.saturating_add(1);
            new_line = new_line.saturating_add(1);
            old_left = old_left.saturating_sub(1);
            new_left = new_left.saturating_sub(1);
            l
        };
        body.push(diff_line);
        i += 1;
    }

    let hunk = DiffHunk {
        old_start,
        old_line_count,
        new_start,
        new_line_count,
        lines: body,
        header: header.to_owned(),
    };
    (hunk, i)
}

/// `(old_start, old_count, new_start, new_count)`, or `None` when the header is malformed.
fn parse_hunk_header(header: &str) -> Option<(u32, u32, u32, u32)> {
    let parsed = HUNK_HEADER_RE.captures(header).and_then(|caps| {
        let number = |idx: usize| -> Option<u32> {
            caps.get(idx).map_or(Some(1), |m| m.as_str().parse().ok())
        };
        Some((number(1)?, number(2)?, number(3)?, number(4)?))
    });
    if parsed.is_none() {
        tracing::debug!(header, "malformed hunk header");
    }
    parsed
}
