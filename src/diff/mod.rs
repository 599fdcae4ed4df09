//! Structured representation of a unified diff.
//!
//! Every [`DiffLine`] carries both coordinates: its line number in the old
//! (pre-change) file and in the new (post-change) file. Added lines only have
//! a new number, removed lines only an old one, context lines both.

mod parse;

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

pub use parse::{parse_diff, parse_diff_lenient, parse_file_diff};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
            ChangeKind::Renamed => write!(f, "renamed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Added,
    Removed,
    Context,
}

impl LineKind {
    pub fn marker(self) -> char {
        match self {
            LineKind::Added => '+',
            LineKind::Removed => '-',
            LineKind::Context => ' ',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub kind: LineKind,
    /// Line text without the leading marker.
    pub content: String,
    pub old_line: Option<u32>,
    pub new_line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: u32,
    pub old_len: u32,
    pub new_start: u32,
    pub new_len: u32,
    /// Text after the closing `@@`, usually the enclosing function signature.
    pub section: String,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// The `@@ -a,b +c,d @@` header, omitting lengths of 1 the way git does.
    pub fn header(&self) -> String {
        let mut header = format!(
            "@@ -{} +{} @@",
            range(self.old_start, self.old_len),
            range(self.new_start, self.new_len)
        );
        if !self.section.is_empty() {
            header.push(' ');
            header.push_str(&self.section);
        }
        header
    }

    pub fn contains_new_line(&self, line: u32) -> bool {
        line >= self.new_start && line < self.new_start.saturating_add(self.new_len)
    }

    pub fn contains_old_line(&self, line: u32) -> bool {
        line >= self.old_start && line < self.old_start.saturating_add(self.old_len)
    }
}

fn range(start: u32, len: u32) -> String {
    if len == 1 {
        start.to_string()
    } else {
        format!("{start},{len}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Path before the change; `None` for added files.
    pub old_path: Option<String>,
    /// Path after the change; `None` for deleted files.
    pub new_path: Option<String>,
    pub change: ChangeKind,
    pub additions: u32,
    pub deletions: u32,
    pub is_binary: bool,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    /// The path findings are reported against: the new path, or the old one
    /// for deleted files.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.path().rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() { None } else { Some(ext) }
    }

    fn matches_path(&self, path: &str) -> bool {
        let wanted = normalize_path(path);
        [self.new_path.as_deref(), self.old_path.as_deref()]
            .into_iter()
            .flatten()
            .any(|p| p == wanted)
    }

    /// Re-emit the file as unified diff text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let old = self.old_path.as_deref().unwrap_or(self.path());
        let new = self.new_path.as_deref().unwrap_or(self.path());
        let _ = writeln!(out, "diff --git a/{old} b/{new}");
        match self.change {
            ChangeKind::Added => out.push_str("new file mode 100644\n"),
            ChangeKind::Deleted => out.push_str("deleted file mode 100644\n"),
            ChangeKind::Renamed => {
                let _ = writeln!(out, "rename from {old}");
                let _ = writeln!(out, "rename to {new}");
            }
            ChangeKind::Modified => {}
        }
        if self.is_binary {
            let _ = writeln!(out, "Binary files a/{old} and b/{new} differ");
            return out;
        }
        if self.hunks.is_empty() {
            return out;
        }
        match &self.old_path {
            Some(p) => {
                let _ = writeln!(out, "--- a/{p}");
            }
            None => out.push_str("--- /dev/null\n"),
        }
        match &self.new_path {
            Some(p) => {
                let _ = writeln!(out, "+++ b/{p}");
            }
            None => out.push_str("+++ /dev/null\n"),
        }
        for hunk in &self.hunks {
            out.push_str(&hunk.header());
            out.push('\n');
            for line in &hunk.lines {
                out.push(line.kind.marker());
                out.push_str(&line.content);
                out.push('\n');
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDiff {
    pub files: Vec<FileDiff>,
}

impl ParsedDiff {
    /// Look up a file by path. Accepts `a/`, `b/` and `./` prefixed forms.
    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        self.files.iter().find(|f| f.matches_path(path))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_additions(&self) -> u32 {
        self.files.iter().map(|f| f.additions).sum()
    }

    pub fn total_deletions(&self) -> u32 {
        self.files.iter().map(|f| f.deletions).sum()
    }

    /// A copy of this diff restricted to files accepted by `keep`.
    pub fn filter(&self, keep: impl Fn(&FileDiff) -> bool) -> ParsedDiff {
        ParsedDiff {
            files: self.files.iter().filter(|f| keep(f)).cloned().collect(),
        }
    }

    pub fn render(&self) -> String {
        self.files.iter().map(FileDiff::render).collect()
    }
}

/// Strip the `a/`, `b/` and `./` prefixes diff tools put in front of paths.
pub fn normalize_path(path: &str) -> &str {
    let path = path.trim();
    let path = path.strip_prefix("./").unwrap_or(path);
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}
