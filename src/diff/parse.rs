use tracing::{debug, warn};

use super::{ChangeKind, DiffLine, FileDiff, Hunk, LineKind, ParsedDiff};
use crate::error::{Error, Result};

const DEV_NULL: &str = "/dev/null";

/// Parse unified diff text, failing on the first malformed file.
pub fn parse_diff(text: &str) -> Result<ParsedDiff> {
    let (diff, errors) = parse_all(text);
    match errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(diff),
    }
}

/// Parse unified diff text, skipping files that fail to parse.
///
/// Returns the files that parsed cleanly together with one error per
/// skipped file.
pub fn parse_diff_lenient(text: &str) -> (ParsedDiff, Vec<Error>) {
    let (diff, errors) = parse_all(text);
    for err in &errors {
        warn!(error = %err, "skipping malformed file diff");
    }
    (diff, errors)
}

/// Parse the diff of a single file whose text may lack the `diff --git` /
/// `---` / `+++` header block. The header is synthesized from the supplied
/// path pair (`/dev/null` marks an added or deleted side).
pub fn parse_file_diff(text: &str, old_path: &str, new_path: &str) -> Result<FileDiff> {
    let lines: Vec<&str> = text.lines().collect();
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let has_header = first.is_some_and(|i| is_file_start(&lines, i));

    let full = if has_header {
        text.to_string()
    } else {
        debug!(old_path, new_path, "synthesizing missing diff header");
        format!(
            "--- {}\n+++ {}\n{text}",
            header_path(old_path, "a/"),
            header_path(new_path, "b/")
        )
    };

    parse_diff(&full)?
        .files
        .into_iter()
        .next()
        .ok_or_else(|| Error::MalformedDiff {
            file: new_path.to_string(),
            hunk: String::new(),
            reason: "no file diff found".to_string(),
        })
}

fn header_path(path: &str, prefix: &str) -> String {
    if path == DEV_NULL {
        DEV_NULL.to_string()
    } else {
        format!("{prefix}{}", super::normalize_path(path))
    }
}

fn parse_all(text: &str) -> (ParsedDiff, Vec<Error>) {
    let lines: Vec<&str> = text.lines().collect();
    let mut files = Vec::new();
    let mut errors = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if is_file_start(&lines, i) {
            match parse_file(&lines, &mut i) {
                Ok(file) => files.push(file),
                Err(err) => {
                    errors.push(err);
                    skip_to_next_file(&lines, &mut i);
                }
            }
        } else if lines[i].starts_with("@@") {
            errors.push(Error::MalformedDiff {
                file: "<unknown>".to_string(),
                hunk: lines[i].to_string(),
                reason: "hunk without a file header".to_string(),
            });
            i += 1;
            skip_to_next_file(&lines, &mut i);
        } else {
            i += 1;
        }
    }

    (ParsedDiff { files }, errors)
}

fn is_file_start(lines: &[&str], i: usize) -> bool {
    let line = lines[i];
    line.starts_with("diff --git ")
        || (line.starts_with("--- ")
            && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ ")))
}

fn skip_to_next_file(lines: &[&str], i: &mut usize) {
    while *i < lines.len() && !is_file_start(lines, *i) {
        *i += 1;
    }
}

#[derive(Default)]
struct FileHeader {
    old_path: Option<String>,
    new_path: Option<String>,
    added: bool,
    deleted: bool,
    renamed: bool,
    binary: bool,
}

impl FileHeader {
    fn display_path(&self) -> String {
        self.new_path
            .clone()
            .or_else(|| self.old_path.clone())
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}

fn parse_file(lines: &[&str], i: &mut usize) -> Result<FileDiff> {
    let mut header = FileHeader::default();

    if let Some(rest) = lines[*i].strip_prefix("diff --git ") {
        if let Some((a, b)) = split_git_paths(rest) {
            header.old_path = Some(a);
            header.new_path = Some(b);
        }
        *i += 1;
        while *i < lines.len() {
            let line = lines[*i];
            if line.starts_with("@@") || line.starts_with("diff --git ") {
                break;
            }
            if line.starts_with("--- ") {
                break;
            }
            if line.starts_with("new file mode") {
                header.added = true;
            } else if line.starts_with("deleted file mode") {
                header.deleted = true;
            } else if let Some(p) = line.strip_prefix("rename from ") {
                header.renamed = true;
                header.old_path = Some(p.to_string());
            } else if let Some(p) = line.strip_prefix("rename to ") {
                header.renamed = true;
                header.new_path = Some(p.to_string());
            } else if line.starts_with("Binary files ") {
                header.binary = true;
            }
            *i += 1;
        }
    }

    if *i < lines.len() && lines[*i].starts_with("--- ") {
        let old = marker_path(&lines[*i][4..]);
        *i += 1;
        let new = lines
            .get(*i)
            .and_then(|l| l.strip_prefix("+++ "))
            .map(marker_path)
            .ok_or_else(|| Error::MalformedDiff {
                file: header.display_path(),
                hunk: String::new(),
                reason: "'---' line without matching '+++' line".to_string(),
            })?;
        *i += 1;
        match old {
            Some(p) => header.old_path = Some(p),
            None => header.added = true,
        }
        match new {
            Some(p) => header.new_path = Some(p),
            None => header.deleted = true,
        }
    }

    let file_name = header.display_path();
    let mut hunks = Vec::new();
    while *i < lines.len() && !is_file_start(lines, *i) {
        if lines[*i].starts_with("@@") {
            hunks.push(parse_hunk(lines, i, &file_name)?);
        } else {
            *i += 1;
        }
    }
    hunks.sort_by_key(|h| h.old_start);

    let (additions, deletions) = count_changes(&hunks);
    let change = if header.added {
        header.old_path = None;
        ChangeKind::Added
    } else if header.deleted {
        header.new_path = None;
        ChangeKind::Deleted
    } else if header.renamed || header.old_path != header.new_path {
        ChangeKind::Renamed
    } else {
        ChangeKind::Modified
    };

    Ok(FileDiff {
        old_path: header.old_path,
        new_path: header.new_path,
        change,
        additions,
        deletions,
        is_binary: header.binary,
        hunks,
    })
}

/// Split the `a/x b/y` part of a `diff --git` line.
fn split_git_paths(rest: &str) -> Option<(String, String)> {
    let rest = rest.strip_prefix("a/")?;
    let (a, b) = rest.split_once(" b/")?;
    Some((a.to_string(), b.to_string()))
}

/// Path from a `---`/`+++` line; `None` for `/dev/null`.
fn marker_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    if raw == DEV_NULL {
        return None;
    }
    Some(super::normalize_path(raw).to_string())
}

fn count_changes(hunks: &[Hunk]) -> (u32, u32) {
    let mut additions = 0;
    let mut deletions = 0;
    for line in hunks.iter().flat_map(|h| &h.lines) {
        match line.kind {
            LineKind::Added => additions += 1,
            LineKind::Removed => deletions += 1,
            LineKind::Context => {}
        }
    }
    (additions, deletions)
}

struct HunkRange {
    old_start: u32,
    old_len: u32,
    new_start: u32,
    new_len: u32,
    section: String,
}

fn parse_hunk_header(line: &str, file: &str) -> Result<HunkRange> {
    let malformed = |reason: String| Error::MalformedDiff {
        file: file.to_string(),
        hunk: line.to_string(),
        reason,
    };

    let body = line
        .strip_prefix("@@ ")
        .ok_or_else(|| malformed("missing '@@ ' prefix".to_string()))?;
    let (ranges, section) = body
        .split_once(" @@")
        .ok_or_else(|| malformed("missing closing '@@'".to_string()))?;
    let (old, new) = ranges
        .split_once(' ')
        .ok_or_else(|| malformed("expected old and new ranges".to_string()))?;
    let old = old
        .strip_prefix('-')
        .ok_or_else(|| malformed("old range must start with '-'".to_string()))?;
    let new = new
        .strip_prefix('+')
        .ok_or_else(|| malformed("new range must start with '+'".to_string()))?;

    let parse_range = |range: &str| -> Result<(u32, u32)> {
        let (start, len) = match range.split_once(',') {
            Some((s, l)) => (s, Some(l)),
            None => (range, None),
        };
        let start = start
            .parse::<u32>()
            .map_err(|_| malformed(format!("non-numeric start '{start}'")))?;
        let len = match len {
            Some(l) => l
                .parse::<u32>()
                .map_err(|_| malformed(format!("non-numeric length '{l}'")))?,
            None => 1,
        };
        if start.checked_add(len).is_none() {
            return Err(malformed(format!("range {start},{len} overflows line numbers")));
        }
        Ok((start, len))
    };

    let (old_start, old_len) = parse_range(old)?;
    let (new_start, new_len) = parse_range(new)?;

    Ok(HunkRange {
        old_start,
        old_len,
        new_start,
        new_len,
        section: section.trim().to_string(),
    })
}

fn parse_hunk(lines: &[&str], i: &mut usize, file: &str) -> Result<Hunk> {
    let header_line = lines[*i];
    let range = parse_hunk_header(header_line, file)?;
    *i += 1;

    let truncated = |reason: &str| Error::MalformedDiff {
        file: file.to_string(),
        hunk: header_line.to_string(),
        reason: reason.to_string(),
    };

    let mut old_line = range.old_start;
    let mut new_line = range.new_start;
    let mut old_seen = 0;
    let mut new_seen = 0;
    let mut body = Vec::new();

    while old_seen < range.old_len || new_seen < range.new_len {
        let Some(raw) = lines.get(*i) else {
            return Err(truncated("hunk body ends before the header's line counts"));
        };
        if raw.starts_with('\\') {
            *i += 1;
            continue;
        }
        if raw.starts_with("@@") || is_file_start(lines, *i) {
            return Err(truncated("hunk body ends before the header's line counts"));
        }

        let (kind, content) = match raw.chars().next() {
            Some('+') => (LineKind::Added, &raw[1..]),
            Some('-') => (LineKind::Removed, &raw[1..]),
            Some(' ') => (LineKind::Context, &raw[1..]),
            None => (LineKind::Context, ""),
            Some(_) => return Err(truncated("line without a diff marker inside hunk")),
        };

        let line = match kind {
            LineKind::Added => {
                if new_seen == range.new_len {
                    return Err(truncated("more new-side lines than the header declares"));
                }
                new_seen += 1;
                new_line += 1;
                DiffLine {
                    kind,
                    content: content.to_string(),
                    old_line: None,
                    new_line: Some(new_line - 1),
                }
            }
            LineKind::Removed => {
                if old_seen == range.old_len {
                    return Err(truncated("more old-side lines than the header declares"));
                }
                old_seen += 1;
                old_line += 1;
                DiffLine {
                    kind,
                    content: content.to_string(),
                    old_line: Some(old_line - 1),
                    new_line: None,
                }
            }
            LineKind::Context => {
                if old_seen == range.old_len || new_seen == range.new_len {
                    return Err(truncated("more context lines than the header declares"));
                }
                old_seen += 1;
                new_seen += 1;
                old_line += 1;
                new_line += 1;
                DiffLine {
                    kind,
                    content: content.to_string(),
                    old_line: Some(old_line - 1),
                    new_line: Some(new_line - 1),
                }
            }
        };
        body.push(line);
        *i += 1;
    }

    Ok(Hunk {
        old_start: range.old_start,
        old_len: range.old_len,
        new_start: range.new_start,
        new_len: range.new_len,
        section: range.section,
        lines: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODIFIED: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
index 3b18e51..a9c2f4d 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -10,3 +10,4 @@ fn main() {
 let a = 1;
+let b = 2;
 let c = 3;
-let d = 4;
+let d = 5;
";

    #[test]
    fn test_parse_modified_file() {
        let diff = parse_diff(MODIFIED).unwrap();
        assert_eq!(diff.files.len(), 1);
        let file = &diff.files[0];
        assert_eq!(file.path(), "src/lib.rs");
        assert_eq!(file.change, ChangeKind::Modified);
        assert_eq!(file.additions, 2);
        assert_eq!(file.deletions, 1);

        let hunk = &file.hunks[0];
        assert_eq!(
            (hunk.old_start, hunk.old_len, hunk.new_start, hunk.new_len),
            (10, 3, 10, 4)
        );
        assert_eq!(hunk.section, "fn main() {");
        assert_eq!(hunk.lines.len(), 5);
        assert_eq!(hunk.lines[1].kind, LineKind::Added);
        assert_eq!(hunk.lines[1].new_line, Some(11));
        assert_eq!(hunk.lines[1].old_line, None);
        assert_eq!(hunk.lines[3].kind, LineKind::Removed);
        assert_eq!(hunk.lines[3].old_line, Some(12));
        assert_eq!(hunk.lines[4].new_line, Some(13));
    }

    #[test]
    fn test_counters_reproduce_header() {
        let diff = parse_diff(MODIFIED).unwrap();
        for hunk in diff.files.iter().flat_map(|f| &f.hunks) {
            let old_count = hunk
                .lines
                .iter()
                .filter(|l| l.kind != LineKind::Added)
                .count() as u32;
            let new_count = hunk
                .lines
                .iter()
                .filter(|l| l.kind != LineKind::Removed)
                .count() as u32;
            assert_eq!(hunk.old_start + old_count, hunk.old_start + hunk.old_len);
            assert_eq!(hunk.new_start + new_count, hunk.new_start + hunk.new_len);
        }
    }

    #[test]
    fn test_omitted_length_defaults_to_one() {
        let text = "--- a/x.py\n+++ b/x.py\n@@ -3 +3 @@\n-old\n+new\n";
        let diff = parse_diff(text).unwrap();
        let hunk = &diff.files[0].hunks[0];
        assert_eq!(hunk.old_len, 1);
        assert_eq!(hunk.new_len, 1);
    }

    #[test]
    fn test_added_file() {
        let text = "\
diff --git a/new.go b/new.go
new file mode 100644
--- /dev/null
+++ b/new.go
@@ -0,0 +1,2 @@
+package main
+func main() {}
";
        let diff = parse_diff(text).unwrap();
        let file = &diff.files[0];
        assert_eq!(file.change, ChangeKind::Added);
        assert_eq!(file.old_path, None);
        assert_eq!(file.path(), "new.go");
        assert_eq!(file.hunks[0].old_len, 0);
        assert_eq!(file.hunks[0].lines[1].new_line, Some(2));
    }

    #[test]
    fn test_deleted_file() {
        let text = "\
diff --git a/gone.rs b/gone.rs
deleted file mode 100644
--- a/gone.rs
+++ /dev/null
@@ -1,2 +0,0 @@
-fn a() {}
-fn b() {}
";
        let diff = parse_diff(text).unwrap();
        let file = &diff.files[0];
        assert_eq!(file.change, ChangeKind::Deleted);
        assert_eq!(file.new_path, None);
        assert_eq!(file.path(), "gone.rs");
        assert_eq!(file.deletions, 2);
    }

    #[test]
    fn test_pure_rename_has_no_hunks() {
        let text = "\
diff --git a/old/name.rs b/new/name.rs
similarity index 100%
rename from old/name.rs
rename to new/name.rs
diff --git a/other.rs b/other.rs
--- a/other.rs
+++ b/other.rs
@@ -1 +1 @@
-a
+b
";
        let diff = parse_diff(text).unwrap();
        assert_eq!(diff.files.len(), 2);
        assert_eq!(diff.files[0].change, ChangeKind::Renamed);
        assert_eq!(diff.files[0].old_path.as_deref(), Some("old/name.rs"));
        assert_eq!(diff.files[0].new_path.as_deref(), Some("new/name.rs"));
        assert!(diff.files[0].hunks.is_empty());
        assert_eq!(diff.files[1].change, ChangeKind::Modified);
    }

    #[test]
    fn test_binary_file() {
        let text = "\
diff --git a/logo.png b/logo.png
index 1111111..2222222 100644
Binary files a/logo.png and b/logo.png differ
";
        let diff = parse_diff(text).unwrap();
        assert!(diff.files[0].is_binary);
        assert!(diff.files[0].hunks.is_empty());
    }

    #[test]
    fn test_no_newline_marker_ignored() {
        let text = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-old\n\\ No newline at end of file\n+new\n\\ No newline at end of file\n";
        let diff = parse_diff(text).unwrap();
        assert_eq!(diff.files[0].hunks[0].lines.len(), 2);
    }

    #[test]
    fn test_empty_line_is_context() {
        let text = "--- a/a.txt\n+++ b/a.txt\n@@ -1,3 +1,3 @@\n a\n\n-b\n+c\n";
        let diff = parse_diff(text).unwrap();
        let hunk = &diff.files[0].hunks[0];
        assert_eq!(hunk.lines[1].kind, LineKind::Context);
        assert_eq!(hunk.lines[1].content, "");
        assert_eq!(hunk.lines[1].new_line, Some(2));
    }

    #[test]
    fn test_multiple_hunks_sorted_by_old_start() {
        let text = "\
--- a/m.rs
+++ b/m.rs
@@ -20 +20 @@
-x
+y
@@ -5 +5 @@
-p
+q
";
        let diff = parse_diff(text).unwrap();
        let starts: Vec<u32> = diff.files[0].hunks.iter().map(|h| h.old_start).collect();
        assert_eq!(starts, vec![5, 20]);
    }

    #[test]
    fn test_traditional_headers_with_timestamps() {
        let text = "--- a/t.c\t2024-01-01 00:00:00\n+++ b/t.c\t2024-01-02 00:00:00\n@@ -1 +1 @@\n-a\n+b\n";
        let diff = parse_diff(text).unwrap();
        assert_eq!(diff.files[0].path(), "t.c");
    }

    #[test]
    fn test_non_numeric_start_is_malformed() {
        let text = "--- a/bad.rs\n+++ b/bad.rs\n@@ -x,3 +1,3 @@\n a\n";
        let err = parse_diff(text).unwrap_err();
        match err {
            Error::MalformedDiff { file, hunk, reason } => {
                assert_eq!(file, "bad.rs");
                assert!(hunk.starts_with("@@ -x,3"));
                assert!(reason.contains("non-numeric"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_truncated_hunk_is_malformed() {
        let text = "--- a/short.rs\n+++ b/short.rs\n@@ -1,3 +1,3 @@\n a\n";
        assert!(matches!(
            parse_diff(text),
            Err(Error::MalformedDiff { .. })
        ));
    }

    #[test]
    fn test_lenient_skips_only_bad_file() {
        let text = "\
diff --git a/bad.rs b/bad.rs
--- a/bad.rs
+++ b/bad.rs
@@ -a +1 @@
+oops
diff --git a/good.rs b/good.rs
--- a/good.rs
+++ b/good.rs
@@ -1 +1,2 @@
 keep
+added
";
        let (diff, errors) = parse_diff_lenient(text);
        assert_eq!(errors.len(), 1);
        assert_eq!(diff.files.len(), 1);
        assert_eq!(diff.files[0].path(), "good.rs");
    }

    #[test]
    fn test_headerless_hunk_rejected_without_paths() {
        let text = "@@ -1 +1 @@\n-a\n+b\n";
        assert!(parse_diff(text).is_err());
    }

    #[test]
    fn test_parse_file_diff_synthesizes_header() {
        let text = "@@ -10,3 +10,4 @@\n a\n+b\n c\n d\n";
        let file = parse_file_diff(text, "src/a.ts", "src/a.ts").unwrap();
        assert_eq!(file.path(), "src/a.ts");
        assert_eq!(file.change, ChangeKind::Modified);
        assert_eq!(file.hunks[0].lines[1].new_line, Some(11));
    }

    #[test]
    fn test_parse_file_diff_added_from_dev_null() {
        let text = "@@ -0,0 +1 @@\n+hello\n";
        let file = parse_file_diff(text, "/dev/null", "hello.txt").unwrap();
        assert_eq!(file.change, ChangeKind::Added);
        assert_eq!(file.path(), "hello.txt");
    }

    #[test]
    fn test_parse_file_diff_keeps_existing_header() {
        let file = parse_file_diff(MODIFIED, "ignored", "ignored").unwrap();
        assert_eq!(file.path(), "src/lib.rs");
    }

    #[test]
    fn test_render_roundtrip() {
        let text = "\
diff --git a/src/lib.rs b/src/lib.rs
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,3 @@
 a
-b
+c
 d
diff --git a/new.txt b/new.txt
new file mode 100644
--- /dev/null
+++ b/new.txt
@@ -0,0 +1 @@
+hi
diff --git a/x b/y
rename from x
rename to y
";
        let parsed = parse_diff(text).unwrap();
        let reparsed = parse_diff(&parsed.render()).unwrap();
        assert_eq!(parsed, reparsed);
    }

    fn build_hunk(old_start: u32, new_start: u32, section: &str, body: &[(LineKind, &str)]) -> Hunk {
        let (mut old_line, mut new_line) = (old_start, new_start);
        let mut lines = Vec::new();
        for &(kind, content) in body {
            let (old, new) = match kind {
                LineKind::Added => (None, Some(new_line)),
                LineKind::Removed => (Some(old_line), None),
                LineKind::Context => (Some(old_line), Some(new_line)),
            };
            old_line += u32::from(old.is_some());
            new_line += u32::from(new.is_some());
            lines.push(DiffLine {
                kind,
                content: content.to_string(),
                old_line: old,
                new_line: new,
            });
        }
        Hunk {
            old_start,
            old_len: old_line - old_start,
            new_start,
            new_len: new_line - new_start,
            section: section.to_string(),
            lines,
        }
    }

    fn build_file(
        old_path: Option<&str>,
        new_path: Option<&str>,
        change: ChangeKind,
        hunks: Vec<Hunk>,
    ) -> FileDiff {
        let (additions, deletions) = count_changes(&hunks);
        FileDiff {
            old_path: old_path.map(String::from),
            new_path: new_path.map(String::from),
            change,
            additions,
            deletions,
            is_binary: false,
            hunks,
        }
    }

    /// Modified files over every mix of 0..=2 context, removed and added
    /// lines, plus added, deleted and renamed files.
    fn generated_files() -> Vec<FileDiff> {
        use LineKind::{Added, Context, Removed};

        let mut files = Vec::new();
        for context in 0..=2 {
            for removed in 0..=2 {
                for added in 0..=2 {
                    if context + removed + added == 0 {
                        continue;
                    }
                    let mut body = Vec::new();
                    body.extend((0..context).map(|c| (Context, if c == 0 { "" } else { "keep();" })));
                    body.extend((0..removed).map(|_| (Removed, "old();")));
                    body.extend((0..added).map(|_| (Added, "new();")));
                    let path = format!("src/m{context}{removed}{added}.rs");
                    let hunks = vec![
                        build_hunk(3, 3, "", &body),
                        build_hunk(40, 41, "fn tail()", &[(Context, "x"), (Added, "y")]),
                    ];
                    files.push(build_file(Some(&path), Some(&path), ChangeKind::Modified, hunks));
                }
            }
        }

        files.push(build_file(
            None,
            Some("docs/new.md"),
            ChangeKind::Added,
            vec![build_hunk(0, 1, "", &[(Added, "# Title")])],
        ));
        files.push(build_file(
            Some("lib/gone.py"),
            None,
            ChangeKind::Deleted,
            vec![build_hunk(1, 0, "", &[(Removed, "import os"), (Removed, "")])],
        ));
        files.push(build_file(
            Some("old/name.rs"),
            Some("new/name.rs"),
            ChangeKind::Renamed,
            Vec::new(),
        ));
        files.push(build_file(
            Some("old/edited.rs"),
            Some("new/edited.rs"),
            ChangeKind::Renamed,
            vec![build_hunk(7, 7, "impl A {", &[(Removed, "a"), (Added, "b")])],
        ));
        files
    }

    #[test]
    fn test_generated_diffs_roundtrip() {
        let files = generated_files();
        for file in &files {
            let diff = ParsedDiff {
                files: vec![file.clone()],
            };
            let rendered = diff.render();
            let reparsed = parse_diff(&rendered).unwrap_or_else(|e| panic!("{e}\n{rendered}"));
            assert_eq!(reparsed, diff, "{rendered}");
        }

        let whole = ParsedDiff { files };
        assert_eq!(parse_diff(&whole.render()).unwrap(), whole);
    }

    #[test]
    fn test_range_past_u32_is_malformed() {
        for header in ["@@ -1 +4294967295,2 @@", "@@ -4294967290,9 +1 @@"] {
            let text = format!("--- a/big.rs\n+++ b/big.rs\n{header}\n+a\n+b\n");
            match parse_diff(&text) {
                Err(Error::MalformedDiff { file, reason, .. }) => {
                    assert_eq!(file, "big.rs");
                    assert!(reason.contains("overflows"), "{reason}");
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn test_hunk_contains_saturates_at_u32_max() {
        let hunk = build_hunk(u32::MAX - 1, u32::MAX - 1, "", &[(LineKind::Context, "a")]);
        assert!(hunk.contains_new_line(u32::MAX - 1));
        assert!(!hunk.contains_old_line(3));

        let wide = Hunk {
            new_len: 10,
            ..hunk.clone()
        };
        assert!(wide.contains_new_line(u32::MAX - 1));
    }

    #[test]
    fn test_trailing_noise_after_hunk_ignored() {
        let text = "--- a/a.rs\n+++ b/a.rs\n@@ -1 +1 @@\n-a\n+b\n-- \n2.40.0\n";
        let diff = parse_diff(text).unwrap();
        assert_eq!(diff.files[0].hunks[0].lines.len(), 2);
    }
}
