//! LCS line diff, diff statistics and unified diff rendering.
//!
//! The DP table is `O(m·n)` in both time and memory. That is fine for source files and
//! unsuitable for multi-megabyte blobs, so inputs whose table would exceed [`MAX_LCS_CELLS`]
//! are diffed as a whole-file rewrite instead.

use std::fmt::Write as _;

use serde::Serialize;

/// Largest LCS table (`(m + 1) * (n + 1)` entries of 4 bytes) built before falling back to a
/// whole-file rewrite.
pub const MAX_LCS_CELLS: usize = 16 * 1024 * 1024;

/// Line counts derived from a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub added_lines: usize,
    pub deleted_lines: usize,
    pub context_lines: usize,
}

impl DiffStats {
    #[must_use]
    pub fn total_changes(&self) -> usize {
        self.added_lines + self.deleted_lines
    }

    #[must_use]
    pub fn from_ops(ops: &[DiffOp<'_>]) -> Self {
        ops.iter().fold(Self::default(), |mut stats, op| {
            match op {
                DiffOp::Same(_) => stats.context_lines += 1,
                DiffOp::Added(_) => stats.added_lines += 1,
                DiffOp::Deleted(_) => stats.deleted_lines += 1,
            }
            stats
        })
    }
}

impl std::ops::Add for DiffStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            added_lines: self.added_lines + rhs.added_lines,
            deleted_lines: self.deleted_lines + rhs.deleted_lines,
            context_lines: self.context_lines + rhs.context_lines,
        }
    }
}

/// One step of an edit script that turns the old line sequence into the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp<'a> {
    Same(&'a str),
    Added(&'a str),
    Deleted(&'a str),
}

impl<'a> DiffOp<'a> {
    #[must_use]
    pub fn line(&self) -> &'a str {
        match *self {
            Self::Same(l) | Self::Added(l) | Self::Deleted(l) => l,
        }
    }

    fn prefix(&self) -> char {
        match self {
            Self::Same(_) => ' ',
            Self::Added(_) => '+',
            Self::Deleted(_) => '-',
        }
    }
}

/// Compute the edit script between two line sequences.
///
/// Backtracking walks from `(m, n)` to the origin; on a mismatch it takes `Added` whenever
/// `lcs[i][j-1] >= lcs[i-1][j]`, so a substitution renders as the deletion followed by the
/// addition. Callers rely on this ordering being stable.
///
/// Above [`MAX_LCS_CELLS`] every old line is deleted and every new line added.
#[must_use]
pub fn diff_lines<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<DiffOp<'a>> {
    let (m, n) = (old.len(), new.len());
    let width = n + 1;
    if (m + 1).saturating_mul(width) > MAX_LCS_CELLS {
        tracing::warn!(
            old_lines = m,
            new_lines = n,
            "diff too large for LCS, reporting a full rewrite"
        );
        return rewrite(old, new);
    }
    let mut lcs = vec![0u32; (m + 1) * width];

    for i in 1..=m {
        for j in 1..=n {
            lcs[i * width + j] = if old[i - 1] == new[j - 1] {
                lcs[(i - 1) * width + j - 1] + 1
            } else {
                lcs[(i - 1) * width + j].max(lcs[i * width + j - 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(m.max(n));
    let (mut i, mut j) = (m, n);
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && old[i - 1] == new[j - 1] {
            ops.push(DiffOp::Same(old[i - 1]));
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || lcs[i * width + j - 1] >= lcs[(i - 1) * width + j]) {
            ops.push(DiffOp::Added(new[j - 1]));
            j -= 1;
        } else {
            ops.push(DiffOp::Deleted(old[i - 1]));
            i -= 1;
        }
    }

    ops.reverse();
    ops
}

fn rewrite<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<DiffOp<'a>> {
    old.iter()
        .map(|l| DiffOp::Deleted(*l))
        .chain(new.iter().map(|l| DiffOp::Added(*l)))
        .collect()
}

/// Line diff between two optional texts. A missing side is an empty sequence.
#[must_use]
pub fn diff<'a>(old: Option<&'a str>, new: Option<&'a str>) -> Vec<DiffOp<'a>> {
    let old: Vec<&str> = old.map(|t| t.lines().collect()).unwrap_or_default();
    let new: Vec<&str> = new.map(|t| t.lines().collect()).unwrap_or_default();
    diff_lines(&old, &new)
}

#[must_use]
pub fn calculate_diff_stats(old: Option<&str>, new: Option<&str>) -> DiffStats {
    match (old, new) {
        (None, None) => DiffStats::default(),
        (None, Some(new)) => DiffStats {
            added_lines: new.lines().count(),
            ..DiffStats::default()
        },
        (Some(old), None) => DiffStats {
            deleted_lines: old.lines().count(),
            ..DiffStats::default()
        },
        (Some(_), Some(_)) => DiffStats::from_ops(&diff(old, new)),
    }
}

/// Render a unified diff with `--- a/<path>` / `+++ b/<path>` headers.
///
/// The whole edit script is emitted as one hunk. `context_lines` is accepted for call-site
/// compatibility and does not split the output into multiple hunks. When both sides are
/// empty only the headers are produced.
#[must_use]
pub fn generate_unified_diff(
    old: Option<&str>,
    new: Option<&str>,
    path: &str,
    context_lines: usize,
) -> String {
    let _ = context_lines;
    let ops = diff(old, new);

    let mut out = String::new();
    let _ = writeln!(out, "--- a/{path}");
    let _ = writeln!(out, "+++ b/{path}");
    if ops.is_empty() {
        return out;
    }

    let stats = DiffStats::from_ops(&ops);
    let old_count = stats.context_lines + stats.deleted_lines;
    let new_count = stats.context_lines + stats.added_lines;
    let old_start = usize::from(old_count > 0);
    let new_start = usize::from(new_count > 0);

    let _ = writeln!(out, "@@ -{old_start},{old_count} +{new_start},{new_count} @@");
    for op in &ops {
        let _ = writeln!(out, "{}{}", op.prefix(), op.line());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn replay<'a>(old: &[&'a str], ops: &[DiffOp<'a>]) -> Vec<&'a str> {
        let mut cursor = 0;
        let mut rebuilt = Vec::new();
        for op in ops {
            match op {
                DiffOp::Same(line) => {
                    assert_eq!(old[cursor], *line);
                    rebuilt.push(*line);
                    cursor += 1;
                }
                DiffOp::Deleted(line) => {
                    assert_eq!(old[cursor], *line);
                    cursor += 1;
                }
                DiffOp::Added(line) => rebuilt.push(*line),
            }
        }
        assert_eq!(cursor, old.len());
        rebuilt
    }

    #[test]
    fn substitution_stats() {
        let stats = calculate_diff_stats(Some("a\nb\nc"), Some("a\nx\nc"));
        assert_eq!(
            stats,
            DiffStats {
                added_lines: 1,
                deleted_lines: 1,
                context_lines: 2,
            }
        );
        assert_eq!(stats.total_changes(), 2);
    }

    #[test]
    fn missing_sides() {
        assert_eq!(calculate_diff_stats(None, None), DiffStats::default());
        assert_eq!(calculate_diff_stats(None, Some("a\nb")).added_lines, 2);
        assert_eq!(calculate_diff_stats(Some("a\nb\nc"), None).deleted_lines, 3);
    }

    #[test]
    fn substitution_orders_delete_before_add() {
        let ops = diff(Some("a\nb\nc"), Some("a\nx\nc"));
        assert_eq!(
            ops,
            vec![
                DiffOp::Same("a"),
                DiffOp::Deleted("b"),
                DiffOp::Added("x"),
                DiffOp::Same("c"),
            ]
        );
    }

    #[test]
    fn tie_break_prefers_added_when_backtracking() {
        // both alignments keep one line; the tie resolves toward Added while backtracking
        let ops = diff_lines(&["a", "b"], &["b", "a"]);
        assert_eq!(
            ops,
            vec![DiffOp::Deleted("a"), DiffOp::Same("b"), DiffOp::Added("a")]
        );
    }

    #[test]
    fn identical_inputs_are_all_context() {
        let ops = diff(Some("x\ny"), Some("x\ny"));
        assert!(ops.iter().all(|op| matches!(op, DiffOp::Same(_))));
    }

    #[test]
    fn unified_diff_for_edit() {
        let out = generate_unified_diff(Some("a\nb\nc\n"), Some("a\nx\nc\n"), "src/lib.rs", 3);
        insta::assert_snapshot!(out, @r"
        --- a/src/lib.rs
        +++ b/src/lib.rs
        @@ -1,3 +1,3 @@
         a
        -b
        +x
         c
        ");
    }

    #[test]
    fn unified_diff_for_new_file() {
        let out = generate_unified_diff(None, Some("one\ntwo"), "new.txt", 3);
        assert_eq!(out, "--- a/new.txt\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+one\n+two\n");
    }

    #[test]
    fn unified_diff_for_deleted_file() {
        let out = generate_unified_diff(Some("gone"), None, "old.txt", 3);
        assert_eq!(out, "--- a/old.txt\n+++ b/old.txt\n@@ -1,1 +0,0 @@\n-gone\n");
    }

    #[test]
    fn unified_diff_of_empty_inputs_is_headers_only() {
        let out = generate_unified_diff(Some(""), None, "empty", 3);
        assert_eq!(out, "--- a/empty\n+++ b/empty\n");
    }

    #[test]
    fn oversized_inputs_degrade_to_rewrite() {
        let old: String = (0..5000).map(|i| format!("line {i}\n")).collect();
        let new: String = (0..5000).map(|i| format!("line {}\n", i + 1)).collect();

        let stats = calculate_diff_stats(Some(&old), Some(&new));
        assert_eq!(
            stats,
            DiffStats {
                added_lines: 5000,
                deleted_lines: 5000,
                context_lines: 0,
            }
        );

        let out = generate_unified_diff(Some(&old), Some(&new), "big.txt", 3);
        assert!(out.starts_with("--- a/big.txt\n+++ b/big.txt\n@@ -1,5000 +1,5000 @@\n-line 0\n"));
        assert!(out.ends_with("+line 5000\n"));
    }

    #[test]
    fn inputs_under_the_limit_keep_lcs() {
        let old: Vec<String> = (0..1000).map(|i| format!("line {i}")).collect();
        let old: Vec<&str> = old.iter().map(String::as_str).collect();
        let mut new = old.clone();
        new[500] = "changed";
        let stats = DiffStats::from_ops(&diff_lines(&old, &new));
        assert_eq!(stats.context_lines, 999);
        assert_eq!(stats.total_changes(), 2);
    }

    #[test]
    fn stats_add() {
        let a = DiffStats {
            added_lines: 1,
            deleted_lines: 2,
            context_lines: 3,
        };
        assert_eq!((a + a).context_lines, 6);
    }

    proptest! {
        #[test]
        fn replaying_ops_rebuilds_new(
            old in prop::collection::vec("[abc]{0,2}", 0..12),
            new in prop::collection::vec("[abc]{0,2}", 0..12),
        ) {
            let old: Vec<&str> = old.iter().map(String::as_str).collect();
            let new: Vec<&str> = new.iter().map(String::as_str).collect();
            let ops = diff_lines(&old, &new);
            prop_assert_eq!(replay(&old, &ops), new);
        }

        #[test]
        fn stats_balance_line_counts(
            old in prop::collection::vec("[ab]", 0..10),
            new in prop::collection::vec("[ab]", 0..10),
        ) {
            let old: Vec<&str> = old.iter().map(String::as_str).collect();
            let new: Vec<&str> = new.iter().map(String::as_str).collect();
            let stats = DiffStats::from_ops(&diff_lines(&old, &new));
            prop_assert_eq!(stats.context_lines + stats.added_lines, new.len());
            prop_assert_eq!(stats.context_lines + stats.deleted_lines, old.len());
        }
    }
}
