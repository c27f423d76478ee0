//! Line diffing, diff parsing and terminal output cleanup.

pub mod ansi;
pub mod diff;
pub mod parser;

pub use ansi::{strip, strip_and_normalize};
pub use diff::{
    DiffOp, DiffStats, MAX_LCS_CELLS, calculate_diff_stats, diff_lines, generate_unified_diff,
};
pub use parser::{DiffHunk, DiffLine, DiffLineType, DiffParser, FileDiff};
