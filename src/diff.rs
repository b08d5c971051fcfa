//! Line-level diff of a single file
//!
//! Produces unified-diff style hunks for one path across two roots.
//!
//! ## Overview
//!
//! Lines are matched with Myers' algorithm from the `similar` crate, which
//! needs memory linear in the number of lines, then grouped into hunks with a
//! configurable amount of surrounding context. Hunk headers follow the usual
//! `@@ -from,count +to,count @@` convention. A comparison that runs past
//! [`DIFF_DEADLINE`] settles for a valid but possibly longer edit script.
//!
//! Files that contain a zero byte within their first 8 KiB are treated as
//! binary and only their sizes are reported. The same applies to files larger
//! than [`DiffOptions::max_file_size`]. A path missing on one side compares as
//! an empty file on that side.
//!
//! ## Examples
//!
//! ```rust
//! use retrace::diff::compute_line_diff;
//! use retrace::types::DiffOptions;
//!
//! let hunks = compute_line_diff(b"one\ntwo\nthree", b"one\n2\nthree", &DiffOptions::default());
//! assert_eq!(hunks.len(), 1);
//! assert_eq!((hunks[0].from_line, hunks[0].from_count), (1, 3));
//! ```

use crate::error::{Result, RetraceError};
use crate::types::{DiffHunk, DiffOptions, FileDiff, LineChange};
use similar::{Algorithm, DiffOp};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::trace;

/// Bytes inspected by the binary heuristic
const BINARY_PROBE_LEN: usize = 8192;

/// Time allowed for finding a minimal edit script
pub const DIFF_DEADLINE: Duration = Duration::from_secs(2);

/// Compute hunks between two text contents
///
/// Invalid UTF-8 is replaced rather than rejected.
pub fn compute_line_diff(
    old_content: &[u8],
    new_content: &[u8],
    options: &DiffOptions,
) -> Vec<DiffHunk> {
    let old_text = String::from_utf8_lossy(old_content);
    let new_text = String::from_utf8_lossy(new_content);
    let old_lines: Vec<&str> = old_text.lines().collect();
    let new_lines: Vec<&str> = new_text.lines().collect();

    let ops = edit_script(&old_lines, &new_lines, options.ignore_whitespace);
    group_hunks(&ops, &old_lines, &new_lines, options.context_lines)
}

/// One step of the edit script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Keep(usize, usize),
    Delete(usize),
    Insert(usize),
}

impl Op {
    fn is_change(self) -> bool {
        !matches!(self, Op::Keep(..))
    }
}

/// Line keys used for matching; trimmed when whitespace is ignored
fn match_keys<'a>(lines: &[&'a str], ignore_whitespace: bool) -> Vec<&'a str> {
    lines
        .iter()
        .map(|&line| if ignore_whitespace { line.trim() } else { line })
        .collect()
}

/// Per-line edit script
///
/// Deletions are emitted before insertions within a changed region.
fn edit_script(old: &[&str], new: &[&str], ignore_whitespace: bool) -> Vec<Op> {
    let old_keys = match_keys(old, ignore_whitespace);
    let new_keys = match_keys(new, ignore_whitespace);
    let deadline = Instant::now() + DIFF_DEADLINE;
    let diff_ops = similar::capture_diff_slices_deadline(
        Algorithm::Myers,
        &old_keys,
        &new_keys,
        Some(deadline),
    );

    let mut ops = Vec::with_capacity(old.len().max(new.len()));
    for diff_op in diff_ops {
        match diff_op {
            DiffOp::Equal {
                old_index,
                new_index,
                len,
            } => ops.extend((0..len).map(|k| Op::Keep(old_index + k, new_index + k))),
            DiffOp::Delete {
                old_index, old_len, ..
            } => ops.extend((old_index..old_index + old_len).map(Op::Delete)),
            DiffOp::Insert {
                new_index, new_len, ..
            } => ops.extend((new_index..new_index + new_len).map(Op::Insert)),
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                ops.extend((old_index..old_index + old_len).map(Op::Delete));
                ops.extend((new_index..new_index + new_len).map(Op::Insert));
            }
        }
    }
    ops
}

/// Group an edit script into hunks, merging changes whose context overlaps
fn group_hunks(ops: &[Op], old: &[&str], new: &[&str], context: usize) -> Vec<DiffHunk> {
    let change_positions: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.is_change())
        .map(|(idx, _)| idx)
        .collect();

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for pos in change_positions {
        let start = pos.saturating_sub(context);
        let end = (pos + context + 1).min(ops.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => ranges.push((start, end)),
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| build_hunk(ops, start, end, old, new))
        .collect()
}

fn build_hunk(ops: &[Op], start: usize, end: usize, old: &[&str], new: &[&str]) -> DiffHunk {
    // Lines of each side consumed before the hunk
    let old_before = ops[..start].iter().filter(|op| !matches!(op, Op::Insert(_))).count();
    let new_before = ops[..start].iter().filter(|op| !matches!(op, Op::Delete(_))).count();

    let mut changes = Vec::with_capacity(end - start);
    let (mut from_count, mut to_count) = (0, 0);
    for op in &ops[start..end] {
        match *op {
            Op::Keep(o, _) => {
                from_count += 1;
                to_count += 1;
                changes.push(LineChange::Context(o + 1, old[o].to_string()));
            }
            Op::Delete(o) => {
                from_count += 1;
                changes.push(LineChange::Deleted(o + 1, old[o].to_string()));
            }
            Op::Insert(n) => {
                to_count += 1;
                changes.push(LineChange::Added(n + 1, new[n].to_string()));
            }
        }
    }

    // An empty side points at the line before the hunk
    let line = |before: usize, count: usize| if count == 0 { before } else { before + 1 };
    DiffHunk {
        from_line: line(old_before, from_count),
        from_count,
        to_line: line(new_before, to_count),
        to_count,
        changes,
    }
}

/// Whether content looks binary: a zero byte within the first 8 KiB
pub fn is_binary_content(content: &[u8]) -> bool {
    content[..content.len().min(BINARY_PROBE_LEN)].contains(&0)
}

/// Size of a path without following symlinks, `None` if it does not exist
fn side_size(path: &Path) -> Result<Option<u64>> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => Err(RetraceError::precondition(format!(
            "{:?} is a directory",
            path
        ))),
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Content of one side; a symlink compares by its target
fn side_content(path: &Path) -> Result<Vec<u8>> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        Ok(fs::read_link(path)?.to_string_lossy().into_owned().into_bytes())
    } else {
        Ok(fs::read(path)?)
    }
}

/// Compare `relative` between two materialized roots
///
/// # Errors
///
/// - [`RetraceError::FileNotFound`] if the path exists on neither side
/// - [`RetraceError::Io`] if an existing side cannot be read
pub fn diff_file(
    relative: &Path,
    from_root: &Path,
    to_root: &Path,
    versions: (u64, u64),
    options: &DiffOptions,
) -> Result<FileDiff> {
    let (from_version, to_version) = versions;
    let from_path = from_root.join(relative);
    let to_path = to_root.join(relative);
    let from_size = side_size(&from_path)?;
    let to_size = side_size(&to_path)?;

    if from_size.is_none() && to_size.is_none() {
        return Err(RetraceError::FileNotFound {
            version: to_version,
            path: relative.to_path_buf(),
        });
    }

    let mut diff = FileDiff {
        path: relative.to_path_buf(),
        from_version,
        to_version,
        from_size,
        to_size,
        is_binary: false,
        too_large: false,
        hunks: Vec::new(),
        lines_added: 0,
        lines_deleted: 0,
    };

    if from_size.max(to_size).unwrap_or(0) > options.max_file_size {
        trace!("{:?} exceeds the diff size limit", relative);
        diff.too_large = true;
        return Ok(diff);
    }

    let old_content = match from_size {
        Some(_) => side_content(&from_path)?,
        None => Vec::new(),
    };
    let new_content = match to_size {
        Some(_) => side_content(&to_path)?,
        None => Vec::new(),
    };

    if is_binary_content(&old_content) || is_binary_content(&new_content) {
        diff.is_binary = true;
        return Ok(diff);
    }

    diff.hunks = compute_line_diff(&old_content, &new_content, options);
    for change in diff.hunks.iter().flat_map(|h| &h.changes) {
        match change {
            LineChange::Added(..) => diff.lines_added += 1,
            LineChange::Deleted(..) => diff.lines_deleted += 1,
            LineChange::Context(..) => {}
        }
    }
    Ok(diff)
}

fn size_label(size: Option<u64>) -> String {
    size.map(crate::utils::format_bytes)
        .unwrap_or_else(|| "absent".to_string())
}

/// Render a file diff as unified diff text
///
/// Binary and oversized files render as a one-line size summary.
pub fn render_unified(diff: &FileDiff) -> String {
    let path = diff.path.display();
    let mut out = String::new();

    if diff.is_binary || diff.too_large {
        let what = if diff.is_binary { "Binary files" } else { "Files" };
        let _ = writeln!(
            out,
            "{} a/{} and b/{} differ ({} -> {})",
            what,
            path,
            path,
            size_label(diff.from_size),
            size_label(diff.to_size)
        );
        return out;
    }
    if diff.hunks.is_empty() {
        return out;
    }

    let _ = match diff.from_size {
        Some(_) => writeln!(out, "--- a/{}", path),
        None => writeln!(out, "--- /dev/null"),
    };
    let _ = match diff.to_size {
        Some(_) => writeln!(out, "+++ b/{}", path),
        None => writeln!(out, "+++ /dev/null"),
    };

    for hunk in &diff.hunks {
        let _ = writeln!(
            out,
            "@@ -{},{} +{},{} @@",
            hunk.from_line, hunk.from_count, hunk.to_line, hunk.to_count
        );
        for change in &hunk.changes {
            let _ = match change {
                LineChange::Context(_, line) => writeln!(out, " {}", line),
                LineChange::Deleted(_, line) => writeln!(out, "-{}", line),
                LineChange::Added(_, line) => writeln!(out, "+{}", line),
            };
        }
    }
    out
}
