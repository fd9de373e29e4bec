//! Markdown post-processing for agent outputs.
//!
//! Agent backends emit markdown with a mix of LaTeX delimiter conventions
//! and whitespace artifacts (BOM, NBSP, ideographic spaces, zero-width
//! spaces). [`clean_markdown_file`] normalizes a file in place into a
//! single `$`/`$$` convention with tidy spacing; [`merge_outputs`]
//! stitches per-runner output files into one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::debug;

/// Errors from [`merge_outputs`].
#[derive(Debug, Error)]
pub enum MarkdownError {
    #[error("Invalid merge pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("No files matched '{pattern}' under '{}'", .directory.display())]
    NoMatches { pattern: String, directory: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whitespace characters that show up in LLM output besides ASCII space.
const EXOTIC_SPACES: [char; 4] = ['\u{00A0}', '\u{3000}', '\u{200B}', '\u{FEFF}'];

/// Cleans one markdown file in place: UTF-8 in (a leading BOM is
/// tolerated and dropped), `\n`-terminated UTF-8 out.
pub fn clean_markdown_file(path: &Path) -> io::Result<()> {
    let content = fs::read_to_string(path)?;
    let cleaned = clean_markdown(&content);
    debug!(file = %path.display(), "Cleaned markdown file");
    fs::write(path, cleaned)
}

/// Content-level cleaner backing [`clean_markdown_file`]:
///
/// 1. `\[…\]` and `\(…\)` become `$$…$$` and `$…$`
/// 2. inline `$…$` spans lose doubled backslashes and exotic whitespace
/// 3. `$$…$$` blocks are reflowed onto their own lines
/// 4. line edges are trimmed outside fenced code blocks
/// 5. runs of blank lines collapse to a single one
pub fn clean_markdown(content: &str) -> String {
    let content = content.strip_prefix('\u{FEFF}').unwrap_or(content);

    let content = normalize_latex_delimiters(content);
    let content = normalize_math_spans(&content);
    let content = reflow_display_blocks(&content);
    let content = trim_lines_outside_fences(&content);
    let mut out = collapse_blank_lines(&content);

    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn normalize_latex_delimiters(content: &str) -> String {
    let display = Regex::new(r"(?s)\\\[(.*?)\\\]").expect("static regex");
    let content = display.replace_all(content, |caps: &regex::Captures| {
        format!("$${}$$", &caps[1])
    });

    let inline = Regex::new(r"(?s)\\\((.*?)\\\)").expect("static regex");
    inline
        .replace_all(&content, |caps: &regex::Captures| format!("${}$", &caps[1]))
        .into_owned()
}

/// Normalizes single-`$` math spans while leaving `$$` display blocks for
/// [`reflow_display_blocks`]. Walks the text by hand: the `regex` crate
/// has no look-around to keep a `$` from matching half a `$$` delimiter.
fn normalize_math_spans(content: &str) -> String {
    let bytes = content.as_bytes();
    let mut out = String::with_capacity(content.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            let next = memchr_dollar(bytes, i);
            out.push_str(&content[i..next]);
            i = next;
            continue;
        }

        if i + 1 < bytes.len() && bytes[i + 1] == b'$' {
            // Display block: copy verbatim through the closing `$$`.
            match find_double_dollar(bytes, i + 2) {
                Some(end) => {
                    out.push_str(&content[i..end + 2]);
                    i = end + 2;
                }
                None => {
                    out.push_str(&content[i..]);
                    break;
                }
            }
        } else {
            // Inline span: normalize the interior if it closes.
            match find_single_dollar(bytes, i + 1) {
                Some(end) => {
                    out.push('$');
                    out.push_str(&normalize_math_text(&content[i + 1..end]));
                    out.push('$');
                    i = end + 1;
                }
                None => {
                    out.push_str(&content[i..]);
                    break;
                }
            }
        }
    }

    out
}

fn memchr_dollar(bytes: &[u8], from: usize) -> usize {
    let mut i = from;
    while i < bytes.len() && bytes[i] != b'$' {
        i += 1;
    }
    i
}

fn find_double_dollar(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'$' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Finds the next lone `$`, skipping doubled `$$` pairs.
fn find_single_dollar(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'$' {
                i += 2;
            } else {
                return Some(i);
            }
        } else {
            i += 1;
        }
    }
    None
}

fn normalize_math_text(text: &str) -> String {
    let text = text.replace("\\\\", "\\");
    let text: String = text
        .chars()
        .map(|c| if EXOTIC_SPACES.contains(&c) { ' ' } else { c })
        .collect();
    text.trim().to_string()
}

/// Reflows every `$$…$$` block: one trimmed line per non-empty source
/// line, the block set off by blank lines.
fn reflow_display_blocks(content: &str) -> String {
    let block = Regex::new(r"(?s)\$\$(.*?)\$\$").expect("static regex");
    block
        .replace_all(content, |caps: &regex::Captures| {
            let body = normalize_block_text(&caps[1]);
            format!("\n\n$$\n{}\n$$\n\n", body)
        })
        .into_owned()
}

fn normalize_block_text(text: &str) -> String {
    let text = text.replace("\\\\", "\\");
    text.lines()
        .map(|line| {
            line.chars()
                .map(|c| if EXOTIC_SPACES.contains(&c) { ' ' } else { c })
                .collect::<String>()
        })
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Trims line-edge whitespace (exotic spaces included) everywhere except
/// inside fenced code blocks. Fence lines themselves only lose leading
/// whitespace, so an indented fence still opens.
fn trim_lines_outside_fences(content: &str) -> String {
    let fence = Regex::new(r"^\s*```").expect("static regex");
    let mut in_code_block = false;
    let mut lines = Vec::new();

    for line in content.lines() {
        if fence.is_match(line) {
            in_code_block = !in_code_block;
            lines.push(trim_leading(line));
        } else if in_code_block {
            lines.push(line.to_string());
        } else {
            lines.push(trim_edges(line));
        }
    }

    lines.join("\n")
}

fn is_strip_char(c: char) -> bool {
    c == ' ' || c == '\t' || EXOTIC_SPACES.contains(&c)
}

fn trim_edges(line: &str) -> String {
    line.trim_matches(is_strip_char).to_string()
}

fn trim_leading(line: &str) -> String {
    line.trim_start_matches(is_strip_char).to_string()
}

fn collapse_blank_lines(content: &str) -> String {
    let re = Regex::new(r"\n{3,}").expect("static regex");
    re.replace_all(content, "\n\n").into_owned()
}

/// Options for [`merge_outputs`].
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Text inserted between merged files.
    pub separator: String,
    /// Delete the source files after a successful merge.
    pub delete_sources: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            separator: "\n\n".to_string(),
            delete_sources: true,
        }
    }
}

/// Merges every file in `directory` whose name matches `pattern`
/// (case-insensitive, anchored at the start of the name) into
/// `merged_name`, ordered by the pattern's first numeric capture group and
/// then by file name. Returns the merged file's path.
pub fn merge_outputs(
    directory: &Path,
    pattern: &str,
    merged_name: &str,
    options: &MergeOptions,
) -> Result<PathBuf, MarkdownError> {
    let matcher = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| MarkdownError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;

    let mut files: Vec<(u64, String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(directory)?.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let Some(caps) = matcher.captures(&name) else {
            continue;
        };
        if caps.get(0).is_some_and(|m| m.start() == 0) {
            files.push((numeric_key(&caps), name, path));
        }
    }

    if files.is_empty() {
        return Err(MarkdownError::NoMatches {
            pattern: pattern.to_string(),
            directory: directory.to_path_buf(),
        });
    }
    files.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

    let mut parts = Vec::with_capacity(files.len());
    for (_, _, path) in &files {
        parts.push(fs::read_to_string(path)?);
    }
    let mut merged = parts.join(&options.separator);
    if !merged.is_empty() {
        merged.push('\n');
    }

    let merged_path = directory.join(merged_name);
    fs::write(&merged_path, merged)?;

    if options.delete_sources {
        for (_, _, path) in &files {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    debug!(merged = %merged_path.display(), sources = files.len(), "Merged outputs");
    Ok(merged_path)
}

/// First numeric capture group, or 0 when the pattern has none.
fn numeric_key(caps: &regex::Captures) -> u64 {
    caps.iter()
        .skip(1)
        .flatten()
        .find_map(|group| group.as_str().parse::<u64>().ok())
        .unwrap_or(0)
}
