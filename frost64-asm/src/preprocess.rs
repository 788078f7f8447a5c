// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flattens `%include` directives and strips comments before the lexer
//! ever sees the source, so every later stage can work line-by-line
//! without caring which file a line actually came from.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AssembleError, SourceLocation};

const MAX_INCLUDE_DEPTH: usize = 32;

/// One line of program text, tagged with where it came from for
/// diagnostics raised against it later in the pipeline.
pub struct SourceLine {
    pub file: String,
    pub line: usize,
    pub text: String,
}

pub fn process(source: &str, file_name: &str, include_dir: &Path) -> Result<Vec<SourceLine>, AssembleError> {
    let mut out = Vec::new();
    expand(source, file_name, include_dir, 0, &mut out)?;
    Ok(out)
}

fn expand(
    source: &str,
    file_name: &str,
    include_dir: &Path,
    depth: usize,
    out: &mut Vec<SourceLine>,
) -> Result<(), AssembleError> {
    for (index, raw_line) in source.lines().enumerate() {
        let line_no = index + 1;
        let stripped = strip_comment(raw_line);
        let trimmed = stripped.trim();
        if let Some(rest) = trimmed.strip_prefix("%include") {
            let target = parse_include_argument(rest);
            let location = SourceLocation { file: file_name.to_string(), line: line_no };
            if depth + 1 >= MAX_INCLUDE_DEPTH {
                return Err(AssembleError::IncludeDepth(location));
            }
            let path = include_dir.join(&target);
            let contents = fs::read_to_string(&path)
                .map_err(|e| AssembleError::Include(location, path.clone(), e))?;
            let nested_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| include_dir.to_path_buf());
            expand(&contents, &target, &nested_dir, depth + 1, out)?;
            continue;
        }
        out.push(SourceLine { file: file_name.to_string(), line: line_no, text: stripped });
    }
    Ok(())
}

fn parse_include_argument(rest: &str) -> String {
    let rest = rest.trim();
    rest.trim_matches('"').trim_matches('\'').to_string()
}

/// Strips a `;` line comment, honouring quoted strings so a semicolon
/// inside `"..."` or `'...'` doesn't truncate the line.
fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    let mut in_string: Option<char> = None;
    while let Some(c) = chars.next() {
        match in_string {
            Some(quote) => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == quote {
                    in_string = None;
                }
            }
            None => {
                if c == ';' {
                    break;
                }
                if c == '"' || c == '\'' {
                    in_string = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_comment() {
        assert_eq!(strip_comment("add r0, r1 ; add them"), "add r0, r1 ");
    }

    #[test]
    fn keeps_semicolon_inside_string() {
        assert_eq!(strip_comment("db \"a;b\" ; real comment"), "db \"a;b\" ");
    }

    #[test]
    fn flattens_multiple_lines() {
        let lines = process("nop\nhlt\n", "main.asm", Path::new(".")).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text.trim(), "nop");
        assert_eq!(lines[1].line, 2);
    }
}
