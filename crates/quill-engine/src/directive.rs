//! Execution directive preprocessor.
//!
//! A submission is either one cell directive (`%%name args` on the first
//! line, the rest of the submission as its body) or a sequence of lines,
//! each of which is a shell escape (`!cmd`), a line directive
//! (`%name args`) or ordinary code. Directive names are validated here, up
//! front, so an unknown name fails the whole submission before anything runs.

use crate::error::DirectiveError;

/// Line directives the engine understands.
pub const LINE_MAGICS: &[&str] = &[
    "cd", "echo", "env", "history", "lsmagic", "pwd", "reset", "time", "who",
];

/// Cell directives the engine understands.
pub const CELL_MAGICS: &[&str] = &["bash", "capture", "sh", "time", "writefile"];

/// A parsed submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// `%%name args` followed by the cell body.
    Cell {
        name: String,
        args: String,
        body: String,
    },
    /// Line-by-line submission.
    Lines(Vec<Line>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `!cmd`, run through the shell.
    Shell(String),
    /// `%name args`.
    Magic { name: String, args: String },
    /// Ordinary code, kept verbatim.
    Code(String),
}

/// Classify a submission.
pub fn parse(code: &str) -> Result<Submission, DirectiveError> {
    let (first, rest) = match code.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (code, ""),
    };

    if let Some(header) = first.trim_start().strip_prefix("%%") {
        let (name, args) = split_name(header);
        if name.is_empty() {
            return Err(DirectiveError::Usage("cell magic name is missing".to_string()));
        }
        if !CELL_MAGICS.contains(&name) {
            return Err(DirectiveError::UnknownCellMagic(name.to_string()));
        }
        return Ok(Submission::Cell {
            name: name.to_string(),
            args: args.to_string(),
            body: rest.to_string(),
        });
    }

    code.lines().map(parse_line).collect::<Result<Vec<_>, _>>().map(Submission::Lines)
}

fn parse_line(line: &str) -> Result<Line, DirectiveError> {
    let trimmed = line.trim_start();

    if let Some(command) = trimmed.strip_prefix('!') {
        return Ok(Line::Shell(command.trim().to_string()));
    }

    if let Some(header) = trimmed.strip_prefix("%%") {
        let (name, _) = split_name(header);
        return Err(if CELL_MAGICS.contains(&name) {
            DirectiveError::Usage(format!(
                "cell magic `%%{}` must be on the first line of the cell",
                name
            ))
        } else {
            DirectiveError::UnknownCellMagic(name.to_string())
        });
    }

    if let Some(header) = trimmed.strip_prefix('%') {
        let (name, args) = split_name(header);
        if name.is_empty() {
            return Err(DirectiveError::Usage("line magic name is missing".to_string()));
        }
        if !LINE_MAGICS.contains(&name) {
            return Err(DirectiveError::UnknownLineMagic(name.to_string()));
        }
        return Ok(Line::Magic {
            name: name.to_string(),
            args: args.to_string(),
        });
    }

    Ok(Line::Code(line.to_string()))
}

/// Split `name rest of args` at the first whitespace.
fn split_name(header: &str) -> (&str, &str) {
    let header = header.trim();
    match header.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (header, ""),
    }
}
