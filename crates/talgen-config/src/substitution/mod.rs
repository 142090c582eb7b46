//! Environment variable interpolation and file reference resolution.
//!
//! Variables come from an explicit [`SubstitutionContext`] rather than from the process
//! environment directly, so that every run (and every node of a run) works on its own
//! isolated set of values.
//!
//! The supported forms follow POSIX parameter expansion:
//!
//! | form | result |
//! |---|---|
//! | `$VAR`, `${VAR}` | the value, error if unset |
//! | `${VAR:-word}` | the value, `word` if unset or empty |
//! | `${VAR-word}` | the value, `word` if unset |
//! | `${VAR:=word}` | like `:-`, additionally assigns `word` to `VAR` |
//! | `${VAR=word}` | like `-`, additionally assigns `word` to `VAR` |
//! | `${VAR:+word}` | `word` if set and non-empty, nothing otherwise |
//! | `${VAR+word}` | `word` if set, nothing otherwise |
//! | `${VAR:?message}` | the value, error with `message` if unset or empty |
//! | `$$` | a literal `$` |
//!
//! `word` is itself expanded, but only when it is used.
use std::{collections::BTreeMap, path::Path};

use snafu::{OptionExt, ResultExt, Snafu, ensure};

mod comments;
mod paths;

pub use comments::strip_comments;
pub use paths::{FILE_REFERENCE_KEYS, resolve_relative_paths};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("variable {name:?} on line {line} is not set"))]
    UnsetVariable { name: String, line: usize },

    #[snafu(display("variable {name:?} on line {line} is required: {message}"))]
    RequiredVariable {
        name: String,
        message: String,
        line: usize,
    },

    #[snafu(display("unterminated variable expression on line {line}"))]
    UnterminatedExpression { line: usize },

    #[snafu(display("invalid variable expression \"${{{expression}}}\" on line {line}"))]
    InvalidExpression { expression: String, line: usize },

    #[snafu(display("failed to read env file {path:?}"))]
    ReadEnvFile {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("invalid line {line} in env file {path:?}: expected KEY=VALUE"))]
    InvalidEnvLine { path: std::path::PathBuf, line: usize },
}

/// The variables visible to [`substitute`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubstitutionContext {
    values: BTreeMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots the current process environment. Variables which are not valid UTF-8 are
    /// skipped.
    pub fn from_process_env() -> Self {
        Self {
            values: std::env::vars_os()
                .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Inserts `value` unless `name` is already defined, returns whether it was inserted.
    pub fn set_if_absent(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let mut inserted = false;
        self.values.entry(name.into()).or_insert_with(|| {
            inserted = true;
            value.into()
        });
        inserted
    }

    /// Loads a dotenv style file.
    ///
    /// Variables already defined (for example by the process environment, or by an earlier
    /// env file) take precedence and are not overwritten. Returns the number of variables
    /// which were added.
    pub fn load_env_file(&mut self, path: &Path) -> Result<usize, Error> {
        let contents = std::fs::read_to_string(path).context(ReadEnvFileSnafu { path })?;
        let mut added = 0;

        for (name, value) in parse_env_file(&contents, path)? {
            if self.set_if_absent(name, value) {
                added += 1;
            }
        }

        tracing::debug!(?path, added, "loaded env file");
        Ok(added)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SubstitutionContext {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Parses `KEY=VALUE` lines, skipping blank lines and `#` comments.
///
/// A leading `export ` is ignored. Values may be wrapped in single quotes (taken literally)
/// or double quotes (supporting `\n`, `\"` and `\\` escapes). Unquoted values end at a ` #`
/// comment.
fn parse_env_file(contents: &str, path: &Path) -> Result<Vec<(String, String)>, Error> {
    let mut entries = Vec::new();

    for (index, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").map_or(line, str::trim_start);
        let (name, value) = line
            .split_once('=')
            .context(InvalidEnvLineSnafu { path, line: index + 1 })?;
        let name = name.trim();
        ensure!(is_valid_name(name), InvalidEnvLineSnafu { path, line: index + 1 });

        entries.push((name.to_owned(), unquote(value.trim())));
    }

    Ok(entries)
}

fn unquote(value: &str) -> String {
    if let Some(inner) = value
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return inner.to_owned();
    }

    if let Some(inner) = value.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
        let mut unescaped = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match (c, chars.clone().next()) {
                ('\\', Some('n')) => {
                    unescaped.push('\n');
                    chars.next();
                }
                ('\\', Some(escaped @ ('"' | '\\'))) => {
                    unescaped.push(escaped);
                    chars.next();
                }
                (c, _) => unescaped.push(c),
            }
        }
        return unescaped;
    }

    match value.find(" #") {
        Some(comment) => value[..comment].trim_end().to_owned(),
        None => value.to_owned(),
    }
}

/// Replaces every variable expression in `input` with its value from `context`.
///
/// `:=` and `=` expressions assign into `context`, so later expressions see the assigned value.
pub fn substitute(input: &str, context: &mut SubstitutionContext) -> Result<String, Error> {
    expand(input, 1, context)
}

fn expand(input: &str, first_line: usize, context: &mut SubstitutionContext) -> Result<String, Error> {
    let mut output = String::with_capacity(input.len());
    let mut line = first_line;
    let mut rest = input;

    while let Some(offset) = rest.find('$') {
        let literal = &rest[..offset];
        output.push_str(literal);
        line += literal.matches('\n').count();

        let tail = &rest[offset + 1..];
        rest = match tail.as_bytes().first() {
            Some(b'$') => {
                output.push('$');
                &tail[1..]
            }
            Some(b'{') => {
                let braced = &tail[1..];
                let end = closing_brace(braced).context(UnterminatedExpressionSnafu { line })?;
                let body = &braced[..end];
                output.push_str(&expand_braced(body, line, context)?);
                line += body.matches('\n').count();
                &braced[end + 1..]
            }
            Some(first) if is_name_start(*first) => {
                let len = tail.bytes().take_while(|b| is_name_char(*b)).count();
                let name = &tail[..len];
                let value = context.get(name).context(UnsetVariableSnafu { name, line })?;
                output.push_str(value);
                &tail[len..]
            }
            _ => {
                output.push('$');
                tail
            }
        };
    }

    output.push_str(rest);
    Ok(output)
}

fn expand_braced(
    body: &str,
    line: usize,
    context: &mut SubstitutionContext,
) -> Result<String, Error> {
    let name_len = body.bytes().take_while(|b| is_name_char(*b)).count();
    let (name, expression) = body.split_at(name_len);
    ensure!(
        is_valid_name(name),
        InvalidExpressionSnafu {
            expression: body,
            line
        }
    );

    let value = context.get(name).map(ToOwned::to_owned);
    if expression.is_empty() {
        return value.context(UnsetVariableSnafu { name, line });
    }

    let (null_is_unset, operation) = match expression.strip_prefix(':') {
        Some(operation) => (true, operation),
        None => (false, expression),
    };
    let is_set = value
        .as_deref()
        .is_some_and(|value| !(null_is_unset && value.is_empty()));

    let mut chars = operation.chars();
    let operator = chars.next();
    let word = chars.as_str();

    match operator {
        Some('-') if is_set => Ok(value.unwrap_or_default()),
        Some('-') => expand(word, line, context),
        Some('=') if is_set => Ok(value.unwrap_or_default()),
        Some('=') => {
            let assigned = expand(word, line, context)?;
            context.set(name, assigned.clone());
            Ok(assigned)
        }
        Some('+') if is_set => expand(word, line, context),
        Some('+') => Ok(String::new()),
        Some('?') if is_set => Ok(value.unwrap_or_default()),
        Some('?') => RequiredVariableSnafu {
            name,
            message: expand(word, line, context)?,
            line,
        }
        .fail(),
        _ => InvalidExpressionSnafu {
            expression: body,
            line,
        }
        .fail(),
    }
}

/// Returns the index of the `}` closing the expression `input` starts in.
fn closing_brace(input: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (index, byte) in input.bytes().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' if depth == 0 => return Some(index),
            b'}' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn is_name_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_name_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn is_valid_name(name: &str) -> bool {
    name.as_bytes().first().is_some_and(|first| is_name_start(*first))
        && name.bytes().all(is_name_char)
}
