use std::sync::LazyLock;

use regex::Regex;

/// Matches a line ending in a block scalar indicator, like `key: |`, `- >-` or `key: |2+`.
static BLOCK_SCALAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^\s*|[:-]\s+)[|>][0-9+-]*$").expect("failed to compile block scalar regex")
});

/// Removes YAML comments from `input`, so that variables mentioned in comments are not
/// substituted.
///
/// Full line comments are replaced by empty lines, trailing comments are cut off. A `#` only
/// starts a comment at the start of a line or after whitespace, and never inside a quoted
/// scalar. Block scalar bodies (`key: |`) are kept verbatim, as `#` is content there.
pub fn strip_comments(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut block_indent: Option<usize> = None;

    for line in input.split_inclusive('\n') {
        let (content, newline) = match line.strip_suffix('\n') {
            Some(content) => (content, "\n"),
            None => (line, ""),
        };
        let indent = content.len() - content.trim_start().len();

        if let Some(parent_indent) = block_indent {
            if content.trim().is_empty() || indent > parent_indent {
                output.push_str(line);
                continue;
            }
            block_indent = None;
        }

        let stripped = match comment_start(content) {
            Some(start) => content[..start].trim_end(),
            None => content,
        };
        if BLOCK_SCALAR_REGEX.is_match(stripped.trim_end()) {
            block_indent = Some(parent_column(content));
        }

        output.push_str(stripped);
        output.push_str(newline);
    }

    output
}

/// The column a block scalar body on the following lines must be indented beyond.
///
/// For `- key: |` this is the column of `key`, for a bare `- |` the column of the dash.
fn parent_column(line: &str) -> usize {
    let mut rest = line.trim_start();
    let mut column = line.len() - rest.len();

    while let Some(after_dash) = rest.strip_prefix('-') {
        let item = after_dash.trim_start();
        if item.len() == after_dash.len() || item.starts_with(['|', '>']) {
            break;
        }
        column += rest.len() - item.len();
        rest = item;
    }

    column
}

/// The byte offset of the `#` starting a comment in `line`, if any.
fn comment_start(line: &str) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut previous: Option<u8> = None;
    let bytes = line.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        match quote {
            Some(b'\'') if byte == b'\'' => {
                // '' is an escaped single quote
                if bytes.get(index + 1) == Some(&b'\'') {
                    index += 1;
                } else {
                    quote = None;
                }
            }
            Some(b'"') if byte == b'\\' => index += 1,
            Some(b'"') if byte == b'"' => quote = None,
            Some(_) => {}
            None => match byte {
                b'#' if previous.is_none_or(|p| p.is_ascii_whitespace()) => return Some(index),
                b'\'' | b'"' if starts_scalar(previous) => quote = Some(byte),
                _ => {}
            },
        }

        previous = Some(byte);
        index += 1;
    }

    None
}

/// Quotes only delimit a scalar if they are its first character, `it's` is plain text.
fn starts_scalar(previous: Option<u8>) -> bool {
    previous.is_none_or(|p| p.is_ascii_whitespace() || matches!(p, b'[' | b'{' | b','))
}
