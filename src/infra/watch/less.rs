//! A small LESS subset: `@variable` declarations and references, `//` line
//! comments, and a brace balance check. Nesting, mixins and operations pass
//! through untouched.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LessError {
    #[error("line {line}: undefined variable @{name}")]
    UndefinedVariable { name: String, line: usize },
    #[error("line {line}: unmatched closing brace")]
    UnexpectedClose { line: usize },
    #[error("line {line}: block is never closed")]
    Unclosed { line: usize },
    #[error("line {line}: unterminated string")]
    UnterminatedString { line: usize },
}

/// CSS at-rules that must never be read as variable references.
const AT_RULES: &[&str] = &[
    "media",
    "import",
    "charset",
    "font-face",
    "keyframes",
    "-webkit-keyframes",
    "-moz-keyframes",
    "supports",
    "page",
    "namespace",
    "document",
    "viewport",
];

pub fn compile(source: &str) -> Result<String, LessError> {
    let lines = source
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let stripped = strip_line(line);
            // A line that held only a comment disappears entirely.
            (!stripped.trim().is_empty() || line.trim().is_empty()).then_some((index + 1, stripped))
        })
        .collect::<Vec<_>>();
    check_braces(&lines)?;

    let mut variables: HashMap<String, String> = HashMap::new();
    let mut output = Vec::with_capacity(lines.len());
    for (number, line) in lines {
        if let Some((name, raw_value)) = declaration(line) {
            let value = substitute(raw_value.trim(), &variables, number)?;
            variables.insert(name.to_string(), value);
            continue;
        }
        output.push(substitute(line, &variables, number)?);
    }

    let mut css = output.join("\n");
    if source.ends_with('\n') && !css.is_empty() {
        css.push('\n');
    }
    Ok(css)
}

/// `@name: value;` on a line of its own.
fn declaration(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim().strip_prefix('@')?;
    let (name, tail) = rest.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(is_ident) || AT_RULES.contains(&name) {
        return None;
    }
    let value = tail.trim().strip_suffix(';')?;
    Some((name, value))
}

fn is_ident(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'
}

fn substitute(
    line: &str,
    variables: &HashMap<String, String>,
    number: usize,
) -> Result<String, LessError> {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((start, ch)) = chars.next() {
        if let Some(open) = quote {
            out.push(ch);
            if ch == '\\' {
                if let Some((_, escaped)) = chars.next() {
                    out.push(escaped);
                }
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                out.push(ch);
            }
            '@' => {
                let mut end = start + 1;
                while let Some(&(index, next)) = chars.peek() {
                    if !is_ident(next) {
                        break;
                    }
                    end = index + next.len_utf8();
                    chars.next();
                }
                let name = &line[start + 1..end];
                if name.is_empty() || AT_RULES.contains(&name) {
                    out.push_str(&line[start..end]);
                } else if let Some(value) = variables.get(name) {
                    out.push_str(value);
                } else {
                    return Err(LessError::UndefinedVariable {
                        name: name.to_string(),
                        line: number,
                    });
                }
            }
            _ => out.push(ch),
        }
    }

    if quote.is_some() {
        return Err(LessError::UnterminatedString { line: number });
    }
    Ok(out)
}

/// `line` up to any `//` comment outside strings, block comments and URLs.
fn strip_line(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut quote: Option<u8> = None;
    let mut in_block = false;
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        let next = bytes.get(index + 1).copied();
        if in_block {
            if byte == b'*' && next == Some(b'/') {
                in_block = false;
                index += 1;
            }
        } else if let Some(open) = quote {
            if byte == b'\\' {
                index += 1;
            } else if byte == open {
                quote = None;
            }
        } else {
            match (byte, next) {
                (b'"' | b'\'', _) => quote = Some(byte),
                (b'/', Some(b'*')) => {
                    in_block = true;
                    index += 1;
                }
                (b'/', Some(b'/')) if index == 0 || bytes[index - 1] != b':' => {
                    return line[..index].trim_end();
                }
                _ => {}
            }
        }
        index += 1;
    }
    line
}

fn check_braces(lines: &[(usize, &str)]) -> Result<(), LessError> {
    let mut open_lines = Vec::new();
    let mut quote: Option<char> = None;
    for &(number, line) in lines {
        for ch in line.chars() {
            match (quote, ch) {
                (Some(open), c) if c == open => quote = None,
                (Some(_), _) => {}
                (None, '"' | '\'') => quote = Some(ch),
                (None, '{') => open_lines.push(number),
                (None, '}') => {
                    if open_lines.pop().is_none() {
                        return Err(LessError::UnexpectedClose { line: number });
                    }
                }
                _ => {}
            }
        }
    }
    match open_lines.first() {
        Some(&line) => Err(LessError::Unclosed { line }),
        None => Ok(()),
    }
}
