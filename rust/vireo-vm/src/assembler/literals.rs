//! Tokenizing and immediate-literal parsing.

use once_cell::sync::Lazy;
use regex::Regex;
use vireo_core::asmwords;
use vireo_core::{EngineError, ErrorKind, ValueKind};

use crate::memory::ValueContainer;

static INT_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?[0-9]+$").expect("int literal pattern"));

static FLOAT_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?([0-9]+(\.[0-9]+)?|\.[0-9]+)([eE][+-]?[0-9]+)?$")
        .expect("float literal pattern")
});

/// Splits one assembly line into whitespace-separated tokens, keeping quoted
/// text (with its quotes) together as a single token.
pub(crate) fn tokenize(line: &str) -> Result<Vec<&str>, EngineError> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => {
                start.get_or_insert(i);
                in_string = true;
            }
            b' ' | b'\t' => {
                if let Some(s) = start.take() {
                    tokens.push(&line[s..i]);
                }
            }
            _ => {
                start.get_or_insert(i);
            }
        }
    }
    if in_string {
        return Err(ErrorKind::MalformedLiteral {
            literal: line.to_string(),
        }
        .into());
    }
    if let Some(s) = start {
        tokens.push(&line[s..]);
    }
    Ok(tokens)
}

/// Parses an immediate token (`~int:42`, `~string:"hi"`, ...) into a scalar
/// value container.
pub(crate) fn parse_immediate(token: &str) -> Result<ValueContainer, EngineError> {
    let malformed = || ErrorKind::MalformedLiteral {
        literal: token.to_string(),
    };

    let body = token
        .strip_prefix(asmwords::IMMEDIATE_PREFIX)
        .ok_or_else(malformed)?;
    let (tag, value) = body
        .split_once(asmwords::VALUE_SEPARATOR)
        .ok_or_else(malformed)?;
    let kind: ValueKind = tag.parse().map_err(|_| malformed())?;

    match kind {
        ValueKind::Int64 => {
            if !INT_LITERAL.is_match(value) {
                return Err(malformed().into());
            }
            let parsed = value.parse::<i64>().map_err(|_| malformed())?;
            Ok(ValueContainer::int64_scalar(parsed))
        }
        ValueKind::Float64 => {
            if !FLOAT_LITERAL.is_match(value) {
                return Err(malformed().into());
            }
            let parsed = value.parse::<f64>().map_err(|_| malformed())?;
            Ok(ValueContainer::float64_scalar(parsed))
        }
        ValueKind::Bool => match value {
            "true" => Ok(ValueContainer::bool_scalar(true)),
            "false" => Ok(ValueContainer::bool_scalar(false)),
            _ => Err(malformed().into()),
        },
        ValueKind::Text => {
            let inner = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(malformed)?;
            Ok(ValueContainer::text_scalar(unescape(inner)))
        }
        ValueKind::Void => Err(malformed().into()),
    }
}

/// Decodes the escape sequences of a quoted string literal. Unknown escapes
/// pass through unchanged.
pub(crate) fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_whitespace() {
        let tokens = tokenize("ADD int\tR0 L1 C2").unwrap();
        assert_eq!(tokens, vec!["ADD", "int", "R0", "L1", "C2"]);
    }

    #[test]
    fn tokenize_keeps_quoted_text_together() {
        let tokens = tokenize(r#"MOV string L0 ~string:"a b\tc""#).unwrap();
        assert_eq!(tokens, vec!["MOV", "string", "L0", r#"~string:"a b\tc""#]);
    }

    #[test]
    fn tokenize_rejects_unterminated_strings() {
        assert!(tokenize(r#"MOV string L0 ~string:"oops"#).is_err());
    }

    #[test]
    fn parses_int_and_float_immediates() {
        let c = parse_immediate("~int:-42").unwrap();
        assert_eq!(c.get_int64_scalar().unwrap(), -42);

        let c = parse_immediate("~float:2.5e1").unwrap();
        assert_eq!(c.get_float64_scalar().unwrap(), 25.0);
    }

    #[test]
    fn parses_bool_and_string_immediates() {
        assert!(parse_immediate("~bool:true").unwrap().get_bool_scalar().unwrap());
        let c = parse_immediate(r#"~string:"a\nb""#).unwrap();
        assert_eq!(c.get_text_scalar().unwrap(), "a\nb");
    }

    #[test]
    fn rejects_malformed_immediates() {
        for literal in [
            "~int:1.5",
            "~int:ten",
            "~float:nan",
            "~bool:yes",
            "~string:unquoted",
            "~void:0",
            "~int",
            "int:1",
        ] {
            let err = parse_immediate(literal).unwrap_err();
            assert!(
                matches!(err.kind, ErrorKind::MalformedLiteral { .. }),
                "literal {literal:?} should be malformed"
            );
        }
    }
}
