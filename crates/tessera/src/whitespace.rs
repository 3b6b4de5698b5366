//! Whitespace control.
//!
//! Runs between the lexer and the parser: inline `-` trim markers, the global
//! `trim_blocks` / `lstrip_blocks` flags, and the `keep_trailing_newline`
//! source pre-pass are all applied here, on the token stream, so the parser
//! and evaluator never see whitespace bookkeeping. This pass cannot fail.

use crate::lex::{Token, TokenKind};

/// Source pre-pass: a single final newline is dropped unless the environment
/// keeps it.
#[must_use]
pub fn prepare_source(source: &str, keep_trailing_newline: bool) -> &str {
    if keep_trailing_newline {
        return source;
    }
    source
        .strip_suffix("\r\n")
        .or_else(|| source.strip_suffix('\n'))
        .unwrap_or(source)
}

/// Applies all whitespace-control rules to a token stream.
///
/// Left trim (`{%-`, `{{-`, `{#-`) removes all whitespace before the tag.
/// Right trim (`-%}`, `-}}`, `-#}`) removes spaces and tabs after the tag,
/// and removes a line break only together with the indentation of the next
/// line; a bare line break stays. Comments carry their trim markers encoded
/// in the token value and are stripped back to plain content here.
#[must_use]
pub fn apply(mut tokens: Vec<Token>, trim_blocks: bool, lstrip_blocks: bool) -> Vec<Token> {
    for i in 0..tokens.len() {
        match tokens[i].kind {
            TokenKind::VariableStartTrim | TokenKind::BlockStartTrim => {
                trim_text_before(&mut tokens, i, TrimBefore::All);
            }
            TokenKind::BlockStart if lstrip_blocks => {
                trim_text_before(&mut tokens, i, TrimBefore::LineIndent);
            }
            TokenKind::VariableEndTrim | TokenKind::BlockEndTrim => {
                trim_text_after(&mut tokens, i, TrimAfter::Inline);
            }
            TokenKind::BlockEnd if trim_blocks => {
                trim_text_after(&mut tokens, i, TrimAfter::OneNewline);
            }
            TokenKind::Comment => {
                let (left, right) = {
                    let value = tokens[i].value.as_bytes();
                    (value.first() == Some(&b'-'), value.get(1) == Some(&b'-'))
                };
                if left {
                    trim_text_before(&mut tokens, i, TrimBefore::All);
                }
                if right {
                    trim_text_after(&mut tokens, i, TrimAfter::Inline);
                }
                let content = tokens[i].value.split_off(2);
                tokens[i].value = content;
            }
            _ => {}
        }
    }
    tokens.retain(|t| t.kind != TokenKind::Text || !t.value.is_empty());
    tokens
}

enum TrimBefore {
    /// All whitespace immediately before the tag.
    All,
    /// `lstrip_blocks`: the indentation of a tag standing on its own line.
    LineIndent,
}

enum TrimAfter {
    /// Inline `-` rule.
    Inline,
    /// `trim_blocks`: exactly one following newline.
    OneNewline,
}

fn trim_text_before(tokens: &mut [Token], i: usize, rule: TrimBefore) {
    let Some(prev) = i.checked_sub(1) else { return };
    if tokens[prev].kind != TokenKind::Text {
        return;
    }
    let at_template_start = prev == 0;
    let text = &mut tokens[prev].value;
    match rule {
        TrimBefore::All => {
            text.truncate(text.trim_end().len());
        }
        TrimBefore::LineIndent => {
            let kept = text.trim_end_matches([' ', '\t']).len();
            let head = &text[..kept];
            if head.ends_with('\n') || (head.is_empty() && at_template_start) {
                text.truncate(kept);
            }
        }
    }
}

fn trim_text_after(tokens: &mut [Token], i: usize, rule: TrimAfter) {
    let Some(next) = tokens.get_mut(i + 1) else { return };
    if next.kind != TokenKind::Text {
        return;
    }
    let remove = match rule {
        TrimAfter::Inline => inline_trim_len(&next.value),
        TrimAfter::OneNewline => {
            if next.value.starts_with("\r\n") {
                2
            } else {
                usize::from(next.value.starts_with('\n'))
            }
        }
    };
    if remove > 0 {
        next.value.drain(..remove);
    }
}

/// Byte length of the prefix removed by an inline right trim: the run of
/// spaces and tabs, and the line break when (and only when) the next line is
/// itself indented.
fn inline_trim_len(s: &str) -> usize {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() && (b[i] == b' ' || b[i] == b'\t') {
        i += 1;
    }
    let newline = if s[i..].starts_with("\r\n") {
        2
    } else {
        usize::from(b.get(i) == Some(&b'\n'))
    };
    if newline > 0 {
        let indent_start = i + newline;
        let mut j = indent_start;
        while j < b.len() && (b[j] == b' ' || b[j] == b'\t') {
            j += 1;
        }
        if j > indent_start {
            return j;
        }
    }
    i
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::lex::{SyntaxConfig, tokenize};

    fn text_values(source: &str, trim_blocks: bool, lstrip_blocks: bool) -> Vec<String> {
        let tokens = tokenize(source, &SyntaxConfig::default()).unwrap();
        apply(tokens, trim_blocks, lstrip_blocks)
            .into_iter()
            .filter(|t| t.kind == TokenKind::Text)
            .map(|t| t.value)
            .collect()
    }

    #[test]
    fn trailing_newline_dropped_by_default() {
        assert_eq!(prepare_source("hello\n", false), "hello");
        assert_eq!(prepare_source("hello\r\n", false), "hello");
        assert_eq!(prepare_source("hello\n", true), "hello\n");
        assert_eq!(prepare_source("hello\n\n", false), "hello\n");
    }

    #[test]
    fn left_trim_removes_all_preceding_whitespace() {
        assert_eq!(text_values("A\n  {%- if x %}{% endif %}", false, false), vec!["A"]);
    }

    #[test]
    fn right_trim_joins_indented_continuation() {
        // the newline goes only together with the indentation that follows it
        assert_eq!(
            text_values("{% if x -%}\n  B{% endif %}", false, false),
            vec!["B"]
        );
        assert_eq!(text_values("{% if x -%}\nC{% endif %}", false, false), vec!["\nC"]);
        assert_eq!(text_values("{% if x -%}  hi{% endif %}", false, false), vec!["hi"]);
    }

    #[test]
    fn inline_trim_scenario() {
        // `A\n  {%- if true -%}\n  B\n  {%- endif -%}\nC` => segments A, B, \nC
        assert_eq!(
            text_values("A\n  {%- if true -%}\n  B\n  {%- endif -%}\nC", false, false),
            vec!["A", "B", "\nC"]
        );
    }

    #[test]
    fn trim_blocks_drops_one_newline() {
        assert_eq!(
            text_values("{% if x %}\n\nbody{% endif %}", true, false),
            vec!["\nbody"]
        );
        assert_eq!(
            text_values("{% if x %}\r\nbody{% endif %}", true, false),
            vec!["body"]
        );
    }

    #[test]
    fn lstrip_blocks_strips_own_line_indent() {
        assert_eq!(
            text_values("a\n    {% if x %}{% endif %}b", false, true),
            vec!["a\n", "b"]
        );
        // not on its own line: indentation kept
        assert_eq!(
            text_values("a  {% if x %}{% endif %}b", false, true),
            vec!["a  ", "b"]
        );
    }

    #[test]
    fn comment_trims_apply_and_markers_are_stripped() {
        let tokens = tokenize("x  {#- gone -#}  y", &SyntaxConfig::default()).unwrap();
        let tokens = apply(tokens, false, false);
        let values: Vec<_> = tokens.iter().map(|t| (t.kind, t.value.clone())).collect();
        assert_eq!(
            values,
            vec![
                (TokenKind::Text, "x".to_owned()),
                (TokenKind::Comment, " gone ".to_owned()),
                (TokenKind::Text, "y".to_owned()),
                (TokenKind::Eof, String::new()),
            ]
        );
    }
}
