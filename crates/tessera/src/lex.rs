use strum::Display;

use crate::error::{CodeLoc, LexError};
#[cfg(test)]
use crate::error::LexErrorKind;

/// Delimiter configuration for the lexer. All six strings are configurable at
/// environment construction; the `-` trim variants are derived, never
/// configured directly.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SyntaxConfig {
    pub variable_start: String,
    pub variable_end: String,
    pub block_start: String,
    pub block_end: String,
    pub comment_start: String,
    pub comment_end: String,
}

impl Default for SyntaxConfig {
    fn default() -> Self {
        Self {
            variable_start: "{{".to_owned(),
            variable_end: "}}".to_owned(),
            block_start: "{%".to_owned(),
            block_end: "%}".to_owned(),
            comment_start: "{#".to_owned(),
            comment_end: "#}".to_owned(),
        }
    }
}

/// Closed set of token kinds.
///
/// Keyword tokens are produced by promoting identifier tokens through
/// [`keyword_kind`]; the lexer itself never pattern-matches keyword text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TokenKind {
    Text,
    Comment,
    Eof,

    Int,
    Float,
    Str,
    Ident,

    VariableStart,
    VariableStartTrim,
    VariableEnd,
    VariableEndTrim,
    BlockStart,
    BlockStartTrim,
    BlockEnd,
    BlockEndTrim,

    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    Tilde,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    Pipe,
    Dot,
    Comma,
    Colon,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,

    If,
    Elif,
    Else,
    Endif,
    For,
    In,
    Endfor,
    Block,
    Endblock,
    Extends,
    Include,
    Macro,
    Endmacro,
    Call,
    Endcall,
    Import,
    From,
    As,
    Set,
    Endset,
    With,
    Endwith,
    Filter,
    Endfilter,
    Raw,
    Endraw,
    Autoescape,
    Endautoescape,
    Super,
    Recursive,
    Do,
    Ignore,
    Missing,
    True,
    False,
    None,
    And,
    Or,
    Not,
    Is,
}

impl TokenKind {
    /// True for the tokens that terminate a `{% ... %}` tag.
    #[must_use]
    pub fn is_block_end(self) -> bool {
        matches!(self, Self::BlockEnd | Self::BlockEndTrim)
    }

    /// True for the tokens that terminate a `{{ ... }}` expression.
    #[must_use]
    pub fn is_variable_end(self) -> bool {
        matches!(self, Self::VariableEnd | Self::VariableEndTrim)
    }
}

fn keyword_kind(ident: &str) -> Option<TokenKind> {
    let kind = match ident {
        "if" => TokenKind::If,
        "elif" => TokenKind::Elif,
        "else" => TokenKind::Else,
        "endif" => TokenKind::Endif,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "endfor" => TokenKind::Endfor,
        "block" => TokenKind::Block,
        "endblock" => TokenKind::Endblock,
        "extends" => TokenKind::Extends,
        "include" => TokenKind::Include,
        "macro" => TokenKind::Macro,
        "endmacro" => TokenKind::Endmacro,
        "call" => TokenKind::Call,
        "endcall" => TokenKind::Endcall,
        "import" => TokenKind::Import,
        "from" => TokenKind::From,
        "as" => TokenKind::As,
        "set" => TokenKind::Set,
        "endset" => TokenKind::Endset,
        "with" => TokenKind::With,
        "endwith" => TokenKind::Endwith,
        "filter" => TokenKind::Filter,
        "endfilter" => TokenKind::Endfilter,
        "raw" => TokenKind::Raw,
        "endraw" => TokenKind::Endraw,
        "autoescape" => TokenKind::Autoescape,
        "endautoescape" => TokenKind::Endautoescape,
        "super" => TokenKind::Super,
        "recursive" => TokenKind::Recursive,
        "do" => TokenKind::Do,
        "ignore" => TokenKind::Ignore,
        "missing" => TokenKind::Missing,
        "true" | "True" => TokenKind::True,
        "false" | "False" => TokenKind::False,
        "none" | "None" | "null" => TokenKind::None,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "is" => TokenKind::Is,
        _ => return None,
    };
    Some(kind)
}

/// A single lexed token. `value` holds the lexeme for text, comments,
/// literals and identifiers and is empty for fixed-shape tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub loc: CodeLoc,
}

impl Token {
    fn fixed(kind: TokenKind, loc: CodeLoc) -> Self {
        Self {
            kind,
            value: String::new(),
            loc,
        }
    }

    /// Human-oriented rendering for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        if self.value.is_empty() {
            self.kind.to_string()
        } else {
            format!("{} ({:?})", self.kind, self.value)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Variable,
    Block,
}

/// Tokenizes template source into a token stream ending with an EOF token.
pub fn tokenize(source: &str, syntax: &SyntaxConfig) -> Result<Vec<Token>, LexError> {
    Lexer::new(source, syntax).run()
}

struct Lexer<'s> {
    source: &'s str,
    syntax: &'s SyntaxConfig,
    pos: usize,
    line: u32,
    column: u32,
    mode: Mode,
    /// Position where the currently open tag or string started, for errors.
    open_loc: CodeLoc,
    /// Set after a `{% raw %}` tag closes; the next text scan captures the
    /// interior verbatim up to the matching endraw tag.
    pending_raw: bool,
    tokens: Vec<Token>,
}

impl<'s> Lexer<'s> {
    fn new(source: &'s str, syntax: &'s SyntaxConfig) -> Self {
        Self {
            source,
            syntax,
            pos: 0,
            line: 1,
            column: 1,
            mode: Mode::Text,
            open_loc: CodeLoc::start(),
            pending_raw: false,
            tokens: Vec::new(),
        }
    }

    fn loc(&self) -> CodeLoc {
        CodeLoc::new(self.line, self.column)
    }

    fn rest(&self) -> &'s str {
        &self.source[self.pos..]
    }

    fn advance(&mut self, bytes: usize) {
        let consumed = &self.source[self.pos..self.pos + bytes];
        for c in consumed.chars() {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.pos += bytes;
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        while self.pos < self.source.len() {
            match self.mode {
                Mode::Text => {
                    if self.pending_raw {
                        self.lex_raw_body()?;
                    } else {
                        self.lex_text()?;
                    }
                }
                Mode::Variable | Mode::Block => self.lex_expression_token()?,
            }
        }
        match self.mode {
            Mode::Text => {}
            Mode::Variable => {
                return Err(LexError::unclosed(&self.syntax.variable_start, self.open_loc));
            }
            Mode::Block => {
                return Err(LexError::unclosed(&self.syntax.block_start, self.open_loc));
            }
        }
        self.tokens.push(Token::fixed(TokenKind::Eof, self.loc()));
        Ok(self.tokens)
    }

    /// Text mode: accumulate until the earliest start delimiter, then switch.
    fn lex_text(&mut self) -> Result<(), LexError> {
        let rest = self.rest();
        let starts = [
            (self.syntax.variable_start.as_str(), Mode::Variable),
            (self.syntax.block_start.as_str(), Mode::Block),
        ];

        let mut hit: Option<(usize, &str, Option<Mode>)> = None;
        for (delim, mode) in starts {
            if let Some(at) = rest.find(delim)
                && hit.is_none_or(|(best, _, _)| at < best)
            {
                hit = Some((at, delim, Some(mode)));
            }
        }
        if let Some(at) = rest.find(self.syntax.comment_start.as_str())
            && hit.is_none_or(|(best, _, _)| at < best)
        {
            hit = Some((at, self.syntax.comment_start.as_str(), None));
        }

        let Some((at, delim, mode)) = hit else {
            let loc = self.loc();
            let text = rest.to_owned();
            self.advance(rest.len());
            self.tokens.push(Token {
                kind: TokenKind::Text,
                value: text,
                loc,
            });
            return Ok(());
        };

        if at > 0 {
            let loc = self.loc();
            let text = rest[..at].to_owned();
            self.advance(at);
            self.tokens.push(Token {
                kind: TokenKind::Text,
                value: text,
                loc,
            });
        }

        let delim_loc = self.loc();
        self.open_loc = delim_loc;
        let trim = self.source[self.pos + delim.len()..].starts_with('-');
        let delim_len = delim.len() + usize::from(trim);

        match mode {
            Some(next_mode) => {
                let kind = match (next_mode, trim) {
                    (Mode::Variable, false) => TokenKind::VariableStart,
                    (Mode::Variable, true) => TokenKind::VariableStartTrim,
                    (Mode::Block, false) => TokenKind::BlockStart,
                    (Mode::Block, true) => TokenKind::BlockStartTrim,
                    (Mode::Text, _) => unreachable!(),
                };
                self.advance(delim_len);
                self.tokens.push(Token::fixed(kind, delim_loc));
                self.mode = next_mode;
            }
            None => {
                self.advance(delim_len);
                self.lex_comment(delim_loc, trim)?;
            }
        }
        Ok(())
    }

    /// Comment mode never emits expression tokens; the whole interior becomes
    /// one comment token so the whitespace pass can see its trim markers.
    fn lex_comment(&mut self, start_loc: CodeLoc, trim_left: bool) -> Result<(), LexError> {
        let rest = self.rest();
        let Some(end_at) = rest.find(self.syntax.comment_end.as_str()) else {
            return Err(LexError::unclosed(&self.syntax.comment_start, start_loc));
        };

        let mut content = &rest[..end_at];
        let trim_right = content.ends_with('-');
        if trim_right {
            content = &content[..content.len() - 1];
        }

        // Trim markers are re-encoded into the token value so the whitespace
        // pass does not need extra token fields for comments.
        let mut value = String::with_capacity(content.len() + 2);
        value.push(if trim_left { '-' } else { ' ' });
        value.push(if trim_right { '-' } else { ' ' });
        value.push_str(content);

        self.advance(end_at + self.syntax.comment_end.len());
        self.tokens.push(Token {
            kind: TokenKind::Comment,
            value,
            loc: start_loc,
        });
        Ok(())
    }

    /// After `{% raw %}`, capture everything verbatim up to the endraw tag.
    fn lex_raw_body(&mut self) -> Result<(), LexError> {
        self.pending_raw = false;
        let rest = self.rest();
        let start_loc = self.loc();

        // Find the next `{% endraw %}` (with optional trims and interior
        // whitespace); the interior is not tokenized for tags.
        let bs = self.syntax.block_start.as_str();
        let mut search_from = 0;
        loop {
            let Some(rel) = rest[search_from..].find(bs) else {
                return Err(LexError::unclosed(bs, start_loc));
            };
            let tag_at = search_from + rel;
            let mut inner = &rest[tag_at + bs.len()..];
            inner = inner.strip_prefix('-').unwrap_or(inner);
            let inner = inner.trim_start();
            if inner.starts_with("endraw") {
                if tag_at > 0 {
                    self.tokens.push(Token {
                        kind: TokenKind::Text,
                        value: rest[..tag_at].to_owned(),
                        loc: start_loc,
                    });
                }
                self.advance(tag_at);
                return Ok(());
            }
            search_from = tag_at + bs.len();
        }
    }

    fn end_delimiter(&self) -> (&'s str, TokenKind, TokenKind) {
        match self.mode {
            Mode::Variable => (
                self.syntax.variable_end.as_str(),
                TokenKind::VariableEnd,
                TokenKind::VariableEndTrim,
            ),
            Mode::Block => (
                self.syntax.block_end.as_str(),
                TokenKind::BlockEnd,
                TokenKind::BlockEndTrim,
            ),
            Mode::Text => unreachable!("end_delimiter is only queried inside a tag"),
        }
    }

    fn lex_expression_token(&mut self) -> Result<(), LexError> {
        // Whitespace (including newlines) separates tokens inside tags.
        let ws = self
            .rest()
            .char_indices()
            .find(|(_, c)| !c.is_whitespace())
            .map_or_else(|| self.rest().len(), |(i, _)| i);
        self.advance(ws);
        if self.pos >= self.source.len() {
            return Ok(());
        }

        let rest = self.rest();
        let loc = self.loc();
        let (end, end_kind, end_trim_kind) = self.end_delimiter();

        // End delimiters win over operator lexing: `-%}` is a trimmed end
        // tag, not a minus token.
        if let Some(after_dash) = rest.strip_prefix('-')
            && after_dash.starts_with(end)
        {
            self.advance(1 + end.len());
            self.finish_tag(end_trim_kind, loc);
            return Ok(());
        }
        if rest.starts_with(end) {
            self.advance(end.len());
            self.finish_tag(end_kind, loc);
            return Ok(());
        }

        let c = rest.chars().next().expect("non-empty rest");
        if c == '"' || c == '\'' {
            return self.lex_string(c);
        }
        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if c.is_alphabetic() || c == '_' {
            return self.lex_identifier();
        }
        self.lex_operator(c)
    }

    fn finish_tag(&mut self, kind: TokenKind, loc: CodeLoc) {
        // `{% raw %}` flips the lexer into verbatim capture once its block
        // end is consumed.
        if kind.is_block_end() {
            let tag_start = self
                .tokens
                .iter()
                .rposition(|t| matches!(t.kind, TokenKind::BlockStart | TokenKind::BlockStartTrim));
            if let Some(at) = tag_start
                && self.tokens.get(at + 1).is_some_and(|t| t.kind == TokenKind::Raw)
            {
                self.pending_raw = true;
            }
        }
        self.tokens.push(Token::fixed(kind, loc));
        self.mode = Mode::Text;
    }

    fn lex_string(&mut self, quote: char) -> Result<(), LexError> {
        let start_loc = self.loc();
        let rest = self.rest();
        let mut value = String::new();
        let mut chars = rest.char_indices().skip(1);
        loop {
            let Some((i, c)) = chars.next() else {
                return Err(LexError::unterminated_string(start_loc));
            };
            match c {
                c if c == quote => {
                    self.advance(i + quote.len_utf8());
                    self.tokens.push(Token {
                        kind: TokenKind::Str,
                        value,
                        loc: start_loc,
                    });
                    return Ok(());
                }
                '\\' => {
                    let Some((_, esc)) = chars.next() else {
                        return Err(LexError::unterminated_string(start_loc));
                    };
                    match esc {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '\\' => value.push('\\'),
                        '"' => value.push('"'),
                        '\'' => value.push('\''),
                        other => {
                            // Unknown escapes keep the backslash verbatim.
                            value.push('\\');
                            value.push(other);
                        }
                    }
                }
                other => value.push(other),
            }
        }
    }

    fn lex_number(&mut self) -> Result<(), LexError> {
        let start_loc = self.loc();
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut i = 0;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let mut is_float = false;
        // A decimal point only makes a float when a digit follows, so that
        // `1.items` still lexes as attribute access on an integer.
        if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
            is_float = true;
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
        if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
            let mut j = i + 1;
            if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                j += 1;
            }
            if j < bytes.len() && bytes[j].is_ascii_digit() {
                is_float = true;
                i = j;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
        }
        let value = rest[..i].to_owned();
        self.advance(i);
        self.tokens.push(Token {
            kind: if is_float { TokenKind::Float } else { TokenKind::Int },
            value,
            loc: start_loc,
        });
        Ok(())
    }

    fn lex_identifier(&mut self) -> Result<(), LexError> {
        let start_loc = self.loc();
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
            .map_or_else(|| rest.len(), |(i, _)| i);
        let ident = &rest[..len];
        self.advance(len);
        match keyword_kind(ident) {
            Some(kind) => self.tokens.push(Token::fixed(kind, start_loc)),
            None => self.tokens.push(Token {
                kind: TokenKind::Ident,
                value: ident.to_owned(),
                loc: start_loc,
            }),
        }
        Ok(())
    }

    fn lex_operator(&mut self, c: char) -> Result<(), LexError> {
        let loc = self.loc();
        let rest = self.rest();
        let two = rest.get(..2).unwrap_or("");
        let (kind, len) = match two {
            "**" => (TokenKind::StarStar, 2),
            "//" => (TokenKind::SlashSlash, 2),
            "==" => (TokenKind::Eq, 2),
            "!=" => (TokenKind::Ne, 2),
            "<=" => (TokenKind::Le, 2),
            ">=" => (TokenKind::Ge, 2),
            _ => match c {
                '+' => (TokenKind::Plus, 1),
                '-' => (TokenKind::Minus, 1),
                '*' => (TokenKind::Star, 1),
                '/' => (TokenKind::Slash, 1),
                '%' => (TokenKind::Percent, 1),
                '~' => (TokenKind::Tilde, 1),
                '<' => (TokenKind::Lt, 1),
                '>' => (TokenKind::Gt, 1),
                '=' => (TokenKind::Assign, 1),
                '|' => (TokenKind::Pipe, 1),
                '.' => (TokenKind::Dot, 1),
                ',' => (TokenKind::Comma, 1),
                ':' => (TokenKind::Colon, 1),
                '(' => (TokenKind::LeftParen, 1),
                ')' => (TokenKind::RightParen, 1),
                '[' => (TokenKind::LeftBracket, 1),
                ']' => (TokenKind::RightBracket, 1),
                '{' => (TokenKind::LeftBrace, 1),
                '}' => (TokenKind::RightBrace, 1),
                other => return Err(LexError::unexpected_character(other, loc)),
            },
        };
        self.advance(len);
        self.tokens.push(Token::fixed(kind, loc));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source, &SyntaxConfig::default())
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn plain_text_is_one_token() {
        assert_eq!(kinds("hello world"), vec![TokenKind::Text, TokenKind::Eof]);
    }

    #[test]
    fn variable_expression() {
        assert_eq!(
            kinds("Hello {{ name }}!"),
            vec![
                TokenKind::Text,
                TokenKind::VariableStart,
                TokenKind::Ident,
                TokenKind::VariableEnd,
                TokenKind::Text,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn trim_variants() {
        assert_eq!(
            kinds("a {%- if x -%} b"),
            vec![
                TokenKind::Text,
                TokenKind::BlockStartTrim,
                TokenKind::If,
                TokenKind::Ident,
                TokenKind::BlockEndTrim,
                TokenKind::Text,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comment_is_single_token() {
        let tokens = tokenize("a{# note #}b", &SyntaxConfig::default()).unwrap();
        assert_eq!(
            tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![TokenKind::Text, TokenKind::Comment, TokenKind::Text, TokenKind::Eof]
        );
        assert_eq!(&tokens[1].value[2..], " note ");
    }

    #[test]
    fn keywords_are_promoted() {
        assert_eq!(
            kinds("{% for x in items recursive %}{% endfor %}"),
            vec![
                TokenKind::BlockStart,
                TokenKind::For,
                TokenKind::Ident,
                TokenKind::In,
                TokenKind::Ident,
                TokenKind::Recursive,
                TokenKind::BlockEnd,
                TokenKind::BlockStart,
                TokenKind::Endfor,
                TokenKind::BlockEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#"{{ "a\n\t\"b" }}"#, &SyntaxConfig::default()).unwrap();
        assert_eq!(tokens[1].kind, TokenKind::Str);
        assert_eq!(tokens[1].value, "a\n\t\"b");
    }

    #[test]
    fn numbers() {
        let tokens = tokenize("{{ 42 3.5 1e3 }}", &SyntaxConfig::default()).unwrap();
        assert_eq!(
            tokens[1..4].iter().map(|t| (t.kind, t.value.as_str())).collect::<Vec<_>>(),
            vec![
                (TokenKind::Int, "42"),
                (TokenKind::Float, "3.5"),
                (TokenKind::Float, "1e3"),
            ]
        );
    }

    #[test]
    fn raw_interior_is_not_tokenized() {
        let tokens = tokenize("{% raw %}{{ not lexed }}{% endraw %}", &SyntaxConfig::default()).unwrap();
        let raw_text = tokens.iter().find(|t| t.kind == TokenKind::Text).unwrap();
        assert_eq!(raw_text.value, "{{ not lexed }}");
    }

    #[test]
    fn minus_before_end_is_trim_not_operator() {
        let tokens = tokenize("{{ a - 1 }}{{ a -}}", &SyntaxConfig::default()).unwrap();
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Minus));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::VariableEndTrim));
    }

    #[test]
    fn unclosed_block_reports_open_position() {
        let err = tokenize("text {{ name", &SyntaxConfig::default()).unwrap_err();
        assert_eq!(err.loc, CodeLoc::new(1, 6));
    }

    #[test]
    fn unexpected_character() {
        let err = tokenize("{{ a ? b }}", &SyntaxConfig::default()).unwrap_err();
        assert!(matches!(err.kind, LexErrorKind::UnexpectedCharacter('?')));
    }

    #[test]
    fn custom_delimiters() {
        let syntax = SyntaxConfig {
            variable_start: "<<".to_owned(),
            variable_end: ">>".to_owned(),
            block_start: "<%".to_owned(),
            block_end: "%>".to_owned(),
            comment_start: "<#".to_owned(),
            comment_end: "#>".to_owned(),
        };
        let tokens = tokenize("a << x >> <% if y %> <# c #>", &syntax).unwrap();
        let found: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert!(found.contains(&TokenKind::VariableStart));
        assert!(found.contains(&TokenKind::BlockStart));
        assert!(found.contains(&TokenKind::Comment));
    }
}
