use smallvec::SmallVec;

use crate::{
    ast::{BinaryOperator, FilterCall, LiteralValue, Node, UnaryOperator},
    error::{CodeLoc, ParseError},
    lex::{Token, TokenKind},
};

/// Hook surface the parser uses to delegate unknown block tags.
///
/// Implemented by the extension registry; kept as a trait here so the parser
/// does not depend on the registry module.
pub trait TagDispatch {
    /// Name of the extension handling `tag`, if any.
    fn extension_for_tag(&self, tag: &str) -> Option<String>;

    /// Invokes the extension's parse hook. The hook must consume tokens up to
    /// and including the tag's block end (and the matching end tag when it is
    /// a block extension).
    fn parse_tag(&self, extension: &str, tag: &str, parser: &mut TagParser<'_, '_>) -> Result<Node, ParseError>;
}

/// Parses a token stream (already whitespace-processed) into a
/// [`Node::Template`].
pub fn parse(tokens: &[Token], template_name: &str, extensions: Option<&dyn TagDispatch>) -> Result<Node, ParseError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        extensions,
    };
    let (children, stop) = parser.parse_body(&[], &[])?;
    debug_assert_eq!(stop.kind, TokenKind::Eof);
    Ok(Node::Template {
        name: template_name.to_owned(),
        children,
    })
}

pub struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    extensions: Option<&'t dyn TagDispatch>,
}

impl<'t> Parser<'t> {
    fn current(&self) -> &'t Token {
        // The stream always ends with EOF, so clamping is safe.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &'t Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.current().kind
    }

    fn loc(&self) -> CodeLoc {
        self.current().loc
    }

    fn advance(&mut self) -> &'t Token {
        let token = self.current();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&'t Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::unexpected(
                &kind.to_string(),
                self.current().describe(),
                self.loc(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, CodeLoc), ParseError> {
        let token = self.expect(TokenKind::Ident)?;
        Ok((token.value.clone(), token.loc))
    }

    fn expect_block_end(&mut self) -> Result<(), ParseError> {
        if self.kind().is_block_end() {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::unexpected(
                "end of block tag",
                self.current().describe(),
                self.loc(),
            ))
        }
    }

    /// True when the current token is a contextual keyword: an identifier
    /// with the given text.
    fn check_ident(&self, name: &str) -> bool {
        self.check(TokenKind::Ident) && self.current().value == name
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    /// Parses statements and text until EOF or until a `{% ... %}` tag whose
    /// first token is one of `stop_kinds` (or an identifier in
    /// `stop_idents`). The matched tag's block start and keyword are
    /// consumed; the caller finishes the tag.
    fn parse_body(&mut self, stop_kinds: &[TokenKind], stop_idents: &[&str]) -> Result<(Vec<Node>, &'t Token), ParseError> {
        let mut nodes = Vec::new();
        loop {
            match self.kind() {
                TokenKind::Eof => {
                    let token = self.current();
                    if stop_kinds.is_empty() && stop_idents.is_empty() {
                        return Ok((nodes, token));
                    }
                    return Err(ParseError::new(
                        format!("unexpected end of template, expected {}", describe_stops(stop_kinds, stop_idents)),
                        token.loc,
                    ));
                }
                TokenKind::Text => {
                    let token = self.advance();
                    nodes.push(Node::Text {
                        content: token.value.clone(),
                        loc: token.loc,
                    });
                }
                TokenKind::Comment => {
                    let token = self.advance();
                    nodes.push(Node::Comment {
                        content: token.value.clone(),
                        loc: token.loc,
                    });
                }
                TokenKind::VariableStart | TokenKind::VariableStartTrim => {
                    let loc = self.advance().loc;
                    let expression = self.parse_expression()?;
                    if !self.kind().is_variable_end() {
                        return Err(ParseError::unexpected(
                            "end of variable expression",
                            self.current().describe(),
                            self.loc(),
                        ));
                    }
                    self.advance();
                    nodes.push(Node::Variable {
                        expression: Box::new(expression),
                        loc,
                    });
                }
                TokenKind::BlockStart | TokenKind::BlockStartTrim => {
                    let keyword = self.peek();
                    let stop_hit = stop_kinds.contains(&keyword.kind)
                        || (keyword.kind == TokenKind::Ident && stop_idents.iter().any(|s| keyword.value == *s));
                    if stop_hit {
                        self.advance();
                        let keyword = self.advance();
                        return Ok((nodes, keyword));
                    }
                    nodes.push(self.parse_tag()?);
                }
                _ => {
                    return Err(ParseError::unexpected(
                        "template text or a tag",
                        self.current().describe(),
                        self.loc(),
                    ));
                }
            }
        }
    }

    /// Dispatches a `{% ... %}` tag on its first keyword.
    fn parse_tag(&mut self) -> Result<Node, ParseError> {
        let tag_loc = self.advance().loc; // block start
        match self.kind() {
            TokenKind::If => {
                self.advance();
                self.parse_if(tag_loc)
            }
            TokenKind::For => {
                self.advance();
                self.parse_for(tag_loc)
            }
            TokenKind::Block => {
                self.advance();
                self.parse_block_tag(tag_loc)
            }
            TokenKind::Extends => {
                self.advance();
                let template = self.parse_expression()?;
                self.expect_block_end()?;
                Ok(Node::Extends {
                    template: Box::new(template),
                    loc: tag_loc,
                })
            }
            TokenKind::Include => {
                self.advance();
                self.parse_include(tag_loc)
            }
            TokenKind::Macro => {
                self.advance();
                self.parse_macro(tag_loc)
            }
            TokenKind::Call => {
                self.advance();
                self.parse_call_block(tag_loc)
            }
            TokenKind::Import => {
                self.advance();
                let template = self.parse_expression()?;
                self.expect(TokenKind::As)?;
                let (alias, _) = self.expect_ident()?;
                self.expect_block_end()?;
                Ok(Node::Import {
                    template: Box::new(template),
                    alias,
                    loc: tag_loc,
                })
            }
            TokenKind::From => {
                self.advance();
                self.parse_from(tag_loc)
            }
            TokenKind::Set => {
                self.advance();
                self.parse_set(tag_loc)
            }
            TokenKind::With => {
                self.advance();
                self.parse_with(tag_loc)
            }
            TokenKind::Filter => {
                self.advance();
                self.parse_filter_block(tag_loc)
            }
            TokenKind::Raw => {
                self.advance();
                self.parse_raw(tag_loc)
            }
            TokenKind::Autoescape => {
                self.advance();
                self.parse_autoescape(tag_loc)
            }
            TokenKind::Do => {
                self.advance();
                let expression = self.parse_expression()?;
                self.expect_block_end()?;
                Ok(Node::Do {
                    expression: Box::new(expression),
                    loc: tag_loc,
                })
            }
            TokenKind::Ident => {
                let tag = self.current().value.clone();
                if let Some(extensions) = self.extensions
                    && let Some(extension) = extensions.extension_for_tag(&tag)
                {
                    self.advance();
                    let mut facade = TagParser {
                        parser: self,
                        extension: extension.clone(),
                        tag: tag.clone(),
                        loc: tag_loc,
                    };
                    return extensions.parse_tag(&extension, &tag, &mut facade);
                }
                Err(ParseError::new(format!("unknown tag '{tag}'"), self.loc()))
            }
            _ => Err(ParseError::unexpected(
                "a tag keyword",
                self.current().describe(),
                self.loc(),
            )),
        }
    }

    fn parse_if(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let condition = self.parse_expression()?;
        self.expect_block_end()?;
        let stops = [TokenKind::Elif, TokenKind::Else, TokenKind::Endif];
        let (body, mut stop) = self.parse_body(&stops, &[])?;

        let mut elifs = Vec::new();
        while stop.kind == TokenKind::Elif {
            let elif_condition = self.parse_expression()?;
            self.expect_block_end()?;
            let (elif_body, next_stop) = self.parse_body(&stops, &[])?;
            elifs.push((elif_condition, elif_body));
            stop = next_stop;
        }

        let mut else_body = Vec::new();
        if stop.kind == TokenKind::Else {
            self.expect_block_end()?;
            let (nodes, _) = self.parse_body(&[TokenKind::Endif], &[])?;
            else_body = nodes;
        }
        self.expect_block_end()?;

        Ok(Node::If {
            condition: Box::new(condition),
            body,
            elifs,
            else_body,
            loc,
        })
    }

    fn parse_for(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let mut targets = Vec::new();
        loop {
            let (name, _) = self.expect_ident()?;
            targets.push(name);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::In)?;
        // the ternary `if` would swallow the loop filter, so it is disabled
        // for the iterable expression
        let iterable = self.parse_filtered()?;

        let filter = if self.eat(TokenKind::If) {
            Some(Box::new(self.parse_filtered()?))
        } else {
            None
        };
        let recursive = self.eat(TokenKind::Recursive);
        self.expect_block_end()?;

        let (body, stop) = self.parse_body(&[TokenKind::Else, TokenKind::Endfor], &[])?;
        let mut else_body = Vec::new();
        if stop.kind == TokenKind::Else {
            self.expect_block_end()?;
            let (nodes, _) = self.parse_body(&[TokenKind::Endfor], &[])?;
            else_body = nodes;
        }
        self.expect_block_end()?;

        Ok(Node::For {
            targets,
            iterable: Box::new(iterable),
            filter,
            recursive,
            body,
            else_body,
            loc,
        })
    }

    fn parse_block_tag(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let (name, _) = self.expect_ident()?;
        let scoped = if self.check_ident("scoped") {
            self.advance();
            true
        } else {
            false
        };
        self.expect_block_end()?;
        let (body, _) = self.parse_body(&[TokenKind::Endblock], &[])?;
        // `{% endblock name %}` is allowed and checked
        if self.check(TokenKind::Ident) {
            let token = self.advance();
            if token.value != name {
                return Err(ParseError::new(
                    format!("mismatched end tag: expected 'endblock {name}', found 'endblock {}'", token.value),
                    token.loc,
                ));
            }
        }
        self.expect_block_end()?;
        Ok(Node::Block {
            name,
            scoped,
            body,
            loc,
        })
    }

    fn parse_include(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let template = self.parse_expression()?;
        let mut ignore_missing = false;
        if self.eat(TokenKind::Ignore) {
            self.expect(TokenKind::Missing)?;
            ignore_missing = true;
        }
        let mut with_context = true;
        if self.check(TokenKind::With) {
            self.advance();
            self.expect_context_word()?;
        } else if self.check_ident("without") {
            self.advance();
            self.expect_context_word()?;
            with_context = false;
        }
        self.expect_block_end()?;
        Ok(Node::Include {
            template: Box::new(template),
            with_context,
            ignore_missing,
            loc,
        })
    }

    fn expect_context_word(&mut self) -> Result<(), ParseError> {
        if self.check_ident("context") {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::unexpected("'context'", self.current().describe(), self.loc()))
        }
    }

    fn parse_macro(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let (name, _) = self.expect_ident()?;
        self.expect(TokenKind::LeftParen)?;
        let mut params = Vec::new();
        let mut defaults = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let (param, _) = self.expect_ident()?;
                if self.eat(TokenKind::Assign) {
                    let default = self.parse_expression()?;
                    defaults.push((param.clone(), default));
                }
                params.push(param);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen)?;
        self.expect_block_end()?;
        let (body, _) = self.parse_body(&[TokenKind::Endmacro], &[])?;
        self.expect_block_end()?;
        Ok(Node::Macro {
            name,
            params,
            defaults,
            body,
            loc,
        })
    }

    fn parse_call_block(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let call = self.parse_expression()?;
        if !matches!(call, Node::Call { .. }) {
            return Err(ParseError::new("'call' expects a macro invocation", call.loc()));
        }
        self.expect_block_end()?;
        let (body, _) = self.parse_body(&[TokenKind::Endcall], &[])?;
        self.expect_block_end()?;
        Ok(Node::CallBlock {
            call: Box::new(call),
            body,
            loc,
        })
    }

    fn parse_from(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let template = self.parse_expression()?;
        self.expect(TokenKind::Import)?;
        let mut names = Vec::new();
        loop {
            let (name, _) = self.expect_ident()?;
            let alias = if self.eat(TokenKind::As) {
                Some(self.expect_ident()?.0)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect_block_end()?;
        Ok(Node::FromImport {
            template: Box::new(template),
            names,
            loc,
        })
    }

    fn parse_set(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let mut targets: SmallVec<[String; 2]> = SmallVec::new();
        loop {
            let (name, _) = self.expect_ident()?;
            targets.push(name);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        if self.eat(TokenKind::Assign) {
            let value = self.parse_expression()?;
            self.expect_block_end()?;
            return Ok(Node::Set {
                targets: targets.into_vec(),
                value: Box::new(value),
                loc,
            });
        }
        // block form binds the rendered body to a single name
        if targets.len() != 1 {
            return Err(ParseError::new("block-form 'set' takes exactly one target", loc));
        }
        self.expect_block_end()?;
        let (body, _) = self.parse_body(&[TokenKind::Endset], &[])?;
        self.expect_block_end()?;
        Ok(Node::SetBlock {
            name: targets.into_iter().next().expect("one target"),
            body,
            loc,
        })
    }

    fn parse_with(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let mut bindings = Vec::new();
        while !self.kind().is_block_end() {
            let (name, _) = self.expect_ident()?;
            self.expect(TokenKind::Assign)?;
            let value = self.parse_expression()?;
            bindings.push((name, value));
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect_block_end()?;
        let (body, _) = self.parse_body(&[TokenKind::Endwith], &[])?;
        self.expect_block_end()?;
        Ok(Node::With { bindings, body, loc })
    }

    fn parse_filter_block(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let mut filters = vec![self.parse_filter_call()?];
        while self.eat(TokenKind::Pipe) {
            filters.push(self.parse_filter_call()?);
        }
        self.expect_block_end()?;
        let (body, _) = self.parse_body(&[TokenKind::Endfilter], &[])?;
        self.expect_block_end()?;
        Ok(Node::FilterBlock { filters, body, loc })
    }

    fn parse_filter_call(&mut self) -> Result<FilterCall, ParseError> {
        let (name, loc) = self.expect_ident()?;
        let (args, kwargs) = if self.eat(TokenKind::LeftParen) {
            self.parse_call_args()?
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(FilterCall {
            name,
            args,
            kwargs,
            loc,
        })
    }

    fn parse_raw(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        self.expect_block_end()?;
        let content = if self.check(TokenKind::Text) {
            self.advance().value.clone()
        } else {
            String::new()
        };
        if !matches!(self.kind(), TokenKind::BlockStart | TokenKind::BlockStartTrim) {
            return Err(ParseError::unclosed_tag("raw", loc));
        }
        self.advance();
        self.expect(TokenKind::Endraw)?;
        self.expect_block_end()?;
        Ok(Node::Raw { content, loc })
    }

    fn parse_autoescape(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        let enabled = self.parse_expression()?;
        self.expect_block_end()?;
        let (body, _) = self.parse_body(&[TokenKind::Endautoescape], &[])?;
        self.expect_block_end()?;
        Ok(Node::Autoescape {
            enabled: Box::new(enabled),
            body,
            loc,
        })
    }

    // ------------------------------------------------------------------
    // expressions, lowest precedence first
    // ------------------------------------------------------------------

    pub(crate) fn parse_expression(&mut self) -> Result<Node, ParseError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Node, ParseError> {
        let expr = self.parse_filtered()?;
        if self.check(TokenKind::If) {
            let loc = self.advance().loc;
            let condition = self.parse_filtered()?;
            self.expect(TokenKind::Else)?;
            let else_expr = self.parse_ternary()?;
            return Ok(Node::Ternary {
                condition: Box::new(condition),
                then_expr: Box::new(expr),
                else_expr: Box::new(else_expr),
                loc,
            });
        }
        Ok(expr)
    }

    /// Filters sit just above the ternary: `a or b | f` applies `f` to the
    /// whole disjunction.
    fn parse_filtered(&mut self) -> Result<Node, ParseError> {
        let mut expr = self.parse_or()?;
        while self.eat(TokenKind::Pipe) {
            let call = self.parse_filter_call()?;
            expr = Node::Filter {
                target: Box::new(expr),
                call,
            };
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.check(TokenKind::Or) {
            let loc = self.advance().loc;
            let rhs = self.parse_and()?;
            lhs = Node::BinaryOp {
                op: BinaryOperator::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_not()?;
        while self.check(TokenKind::And) {
            let loc = self.advance().loc;
            let rhs = self.parse_not()?;
            lhs = Node::BinaryOp {
                op: BinaryOperator::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Node, ParseError> {
        if self.check(TokenKind::Not) {
            let loc = self.advance().loc;
            let operand = self.parse_not()?;
            return Ok(Node::UnaryOp {
                op: UnaryOperator::Not,
                operand: Box::new(operand),
                loc,
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_concat()?;
        loop {
            let op = match self.kind() {
                TokenKind::Eq => BinaryOperator::Eq,
                TokenKind::Ne => BinaryOperator::Ne,
                TokenKind::Lt => BinaryOperator::Lt,
                TokenKind::Le => BinaryOperator::Le,
                TokenKind::Gt => BinaryOperator::Gt,
                TokenKind::Ge => BinaryOperator::Ge,
                TokenKind::In => BinaryOperator::In,
                TokenKind::Not if self.peek().kind == TokenKind::In => BinaryOperator::NotIn,
                TokenKind::Is => {
                    lhs = self.parse_test(lhs)?;
                    continue;
                }
                _ => return Ok(lhs),
            };
            let loc = self.advance().loc;
            if op == BinaryOperator::NotIn {
                self.advance(); // the `in`
            }
            let rhs = self.parse_concat()?;
            lhs = Node::BinaryOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
    }

    /// `target is [not] name[(args)]`
    fn parse_test(&mut self, target: Node) -> Result<Node, ParseError> {
        let loc = self.advance().loc; // the `is`
        let negate = self.eat(TokenKind::Not);
        let name = match self.kind() {
            TokenKind::Ident => self.advance().value.clone(),
            // `x is none` lexes the literal keyword; it names the test here
            TokenKind::None => {
                self.advance();
                "none".to_owned()
            }
            TokenKind::True => {
                self.advance();
                "true".to_owned()
            }
            TokenKind::False => {
                self.advance();
                "false".to_owned()
            }
            _ => {
                return Err(ParseError::unexpected("a test name", self.current().describe(), self.loc()));
            }
        };
        let args = if self.eat(TokenKind::LeftParen) {
            let (args, kwargs) = self.parse_call_args()?;
            if let Some((kw, _)) = kwargs.first() {
                return Err(ParseError::new(
                    format!("test '{name}' does not accept keyword argument '{kw}'"),
                    loc,
                ));
            }
            args
        } else {
            Vec::new()
        };
        Ok(Node::Test {
            target: Box::new(target),
            name,
            args,
            negate,
            loc,
        })
    }

    fn parse_concat(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_additive()?;
        while self.check(TokenKind::Tilde) {
            let loc = self.advance().loc;
            let rhs = self.parse_additive()?;
            lhs = Node::BinaryOp {
                op: BinaryOperator::Concat,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.kind() {
                TokenKind::Plus => BinaryOperator::Add,
                TokenKind::Minus => BinaryOperator::Sub,
                _ => return Ok(lhs),
            };
            let loc = self.advance().loc;
            let rhs = self.parse_multiplicative()?;
            lhs = Node::BinaryOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.kind() {
                TokenKind::Star => BinaryOperator::Mul,
                TokenKind::Slash => BinaryOperator::Div,
                TokenKind::SlashSlash => BinaryOperator::FloorDiv,
                TokenKind::Percent => BinaryOperator::Mod,
                _ => return Ok(lhs),
            };
            let loc = self.advance().loc;
            let rhs = self.parse_unary()?;
            lhs = Node::BinaryOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Node, ParseError> {
        let op = match self.kind() {
            TokenKind::Minus => UnaryOperator::Neg,
            TokenKind::Plus => UnaryOperator::Pos,
            _ => return self.parse_power(),
        };
        let loc = self.advance().loc;
        let operand = self.parse_unary()?;
        Ok(Node::UnaryOp {
            op,
            operand: Box::new(operand),
            loc,
        })
    }

    fn parse_power(&mut self) -> Result<Node, ParseError> {
        let base = self.parse_postfix()?;
        if self.check(TokenKind::StarStar) {
            let loc = self.advance().loc;
            // right-associative
            let exponent = self.parse_unary()?;
            return Ok(Node::BinaryOp {
                op: BinaryOperator::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
                loc,
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Node, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.kind() {
                TokenKind::Dot => {
                    let loc = self.advance().loc;
                    let (name, _) = self.expect_ident()?;
                    expr = Node::Attribute {
                        object: Box::new(expr),
                        name,
                        loc,
                    };
                }
                TokenKind::LeftBracket => {
                    let loc = self.advance().loc;
                    expr = self.parse_subscript_or_slice(expr, loc)?;
                }
                TokenKind::LeftParen => {
                    let loc = self.advance().loc;
                    let (args, kwargs) = self.parse_call_args()?;
                    expr = Node::Call {
                        callee: Box::new(expr),
                        args,
                        kwargs,
                        loc,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_subscript_or_slice(&mut self, target: Node, loc: CodeLoc) -> Result<Node, ParseError> {
        let start = if self.check(TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        if !self.check(TokenKind::Colon) {
            self.expect(TokenKind::RightBracket)?;
            return Ok(Node::Subscript {
                object: Box::new(target),
                index: start.expect("subscript index"),
                loc,
            });
        }
        self.advance(); // first colon
        let stop = if self.check(TokenKind::Colon) || self.check(TokenKind::RightBracket) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        let step = if self.eat(TokenKind::Colon) {
            if self.check(TokenKind::RightBracket) {
                None
            } else {
                Some(Box::new(self.parse_expression()?))
            }
        } else {
            None
        };
        self.expect(TokenKind::RightBracket)?;
        Ok(Node::Slice {
            target: Box::new(target),
            start,
            stop,
            step,
            loc,
        })
    }

    /// Arguments after an opening parenthesis, including `name=value`
    /// keywords; consumes the closing parenthesis.
    fn parse_call_args(&mut self) -> Result<(Vec<Node>, Vec<(String, Node)>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Node)> = Vec::new();
        while !self.check(TokenKind::RightParen) {
            if self.check(TokenKind::Ident) && self.peek().kind == TokenKind::Assign {
                let (name, name_loc) = self.expect_ident()?;
                self.advance(); // `=`
                let value = self.parse_expression()?;
                if kwargs.iter().any(|(existing, _)| *existing == name) {
                    return Err(ParseError::new(format!("duplicate keyword argument '{name}'"), name_loc));
                }
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(ParseError::new(
                        "positional argument follows keyword argument",
                        self.loc(),
                    ));
                }
                args.push(self.parse_expression()?);
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen)?;
        Ok((args, kwargs))
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        let token = self.current();
        let loc = token.loc;
        match token.kind {
            TokenKind::Int => {
                let token = self.advance();
                let value = token.value.parse::<i64>().map_err(|_| {
                    ParseError::new(format!("integer literal {:?} out of range", token.value), loc)
                })?;
                Ok(Node::Literal {
                    value: LiteralValue::Int(value),
                    loc,
                })
            }
            TokenKind::Float => {
                let token = self.advance();
                let value = token
                    .value
                    .parse::<f64>()
                    .map_err(|_| ParseError::new(format!("invalid float literal {:?}", token.value), loc))?;
                Ok(Node::Literal {
                    value: LiteralValue::Float(value),
                    loc,
                })
            }
            TokenKind::Str => {
                let token = self.advance();
                Ok(Node::Literal {
                    value: LiteralValue::Str(token.value.clone()),
                    loc,
                })
            }
            TokenKind::True | TokenKind::False => {
                let value = token.kind == TokenKind::True;
                self.advance();
                Ok(Node::Literal {
                    value: LiteralValue::Bool(value),
                    loc,
                })
            }
            TokenKind::None => {
                self.advance();
                Ok(Node::Literal {
                    value: LiteralValue::None,
                    loc,
                })
            }
            TokenKind::Ident => {
                let token = self.advance();
                Ok(Node::Identifier {
                    name: token.value.clone(),
                    loc,
                })
            }
            TokenKind::Super => {
                self.advance();
                self.expect(TokenKind::LeftParen)?;
                self.expect(TokenKind::RightParen)?;
                Ok(Node::Super { loc })
            }
            TokenKind::LeftParen => {
                self.advance();
                self.parse_paren(loc)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(TokenKind::RightBracket) {
                    items.push(self.parse_expression()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RightBracket)?;
                Ok(Node::List { items, loc })
            }
            TokenKind::LeftBrace => {
                self.advance();
                let mut pairs = Vec::new();
                while !self.check(TokenKind::RightBrace) {
                    let key = self.parse_expression()?;
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_expression()?;
                    pairs.push((key, value));
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RightBrace)?;
                Ok(Node::Dict { pairs, loc })
            }
            _ => Err(ParseError::unexpected(
                "an expression",
                self.current().describe(),
                loc,
            )),
        }
    }

    /// `(expr)` groups; `(a, b)` and `(a,)` are tuples; `()` is the empty
    /// tuple.
    fn parse_paren(&mut self, loc: CodeLoc) -> Result<Node, ParseError> {
        if self.eat(TokenKind::RightParen) {
            return Ok(Node::Tuple { items: Vec::new(), loc });
        }
        let first = self.parse_expression()?;
        if self.eat(TokenKind::Comma) {
            let mut items = vec![first];
            while !self.check(TokenKind::RightParen) {
                items.push(self.parse_expression()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RightParen)?;
            return Ok(Node::Tuple { items, loc });
        }
        self.expect(TokenKind::RightParen)?;
        Ok(first)
    }
}

fn describe_stops(stop_kinds: &[TokenKind], stop_idents: &[&str]) -> String {
    let mut names: Vec<String> = stop_kinds.iter().map(|k| format!("'{k}'")).collect();
    names.extend(stop_idents.iter().map(|s| format!("'{s}'")));
    names.join(" or ")
}

/// Parser façade handed to extension parse hooks.
///
/// Exposes just enough of the parser for a tag handler to consume its own
/// syntax: token access, expression parsing, argument lists, block bodies,
/// and a constructor for the extension's AST node.
pub struct TagParser<'p, 't> {
    parser: &'p mut Parser<'t>,
    extension: String,
    tag: String,
    loc: CodeLoc,
}

impl TagParser<'_, '_> {
    #[must_use]
    pub fn current(&self) -> &Token {
        self.parser.current()
    }

    #[must_use]
    pub fn peek(&self) -> &Token {
        self.parser.peek()
    }

    pub fn advance(&mut self) -> Token {
        self.parser.advance().clone()
    }

    #[must_use]
    pub fn check(&self, kind: TokenKind) -> bool {
        self.parser.check(kind)
    }

    #[must_use]
    pub fn check_any(&self, kinds: &[TokenKind]) -> bool {
        kinds.iter().any(|k| self.parser.check(*k))
    }

    pub fn parse_expression(&mut self) -> Result<Node, ParseError> {
        self.parser.parse_expression()
    }

    /// Comma-separated expressions up to (not including) the block end.
    pub fn parse_arguments(&mut self) -> Result<Vec<Node>, ParseError> {
        let mut args = Vec::new();
        while !self.parser.kind().is_block_end() {
            args.push(self.parser.parse_expression()?);
            if !self.parser.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(args)
    }

    pub fn expect_block_end(&mut self) -> Result<(), ParseError> {
        self.parser.expect_block_end()
    }

    /// Parses body nodes until `{% <end_tag> %}` and consumes that tag.
    pub fn parse_block(&mut self, end_tag: &str) -> Result<Vec<Node>, ParseError> {
        let (body, _) = self.parser.parse_body(&[], &[end_tag])?;
        self.parser.expect_block_end()?;
        Ok(body)
    }

    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.parser.loc())
    }

    /// Builds this tag's extension node.
    #[must_use]
    pub fn extension_node(&self, args: Vec<Node>, body: Vec<Node>) -> Node {
        Node::Extension {
            extension: self.extension.clone(),
            tag: self.tag.clone(),
            args,
            body,
            loc: self.loc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::{SyntaxConfig, tokenize};

    fn parse_source(source: &str) -> Result<Node, ParseError> {
        let tokens = tokenize(source, &SyntaxConfig::default()).unwrap();
        let tokens = crate::whitespace::apply(tokens, false, false);
        parse(&tokens, "<test>", None)
    }

    fn children(node: Node) -> Vec<Node> {
        match node {
            Node::Template { children, .. } => children,
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn variable_expression() {
        let nodes = children(parse_source("Hello {{ name }}!").unwrap());
        assert_eq!(nodes.len(), 3);
        assert!(matches!(&nodes[1], Node::Variable { .. }));
    }

    #[test]
    fn filter_binds_looser_than_or() {
        let nodes = children(parse_source("{{ a or b | upper }}").unwrap());
        let Node::Variable { expression, .. } = &nodes[0] else {
            panic!("expected variable");
        };
        let Node::Filter { target, call } = expression.as_ref() else {
            panic!("expected the filter at the top: {expression:?}");
        };
        assert_eq!(call.name, "upper");
        assert!(matches!(target.as_ref(), Node::BinaryOp { op: BinaryOperator::Or, .. }));
    }

    #[test]
    fn power_is_right_associative() {
        let nodes = children(parse_source("{{ 2 ** 3 ** 2 }}").unwrap());
        let Node::Variable { expression, .. } = &nodes[0] else {
            panic!("expected variable");
        };
        let Node::BinaryOp { op: BinaryOperator::Pow, rhs, .. } = expression.as_ref() else {
            panic!("expected pow");
        };
        assert!(matches!(rhs.as_ref(), Node::BinaryOp { op: BinaryOperator::Pow, .. }));
    }

    #[test]
    fn if_elif_else() {
        let nodes = children(parse_source("{% if a %}1{% elif b %}2{% elif c %}3{% else %}4{% endif %}").unwrap());
        let Node::If { elifs, else_body, .. } = &nodes[0] else {
            panic!("expected if");
        };
        assert_eq!(elifs.len(), 2);
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn for_with_filter_and_recursive() {
        let nodes = children(parse_source("{% for k, v in items if v recursive %}x{% else %}y{% endfor %}").unwrap());
        let Node::For {
            targets,
            filter,
            recursive,
            else_body,
            ..
        } = &nodes[0]
        else {
            panic!("expected for");
        };
        assert_eq!(targets, &["k".to_owned(), "v".to_owned()]);
        assert!(filter.is_some());
        assert!(*recursive);
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn macro_signature_with_defaults() {
        let nodes = children(parse_source(r#"{% macro m(a, b="x", c=3) %}{% endmacro %}"#).unwrap());
        let Node::Macro { params, defaults, .. } = &nodes[0] else {
            panic!("expected macro");
        };
        assert_eq!(params, &["a".to_owned(), "b".to_owned(), "c".to_owned()]);
        assert_eq!(defaults.len(), 2);
    }

    #[test]
    fn include_modifiers() {
        let nodes = children(parse_source(r#"{% include "x.html" ignore missing without context %}"#).unwrap());
        let Node::Include {
            with_context,
            ignore_missing,
            ..
        } = &nodes[0]
        else {
            panic!("expected include");
        };
        assert!(!with_context);
        assert!(ignore_missing);
    }

    #[test]
    fn set_forms() {
        let nodes = children(parse_source("{% set a, b = pair %}{% set c %}body{% endset %}").unwrap());
        assert!(matches!(&nodes[0], Node::Set { targets, .. } if targets.len() == 2));
        assert!(matches!(&nodes[1], Node::SetBlock { name, .. } if name == "c"));
    }

    #[test]
    fn slice_forms() {
        let nodes = children(parse_source("{{ a[1:2:3] }}{{ a[:2] }}{{ a[1] }}").unwrap());
        let exprs: Vec<_> = nodes
            .iter()
            .map(|n| match n {
                Node::Variable { expression, .. } => expression.as_ref(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert!(matches!(exprs[0], Node::Slice { .. }));
        assert!(matches!(exprs[1], Node::Slice { start: None, .. }));
        assert!(matches!(exprs[2], Node::Subscript { .. }));
    }

    #[test]
    fn test_expression_negated() {
        let nodes = children(parse_source("{% if x is not defined %}{% endif %}").unwrap());
        let Node::If { condition, .. } = &nodes[0] else {
            panic!("expected if");
        };
        let Node::Test { name, negate, .. } = condition.as_ref() else {
            panic!("expected test, got {condition:?}");
        };
        assert_eq!(name, "defined");
        assert!(*negate);
    }

    #[test]
    fn mismatched_end_tag_is_rejected() {
        let err = parse_source("{% block a %}{% endblock b %}").unwrap_err();
        assert!(err.message.contains("mismatched end tag"), "{}", err.message);
    }

    #[test]
    fn missing_end_tag_is_rejected() {
        let err = parse_source("{% if a %}x").unwrap_err();
        assert!(err.message.contains("unexpected end of template"), "{}", err.message);
    }

    #[test]
    fn unknown_tag_without_extension() {
        let err = parse_source("{% widget %}").unwrap_err();
        assert!(err.message.contains("unknown tag"), "{}", err.message);
    }

    #[test]
    fn raw_block_keeps_interior() {
        let nodes = children(parse_source("{% raw %}{{ x }}{% endraw %}").unwrap());
        assert!(matches!(&nodes[0], Node::Raw { content, .. } if content == "{{ x }}"));
    }

    #[test]
    fn ternary_in_variable() {
        let nodes = children(parse_source("{{ a if b else c }}").unwrap());
        let Node::Variable { expression, .. } = &nodes[0] else {
            panic!("expected variable");
        };
        assert!(matches!(expression.as_ref(), Node::Ternary { .. }));
    }
}
