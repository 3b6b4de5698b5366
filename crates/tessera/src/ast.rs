use strum::Display;

use crate::error::CodeLoc;

/// Binary operators of the expression grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BinaryOperator {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "//")]
    FloorDiv,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "**")]
    Pow,
    #[strum(serialize = "~")]
    Concat,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "not in")]
    NotIn,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UnaryOperator {
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "+")]
    Pos,
    #[strum(serialize = "not")]
    Not,
}

/// Literal constant appearing in template source.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
}

/// One link of a filter chain: `name(args, kw=expr)`.
///
/// Used both by filter expressions desugared during parsing and by
/// `{% filter ... %}` blocks, which apply a whole chain to rendered output.
#[derive(Debug, Clone)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<Node>,
    pub kwargs: Vec<(String, Node)>,
    pub loc: CodeLoc,
}

/// The tagged AST node tree rooted at [`Node::Template`].
///
/// Expressions and statements share one enum; child vectors are ordered and
/// ordering is significant. Every variant carries the source position of the
/// construct that produced it. Parsed trees are immutable: they are shared
/// across renders behind `Arc`, so nothing in the evaluator may mutate them.
#[derive(Debug, Clone)]
pub enum Node {
    Text {
        content: String,
        loc: CodeLoc,
    },
    Comment {
        content: String,
        loc: CodeLoc,
    },
    Raw {
        content: String,
        loc: CodeLoc,
    },
    /// `{{ expression }}`
    Variable {
        expression: Box<Node>,
        loc: CodeLoc,
    },
    Literal {
        value: LiteralValue,
        loc: CodeLoc,
    },
    Identifier {
        name: String,
        loc: CodeLoc,
    },
    BinaryOp {
        op: BinaryOperator,
        lhs: Box<Node>,
        rhs: Box<Node>,
        loc: CodeLoc,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Node>,
        loc: CodeLoc,
    },
    /// `then if condition else otherwise`
    Ternary {
        condition: Box<Node>,
        then_expr: Box<Node>,
        else_expr: Box<Node>,
        loc: CodeLoc,
    },
    Attribute {
        object: Box<Node>,
        name: String,
        loc: CodeLoc,
    },
    Subscript {
        object: Box<Node>,
        index: Box<Node>,
        loc: CodeLoc,
    },
    Slice {
        target: Box<Node>,
        start: Option<Box<Node>>,
        stop: Option<Box<Node>>,
        step: Option<Box<Node>>,
        loc: CodeLoc,
    },
    /// `target|name(args)`
    Filter {
        target: Box<Node>,
        call: FilterCall,
    },
    /// `target is name(args)` / `target is not name`
    Test {
        target: Box<Node>,
        name: String,
        args: Vec<Node>,
        negate: bool,
        loc: CodeLoc,
    },
    Call {
        callee: Box<Node>,
        args: Vec<Node>,
        kwargs: Vec<(String, Node)>,
        loc: CodeLoc,
    },
    List {
        items: Vec<Node>,
        loc: CodeLoc,
    },
    Dict {
        pairs: Vec<(Node, Node)>,
        loc: CodeLoc,
    },
    Tuple {
        items: Vec<Node>,
        loc: CodeLoc,
    },
    If {
        condition: Box<Node>,
        body: Vec<Node>,
        elifs: Vec<(Node, Vec<Node>)>,
        else_body: Vec<Node>,
        loc: CodeLoc,
    },
    For {
        targets: Vec<String>,
        iterable: Box<Node>,
        filter: Option<Box<Node>>,
        recursive: bool,
        body: Vec<Node>,
        else_body: Vec<Node>,
        loc: CodeLoc,
    },
    Block {
        name: String,
        scoped: bool,
        body: Vec<Node>,
        loc: CodeLoc,
    },
    Extends {
        template: Box<Node>,
        loc: CodeLoc,
    },
    /// `super()` inside an overriding block; replaced by the inheritance
    /// resolver, so the evaluator only sees it when a template with blocks is
    /// rendered without resolution.
    Super {
        loc: CodeLoc,
    },
    Include {
        template: Box<Node>,
        with_context: bool,
        ignore_missing: bool,
        loc: CodeLoc,
    },
    Macro {
        name: String,
        params: Vec<String>,
        defaults: Vec<(String, Node)>,
        body: Vec<Node>,
        loc: CodeLoc,
    },
    /// `{% call macro_call(...) %}body{% endcall %}`
    CallBlock {
        call: Box<Node>,
        body: Vec<Node>,
        loc: CodeLoc,
    },
    /// `{% import "name" as alias %}`
    Import {
        template: Box<Node>,
        alias: String,
        loc: CodeLoc,
    },
    /// `{% from "name" import a, b as c %}`
    FromImport {
        template: Box<Node>,
        names: Vec<(String, Option<String>)>,
        loc: CodeLoc,
    },
    /// Inline form: `{% set a = expr %}` or `{% set a, b = expr %}`.
    Set {
        targets: Vec<String>,
        value: Box<Node>,
        loc: CodeLoc,
    },
    /// Block form: `{% set a %}...{% endset %}`; binds the rendered body.
    SetBlock {
        name: String,
        body: Vec<Node>,
        loc: CodeLoc,
    },
    With {
        bindings: Vec<(String, Node)>,
        body: Vec<Node>,
        loc: CodeLoc,
    },
    FilterBlock {
        filters: Vec<FilterCall>,
        body: Vec<Node>,
        loc: CodeLoc,
    },
    Autoescape {
        enabled: Box<Node>,
        body: Vec<Node>,
        loc: CodeLoc,
    },
    /// `{% do expr %}` evaluates and discards.
    Do {
        expression: Box<Node>,
        loc: CodeLoc,
    },
    /// A tag owned by a registered extension; evaluation is dispatched back
    /// through the extension registry by extension name.
    Extension {
        extension: String,
        tag: String,
        args: Vec<Node>,
        body: Vec<Node>,
        loc: CodeLoc,
    },
    Template {
        name: String,
        children: Vec<Node>,
    },
}

impl Node {
    /// Source position of the construct that produced this node.
    #[must_use]
    pub fn loc(&self) -> CodeLoc {
        match self {
            Self::Text { loc, .. }
            | Self::Comment { loc, .. }
            | Self::Raw { loc, .. }
            | Self::Variable { loc, .. }
            | Self::Literal { loc, .. }
            | Self::Identifier { loc, .. }
            | Self::BinaryOp { loc, .. }
            | Self::UnaryOp { loc, .. }
            | Self::Ternary { loc, .. }
            | Self::Attribute { loc, .. }
            | Self::Subscript { loc, .. }
            | Self::Slice { loc, .. }
            | Self::Test { loc, .. }
            | Self::Call { loc, .. }
            | Self::List { loc, .. }
            | Self::Dict { loc, .. }
            | Self::Tuple { loc, .. }
            | Self::If { loc, .. }
            | Self::For { loc, .. }
            | Self::Block { loc, .. }
            | Self::Extends { loc, .. }
            | Self::Super { loc }
            | Self::Include { loc, .. }
            | Self::Macro { loc, .. }
            | Self::CallBlock { loc, .. }
            | Self::Import { loc, .. }
            | Self::FromImport { loc, .. }
            | Self::Set { loc, .. }
            | Self::SetBlock { loc, .. }
            | Self::With { loc, .. }
            | Self::FilterBlock { loc, .. }
            | Self::Autoescape { loc, .. }
            | Self::Do { loc, .. }
            | Self::Extension { loc, .. } => *loc,
            Self::Filter { call, .. } => call.loc,
            Self::Template { .. } => CodeLoc::start(),
        }
    }

    /// The string value when this expression is a plain string literal.
    /// The inheritance resolver uses this to enforce its literal-name rule.
    #[must_use]
    pub fn as_str_literal(&self) -> Option<&str> {
        match self {
            Self::Literal {
                value: LiteralValue::Str(s),
                ..
            } => Some(s),
            _ => None,
        }
    }
}
