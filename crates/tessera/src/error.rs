use std::{error, fmt, io, sync::Arc};

/// Result type alias for fallible engine operations.
pub type EngineResult<T> = Result<T, Error>;

/// A source position, 1-based for both line and column.
///
/// Every token and AST node carries one so that errors surfaced from deep
/// inside a render can point at the offending construct in the template
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CodeLoc {
    pub line: u32,
    pub column: u32,
}

impl CodeLoc {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    /// Position of the start of a template, used for synthesized nodes.
    #[must_use]
    pub fn start() -> Self {
        Self { line: 1, column: 1 }
    }
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Tokenization failure. Always carries the position where the offending
/// construct started, not where the lexer gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub kind: LexErrorKind,
    pub loc: CodeLoc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexErrorKind {
    /// A `{{`, `{%` or `{#` without its matching end delimiter.
    UnclosedDelimiter { open: String },
    UnterminatedString,
    UnexpectedCharacter(char),
}

impl LexError {
    pub(crate) fn unclosed(open: impl Into<String>, loc: CodeLoc) -> Self {
        Self {
            kind: LexErrorKind::UnclosedDelimiter { open: open.into() },
            loc,
        }
    }

    pub(crate) fn unterminated_string(loc: CodeLoc) -> Self {
        Self {
            kind: LexErrorKind::UnterminatedString,
            loc,
        }
    }

    pub(crate) fn unexpected_character(c: char, loc: CodeLoc) -> Self {
        Self {
            kind: LexErrorKind::UnexpectedCharacter(c),
            loc,
        }
    }
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LexErrorKind::UnclosedDelimiter { open } => {
                write!(f, "unclosed '{open}' at {}", self.loc)
            }
            LexErrorKind::UnterminatedString => {
                write!(f, "unterminated string literal at {}", self.loc)
            }
            LexErrorKind::UnexpectedCharacter(c) => {
                write!(f, "unexpected character {c:?} at {}", self.loc)
            }
        }
    }
}

impl error::Error for LexError {}

/// Parse failure with the expected/actual shape of the offending token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub loc: CodeLoc,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>, loc: CodeLoc) -> Self {
        Self {
            message: message.into(),
            loc,
        }
    }

    pub(crate) fn unexpected(expected: &str, found: impl fmt::Display, loc: CodeLoc) -> Self {
        Self::new(format!("expected {expected}, found {found}"), loc)
    }

    pub(crate) fn unclosed_tag(tag: &str, loc: CodeLoc) -> Self {
        Self::new(format!("'{tag}' tag is never closed"), loc)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.message, self.loc)
    }
}

impl error::Error for ParseError {}

/// Template lookup or read failure. Carries the template name as given to
/// the loader, before canonicalization when canonicalization itself failed.
#[derive(Debug, Clone)]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum LoadErrorKind {
    NotFound,
    /// Names containing `..` are rejected outright.
    PathTraversal,
    Read(String),
    /// The environment has no loader configured at all.
    NoLoader,
}

impl LoadError {
    pub(crate) fn not_found(name: impl Into<String>) -> Self {
        Self {
            kind: LoadErrorKind::NotFound,
            name: name.into(),
        }
    }

    pub(crate) fn path_traversal(name: impl Into<String>) -> Self {
        Self {
            kind: LoadErrorKind::PathTraversal,
            name: name.into(),
        }
    }

    pub(crate) fn read(name: impl Into<String>, err: &io::Error) -> Self {
        Self {
            kind: LoadErrorKind::Read(err.to_string()),
            name: name.into(),
        }
    }

    pub(crate) fn no_loader(name: impl Into<String>) -> Self {
        Self {
            kind: LoadErrorKind::NoLoader,
            name: name.into(),
        }
    }

    /// True when the failure means "this template does not exist", which is
    /// the only class of failure `ignore missing` swallows.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, LoadErrorKind::NotFound | LoadErrorKind::NoLoader)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LoadErrorKind::NotFound => write!(f, "template {:?} not found", self.name),
            LoadErrorKind::PathTraversal => {
                write!(f, "template name {:?} contains '..'", self.name)
            }
            LoadErrorKind::Read(err) => write!(f, "failed to read template {:?}: {err}", self.name),
            LoadErrorKind::NoLoader => {
                write!(f, "cannot load template {:?}: no loader configured", self.name)
            }
        }
    }
}

impl error::Error for LoadError {}

/// Failure while flattening the `extends`/`block`/`include` graph.
#[derive(Debug, Clone)]
pub struct InheritanceError {
    pub kind: InheritanceErrorKind,
}

#[derive(Debug, Clone)]
pub enum InheritanceErrorKind {
    /// The extends/include graph revisited a template.
    Cycle { chain: Vec<String> },
    /// A referenced template failed to load and `ignore missing` was not set.
    Missing { cause: LoadError },
    /// `extends`/static `include` targets must be string literals; see the
    /// resolver documentation for the restriction.
    NonLiteralName { tag: &'static str, loc: CodeLoc },
}

impl InheritanceError {
    pub(crate) fn cycle(chain: Vec<String>) -> Self {
        Self {
            kind: InheritanceErrorKind::Cycle { chain },
        }
    }

    pub(crate) fn missing(cause: LoadError) -> Self {
        Self {
            kind: InheritanceErrorKind::Missing { cause },
        }
    }

    pub(crate) fn non_literal_name(tag: &'static str, loc: CodeLoc) -> Self {
        Self {
            kind: InheritanceErrorKind::NonLiteralName { tag, loc },
        }
    }
}

impl fmt::Display for InheritanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InheritanceErrorKind::Cycle { chain } => {
                write!(f, "template inheritance cycle: {}", chain.join(" -> "))
            }
            InheritanceErrorKind::Missing { cause } => write!(f, "{cause}"),
            InheritanceErrorKind::NonLiteralName { tag, loc } => {
                write!(f, "'{tag}' target must be a string literal at {loc}")
            }
        }
    }
}

impl error::Error for InheritanceError {}

/// Evaluation failure, tagged with the offending node's source location and,
/// once it crossed a template boundary on the way up, the template name.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub loc: Option<CodeLoc>,
    pub template: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RuntimeErrorKind {
    /// Use of an unbound variable under `strict_undefined`.
    UndefinedVariable(String),
    UnknownFilter(String),
    UnknownTest(String),
    NotCallable(String),
    DivisionByZero,
    /// Operand types don't fit the operator or construct.
    Type(String),
    /// Macro arity problems: missing required parameter, unknown keyword,
    /// too many positional arguments.
    Arity(String),
    NotIterable(String),
    /// `for a, b in ...` received an element of the wrong arity.
    UnpackMismatch { expected: usize, got: usize },
    AttributeMiss { name: String, on: String },
    Other(String),
}

impl RuntimeError {
    pub(crate) fn new(kind: RuntimeErrorKind, loc: CodeLoc) -> Self {
        Self {
            kind,
            loc: Some(loc),
            template: None,
        }
    }

    pub(crate) fn unlocated(kind: RuntimeErrorKind) -> Self {
        Self {
            kind,
            loc: None,
            template: None,
        }
    }

    pub(crate) fn type_error(message: impl Into<String>, loc: CodeLoc) -> Self {
        Self::new(RuntimeErrorKind::Type(message.into()), loc)
    }

    pub(crate) fn arity(message: impl Into<String>, loc: CodeLoc) -> Self {
        Self::new(RuntimeErrorKind::Arity(message.into()), loc)
    }

    /// Innermost location wins: only fill position/template when the error
    /// does not already carry one.
    pub(crate) fn with_loc(mut self, loc: CodeLoc) -> Self {
        self.loc.get_or_insert(loc);
        self
    }

    pub(crate) fn with_template(mut self, name: &str) -> Self {
        if self.template.is_none() {
            self.template = Some(name.to_owned());
        }
        self
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RuntimeErrorKind::UndefinedVariable(name) => {
                write!(f, "undefined variable {name:?}")?;
            }
            RuntimeErrorKind::UnknownFilter(name) => write!(f, "unknown filter {name:?}")?,
            RuntimeErrorKind::UnknownTest(name) => write!(f, "unknown test {name:?}")?,
            RuntimeErrorKind::NotCallable(what) => write!(f, "{what} is not callable")?,
            RuntimeErrorKind::DivisionByZero => write!(f, "division by zero")?,
            RuntimeErrorKind::Type(message)
            | RuntimeErrorKind::Arity(message)
            | RuntimeErrorKind::Other(message) => write!(f, "{message}")?,
            RuntimeErrorKind::NotIterable(what) => write!(f, "{what} is not iterable")?,
            RuntimeErrorKind::UnpackMismatch { expected, got } => {
                write!(f, "cannot unpack {got} value(s) into {expected} target(s)")?;
            }
            RuntimeErrorKind::AttributeMiss { name, on } => {
                write!(f, "{on} has no attribute {name:?}")?;
            }
        }
        if let Some(loc) = self.loc {
            write!(f, " at {loc}")?;
        }
        if let Some(template) = &self.template {
            write!(f, " in template {template:?}")?;
        }
        Ok(())
    }
}

impl error::Error for RuntimeError {}

/// Wraps a failure that happened inside an extension hook with enough context
/// to name the extension, the tag, and where rendering stood.
#[derive(Debug, Clone)]
pub struct ExtensionError {
    pub extension: String,
    pub tag: Option<String>,
    pub template: Option<String>,
    pub loc: Option<CodeLoc>,
    pub message: String,
    pub cause: Option<Arc<Error>>,
}

impl ExtensionError {
    pub(crate) fn new(extension: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            tag: None,
            template: None,
            loc: None,
            message: message.into(),
            cause: None,
        }
    }

    pub(crate) fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub(crate) fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub(crate) fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }
}

impl fmt::Display for ExtensionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "extension {:?}", self.extension)?;
        if let Some(tag) = &self.tag {
            write!(f, " (tag {tag:?})")?;
        }
        if let Some(template) = &self.template {
            write!(f, " in template {template:?}")?;
        }
        if let Some(loc) = self.loc {
            write!(f, " at {loc}")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl error::Error for ExtensionError {}

/// Umbrella error for the whole pipeline. Each stage keeps its own type; this
/// is what crosses the public boundary.
#[derive(Debug, Clone)]
pub enum Error {
    Lex(LexError),
    Parse(ParseError),
    Load(LoadError),
    Inheritance(InheritanceError),
    Runtime(RuntimeError),
    Extension(ExtensionError),
}

impl Error {
    /// The load failure behind this error, if that is what it is. Used by
    /// `include ... ignore missing`, which swallows only missing templates.
    #[must_use]
    pub fn as_load_error(&self) -> Option<&LoadError> {
        match self {
            Self::Load(err) => Some(err),
            Self::Inheritance(InheritanceError {
                kind: InheritanceErrorKind::Missing { cause },
            }) => Some(cause),
            _ => None,
        }
    }

    pub(crate) fn locate(self, loc: CodeLoc) -> Self {
        match self {
            Self::Runtime(err) => Self::Runtime(err.with_loc(loc)),
            Self::Extension(mut err) => {
                err.loc.get_or_insert(loc);
                Self::Extension(err)
            }
            other => other,
        }
    }

    pub(crate) fn in_template(self, name: &str) -> Self {
        match self {
            Self::Runtime(err) => Self::Runtime(err.with_template(name)),
            Self::Extension(mut err) => {
                if err.template.is_none() {
                    err.template = Some(name.to_owned());
                }
                Self::Extension(err)
            }
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lex(err) => write!(f, "syntax error: {err}"),
            Self::Parse(err) => write!(f, "parse error: {err}"),
            Self::Load(err) => write!(f, "load error: {err}"),
            Self::Inheritance(err) => write!(f, "inheritance error: {err}"),
            Self::Runtime(err) => write!(f, "render error: {err}"),
            Self::Extension(err) => write!(f, "extension error: {err}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Lex(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Load(err) => Some(err),
            Self::Inheritance(err) => Some(err),
            Self::Runtime(err) => Some(err),
            Self::Extension(err) => Some(err),
        }
    }
}

impl From<LexError> for Error {
    fn from(err: LexError) -> Self {
        Self::Lex(err)
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        Self::Load(err)
    }
}

impl From<InheritanceError> for Error {
    fn from(err: InheritanceError) -> Self {
        Self::Inheritance(err)
    }
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        Self::Runtime(err)
    }
}

impl From<ExtensionError> for Error {
    fn from(err: ExtensionError) -> Self {
        Self::Extension(err)
    }
}
