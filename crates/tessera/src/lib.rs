#![doc = include_str!("../../../README.md")]

mod ast;
mod cache;
mod concurrent;
mod context;
mod environment;
mod error;
mod eval;
mod expressions;
mod extensions;
mod filters;
mod inherit;
mod lex;
mod loader;
mod parse;
mod pool;
mod template;
mod tests;
mod value;
mod whitespace;

pub use crate::{
    ast::{BinaryOperator, FilterCall, LiteralValue, Node, UnaryOperator},
    cache::{CacheStats, LruCache, TtlCache},
    concurrent::{ConcurrentRenderer, RenderOutcome},
    context::{Context, CowContext, Frame, Globals},
    environment::{Autoescape, EngineOptions, Environment},
    error::{
        CodeLoc, EngineResult, Error, ExtensionError, InheritanceError, InheritanceErrorKind, LexError, LexErrorKind,
        LoadError, LoadErrorKind, ParseError, RuntimeError, RuntimeErrorKind,
    },
    extensions::{Extension, ExtensionRegistry, TagSpec},
    filters::FilterFunc,
    lex::{SyntaxConfig, Token, TokenKind},
    loader::{
        ChainLoader, EmbeddedLoader, FileSystemLoader, Loader, MemoryLoader, TemplateMetadata, extract_dependencies,
        resolve_name,
    },
    parse::{TagDispatch, TagParser},
    template::Template,
    tests::TestFunc,
    value::{LoopObject, MacroValue, MapKey, Object, TemplateNamespace, Value, ValueMap, html_escape},
};
