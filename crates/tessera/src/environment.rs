use std::{
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};

use ahash::AHashMap;

use crate::{
    ast::Node,
    cache::{CacheStats, LruCache},
    context::{Context, Globals},
    error::{EngineResult, Error, ExtensionError, LoadError, RuntimeError, RuntimeErrorKind},
    eval::Evaluator,
    extensions::{Extension, ExtensionRegistry},
    filters::{FilterFunc, default_filters},
    inherit::{self, TemplateSource},
    lex::{self, SyntaxConfig},
    loader::Loader,
    parse::{self, TagDispatch},
    pool::{ContextPool, StringPool},
    template::Template,
    tests::{TestFunc, default_tests},
    value::Value,
    whitespace,
};

/// Initial autoescape state: off, on, or decided per template name.
#[derive(Clone, Default)]
pub enum Autoescape {
    #[default]
    Disabled,
    Enabled,
    ByTemplate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl fmt::Debug for Autoescape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Enabled => f.write_str("Enabled"),
            Self::ByTemplate(_) => f.write_str("ByTemplate(..)"),
        }
    }
}

/// Environment construction options.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub strict_undefined: bool,
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
    pub keep_trailing_newline: bool,
    pub syntax: SyntaxConfig,
    /// Parsed-template cache bound; zero disables the bound.
    pub cache_capacity: usize,
    /// Parsed-template cache TTL; `None` never expires.
    pub cache_ttl: Option<Duration>,
    #[serde(skip)]
    pub autoescape: Autoescape,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            strict_undefined: false,
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: false,
            syntax: SyntaxConfig::default(),
            cache_capacity: 256,
            cache_ttl: None,
            autoescape: Autoescape::default(),
        }
    }
}

/// The engine environment: registries, options, loader, and the parsed
/// template cache.
///
/// Shared and read-mostly: registry mutation goes through locks, parsed
/// templates are immutable behind `Arc`, and any number of renders may run
/// against one environment in parallel. Per-render state lives entirely in
/// the context handed to each render.
pub struct Environment {
    options: EngineOptions,
    filters: RwLock<AHashMap<String, FilterFunc>>,
    tests: RwLock<AHashMap<String, TestFunc>>,
    globals: RwLock<Globals>,
    extensions: ExtensionRegistry,
    loader: Option<Arc<dyn Loader>>,
    templates: LruCache<Arc<Node>>,
    builders: StringPool,
    contexts: ContextPool,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("options", &self.options)
            .field("cache", &self.templates.stats())
            .finish_non_exhaustive()
    }
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    #[must_use]
    pub fn with_options(options: EngineOptions) -> Self {
        let mut filters = AHashMap::new();
        for (name, filter) in default_filters() {
            filters.insert(name.to_owned(), filter);
        }
        let mut tests = AHashMap::new();
        for (name, test) in default_tests() {
            tests.insert(name.to_owned(), test);
        }
        let templates = LruCache::new(options.cache_capacity, options.cache_ttl);
        Self {
            options,
            filters: RwLock::new(filters),
            tests: RwLock::new(tests),
            globals: RwLock::new(Globals::default()),
            extensions: ExtensionRegistry::new(),
            loader: None,
            templates,
            builders: StringPool::default(),
            contexts: ContextPool::default(),
        }
    }

    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn set_loader(&mut self, loader: Arc<dyn Loader>) {
        self.loader = Some(loader);
    }

    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    #[must_use]
    pub fn loader(&self) -> Option<&Arc<dyn Loader>> {
        self.loader.as_ref()
    }

    // ------------------------------------------------------------------
    // registries
    // ------------------------------------------------------------------

    /// Registers a filter; duplicate names are rejected.
    pub fn add_filter<F>(&self, name: &str, filter: F) -> EngineResult<()>
    where
        F: Fn(&Value, &[Value], &[(String, Value)]) -> Result<Value, String> + Send + Sync + 'static,
    {
        let mut filters = self.filters.write().expect("filter registry lock poisoned");
        if filters.contains_key(name) {
            return Err(duplicate("filter", name));
        }
        filters.insert(name.to_owned(), Arc::new(filter));
        Ok(())
    }

    /// Registers a test; duplicate names are rejected.
    pub fn add_test<F>(&self, name: &str, test: F) -> EngineResult<()>
    where
        F: Fn(&Value, &[Value]) -> Result<bool, String> + Send + Sync + 'static,
    {
        let mut tests = self.tests.write().expect("test registry lock poisoned");
        if tests.contains_key(name) {
            return Err(duplicate("test", name));
        }
        tests.insert(name.to_owned(), Arc::new(test));
        Ok(())
    }

    /// Registers a global value; duplicate names are rejected. The globals
    /// map is swapped copy-on-write so in-flight renders keep their
    /// snapshot.
    pub fn add_global(&self, name: &str, value: impl Into<Value>) -> EngineResult<()> {
        let mut globals = self.globals.write().expect("globals lock poisoned");
        if globals.contains_key(name) {
            return Err(duplicate("global", name));
        }
        let mut updated: AHashMap<String, Value> = globals.as_ref().clone();
        updated.insert(name.to_owned(), value.into());
        *globals = Arc::new(updated);
        Ok(())
    }

    pub(crate) fn find_filter(&self, name: &str) -> Option<FilterFunc> {
        self.filters.read().expect("filter registry lock poisoned").get(name).cloned()
    }

    pub(crate) fn find_test(&self, name: &str) -> Option<TestFunc> {
        self.tests.read().expect("test registry lock poisoned").get(name).cloned()
    }

    #[must_use]
    pub fn globals_snapshot(&self) -> Globals {
        self.globals.read().expect("globals lock poisoned").clone()
    }

    pub fn register_extension(&self, extension: Arc<dyn Extension>) -> Result<(), ExtensionError> {
        self.extensions.register(extension)
    }

    #[must_use]
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub(crate) fn builders(&self) -> &StringPool {
        &self.builders
    }

    pub(crate) fn contexts(&self) -> &ContextPool {
        &self.contexts
    }

    pub(crate) fn initial_autoescape(&self, template_name: &str) -> bool {
        match &self.options.autoescape {
            Autoescape::Disabled => false,
            Autoescape::Enabled => true,
            Autoescape::ByTemplate(decide) => decide(template_name),
        }
    }

    // ------------------------------------------------------------------
    // template pipeline
    // ------------------------------------------------------------------

    /// Source → tokens → whitespace pass → AST.
    pub(crate) fn compile_source(&self, source: &str, name: &str) -> EngineResult<Node> {
        let prepared = whitespace::prepare_source(source, self.options.keep_trailing_newline);
        let tokens = lex::tokenize(prepared, &self.options.syntax)?;
        let tokens = whitespace::apply(tokens, self.options.trim_blocks, self.options.lstrip_blocks);
        let dispatch: Option<&dyn TagDispatch> = if self.extensions.is_empty() {
            None
        } else {
            Some(&self.extensions)
        };
        Ok(parse::parse(&tokens, name, dispatch)?)
    }

    /// Loads, parses, resolves, and caches a template by name. Cached
    /// resolved trees are immutable and shared by reference across renders.
    pub(crate) fn load_resolved(&self, name: &str) -> EngineResult<Arc<Node>> {
        let loader = self.loader.as_ref().ok_or_else(|| LoadError::no_loader(name))?;
        let canonical = loader.resolve_template_name(name)?;
        if let Some(cached) = self.templates.get(&canonical) {
            return Ok(cached);
        }
        tracing::debug!(template = %canonical, "compiling template");
        let parsed = self.parsed(&canonical)?;
        let resolved = Arc::new(inherit::resolve(&parsed, &canonical, self)?);
        self.templates.insert(canonical, resolved.clone());
        Ok(resolved)
    }

    /// Looks a template up by name, ready to render.
    pub fn get_template(&self, name: &str) -> EngineResult<Template<'_>> {
        let root = self.load_resolved(name)?;
        let canonical = match root.as_ref() {
            Node::Template { name, .. } => name.clone(),
            _ => name.to_owned(),
        };
        Ok(Template::new(self, canonical, root))
    }

    /// One-shot render of an inline source string.
    pub fn render_str(&self, source: &str, context: &Context) -> EngineResult<String> {
        let parsed = self.compile_source(source, "<string>")?;
        let resolved = inherit::resolve(&parsed, "<string>", self)?;
        self.render_root(&resolved, "<string>", context)
    }

    /// Convenience: `get_template` + render.
    pub fn render_template(&self, name: &str, context: &Context) -> EngineResult<String> {
        self.get_template(name)?.render(context)
    }

    /// The render entry shared by all paths: lifecycle hooks around an
    /// evaluator run against a copy of the caller's context.
    pub(crate) fn render_root(&self, root: &Node, name: &str, context: &Context) -> EngineResult<String> {
        self.extensions.before_render(name)?;

        let mut render_context = context.clone();
        render_context.set_globals(self.globals_snapshot());
        let mut evaluator = Evaluator::new(self, name);
        let result = evaluator.render_template(root, &mut render_context);

        let after = self.extensions.after_render(name);
        match (result, after) {
            (Ok(output), Ok(())) => Ok(output),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // cache surface
    // ------------------------------------------------------------------

    pub fn clear_template_cache(&self) {
        self.templates.clear();
    }

    #[must_use]
    pub fn template_cache_stats(&self) -> CacheStats {
        self.templates.stats()
    }

    #[must_use]
    pub fn is_template_cached(&self, name: &str) -> bool {
        self.loader
            .as_ref()
            .and_then(|loader| loader.resolve_template_name(name).ok())
            .is_some_and(|canonical| self.templates.contains(&canonical))
    }
}

impl TemplateSource for Environment {
    fn parsed(&self, name: &str) -> Result<Node, Error> {
        let loader = self.loader.as_ref().ok_or_else(|| LoadError::no_loader(name))?;
        let canonical = loader.resolve_template_name(name)?;
        let source = loader.get_source(&canonical)?;
        self.compile_source(&source, &canonical)
    }
}

fn duplicate(kind: &str, name: &str) -> Error {
    RuntimeError::unlocated(RuntimeErrorKind::Other(format!("{kind} {name:?} is already registered"))).into()
}
