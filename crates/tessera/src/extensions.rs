//! User-defined tag extensions.
//!
//! Extensions register under a unique name, claim a set of tag names, and
//! may depend on other extensions. Registration is validated (tag
//! collisions, missing dependencies, dependency cycles) and rolled back when
//! the `on_load` hook fails. Lifecycle hooks run in load order before a
//! render and in reverse order after it.

use std::sync::{Arc, RwLock};

use ahash::{AHashMap, AHashSet};

use crate::{
    ast::Node,
    context::Context,
    error::{ExtensionError, ParseError},
    parse::{TagDispatch, TagParser},
    value::Value,
};

/// A tag claimed by an extension. Block extensions also claim their end tag
/// so no other extension can take it.
#[derive(Debug, Clone)]
pub struct TagSpec {
    pub start: String,
    pub end: Option<String>,
}

impl TagSpec {
    #[must_use]
    pub fn inline(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: None,
        }
    }

    #[must_use]
    pub fn block(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: Some(end.into()),
        }
    }
}

/// A user-defined tag handler.
///
/// The parse hook consumes the tag's syntax through the parser façade and
/// returns the extension node (typically via `TagParser::extension_node`).
/// The evaluate hook receives the evaluated tag arguments, the rendered
/// body, and the live context, and returns the tag's output value.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn tags(&self) -> Vec<TagSpec>;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn parse(&self, tag: &str, parser: &mut TagParser<'_, '_>) -> Result<Node, ParseError>;

    fn evaluate(&self, tag: &str, args: &[Value], body: &str, context: &mut Context) -> Result<Value, String>;

    fn on_load(&self) -> Result<(), String> {
        Ok(())
    }

    fn before_render(&self) -> Result<(), String> {
        Ok(())
    }

    fn after_render(&self) -> Result<(), String> {
        Ok(())
    }

    fn on_unload(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Load order.
    order: Vec<Arc<dyn Extension>>,
    by_name: AHashMap<String, usize>,
    /// Every claimed tag (start and end) → owning extension.
    claimed_tags: AHashMap<String, String>,
    /// Start tags only, for parser dispatch.
    start_tags: AHashMap<String, String>,
    dependencies: AHashMap<String, Vec<String>>,
}

/// Thread-safe extension registry with dependency-ordered lifecycle.
#[derive(Default)]
pub struct ExtensionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ExtensionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().order.is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().expect("extension registry lock poisoned")
    }

    /// Validates and registers an extension, firing `on_load`. Any failure
    /// leaves the registry untouched.
    pub fn register(&self, extension: Arc<dyn Extension>) -> Result<(), ExtensionError> {
        let name = extension.name().to_owned();
        let tags = extension.tags();
        let dependencies = extension.dependencies();

        {
            let mut inner = self.inner.write().expect("extension registry lock poisoned");
            if inner.by_name.contains_key(&name) {
                return Err(ExtensionError::new(&name, "an extension with this name is already registered"));
            }
            for tag in &tags {
                for claimed in std::iter::once(&tag.start).chain(tag.end.as_ref()) {
                    if let Some(owner) = inner.claimed_tags.get(claimed) {
                        return Err(ExtensionError::new(&name, format!("tag already registered by extension {owner:?}"))
                            .with_tag(claimed.clone()));
                    }
                }
            }
            for dependency in &dependencies {
                if !inner.by_name.contains_key(dependency) {
                    return Err(ExtensionError::new(
                        &name,
                        format!("dependency {dependency:?} is not registered"),
                    ));
                }
            }
            if has_cycle(&name, &dependencies, &inner.dependencies) {
                return Err(ExtensionError::new(&name, "registration would create a dependency cycle"));
            }

            let at = inner.order.len();
            inner.order.push(extension.clone());
            inner.by_name.insert(name.clone(), at);
            for tag in &tags {
                inner.claimed_tags.insert(tag.start.clone(), name.clone());
                inner.start_tags.insert(tag.start.clone(), name.clone());
                if let Some(end) = &tag.end {
                    inner.claimed_tags.insert(end.clone(), name.clone());
                }
            }
            inner.dependencies.insert(name.clone(), dependencies);
        }

        if let Err(message) = extension.on_load() {
            self.remove_entry(&name);
            return Err(ExtensionError::new(&name, "on_load failed").with_cause(
                ExtensionError::new(&name, message).into(),
            ));
        }
        tracing::debug!(extension = %name, "extension registered");
        Ok(())
    }

    /// Unregisters an extension; refuses while other extensions depend on
    /// it. `on_unload` errors are reported after removal.
    pub fn unregister(&self, name: &str) -> Result<(), ExtensionError> {
        let extension = {
            let inner = self.read();
            let Some(&at) = inner.by_name.get(name) else {
                return Err(ExtensionError::new(name, "extension is not registered"));
            };
            for (other, dependencies) in &inner.dependencies {
                if other != name && dependencies.iter().any(|d| d == name) {
                    return Err(ExtensionError::new(
                        name,
                        format!("extension {other:?} still depends on it"),
                    ));
                }
            }
            inner.order[at].clone()
        };
        self.remove_entry(name);
        extension
            .on_unload()
            .map_err(|message| ExtensionError::new(name, format!("on_unload failed: {message}")))
    }

    fn remove_entry(&self, name: &str) {
        let mut inner = self.inner.write().expect("extension registry lock poisoned");
        let Some(at) = inner.by_name.remove(name) else { return };
        inner.order.remove(at);
        for index in inner.by_name.values_mut() {
            if *index > at {
                *index -= 1;
            }
        }
        inner.claimed_tags.retain(|_, owner| owner != name);
        inner.start_tags.retain(|_, owner| owner != name);
        inner.dependencies.remove(name);
    }

    /// `before_render` hooks in load order; the first failure wins.
    pub(crate) fn before_render(&self, template: &str) -> Result<(), ExtensionError> {
        let order = self.read().order.clone();
        for extension in &order {
            extension.before_render().map_err(|message| {
                ExtensionError::new(extension.name(), format!("before_render failed: {message}"))
                    .with_template(template)
            })?;
        }
        Ok(())
    }

    /// `after_render` hooks in reverse load order; runs all of them and
    /// reports the first failure.
    pub(crate) fn after_render(&self, template: &str) -> Result<(), ExtensionError> {
        let order = self.read().order.clone();
        let mut first_error = None;
        for extension in order.iter().rev() {
            if let Err(message) = extension.after_render()
                && first_error.is_none()
            {
                first_error = Some(
                    ExtensionError::new(extension.name(), format!("after_render failed: {message}"))
                        .with_template(template),
                );
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Evaluate hook dispatch for [`Node::Extension`].
    pub(crate) fn evaluate(
        &self,
        extension: &str,
        tag: &str,
        args: &[Value],
        body: &str,
        context: &mut Context,
    ) -> Result<Value, ExtensionError> {
        let found = {
            let inner = self.read();
            inner.by_name.get(extension).map(|&at| inner.order[at].clone())
        };
        let Some(found) = found else {
            return Err(ExtensionError::new(extension, "extension is no longer registered").with_tag(tag));
        };
        found
            .evaluate(tag, args, body, context)
            .map_err(|message| ExtensionError::new(extension, message).with_tag(tag))
    }
}

impl TagDispatch for ExtensionRegistry {
    fn extension_for_tag(&self, tag: &str) -> Option<String> {
        self.read().start_tags.get(tag).cloned()
    }

    fn parse_tag(&self, extension: &str, tag: &str, parser: &mut TagParser<'_, '_>) -> Result<Node, ParseError> {
        let found = {
            let inner = self.read();
            inner.by_name.get(extension).map(|&at| inner.order[at].clone())
        };
        match found {
            Some(found) => found.parse(tag, parser),
            None => Err(parser.error(format!("no extension registered for tag '{tag}'"))),
        }
    }
}

/// Depth-first cycle check over the dependency graph extended with the
/// candidate extension's edges.
fn has_cycle(candidate: &str, candidate_deps: &[String], graph: &AHashMap<String, Vec<String>>) -> bool {
    fn visit<'a>(
        node: &'a str,
        candidate: &str,
        candidate_deps: &'a [String],
        graph: &'a AHashMap<String, Vec<String>>,
        in_progress: &mut AHashSet<&'a str>,
        done: &mut AHashSet<&'a str>,
    ) -> bool {
        if done.contains(node) {
            return false;
        }
        if !in_progress.insert(node) {
            return true;
        }
        let edges: &[String] = if node == candidate {
            candidate_deps
        } else {
            graph.get(node).map_or(&[], Vec::as_slice)
        };
        for edge in edges {
            if visit(edge, candidate, candidate_deps, graph, in_progress, done) {
                return true;
            }
        }
        in_progress.remove(node);
        done.insert(node);
        false
    }

    let mut in_progress = AHashSet::new();
    let mut done = AHashSet::new();
    visit(candidate, candidate, candidate_deps, graph, &mut in_progress, &mut done)
}

#[cfg(test)]
mod unit {
    use super::*;

    struct Dummy {
        name: &'static str,
        tags: Vec<TagSpec>,
        deps: Vec<String>,
        fail_load: bool,
    }

    impl Dummy {
        fn new(name: &'static str, tag: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                tags: vec![TagSpec::inline(tag)],
                deps: Vec::new(),
                fail_load: false,
            })
        }

        fn with_deps(name: &'static str, tag: &str, deps: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                tags: vec![TagSpec::inline(tag)],
                deps: deps.iter().map(|d| (*d).to_owned()).collect(),
                fail_load: false,
            })
        }
    }

    impl Extension for Dummy {
        fn name(&self) -> &str {
            self.name
        }

        fn tags(&self) -> Vec<TagSpec> {
            self.tags.clone()
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn parse(&self, _tag: &str, parser: &mut TagParser<'_, '_>) -> Result<Node, ParseError> {
            let args = parser.parse_arguments()?;
            parser.expect_block_end()?;
            Ok(parser.extension_node(args, Vec::new()))
        }

        fn evaluate(&self, _tag: &str, _args: &[Value], _body: &str, _ctx: &mut Context) -> Result<Value, String> {
            Ok(Value::None)
        }

        fn on_load(&self) -> Result<(), String> {
            if self.fail_load {
                Err("load refused".to_owned())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn tag_collision_is_rejected() {
        let registry = ExtensionRegistry::new();
        registry.register(Dummy::new("a", "widget")).unwrap();
        let err = registry.register(Dummy::new("b", "widget")).unwrap_err();
        assert!(err.message.contains("already registered"), "{}", err.message);
        assert_eq!(registry.extension_for_tag("widget").as_deref(), Some("a"));
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let registry = ExtensionRegistry::new();
        let err = registry.register(Dummy::with_deps("a", "t", &["ghost"])).unwrap_err();
        assert!(err.message.contains("not registered"), "{}", err.message);
        assert!(registry.is_empty());
    }

    #[test]
    fn self_cycle_is_rejected_without_side_effects() {
        let registry = ExtensionRegistry::new();
        registry.register(Dummy::new("base", "b")).unwrap();
        // depending on itself is the smallest possible cycle
        let err = registry.register(Dummy::with_deps("selfish", "s", &["selfish"])).unwrap_err();
        assert!(err.message.contains("not registered") || err.message.contains("cycle"));
        assert!(registry.extension_for_tag("s").is_none());
    }

    #[test]
    fn failed_on_load_rolls_back() {
        let registry = ExtensionRegistry::new();
        let failing = Arc::new(Dummy {
            name: "flaky",
            tags: vec![TagSpec::inline("flake")],
            deps: Vec::new(),
            fail_load: true,
        });
        assert!(registry.register(failing).is_err());
        assert!(registry.is_empty());
        assert!(registry.extension_for_tag("flake").is_none());
    }

    #[test]
    fn unregister_refuses_while_dependents_exist() {
        let registry = ExtensionRegistry::new();
        registry.register(Dummy::new("base", "b")).unwrap();
        registry.register(Dummy::with_deps("child", "c", &["base"])).unwrap();
        let err = registry.unregister("base").unwrap_err();
        assert!(err.message.contains("depends"), "{}", err.message);
        registry.unregister("child").unwrap();
        registry.unregister("base").unwrap();
        assert!(registry.is_empty());
    }
}
