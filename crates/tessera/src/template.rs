use std::{fmt, sync::Arc};

use crate::{ast::Node, context::Context, environment::Environment, error::EngineResult};

/// A resolved template, ready to render against any number of contexts.
///
/// Holds the fully flattened AST behind `Arc`; rendering never mutates it,
/// so clones of this handle can render in parallel from separate threads.
pub struct Template<'env> {
    env: &'env Environment,
    name: String,
    root: Arc<Node>,
}

impl fmt::Debug for Template<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<'env> Template<'env> {
    pub(crate) fn new(env: &'env Environment, name: String, root: Arc<Node>) -> Self {
        Self { env, name, root }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renders against the given context. The context itself is not
    /// mutated; the render works on a private copy of its frames.
    pub fn render(&self, context: &Context) -> EngineResult<String> {
        self.env.render_root(&self.root, &self.name, context)
    }
}
