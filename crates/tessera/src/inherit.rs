//! The inheritance resolver.
//!
//! Flattens `extends`/`block`/`super()` into a final, evaluable tree. Block
//! override chains are kept in a table indexed by block name, child-most
//! body first; `super()` is substitution into the next chain level, so the
//! evaluator never sees inheritance at all. String-literal `with context`
//! includes are spliced in place here; includes that need a context (dynamic
//! name or `without context`) stay in the tree for the evaluator.

use ahash::{AHashMap, AHashSet};

use crate::{
    ast::Node,
    error::{Error, InheritanceError},
};

/// Provider of parsed-but-unresolved templates, implemented by the
/// environment.
pub(crate) trait TemplateSource {
    fn parsed(&self, name: &str) -> Result<Node, Error>;
}

/// Resolves one parsed template into its final form.
pub(crate) fn resolve(template: &Node, name: &str, source: &dyn TemplateSource) -> Result<Node, Error> {
    let Node::Template { children, .. } = template else {
        return Ok(template.clone());
    };
    let mut resolver = Resolver {
        source,
        include_stack: vec![name.to_owned()],
    };
    let children = resolver.resolve_children(children.clone(), name)?;
    Ok(Node::Template {
        name: name.to_owned(),
        children,
    })
}

/// Override chain for one block name, child-most body first.
type BlockTable = AHashMap<String, Vec<Vec<Node>>>;

struct Resolver<'a> {
    source: &'a dyn TemplateSource,
    /// Templates currently being spliced, for include-cycle detection. The
    /// first entry is the render root.
    include_stack: Vec<String>,
}

impl Resolver<'_> {
    fn resolve_children(&mut self, children: Vec<Node>, name: &str) -> Result<Vec<Node>, Error> {
        // Walk the extends chain, child first, collecting each template's
        // top-level node list and its blocks.
        let mut chain: Vec<Vec<Node>> = Vec::new();
        let mut visited: AHashSet<String> = AHashSet::new();
        let mut extends_order: Vec<String> = vec![name.to_owned()];
        visited.insert(name.to_owned());

        let mut current = children;
        loop {
            let parent_name = match find_extends(&current)? {
                Some(parent) => Some(parent.to_owned()),
                None => None,
            };
            chain.push(current);
            let Some(parent_name) = parent_name else { break };

            if !visited.insert(parent_name.clone()) {
                extends_order.push(parent_name);
                return Err(InheritanceError::cycle(extends_order).into());
            }
            extends_order.push(parent_name.clone());
            let parent = self
                .source
                .parsed(&parent_name)
                .map_err(|err| match err {
                    Error::Load(cause) => InheritanceError::missing(cause).into(),
                    other => other,
                })?;
            let Node::Template { children, .. } = parent else {
                unreachable!("parsing always yields a template node");
            };
            current = children;
        }

        let mut table = BlockTable::new();
        for level in &chain {
            let mut blocks = AHashMap::new();
            collect_blocks(level, &mut blocks);
            for (block_name, body) in blocks {
                table.entry(block_name).or_default().push(body);
            }
        }

        // The root-most ancestor's node list is the skeleton of the final
        // template.
        let root = chain.pop().expect("chain has at least the child");
        tracing::trace!(template = name, depth = chain.len() + 1, blocks = table.len(), "resolved inheritance chain");
        self.build_nodes(&root, &table, None)
    }

    /// Rebuilds a node list with blocks replaced by their effective bodies
    /// and `super()` expanded. `current` carries the enclosing block name
    /// and chain level during block expansion.
    fn build_nodes(&mut self, nodes: &[Node], table: &BlockTable, current: Option<(&str, usize)>) -> Result<Vec<Node>, Error> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            // `{{ super() }}` parses as a variable expression wrapping the
            // super node; unwrap it so both shapes substitute the parent
            let node = match node {
                Node::Variable { expression, .. } if matches!(expression.as_ref(), Node::Super { .. }) => {
                    expression.as_ref()
                }
                other => other,
            };
            match node {
                Node::Extends { .. } => {}
                Node::Block { name, .. } => {
                    let chain = table.get(name.as_str());
                    let body = chain.and_then(|c| c.first());
                    if let Some(body) = body {
                        let body = body.clone();
                        out.extend(self.build_nodes(&body, table, Some((name, 0)))?);
                    }
                }
                Node::Super { .. } => {
                    if let Some((block_name, level)) = current
                        && let Some(parent_body) = table.get(block_name).and_then(|c| c.get(level + 1))
                    {
                        let parent_body = parent_body.clone();
                        out.extend(self.build_nodes(&parent_body, table, Some((block_name, level + 1)))?);
                    }
                    // a block with no parent renders super() as nothing
                }
                Node::If {
                    condition,
                    body,
                    elifs,
                    else_body,
                    loc,
                } => {
                    let mut resolved_elifs = Vec::with_capacity(elifs.len());
                    for (elif_condition, elif_body) in elifs {
                        resolved_elifs.push((elif_condition.clone(), self.build_nodes(elif_body, table, current)?));
                    }
                    out.push(Node::If {
                        condition: condition.clone(),
                        body: self.build_nodes(body, table, current)?,
                        elifs: resolved_elifs,
                        else_body: self.build_nodes(else_body, table, current)?,
                        loc: *loc,
                    });
                }
                Node::For {
                    targets,
                    iterable,
                    filter,
                    recursive,
                    body,
                    else_body,
                    loc,
                } => {
                    out.push(Node::For {
                        targets: targets.clone(),
                        iterable: iterable.clone(),
                        filter: filter.clone(),
                        recursive: *recursive,
                        body: self.build_nodes(body, table, current)?,
                        else_body: self.build_nodes(else_body, table, current)?,
                        loc: *loc,
                    });
                }
                Node::Include {
                    template,
                    with_context: true,
                    ignore_missing,
                    loc: _,
                } if template.as_str_literal().is_some() => {
                    let target = template.as_str_literal().expect("guarded above").to_owned();
                    out.extend(self.splice_include(&target, *ignore_missing)?);
                }
                other => out.push(other.clone()),
            }
        }
        Ok(out)
    }

    /// Loads, fully resolves, and splices an included template's children.
    /// The included tree gets its own block table: includes never join the
    /// including template's inheritance.
    fn splice_include(&mut self, target: &str, ignore_missing: bool) -> Result<Vec<Node>, Error> {
        if self.include_stack.iter().any(|seen| seen == target) {
            let mut stack = self.include_stack.clone();
            stack.push(target.to_owned());
            return Err(InheritanceError::cycle(stack).into());
        }
        let parsed = match self.source.parsed(target) {
            Ok(parsed) => parsed,
            Err(err) => {
                if ignore_missing && err.as_load_error().is_some_and(crate::error::LoadError::is_not_found) {
                    return Ok(Vec::new());
                }
                return Err(match err {
                    Error::Load(cause) => InheritanceError::missing(cause).into(),
                    other => other,
                });
            }
        };
        let Node::Template { children, .. } = parsed else {
            unreachable!("parsing always yields a template node");
        };
        self.include_stack.push(target.to_owned());
        let resolved = self.resolve_children(children, target);
        self.include_stack.pop();
        resolved
    }
}

/// First top-level `extends` target. A non-literal target is an error: the
/// resolver runs before any context exists, so only literal names can be
/// honored here.
fn find_extends(nodes: &[Node]) -> Result<Option<&str>, Error> {
    for node in nodes {
        if let Node::Extends { template, loc } = node {
            return match template.as_str_literal() {
                Some(name) => Ok(Some(name)),
                None => Err(InheritanceError::non_literal_name("extends", *loc).into()),
            };
        }
    }
    Ok(None)
}

/// Collects block bodies into `map`, recursing into `if`/`for` bodies and
/// nested blocks. The first definition of a name within one template wins.
fn collect_blocks(nodes: &[Node], map: &mut AHashMap<String, Vec<Node>>) {
    for node in nodes {
        match node {
            Node::Block { name, body, .. } => {
                map.entry(name.clone()).or_insert_with(|| body.clone());
                collect_blocks(body, map);
            }
            Node::If {
                body, elifs, else_body, ..
            } => {
                collect_blocks(body, map);
                for (_, elif_body) in elifs {
                    collect_blocks(elif_body, map);
                }
                collect_blocks(else_body, map);
            }
            Node::For { body, else_body, .. } => {
                collect_blocks(body, map);
                collect_blocks(else_body, map);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::InheritanceErrorKind,
        lex::{SyntaxConfig, tokenize},
        whitespace,
    };

    struct MapSource(AHashMap<String, String>);

    impl MapSource {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
            )
        }

        fn parse(&self, name: &str, source: &str) -> Node {
            let tokens = tokenize(source, &SyntaxConfig::default()).unwrap();
            let tokens = whitespace::apply(tokens, false, false);
            crate::parse::parse(&tokens, name, None).unwrap()
        }
    }

    impl TemplateSource for MapSource {
        fn parsed(&self, name: &str) -> Result<Node, Error> {
            let source = self
                .0
                .get(name)
                .ok_or_else(|| Error::Load(crate::error::LoadError::not_found(name)))?;
            Ok(self.parse(name, source))
        }
    }

    fn render_text(nodes: &[Node]) -> String {
        // good enough for resolver tests: concatenate literal text
        let mut out = String::new();
        for node in nodes {
            if let Node::Text { content, .. } = node {
                out.push_str(content);
            }
        }
        out
    }

    fn resolve_named(source: &MapSource, name: &str) -> Result<Vec<Node>, Error> {
        let parsed = source.parsed(name)?;
        let resolved = resolve(&parsed, name, source)?;
        match resolved {
            Node::Template { children, .. } => Ok(children),
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn child_overrides_parent_block() {
        let source = MapSource::new(&[
            ("base.html", "[{% block c %}B{% endblock %}]"),
            ("child.html", "{% extends \"base.html\" %}{% block c %}C{% endblock %}"),
        ]);
        let nodes = resolve_named(&source, "child.html").unwrap();
        assert_eq!(render_text(&nodes), "[C]");
    }

    #[test]
    fn super_pulls_parent_content() {
        let source = MapSource::new(&[
            ("base.html", "[{% block c %}B{% endblock %}]"),
            (
                "child.html",
                "{% extends \"base.html\" %}{% block c %}{{ super() }}+C{% endblock %}",
            ),
        ]);
        let nodes = resolve_named(&source, "child.html").unwrap();
        assert_eq!(render_text(&nodes), "[B+C]");
    }

    #[test]
    fn super_chains_through_three_levels() {
        let source = MapSource::new(&[
            ("a.html", "{% block c %}A{% endblock %}"),
            (
                "b.html",
                "{% extends \"a.html\" %}{% block c %}{{ super() }}B{% endblock %}",
            ),
            (
                "c.html",
                "{% extends \"b.html\" %}{% block c %}{{ super() }}C{% endblock %}",
            ),
        ]);
        let nodes = resolve_named(&source, "c.html").unwrap();
        assert_eq!(render_text(&nodes), "ABC");
    }

    #[test]
    fn unoverridden_parent_block_is_kept() {
        let source = MapSource::new(&[
            ("base.html", "{% block a %}A{% endblock %}|{% block b %}B{% endblock %}"),
            ("child.html", "{% extends \"base.html\" %}{% block b %}X{% endblock %}"),
        ]);
        let nodes = resolve_named(&source, "child.html").unwrap();
        assert_eq!(render_text(&nodes), "A|X");
    }

    #[test]
    fn extends_cycle_is_detected() {
        let source = MapSource::new(&[
            ("a.html", "{% extends \"b.html\" %}"),
            ("b.html", "{% extends \"a.html\" %}"),
        ]);
        let err = resolve_named(&source, "a.html").unwrap_err();
        let Error::Inheritance(err) = err else {
            panic!("expected inheritance error, got {err}");
        };
        assert!(matches!(err.kind, InheritanceErrorKind::Cycle { .. }));
    }

    #[test]
    fn include_cycle_is_detected() {
        let source = MapSource::new(&[
            ("a.html", "{% include \"b.html\" %}"),
            ("b.html", "{% include \"a.html\" %}"),
        ]);
        let err = resolve_named(&source, "a.html").unwrap_err();
        assert!(matches!(
            err,
            Error::Inheritance(InheritanceError {
                kind: InheritanceErrorKind::Cycle { .. }
            })
        ));
    }

    #[test]
    fn include_is_spliced_and_does_not_inherit() {
        let source = MapSource::new(&[
            ("base.html", "[{% block c %}B{% endblock %}]"),
            ("partial.html", "P{% block c %}ignored{% endblock %}"),
            (
                "child.html",
                "{% extends \"base.html\" %}{% block c %}{% include \"partial.html\" %}{% endblock %}",
            ),
        ]);
        let nodes = resolve_named(&source, "child.html").unwrap();
        // the include's own `c` block renders its own body, not the child's
        assert_eq!(render_text(&nodes), "[Pignored]");
    }

    #[test]
    fn missing_include_fails_unless_ignored() {
        let source = MapSource::new(&[("a.html", "{% include \"gone.html\" %}")]);
        assert!(resolve_named(&source, "a.html").is_err());

        let source = MapSource::new(&[("a.html", "X{% include \"gone.html\" ignore missing %}Y")]);
        let nodes = resolve_named(&source, "a.html").unwrap();
        assert_eq!(render_text(&nodes), "XY");
    }

    #[test]
    fn dynamic_include_is_left_for_the_evaluator() {
        let source = MapSource::new(&[("a.html", "{% include partial_name %}")]);
        let nodes = resolve_named(&source, "a.html").unwrap();
        assert!(matches!(&nodes[0], Node::Include { .. }));
    }

    #[test]
    fn non_literal_extends_is_rejected() {
        let source = MapSource::new(&[("a.html", "{% extends base_var %}")]);
        let err = resolve_named(&source, "a.html").unwrap_err();
        assert!(matches!(
            err,
            Error::Inheritance(InheritanceError {
                kind: InheritanceErrorKind::NonLiteralName { .. }
            })
        ));
    }

    #[test]
    fn blocks_inside_if_bodies_are_collected() {
        let source = MapSource::new(&[
            (
                "base.html",
                "{% if x %}{% block c %}B{% endblock %}{% endif %}",
            ),
            ("child.html", "{% extends \"base.html\" %}{% block c %}C{% endblock %}"),
        ]);
        let nodes = resolve_named(&source, "child.html").unwrap();
        let Node::If { body, .. } = &nodes[0] else {
            panic!("expected if at top level, got {:?}", nodes[0]);
        };
        assert_eq!(render_text(body), "C");
    }
}
