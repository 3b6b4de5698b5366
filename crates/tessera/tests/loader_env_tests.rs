//! Filesystem and chained loaders driving the full pipeline.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tessera::{ChainLoader, Context, Environment, FileSystemLoader, Loader, MemoryLoader, extract_dependencies};

#[test]
fn filesystem_templates_render_with_inheritance() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("base.html"),
        "<title>{% block title %}default{% endblock %}</title>",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("page.html"),
        r#"{% extends "base.html" %}{% block title %}{{ heading }}{% endblock %}"#,
    )
    .unwrap();

    let env = Environment::new().with_loader(Arc::new(FileSystemLoader::new(dir.path())));
    let ctx = Context::from_json(serde_json::json!({"heading": "Docs"})).unwrap();
    assert_eq!(
        env.get_template("page.html").unwrap().render(&ctx).unwrap(),
        "<title>Docs</title>"
    );

    // the loader caches source, the environment caches the resolved tree
    let _ = env.get_template("page.html").unwrap();
    assert!(env.template_cache_stats().hits >= 1);
    assert!(env.loader().unwrap().is_cached("page.html"));
}

#[test]
fn path_traversal_is_rejected_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::new().with_loader(Arc::new(FileSystemLoader::new(dir.path())));
    let err = env.get_template("../outside.html").unwrap_err();
    assert!(err.to_string().contains(".."), "unexpected error: {err}");
}

#[test]
fn chain_loader_composes_backends() {
    let overrides = MemoryLoader::new();
    overrides.add_template("page.html", "override").unwrap();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), "disk").unwrap();
    std::fs::write(dir.path().join("other.html"), "other").unwrap();

    let chain = ChainLoader::new(vec![
        Arc::new(overrides),
        Arc::new(FileSystemLoader::new(dir.path())),
    ]);
    let env = Environment::new().with_loader(Arc::new(chain));
    let ctx = Context::new();
    assert_eq!(env.get_template("page.html").unwrap().render(&ctx).unwrap(), "override");
    assert_eq!(env.get_template("other.html").unwrap().render(&ctx).unwrap(), "other");
}

#[test]
fn dependency_extraction_surfaces_referenced_names() {
    let source = r#"{% extends "base.html" %}{% include "nav.html" %}{% from "forms.html" import field %}"#;
    assert_eq!(
        extract_dependencies(source),
        vec!["base.html", "nav.html", "forms.html"]
    );
}

#[test]
fn metadata_flows_through_the_loader_trait() {
    let loader = MemoryLoader::new();
    loader.add_template("a.html", "hello").unwrap();
    let meta = loader.get_template_info("a.html").unwrap();
    assert_eq!(meta.name, "a.html");
    assert_eq!(meta.content, "hello");
    assert_eq!(meta.checksum.len(), 64);
}
