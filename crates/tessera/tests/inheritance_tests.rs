//! Inheritance, includes, and imports through the environment + loader.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tessera::{Context, Environment, Error, InheritanceErrorKind, MemoryLoader};

fn env_with(templates: &[(&str, &str)]) -> Environment {
    let loader = MemoryLoader::new();
    for (name, source) in templates {
        loader.add_template(name, *source).unwrap();
    }
    Environment::new().with_loader(Arc::new(loader))
}

fn render(env: &Environment, name: &str, data: serde_json::Value) -> String {
    let ctx = Context::from_json(data).unwrap();
    env.get_template(name).unwrap().render(&ctx).unwrap()
}

#[test]
fn block_override_with_super() {
    let env = env_with(&[
        ("base.html", "[{% block c %}B{% endblock %}]"),
        (
            "child.html",
            r#"{% extends "base.html" %}{% block c %}{{ super() }}+C{% endblock %}"#,
        ),
    ]);
    assert_eq!(render(&env, "child.html", serde_json::json!({})), "[B+C]");
}

#[test]
fn super_chains_recursively() {
    let env = env_with(&[
        ("a.html", "{% block c %}A{% endblock %}"),
        ("b.html", r#"{% extends "a.html" %}{% block c %}{{ super() }}B{% endblock %}"#),
        ("c.html", r#"{% extends "b.html" %}{% block c %}{{ super() }}C{% endblock %}"#),
    ]);
    assert_eq!(render(&env, "c.html", serde_json::json!({})), "ABC");
}

#[test]
fn child_text_outside_blocks_is_dropped() {
    let env = env_with(&[
        ("base.html", "A{% block c %}B{% endblock %}Z"),
        ("child.html", r#"{% extends "base.html" %}ignored{% block c %}X{% endblock %}ignored"#),
    ]);
    assert_eq!(render(&env, "child.html", serde_json::json!({})), "AXZ");
}

#[test]
fn blocks_use_the_rendering_context() {
    let env = env_with(&[
        ("base.html", "{% block c %}{% endblock %}"),
        (
            "child.html",
            r#"{% extends "base.html" %}{% block c %}{{ name }}{% endblock %}"#,
        ),
    ]);
    assert_eq!(
        render(&env, "child.html", serde_json::json!({"name": "ctx"})),
        "ctx"
    );
}

#[test]
fn include_does_not_participate_in_inheritance() {
    let env = env_with(&[
        ("base.html", "[{% block c %}B{% endblock %}]"),
        ("partial.html", "P{% block c %}own{% endblock %}"),
        (
            "child.html",
            r#"{% extends "base.html" %}{% block c %}{% include "partial.html" %}{% endblock %}"#,
        ),
    ]);
    // the include keeps its own block content; the child's override chain
    // does not leak into it
    assert_eq!(render(&env, "child.html", serde_json::json!({})), "[Pown]");
}

#[test]
fn include_sees_the_current_context_by_default() {
    let env = env_with(&[
        ("partial.html", "{{ greeting }}"),
        ("main.html", r#"{% include "partial.html" %}"#),
    ]);
    assert_eq!(
        render(&env, "main.html", serde_json::json!({"greeting": "hi"})),
        "hi"
    );
}

#[test]
fn include_without_context_sees_globals_only() {
    let env = env_with(&[
        ("partial.html", "{{ site }}|{{ secret }}"),
        ("main.html", r#"{% include "partial.html" without context %}"#),
    ]);
    env.add_global("site", "S").unwrap();
    assert_eq!(
        render(&env, "main.html", serde_json::json!({"secret": "leak"})),
        "S|"
    );
}

#[test]
fn include_name_can_be_a_runtime_expression() {
    let env = env_with(&[
        ("one.html", "ONE"),
        ("two.html", "TWO"),
        ("main.html", "{% include which %}"),
    ]);
    assert_eq!(
        render(&env, "main.html", serde_json::json!({"which": "two.html"})),
        "TWO"
    );
}

#[test]
fn include_ignore_missing_yields_empty() {
    let env = env_with(&[("main.html", r#"X{% include "gone.html" ignore missing %}Y"#)]);
    assert_eq!(render(&env, "main.html", serde_json::json!({})), "XY");

    let env = env_with(&[("main.html", "X{% include which ignore missing %}Y")]);
    assert_eq!(
        render(&env, "main.html", serde_json::json!({"which": "gone.html"})),
        "XY"
    );
}

#[test]
fn missing_include_without_ignore_is_fatal() {
    let env = env_with(&[("main.html", r#"{% include "gone.html" %}"#)]);
    let ctx = Context::new();
    let err = env.get_template("main.html").unwrap_err();
    let _ = ctx;
    assert!(err.as_load_error().is_some(), "unexpected error: {err}");
}

#[test]
fn extends_cycle_is_an_inheritance_error() {
    let env = env_with(&[
        ("a.html", r#"{% extends "b.html" %}"#),
        ("b.html", r#"{% extends "a.html" %}"#),
    ]);
    let err = env.get_template("a.html").unwrap_err();
    let Error::Inheritance(err) = err else {
        panic!("expected inheritance error, got {err}");
    };
    assert!(matches!(err.kind, InheritanceErrorKind::Cycle { .. }));
}

#[test]
fn import_builds_a_namespace() {
    let env = env_with(&[
        (
            "macros.html",
            r#"{% macro field(name) %}<{{ name }}>{% endmacro %}{% set version = 3 %}"#,
        ),
        (
            "main.html",
            r#"{% import "macros.html" as m %}{{ m.field("a") }}|{{ m.version }}|{{ m.__template__ }}|{{ m.__imported__ }}"#,
        ),
    ]);
    assert_eq!(
        render(&env, "main.html", serde_json::json!({})),
        "<a>|3|macros.html|true"
    );
}

#[test]
fn import_runs_against_globals_only() {
    let env = env_with(&[
        ("macros.html", "{% set seen = leaky|default('clean') %}"),
        (
            "main.html",
            r#"{% import "macros.html" as m %}{{ m.seen }}"#,
        ),
    ]);
    assert_eq!(
        render(&env, "main.html", serde_json::json!({"leaky": "dirty"})),
        "clean"
    );
}

#[test]
fn from_import_binds_selected_names() {
    let env = env_with(&[
        (
            "macros.html",
            "{% macro a() %}A{% endmacro %}{% macro b() %}B{% endmacro %}",
        ),
        (
            "main.html",
            r#"{% from "macros.html" import a, b as beta %}{{ a() }}{{ beta() }}"#,
        ),
    ]);
    assert_eq!(render(&env, "main.html", serde_json::json!({})), "AB");
}

#[test]
fn from_import_of_unknown_name_fails() {
    let env = env_with(&[
        ("macros.html", "{% macro a() %}A{% endmacro %}"),
        ("main.html", r#"{% from "macros.html" import ghost %}"#),
    ]);
    let ctx = Context::new();
    let err = env.get_template("main.html").unwrap().render(&ctx).unwrap_err();
    assert!(err.to_string().contains("ghost"), "unexpected error: {err}");
}

#[test]
fn resolved_templates_are_cached_and_shared() {
    let env = env_with(&[("t.html", "{{ x }}")]);
    let first = env.get_template("t.html").unwrap();
    let second = env.get_template("t.html").unwrap();
    let stats = env.template_cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.size, 1);
    assert!(env.is_template_cached("t.html"));
    drop((first, second));

    env.clear_template_cache();
    assert!(!env.is_template_cached("t.html"));
}

#[test]
fn render_str_resolves_extends_through_the_loader() {
    let env = env_with(&[("base.html", "[{% block c %}B{% endblock %}]")]);
    let ctx = Context::new();
    assert_eq!(
        env.render_str(
            r#"{% extends "base.html" %}{% block c %}{{ super() }}+S{% endblock %}"#,
            &ctx,
        )
        .unwrap(),
        "[B+S]"
    );
}

#[test]
fn scoped_block_marker_parses_and_renders() {
    let env = env_with(&[
        (
            "base.html",
            "{% for x in items %}{% block row scoped %}{{ x }}{% endblock %}{% endfor %}",
        ),
        (
            "child.html",
            r#"{% extends "base.html" %}{% block row %}<{{ x }}>{% endblock %}"#,
        ),
    ]);
    assert_eq!(
        render(&env, "child.html", serde_json::json!({"items": [1, 2]})),
        "<1><2>"
    );
}
