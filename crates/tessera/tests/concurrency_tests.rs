//! Parallel rendering against a shared environment, and the worker-pool
//! renderer's lifecycle semantics.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tessera::{ConcurrentRenderer, Context, Environment, MemoryLoader};

fn shared_env() -> Arc<Environment> {
    let loader = MemoryLoader::new();
    loader
        .add_template(
            "row.html",
            "{% for x in items %}{{ x|upper }}{% if not loop.last %},{% endif %}{% endfor %}",
        )
        .unwrap();
    Arc::new(Environment::new().with_loader(Arc::new(loader)))
}

fn row_context(tag: &str) -> Context {
    Context::from_json(serde_json::json!({"items": [tag, "b", "c"]})).unwrap()
}

#[test]
fn parallel_renders_produce_identical_output() {
    let env = shared_env();
    let expected = env
        .get_template("row.html")
        .unwrap()
        .render(&row_context("a"))
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let env = env.clone();
            std::thread::spawn(move || {
                let template = env.get_template("row.html").unwrap();
                let mut outputs = Vec::new();
                for _ in 0..50 {
                    outputs.push(template.render(&row_context("a")).unwrap());
                }
                outputs
            })
        })
        .collect();

    for handle in handles {
        for output in handle.join().unwrap() {
            assert_eq!(output, expected);
        }
    }
}

#[test]
fn renders_do_not_leak_state_between_contexts() {
    let env = shared_env();
    let template = env.get_template("row.html").unwrap();
    assert_eq!(template.render(&row_context("a")).unwrap(), "A,B,C");
    assert_eq!(template.render(&row_context("z")).unwrap(), "Z,B,C");
    assert_eq!(template.render(&row_context("a")).unwrap(), "A,B,C");
}

#[test]
fn worker_pool_renders_submitted_jobs() {
    let env = shared_env();
    let renderer = ConcurrentRenderer::new(env, "row.html", 4, 8).unwrap();

    let receivers: Vec<_> = (0..16)
        .map(|i| {
            let tag = format!("x{i}");
            let outcome = renderer.submit(row_context(&tag)).unwrap();
            (tag, outcome)
        })
        .collect();
    for (tag, outcome) in receivers {
        let rendered = outcome.recv().unwrap().unwrap();
        assert_eq!(rendered, format!("{},B,C", tag.to_uppercase()));
    }
    renderer.stop();
}

#[test]
fn worker_pool_render_convenience() {
    let env = shared_env();
    let renderer = ConcurrentRenderer::new(env, "row.html", 2, 4).unwrap();
    assert_eq!(renderer.render(row_context("q")).unwrap(), "Q,B,C");
}

#[test]
fn submissions_after_stop_fail_fast() {
    let env = shared_env();
    let renderer = ConcurrentRenderer::new(env, "row.html", 2, 4).unwrap();
    renderer.stop();
    assert!(renderer.is_stopped());
    let err = renderer.submit(row_context("a")).unwrap_err();
    assert!(err.to_string().contains("renderer is stopped"), "{err}");
    // stop is idempotent
    renderer.stop();
}

#[test]
fn failed_renders_still_answer_the_reply_channel() {
    let loader = MemoryLoader::new();
    loader.add_template("bad.html", "{{ 1 / 0 }}").unwrap();
    let env = Arc::new(Environment::new().with_loader(Arc::new(loader)));
    let renderer = ConcurrentRenderer::new(env, "bad.html", 1, 2).unwrap();
    let outcome = renderer.submit(Context::new()).unwrap();
    assert!(outcome.recv().unwrap().is_err());
    renderer.stop();
}

#[test]
fn missing_template_fails_at_construction() {
    let env = shared_env();
    assert!(ConcurrentRenderer::new(env, "ghost.html", 2, 4).is_err());
}
