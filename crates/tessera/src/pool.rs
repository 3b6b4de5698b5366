//! Allocation pools for render-path objects.
//!
//! Purely an optimization: renders work the same if every `get` allocates
//! fresh. Pooled objects are reset on return and never handed out dirty;
//! oversized string builders are dropped instead of retained.

use std::sync::Mutex;

use crate::context::{Context, Globals};

/// Builders larger than this are not returned to the pool.
const MAX_POOLED_CAPACITY: usize = 64 * 1024;
/// Upper bound on retained objects per pool.
const MAX_POOLED: usize = 32;

/// Pool of output string builders.
#[derive(Debug, Default)]
pub(crate) struct StringPool {
    builders: Mutex<Vec<String>>,
}

impl StringPool {
    pub fn get(&self) -> String {
        self.builders
            .lock()
            .expect("builder pool lock poisoned")
            .pop()
            .unwrap_or_default()
    }

    pub fn put(&self, mut builder: String) {
        builder.clear();
        if builder.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let mut builders = self.builders.lock().expect("builder pool lock poisoned");
        if builders.len() < MAX_POOLED {
            builders.push(builder);
        }
    }
}

/// Pool of scratch contexts for include/import runs.
#[derive(Debug, Default)]
pub(crate) struct ContextPool {
    contexts: Mutex<Vec<Context>>,
}

impl ContextPool {
    pub fn get(&self, globals: Globals) -> Context {
        let mut context = self
            .contexts
            .lock()
            .expect("context pool lock poisoned")
            .pop()
            .unwrap_or_default();
        context.reset(globals);
        context
    }

    pub fn put(&self, mut context: Context) {
        context.reset(Globals::default());
        let mut contexts = self.contexts.lock().expect("context pool lock poisoned");
        if contexts.len() < MAX_POOLED {
            contexts.push(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_are_reset_and_reused() {
        let pool = StringPool::default();
        let mut builder = pool.get();
        builder.push_str("content");
        let capacity = builder.capacity();
        pool.put(builder);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), capacity);
    }

    #[test]
    fn oversized_builders_are_dropped() {
        let pool = StringPool::default();
        let mut big = pool.get();
        big.reserve(MAX_POOLED_CAPACITY + 1);
        pool.put(big);
        assert_eq!(pool.get().capacity(), 0);
    }

    #[test]
    fn contexts_come_back_empty() {
        use crate::value::Value;
        let pool = ContextPool::default();
        let mut context = pool.get(Globals::default());
        context.set("x", Value::Int(1));
        context.push();
        pool.put(context);

        let reused = pool.get(Globals::default());
        assert!(reused.get("x").is_none());
        assert_eq!(reused.depth(), 1);
    }

    #[test]
    fn concurrent_get_put() {
        use std::sync::Arc;
        let pool = Arc::new(StringPool::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let mut builder = pool.get();
                        builder.push_str("xyz");
                        pool.put(builder);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
