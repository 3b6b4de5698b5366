use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::value::{MapKey, Value, ValueMap};

/// One scope frame: a flat name → value map.
pub type Frame = AHashMap<String, Value>;

/// Shared, read-only global bindings. The environment swaps the whole `Arc`
/// on mutation, so in-flight renders keep the snapshot they started with.
pub type Globals = Arc<AHashMap<String, Value>>;

/// The layered variable store consulted during evaluation.
///
/// A stack of frames, root first. `get` walks leaf to root and falls back to
/// the environment globals; `set` always writes the leaf frame. The
/// materialized `all()` map is cached and invalidated by any mutation.
///
/// Contexts belong to a single in-flight render and are never shared across
/// renders; `clone()` exists so concurrent renders over the same base data
/// get independent leaf frames.
#[derive(Debug)]
pub struct Context {
    frames: Vec<Frame>,
    globals: Globals,
    all_cache: Mutex<Option<Arc<ValueMap>>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            frames: self.frames.clone(),
            globals: self.globals.clone(),
            all_cache: Mutex::new(None),
        }
    }
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::with_globals(Arc::new(AHashMap::new()))
    }

    #[must_use]
    pub fn with_globals(globals: Globals) -> Self {
        Self {
            frames: vec![Frame::new()],
            globals,
            all_cache: Mutex::new(None),
        }
    }

    /// Builds a context whose root frame holds the entries of a JSON object.
    pub fn from_json(data: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut context = Self::new();
        if let serde_json::Value::Object(entries) = data {
            for (name, value) in entries {
                context.set(name, Value::from(value));
            }
        }
        Ok(context)
    }

    /// Builds a context from any serializable struct or map.
    pub fn from_serialize<T: serde::Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        Self::from_json(serde_json::to_value(data)?)
    }

    pub(crate) fn globals(&self) -> &Globals {
        &self.globals
    }

    pub(crate) fn set_globals(&mut self, globals: Globals) {
        self.globals = globals;
        self.invalidate();
    }

    /// Looks a name up, walking frames leaf to root and then the globals.
    /// Dotted names resolve the first segment, then iterated attribute
    /// access.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some((first, rest)) = name.split_once('.') {
            let mut value = self.get_plain(first)?;
            for segment in rest.split('.') {
                value = value.get_attribute(segment)?;
            }
            return Some(value);
        }
        self.get_plain(name)
    }

    fn get_plain(&self, name: &str) -> Option<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.get(name) {
                return Some(value.clone());
            }
        }
        self.globals.get(name).cloned()
    }

    /// Binds a name in the leaf frame.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.frames
            .last_mut()
            .expect("a context always has a root frame")
            .insert(name.into(), value);
        self.invalidate();
    }

    /// Pushes a child frame.
    pub fn push(&mut self) {
        self.frames.push(Frame::new());
        self.invalidate();
    }

    /// Pops the leaf frame. Popping the root is a no-op.
    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
            self.invalidate();
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Materializes the flat view: globals first, overwritten by the frame
    /// chain root to leaf. The result is cached until the next mutation.
    #[must_use]
    pub fn all(&self) -> Arc<ValueMap> {
        let mut cache = self.all_cache.lock().expect("all-cache lock poisoned");
        if let Some(existing) = cache.as_ref() {
            return existing.clone();
        }
        let mut flat = ValueMap::new();
        for (name, value) in self.globals.iter() {
            flat.insert(MapKey::from(name.as_str()), value.clone());
        }
        for frame in &self.frames {
            for (name, value) in frame {
                flat.insert(MapKey::from(name.as_str()), value.clone());
            }
        }
        let flat = Arc::new(flat);
        *cache = Some(flat.clone());
        flat
    }

    /// Entries of the leaf frame, for namespace capture after an import run.
    pub(crate) fn leaf_entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.frames.last().expect("root frame").iter()
    }

    /// Resets to a single empty root frame, keeping allocated capacity.
    /// Used by the context pool before handing an instance back out.
    pub(crate) fn reset(&mut self, globals: Globals) {
        self.frames.truncate(1);
        self.frames[0].clear();
        self.globals = globals;
        self.invalidate();
    }

    fn invalidate(&mut self) {
        *self.all_cache.get_mut().expect("all-cache lock poisoned") = None;
    }
}

/// Copy-on-write context variant.
///
/// Shares an immutable base map by reference; the first `set` allocates a
/// per-instance overlay frame. Satisfies the same contract as [`Context`].
#[derive(Debug)]
pub struct CowContext {
    base: Arc<Frame>,
    overlays: Vec<Frame>,
    globals: Globals,
    all_cache: Mutex<Option<Arc<ValueMap>>>,
}

impl Clone for CowContext {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            overlays: self.overlays.clone(),
            globals: self.globals.clone(),
            all_cache: Mutex::new(None),
        }
    }
}

impl CowContext {
    #[must_use]
    pub fn new(base: Arc<Frame>) -> Self {
        Self::with_globals(base, Arc::new(AHashMap::new()))
    }

    #[must_use]
    pub fn with_globals(base: Arc<Frame>, globals: Globals) -> Self {
        Self {
            base,
            overlays: Vec::new(),
            globals,
            all_cache: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some((first, rest)) = name.split_once('.') {
            let mut value = self.get_plain(first)?;
            for segment in rest.split('.') {
                value = value.get_attribute(segment)?;
            }
            return Some(value);
        }
        self.get_plain(name)
    }

    fn get_plain(&self, name: &str) -> Option<Value> {
        for overlay in self.overlays.iter().rev() {
            if let Some(value) = overlay.get(name) {
                return Some(value.clone());
            }
        }
        self.base
            .get(name)
            .or_else(|| self.globals.get(name))
            .cloned()
    }

    /// First write allocates the overlay; the base map is never touched.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if self.overlays.is_empty() {
            self.overlays.push(Frame::new());
        }
        self.overlays
            .last_mut()
            .expect("overlay allocated above")
            .insert(name.into(), value);
        self.invalidate();
    }

    pub fn push(&mut self) {
        self.overlays.push(Frame::new());
        self.invalidate();
    }

    pub fn pop(&mut self) {
        if !self.overlays.is_empty() {
            self.overlays.pop();
            self.invalidate();
        }
    }

    #[must_use]
    pub fn all(&self) -> Arc<ValueMap> {
        let mut cache = self.all_cache.lock().expect("all-cache lock poisoned");
        if let Some(existing) = cache.as_ref() {
            return existing.clone();
        }
        let mut flat = ValueMap::new();
        for (name, value) in self.globals.iter() {
            flat.insert(MapKey::from(name.as_str()), value.clone());
        }
        for (name, value) in self.base.iter() {
            flat.insert(MapKey::from(name.as_str()), value.clone());
        }
        for overlay in &self.overlays {
            for (name, value) in overlay {
                flat.insert(MapKey::from(name.as_str()), value.clone());
            }
        }
        let flat = Arc::new(flat);
        *cache = Some(flat.clone());
        flat
    }

    fn invalidate(&mut self) {
        *self.all_cache.get_mut().expect("all-cache lock poisoned") = None;
    }
}
