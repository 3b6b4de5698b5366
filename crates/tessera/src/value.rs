use std::{
    cmp::Ordering,
    fmt::{self, Write},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use indexmap::IndexMap;

use crate::{ast::Node, context::Context};

/// Ordered mapping storage for [`Value::Map`].
pub type ValueMap = IndexMap<MapKey, Value>;

/// Hashable key of a mapping value. Dict literals accept any expression as a
/// key; evaluation narrows it to one of these or fails with a type error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Str(Arc<str>),
    Int(i64),
    Bool(bool),
}

impl MapKey {
    /// The key as it renders inside a mapping repr.
    fn repr(&self) -> String {
        match self {
            Self::Str(s) => format!("{s:?}"),
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }

    #[must_use]
    pub fn as_value(&self) -> Value {
        match self {
            Self::Str(s) => Value::Str(s.clone()),
            Self::Int(i) => Value::Int(*i),
            Self::Bool(b) => Value::Bool(*b),
        }
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }
}

impl From<String> for MapKey {
    fn from(s: String) -> Self {
        Self::Str(Arc::from(s.as_str()))
    }
}

impl From<i64> for MapKey {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Value-shape adapter for host values that are neither mappings nor
/// sequences. Steps 2 and 3 of the attribute lookup algorithm go through
/// this trait: named fields first, then zero-argument methods.
pub trait Object: fmt::Debug + Send + Sync {
    /// Named field access. The engine retries with the first letter
    /// uppercased before giving up on fields.
    fn field(&self, name: &str) -> Option<Value> {
        let _ = name;
        None
    }

    /// Zero-argument method invocation. Panics are caught by the engine and
    /// reported as a lookup miss.
    fn invoke(&self, name: &str) -> Option<Value> {
        let _ = name;
        None
    }

    /// String form used when the value reaches rendered output.
    fn render(&self) -> String {
        format!("{self:?}")
    }
}

/// A template-defined macro: signature, body, and the context it closed
/// over at definition time. Defaults are evaluated once, at definition.
#[derive(Debug, Clone)]
pub struct MacroValue {
    pub name: String,
    pub params: Vec<String>,
    pub defaults: Vec<(String, Value)>,
    pub body: Arc<Vec<Node>>,
    pub defining_context: Context,
}

/// The result of executing a template as an import target.
#[derive(Debug)]
pub struct TemplateNamespace {
    pub template_name: String,
    pub macros: IndexMap<String, Value>,
    pub variables: IndexMap<String, Value>,
    /// Render-time context at the point of execution.
    pub context_snapshot: Context,
}

impl TemplateNamespace {
    /// `NS.name`: macros shadow variables; two synthetic attributes expose
    /// provenance.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "__template__" => Some(Value::from(self.template_name.as_str())),
            "__imported__" => Some(Value::Bool(true)),
            _ => self
                .macros
                .get(name)
                .or_else(|| self.variables.get(name))
                .cloned(),
        }
    }
}

/// State the evaluator needs to re-enter a `recursive` for loop when the
/// body calls `loop(...)`.
#[derive(Debug)]
pub struct RecursiveLoop {
    pub targets: Vec<String>,
    pub body: Arc<Vec<Node>>,
    pub filter: Option<Arc<Node>>,
}

/// The `loop` variable bound inside for bodies. Rebuilt per iteration; all
/// fields are immutable snapshots of the iteration state.
#[derive(Debug)]
pub struct LoopObject {
    pub index0: usize,
    pub length: usize,
    pub depth0: usize,
    pub parent: Option<Value>,
    pub recursive: Option<Arc<RecursiveLoop>>,
}

impl LoopObject {
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Value> {
        let value = match name {
            "index" => Value::Int(self.index0 as i64 + 1),
            "index0" => Value::Int(self.index0 as i64),
            "revindex" => Value::Int((self.length - self.index0) as i64),
            "revindex0" => Value::Int((self.length - self.index0) as i64 - 1),
            "first" => Value::Bool(self.index0 == 0),
            "last" => Value::Bool(self.index0 + 1 == self.length),
            "length" => Value::Int(self.length as i64),
            "depth" => Value::Int(self.depth0 as i64 + 1),
            "depth0" => Value::Int(self.depth0 as i64),
            "parent" => self.parent.clone().unwrap_or(Value::Undefined),
            _ => return None,
        };
        Some(value)
    }

    /// `loop.cycle(a, b, ...)` round-robins its arguments by iteration.
    #[must_use]
    pub fn cycle(&self, args: &[Value]) -> Value {
        if args.is_empty() {
            return Value::Undefined;
        }
        args[self.index0 % args.len()].clone()
    }
}

/// Primary runtime value.
///
/// Small immediates are stored inline; strings and containers share their
/// payload behind `Arc` so that values cloned between frames, caches, and
/// parallel renders stay cheap. There is no interior mutability: mutation
/// always goes through a context binding.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Missing-lookup sentinel; distinct from an explicit `none`.
    #[default]
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// A string exempt from HTML escaping.
    Safe(Arc<str>),
    Seq(Arc<Vec<Value>>),
    Tuple(Arc<Vec<Value>>),
    Map(Arc<ValueMap>),
    Macro(Arc<MacroValue>),
    Namespace(Arc<TemplateNamespace>),
    Loop(Arc<LoopObject>),
    Object(Arc<dyn Object>),
}

impl Value {
    #[must_use]
    pub fn safe(s: impl Into<String>) -> Self {
        Self::Safe(Arc::from(s.into().as_str()))
    }

    #[must_use]
    pub fn seq(items: Vec<Self>) -> Self {
        Self::Seq(Arc::new(items))
    }

    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(Arc::new(items))
    }

    #[must_use]
    pub fn map(map: ValueMap) -> Self {
        Self::Map(Arc::new(map))
    }

    #[must_use]
    pub fn object(object: impl Object + 'static) -> Self {
        Self::Object(Arc::new(object))
    }

    /// Short type name used in error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::None => "none",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) | Self::Safe(_) => "string",
            Self::Seq(_) => "sequence",
            Self::Tuple(_) => "tuple",
            Self::Map(_) => "mapping",
            Self::Macro(_) => "macro",
            Self::Namespace(_) => "namespace",
            Self::Loop(_) => "loop",
            Self::Object(_) => "object",
        }
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Safe(_))
    }

    /// false, none/undefined, zero, the empty string and empty containers
    /// are falsy; everything else is truthy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) | Self::Safe(s) => !s.is_empty(),
            Self::Seq(items) | Self::Tuple(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
            Self::Macro(_) | Self::Namespace(_) | Self::Loop(_) | Self::Object(_) => true,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    /// Element count: characters for strings, entries for containers.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s.chars().count()),
            Self::Seq(items) | Self::Tuple(items) => Some(items.len()),
            Self::Map(map) => Some(map.len()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|n| n == 0)
    }

    /// Output coercion: what `{{ expr }}` appends. Undefined and none
    /// render as nothing.
    pub fn render_into(&self, out: &mut String) {
        match self {
            Self::Undefined | Self::None => {}
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => out.push_str(format_float(*f).as_str()),
            Self::Str(s) | Self::Safe(s) => out.push_str(s),
            Self::Seq(_) | Self::Tuple(_) | Self::Map(_) => out.push_str(&self.repr()),
            Self::Macro(m) => {
                let _ = write!(out, "<macro {}>", m.name);
            }
            Self::Namespace(ns) => {
                let _ = write!(out, "<namespace {}>", ns.template_name);
            }
            Self::Loop(_) => out.push_str("<loop>"),
            Self::Object(object) => out.push_str(&object.render()),
        }
    }

    /// Plain string coercion of the value.
    #[must_use]
    pub fn to_output_string(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    /// Debug-ish representation used when containers reach output and by
    /// error messages. Strings are quoted inside containers but not at the
    /// top level of output coercion.
    #[must_use]
    pub fn repr(&self) -> String {
        match self {
            Self::Seq(items) => {
                let inner: Vec<String> = items.iter().map(Self::repr_item).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Self::repr_item).collect();
                if items.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            Self::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), Self::repr_item(v)))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            other => other.to_output_string(),
        }
    }

    fn repr_item(value: &Self) -> String {
        match value {
            Self::Str(s) | Self::Safe(s) => format!("{s:?}"),
            Self::None => "none".to_owned(),
            other => other.repr(),
        }
    }

    /// Deep equality with int/float promotion.
    #[must_use]
    pub fn value_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::Str(a) | Self::Safe(a), Self::Str(b) | Self::Safe(b)) => a == b,
            (Self::Seq(a) | Self::Tuple(a), Self::Seq(b) | Self::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.value_eq(y))
            }
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other_v| v.value_eq(other_v)))
            }
            _ => false,
        }
    }

    /// Ordering for `< <= > >=`: mixed numerics promote, strings compare
    /// lexicographically, sequences elementwise. `None` means the pair is
    /// unordered and the comparison is a type error.
    #[must_use]
    pub fn value_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(_) | Self::Int(_), Self::Float(_) | Self::Int(_)) => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
            (Self::Str(a) | Self::Safe(a), Self::Str(b) | Self::Safe(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Seq(a) | Self::Tuple(a), Self::Seq(b) | Self::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.value_cmp(y)? {
                        Ordering::Equal => {}
                        unequal => return Some(unequal),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    /// `needle in self`: substring for strings, deep-equality membership for
    /// sequences, key membership for mappings.
    #[must_use]
    pub fn contains(&self, needle: &Self) -> Option<bool> {
        match self {
            Self::Str(s) | Self::Safe(s) => {
                let sub = needle.as_str()?;
                Some(s.contains(sub))
            }
            Self::Seq(items) | Self::Tuple(items) => Some(items.iter().any(|item| item.value_eq(needle))),
            Self::Map(map) => {
                let key = MapKey::try_from_value(needle)?;
                Some(map.contains_key(&key))
            }
            _ => None,
        }
    }

    /// Attribute lookup: mapping key, then named field (with a capitalized
    /// retry), then zero-argument method. Adapter panics count as a miss.
    #[must_use]
    pub fn get_attribute(&self, name: &str) -> Option<Self> {
        match self {
            Self::Map(map) => map.get(&MapKey::from(name)).cloned(),
            Self::Namespace(ns) => ns.attribute(name),
            Self::Loop(lo) => lo.attribute(name),
            Self::Object(object) => {
                if let Some(value) = object.field(name) {
                    return Some(value);
                }
                if let Some(capitalized) = capitalize_first(name)
                    && let Some(value) = object.field(&capitalized)
                {
                    return Some(value);
                }
                catch_unwind(AssertUnwindSafe(|| object.invoke(name)))
                    .ok()
                    .flatten()
            }
            _ => None,
        }
    }

    /// Subscript lookup: integer indexing (negative counts from the end)
    /// for sequences, tuples and strings; key lookup for mappings.
    #[must_use]
    pub fn get_item(&self, index: &Self) -> Option<Self> {
        match self {
            Self::Seq(items) | Self::Tuple(items) => {
                let at = normalize_index(index.as_int()?, items.len())?;
                items.get(at).cloned()
            }
            Self::Str(s) | Self::Safe(s) => {
                let chars: Vec<char> = s.chars().collect();
                let at = normalize_index(index.as_int()?, chars.len())?;
                chars.get(at).map(|c| Self::from(c.to_string()))
            }
            Self::Map(map) => {
                let key = MapKey::try_from_value(index)?;
                map.get(&key).cloned()
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Python slice semantics over sequences, tuples and strings.
    #[must_use]
    pub fn slice(&self, start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Option<Self> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return None;
        }
        match self {
            Self::Seq(items) | Self::Tuple(items) => {
                let picked = slice_indices(items.len(), start, stop, step)
                    .map(|i| items[i].clone())
                    .collect();
                Some(if matches!(self, Self::Tuple(_)) {
                    Self::tuple(picked)
                } else {
                    Self::seq(picked)
                })
            }
            Self::Str(s) | Self::Safe(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked: String = slice_indices(chars.len(), start, stop, step)
                    .map(|i| chars[i])
                    .collect();
                Some(Self::from(picked))
            }
            _ => None,
        }
    }

    /// Builds a value from anything serde can serialize.
    pub fn from_serialize<T: serde::Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from(serde_json::to_value(data)?))
    }
}

impl MapKey {
    /// Narrowing from a runtime value; non-hashable kinds return `None`.
    #[must_use]
    pub fn try_from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(s) | Value::Safe(s) => Some(Self::Str(s.clone())),
            Value::Int(i) => Some(Self::Int(*i)),
            Value::Bool(b) => Some(Self::Bool(*b)),
            _ => None,
        }
    }
}

/// Stable float formatting; integral floats keep a trailing `.0`.
#[must_use]
pub fn format_float(f: f64) -> String {
    if f.is_finite() {
        let mut buffer = ryu::Buffer::new();
        buffer.format(f).to_owned()
    } else if f.is_nan() {
        "nan".to_owned()
    } else if f > 0.0 {
        "inf".to_owned()
    } else {
        "-inf".to_owned()
    }
}

fn capitalize_first(name: &str) -> Option<String> {
    let mut chars = name.chars();
    let first = chars.next()?;
    if first.is_uppercase() {
        return None;
    }
    Some(first.to_uppercase().chain(chars).collect())
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let at = if index < 0 { index + len } else { index };
    (0..len).contains(&at).then_some(at as usize)
}

/// Index stream for `[start:stop:step]` with Python's clamping rules.
fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> impl Iterator<Item = usize> {
    let len = len as i64;
    let clamp = |v: i64, low: i64, high: i64| v.clamp(low, high);
    let (start, stop) = if step > 0 {
        let start = start.map_or(0, |v| clamp(if v < 0 { v + len } else { v }, 0, len));
        let stop = stop.map_or(len, |v| clamp(if v < 0 { v + len } else { v }, 0, len));
        (start, stop)
    } else {
        let start = start.map_or(len - 1, |v| clamp(if v < 0 { v + len } else { v }, -1, len - 1));
        let stop = stop.map_or(-1, |v| clamp(if v < 0 { v + len } else { v }, -1, len - 1));
        (start, stop)
    };
    let mut indices = Vec::new();
    let mut i = start;
    if step > 0 {
        while i < stop {
            indices.push(i as usize);
            i += step;
        }
    } else {
        while i > stop {
            indices.push(i as usize);
            i += step;
        }
    }
    indices.into_iter()
}

/// HTML-escapes `& < > " '`.
#[must_use]
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(Arc::from(v.as_str()))
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::seq(v.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::from(s),
            serde_json::Value::Array(items) => Self::seq(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(entries) => {
                let map: ValueMap = entries
                    .into_iter()
                    .map(|(k, v)| (MapKey::from(k), Self::from(v)))
                    .collect();
                Self::map(map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn truthiness_table() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::seq(vec![]).is_truthy());
        assert!(!Value::map(ValueMap::new()).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::from("x").is_truthy());
    }

    #[test]
    fn output_coercion() {
        assert_eq!(Value::from("hi").to_output_string(), "hi");
        assert_eq!(Value::Int(42).to_output_string(), "42");
        assert_eq!(Value::Float(3.0).to_output_string(), "3.0");
        assert_eq!(Value::Bool(true).to_output_string(), "true");
        assert_eq!(Value::None.to_output_string(), "");
        assert_eq!(Value::Undefined.to_output_string(), "");
        assert_eq!(
            Value::seq(vec![Value::Int(1), Value::from("a")]).to_output_string(),
            "[1, \"a\"]"
        );
    }

    #[test]
    fn numeric_promotion_in_equality() {
        assert!(Value::Int(1).value_eq(&Value::Float(1.0)));
        assert!(!Value::Int(1).value_eq(&Value::from("1")));
    }

    #[test]
    fn comparisons() {
        assert_eq!(
            Value::Int(1).value_cmp(&Value::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::from("abc").value_cmp(&Value::from("abd")),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Int(1).value_cmp(&Value::from("1")), None);
    }

    #[test]
    fn containment() {
        assert_eq!(Value::from("hello").contains(&Value::from("ell")), Some(true));
        let seq = Value::seq(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(seq.contains(&Value::Float(2.0)), Some(true));
        let mut map = ValueMap::new();
        map.insert(MapKey::from("k"), Value::Int(1));
        assert_eq!(Value::map(map).contains(&Value::from("k")), Some(true));
        assert_eq!(Value::Int(1).contains(&Value::Int(1)), None);
    }

    #[test]
    fn negative_indexing_and_slices() {
        let seq = Value::seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert!(seq.get_item(&Value::Int(-1)).unwrap().value_eq(&Value::Int(3)));
        assert!(seq.get_item(&Value::Int(3)).is_none());
        let sliced = seq.slice(Some(1), None, None).unwrap();
        assert_eq!(sliced.repr(), "[2, 3]");
        let reversed = seq.slice(None, None, Some(-1)).unwrap();
        assert_eq!(reversed.repr(), "[3, 2, 1]");
        assert_eq!(Value::from("hello").slice(Some(1), Some(3), None).unwrap().to_output_string(), "el");
    }

    #[test]
    fn attribute_lookup_on_maps() {
        let mut map = ValueMap::new();
        map.insert(MapKey::from("name"), Value::from("World"));
        let value = Value::map(map);
        assert_eq!(value.get_attribute("name").unwrap().to_output_string(), "World");
        assert!(value.get_attribute("missing").is_none());
    }

    #[derive(Debug)]
    struct User;

    impl Object for User {
        fn field(&self, name: &str) -> Option<Value> {
            // public fields are capitalized, host-ecosystem style
            (name == "Name").then(|| Value::from("alice"))
        }

        fn invoke(&self, name: &str) -> Option<Value> {
            match name {
                "greeting" => Some(Value::from("hi")),
                "explodes" => panic!("adapter bug"),
                _ => None,
            }
        }
    }

    #[test]
    fn object_lookup_retries_capitalized_and_catches_panics() {
        let value = Value::object(User);
        assert_eq!(value.get_attribute("name").unwrap().to_output_string(), "alice");
        assert_eq!(value.get_attribute("greeting").unwrap().to_output_string(), "hi");
        assert!(value.get_attribute("explodes").is_none());
    }

    #[test]
    fn html_escaping() {
        assert_eq!(html_escape(r#"<b a="x">&'"#), "&lt;b a=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn json_interop() {
        let value = Value::from(serde_json::json!({"items": [1, 2.5, "x"], "ok": true, "n": null}));
        assert_eq!(value.repr(), r#"{"items": [1, 2.5, "x"], "ok": true, "n": none}"#);
    }
}
