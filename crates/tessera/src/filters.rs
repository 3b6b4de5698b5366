//! Built-in filters: the compact default set registered at environment
//! construction. The registration contract (`add_filter`, duplicate
//! rejection) lives in the environment; these are just the seed functions.

use std::sync::Arc;

use crate::value::{Value, html_escape};

/// Signature of a filter: `x|name(a, b, kw=c)` calls
/// `f(&x, &[a, b], &[("kw", c)])`.
pub type FilterFunc = Arc<dyn Fn(&Value, &[Value], &[(String, Value)]) -> Result<Value, String> + Send + Sync>;

pub(crate) fn default_filters() -> Vec<(&'static str, FilterFunc)> {
    vec![
        ("upper", Arc::new(upper)),
        ("lower", Arc::new(lower)),
        ("capitalize", Arc::new(capitalize)),
        ("trim", Arc::new(trim)),
        ("length", Arc::new(length)),
        ("count", Arc::new(length)),
        ("first", Arc::new(first)),
        ("last", Arc::new(last)),
        ("join", Arc::new(join)),
        ("default", Arc::new(default_)),
        ("d", Arc::new(default_)),
        ("replace", Arc::new(replace)),
        ("escape", Arc::new(escape)),
        ("e", Arc::new(escape)),
        ("safe", Arc::new(safe)),
    ]
}

fn upper(value: &Value, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    Ok(Value::from(value.to_output_string().to_uppercase()))
}

fn lower(value: &Value, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    Ok(Value::from(value.to_output_string().to_lowercase()))
}

fn capitalize(value: &Value, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    let text = value.to_output_string();
    let mut chars = text.chars();
    let capitalized = match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    };
    Ok(Value::from(capitalized))
}

fn trim(value: &Value, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    Ok(Value::from(value.to_output_string().trim().to_owned()))
}

fn length(value: &Value, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    value
        .len()
        .map(Value::from)
        .ok_or_else(|| format!("object of type {} has no length", value.kind_name()))
}

fn first(value: &Value, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    let out = match value {
        Value::Seq(items) | Value::Tuple(items) => items.first().cloned(),
        Value::Str(s) | Value::Safe(s) => s.chars().next().map(|c| Value::from(c.to_string())),
        Value::Map(map) => map.keys().next().map(crate::value::MapKey::as_value),
        other => return Err(format!("cannot take first of {}", other.kind_name())),
    };
    Ok(out.unwrap_or(Value::Undefined))
}

fn last(value: &Value, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    let out = match value {
        Value::Seq(items) | Value::Tuple(items) => items.last().cloned(),
        Value::Str(s) | Value::Safe(s) => s.chars().next_back().map(|c| Value::from(c.to_string())),
        Value::Map(map) => map.keys().next_back().map(crate::value::MapKey::as_value),
        other => return Err(format!("cannot take last of {}", other.kind_name())),
    };
    Ok(out.unwrap_or(Value::Undefined))
}

fn join(value: &Value, args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    let separator = args.first().map(Value::to_output_string).unwrap_or_default();
    match value {
        Value::Seq(items) | Value::Tuple(items) => {
            let joined: Vec<String> = items.iter().map(Value::to_output_string).collect();
            Ok(Value::from(joined.join(&separator)))
        }
        other => Err(format!("cannot join {}", other.kind_name())),
    }
}

/// `default(fallback, boolean=false)`: the fallback replaces undefined
/// values, or any falsy value when `boolean` is set.
fn default_(value: &Value, args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, String> {
    let Some(fallback) = args.first() else {
        return Err("the default filter requires a fallback argument".to_owned());
    };
    let falsy_counts = args
        .get(1)
        .or_else(|| kwargs.iter().find(|(name, _)| name == "boolean").map(|(_, v)| v))
        .is_some_and(Value::is_truthy);
    let replace = if falsy_counts {
        !value.is_truthy()
    } else {
        value.is_undefined()
    };
    Ok(if replace { fallback.clone() } else { value.clone() })
}

fn replace(value: &Value, args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    let (Some(from), Some(to)) = (args.first(), args.get(1)) else {
        return Err("replace takes two arguments".to_owned());
    };
    let text = value.to_output_string();
    Ok(Value::from(
        text.replace(&from.to_output_string(), &to.to_output_string()),
    ))
}

fn escape(value: &Value, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    if value.is_safe() {
        return Ok(value.clone());
    }
    Ok(Value::safe(html_escape(&value.to_output_string())))
}

/// Marks the value as safe, suppressing autoescape for it.
fn safe(value: &Value, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, String> {
    Ok(Value::safe(value.to_output_string()))
}
