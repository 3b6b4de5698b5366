//! Built-in tests (`x is name`): the default predicate set registered at
//! environment construction.

use std::sync::Arc;

use crate::value::Value;

/// Signature of a test: `x is name(a)` calls `f(&x, &[a])`.
pub type TestFunc = Arc<dyn Fn(&Value, &[Value]) -> Result<bool, String> + Send + Sync>;

pub(crate) fn default_tests() -> Vec<(&'static str, TestFunc)> {
    vec![
        ("defined", Arc::new(|v, _| Ok(!v.is_undefined()))),
        ("undefined", Arc::new(|v, _| Ok(v.is_undefined()))),
        ("none", Arc::new(|v, _| Ok(matches!(v, Value::None)))),
        ("boolean", Arc::new(|v, _| Ok(matches!(v, Value::Bool(_))))),
        ("true", Arc::new(|v, _| Ok(matches!(v, Value::Bool(true))))),
        ("false", Arc::new(|v, _| Ok(matches!(v, Value::Bool(false))))),
        ("string", Arc::new(|v, _| Ok(v.as_str().is_some()))),
        ("number", Arc::new(|v, _| Ok(v.is_number()))),
        ("mapping", Arc::new(|v, _| Ok(matches!(v, Value::Map(_))))),
        (
            "sequence",
            Arc::new(|v, _| Ok(matches!(v, Value::Seq(_) | Value::Tuple(_)))),
        ),
        (
            "iterable",
            Arc::new(|v, _| {
                Ok(matches!(
                    v,
                    Value::Seq(_) | Value::Tuple(_) | Value::Map(_) | Value::Str(_) | Value::Safe(_)
                ))
            }),
        ),
        ("even", Arc::new(|v, _| parity(v, 0))),
        ("odd", Arc::new(|v, _| parity(v, 1))),
        ("divisibleby", Arc::new(divisibleby)),
    ]
}

fn parity(value: &Value, remainder: i64) -> Result<bool, String> {
    match value {
        Value::Int(i) => Ok(i.rem_euclid(2) == remainder),
        other => Err(format!("parity tests need an integer, not {}", other.kind_name())),
    }
}

fn divisibleby(value: &Value, args: &[Value]) -> Result<bool, String> {
    let (Value::Int(a), Some(Value::Int(b))) = (value, args.first()) else {
        return Err("divisibleby needs two integers".to_owned());
    };
    if *b == 0 {
        return Err("divisibleby divisor must not be zero".to_owned());
    }
    Ok(a % b == 0)
}

#[cfg(test)]
mod unit {
    use super::*;

    fn call(name: &str, value: &Value, args: &[Value]) -> bool {
        let tests = default_tests();
        let (_, t) = tests.iter().find(|(n, _)| *n == name).unwrap();
        t(value, args).unwrap()
    }

    #[test]
    fn definedness() {
        assert!(call("defined", &Value::Int(1), &[]));
        assert!(call("undefined", &Value::Undefined, &[]));
        assert!(call("none", &Value::None, &[]));
        assert!(!call("none", &Value::Undefined, &[]));
    }

    #[test]
    fn shapes() {
        assert!(call("string", &Value::from("x"), &[]));
        assert!(call("number", &Value::Float(1.5), &[]));
        assert!(call("mapping", &Value::map(crate::value::ValueMap::new()), &[]));
        assert!(call("sequence", &Value::seq(vec![]), &[]));
        assert!(call("iterable", &Value::from("x"), &[]));
        assert!(!call("iterable", &Value::Int(3), &[]));
    }

    #[test]
    fn arithmetic_predicates() {
        assert!(call("even", &Value::Int(4), &[]));
        assert!(call("odd", &Value::Int(-3), &[]));
        assert!(call("divisibleby", &Value::Int(9), &[Value::Int(3)]));
        let tests = default_tests();
        let (_, odd) = tests.iter().find(|(n, _)| *n == "odd").unwrap();
        assert!(odd(&Value::from("x"), &[]).is_err());
    }
}
