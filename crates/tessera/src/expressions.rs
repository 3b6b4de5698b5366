//! Expression evaluation: operator dispatch by value kind, lookups, calls,
//! filters, and tests. Statement evaluation lives in `eval.rs`; the two
//! halves share the [`Evaluator`] struct.

use crate::{
    ast::{BinaryOperator, LiteralValue, Node, UnaryOperator},
    context::Context,
    error::{CodeLoc, Error, RuntimeError, RuntimeErrorKind},
    eval::Evaluator,
    value::{MapKey, Value, ValueMap},
};

impl Evaluator<'_> {
    pub(crate) fn eval_expr(&mut self, node: &Node, ctx: &mut Context) -> Result<Value, Error> {
        match node {
            Node::Literal { value, .. } => Ok(match value {
                LiteralValue::Int(i) => Value::Int(*i),
                LiteralValue::Float(f) => Value::Float(*f),
                LiteralValue::Str(s) => Value::from(s.as_str()),
                LiteralValue::Bool(b) => Value::Bool(*b),
                LiteralValue::None => Value::None,
            }),
            Node::Identifier { name, .. } => Ok(ctx.get(name).unwrap_or_default()),
            Node::BinaryOp { op, lhs, rhs, loc } => self.eval_binary(*op, lhs, rhs, *loc, ctx),
            Node::UnaryOp { op, operand, loc } => {
                let value = self.eval_expr(operand, ctx)?;
                match op {
                    UnaryOperator::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOperator::Neg => match value {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(type_error(format!("cannot negate {}", other.kind_name()), *loc)),
                    },
                    UnaryOperator::Pos => match value {
                        Value::Int(_) | Value::Float(_) => Ok(value),
                        other => Err(type_error(format!("cannot apply unary '+' to {}", other.kind_name()), *loc)),
                    },
                }
            }
            Node::Ternary {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                if self.eval_expr(condition, ctx)?.is_truthy() {
                    self.eval_expr(then_expr, ctx)
                } else {
                    self.eval_expr(else_expr, ctx)
                }
            }
            Node::Attribute { object, name, loc } => {
                let value = self.eval_expr(object, ctx)?;
                if value.is_undefined() {
                    return Err(type_error(format!("cannot access attribute {name:?} of undefined"), *loc));
                }
                match value.get_attribute(name) {
                    Some(found) => Ok(found),
                    None if self.env.options().strict_undefined => Err(RuntimeError::new(
                        RuntimeErrorKind::AttributeMiss {
                            name: name.clone(),
                            on: value.kind_name().to_owned(),
                        },
                        *loc,
                    )
                    .into()),
                    None => Ok(Value::Undefined),
                }
            }
            Node::Subscript { object, index, loc } => {
                let value = self.eval_expr(object, ctx)?;
                if value.is_undefined() {
                    return Err(type_error("cannot index undefined".to_owned(), *loc));
                }
                let index = self.eval_expr(index, ctx)?;
                Ok(value.get_item(&index).unwrap_or_default())
            }
            Node::Slice {
                target,
                start,
                stop,
                step,
                loc,
            } => {
                let value = self.eval_expr(target, ctx)?;
                let start = self.eval_slice_bound(start.as_deref(), ctx, *loc)?;
                let stop = self.eval_slice_bound(stop.as_deref(), ctx, *loc)?;
                let step = self.eval_slice_bound(step.as_deref(), ctx, *loc)?;
                value.slice(start, stop, step).ok_or_else(|| {
                    type_error(format!("cannot slice {} with this range", value.kind_name()), *loc)
                })
            }
            Node::Filter { target, call } => {
                let value = self.eval_expr(target, ctx)?;
                self.apply_filter(call, value, ctx)
            }
            Node::Test {
                target,
                name,
                args,
                negate,
                loc,
            } => {
                let outcome = self.eval_test(target, name, args, *loc, ctx)?;
                Ok(Value::Bool(outcome != *negate))
            }
            Node::Call {
                callee, args, kwargs, loc, ..
            } => self.eval_call_with_caller(callee, args, kwargs, None, *loc, ctx),
            Node::List { items, .. } => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(item, ctx)?);
                }
                Ok(Value::seq(out))
            }
            Node::Tuple { items, .. } => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(item, ctx)?);
                }
                Ok(Value::tuple(out))
            }
            Node::Dict { pairs, loc } => {
                let mut map = ValueMap::with_capacity(pairs.len());
                for (key_expr, value_expr) in pairs {
                    let key = self.eval_expr(key_expr, ctx)?;
                    let Some(key) = MapKey::try_from_value(&key) else {
                        return Err(type_error(format!("{} is not a valid mapping key", key.kind_name()), *loc));
                    };
                    let value = self.eval_expr(value_expr, ctx)?;
                    map.insert(key, value);
                }
                Ok(Value::map(map))
            }
            // `super()` that survived resolution yields no output
            Node::Super { .. } => Ok(Value::safe("")),
            other => Err(type_error(
                format!("node is not usable as an expression at {}", other.loc()),
                other.loc(),
            )),
        }
    }

    fn eval_slice_bound(
        &mut self,
        bound: Option<&Node>,
        ctx: &mut Context,
        loc: CodeLoc,
    ) -> Result<Option<i64>, Error> {
        match bound {
            None => Ok(None),
            Some(expr) => match self.eval_expr(expr, ctx)? {
                Value::None | Value::Undefined => Ok(None),
                Value::Int(i) => Ok(Some(i)),
                other => Err(type_error(
                    format!("slice bounds must be integers, not {}", other.kind_name()),
                    loc,
                )),
            },
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOperator,
        lhs: &Node,
        rhs: &Node,
        loc: CodeLoc,
        ctx: &mut Context,
    ) -> Result<Value, Error> {
        // and/or short-circuit and return the last evaluated operand as-is
        match op {
            BinaryOperator::And => {
                let left = self.eval_expr(lhs, ctx)?;
                if !left.is_truthy() {
                    return Ok(left);
                }
                return self.eval_expr(rhs, ctx);
            }
            BinaryOperator::Or => {
                let left = self.eval_expr(lhs, ctx)?;
                if left.is_truthy() {
                    return Ok(left);
                }
                return self.eval_expr(rhs, ctx);
            }
            _ => {}
        }

        let left = self.eval_expr(lhs, ctx)?;
        let right = self.eval_expr(rhs, ctx)?;
        match op {
            BinaryOperator::And | BinaryOperator::Or => unreachable!("handled above"),
            BinaryOperator::Eq => Ok(Value::Bool(left.value_eq(&right))),
            BinaryOperator::Ne => Ok(Value::Bool(!left.value_eq(&right))),
            BinaryOperator::Lt | BinaryOperator::Le | BinaryOperator::Gt | BinaryOperator::Ge => {
                let Some(ordering) = left.value_cmp(&right) else {
                    return Err(type_error(
                        format!("cannot compare {} with {}", left.kind_name(), right.kind_name()),
                        loc,
                    ));
                };
                let outcome = match op {
                    BinaryOperator::Lt => ordering.is_lt(),
                    BinaryOperator::Le => ordering.is_le(),
                    BinaryOperator::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Value::Bool(outcome))
            }
            BinaryOperator::In | BinaryOperator::NotIn => {
                let Some(contained) = right.contains(&left) else {
                    return Err(type_error(
                        format!("{} is not a container", right.kind_name()),
                        loc,
                    ));
                };
                Ok(Value::Bool(contained == (op == BinaryOperator::In)))
            }
            BinaryOperator::Concat => {
                let mut joined = left.to_output_string();
                right.render_into(&mut joined);
                Ok(Value::from(joined))
            }
            BinaryOperator::Add
            | BinaryOperator::Sub
            | BinaryOperator::Mul
            | BinaryOperator::Div
            | BinaryOperator::FloorDiv
            | BinaryOperator::Mod
            | BinaryOperator::Pow => eval_arithmetic(op, &left, &right, loc),
        }
    }

    fn eval_test(
        &mut self,
        target: &Node,
        name: &str,
        args: &[Node],
        loc: CodeLoc,
        ctx: &mut Context,
    ) -> Result<bool, Error> {
        let Some(test) = self.env.find_test(name) else {
            return Err(RuntimeError::new(RuntimeErrorKind::UnknownTest(name.to_owned()), loc).into());
        };
        let value = self.eval_expr(target, ctx)?;
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval_expr(arg, ctx)?);
        }
        test(&value, &arg_values).map_err(|message| RuntimeError::new(RuntimeErrorKind::Other(message), loc).into())
    }

    /// Call evaluation. `caller` is bound when the invocation comes from a
    /// `{% call %}` block.
    pub(crate) fn eval_call_with_caller(
        &mut self,
        callee: &Node,
        args: &[Node],
        kwargs: &[(String, Node)],
        caller: Option<Value>,
        loc: CodeLoc,
        ctx: &mut Context,
    ) -> Result<Value, Error> {
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval_expr(arg, ctx)?);
        }
        let mut kwarg_values = Vec::with_capacity(kwargs.len());
        for (name, expr) in kwargs {
            kwarg_values.push((name.clone(), self.eval_expr(expr, ctx)?));
        }

        // method-style calls on builtin objects: loop.cycle(...)
        if let Node::Attribute { object, name, .. } = callee {
            let receiver = self.eval_expr(object, ctx)?;
            if let Value::Loop(lo) = &receiver
                && name == "cycle"
            {
                return Ok(lo.cycle(&arg_values));
            }
            let target = receiver.get_attribute(name).unwrap_or_default();
            return self.call_value(&target, &arg_values, &kwarg_values, caller, loc, ctx);
        }

        let target = self.eval_expr(callee, ctx)?;
        self.call_value(&target, &arg_values, &kwarg_values, caller, loc, ctx)
    }

    fn call_value(
        &mut self,
        target: &Value,
        args: &[Value],
        kwargs: &[(String, Value)],
        caller: Option<Value>,
        loc: CodeLoc,
        ctx: &mut Context,
    ) -> Result<Value, Error> {
        match target {
            Value::Macro(macro_value) => self.call_macro(macro_value, args, kwargs, caller, loc),
            Value::Loop(lo) => {
                let Some(argument) = args.first() else {
                    return Err(RuntimeError::arity("recursive loop call takes one argument".to_owned(), loc).into());
                };
                self.call_recursive_loop(lo, argument, loc, ctx)
            }
            other => Err(RuntimeError::new(RuntimeErrorKind::NotCallable(other.kind_name().to_owned()), loc).into()),
        }
    }
}

fn type_error(message: String, loc: CodeLoc) -> Error {
    RuntimeError::type_error(message, loc).into()
}

/// Numeric operators with int/float promotion; `+` also concatenates
/// strings and sequences.
fn eval_arithmetic(op: BinaryOperator, left: &Value, right: &Value, loc: CodeLoc) -> Result<Value, Error> {
    if op == BinaryOperator::Add {
        match (left, right) {
            (Value::Str(a) | Value::Safe(a), Value::Str(b) | Value::Safe(b)) => {
                return Ok(Value::from(format!("{a}{b}")));
            }
            (Value::Seq(a), Value::Seq(b)) => {
                let mut items = a.as_ref().clone();
                items.extend(b.iter().cloned());
                return Ok(Value::seq(items));
            }
            _ => {}
        }
    }

    match (left, right) {
        (Value::Int(a), Value::Int(b)) => eval_int_arithmetic(op, *a, *b, loc),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = left.as_f64().expect("numeric by match");
            let b = right.as_f64().expect("numeric by match");
            eval_float_arithmetic(op, a, b, loc)
        }
        _ => Err(type_error(
            format!(
                "unsupported operand types for '{op}': {} and {}",
                left.kind_name(),
                right.kind_name()
            ),
            loc,
        )),
    }
}

fn eval_int_arithmetic(op: BinaryOperator, a: i64, b: i64, loc: CodeLoc) -> Result<Value, Error> {
    let overflow = || type_error("integer overflow".to_owned(), loc);
    match op {
        BinaryOperator::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinaryOperator::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinaryOperator::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        // true division always produces a float
        BinaryOperator::Div => {
            if b == 0 {
                Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero, loc).into())
            } else {
                Ok(Value::Float(a as f64 / b as f64))
            }
        }
        // floor toward negative infinity, matching the float path
        BinaryOperator::FloorDiv => {
            if b == 0 {
                Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero, loc).into())
            } else {
                let q = a.checked_div(b).ok_or_else(overflow)?;
                Ok(Value::Int(if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }))
            }
        }
        // modulo takes the sign of the divisor
        BinaryOperator::Mod => {
            if b == 0 {
                Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero, loc).into())
            } else {
                let r = a % b;
                Ok(Value::Int(if r != 0 && (r < 0) != (b < 0) { r + b } else { r }))
            }
        }
        BinaryOperator::Pow => {
            if b < 0 {
                Ok(Value::Float((a as f64).powf(b as f64)))
            } else {
                let exponent = u32::try_from(b).map_err(|_| overflow())?;
                a.checked_pow(exponent).map(Value::Int).ok_or_else(overflow)
            }
        }
        _ => unreachable!("non-arithmetic operator {op}"),
    }
}

fn eval_float_arithmetic(op: BinaryOperator, a: f64, b: f64, loc: CodeLoc) -> Result<Value, Error> {
    let divide_by_zero = || Error::from(RuntimeError::new(RuntimeErrorKind::DivisionByZero, loc));
    let value = match op {
        BinaryOperator::Add => a + b,
        BinaryOperator::Sub => a - b,
        BinaryOperator::Mul => a * b,
        BinaryOperator::Div => {
            if b == 0.0 {
                return Err(divide_by_zero());
            }
            a / b
        }
        BinaryOperator::FloorDiv => {
            if b == 0.0 {
                return Err(divide_by_zero());
            }
            (a / b).floor()
        }
        BinaryOperator::Mod => {
            if b == 0.0 {
                return Err(divide_by_zero());
            }
            a - b * (a / b).floor()
        }
        BinaryOperator::Pow => a.powf(b),
        _ => unreachable!("non-arithmetic operator {op}"),
    };
    Ok(Value::Float(value))
}
