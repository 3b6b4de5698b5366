//! The runtime evaluator: walks a resolved AST against a context and
//! produces the output string. Expression evaluation lives in
//! `expressions.rs`; this file owns statement dispatch, loops, macros, and
//! the template-crossing operations (include, import).

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    ast::{FilterCall, Node},
    context::Context,
    environment::Environment,
    error::{CodeLoc, Error, RuntimeError, RuntimeErrorKind},
    value::{LoopObject, MacroValue, RecursiveLoop, TemplateNamespace, Value, html_escape},
};

pub(crate) struct Evaluator<'e> {
    pub(crate) env: &'e Environment,
    pub(crate) template_name: String,
    /// Autoescape state stack; the top is the active state.
    autoescape: Vec<bool>,
}

impl<'e> Evaluator<'e> {
    pub(crate) fn new(env: &'e Environment, template_name: &str) -> Self {
        let initial = env.initial_autoescape(template_name);
        Self {
            env,
            template_name: template_name.to_owned(),
            autoescape: vec![initial],
        }
    }

    pub(crate) fn autoescape_active(&self) -> bool {
        *self.autoescape.last().expect("autoescape stack is never empty")
    }

    /// Top-level entry: renders a resolved template's children.
    pub(crate) fn render_template(&mut self, root: &Node, ctx: &mut Context) -> Result<String, Error> {
        let Node::Template { children, .. } = root else {
            return Err(RuntimeError::unlocated(RuntimeErrorKind::Other(
                "render target is not a template".to_owned(),
            ))
            .into());
        };
        let name = self.template_name.clone();
        self.render_to_string(children, ctx).map_err(|err| err.in_template(&name))
    }

    pub(crate) fn render_to_string(&mut self, nodes: &[Node], ctx: &mut Context) -> Result<String, Error> {
        let mut out = self.env.builders().get();
        let result = self.render_nodes(nodes, ctx, &mut out);
        let rendered = result.map(|()| out.as_str().to_owned());
        self.env.builders().put(out);
        rendered
    }

    fn render_nodes(&mut self, nodes: &[Node], ctx: &mut Context, out: &mut String) -> Result<(), Error> {
        for node in nodes {
            self.render_node(node, ctx, out)?;
        }
        Ok(())
    }

    fn render_node(&mut self, node: &Node, ctx: &mut Context, out: &mut String) -> Result<(), Error> {
        match node {
            Node::Text { content, .. } | Node::Raw { content, .. } => out.push_str(content),
            Node::Comment { .. } | Node::Extends { .. } => {}
            // a super() outside any override chain yields no output
            Node::Super { .. } => {}
            Node::Variable { expression, .. } => {
                let value = self.eval_expr(expression, ctx)?;
                if self.env.options().strict_undefined && value.is_undefined() {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::UndefinedVariable(describe_expr(expression)),
                        expression.loc(),
                    )
                    .into());
                }
                self.write_value(&value, out);
            }
            Node::If {
                condition,
                body,
                elifs,
                else_body,
                ..
            } => {
                if self.eval_expr(condition, ctx)?.is_truthy() {
                    return self.render_nodes(body, ctx, out);
                }
                for (elif_condition, elif_body) in elifs {
                    if self.eval_expr(elif_condition, ctx)?.is_truthy() {
                        return self.render_nodes(elif_body, ctx, out);
                    }
                }
                self.render_nodes(else_body, ctx, out)?;
            }
            Node::For { .. } => self.render_for(node, ctx, out)?,
            Node::Set { targets, value, loc } => {
                let value = self.eval_expr(value, ctx)?;
                self.bind_targets(targets, value, *loc, ctx)?;
            }
            Node::SetBlock { name, body, .. } => {
                ctx.push();
                let rendered = self.render_to_string(body, ctx);
                ctx.pop();
                ctx.set(name.clone(), Value::safe(rendered?));
            }
            Node::With { bindings, body, .. } => {
                let mut values = Vec::with_capacity(bindings.len());
                for (name, expr) in bindings {
                    values.push((name.clone(), self.eval_expr(expr, ctx)?));
                }
                ctx.push();
                for (name, value) in values {
                    ctx.set(name, value);
                }
                let result = self.render_nodes(body, ctx, out);
                ctx.pop();
                result?;
            }
            Node::FilterBlock { filters, body, .. } => {
                ctx.push();
                let rendered = self.render_to_string(body, ctx);
                ctx.pop();
                let mut value = Value::from(rendered?);
                for filter in filters {
                    value = self.apply_filter(filter, value, ctx)?;
                }
                self.write_value(&value, out);
            }
            Node::Autoescape { enabled, body, .. } => {
                let flag = self.eval_expr(enabled, ctx)?.is_truthy();
                self.autoescape.push(flag);
                let result = self.render_nodes(body, ctx, out);
                self.autoescape.pop();
                result?;
            }
            Node::Include {
                template,
                with_context,
                ignore_missing,
                loc,
            } => self.render_include(template, *with_context, *ignore_missing, *loc, ctx, out)?,
            Node::Import { template, alias, loc } => {
                let namespace = self.execute_import(template, *loc, ctx)?;
                ctx.set(alias.clone(), namespace);
            }
            Node::FromImport { template, names, loc } => {
                let namespace = self.execute_import(template, *loc, ctx)?;
                let Value::Namespace(ns) = &namespace else {
                    unreachable!("execute_import returns a namespace");
                };
                for (name, alias) in names {
                    let Some(value) = ns.attribute(name) else {
                        return Err(RuntimeError::new(
                            RuntimeErrorKind::Other(format!(
                                "cannot import {name:?} from {:?}",
                                ns.template_name
                            )),
                            *loc,
                        )
                        .into());
                    };
                    ctx.set(alias.clone().unwrap_or_else(|| name.clone()), value);
                }
            }
            Node::Macro {
                name,
                params,
                defaults,
                body,
                ..
            } => {
                let mut evaluated_defaults = Vec::with_capacity(defaults.len());
                for (param, default_expr) in defaults {
                    evaluated_defaults.push((param.clone(), self.eval_expr(default_expr, ctx)?));
                }
                let value = Value::Macro(Arc::new(MacroValue {
                    name: name.clone(),
                    params: params.clone(),
                    defaults: evaluated_defaults,
                    body: Arc::new(body.clone()),
                    defining_context: ctx.clone(),
                }));
                ctx.set(name.clone(), value);
            }
            Node::CallBlock { call, body, loc } => {
                let caller = Value::Macro(Arc::new(MacroValue {
                    name: "caller".to_owned(),
                    params: Vec::new(),
                    defaults: Vec::new(),
                    body: Arc::new(body.clone()),
                    defining_context: ctx.clone(),
                }));
                let Node::Call {
                    callee, args, kwargs, ..
                } = call.as_ref()
                else {
                    unreachable!("the parser only builds call blocks around calls");
                };
                let value = self.eval_call_with_caller(callee, args, kwargs, Some(caller), *loc, ctx)?;
                self.write_value(&value, out);
            }
            Node::Do { expression, .. } => {
                self.eval_expr(expression, ctx)?;
            }
            Node::Extension {
                extension,
                tag,
                args,
                body,
                loc,
            } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval_expr(arg, ctx)?);
                }
                ctx.push();
                let rendered_body = self.render_to_string(body, ctx);
                ctx.pop();
                let value = self
                    .env
                    .extensions()
                    .evaluate(extension, tag, &arg_values, &rendered_body?, ctx)
                    .map_err(|err| Error::from(err).in_template(&self.template_name).locate(*loc))?;
                self.write_value(&value, out);
            }
            // blocks survive only when an unresolved template is rendered
            // directly; they render their own body
            Node::Block { body, .. } => self.render_nodes(body, ctx, out)?,
            Node::Template { children, .. } => self.render_nodes(children, ctx, out)?,
            expression => {
                let value = self.eval_expr(expression, ctx)?;
                self.write_value(&value, out);
            }
        }
        Ok(())
    }

    /// Output coercion plus escaping: under active autoescape every value
    /// that is not marked safe is HTML-escaped.
    fn write_value(&self, value: &Value, out: &mut String) {
        if self.autoescape_active() && !value.is_safe() {
            let mut plain = String::new();
            value.render_into(&mut plain);
            out.push_str(&html_escape(&plain));
        } else {
            value.render_into(out);
        }
    }

    /// Multi-target set unpacks a sequence or tuple of matching length.
    pub(crate) fn bind_targets(
        &mut self,
        targets: &[String],
        value: Value,
        loc: CodeLoc,
        ctx: &mut Context,
    ) -> Result<(), Error> {
        if targets.len() == 1 {
            ctx.set(targets[0].clone(), value);
            return Ok(());
        }
        let items = match &value {
            Value::Seq(items) | Value::Tuple(items) => items.as_slice(),
            other => {
                return Err(RuntimeError::type_error(
                    format!("cannot unpack {} into {} names", other.kind_name(), targets.len()),
                    loc,
                )
                .into());
            }
        };
        if items.len() != targets.len() {
            return Err(RuntimeError::new(
                RuntimeErrorKind::UnpackMismatch {
                    expected: targets.len(),
                    got: items.len(),
                },
                loc,
            )
            .into());
        }
        for (target, item) in targets.iter().zip(items.iter()) {
            ctx.set(target.clone(), item.clone());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // for loops
    // ------------------------------------------------------------------

    fn render_for(&mut self, node: &Node, ctx: &mut Context, out: &mut String) -> Result<(), Error> {
        let Node::For {
            targets,
            iterable,
            filter,
            recursive,
            body,
            else_body,
            loc,
        } = node
        else {
            unreachable!("render_for is only called with for nodes");
        };
        let iterable = self.eval_expr(iterable, ctx)?;
        let items = self.loop_items(&iterable, targets.len(), *loc)?;

        let recursive_state = recursive.then(|| {
            Arc::new(RecursiveLoop {
                targets: targets.clone(),
                body: Arc::new(body.clone()),
                filter: filter.clone().map(|f| Arc::new(*f)),
            })
        });
        let rendered = self.run_loop(
            &items,
            targets,
            filter.as_deref(),
            body,
            recursive_state,
            self.enclosing_loop(ctx),
            *loc,
            ctx,
        )?;
        match rendered {
            Some(text) => out.push_str(&text),
            None => {
                // empty iterable: the else body runs exactly once
                ctx.push();
                let result = self.render_nodes(else_body, ctx, out);
                ctx.pop();
                result?;
            }
        }
        Ok(())
    }

    /// The `loop` value of the lexically enclosing loop, for `loop.parent`
    /// and depth tracking.
    fn enclosing_loop(&self, ctx: &Context) -> Option<Value> {
        match ctx.get("loop") {
            Some(value @ Value::Loop(_)) => Some(value),
            _ => None,
        }
    }

    /// Materializes the iterable into concrete items, already shaped for
    /// the loop targets (mappings yield pairs for two targets, keys
    /// otherwise).
    pub(crate) fn loop_items(&self, iterable: &Value, target_count: usize, loc: CodeLoc) -> Result<Vec<Value>, Error> {
        let items = match iterable {
            Value::Str(s) | Value::Safe(s) => s.chars().map(|c| Value::from(c.to_string())).collect(),
            Value::Seq(items) | Value::Tuple(items) => items.as_ref().clone(),
            Value::Map(map) => {
                if target_count >= 2 {
                    map.iter()
                        .map(|(k, v)| Value::tuple(vec![k.as_value(), v.clone()]))
                        .collect()
                } else {
                    map.keys().map(crate::value::MapKey::as_value).collect()
                }
            }
            other => {
                return Err(RuntimeError::new(RuntimeErrorKind::NotIterable(other.kind_name().to_owned()), loc).into());
            }
        };
        Ok(items)
    }

    /// Runs the loop proper. Returns `None` when the (filtered) iterable was
    /// empty, so the caller can run the else body.
    #[expect(clippy::too_many_arguments, reason = "loop state is wide by nature")]
    pub(crate) fn run_loop(
        &mut self,
        items: &[Value],
        targets: &[String],
        filter: Option<&Node>,
        body: &[Node],
        recursive_state: Option<Arc<RecursiveLoop>>,
        parent: Option<Value>,
        loc: CodeLoc,
        ctx: &mut Context,
    ) -> Result<Option<String>, Error> {
        // The optional `if` filter sees the loop targets, so each candidate
        // is bound in a scratch frame before the condition runs.
        let mut selected = Vec::with_capacity(items.len());
        for item in items {
            let keep = match filter {
                Some(condition) => {
                    ctx.push();
                    let bound = self.bind_targets(targets, item.clone(), loc, ctx);
                    let keep = bound.and_then(|()| self.eval_expr(condition, ctx));
                    ctx.pop();
                    keep?.is_truthy()
                }
                None => true,
            };
            if keep {
                selected.push(item.clone());
            }
        }
        if selected.is_empty() {
            return Ok(None);
        }

        let depth0 = parent.as_ref().map_or(0, |p| match p {
            Value::Loop(lo) => lo.depth0 + 1,
            _ => 0,
        });
        let length = selected.len();
        let mut out = String::new();
        for (index0, item) in selected.into_iter().enumerate() {
            ctx.push();
            let loop_value = Value::Loop(Arc::new(LoopObject {
                index0,
                length,
                depth0,
                parent: parent.clone(),
                recursive: recursive_state.clone(),
            }));
            ctx.set("loop", loop_value);
            let bound = self.bind_targets(targets, item, loc, ctx);
            let result = bound.and_then(|()| {
                let mut chunk = String::new();
                self.render_nodes(body, ctx, &mut chunk)?;
                out.push_str(&chunk);
                Ok(())
            });
            ctx.pop();
            result?;
        }
        Ok(Some(out))
    }

    /// `loop(value)` inside a `recursive` loop body: re-enter the body with
    /// the new iterable one level deeper.
    pub(crate) fn call_recursive_loop(
        &mut self,
        current: &LoopObject,
        iterable: &Value,
        loc: CodeLoc,
        ctx: &mut Context,
    ) -> Result<Value, Error> {
        let Some(state) = current.recursive.clone() else {
            return Err(RuntimeError::new(
                RuntimeErrorKind::NotCallable("a non-recursive loop".to_owned()),
                loc,
            )
            .into());
        };
        let items = self.loop_items(iterable, state.targets.len(), loc)?;
        let parent = Some(Value::Loop(Arc::new(LoopObject {
            index0: current.index0,
            length: current.length,
            depth0: current.depth0,
            parent: current.parent.clone(),
            recursive: current.recursive.clone(),
        })));
        let rendered = self.run_loop(
            &items,
            &state.targets,
            state.filter.as_deref(),
            &state.body,
            Some(state.clone()),
            parent,
            loc,
            ctx,
        )?;
        Ok(Value::safe(rendered.unwrap_or_default()))
    }

    // ------------------------------------------------------------------
    // includes and imports
    // ------------------------------------------------------------------

    fn render_include(
        &mut self,
        template: &Node,
        with_context: bool,
        ignore_missing: bool,
        loc: CodeLoc,
        ctx: &mut Context,
        out: &mut String,
    ) -> Result<(), Error> {
        // the target expression is evaluated against the current context
        let name_value = self.eval_expr(template, ctx)?;
        let Some(name) = name_value.as_str().map(str::to_owned) else {
            return Err(RuntimeError::type_error(
                format!("include target must be a string, not {}", name_value.kind_name()),
                loc,
            )
            .into());
        };
        let resolved = match self.env.load_resolved(&name) {
            Ok(resolved) => resolved,
            Err(err) => {
                if ignore_missing && err.as_load_error().is_some_and(crate::error::LoadError::is_not_found) {
                    return Ok(());
                }
                return Err(err);
            }
        };
        let Node::Template { children, .. } = resolved.as_ref() else {
            unreachable!("resolved templates are template nodes");
        };

        let previous_name = std::mem::replace(&mut self.template_name, name);
        let result = if with_context {
            self.render_nodes(children, ctx, out)
        } else {
            // a fresh context seeded with the environment globals only
            let mut fresh = self.env.contexts().get(ctx.globals().clone());
            let result = self.render_nodes(children, &mut fresh, out);
            self.env.contexts().put(fresh);
            result
        };
        let result = result.map_err(|err| err.in_template(&self.template_name));
        self.template_name = previous_name;
        result
    }

    /// Runs an imported template against a fresh globals-only context and
    /// collects its namespace.
    fn execute_import(&mut self, template: &Node, loc: CodeLoc, ctx: &mut Context) -> Result<Value, Error> {
        let name_value = self.eval_expr(template, ctx)?;
        let Some(name) = name_value.as_str().map(str::to_owned) else {
            return Err(RuntimeError::type_error(
                format!("import target must be a string, not {}", name_value.kind_name()),
                loc,
            )
            .into());
        };
        let resolved = self.env.load_resolved(&name)?;
        let Node::Template { children, .. } = resolved.as_ref() else {
            unreachable!("resolved templates are template nodes");
        };

        let mut import_ctx = Context::with_globals(ctx.globals().clone());
        let previous_name = std::mem::replace(&mut self.template_name, name.clone());
        // rendered output of the import run is discarded
        let result = self.render_to_string(children, &mut import_ctx);
        self.template_name = previous_name;
        result.map_err(|err| err.in_template(&name))?;

        let mut macros = IndexMap::new();
        let mut variables = IndexMap::new();
        for (binding, value) in import_ctx.leaf_entries() {
            if matches!(value, Value::Macro(_)) {
                macros.insert(binding.clone(), value.clone());
            } else {
                variables.insert(binding.clone(), value.clone());
            }
        }
        Ok(Value::Namespace(Arc::new(TemplateNamespace {
            template_name: name,
            macros,
            variables,
            context_snapshot: import_ctx,
        })))
    }

    // ------------------------------------------------------------------
    // macro calls
    // ------------------------------------------------------------------

    /// Binds arguments and renders a macro body. Binding order: positionals
    /// first, then keywords by name, then defaults; anything still missing
    /// is an arity error, as are surplus arguments.
    pub(crate) fn call_macro(
        &mut self,
        macro_value: &Arc<MacroValue>,
        args: &[Value],
        kwargs: &[(String, Value)],
        caller: Option<Value>,
        loc: CodeLoc,
    ) -> Result<Value, Error> {
        if args.len() > macro_value.params.len() {
            return Err(RuntimeError::arity(
                format!(
                    "macro {:?} takes {} argument(s), got {}",
                    macro_value.name,
                    macro_value.params.len(),
                    args.len()
                ),
                loc,
            )
            .into());
        }

        let mut bound: Vec<Option<Value>> = vec![None; macro_value.params.len()];
        for (slot, value) in bound.iter_mut().zip(args.iter()) {
            *slot = Some(value.clone());
        }
        for (name, value) in kwargs {
            let Some(at) = macro_value.params.iter().position(|p| p == name) else {
                return Err(RuntimeError::arity(
                    format!("macro {:?} has no parameter {name:?}", macro_value.name),
                    loc,
                )
                .into());
            };
            if bound[at].is_some() {
                return Err(RuntimeError::arity(
                    format!("macro {:?} got multiple values for {name:?}", macro_value.name),
                    loc,
                )
                .into());
            }
            bound[at] = Some(value.clone());
        }
        for (at, param) in macro_value.params.iter().enumerate() {
            if bound[at].is_none()
                && let Some((_, default)) = macro_value.defaults.iter().find(|(name, _)| name == param)
            {
                bound[at] = Some(default.clone());
            }
        }

        let mut call_ctx = macro_value.defining_context.clone();
        call_ctx.push();
        // the macro can call itself: its defining context was captured
        // before the definition bound the name
        call_ctx.set(macro_value.name.clone(), Value::Macro(macro_value.clone()));
        for (param, value) in macro_value.params.iter().zip(bound) {
            let Some(value) = value else {
                return Err(RuntimeError::arity(
                    format!("macro {:?} missing required parameter {param:?}", macro_value.name),
                    loc,
                )
                .into());
            };
            call_ctx.set(param.clone(), value);
        }
        if let Some(caller) = caller {
            call_ctx.set("caller", caller);
        }

        let rendered = self.render_to_string(&macro_value.body, &mut call_ctx)?;
        Ok(Value::safe(rendered))
    }

    /// Applies one filter-chain link to a value.
    pub(crate) fn apply_filter(&mut self, call: &FilterCall, value: Value, ctx: &mut Context) -> Result<Value, Error> {
        let Some(filter) = self.env.find_filter(&call.name) else {
            return Err(RuntimeError::new(RuntimeErrorKind::UnknownFilter(call.name.clone()), call.loc).into());
        };
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval_expr(arg, ctx)?);
        }
        let mut kwargs = Vec::with_capacity(call.kwargs.len());
        for (name, expr) in &call.kwargs {
            kwargs.push((name.clone(), self.eval_expr(expr, ctx)?));
        }
        filter(&value, &args, &kwargs)
            .map_err(|message| RuntimeError::new(RuntimeErrorKind::Other(message), call.loc).into())
    }
}

/// Short description of an expression for undefined-variable messages.
fn describe_expr(node: &Node) -> String {
    match node {
        Node::Identifier { name, .. } => name.clone(),
        Node::Attribute { object, name, .. } => format!("{}.{name}", describe_expr(object)),
        other => format!("<{}>", other.loc()),
    }
}
