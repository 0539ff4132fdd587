//! Recovery expressions for the Injection strategy.
//!
//! An expression is a JavaScript snippet evaluated in a fresh `boa_engine`
//! context. The value of its last statement, converted to JSON, becomes the
//! call's result. These globals are bound before evaluation:
//!
//! | global | value |
//! |---|---|
//! | `service_id` | the invoked service id |
//! | `params` | the call parameters |
//! | `error.message` | the failure's message |
//! | `error.kind` | short failure label (`communication`, `remote`, ...) |
//! | `error.status_code` | remote status code, `null` for other failures |
//!
//! An expression starting with `{` is read as an object literal rather than
//! a block, so `{ degraded: true, text: params.text }` works as written.

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::{Attribute, PropertyKey},
    value::JsValue,
    Context, Source,
};
use meshrpc_common::protocol::error::{Result, RpcError};
use serde_json::{json, Value};
use tracing::trace;

/// Upper bound on loop iterations in one expression.
const LOOP_ITERATION_LIMIT: u64 = 100_000;

/// What a recovery expression can see.
#[derive(Debug, Clone, Copy)]
pub struct InjectionContext<'a> {
    pub service_id: &'a str,
    pub parameters: &'a Value,
    pub error: &'a RpcError,
}

/// Evaluates recovery expressions.
pub trait InjectionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, ctx: &InjectionContext<'_>) -> Result<Value>;
}

/// The built-in JavaScript evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptEvaluator;

impl InjectionEvaluator for ScriptEvaluator {
    fn evaluate(&self, expression: &str, ctx: &InjectionContext<'_>) -> Result<Value> {
        let mut js = Context::default();
        js.runtime_limits_mut().set_loop_iteration_limit(LOOP_ITERATION_LIMIT);

        let status_code = match ctx.error {
            RpcError::Remote { status_code, .. } => Value::from(*status_code),
            _ => Value::Null,
        };
        let error = json!({
            "message": ctx.error.to_string(),
            "kind": ctx.error.kind(),
            "status_code": status_code,
        });

        register(&mut js, "service_id", Value::String(ctx.service_id.to_string()))?;
        register(&mut js, "params", ctx.parameters.clone())?;
        register(&mut js, "error", error)?;

        let trimmed = expression.trim();
        let source = if trimmed.starts_with('{') {
            format!("({})", trimmed)
        } else {
            trimmed.to_string()
        };

        trace!(service_id = ctx.service_id, "evaluating injection expression");
        let result = js
            .eval(Source::from_bytes(&source))
            .map_err(|e| RpcError::Injection(format!("expression failed: {}", e)))?;
        js_value_to_json(result, &mut js)
    }
}

fn register(js: &mut Context, name: &str, value: Value) -> Result<()> {
    let value = json_to_js_value(value, js)?;
    js.register_global_property(js_string!(name), value, Attribute::all())
        .map_err(|e| RpcError::Injection(format!("failed to bind '{}': {}", name, e)))
}

fn json_to_js_value(json: Value, js: &mut Context) -> Result<JsValue> {
    match json {
        Value::Null => Ok(JsValue::null()),
        Value::Bool(b) => Ok(JsValue::new(b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                return Ok(JsValue::new(i));
            }
            n.as_f64()
                .map(JsValue::new)
                .ok_or_else(|| RpcError::Injection(format!("number {} out of range", n)))
        }
        Value::String(s) => Ok(JsValue::new(js_string!(s))),
        Value::Array(items) => {
            let array = JsArray::new(js);
            for (i, item) in items.into_iter().enumerate() {
                let item = json_to_js_value(item, js)?;
                array
                    .push(item, js)
                    .map_err(|e| RpcError::Injection(format!("failed to push element {}: {}", i, e)))?;
            }
            Ok(array.into())
        }
        Value::Object(fields) => {
            let object = JsObject::with_object_proto(js.intrinsics());
            for (key, item) in fields {
                let item = json_to_js_value(item, js)?;
                object
                    .create_data_property_or_throw(js_string!(key.clone()), item, js)
                    .map_err(|e| RpcError::Injection(format!("failed to set '{}': {}", key, e)))?;
            }
            Ok(object.into())
        }
    }
}

/// Converts a script result to JSON. `undefined` and symbols become `null`;
/// integral numbers become JSON integers.
fn js_value_to_json(value: JsValue, js: &mut Context) -> Result<Value> {
    if value.is_undefined() || value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(b) = value.as_boolean() {
        return Ok(Value::Bool(b));
    }
    if let JsValue::Integer(i) = value {
        return Ok(Value::from(i));
    }
    if let Some(n) = value.as_number() {
        if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
            return Ok(Value::from(n as i64));
        }
        return serde_json::Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| RpcError::Injection(format!("{} is not a JSON number", n)));
    }
    if let Some(s) = value.as_string() {
        return s
            .to_std_string()
            .map(Value::String)
            .map_err(|e| RpcError::Injection(format!("invalid string: {}", e)));
    }

    let Some(object) = value.as_object() else {
        return Ok(Value::Null);
    };

    if object.is_array() {
        let array = JsArray::from_object(object.clone())
            .map_err(|e| RpcError::Injection(format!("invalid array: {}", e)))?;
        let length: usize = array
            .length(js)
            .map_err(|e| RpcError::Injection(format!("failed to read array length: {}", e)))?
            .try_into()
            .map_err(|_| RpcError::Injection("array too long".into()))?;

        let mut items = Vec::with_capacity(length);
        for i in 0..length {
            let item = array
                .get(i, js)
                .map_err(|e| RpcError::Injection(format!("failed to read element {}: {}", i, e)))?;
            items.push(js_value_to_json(item, js)?);
        }
        return Ok(Value::Array(items));
    }

    let keys = object
        .own_property_keys(js)
        .map_err(|e| RpcError::Injection(format!("failed to read object keys: {}", e)))?;
    let mut fields = serde_json::Map::new();
    for key in keys {
        let name = match &key {
            PropertyKey::String(s) => s
                .to_std_string()
                .map_err(|e| RpcError::Injection(format!("invalid key: {}", e)))?,
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        let item = object
            .get(key, js)
            .map_err(|e| RpcError::Injection(format!("failed to read '{}': {}", name, e)))?;
        fields.insert(name, js_value_to_json(item, js)?);
    }
    Ok(Value::Object(fields))
}
