//! Runtime values of the sandboxed interpreter.
//!
//! Containers are shared mutable cells so aliasing behaves the way the
//! guest language expects (`b = a; b.append(1)` is visible through `a`).
//! Everything is `Send` so a whole run can live inside a tokio timeout.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as Json;

use super::parser::FunctionDef;

/// Shared mutable list cell.
pub type ListRef = Arc<Mutex<Vec<Value>>>;
/// Shared mutable dict cell; insertion-ordered, string keys.
pub type DictRef = Arc<Mutex<Vec<(String, Value)>>>;

/// A value the interpreter can hold.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(ListRef),
    Tuple(Arc<Vec<Value>>),
    Dict(DictRef),
    /// An allow-listed module namespace (`math`, `asyncio`, ...).
    Module(String),
    /// A function reached through a module attribute chain, e.g.
    /// `math.sqrt` or `datetime.datetime.now`.
    ModuleFn { module: String, path: String },
    /// A built-in free function (`len`, `print`, ...).
    Builtin(&'static str),
    /// A method bound to a receiver (`"a,b".split`).
    BoundMethod {
        receiver: Box<Value>,
        method: String,
    },
    /// A toolbox namespace injected by the executor.
    Toolbox(String),
    /// An async tool callable (`default.multiply`).
    ToolFn { toolbox: String, name: String },
    /// A function defined by the guest program.
    Function(Arc<FunctionDef>),
}

impl Value {
    /// Build a new shared list.
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(Mutex::new(items)))
    }

    /// Build a new shared dict.
    pub fn dict(entries: Vec<(String, Value)>) -> Value {
        Value::Dict(Arc::new(Mutex::new(entries)))
    }

    /// Guest-visible type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Module(_) => "module",
            Value::ModuleFn { .. } | Value::Builtin(_) => "builtin_function_or_method",
            Value::BoundMethod { .. } => "method",
            Value::Toolbox(_) => "toolbox",
            Value::ToolFn { .. } => "tool",
            Value::Function(_) => "function",
        }
    }

    /// Truthiness following the guest language's rules.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.lock().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.lock().is_empty(),
            _ => true,
        }
    }

    /// Whether the value is callable (excluded from captured locals).
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::ModuleFn { .. }
                | Value::Builtin(_)
                | Value::BoundMethod { .. }
                | Value::ToolFn { .. }
                | Value::Function(_)
        )
    }

    /// `str(value)` rendering.
    pub fn display(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => s.clone(),
            _ => self.repr(),
        }
    }

    /// `repr(value)` rendering (strings quoted; containers recurse).
    ///
    /// Depth is capped so self-referential containers render as `...`
    /// instead of recursing forever.
    pub fn repr(&self) -> String {
        self.repr_depth(0)
    }

    fn repr_depth(&self, depth: usize) -> String {
        if depth > 8 {
            return "...".to_string();
        }
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(items) => {
                // Snapshot before recursing: aliased children must not
                // re-enter the lock.
                let snapshot = items.lock().clone();
                let rendered: Vec<String> =
                    snapshot.iter().map(|v| v.repr_depth(depth + 1)).collect();
                format!("[{}]", rendered.join(", "))
            }
            Value::Tuple(items) => {
                let rendered: Vec<String> =
                    items.iter().map(|v| v.repr_depth(depth + 1)).collect();
                if rendered.len() == 1 {
                    format!("({},)", rendered[0])
                } else {
                    format!("({})", rendered.join(", "))
                }
            }
            Value::Dict(entries) => {
                let snapshot = entries.lock().clone();
                let rendered: Vec<String> = snapshot
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr_depth(depth + 1)))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Value::Module(name) => format!("<module '{name}'>"),
            Value::ModuleFn { module, path } => {
                format!("<built-in function {module}.{path}>")
            }
            Value::Builtin(name) => format!("<built-in function {name}>"),
            Value::BoundMethod { method, .. } => format!("<bound method {method}>"),
            Value::Toolbox(name) => format!("<toolbox '{name}'>"),
            Value::ToolFn { toolbox, name } => format!("<tool {toolbox}.{name}>"),
            Value::Function(def) => format!("<function {}>", def.name),
            other => other.display(),
        }
    }

    /// Numeric view, when the value is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Structural equality with numeric coercion.
    ///
    /// Containers are snapshotted before comparison so aliased values
    /// never take the same lock twice.
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.lock().clone();
                let b = b.lock().clone();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.lock().clone();
                let b = b.lock().clone();
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.iter().any(|(k2, v2)| k == k2 && v.py_eq(v2)))
            }
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Ordering for numbers and strings.
    pub fn py_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Convert into JSON for tool kwargs and context variables.
    pub fn to_json(&self) -> Json {
        match self {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::List(items) => {
                let snapshot = items.lock().clone();
                Json::Array(snapshot.iter().map(|v| v.to_json()).collect())
            }
            Value::Tuple(items) => Json::Array(items.iter().map(|v| v.to_json()).collect()),
            Value::Dict(entries) => {
                let snapshot = entries.lock().clone();
                let mut map = serde_json::Map::new();
                for (k, v) in snapshot.iter() {
                    map.insert(k.clone(), v.to_json());
                }
                Json::Object(map)
            }
            other => Json::String(other.repr()),
        }
    }

    /// Convert JSON (tool results, context variables) into a value.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr())
    }
}

/// Render a float the way the guest language prints one.
pub fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_guest_conventions() {
        assert_eq!(Value::None.display(), "None");
        assert_eq!(Value::Bool(true).display(), "True");
        assert_eq!(Value::Float(2.0).display(), "2.0");
        assert_eq!(Value::Float(2.5).display(), "2.5");
        assert_eq!(Value::Str("hi".into()).display(), "hi");
    }

    #[test]
    fn test_repr_quotes_strings_in_containers() {
        let list = Value::list(vec![Value::Str("a".into()), Value::Int(1)]);
        assert_eq!(list.display(), "['a', 1]");
        let dict = Value::dict(vec![("status".into(), Value::Str("completed".into()))]);
        assert_eq!(dict.display(), "{'status': 'completed'}");
    }

    #[test]
    fn test_numeric_equality_coerces() {
        assert!(Value::Int(2).py_eq(&Value::Float(2.0)));
        assert!(!Value::Int(2).py_eq(&Value::Str("2".into())));
    }

    #[test]
    fn test_json_roundtrip() {
        let dict = Value::dict(vec![
            ("status".into(), Value::Str("completed".into())),
            ("count".into(), Value::Int(3)),
        ]);
        let json = dict.to_json();
        assert_eq!(json["status"], "completed");
        let back = Value::from_json(&json);
        assert!(back.py_eq(&dict));
    }

    #[test]
    fn test_lists_share_mutation() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = a.clone();
        if let Value::List(items) = &b {
            items.lock().push(Value::Int(2));
        }
        assert_eq!(a.display(), "[1, 2]");
    }
}
