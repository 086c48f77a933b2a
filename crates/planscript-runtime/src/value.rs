//! Runtime values
//!
//! The dynamic value model the VM evaluates against: a single sum type
//! over null, bool, integer, string, array, object, function, class and
//! LLM client. Arrays and objects share interior mutability so index and
//! member assignment behave like references; object literals preserve
//! insertion order. LLM clients are a distinct variant so scripts cannot
//! forge one from a plain object.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use planscript_lang::ast::Stmt;
use planscript_llm::LlmConfig;

/// A user-defined function. Closes over globals only; the body is its
/// own copy of the AST.
#[derive(Debug)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

/// A user-defined single-level class.
#[derive(Debug)]
pub struct ClassDef {
    pub name: String,
    pub body: Vec<Stmt>,
}

/// A configured LLM client value. Mock plans are consumed in order; the
/// last one repeats once the queue drains.
pub struct LlmClientValue {
    pub config: LlmConfig,
    pub no_ask: bool,
    mock_queue: RefCell<VecDeque<Json>>,
    last_mock: RefCell<Option<Json>>,
}

impl LlmClientValue {
    pub fn new(config: LlmConfig, mock_plan: Option<Json>, no_ask: bool) -> Self {
        let mock_queue = match mock_plan {
            Some(Json::Array(items)) => items.into(),
            Some(single) => VecDeque::from(vec![single]),
            None => VecDeque::new(),
        };
        Self {
            config,
            no_ask,
            mock_queue: RefCell::new(mock_queue),
            last_mock: RefCell::new(None),
        }
    }

    /// Next mock plan, if this client is mocked.
    pub fn next_mock(&self) -> Option<Json> {
        let mut queue = self.mock_queue.borrow_mut();
        if let Some(next) = queue.pop_front() {
            *self.last_mock.borrow_mut() = Some(next.clone());
            return Some(next);
        }
        self.last_mock.borrow().clone()
    }

    pub fn is_mocked(&self) -> bool {
        !self.mock_queue.borrow().is_empty() || self.last_mock.borrow().is_some()
    }
}

impl fmt::Debug for LlmClientValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClientValue")
            .field("model", &self.config.model)
            .field("no_ask", &self.no_ask)
            .field("mocked", &self.is_mocked())
            .finish()
    }
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<IndexMap<String, Value>>>),
    Function(Rc<FunctionDef>),
    Class(Rc<ClassDef>),
    LlmClient(Rc<LlmClientValue>),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(entries: IndexMap<String, Value>) -> Self {
        Self::Object(Rc::new(RefCell::new(entries)))
    }

    pub fn str(text: impl Into<String>) -> Self {
        Self::Str(text.into())
    }

    /// Truthiness: null, false, 0, "", [] and {} are false.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Str(s) => !s.is_empty(),
            Self::Array(items) => !items.borrow().is_empty(),
            Self::Object(entries) => !entries.borrow().is_empty(),
            Self::Function(_) | Self::Class(_) | Self::LlmClient(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
            Self::Class(_) => "class",
            Self::LlmClient(_) => "llm_client",
        }
    }

    /// Structural equality for data; identity for callables.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Self::Object(a), Self::Object(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map(|w| v.equals(w)).unwrap_or(false))
            }
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Class(a), Self::Class(b)) => Rc::ptr_eq(a, b),
            (Self::LlmClient(a), Self::LlmClient(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// JSON projection. Callables and clients render as opaque markers
    /// and never round-trip back into live values.
    pub fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(n) => Json::from(*n),
            Self::Str(s) => Json::String(s.clone()),
            Self::Array(items) => {
                Json::Array(items.borrow().iter().map(|v| v.to_json()).collect())
            }
            Self::Object(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries.borrow().iter() {
                    map.insert(key.clone(), value.to_json());
                }
                Json::Object(map)
            }
            Self::Function(f) => Json::String(format!("<function {}>", f.name)),
            Self::Class(c) => Json::String(format!("<class {}>", c.name)),
            Self::LlmClient(_) => Json::String("<llm client>".to_string()),
        }
    }

    /// Build a value from JSON data.
    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .unwrap_or_else(|| Self::Str(n.to_string())),
            Json::String(s) => Self::Str(s.clone()),
            Json::Array(items) => Self::array(items.iter().map(Self::from_json).collect()),
            Json::Object(map) => {
                let mut entries = IndexMap::new();
                for (key, value) in map {
                    entries.insert(key.clone(), Self::from_json(value));
                }
                Self::object(entries)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(n) => write!(f, "{}", n),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness_table() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::str("").truthy());
        assert!(!Value::array(vec![]).truthy());
        assert!(!Value::object(IndexMap::new()).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(Value::str("x").truthy());
        assert!(Value::array(vec![Value::Null]).truthy());
    }

    #[test]
    fn test_structural_equality() {
        let a = Value::array(vec![Value::Int(1), Value::str("x")]);
        let b = Value::array(vec![Value::Int(1), Value::str("x")]);
        assert!(a.equals(&b));
        let c = Value::array(vec![Value::Int(2)]);
        assert!(!a.equals(&c));
    }

    #[test]
    fn test_json_round_trip_preserves_order() {
        let json = json!({"zeta": 1, "alpha": 2, "mid": [1, 2, 3]});
        let value = Value::from_json(&json);
        let back = value.to_json();
        let keys: Vec<&String> = back.as_object().expect("object").keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_client_mock_sequence_repeats_last() {
        let client = LlmClientValue::new(
            LlmConfig::default(),
            Some(json!([{"a": 1}, {"a": 2}])),
            false,
        );
        assert_eq!(client.next_mock(), Some(json!({"a": 1})));
        assert_eq!(client.next_mock(), Some(json!({"a": 2})));
        assert_eq!(client.next_mock(), Some(json!({"a": 2})));
    }

    #[test]
    fn test_client_json_projection_is_opaque() {
        let client = Value::LlmClient(Rc::new(LlmClientValue::new(
            LlmConfig::default(),
            None,
            false,
        )));
        assert_eq!(client.to_json(), json!("<llm client>"));
    }

    #[test]
    fn test_shared_mutation_through_clone() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = a.clone();
        if let Value::Array(items) = &a {
            items.borrow_mut().push(Value::Int(2));
        }
        if let Value::Array(items) = &b {
            assert_eq!(items.borrow().len(), 2);
        } else {
            panic!("expected array");
        }
    }
}
