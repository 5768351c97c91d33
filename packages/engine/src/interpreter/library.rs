// packages/engine/src/interpreter/library.rs
//! Native module definitions for the in-process runtime
//!
//! A [`Library`] is immutable and shared by every instance, the way native
//! code is shared by every copy of an embedded runtime. The mutable part of a
//! module, its attribute namespace, is copied into each instance's heap when
//! the instance is loaded.
//!
//! Classes are modules too: an [`Value::Object`] of class `demo.Scaler` is
//! called through the function `__call__` of module `demo.Scaler`.

use crate::interpreter::{HostValue, NativeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Name of the built-in runtime module
pub const RUNTIME_MODULE: &str = "runtime";

/// Namespace holding version information, including the instance ordinal
pub const VERSION_MODULE: &str = "runtime.version";

/// Attribute of [`VERSION_MODULE`] carrying the instance ordinal
pub const INTERP_ATTR: &str = "interp";

/// Environment-native value of the in-process runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    /// Native function, by qualified name
    Function(String),
    /// Instance of a class, by qualified class name
    Object { class: String, state: Box<Value> },
    /// Reference to a module namespace of the owning instance
    Module(String),
    /// Package importer registered in the owning instance
    Importer(usize),
}

impl Value {
    /// Short type name used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Object { .. } => "object",
            Value::Module(_) => "module",
            Value::Importer(_) => "importer",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Import a host value
    pub fn from_host(value: HostValue) -> Self {
        match value {
            HostValue::None => Value::None,
            HostValue::Bool(v) => Value::Bool(v),
            HostValue::Int(v) => Value::Int(v),
            HostValue::Double(v) => Value::Float(v),
            HostValue::Str(v) => Value::Str(v),
            HostValue::Bytes(v) => Value::Bytes(v),
            HostValue::List(items) => Value::List(items.into_iter().map(Value::from_host).collect()),
            HostValue::Dict(entries) => Value::Dict(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_host(v)))
                    .collect(),
            ),
        }
    }

    /// Export to a host value; only plain data converts
    pub fn to_host(&self) -> NativeResult<HostValue> {
        Ok(match self {
            Value::None => HostValue::None,
            Value::Bool(v) => HostValue::Bool(*v),
            Value::Int(v) => HostValue::Int(*v),
            Value::Float(v) => HostValue::Double(*v),
            Value::Str(v) => HostValue::Str(v.clone()),
            Value::Bytes(v) => HostValue::Bytes(v.clone()),
            Value::List(items) => HostValue::List(
                items
                    .iter()
                    .map(Value::to_host)
                    .collect::<NativeResult<Vec<_>>>()?,
            ),
            Value::Dict(entries) => HostValue::Dict(
                entries
                    .iter()
                    .map(|(k, v)| -> NativeResult<(String, HostValue)> {
                        Ok((k.clone(), v.to_host()?))
                    })
                    .collect::<NativeResult<BTreeMap<_, _>>>()?,
            ),
            other => {
                return Err(format!("cannot convert {} to a host value", other.kind()).into());
            }
        })
    }

    /// Fails if the value (or anything inside it) is bound to one instance
    pub fn check_picklable(&self) -> NativeResult<()> {
        match self {
            Value::Module(name) => Err(format!("cannot pickle module '{name}'").into()),
            Value::Importer(_) => Err("cannot pickle a package importer".into()),
            Value::List(items) => items.iter().try_for_each(Value::check_picklable),
            Value::Dict(entries) => entries.values().try_for_each(Value::check_picklable),
            Value::Object { state, .. } => state.check_picklable(),
            _ => Ok(()),
        }
    }
}

/// Arguments of a native call
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    /// Bound object when called as a method or via `__call__`
    pub receiver: Option<Value>,
    pub positional: Vec<Value>,
    pub keyword: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Positional argument `index`
    pub fn arg(&self, index: usize) -> NativeResult<&Value> {
        self.positional
            .get(index)
            .ok_or_else(|| format!("missing positional argument {index}").into())
    }

    /// Positional argument `index` as an integer
    pub fn int(&self, index: usize) -> NativeResult<i64> {
        let value = self.arg(index)?;
        value
            .as_int()
            .ok_or_else(|| format!("argument {index} must be int, got {}", value.kind()).into())
    }

    /// Positional argument `index` as a string
    pub fn str(&self, index: usize) -> NativeResult<&str> {
        let value = self.arg(index)?;
        value
            .as_str()
            .ok_or_else(|| format!("argument {index} must be str, got {}", value.kind()).into())
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// State of the receiver object
    pub fn receiver_state(&self) -> NativeResult<&Value> {
        match &self.receiver {
            Some(Value::Object { state, .. }) => Ok(state),
            Some(other) => Err(format!("receiver must be an object, got {}", other.kind()).into()),
            None => Err("method called without a receiver".into()),
        }
    }
}

/// Module namespaces of one instance
pub type Namespaces = BTreeMap<String, BTreeMap<String, Value>>;

/// View of the calling instance handed to native functions
pub struct Scope<'a> {
    ordinal: usize,
    namespaces: &'a mut Namespaces,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(ordinal: usize, namespaces: &'a mut Namespaces) -> Self {
        Self {
            ordinal,
            namespaces,
        }
    }

    /// Ordinal of the instance running the call
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn get_attr(&self, module: &str, name: &str) -> Option<&Value> {
        self.namespaces.get(module).and_then(|attrs| attrs.get(name))
    }

    pub fn set_attr(&mut self, module: &str, name: &str, value: Value) -> NativeResult<()> {
        let attrs = self
            .namespaces
            .get_mut(module)
            .ok_or_else(|| format!("no module named '{module}'"))?;
        attrs.insert(name.to_string(), value);
        Ok(())
    }
}

/// A native function
pub type NativeFn = Arc<dyn Fn(&mut Scope<'_>, CallArgs) -> NativeResult<Value> + Send + Sync>;

/// Definition of one native module (or class)
#[derive(Clone)]
pub struct ModuleDef {
    name: String,
    attrs: BTreeMap<String, Value>,
    functions: BTreeMap<String, NativeFn>,
}

impl ModuleDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
            functions: BTreeMap::new(),
        }
    }

    /// Add a data attribute
    pub fn attr(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    /// Add a function; it also becomes a `Function` attribute of the module
    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>, CallArgs) -> NativeResult<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let qualified = format!("{}.{}", self.name, name);
        self.attrs.insert(name.clone(), Value::Function(qualified));
        self.functions.insert(name, Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ModuleDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDef")
            .field("name", &self.name)
            .field("attrs", &self.attrs.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Immutable set of module definitions shared by all instances
#[derive(Debug, Clone)]
pub struct Library {
    modules: Arc<BTreeMap<String, ModuleDef>>,
}

impl Library {
    /// Library holding only the built-in `runtime` modules
    pub fn new() -> Self {
        let mut modules = BTreeMap::new();
        for def in builtin_modules() {
            modules.insert(def.name.clone(), def);
        }
        Self {
            modules: Arc::new(modules),
        }
    }

    /// Add (or replace) a module definition
    pub fn with_module(mut self, def: ModuleDef) -> Self {
        Arc::make_mut(&mut self.modules).insert(def.name.clone(), def);
        self
    }

    /// Resolve a qualified function name such as `demo.Scaler.__call__`
    pub fn resolve(&self, qualified: &str) -> Option<&NativeFn> {
        let (module, name) = qualified.rsplit_once('.')?;
        self.modules.get(module)?.functions.get(name)
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Fresh, private copy of every module namespace
    pub fn fresh_namespaces(&self) -> Namespaces {
        self.modules
            .iter()
            .map(|(name, def)| (name.clone(), def.attrs.clone()))
            .collect()
    }
}

impl Default for Library {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_modules() -> Vec<ModuleDef> {
    vec![
        ModuleDef::new(RUNTIME_MODULE)
            .attr("version", Value::Module(VERSION_MODULE.to_string())),
        ModuleDef::new(VERSION_MODULE)
            .attr(INTERP_ATTR, Value::None)
            .attr("release", Value::Str(crate::VERSION.to_string())),
    ]
}
