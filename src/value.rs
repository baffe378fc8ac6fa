//! The dynamic value/type pair columns are built from.
//!
//! Mirrors a common client-library split: [`ElementType`] names a column's
//! declared type, [`Value`] carries one cell's payload. Kept deliberately
//! small — the archive's element types are the nine named by the data model,
//! not a full database type lattice.

use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum ElementType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    Structured,
    Array(Box<ElementType>),
}

impl ElementType {
    /// The zero/null marker used to fill absent cells in a super-domain
    /// merge (§4.4 step 3).
    pub fn default_value(&self) -> Value {
        match self {
            ElementType::Bool => Value::Bool(false),
            ElementType::Int32 => Value::Int32(0),
            ElementType::Int64 => Value::Int64(0),
            ElementType::Float32 => Value::Float32(0.0),
            ElementType::Float64 => Value::Float64(0.0),
            ElementType::String => Value::String(String::new()),
            ElementType::Bytes => Value::Bytes(Vec::new()),
            ElementType::Structured => Value::Structured(IndexMap::new()),
            ElementType::Array(_) => Value::Array(Vec::new()),
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementType::Bool => write!(f, "bool"),
            ElementType::Int32 => write!(f, "int32"),
            ElementType::Int64 => write!(f, "int64"),
            ElementType::Float32 => write!(f, "float32"),
            ElementType::Float64 => write!(f, "float64"),
            ElementType::String => write!(f, "string"),
            ElementType::Bytes => write!(f, "bytes"),
            ElementType::Structured => write!(f, "structured"),
            ElementType::Array(inner) => write!(f, "array<{inner}>"),
        }
    }
}

/// A dynamically-typed cell value. Every variant is assignable to exactly
/// one [`ElementType`] via [`Value::element_type`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Structured(IndexMap<String, Value>),
    Array(Vec<Value>),
}

impl Value {
    /// Infers the declared type of this value. For an empty array this
    /// cannot be known precisely; callers should prefer the column's
    /// declared `ElementType` when one is available.
    pub fn element_type(&self) -> ElementType {
        match self {
            Value::Bool(_) => ElementType::Bool,
            Value::Int32(_) => ElementType::Int32,
            Value::Int64(_) => ElementType::Int64,
            Value::Float32(_) => ElementType::Float32,
            Value::Float64(_) => ElementType::Float64,
            Value::String(_) => ElementType::String,
            Value::Bytes(_) => ElementType::Bytes,
            Value::Structured(_) => ElementType::Structured,
            Value::Array(items) => ElementType::Array(Box::new(
                items
                    .first()
                    .map(Value::element_type)
                    .unwrap_or(ElementType::String),
            )),
        }
    }

    pub fn is_assignable_to(&self, element_type: &ElementType) -> bool {
        &self.element_type() == element_type
    }
}
