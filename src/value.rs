//! Record data model
//!
//! Shapes are data, not Rust types: a [`Shape`] describes a registered
//! record kind field by field, and a [`Record`] is a dynamic instance of
//! one. All marshalling is descriptor-driven (no runtime reflection);
//! the codecs in [`crate::codec`] walk the shape.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};

use crate::resid::ResId;
use crate::util::type_name_to_resource_name;

/// Point location, longitude/latitude. Stored as `[lon, lat]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geo {
    pub lon: f64,
    pub lat: f64,
}

/// Lightweight handle to a stored record: shape name plus identity.
/// Loading the referenced record is explicit (`Engine::load`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub shape: String,
    pub id: ObjectId,
}

/// A field value in its in-memory representation.
///
/// URLs are kept in serialized form: host-relative when the URL belongs
/// to the serving host, absolute otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Geo(Geo),
    Time(DateTime<Utc>),
    Url(String),
    Ref(RecordRef),
    List(Vec<Value>),
}

impl Value {
    /// Type name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Geo(_) => "geo",
            Value::Time(_) => "time",
            Value::Url(_) => "url",
            Value::Ref(_) => "ref",
            Value::List(_) => "list",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_value(&self) -> Option<&RecordRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }
}

/// Declared kind of a shape field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    String,
    Geo,
    Time,
    Url,
    /// Nested record, by shape name. Stored as the identity only.
    Ref(String),
    /// Ordered sequence.
    List(Box<FieldKind>),
    /// Nullable variant; absent when null.
    Opt(Box<FieldKind>),
}

impl FieldKind {
    /// Kind with optionality stripped.
    pub fn base(&self) -> &FieldKind {
        match self {
            FieldKind::Opt(inner) => inner.base(),
            other => other,
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, FieldKind::Opt(_))
    }

    /// Type name used in `want type '<T>'` error messages.
    pub fn type_name(&self) -> String {
        match self {
            FieldKind::Bool => "bool".to_string(),
            FieldKind::Int => "int".to_string(),
            FieldKind::Float => "float64".to_string(),
            FieldKind::String => "string".to_string(),
            FieldKind::Geo => "geo".to_string(),
            FieldKind::Time => "time".to_string(),
            FieldKind::Url => "url".to_string(),
            FieldKind::Ref(name) => name.clone(),
            FieldKind::List(inner) => format!("[{}]", inner.type_name()),
            FieldKind::Opt(inner) => inner.type_name(),
        }
    }
}

/// Per-field validation closure; returns a reason on rejection.
pub type Verifier = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// One declared field of a shape.
#[derive(Clone)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub verifier: Option<Verifier>,
}

impl FieldDef {
    /// Storage and transport key: the declared name, lowered.
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("verified", &self.verifier.is_some())
            .finish()
    }
}

/// Registered record shape.
#[derive(Debug, Clone)]
pub struct Shape {
    pub name: String,
    /// Whether records of this shape carry a Base descriptor (identity,
    /// timestamps). The synthetic `binary` shape does not.
    pub has_base: bool,
    pub fields: Vec<FieldDef>,
}

impl Shape {
    pub fn new(name: impl Into<String>) -> Self {
        Shape { name: name.into(), has_base: true, fields: Vec::new() }
    }

    pub fn without_base(mut self) -> Self {
        self.has_base = false;
        self
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef { name: name.into(), kind, verifier: None });
        self
    }

    pub fn verified_field(
        mut self,
        name: impl Into<String>,
        kind: FieldKind,
        verifier: Verifier,
    ) -> Self {
        self.fields.push(FieldDef { name: name.into(), kind, verifier: Some(verifier) });
        self
    }

    /// Field by declared name.
    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field by lowered transport key.
    pub fn field_by_key(&self, key: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.key() == key)
    }
}

/// Per-record descriptor: identity, timestamps, shape name, load state.
///
/// Invariant: once `loaded` is true and the identity is set, both
/// timestamps are set.
#[derive(Debug, Clone, Default)]
pub struct Base {
    pub type_name: String,
    pub id: Option<ObjectId>,
    pub ct: Option<DateTime<Utc>>,
    pub mt: Option<DateTime<Utc>>,
    pub loaded: bool,
    pub is_new: bool,
}

/// Dynamic record instance of a registered shape.
#[derive(Debug, Clone)]
pub struct Record {
    pub base: Base,
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// New unloaded, empty record of the given shape.
    pub fn new(type_name: impl Into<String>) -> Self {
        Record {
            base: Base { type_name: type_name.into(), ..Base::default() },
            fields: BTreeMap::new(),
        }
    }

    /// Unloaded record carrying only an identity, the in-memory form of
    /// a stored reference.
    pub fn with_id(type_name: impl Into<String>, id: ObjectId) -> Self {
        let mut rec = Record::new(type_name);
        rec.base.id = Some(id);
        rec
    }

    pub fn type_name(&self) -> &str {
        &self.base.type_name
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.base.id
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn unset(&mut self, field: &str) {
        self.fields.remove(field);
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Reference handle for this record. Panics without an identity.
    pub fn to_ref(&self) -> RecordRef {
        RecordRef {
            shape: self.base.type_name.clone(),
            id: self.base.id.expect("record has no id"),
        }
    }

    /// Identifier of this record's auto-defined identity resource.
    pub fn self_id(&self) -> ResId {
        let id = self.base.id.expect("record has no id");
        ResId::new(
            &type_name_to_resource_name(&self.base.type_name),
            vec![id.to_hex()],
        )
    }
}

impl RecordRef {
    /// Identifier of the referenced record's identity resource.
    pub fn self_id(&self) -> ResId {
        ResId::new(&type_name_to_resource_name(&self.shape), vec![self.id.to_hex()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_lookup() {
        let shape = Shape::new("SS")
            .field("S1", FieldKind::String)
            .field("I1", FieldKind::Opt(Box::new(FieldKind::Int)));
        assert!(shape.field_def("S1").is_some());
        assert!(shape.field_def("s1").is_none());
        assert_eq!(shape.field_by_key("i1").unwrap().name, "I1");
    }

    #[test]
    fn test_kind_base_strips_optionality() {
        let kind = FieldKind::Opt(Box::new(FieldKind::Int));
        assert_eq!(kind.base(), &FieldKind::Int);
        assert!(kind.is_optional());
        assert_eq!(kind.type_name(), "int");
    }

    #[test]
    fn test_record_self_id() {
        let id = ObjectId::parse_str("513063ef69ca944b1000000a").unwrap();
        let rec = Record::with_id("SS", id);
        assert_eq!(rec.self_id().format(), "/ss/513063ef69ca944b1000000a");
    }

    #[test]
    fn test_list_type_name() {
        let kind = FieldKind::List(Box::new(FieldKind::String));
        assert_eq!(kind.type_name(), "[string]");
    }
}
