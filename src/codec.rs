//! Value codecs
//!
//! Three descriptor-driven conversions, all walking a [`Shape`]:
//!
//! 1. stored document ↔ in-memory record (`doc_to_record` /
//!    `record_to_doc`); references flatten to their identity, locations
//!    store as `[lon, lat]`, null sequences read back empty.
//! 2. in-memory record → transport map (`record_to_map`); identity,
//!    self-URL, shape name and timestamps inject under `id`, `self`,
//!    `type`, `ct`, `mt`.
//! 3. transport map → in-memory record (`map_to_record`); strict
//!    type-checking with aggregated per-field verifier failures.
//!
//! Plus the patch updater (`map_to_updater` / `updater_to_doc`).
//!
//! Mismatches between a record and its declared shape are programmer
//! errors and panic; mismatches in transport input are client faults and
//! return BadRequest.

use std::collections::BTreeMap;

use bson::{doc, Bson, Document};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use url::Url;

use crate::types::{type_error, Error, ErrorKind, Result};
use crate::value::{FieldKind, Geo, Record, RecordRef, Shape, Value};

/// JSON type name for `want type 'T' but 'U'` messages.
fn json_type_name(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(n) => {
            if n.is_f64() {
                "float64"
            } else {
                "int"
            }
        }
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ---------------------------------------------------------------------------
// stored document ↔ record
// ---------------------------------------------------------------------------

/// Encode a typed value to its stored form. The value must match the
/// declared kind; a mismatch is a programmer error.
pub fn value_to_bson(kind: &FieldKind, value: &Value) -> Bson {
    match (kind.base(), value) {
        (FieldKind::Bool, Value::Bool(b)) => Bson::Boolean(*b),
        (FieldKind::Int, Value::Int(i)) => Bson::Int64(*i),
        (FieldKind::Float, Value::Float(f)) => Bson::Double(*f),
        (FieldKind::String, Value::Str(s)) => Bson::String(s.clone()),
        (FieldKind::Geo, Value::Geo(g)) => {
            Bson::Array(vec![Bson::Double(g.lon), Bson::Double(g.lat)])
        }
        (FieldKind::Time, Value::Time(t)) => Bson::DateTime(bson::DateTime::from_chrono(*t)),
        (FieldKind::Url, Value::Url(u)) => Bson::String(u.clone()),
        (FieldKind::Ref(_), Value::Ref(r)) => Bson::ObjectId(r.id),
        (FieldKind::List(inner), Value::List(items)) => {
            Bson::Array(items.iter().map(|v| value_to_bson(inner, v)).collect())
        }
        (k, v) => panic!("want type '{}', got '{}'", k.type_name(), v.kind_name()),
    }
}

/// Encode an already-typed value without a declared kind, used for
/// selector criteria and context-bag values.
pub fn untyped_value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => Bson::Int64(*i),
        Value::Float(f) => Bson::Double(*f),
        Value::Str(s) => Bson::String(s.clone()),
        Value::Geo(g) => Bson::Array(vec![Bson::Double(g.lon), Bson::Double(g.lat)]),
        Value::Time(t) => Bson::DateTime(bson::DateTime::from_chrono(*t)),
        Value::Url(u) => Bson::String(u.clone()),
        Value::Ref(r) => Bson::ObjectId(r.id),
        Value::List(items) => Bson::Array(items.iter().map(untyped_value_to_bson).collect()),
    }
}

/// Decode a stored element into a typed value. Stored data that does not
/// fit the shape is an IO/programmer failure.
pub fn bson_to_value(kind: &FieldKind, elem: &Bson) -> Value {
    match (kind.base(), elem) {
        (FieldKind::Bool, Bson::Boolean(b)) => Value::Bool(*b),
        (FieldKind::Int, Bson::Int32(i)) => Value::Int(*i as i64),
        (FieldKind::Int, Bson::Int64(i)) => Value::Int(*i),
        (FieldKind::Float, Bson::Double(f)) => Value::Float(*f),
        (FieldKind::Float, Bson::Int32(i)) => Value::Float(*i as f64),
        (FieldKind::Float, Bson::Int64(i)) => Value::Float(*i as f64),
        (FieldKind::String, Bson::String(s)) => Value::Str(s.clone()),
        (FieldKind::Geo, Bson::Array(a)) if a.len() == 2 => Value::Geo(Geo {
            lon: bson_f64(&a[0]),
            lat: bson_f64(&a[1]),
        }),
        (FieldKind::Time, Bson::DateTime(t)) => Value::Time(t.to_chrono()),
        (FieldKind::Url, Bson::String(s)) => Value::Url(s.clone()),
        (FieldKind::Ref(shape), Bson::ObjectId(id)) => {
            Value::Ref(RecordRef { shape: shape.clone(), id: *id })
        }
        (FieldKind::List(inner), Bson::Array(items)) => {
            Value::List(items.iter().map(|v| bson_to_value(inner, v)).collect())
        }
        (k, v) => panic!("stored value {:?} does not fit type '{}'", v, k.type_name()),
    }
}

fn bson_f64(b: &Bson) -> f64 {
    match b {
        Bson::Double(f) => *f,
        Bson::Int32(i) => *i as f64,
        Bson::Int64(i) => *i as f64,
        other => panic!("stored value {:?} is not numeric", other),
    }
}

/// Encode a loaded record to its stored document.
pub fn record_to_doc(shape: &Shape, record: &Record) -> Document {
    let mut out = Document::new();
    if shape.has_base {
        let base = &record.base;
        if !base.loaded {
            panic!("record not loaded");
        }
        if let Some(id) = base.id {
            out.insert("_id", id);
            let mt = base.mt.expect("modify time not set");
            let ct = base.ct.expect("create time not set");
            out.insert("mt", bson::DateTime::from_chrono(mt));
            out.insert("ct", bson::DateTime::from_chrono(ct));
        }
    }
    for def in &shape.fields {
        let key = def.key();
        match record.get(&def.name) {
            Some(v) => {
                out.insert(key, value_to_bson(&def.kind, v));
            }
            None if def.kind.is_optional() => {}
            None if matches!(def.kind.base(), FieldKind::List(_)) => {
                out.insert(key, Bson::Array(Vec::new()));
            }
            None => panic!("'{}.{}' not set", shape.name, def.name),
        }
    }
    out
}

/// Decode a stored document into a loaded record.
pub fn doc_to_record(shape: &Shape, doc: &Document) -> Record {
    let mut rec = Record::new(&shape.name);
    if shape.has_base {
        let id = match doc.get("_id") {
            Some(Bson::ObjectId(id)) => *id,
            _ => panic!("key '_id' is nil"),
        };
        let ct = match doc.get("ct") {
            Some(Bson::DateTime(t)) => t.to_chrono(),
            _ => panic!("key 'ct' is nil"),
        };
        let mt = match doc.get("mt") {
            Some(Bson::DateTime(t)) => t.to_chrono(),
            _ => panic!("key 'mt' is nil"),
        };
        rec.base.id = Some(id);
        rec.base.ct = Some(ct);
        rec.base.mt = Some(mt);
    }
    for def in &shape.fields {
        let key = def.key();
        let elem = doc.get(&key).filter(|b| !matches!(b, Bson::Null));
        match elem {
            Some(b) => rec.set(def.name.clone(), bson_to_value(&def.kind, b)),
            None if def.kind.is_optional() => {}
            None if matches!(def.kind.base(), FieldKind::List(_)) => {
                rec.set(def.name.clone(), Value::List(Vec::new()));
            }
            None => panic!("'{}.{}' is nil", shape.name, def.name),
        }
    }
    rec.base.loaded = true;
    rec
}

// ---------------------------------------------------------------------------
// record → transport map
// ---------------------------------------------------------------------------

/// Render a URL value against the base: host-relative values become
/// absolute on the way out.
fn url_to_json(u: &str, base: &Url) -> JsonValue {
    if u.starts_with('/') {
        match base.join(u) {
            Ok(abs) => JsonValue::String(abs.to_string()),
            Err(_) => JsonValue::String(u.to_string()),
        }
    } else {
        JsonValue::String(u.to_string())
    }
}

pub fn value_to_json(value: &Value, base: &Url) -> JsonValue {
    match value {
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => JsonValue::from(*i),
        Value::Float(f) => JsonValue::from(*f),
        Value::Str(s) => JsonValue::String(s.clone()),
        Value::Geo(g) => serde_json::json!({ "lon": g.lon, "lat": g.lat }),
        Value::Time(t) => JsonValue::String(format_time(t)),
        Value::Url(u) => url_to_json(u, base),
        Value::Ref(r) => serde_json::json!({
            "id": r.id.to_hex(),
            "type": r.shape.to_lowercase(),
            "href": r.self_id().url_with_base(base).to_string(),
        }),
        Value::List(items) => {
            JsonValue::Array(items.iter().map(|v| value_to_json(v, base)).collect())
        }
    }
}

/// Render a loaded record as its transport map.
pub fn record_to_map(shape: &Shape, record: &Record, base: &Url) -> JsonMap<String, JsonValue> {
    let mut out = JsonMap::new();
    if shape.has_base {
        let b = &record.base;
        if !b.loaded {
            panic!("record not loaded");
        }
        if let Some(id) = b.id {
            let mt = b.mt.expect("modify time not set");
            let ct = b.ct.expect("create time not set");
            out.insert("id".to_string(), JsonValue::String(id.to_hex()));
            out.insert(
                "self".to_string(),
                JsonValue::String(record.self_id().url_with_base(base).to_string()),
            );
            out.insert(
                "type".to_string(),
                JsonValue::String(b.type_name.to_lowercase()),
            );
            out.insert("mt".to_string(), JsonValue::String(format_time(&mt)));
            out.insert("ct".to_string(), JsonValue::String(format_time(&ct)));
        }
    }
    for def in &shape.fields {
        let key = def.key();
        match record.get(&def.name) {
            Some(v) => {
                out.insert(key, value_to_json(v, base));
            }
            None if def.kind.is_optional() => {}
            None if matches!(def.kind.base(), FieldKind::List(_)) => {
                out.insert(key, JsonValue::Array(Vec::new()));
            }
            None => panic!("'{}.{}' not set", shape.name, def.name),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// transport map → record
// ---------------------------------------------------------------------------

fn json_to_int(elem: &JsonValue, key: &str) -> Result<i64> {
    match elem {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 {
                    Ok(f as i64)
                } else {
                    Err(type_error(key, "int", "float64"))
                }
            } else {
                Err(type_error(key, "int", "float64"))
            }
        }
        other => Err(type_error(key, "int", json_type_name(other))),
    }
}

fn json_to_float(elem: &JsonValue, key: &str) -> Result<f64> {
    match elem {
        JsonValue::Number(n) => n
            .as_f64()
            .ok_or_else(|| type_error(key, "float64", "int")),
        other => Err(type_error(key, "float64", json_type_name(other))),
    }
}

fn json_to_url(elem: &JsonValue, key: &str, base: &Url) -> Result<String> {
    let s = match elem {
        JsonValue::String(s) => s,
        other => return Err(type_error(key, "url", json_type_name(other))),
    };
    if s.starts_with('/') {
        return Ok(s.clone());
    }
    let parsed = Url::parse(s).map_err(|e| {
        Error::with_cause(ErrorKind::BadRequest, format!("field '{}' parse error", key), e)
    })?;
    // URLs on the serving host reduce to host-relative form.
    if parsed.scheme() == base.scheme()
        && parsed.host_str() == base.host_str()
        && parsed.port() == base.port()
    {
        let mut rel = parsed.path().to_string();
        if let Some(q) = parsed.query() {
            rel.push('?');
            rel.push_str(q);
        }
        Ok(rel)
    } else {
        Ok(s.clone())
    }
}

fn json_to_ref(elem: &JsonValue, shape: &str, key: &str) -> Result<RecordRef> {
    let msg = format!("field '{}' want {{id: objectId}}", key);
    let obj = elem.as_object().ok_or_else(|| Error::bad_request(msg.clone()))?;
    let id_hex = obj
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::bad_request(msg))?;
    let id = bson::oid::ObjectId::parse_str(id_hex).map_err(|e| {
        Error::with_cause(
            ErrorKind::BadRequest,
            format!("field '{}'.id parse error", key),
            e,
        )
    })?;
    Ok(RecordRef { shape: shape.to_string(), id })
}

fn json_to_geo(elem: &JsonValue, key: &str) -> Result<Geo> {
    let msg = format!("field '{}' want {{lat:float, lon:float}}", key);
    let obj = elem.as_object().ok_or_else(|| Error::bad_request(msg.clone()))?;
    let lon = obj.get("lon").and_then(|v| v.as_f64());
    let lat = obj.get("lat").and_then(|v| v.as_f64());
    match (lon, lat) {
        (Some(lon), Some(lat)) => Ok(Geo { lon, lat }),
        _ => Err(Error::bad_request(msg)),
    }
}

fn json_to_time(elem: &JsonValue, key: &str) -> Result<DateTime<Utc>> {
    let s = match elem {
        JsonValue::String(s) => s,
        other => return Err(type_error(key, "time", json_type_name(other))),
    };
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::with_cause(ErrorKind::BadRequest, format!("field '{}'", key), e))
}

/// Decode one transport element into a typed value.
pub fn json_to_value(kind: &FieldKind, elem: &JsonValue, key: &str, base: &Url) -> Result<Value> {
    match kind.base() {
        FieldKind::Bool => match elem {
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            other => Err(type_error(key, "bool", json_type_name(other))),
        },
        FieldKind::Int => json_to_int(elem, key).map(Value::Int),
        FieldKind::Float => json_to_float(elem, key).map(Value::Float),
        FieldKind::String => match elem {
            JsonValue::String(s) => Ok(Value::Str(s.clone())),
            other => Err(type_error(key, "string", json_type_name(other))),
        },
        FieldKind::Geo => json_to_geo(elem, key).map(Value::Geo),
        FieldKind::Time => json_to_time(elem, key).map(Value::Time),
        FieldKind::Url => json_to_url(elem, key, base).map(Value::Url),
        FieldKind::Ref(shape) => json_to_ref(elem, shape, key).map(Value::Ref),
        FieldKind::List(inner) => {
            let arr = match elem {
                JsonValue::Array(a) => a,
                other => {
                    return Err(type_error(key, &kind.type_name(), json_type_name(other)))
                }
            };
            let mut items = Vec::with_capacity(arr.len());
            for (i, item) in arr.iter().enumerate() {
                let ki = format!("{}[{}]", key, i);
                items.push(json_to_value(inner, item, &ki, base)?);
            }
            Ok(Value::List(items))
        }
        FieldKind::Opt(_) => unreachable!("base() strips optionality"),
    }
}

fn map_to_base(map: &JsonMap<String, JsonValue>, rec: &mut Record) -> Result<()> {
    let id_val = match map.get("id") {
        Some(v) => v,
        None => return Ok(()),
    };
    let id_hex = id_val
        .as_str()
        .ok_or_else(|| type_error("id", "string", json_type_name(id_val)))?;
    let id = bson::oid::ObjectId::parse_str(id_hex).map_err(|e| {
        Error::with_cause(ErrorKind::BadRequest, "field 'id' parse error", e)
    })?;
    let ct = map
        .get("ct")
        .ok_or_else(|| Error::bad_request("field 'ct' not set"))?;
    let mt = map
        .get("mt")
        .ok_or_else(|| Error::bad_request("field 'mt' not set"))?;
    rec.base.id = Some(id);
    rec.base.ct = Some(json_to_time(ct, "ct")?);
    rec.base.mt = Some(json_to_time(mt, "mt")?);
    Ok(())
}

/// Decode a transport map into a record of the given shape. Conversion
/// errors fail fast; verifier rejections aggregate into one BadRequest
/// with a field→message map.
pub fn map_to_record(
    shape: &Shape,
    map: &JsonMap<String, JsonValue>,
    base: &Url,
) -> Result<Record> {
    let mut rec = Record::new(&shape.name);
    if shape.has_base {
        map_to_base(map, &mut rec)?;
    }
    let mut field_errors: BTreeMap<String, String> = BTreeMap::new();
    for def in &shape.fields {
        let key = def.key();
        let elem = map.get(&key);
        let value = match elem {
            Some(v) => Some(json_to_value(&def.kind, v, &key, base)?),
            None if def.kind.is_optional() => None,
            None if matches!(def.kind.base(), FieldKind::List(_)) => {
                Some(Value::List(Vec::new()))
            }
            None => return Err(Error::bad_request(format!("field '{}' not set", key))),
        };
        if let Some(v) = value {
            if let Some(verifier) = &def.verifier {
                if let Err(reason) = verifier(&v) {
                    field_errors.insert(def.name.clone(), reason);
                }
            }
            rec.set(def.name.clone(), v);
        }
    }
    if shape.has_base {
        rec.base.loaded = true;
    }
    if !field_errors.is_empty() {
        return Err(Error::fields(field_errors));
    }
    Ok(rec)
}

// ---------------------------------------------------------------------------
// patch updater
// ---------------------------------------------------------------------------

/// Typed patch: `set` assignments plus `add` accumulations (set-union on
/// sequences, increment on numbers).
#[derive(Debug, Clone, Default)]
pub struct Updater {
    pub set: Vec<(String, Value)>,
    pub add: Vec<(String, Value)>,
}

/// Decode the transport patch form: a map with only `set` and `add`
/// operations, each an object of field→value.
pub fn map_to_updater(
    shape: &Shape,
    map: &JsonMap<String, JsonValue>,
    base: &Url,
) -> Result<Updater> {
    let mut updater = Updater::default();
    for (op, v) in map {
        let entries = v.as_object().ok_or_else(|| {
            Error::bad_request(format!(
                "updater op '{}' want an object, got '{}'",
                op,
                json_type_name(v)
            ))
        })?;
        match op.as_str() {
            "set" => {
                for (k, elem) in entries {
                    let def = shape.field_by_key(k).ok_or_else(|| {
                        Error::bad_request(format!("field '{}' not in '{}'", k, shape.name))
                    })?;
                    let value = json_to_value(&def.kind, elem, k, base)?;
                    updater.set.push((def.name.clone(), value));
                }
            }
            "add" => {
                for (k, elem) in entries {
                    let def = shape.field_by_key(k).ok_or_else(|| {
                        Error::bad_request(format!("field '{}' not in '{}'", k, shape.name))
                    })?;
                    let value = match def.kind.base() {
                        FieldKind::List(inner) => json_to_value(inner, elem, k, base)?,
                        _ => json_to_value(&def.kind, elem, k, base)?,
                    };
                    updater.add.push((def.name.clone(), value));
                }
            }
            other => {
                return Err(Error::bad_request(format!("unknown updater op '{}'", other)))
            }
        }
    }
    Ok(updater)
}

fn acc(doc: &mut Document, op: &str, key: String, value: Bson) {
    if !doc.contains_key(op) {
        doc.insert(op, Document::new());
    }
    doc.get_document_mut(op)
        .expect("updater op sub-document")
        .insert(key, value);
}

/// Translate a typed updater to the storage update document. Fields
/// outside the declared patch list are programmer errors.
pub fn updater_to_doc(shape: &Shape, updater: &Updater, patch_fields: &[String]) -> Document {
    let mut out = Document::new();
    for (name, value) in &updater.set {
        if !patch_fields.iter().any(|f| f == name) {
            panic!("field '{}' not allow", name);
        }
        let def = shape
            .field_def(name)
            .unwrap_or_else(|| panic!("field '{}' not in '{}'", name, shape.name));
        acc(&mut out, "$set", def.key(), value_to_bson(&def.kind, value));
    }
    for (name, value) in &updater.add {
        if !patch_fields.iter().any(|f| f == name) {
            panic!("field '{}' not allow", name);
        }
        let def = shape
            .field_def(name)
            .unwrap_or_else(|| panic!("field '{}' not in '{}'", name, shape.name));
        match def.kind.base() {
            FieldKind::List(inner) => {
                acc(&mut out, "$addToSet", def.key(), value_to_bson(inner, value))
            }
            _ => acc(&mut out, "$inc", def.key(), value_to_bson(&def.kind, value)),
        }
    }
    acc(
        &mut out,
        "$set",
        "mt".to_string(),
        Bson::DateTime(bson::DateTime::from_chrono(Utc::now())),
    );
    out
}

/// `$set` update document from literal field→value entries, used for
/// delete-as-update semantics. No patch-list check applies.
pub fn set_update_doc(shape: &Shape, entries: &BTreeMap<String, Value>) -> Document {
    let mut set = Document::new();
    for (name, value) in entries {
        let def = shape
            .field_def(name)
            .unwrap_or_else(|| panic!("field '{}' not in '{}'", name, shape.name));
        set.insert(def.key(), value_to_bson(&def.kind, value));
    }
    doc! { "$set": set }
}
