//! Selector-resource handler
//!
//! GET-only. A caller-supplied function produces a symbolic criterion:
//! field-name keys or dollar-prefixed operators, with nested maps and
//! sequences. Translation lowers field keys, maps the base descriptor
//! fields to their storage keys, passes operators through, and re-encodes
//! values through the stored-value codec.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::codec::untyped_value_to_bson;
use crate::context::Context;
use crate::engine::{Engine, SelectorResource};
use crate::handler::{Handler, Outcome, Req};
use crate::iter::RecordIter;
use crate::types::Result;
use crate::value::{Shape, Value};

/// One element of a symbolic criterion.
#[derive(Debug, Clone)]
pub enum SelVal {
    Value(Value),
    Map(BTreeMap<String, SelVal>),
    List(Vec<SelVal>),
}

impl From<Value> for SelVal {
    fn from(v: Value) -> Self {
        SelVal::Value(v)
    }
}

/// Symbolic criterion returned by a selector function.
pub type Selector = BTreeMap<String, SelVal>;

pub type SelectorFn =
    Arc<dyn Fn(&Req, &mut Context) -> Result<Selector> + Send + Sync>;

/// Translate a symbolic criterion to its storage form. Unknown field
/// names are programmer errors in the selector function.
pub fn translate_selector(shape: &Shape, sel: &Selector) -> Document {
    let mut out = Document::new();
    for (k, v) in sel {
        if k.starts_with('$') {
            out.insert(k.clone(), translate_elem(shape, v));
            continue;
        }
        let key = match k.as_str() {
            "Id" => "_id".to_string(),
            "CT" => "ct".to_string(),
            "MT" => "mt".to_string(),
            _ => {
                let def = shape
                    .field_def(k)
                    .unwrap_or_else(|| panic!("field '{}' not found in {}", k, shape.name));
                def.key()
            }
        };
        out.insert(key, translate_elem(shape, v));
    }
    out
}

fn translate_elem(shape: &Shape, elem: &SelVal) -> Bson {
    match elem {
        SelVal::Value(v) => untyped_value_to_bson(v),
        SelVal::Map(m) => Bson::Document(translate_selector(shape, m)),
        SelVal::List(items) => {
            Bson::Array(items.iter().map(|v| translate_elem(shape, v)).collect())
        }
    }
}

pub struct SelectorHandler {
    sq: SelectorResource,
}

impl SelectorHandler {
    pub fn new(sq: SelectorResource) -> Self {
        SelectorHandler { sq }
    }
}

#[async_trait]
impl Handler for SelectorHandler {
    fn capabilities(&self) -> crate::engine::Allow {
        crate::engine::Allow::GET
    }

    async fn get(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        let sel = (self.sq.selector)(req, ctx)?;
        let shape = engine.shape(&self.sq.type_name).clone();
        let criterion = translate_selector(&shape, &sel);
        let sort_keys = engine.fields_to_keys(&shape, &self.sq.sort_fields);
        Ok(Outcome::Iter(RecordIter::new(
            shape,
            sort_keys,
            self.sq.count,
            self.sq.limit,
            false,
            req.res_id.clone(),
            criterion,
        )))
    }
}
