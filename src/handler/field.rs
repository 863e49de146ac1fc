//! Field-resource handler
//!
//! The criterion is a conjunction of path-segment and context-bag
//! bindings against declared record fields. Before a write, the same
//! bindings are mirrored into the request body so the persisted record
//! reflects its identifying attributes.

use async_trait::async_trait;
use bson::{doc, Document};
use chrono::Utc;
use tracing::debug;

use crate::codec;
use crate::context::Context;
use crate::engine::{decode_segment_value, Engine, FieldResource, Method, SegmentKind};
use crate::handler::{Handler, Outcome, Req};
use crate::iter::RecordIter;
use crate::store::is_duplicate_key;
use crate::types::{Error, Result};
use crate::util::parse_param_bool;
use crate::value::{Record, Shape, Value};

pub struct FieldHandler {
    fq: FieldResource,
}

impl FieldHandler {
    pub fn new(fq: FieldResource) -> Self {
        FieldHandler { fq }
    }

    fn check_allow(&self, m: Method) -> Result<()> {
        if self.fq.allow.contains(m) {
            Ok(())
        } else {
            Err(Error::method_not_allowed())
        }
    }

    /// Decode the path segment bound to key field `index`.
    fn key_segment(&self, shape: &Shape, req: &Req, index: usize) -> Result<Value> {
        let field = &self.fq.fields[index];
        let kind = if field == "Id" {
            SegmentKind::Ref(self.fq.type_name.clone())
        } else {
            let def = shape
                .field_def(field)
                .unwrap_or_else(|| panic!("field '{}' not in '{}'", field, shape.name));
            match def.kind.base() {
                crate::value::FieldKind::Int => SegmentKind::Int,
                crate::value::FieldKind::String => SegmentKind::Str,
                crate::value::FieldKind::Bool => SegmentKind::Bool,
                crate::value::FieldKind::Ref(t) => SegmentKind::Ref(t.clone()),
                other => panic!("segment not support type '{}'", other.type_name()),
            }
        };
        let raw = req.res_id.raw_segment(index).ok_or_else(|| {
            Error::bad_request(format!(
                "path need {} segments, got {}",
                self.fq.fields.len() + 1,
                req.res_id.num_segments() + 1
            ))
        })?;
        decode_segment_value(&kind, raw, index)
    }

    /// Criterion bound from path segments and the context bag.
    fn criterion(&self, engine: &Engine, req: &Req, ctx: &Context) -> Result<Document> {
        let shape = engine.shape(&self.fq.type_name).clone();
        let mut out = Document::new();
        for i in 0..self.fq.fields.len() {
            let value = self.key_segment(&shape, req, i)?;
            set_criterion_value(&mut out, &self.fq.fields[i], &value);
        }
        for (field, ctx_key) in &self.fq.context_ref {
            let value = ctx
                .get(ctx_key)
                .ok_or_else(|| {
                    Error::unauthorized(format!("'{}' not in Context", ctx_key))
                })?
                .clone();
            set_criterion_value(&mut out, field, &value);
        }
        Ok(out)
    }

    /// Mirror the criterion bindings into the request body so the
    /// persisted record carries its identifying attributes.
    fn populate(
        &self,
        engine: &Engine,
        record: &mut Record,
        req: &Req,
        ctx: &Context,
    ) -> Result<()> {
        let shape = engine.shape(&self.fq.type_name).clone();
        for i in 0..self.fq.fields.len() {
            let value = self.key_segment(&shape, req, i)?;
            set_record_value(record, &self.fq.fields[i], value);
        }
        for (field, ctx_key) in &self.fq.context_ref {
            let value = ctx
                .get(ctx_key)
                .ok_or_else(|| {
                    Error::unauthorized(format!("'{}' not in Context", ctx_key))
                })?
                .clone();
            set_record_value(record, field, value);
        }
        Ok(())
    }

    fn sort_keys(&self, engine: &Engine, shape: &Shape) -> Vec<String> {
        let fields: Vec<String> = if self.fq.sort_fields.is_empty() {
            if self.fq.pull {
                vec!["Id".to_string()]
            } else {
                vec!["-Id".to_string()]
            }
        } else {
            self.fq.sort_fields.clone()
        };
        engine.fields_to_keys(shape, &fields)
    }

    fn stamp_new(&self, record: &mut Record) {
        let now = Utc::now();
        if record.base.id.is_none() {
            record.base.id = Some(bson::oid::ObjectId::new());
        }
        record.base.ct = Some(now);
        record.base.mt = Some(now);
        record.base.loaded = true;
        record.base.is_new = true;
        record.base.type_name = self.fq.type_name.clone();
    }

    async fn insert(
        &self,
        engine: &Engine,
        record: &Record,
        ctx: &Context,
    ) -> Result<Document> {
        let shape = engine.shape(&self.fq.type_name);
        let doc = codec::record_to_doc(shape, record);
        match ctx.coll(&self.fq.type_name).insert_one(doc.clone()).await {
            Ok(_) => Ok(doc),
            Err(e) if is_duplicate_key(&e) => Err(Error::conflict()),
            Err(e) => panic!("insert '{}' failed: {}", self.fq.type_name, e),
        }
    }
}

fn set_criterion_value(out: &mut Document, field: &str, value: &Value) {
    if field == "Id" {
        let r = value.as_ref_value().expect("identity binding is a reference");
        out.insert("_id", r.id);
    } else {
        out.insert(field.to_lowercase(), codec::untyped_value_to_bson(value));
    }
}

fn set_record_value(record: &mut Record, field: &str, value: Value) {
    if field == "Id" {
        let r = value.as_ref_value().expect("identity binding is a reference");
        record.base.id = Some(r.id);
    } else {
        record.set(field.to_string(), value);
    }
}

#[async_trait]
impl Handler for FieldHandler {
    async fn get(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        self.check_allow(Method::Get)?;
        let criterion = self.criterion(engine, req, ctx)?;
        let shape = engine.shape(&self.fq.type_name).clone();
        if self.fq.unique {
            let found = ctx
                .coll(&self.fq.type_name)
                .find_one(criterion)
                .await
                .unwrap_or_else(|e| panic!("find '{}' failed: {}", self.fq.type_name, e));
            match found {
                Some(doc) => Ok(Outcome::Record(codec::doc_to_record(&shape, &doc))),
                None => Err(Error::not_found()),
            }
        } else {
            let sort_keys = self.sort_keys(engine, &shape);
            let mut iter = RecordIter::new(
                shape,
                sort_keys,
                self.fq.count,
                self.fq.limit,
                self.fq.pull,
                req.res_id.clone(),
                criterion,
            );
            if self.fq.pull && parse_param_bool(&req.res_id.params, "last", false)? {
                iter.seed_last_id(ctx).await;
            }
            Ok(Outcome::Iter(iter))
        }
    }

    async fn post(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        self.check_allow(Method::Post)?;
        if self.fq.unique {
            return Err(Error::method_not_allowed());
        }
        let mut record = req.take_record();
        self.populate(engine, &mut record, req, ctx)?;
        self.stamp_new(&mut record);
        let doc = self.insert(engine, &record, ctx).await?;
        if engine.is_pull(&self.fq.type_name) {
            let mut broadcast = doc;
            broadcast.insert("$type", self.fq.type_name.clone());
            engine.cond.broadcast(&broadcast);
            debug!(type_name = %self.fq.type_name, "pull broadcast");
        }
        Ok(Outcome::Record(record))
    }

    async fn put(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        self.check_allow(Method::Put)?;
        let criterion = self.criterion(engine, req, ctx)?;
        let mut record = req.take_record();
        self.populate(engine, &mut record, req, ctx)?;
        let old = ctx
            .coll(&self.fq.type_name)
            .find_one(criterion)
            .await
            .unwrap_or_else(|e| panic!("find '{}' failed: {}", self.fq.type_name, e));
        match old {
            None => {
                self.stamp_new(&mut record);
                self.insert(engine, &record, ctx).await?;
            }
            Some(old) => {
                let id = old.get_object_id("_id").expect("stored record has _id");
                let ct = old
                    .get_datetime("ct")
                    .expect("stored record has create time")
                    .to_chrono();
                record.base.id = Some(id);
                record.base.ct = Some(ct);
                record.base.mt = Some(Utc::now());
                record.base.loaded = true;
                record.base.is_new = false;
                record.base.type_name = self.fq.type_name.clone();
                let shape = engine.shape(&self.fq.type_name);
                let doc = codec::record_to_doc(shape, &record);
                let result = ctx
                    .coll(&self.fq.type_name)
                    .replace_one(doc! {"_id": id}, doc)
                    .upsert(true)
                    .await;
                match result {
                    Ok(_) => {}
                    Err(e) if is_duplicate_key(&e) => return Err(Error::conflict()),
                    Err(e) => return Err(Error::internal(e)),
                }
            }
        }
        Ok(Outcome::Record(record))
    }

    async fn delete(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        self.check_allow(Method::Delete)?;
        let criterion = self.criterion(engine, req, ctx)?;
        if self.fq.update_when_delete.is_empty() {
            ctx.coll(&self.fq.type_name)
                .delete_many(criterion)
                .await
                .unwrap_or_else(|e| panic!("delete '{}' failed: {}", self.fq.type_name, e));
        } else {
            let shape = engine.shape(&self.fq.type_name);
            let update = codec::set_update_doc(shape, &self.fq.update_when_delete);
            let result = ctx
                .coll(&self.fq.type_name)
                .update_many(criterion, update)
                .await;
            match result {
                Ok(_) => {}
                Err(e) if is_duplicate_key(&e) => return Err(Error::conflict()),
                Err(e) => return Err(Error::internal(e)),
            }
        }
        Ok(Outcome::None)
    }

    async fn patch(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        self.check_allow(Method::Patch)?;
        let criterion = self.criterion(engine, req, ctx)?;
        let shape = engine.shape(&self.fq.type_name);
        let update = codec::updater_to_doc(shape, req.updater(), &self.fq.patch_fields);
        let result = ctx
            .coll(&self.fq.type_name)
            .update_many(criterion, update)
            .await;
        match result {
            Ok(_) => {}
            Err(e) if is_duplicate_key(&e) => return Err(Error::conflict()),
            Err(e) => return Err(Error::internal(e)),
        }
        Ok(Outcome::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Allow;
    use crate::value::{FieldKind as K, RecordRef, Shape};
    use mongodb::Client;

    async fn keyed_engine() -> Engine {
        let client = Client::with_uri_str(
            "mongodb://localhost:27017/?serverSelectionTimeoutMS=500&connectTimeoutMS=500",
        )
        .await
        .expect("client parse");
        let mut engine = Engine::dial(client, "rest_test");
        engine.def_type(Shape::new("SS").field("S1", K::String));
        engine.def_type(
            Shape::new("SSS")
                .field("S1", K::String)
                .field("I1", K::Opt(Box::new(K::Int)))
                .field("B1", K::Bool)
                .field("S2", K::Ref("SS".to_string()))
                .field("S3", K::Opt(Box::new(K::Ref("SS".to_string())))),
        );
        engine
    }

    fn keyed_handler() -> FieldHandler {
        let mut fq = FieldResource::new("SSS");
        fq.allow = Allow::POST;
        fq.fields = vec!["S1".to_string(), "I1".to_string()];
        fq.context_ref.insert("B1".to_string(), "CB1".to_string());
        fq.context_ref.insert("S2".to_string(), "CS2".to_string());
        fq.context_ref.insert("S3".to_string(), "CS3".to_string());
        FieldHandler::new(fq)
    }

    fn keyed_ctx(engine: &Engine) -> Context {
        let mut ctx = engine.new_context();
        let id = bson::oid::ObjectId::parse_str("513b090869ca940ef500000b").unwrap();
        ctx.set("CB1", Value::Bool(true));
        ctx.set("CS2", Value::Ref(RecordRef { shape: "SS".to_string(), id }));
        ctx.set("CS3", Value::Ref(RecordRef { shape: "SS".to_string(), id }));
        ctx
    }

    fn keyed_req() -> Req {
        Req {
            res_id: crate::resid::ResId::parse("/test-sss/hello-world/123").unwrap(),
            method: Method::Post,
            body: None,
        }
    }

    #[tokio::test]
    async fn test_criterion_binds_segments_and_context() {
        let engine = keyed_engine().await;
        let handler = keyed_handler();
        let ctx = keyed_ctx(&engine);
        let req = keyed_req();
        let criterion = handler.criterion(&engine, &req, &ctx).unwrap();
        assert_eq!(criterion.get_str("s1").unwrap(), "hello-world");
        assert_eq!(criterion.get_i64("i1").unwrap(), 123);
        assert_eq!(criterion.get_bool("b1").unwrap(), true);
        assert_eq!(
            criterion.get_object_id("s2").unwrap().to_hex(),
            "513b090869ca940ef500000b"
        );
        assert_eq!(
            criterion.get_object_id("s3").unwrap().to_hex(),
            "513b090869ca940ef500000b"
        );
    }

    #[tokio::test]
    async fn test_missing_context_key_is_unauthorized() {
        let engine = keyed_engine().await;
        let handler = keyed_handler();
        let ctx = engine.new_context();
        let req = keyed_req();
        let err = handler.criterion(&engine, &req, &ctx).unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_populate_mirrors_criterion() {
        let engine = keyed_engine().await;
        let handler = keyed_handler();
        let ctx = keyed_ctx(&engine);
        let req = keyed_req();
        let mut record = Record::new("SSS");
        record.set("S1", Value::Str("Hello World".to_string()));
        handler
            .populate(&engine, &mut record, &req, &ctx)
            .unwrap();
        assert_eq!(record.get("S1"), Some(&Value::Str("hello-world".to_string())));
        assert_eq!(record.get("I1"), Some(&Value::Int(123)));
        assert_eq!(record.get("B1"), Some(&Value::Bool(true)));
        let s2 = record.get("S2").unwrap().as_ref_value().unwrap();
        assert_eq!(s2.id.to_hex(), "513b090869ca940ef500000b");
    }

    #[tokio::test]
    async fn test_disallowed_verb() {
        let engine = keyed_engine().await;
        let handler = keyed_handler();
        let mut ctx = keyed_ctx(&engine);
        let mut req = keyed_req();
        let err = handler.get(&engine, &mut req, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::MethodNotAllowed);
    }

    #[tokio::test]
    async fn test_sort_key_defaults() {
        let engine = keyed_engine().await;
        let shape = engine.shape("SSS").clone();

        let mut fq = FieldResource::new("SSS");
        fq.allow = Allow::GET;
        let handler = FieldHandler::new(fq);
        assert_eq!(handler.sort_keys(&engine, &shape), vec!["-_id"]);

        let mut fq = FieldResource::new("SSS");
        fq.pull = true;
        let handler = FieldHandler::new(fq);
        assert_eq!(handler.sort_keys(&engine, &shape), vec!["_id"]);

        let mut fq = FieldResource::new("SSS");
        fq.sort_fields = vec!["S1".to_string()];
        let handler = FieldHandler::new(fq);
        assert_eq!(handler.sort_keys(&engine, &shape), vec!["s1"]);
    }
}
