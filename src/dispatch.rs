//! Request dispatch
//!
//! Resolving an identifier yields a [`ResourceHandle`]: the resource
//! definition bound to one request. Each verb runs the same pipeline:
//! segment-count check, before-hook, handler, after-hook, response type
//! check. Hooks may short-circuit or substitute; a response of the wrong
//! shape is a programmer error.

use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use url::Url;

use crate::codec::{self, Updater};
use crate::context::Context;
use crate::engine::{Engine, HookOutcome, Method, ResourceDef};
use crate::handler::{Body, Outcome, Req};
use crate::resid::ResId;
use crate::types::{Error, Result};
use crate::value::Record;

impl Engine {
    /// Resolve an identifier to its resource. Unknown names are
    /// NotFound; privileged names need a privileged context.
    pub fn resource(&self, res_id: ResId, ctx: &Context) -> Result<ResourceHandle<'_>> {
        let def = match self.resources.get(res_id.name()) {
            Some(def) => Arc::clone(def),
            None => {
                return Err(Error::with_msg(
                    crate::types::ErrorKind::NotFound,
                    format!("no resource named '{}'", res_id.format()),
                ))
            }
        };
        if res_id.is_privileged() && !ctx.is_privileged() {
            return Err(Error::forbidden("private resource"));
        }
        Ok(ResourceHandle { engine: self, def, res_id })
    }
}

/// One resource bound to one request identifier.
pub struct ResourceHandle<'e> {
    engine: &'e Engine,
    def: Arc<ResourceDef>,
    res_id: ResId,
}

impl std::fmt::Debug for ResourceHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("res_id", &self.res_id)
            .finish()
    }
}

impl ResourceHandle<'_> {
    pub fn id(&self) -> &ResId {
        &self.res_id
    }

    pub fn params_mut(&mut self) -> &mut crate::resid::Params {
        &mut self.res_id.params
    }

    pub fn request_type(&self) -> &str {
        &self.def.request_type
    }

    pub fn response_type(&self) -> &str {
        &self.def.response_type
    }

    /// Whether the request body is a raw binary payload rather than a
    /// record.
    pub fn can_binary(&self) -> bool {
        self.def.request_type == "binary"
    }

    /// Decode a transport map into the declared request shape.
    pub fn map_to_request(
        &self,
        map: &JsonMap<String, JsonValue>,
        base: &Url,
    ) -> Result<Record> {
        let shape = self.engine.shape(&self.def.request_type);
        codec::map_to_record(shape, map, base)
    }

    /// Decode the transport patch form against the request shape.
    pub fn map_to_updater(
        &self,
        map: &JsonMap<String, JsonValue>,
        base: &Url,
    ) -> Result<Updater> {
        let shape = self.engine.shape(&self.def.request_type);
        codec::map_to_updater(shape, map, base)
    }

    /// Render a response record as its transport map.
    pub fn response_to_map(&self, record: &Record, base: &Url) -> JsonMap<String, JsonValue> {
        let shape = self.engine.shape(record.type_name());
        codec::record_to_map(shape, record, base)
    }

    pub async fn get(&self, ctx: &mut Context) -> Result<Outcome> {
        self.run(Method::Get, None, ctx).await
    }

    pub async fn put(&self, body: Record, ctx: &mut Context) -> Result<Outcome> {
        self.run(Method::Put, Some(self.record_body(body)), ctx).await
    }

    pub async fn delete(&self, ctx: &mut Context) -> Result<Outcome> {
        self.run(Method::Delete, None, ctx).await
    }

    pub async fn post(&self, body: Record, ctx: &mut Context) -> Result<Outcome> {
        self.run(Method::Post, Some(self.record_body(body)), ctx).await
    }

    pub async fn post_binary(&self, body: crate::handler::Binary, ctx: &mut Context) -> Result<Outcome> {
        if !self.can_binary() {
            panic!("resource '{}' does not take binary requests", self.def.name);
        }
        self.run(Method::Post, Some(Body::Binary(body)), ctx).await
    }

    pub async fn patch(&self, updater: Updater, ctx: &mut Context) -> Result<Outcome> {
        self.run(Method::Patch, Some(Body::Update(updater)), ctx).await
    }

    fn record_body(&self, body: Record) -> Body {
        if body.type_name() != self.def.request_type {
            panic!(
                "request type want '{}', got '{}'",
                self.def.request_type,
                body.type_name()
            );
        }
        Body::Record(body)
    }

    async fn run(&self, method: Method, body: Option<Body>, ctx: &mut Context) -> Result<Outcome> {
        if !self.def.handler.capabilities().contains(method) {
            return Err(Error::method_not_allowed());
        }
        if self.def.exact_segments
            && self.res_id.num_segments() != self.def.segment_types.len()
        {
            return Err(Error::bad_request(format!(
                "path need {} segments, got {}",
                self.def.segment_types.len() + 1,
                self.res_id.num_segments() + 1
            )));
        }
        let mut req = Req { res_id: self.res_id.clone(), method, body };
        let name = self.def.name.clone();

        let before = self.engine.do_before(method, &name, &req, ctx).await;
        if !before.go_on {
            let result = hook_result(before);
            self.check_response(&result);
            return result;
        }

        let handler = Arc::clone(&self.def.handler);
        let result = match method {
            Method::Get => handler.get(self.engine, &mut req, ctx).await,
            Method::Put => handler.put(self.engine, &mut req, ctx).await,
            Method::Delete => handler.delete(self.engine, &mut req, ctx).await,
            Method::Post => handler.post(self.engine, &mut req, ctx).await,
            Method::Patch => handler.patch(self.engine, &mut req, ctx).await,
        };

        let after = self.engine.do_after(method, &name, &req, ctx, &result).await;
        let result = if after.go_on { result } else { hook_result(after) };
        self.check_response(&result);
        result
    }

    /// A verb must answer the declared response shape, an iterator over
    /// it, a binary for binary resources, or nothing.
    fn check_response(&self, result: &Result<Outcome>) {
        let outcome = match result {
            Ok(o) => o,
            Err(_) => return,
        };
        match outcome {
            Outcome::None => {}
            Outcome::Iter(_) => {}
            Outcome::Record(r) => {
                if r.type_name() != self.def.response_type {
                    panic!(
                        "not support response type: '{}' (want '{}')",
                        r.type_name(),
                        self.def.response_type
                    );
                }
            }
            Outcome::Binary(_) => {
                if self.def.response_type != "binary" {
                    panic!("not support response type: binary");
                }
            }
        }
    }
}

fn hook_result(outcome: HookOutcome) -> Result<Outcome> {
    match outcome.error {
        Some(e) => Err(e),
        None => Ok(outcome.response.unwrap_or(Outcome::None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Allow, FieldResource};
    use crate::value::{FieldKind as K, Shape};
    use mongodb::Client;

    async fn test_engine() -> Engine {
        let client = Client::with_uri_str(
            "mongodb://localhost:27017/?serverSelectionTimeoutMS=500&connectTimeoutMS=500",
        )
        .await
        .expect("client parse");
        let mut engine = Engine::dial(client, "rest_test");
        engine.def_type(Shape::new("SS").field("S1", K::String));
        let mut fq = FieldResource::new("SS");
        fq.allow = Allow::GET | Allow::POST;
        engine.def_res("test-ss", fq).await.ok();
        engine
    }

    #[tokio::test]
    async fn test_unknown_resource_is_not_found() {
        let engine = test_engine().await;
        let ctx = engine.new_context();
        let err = engine
            .resource(ResId::parse("/nope").unwrap(), &ctx)
            .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_privileged_resource_needs_privileged_context() {
        let mut engine = test_engine().await;
        engine.def_type(Shape::new("Hidden").field("S1", K::String));
        let mut fq = FieldResource::new("Hidden");
        fq.allow = Allow::GET;
        engine.def_res("-hidden-r", fq).await.ok();

        let mut ctx = engine.new_context();
        let err = engine
            .resource(ResId::parse("/-hidden-r").unwrap(), &ctx)
            .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Forbidden);

        ctx.set_privileged(true);
        assert!(engine.resource(ResId::parse("/-hidden-r").unwrap(), &ctx).is_ok());
    }

    #[tokio::test]
    async fn test_segment_count_mismatch_is_bad_request() {
        let engine = test_engine().await;
        let mut ctx = engine.new_context();
        let handle = engine
            .resource(ResId::parse("/test-ss/extra").unwrap(), &ctx)
            .unwrap();
        let err = handle.get(&mut ctx).await.unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_method_not_allowed_passes_through() {
        let engine = test_engine().await;
        let mut ctx = engine.new_context();
        let handle = engine
            .resource(ResId::parse("/test-ss").unwrap(), &ctx)
            .unwrap();
        let err = handle.delete(&mut ctx).await.unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::MethodNotAllowed);
    }
}
