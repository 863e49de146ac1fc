//! Verb handlers
//!
//! Every registered resource reduces to an object implementing
//! [`Handler`]. The built-in kinds (field, selector, image) live here;
//! custom resources supply their own handler. A verb a handler does not
//! override answers MethodNotAllowed.

pub mod field;
pub mod image;
pub mod selector;

use async_trait::async_trait;

use crate::codec::Updater;
use crate::context::Context;
use crate::engine::{Engine, Method};
use crate::iter::RecordIter;
use crate::resid::ResId;
use crate::types::{Error, Result};
use crate::value::Record;

pub use image::Binary;

/// Decoded request body.
#[derive(Debug)]
pub enum Body {
    Record(Record),
    Update(Updater),
    Binary(Binary),
}

/// One dispatched request: identifier, verb, decoded body.
#[derive(Debug)]
pub struct Req {
    pub res_id: ResId,
    pub method: Method,
    pub body: Option<Body>,
}

impl Req {
    pub fn record(&self) -> &Record {
        match &self.body {
            Some(Body::Record(r)) => r,
            _ => panic!("request body is not a record"),
        }
    }

    pub fn take_record(&mut self) -> Record {
        match self.body.take() {
            Some(Body::Record(r)) => r,
            _ => panic!("request body is not a record"),
        }
    }

    pub fn updater(&self) -> &Updater {
        match &self.body {
            Some(Body::Update(u)) => u,
            _ => panic!("request body is not an updater"),
        }
    }

    pub fn take_binary(&mut self) -> Binary {
        match self.body.take() {
            Some(Body::Binary(b)) => b,
            _ => panic!("request body is not binary"),
        }
    }
}

/// What a verb produced.
#[derive(Debug)]
pub enum Outcome {
    Record(Record),
    Iter(RecordIter),
    Binary(Binary),
    None,
}

impl Outcome {
    pub fn into_record(self) -> Record {
        match self {
            Outcome::Record(r) => r,
            other => panic!("outcome is not a record: {:?}", other),
        }
    }

    pub fn into_iter_outcome(self) -> RecordIter {
        match self {
            Outcome::Iter(it) => it,
            other => panic!("outcome is not an iterator: {:?}", other),
        }
    }
}

/// Verb capabilities of a resource. Unimplemented verbs answer
/// MethodNotAllowed.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Verbs this handler implements at all. The dispatcher rejects
    /// others before any hook runs. Handlers may still refuse an
    /// individual request with MethodNotAllowed.
    fn capabilities(&self) -> crate::engine::Allow {
        crate::engine::Allow::ALL
    }

    async fn get(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        let _ = (engine, req, ctx);
        Err(Error::method_not_allowed())
    }

    async fn put(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        let _ = (engine, req, ctx);
        Err(Error::method_not_allowed())
    }

    async fn delete(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        let _ = (engine, req, ctx);
        Err(Error::method_not_allowed())
    }

    async fn post(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        let _ = (engine, req, ctx);
        Err(Error::method_not_allowed())
    }

    async fn patch(&self, engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        let _ = (engine, req, ctx);
        Err(Error::method_not_allowed())
    }
}
