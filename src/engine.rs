//! Resource registry
//!
//! The engine holds every registered shape, resource definition, relation
//! binding, hook and the pull set. Registration is one-shot and happens
//! during setup; a second definition of the same name is a programmer
//! error and panics. Once serving begins the registry is read-only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use futures_util::future::BoxFuture;
use mongodb::options::IndexOptions;
use mongodb::{Client, IndexModel};
use tracing::info;

use crate::codec;
use crate::cond::MapCond;
use crate::context::Context;
use crate::handler::field::FieldHandler;
use crate::handler::image::{Bound, ImageCodec, ImageHandler};
use crate::handler::selector::{SelectorFn, SelectorHandler};
use crate::handler::{Handler, Outcome, Req};
use crate::resid::ResId;
use crate::types::{Error, ErrorKind, Result};
use crate::util::{check_resource_name, type_name_to_resource_name};
use crate::value::{FieldKind, Record, Shape, Value};

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Delete,
    Post,
    Patch,
}

impl Method {
    pub fn parse(s: &str) -> Option<Method> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "POST" => Some(Method::Post),
            "PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Post => "POST",
            Method::Patch => "PATCH",
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Method::Get => 1,
            Method::Put => 1 << 1,
            Method::Delete => 1 << 2,
            Method::Post => 1 << 3,
            Method::Patch => 1 << 4,
        }
    }
}

/// Verb bitmask for resource definitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allow(u8);

impl Allow {
    pub const NONE: Allow = Allow(0);
    pub const GET: Allow = Allow(Method::Get.bit());
    pub const PUT: Allow = Allow(Method::Put.bit());
    pub const DELETE: Allow = Allow(Method::Delete.bit());
    pub const POST: Allow = Allow(Method::Post.bit());
    pub const PATCH: Allow = Allow(Method::Patch.bit());
    pub const ALL: Allow = Allow(0b11111);

    pub fn contains(self, m: Method) -> bool {
        self.0 & m.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Allow {
    type Output = Allow;
    fn bitor(self, rhs: Allow) -> Allow {
        Allow(self.0 | rhs.0)
    }
}

/// Declared type of a path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    Int,
    Str,
    Bool,
    /// A registered shape; the segment carries its identity.
    Ref(String),
}

/// Segment reference in a relation binding: a source-record field (where
/// `Id` means the record itself) or a literal value.
#[derive(Debug, Clone)]
pub enum SegmentRef {
    Field(String),
    Value(Value),
}

#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub resource: String,
    pub segment_refs: Vec<SegmentRef>,
}

/// Uniquely-keyed or multi-keyed resource backed by one shape.
#[derive(Clone)]
pub struct FieldResource {
    pub type_name: String,
    pub allow: Allow,
    /// Fields bound from path segments, in order.
    pub fields: Vec<String>,
    /// Fields bound from the context bag: field → context key.
    pub context_ref: BTreeMap<String, String>,
    pub sort_fields: Vec<String>,
    pub unique: bool,
    pub count: bool,
    pub limit: i64,
    pub pull: bool,
    pub patch_fields: Vec<String>,
    /// Soft-delete map: when non-empty, DELETE applies these `$set`
    /// values instead of removing.
    pub update_when_delete: BTreeMap<String, Value>,
}

impl FieldResource {
    pub fn new(type_name: impl Into<String>) -> Self {
        FieldResource {
            type_name: type_name.into(),
            allow: Allow::NONE,
            fields: Vec::new(),
            context_ref: BTreeMap::new(),
            sort_fields: Vec::new(),
            unique: false,
            count: false,
            limit: 0,
            pull: false,
            patch_fields: Vec::new(),
            update_when_delete: BTreeMap::new(),
        }
    }
}

/// Read-only resource whose criterion comes from a caller-supplied
/// selector function.
#[derive(Clone)]
pub struct SelectorResource {
    pub type_name: String,
    pub selector: SelectorFn,
    pub sort_fields: Vec<String>,
    pub segment_types: Vec<SegmentKind>,
    pub count: bool,
    pub limit: i64,
}

/// Binary upload/download with named resize bounds.
#[derive(Clone)]
pub struct ImageResource {
    pub bounds: BTreeMap<String, Bound>,
    pub codecs: Vec<Arc<dyn ImageCodec>>,
}

/// Resource delegating every verb to a caller-supplied handler.
#[derive(Clone)]
pub struct CustomResource {
    pub request_type: String,
    pub response_type: String,
    pub segment_types: Vec<SegmentKind>,
    pub handler: Arc<dyn Handler>,
}

/// A resource definition of one of the built-in kinds.
#[derive(Clone)]
pub enum Resource {
    Field(FieldResource),
    Selector(SelectorResource),
    Image(ImageResource),
    Custom(CustomResource),
}

impl From<FieldResource> for Resource {
    fn from(r: FieldResource) -> Self {
        Resource::Field(r)
    }
}
impl From<SelectorResource> for Resource {
    fn from(r: SelectorResource) -> Self {
        Resource::Selector(r)
    }
}
impl From<ImageResource> for Resource {
    fn from(r: ImageResource) -> Self {
        Resource::Image(r)
    }
}
impl From<CustomResource> for Resource {
    fn from(r: CustomResource) -> Self {
        Resource::Custom(r)
    }
}

/// Registered form every resource kind reduces to.
pub(crate) struct ResourceDef {
    pub name: String,
    pub request_type: String,
    pub response_type: String,
    pub segment_types: Vec<SegmentKind>,
    /// Whether the path must carry exactly the declared segments. Image
    /// resources address files by name and check their own path.
    pub exact_segments: bool,
    pub handler: Arc<dyn Handler>,
}

/// What a hook decided: `go_on` continues the pipeline unchanged;
/// otherwise the attached response/error substitutes.
pub struct HookOutcome {
    pub go_on: bool,
    pub response: Option<Outcome>,
    pub error: Option<Error>,
}

impl HookOutcome {
    pub fn go_on() -> Self {
        HookOutcome { go_on: true, response: None, error: None }
    }

    pub fn short_circuit(response: Option<Outcome>, error: Option<Error>) -> Self {
        HookOutcome { go_on: false, response, error }
    }
}

pub type BeforeHook = Arc<
    dyn for<'a> Fn(&'a Req, &'a mut Context) -> BoxFuture<'a, HookOutcome> + Send + Sync,
>;
pub type AfterHook = Arc<
    dyn for<'a> Fn(&'a Req, &'a mut Context, &'a Result<Outcome>) -> BoxFuture<'a, HookOutcome>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum HookPhase {
    Before,
    After,
}

#[derive(Clone)]
enum Hook {
    Before(BeforeHook),
    After(AfterHook),
}

type HookKey = (HookPhase, Method, String);

/// Store index surface.
#[derive(Debug, Clone, Default)]
pub struct Index {
    pub fields: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
    pub expire_after: Option<Duration>,
}

/// The resource engine: registry plus dispatch entry points.
pub struct Engine {
    client: Client,
    db_name: String,
    types: HashMap<String, Arc<Shape>>,
    pub(crate) resources: HashMap<String, Arc<ResourceDef>>,
    binds: HashMap<String, HashMap<String, Binding>>,
    hooks: HashMap<HookKey, Hook>,
    pub(crate) cond: MapCond,
    pull: HashSet<String>,
}

impl Engine {
    /// Engine over a pooled client and database name.
    pub fn dial(client: Client, db_name: impl Into<String>) -> Engine {
        Engine {
            client,
            db_name: db_name.into(),
            types: HashMap::new(),
            resources: HashMap::new(),
            binds: HashMap::new(),
            hooks: HashMap::new(),
            cond: MapCond::default(),
            pull: HashSet::new(),
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// How long a pull GET may park on the broadcaster before giving
    /// up. Setup-phase only.
    pub fn set_pull_timeout(&mut self, timeout: Duration) {
        self.cond = MapCond::new(timeout);
    }

    /// Fresh request context holding an open store session.
    pub fn new_context(&self) -> Context {
        Context::new(self.client.clone(), self.db_name.clone())
    }

    // -- shape registry -----------------------------------------------------

    pub fn type_defined(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub(crate) fn shape(&self, name: &str) -> &Arc<Shape> {
        self.types
            .get(name)
            .unwrap_or_else(|| panic!("'{}' not defined", name))
    }

    fn check_type(&self, name: &str) {
        if !self.type_defined(name) {
            panic!("'{}' not defined", name);
        }
    }

    fn check_has_base(&self, name: &str) {
        if !self.shape(name).has_base {
            panic!("'{}' must carry a base descriptor", name);
        }
    }

    /// Register a shape. Base-carrying shapes get their identity
    /// resource auto-defined (GET by id, unique).
    pub fn def_type(&mut self, shape: Shape) {
        let name = shape.name.clone();
        if self.types.contains_key(&name) {
            panic!("type '{}' already defined", name);
        }
        check_resource_name(&name.to_lowercase());
        let has_base = shape.has_base;
        self.types.insert(name.clone(), Arc::new(shape));
        if has_base {
            self.def_self(&name);
        }
    }

    fn def_self(&mut self, type_name: &str) {
        let mut fq = FieldResource::new(type_name);
        fq.allow = Allow::GET;
        fq.fields = vec!["Id".to_string()];
        fq.unique = true;
        let name = type_name_to_resource_name(type_name);
        let segment_types = self.fields_to_segment_types(type_name, &fq.fields);
        let handler = Arc::new(FieldHandler::new(fq));
        self.register(ResourceDef {
            name: name.clone(),
            request_type: type_name.to_string(),
            response_type: type_name.to_string(),
            segment_types,
            exact_segments: true,
            handler,
        });
    }

    // -- resource registry --------------------------------------------------

    fn register(&mut self, def: ResourceDef) {
        check_resource_name(&def.name);
        if self.resources.contains_key(&def.name) {
            panic!("resource '{}' already defined", def.name);
        }
        self.resources.insert(def.name.clone(), Arc::new(def));
    }

    /// Define a resource. Each kind runs its own validator; the field
    /// kind also ensures its backing index.
    pub async fn def_res(&mut self, name: &str, res: impl Into<Resource>) -> Result<()> {
        match res.into() {
            Resource::Field(fq) => self.def_field_resource(name, fq).await,
            Resource::Selector(sq) => {
                self.check_type(&sq.type_name);
                let def = ResourceDef {
                    name: name.to_string(),
                    request_type: sq.type_name.clone(),
                    response_type: sq.type_name.clone(),
                    segment_types: sq.segment_types.clone(),
                    exact_segments: true,
                    handler: Arc::new(SelectorHandler::new(sq)),
                };
                self.register(def);
                Ok(())
            }
            Resource::Image(iq) => {
                if !self.type_defined("binary") {
                    self.def_type(Shape::new("binary").without_base());
                }
                let def = ResourceDef {
                    name: name.to_string(),
                    request_type: "binary".to_string(),
                    response_type: "binary".to_string(),
                    segment_types: vec![SegmentKind::Str],
                    exact_segments: false,
                    handler: Arc::new(ImageHandler::new(iq)),
                };
                self.register(def);
                Ok(())
            }
            Resource::Custom(cq) => {
                self.check_type(&cq.request_type);
                self.check_type(&cq.response_type);
                for st in &cq.segment_types {
                    if let SegmentKind::Ref(t) = st {
                        self.check_type(t);
                    }
                }
                let def = ResourceDef {
                    name: name.to_string(),
                    request_type: cq.request_type,
                    response_type: cq.response_type,
                    segment_types: cq.segment_types,
                    exact_segments: true,
                    handler: cq.handler,
                };
                self.register(def);
                Ok(())
            }
        }
    }

    async fn def_field_resource(&mut self, name: &str, fq: FieldResource) -> Result<()> {
        self.check_type(&fq.type_name);
        check_field_resource(&fq);
        if fq.pull {
            self.pull.insert(fq.type_name.clone());
        }
        let index = field_resource_index(&fq);
        let segment_types = self.fields_to_segment_types(&fq.type_name, &fq.fields);
        let type_name = fq.type_name.clone();
        let def = ResourceDef {
            name: name.to_string(),
            request_type: type_name.clone(),
            response_type: type_name.clone(),
            segment_types,
            exact_segments: true,
            handler: Arc::new(FieldHandler::new(fq)),
        };
        self.register(def);
        if let Some(index) = index {
            self.index(&type_name, index).await?;
        }
        Ok(())
    }

    // -- bindings -----------------------------------------------------------

    /// Record a named relation from a shape to a target resource.
    /// Segment-reference types must match the target's declared segment
    /// types positionally.
    pub fn bind(
        &mut self,
        name: &str,
        type_name: &str,
        resource: &str,
        segment_refs: Vec<SegmentRef>,
    ) {
        self.check_type(type_name);
        if name.is_empty() {
            panic!("bind name is empty");
        }
        let target = self
            .resources
            .get(resource)
            .unwrap_or_else(|| panic!("'{}' not defined", resource));
        let declared = &target.segment_types;
        if declared.len() != segment_refs.len() {
            panic!(
                "segment refs len is {} but path segments len is {}",
                segment_refs.len(),
                declared.len()
            );
        }
        let ref_types = self.segment_refs_to_types(type_name, &segment_refs);
        for (i, (got, want)) in ref_types.iter().zip(declared.iter()).enumerate() {
            if got != want {
                panic!("type not match ({:?} and {:?}) at index {}", got, want, i);
            }
        }
        let by_type = self.binds.entry(type_name.to_string()).or_default();
        if by_type.contains_key(name) {
            panic!("'{}' already bind", name);
        }
        by_type.insert(
            name.to_string(),
            Binding { resource: resource.to_string(), segment_refs },
        );
    }

    /// Bound identifier for a loaded record's relation.
    pub fn rel(&self, record: &Record, name: &str) -> ResId {
        let type_name = record.type_name();
        let binding = self
            .binds
            .get(type_name)
            .and_then(|b| b.get(name))
            .unwrap_or_else(|| panic!("resource '{}' not found in {}", name, type_name));
        let mut segments = Vec::with_capacity(binding.segment_refs.len());
        for r in &binding.segment_refs {
            let seg = match r {
                SegmentRef::Field(f) if f == "Id" => {
                    record.id().expect("record has no id").to_hex()
                }
                SegmentRef::Field(f) => {
                    let v = record
                        .get(f)
                        .unwrap_or_else(|| panic!("field '{}' not in '{}'", f, type_name));
                    segment_string(v)
                }
                SegmentRef::Value(v) => segment_string(v),
            };
            segments.push(seg);
        }
        ResId::new(&binding.resource, segments)
    }

    /// Every bound identifier for the record's shape.
    pub fn all_rels(&self, record: &Record) -> BTreeMap<String, ResId> {
        let mut out = BTreeMap::new();
        if let Some(binds) = self.binds.get(record.type_name()) {
            for name in binds.keys() {
                out.insert(name.clone(), self.rel(record, name));
            }
        }
        out
    }

    // -- hooks --------------------------------------------------------------

    pub fn before(&mut self, method: Method, resource: &str, hook: BeforeHook) {
        if !self.resources.contains_key(resource) {
            panic!("'{}' not defined", resource);
        }
        self.hooks.insert(
            (HookPhase::Before, method, resource.to_string()),
            Hook::Before(hook),
        );
    }

    pub fn after(&mut self, method: Method, resource: &str, hook: AfterHook) {
        if !self.resources.contains_key(resource) {
            panic!("'{}' not defined", resource);
        }
        self.hooks.insert(
            (HookPhase::After, method, resource.to_string()),
            Hook::After(hook),
        );
    }

    pub(crate) async fn do_before(
        &self,
        method: Method,
        resource: &str,
        req: &Req,
        ctx: &mut Context,
    ) -> HookOutcome {
        match self.hooks.get(&(HookPhase::Before, method, resource.to_string())) {
            Some(Hook::Before(hook)) => hook(req, ctx).await,
            _ => HookOutcome::go_on(),
        }
    }

    pub(crate) async fn do_after(
        &self,
        method: Method,
        resource: &str,
        req: &Req,
        ctx: &mut Context,
        result: &Result<Outcome>,
    ) -> HookOutcome {
        match self.hooks.get(&(HookPhase::After, method, resource.to_string())) {
            Some(Hook::After(hook)) => hook(req, ctx, result).await,
            _ => HookOutcome::go_on(),
        }
    }

    // -- pull set -----------------------------------------------------------

    pub(crate) fn is_pull(&self, type_name: &str) -> bool {
        self.pull.contains(type_name)
    }

    // -- indexes ------------------------------------------------------------

    /// Ensure a store index on a shape's collection. Field names
    /// translate to storage keys; `-` and `@` prefixes become descending
    /// and 2d-geo keys.
    pub async fn index(&self, type_name: &str, index: Index) -> Result<()> {
        self.check_type(type_name);
        self.check_has_base(type_name);
        let keys = self.fields_to_keys(self.shape(type_name), &index.fields);
        if keys.iter().all(|k| k == "_id") {
            // The identity index is implicit.
            return Ok(());
        }
        let mut key_doc = Document::new();
        for key in &keys {
            if let Some(field) = key.strip_prefix('-') {
                key_doc.insert(field, -1);
            } else if let Some(field) = key.strip_prefix('@') {
                key_doc.insert(field, "2d");
            } else {
                key_doc.insert(key.as_str(), 1);
            }
        }
        let options = IndexOptions::builder()
            .unique(index.unique.then_some(true))
            .sparse(index.sparse.then_some(true))
            .expire_after(index.expire_after)
            .build();
        let model = IndexModel::builder().keys(key_doc).options(options).build();
        let coll = self
            .client
            .database(&self.db_name)
            .collection::<Document>(&type_name.to_lowercase());
        coll.create_index(model)
            .await
            .map_err(|e| {
                Error::with_cause(ErrorKind::InternalServerError, "ensure index failed", e)
            })?;
        info!(type_name, fields = ?index.fields, "index ensured");
        Ok(())
    }

    /// Translate declared field names to storage keys, keeping `-`/`@`
    /// prefixes. `Id` maps to `_id`; `CT`/`MT` to their base keys.
    pub(crate) fn fields_to_keys(&self, shape: &Shape, fields: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            let (prefix, name) = match field.strip_prefix('-') {
                Some(rest) => ("-", rest),
                None => match field.strip_prefix('@') {
                    Some(rest) => ("@", rest),
                    None => ("", field.as_str()),
                },
            };
            if !seen.insert(name.to_string()) {
                panic!("duplicate field '{}'", name);
            }
            if name == "Id" {
                out.push(format!("{}_id", prefix));
            } else if name == "CT" || name == "MT" || shape.field_def(name).is_some() {
                out.push(format!("{}{}", prefix, name.to_lowercase()));
            } else {
                panic!("field '{}' not in '{}'", name, shape.name);
            }
        }
        out
    }

    // -- segments -----------------------------------------------------------

    /// Segment types implied by a field resource's key fields.
    pub(crate) fn fields_to_segment_types(
        &self,
        type_name: &str,
        fields: &[String],
    ) -> Vec<SegmentKind> {
        let shape = self.shape(type_name);
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            if field == "Id" {
                out.push(SegmentKind::Ref(type_name.to_string()));
                continue;
            }
            if field == "CT" || field == "MT" {
                panic!("segment not support type 'time'");
            }
            let def = shape
                .field_def(field)
                .unwrap_or_else(|| panic!("field '{}' not in '{}'", field, shape.name));
            out.push(self.kind_to_segment_type(def.kind.base(), field));
        }
        out
    }

    fn kind_to_segment_type(&self, kind: &FieldKind, field: &str) -> SegmentKind {
        match kind {
            FieldKind::Int => SegmentKind::Int,
            FieldKind::String => SegmentKind::Str,
            FieldKind::Bool => SegmentKind::Bool,
            FieldKind::Ref(t) => {
                self.check_type(t);
                self.check_has_base(t);
                SegmentKind::Ref(t.clone())
            }
            other => panic!(
                "segment not support type '{}' (field '{}')",
                other.type_name(),
                field
            ),
        }
    }

    fn segment_refs_to_types(
        &self,
        type_name: &str,
        refs: &[SegmentRef],
    ) -> Vec<SegmentKind> {
        let shape = self.shape(type_name).clone();
        let mut out = Vec::with_capacity(refs.len());
        for r in refs {
            match r {
                SegmentRef::Field(f) if f == "Id" => {
                    out.push(SegmentKind::Ref(type_name.to_string()))
                }
                SegmentRef::Field(f) => {
                    if f == "CT" || f == "MT" {
                        panic!("segment not support type 'time'");
                    }
                    let def = shape
                        .field_def(f)
                        .unwrap_or_else(|| panic!("field '{}' not in '{}'", f, shape.name));
                    out.push(self.kind_to_segment_type(def.kind.base(), f));
                }
                SegmentRef::Value(v) => out.push(match v {
                    Value::Int(_) => SegmentKind::Int,
                    Value::Str(_) => SegmentKind::Str,
                    Value::Bool(_) => SegmentKind::Bool,
                    Value::Ref(r) => SegmentKind::Ref(r.shape.clone()),
                    other => panic!("segment not support type '{}'", other.kind_name()),
                }),
            }
        }
        out
    }

    /// Decode a typed path segment of an identifier against its
    /// resource's declared segment types. For custom handlers.
    pub fn segment(&self, res_id: &ResId, index: usize) -> Result<Value> {
        let def = self
            .resources
            .get(res_id.name())
            .unwrap_or_else(|| panic!("'{}' not defined", res_id.name()));
        self.decode_segment(&def.segment_types, res_id, index)
    }

    /// Decode a typed path segment against declared segment types.
    pub(crate) fn decode_segment(
        &self,
        segment_types: &[SegmentKind],
        res_id: &ResId,
        index: usize,
    ) -> Result<Value> {
        if res_id.num_segments() < segment_types.len() {
            return Err(Error::bad_request(format!(
                "path need {} segments, got {}",
                segment_types.len() + 1,
                res_id.num_segments() + 1
            )));
        }
        let kind = segment_types
            .get(index)
            .unwrap_or_else(|| panic!("segment index out of bound: {}", index));
        let raw = res_id
            .raw_segment(index)
            .unwrap_or_else(|| panic!("segment index out of bound: {}", index));
        decode_segment_value(kind, raw, index)
    }

    // -- record loading -----------------------------------------------------

    /// Populate an unloaded record from the store by identity. Returns
    /// whether the record exists. Unexpected store errors panic.
    pub async fn load(&self, record: &mut Record, ctx: &Context) -> bool {
        if record.base.loaded {
            return true;
        }
        let id = record.id().expect("record has no id");
        let shape = self.shape(record.type_name()).clone();
        let found = ctx
            .coll(record.type_name())
            .find_one(bson::doc! {"_id": id})
            .await
            .unwrap_or_else(|e| panic!("load '{}' failed: {}", shape.name, e));
        match found {
            Some(doc) => {
                *record = codec::doc_to_record(&shape, &doc);
                true
            }
            None => false,
        }
    }
}

/// Decode one raw path segment against its declared kind.
pub(crate) fn decode_segment_value(kind: &SegmentKind, raw: &str, index: usize) -> Result<Value> {
    let parse_err = |e: Box<dyn std::error::Error + Send + Sync>| Error {
        kind: ErrorKind::BadRequest,
        msg: Some(format!("parse error at segment {}", index + 1)),
        cause: Some(e),
        fields: None,
    };
    match kind {
        SegmentKind::Int => raw
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| parse_err(Box::new(e))),
        SegmentKind::Str => Ok(Value::Str(raw.to_string())),
        SegmentKind::Bool => raw
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|e| parse_err(Box::new(e))),
        SegmentKind::Ref(type_name) => bson::oid::ObjectId::parse_str(raw)
            .map(|id| Value::Ref(crate::value::RecordRef { shape: type_name.clone(), id }))
            .map_err(|e| parse_err(Box::new(e))),
    }
}

fn segment_string(v: &Value) -> String {
    match v {
        Value::Str(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Ref(r) => r.id.to_hex(),
        other => panic!("type '{}' not support for segment", other.kind_name()),
    }
}

fn check_field_resource(fq: &FieldResource) {
    if fq.allow.contains(Method::Put) && !fq.unique {
        panic!("PUT only support unique field resource");
    }
    if fq.pull && !fq.sort_fields.is_empty() {
        panic!("pull and sort fields");
    }
    for field in &fq.patch_fields {
        match field.as_str() {
            "Id" | "CT" | "MT" => panic!("can't patch field '{}'", field),
            _ => {
                if fq.context_ref.contains_key(field) {
                    panic!("can't patch field '{}' which in contextRef", field);
                }
            }
        }
    }
}

/// Compound index implied by a field resource: key fields, then
/// context-referenced fields, then sort fields or identity.
fn field_resource_index(fq: &FieldResource) -> Option<Index> {
    let mut fields: Vec<String> = fq.fields.clone();
    let mut ref_fields: Vec<String> = fq
        .context_ref
        .keys()
        .filter(|f| !fields.contains(f))
        .cloned()
        .collect();
    ref_fields.sort();
    fields.extend(ref_fields);
    if !fq.unique {
        if fq.sort_fields.is_empty() {
            fields.push("Id".to_string());
        } else {
            fields.extend(fq.sort_fields.iter().cloned());
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(Index { fields, unique: fq.unique, ..Index::default() })
    }
}
