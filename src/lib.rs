//! mogogo - schema-driven REST resource engine over MongoDB
//!
//! Applications register record shapes and declare resources over them;
//! the engine synthesizes routing, marshalling, criterion construction,
//! pagination, relation traversal, patch operators, hooks and the HTTP
//! transport.
//!
//! ## Resource kinds
//!
//! - **Field**: criterion is a conjunction of path-segment and
//!   context-bag bindings against declared fields
//! - **Selector**: read-only, criterion produced by a caller-supplied
//!   function
//! - **Image**: binary upload/download with named resize bounds over
//!   grid-file storage
//! - **Custom**: every verb delegated to a caller-supplied handler
//!
//! ```no_run
//! use mogogo::{Allow, Engine, FieldKind, FieldResource, Shape};
//!
//! # async fn setup() -> mogogo::Result<()> {
//! let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await.unwrap();
//! let mut engine = Engine::dial(client, "app");
//! engine.def_type(Shape::new("Post").field("Title", FieldKind::String));
//! let mut timeline = FieldResource::new("Post");
//! timeline.allow = Allow::GET | Allow::POST;
//! engine.def_res("timeline", timeline).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod cond;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod handler;
pub mod iter;
pub mod resid;
pub mod server;
pub mod store;
pub mod types;
pub mod util;
pub mod value;

pub use codec::Updater;
pub use context::Context;
pub use dispatch::ResourceHandle;
pub use engine::{
    Allow, BeforeHook, AfterHook, CustomResource, Engine, FieldResource, HookOutcome,
    ImageResource, Index, Method, Resource, SegmentKind, SegmentRef, SelectorResource,
};
pub use handler::image::{adjust_size, Bound, BoundKind, ImageCodec};
pub use handler::selector::{SelVal, Selector, SelectorFn};
pub use handler::{Binary, Body, Handler, Outcome, Req};
pub use iter::{RecordIter, Slice};
pub use resid::{Params, ResId};
pub use server::{run, AppState, ContextStore, HttpConfig};
pub use types::{Error, ErrorKind, Result};
pub use value::{Base, FieldDef, FieldKind, Geo, Record, RecordRef, Shape, Value, Verifier};
