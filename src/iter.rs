//! Iteration and pagination
//!
//! A [`RecordIter`] is a criterion plus sort specification over one
//! shape's collection. Two slice modes key off the sort: identity-only
//! sorts page by cursor (timeline), anything else pages by skip
//! (sorted). Pull iterators drain by releasing the session, waiting on
//! the broadcaster, and retrying once.
//!
//! Store failures during iteration are IO faults and panic; malformed
//! page parameters are client faults and return BadRequest.

use std::fmt;
use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use futures_util::TryStreamExt;
use mongodb::Cursor;
use tracing::debug;

use crate::codec::{bson_to_value, doc_to_record};
use crate::context::Context;
use crate::engine::Engine;
use crate::resid::ResId;
use crate::store::sort_doc;
use crate::types::Result;
use crate::util::{parse_param_bool, parse_param_i64, parse_param_object_id};
use crate::value::{FieldKind, Record, Shape, Value};

pub const DEFAULT_SLICE_ITEMS: i64 = 60;
pub const MAX_SKIP: i64 = 5000;

/// One page of results with its navigation identifiers.
#[derive(Debug, Clone)]
pub struct Slice {
    pub self_id: ResId,
    pub prev: Option<ResId>,
    pub next: Option<ResId>,
    /// Present only when the resource is configured to count.
    pub count: Option<i64>,
    pub more: bool,
    /// Absent under `noitems`.
    pub items: Option<Vec<Record>>,
}

impl Slice {
    pub fn has_items(&self) -> bool {
        self.items.is_some()
    }

    pub fn items(&self) -> &[Record] {
        self.items.as_deref().expect("no items")
    }
}

/// Criterion-scoped iterator over one shape's collection.
pub struct RecordIter {
    shape: Arc<Shape>,
    sort_keys: Vec<String>,
    has_count: bool,
    limit: i64,
    pull: bool,
    res_id: ResId,
    criterion: Document,
    last_id: Option<ObjectId>,
    cursor: Option<Cursor<Document>>,
}

// `mongodb::Cursor` is `Send` but not `Sync` (its internal advance future is
// a `Box<dyn Future + Send>` without a `Sync` bound). `RecordIter` is always
// owned exclusively by a single task and never shared across threads, so
// asserting `Sync` here is sound and lets async fns that hold `&self` across
// an `.await` be used in `Send` futures (e.g. the boxed HTTP handler).
unsafe impl Sync for RecordIter {}

impl fmt::Debug for RecordIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordIter")
            .field("shape", &self.shape.name)
            .field("sort_keys", &self.sort_keys)
            .field("criterion", &self.criterion)
            .field("pull", &self.pull)
            .finish()
    }
}

impl RecordIter {
    pub(crate) fn new(
        shape: Arc<Shape>,
        sort_keys: Vec<String>,
        has_count: bool,
        limit: i64,
        pull: bool,
        res_id: ResId,
        criterion: Document,
    ) -> Self {
        RecordIter {
            shape,
            sort_keys,
            has_count,
            limit,
            pull,
            res_id,
            criterion,
            last_id: None,
            cursor: None,
        }
    }

    pub fn criterion(&self) -> &Document {
        &self.criterion
    }

    fn is_asc_timeline(&self) -> bool {
        self.sort_keys.len() == 1 && self.sort_keys[0] == "_id"
    }

    fn is_timeline(&self) -> bool {
        self.sort_keys.len() == 1
            && (self.sort_keys[0] == "_id" || self.sort_keys[0] == "-_id")
    }

    fn pull_cond(&self) -> Document {
        let mut cond = self.criterion.clone();
        cond.insert("$type", self.shape.name.clone());
        cond
    }

    /// Seed the cursor at the newest stored id so the first drain waits
    /// for genuinely new records (`last` parameter).
    pub(crate) async fn seed_last_id(&mut self, ctx: &Context) {
        let found = ctx
            .coll(&self.shape.name)
            .find_one(self.criterion.clone())
            .projection(doc! {"_id": 1})
            .sort(doc! {"_id": -1})
            .await
            .unwrap_or_else(|e| panic!("seek last id of '{}' failed: {}", self.shape.name, e));
        self.last_id = found.and_then(|d| d.get_object_id("_id").ok());
    }

    /// Exact count of the criterion's match set.
    pub async fn count(&self, ctx: &Context) -> i64 {
        let n = ctx
            .coll(&self.shape.name)
            .count_documents(self.criterion.clone())
            .await
            .unwrap_or_else(|e| panic!("count '{}' failed: {}", self.shape.name, e));
        n as i64
    }

    /// Count capped at the configured limit: issues count(limit+1) and
    /// reports (limit, true) when it overflows.
    async fn count_with_limit(&self, ctx: &Context) -> (i64, bool) {
        if self.limit > 0 {
            let n = ctx
                .coll(&self.shape.name)
                .count_documents(self.criterion.clone())
                .limit((self.limit + 1) as u64)
                .await
                .unwrap_or_else(|e| panic!("count '{}' failed: {}", self.shape.name, e));
            let n = n as i64;
            if n > self.limit {
                (self.limit, true)
            } else {
                (n, false)
            }
        } else {
            (self.count(ctx).await, false)
        }
    }

    /// Distinct non-null values of a declared field across the match
    /// set, decoded to typed values.
    pub async fn extract(&self, ctx: &Context, field: &str) -> Vec<Value> {
        if field == "Id" {
            panic!("can't use field Id");
        }
        let def = self
            .shape
            .field_def(field)
            .unwrap_or_else(|| panic!("field '{}' not in '{}'", field, self.shape.name));
        let elem_kind: &FieldKind = match def.kind.base() {
            FieldKind::List(inner) => inner,
            other => other,
        };
        let values = ctx
            .coll(&self.shape.name)
            .distinct(def.key(), self.criterion.clone())
            .await
            .unwrap_or_else(|e| panic!("distinct '{}' failed: {}", self.shape.name, e));
        values
            .iter()
            .filter(|b| !matches!(b, Bson::Null))
            .map(|b| bson_to_value(elem_kind, b))
            .collect()
    }

    /// Streaming iteration. On a pull iterator an exhausted cursor waits
    /// for a matching broadcast and retries once.
    pub async fn next(&mut self, engine: &Engine, ctx: &Context) -> Option<Record> {
        match self.next_inner(ctx).await {
            Some(rec) => Some(rec),
            None if self.pull => {
                self.cursor = None;
                engine.cond.wait(&self.pull_cond()).await;
                self.next_inner(ctx).await
            }
            None => None,
        }
    }

    async fn next_inner(&mut self, ctx: &Context) -> Option<Record> {
        if self.cursor.is_none() {
            let cursor = if !self.sort_keys.is_empty() {
                let mut sel = self.criterion.clone();
                if let Some(last) = self.last_id {
                    if self.is_asc_timeline() {
                        sel.insert("_id", doc! {"$gt": last});
                    }
                }
                ctx.coll(&self.shape.name)
                    .find(sel)
                    .sort(sort_doc(&self.sort_keys))
                    .await
            } else {
                ctx.coll(&self.shape.name).find(self.criterion.clone()).await
            }
            .unwrap_or_else(|e| panic!("find '{}' failed: {}", self.shape.name, e));
            self.cursor = Some(cursor);
        }
        let cursor = self.cursor.as_mut().expect("cursor opened above");
        match cursor.try_next().await {
            Ok(Some(d)) => {
                self.last_id = d.get_object_id("_id").ok();
                Some(doc_to_record(&self.shape, &d))
            }
            Ok(None) => None,
            Err(e) => panic!("iterate '{}' failed: {}", self.shape.name, e),
        }
    }

    async fn fetch(
        &self,
        ctx: &Context,
        sel: Document,
        sort_keys: &[String],
        limit: Option<i64>,
        skip: Option<u64>,
    ) -> Vec<Record> {
        let coll = ctx.coll(&self.shape.name);
        let mut find = coll.find(sel);
        if !sort_keys.is_empty() {
            find = find.sort(sort_doc(sort_keys));
        }
        if let Some(n) = limit {
            find = find.limit(n);
        }
        if let Some(c) = skip {
            find = find.skip(c);
        }
        let mut cursor = find
            .await
            .unwrap_or_else(|e| panic!("find '{}' failed: {}", self.shape.name, e));
        let mut out = Vec::new();
        loop {
            match cursor.try_next().await {
                Ok(Some(d)) => out.push(doc_to_record(&self.shape, &d)),
                Ok(None) => break,
                Err(e) => panic!("iterate '{}' failed: {}", self.shape.name, e),
            }
        }
        out
    }

    /// One page under the identifier's page parameters.
    pub async fn slice(&mut self, engine: &Engine, ctx: &mut Context) -> Result<Slice> {
        if self.is_timeline() {
            self.timeline_slice(engine, ctx).await
        } else {
            self.sorted_slice(ctx).await
        }
    }

    // -- timeline (cursor-based) paging -------------------------------------

    async fn timeline_slice(&self, engine: &Engine, ctx: &mut Context) -> Result<Slice> {
        let params = &self.res_id.params;
        let next = parse_param_object_id(params, "next")?;
        let prev = parse_param_object_id(params, "prev")?;
        let mut n = parse_param_i64(params, "n", DEFAULT_SLICE_ITEMS)?;
        let mut all = parse_param_bool(params, "all", false)?;
        if all && self.limit > 0 {
            all = false;
            n = self.limit;
        }
        let noitems = parse_param_bool(params, "noitems", false)?;

        let mut slice = Slice {
            self_id: self.timeline_self(),
            prev: None,
            next: None,
            count: None,
            more: false,
            items: None,
        };
        if next.is_none() && prev.is_none() && self.has_count {
            let (count, more) = self.count_with_limit(ctx).await;
            slice.count = Some(count);
            slice.more = more;
        }
        if !noitems {
            let items = match (next, prev) {
                (Some(next), _) => self.timeline_items_next(Some(next), n, all, engine, ctx).await,
                (None, Some(prev)) => self.timeline_items_prev(prev, n, all, ctx).await,
                (None, None) => self.timeline_items_next(None, n, all, engine, ctx).await,
            };
            slice.items = Some(items);
        }
        if let Some(items) = &slice.items {
            if !items.is_empty() {
                slice.prev = Some(self.timeline_prev_id(items));
                slice.next = Some(self.timeline_next_id(items));
            }
        }
        Ok(slice)
    }

    async fn timeline_items_next(
        &self,
        next: Option<ObjectId>,
        n: i64,
        all: bool,
        engine: &Engine,
        ctx: &mut Context,
    ) -> Vec<Record> {
        let next = next.or(self.last_id);
        let items = self.timeline_fetch_next(next, n, all, ctx).await;
        if self.pull && items.is_empty() {
            // Drain protocol: release the session while parked, retry
            // once after a matching broadcast (or timeout).
            ctx.close();
            let signalled = engine.cond.wait(&self.pull_cond()).await;
            ctx.reopen();
            debug!(shape = %self.shape.name, signalled, "pull drain retry");
            return self.timeline_fetch_next(next, n, all, ctx).await;
        }
        items
    }

    async fn timeline_fetch_next(
        &self,
        next: Option<ObjectId>,
        mut n: i64,
        all: bool,
        ctx: &Context,
    ) -> Vec<Record> {
        if n <= 0 {
            return Vec::new();
        }
        if self.limit > 0 && n > self.limit {
            n = self.limit;
        }
        let mut sel = self.criterion.clone();
        if let Some(next) = next {
            if self.sort_keys[0] == "-_id" {
                sel.insert("_id", doc! {"$lt": next});
            } else {
                sel.insert("_id", doc! {"$gt": next});
            }
        }
        let limit = if all { None } else { Some(n) };
        self.fetch(ctx, sel, &self.sort_keys, limit, None).await
    }

    async fn timeline_items_prev(
        &self,
        prev: ObjectId,
        mut n: i64,
        all: bool,
        ctx: &Context,
    ) -> Vec<Record> {
        if n <= 0 {
            return Vec::new();
        }
        if self.limit > 0 && n > self.limit {
            n = self.limit;
        }
        let mut sel = self.criterion.clone();
        // Fetch in reverse order from the cursor, then restore.
        let sort_keys = if self.sort_keys[0] == "-_id" {
            sel.insert("_id", doc! {"$gt": prev});
            vec!["_id".to_string()]
        } else {
            sel.insert("_id", doc! {"$lt": prev});
            vec!["-_id".to_string()]
        };
        let limit = if all { None } else { Some(n) };
        let mut items = self.fetch(ctx, sel, &sort_keys, limit, None).await;
        items.reverse();
        items
    }

    fn timeline_self(&self) -> ResId {
        let mut id = self.res_id.clone();
        id.params.remove("prev");
        id.params.remove("next");
        id
    }

    fn timeline_prev_id(&self, items: &[Record]) -> ResId {
        let mut id = self.timeline_self();
        id.params.remove("last");
        let first = items[0].id().expect("loaded record has id");
        id.params.insert("prev".to_string(), first.to_hex());
        id
    }

    fn timeline_next_id(&self, items: &[Record]) -> ResId {
        let mut id = self.timeline_self();
        id.params.remove("last");
        let last = items[items.len() - 1].id().expect("loaded record has id");
        id.params.insert("next".to_string(), last.to_hex());
        id
    }

    // -- sorted (skip-based) paging -----------------------------------------

    async fn sorted_slice(&self, ctx: &Context) -> Result<Slice> {
        let params = &self.res_id.params;
        let c = parse_param_i64(params, "c", 0)?;
        let mut n = parse_param_i64(params, "n", DEFAULT_SLICE_ITEMS)?;
        let mut all = parse_param_bool(params, "all", false)?;
        if all && self.limit > 0 {
            all = false;
            n = self.limit;
        }
        let noitems = parse_param_bool(params, "noitems", false)?;

        let mut slice = Slice {
            self_id: self.sorted_self(),
            prev: None,
            next: None,
            count: None,
            more: false,
            items: None,
        };
        if c == 0 && self.has_count {
            let (count, more) = self.count_with_limit(ctx).await;
            slice.count = Some(count);
            slice.more = more;
        }
        if !noitems {
            slice.items = Some(self.sorted_items(c, n, all, ctx).await);
        }
        let fetched = slice.items.as_ref().map_or(0, |i| i.len() as i64);
        if slice.items.as_ref().map_or(true, |i| !i.is_empty()) {
            slice.prev = self.sorted_prev_id(c, n);
            slice.next = Some(self.sorted_next_id(c + fetched, n));
        }
        Ok(slice)
    }

    async fn sorted_items(&self, mut c: i64, mut n: i64, all: bool, ctx: &Context) -> Vec<Record> {
        if c < 0 {
            n += c;
            c = 0;
        }
        if n <= 0 {
            return Vec::new();
        }
        if self.limit > 0 && n > self.limit {
            n = self.limit;
        }
        if c > MAX_SKIP {
            return Vec::new();
        }
        let limit = if all { None } else { Some(n) };
        let skip = if c > 0 { Some(c as u64) } else { None };
        self.fetch(ctx, self.criterion.clone(), &self.sort_keys, limit, skip)
            .await
    }

    fn sorted_self(&self) -> ResId {
        let mut id = self.res_id.clone();
        id.params.remove("c");
        id
    }

    /// Previous page covers `min(n, c)` rows ending at the current
    /// offset; there is none at the start of the sequence.
    fn sorted_prev_id(&self, c: i64, n: i64) -> Option<ResId> {
        let mut c = c - n;
        let mut n = n;
        if c < 0 {
            n += c;
            c = 0;
        }
        if n <= 0 {
            return None;
        }
        let mut id = self.res_id.clone();
        id.params.insert("c".to_string(), c.to_string());
        id.params.insert("n".to_string(), n.to_string());
        Some(id)
    }

    fn sorted_next_id(&self, c: i64, n: i64) -> ResId {
        let mut id = self.res_id.clone();
        id.params.insert("c".to_string(), c.to_string());
        id.params.insert("n".to_string(), n.to_string());
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Shape;

    fn test_iter(sort_keys: Vec<&str>, res_id: &str) -> RecordIter {
        RecordIter::new(
            Arc::new(Shape::new("SS").field("S1", FieldKind::String)),
            sort_keys.into_iter().map(|s| s.to_string()).collect(),
            false,
            0,
            false,
            ResId::parse(res_id).unwrap(),
            Document::new(),
        )
    }

    #[test]
    fn test_timeline_detection() {
        assert!(test_iter(vec!["_id"], "/r").is_timeline());
        assert!(test_iter(vec!["-_id"], "/r").is_timeline());
        assert!(test_iter(vec!["_id"], "/r").is_asc_timeline());
        assert!(!test_iter(vec!["-_id"], "/r").is_asc_timeline());
        assert!(!test_iter(vec!["s1"], "/r").is_timeline());
        assert!(!test_iter(vec!["_id", "s1"], "/r").is_timeline());
    }

    #[test]
    fn test_sorted_prev_page_math() {
        let it = test_iter(vec!["s1"], "/r");
        // page size min(n, c); no prev at the sequence start
        assert!(it.sorted_prev_id(0, 4).is_none());
        let prev = it.sorted_prev_id(2, 4).unwrap();
        assert_eq!(prev.params.get("c").unwrap(), "0");
        assert_eq!(prev.params.get("n").unwrap(), "2");
        let prev = it.sorted_prev_id(6, 4).unwrap();
        assert_eq!(prev.params.get("c").unwrap(), "2");
        assert_eq!(prev.params.get("n").unwrap(), "4");
    }

    #[test]
    fn test_timeline_self_strips_cursors() {
        let it = test_iter(vec!["-_id"], "/r?next=513063ef69ca944b1000000a&n=2");
        let self_id = it.timeline_self();
        assert!(self_id.params.get("next").is_none());
        assert_eq!(self_id.params.get("n").unwrap(), "2");
    }

    #[test]
    fn test_pull_cond_carries_type() {
        let mut it = test_iter(vec!["_id"], "/r");
        it.criterion.insert("s1", "hello");
        it.pull = true;
        let cond = it.pull_cond();
        assert_eq!(cond.get_str("$type").unwrap(), "SS");
        assert_eq!(cond.get_str("s1").unwrap(), "hello");
    }
}
