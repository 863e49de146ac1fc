//! End-to-end engine tests
//!
//! Tests marked #[ignore] exercise the full verb pipeline against a
//! MongoDB instance on localhost:27017:
//!
//!     cargo test --test engine -- --ignored

use std::sync::Arc;

use mogogo::{
    Allow, Engine, FieldKind, FieldResource, HookOutcome, Method, Outcome, Record, RecordRef,
    ResId, SelVal, Selector, SelectorResource, Shape, Value,
};
use futures_util::FutureExt;
use mongodb::Client;

const TEST_DB: &str = "mogogo_test";

async fn client() -> Client {
    Client::with_uri_str("mongodb://localhost:27017")
        .await
        .expect("client parse")
}

async fn drop_collection(client: &Client, name: &str) {
    client
        .database(TEST_DB)
        .collection::<bson::Document>(name)
        .drop()
        .await
        .ok();
}

fn ss_shape() -> Shape {
    Shape::new("SS").field("S1", FieldKind::String)
}

#[tokio::test]
#[ignore]
async fn field_resource_post_and_get() {
    let client = client().await;
    drop_collection(&client, "ss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    let mut fq = FieldResource::new("SS");
    fq.allow = Allow::GET | Allow::POST;
    engine.def_res("test-ss", fq).await.unwrap();
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();

    let mut body = Record::new("SS");
    body.set("S1", Value::Str("Hello World".to_string()));
    let posted = res.post(body, &mut ctx).await.unwrap().into_record();
    assert_eq!(posted.get("S1"), Some(&Value::Str("Hello World".to_string())));
    assert!(posted.id().is_some());
    assert!(posted.base.is_new);
    assert!(posted.base.loaded);
    assert!(posted.base.ct.is_some() && posted.base.mt.is_some());

    // GET at self returns the same payload
    let self_res = engine.resource(posted.self_id(), &ctx).unwrap();
    let fetched = self_res.get(&mut ctx).await.unwrap().into_record();
    assert_eq!(fetched.get("S1"), Some(&Value::Str("Hello World".to_string())));
    assert_eq!(fetched.id(), posted.id());
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn keyed_field_resource_binds_segments_and_context() {
    let client = client().await;
    drop_collection(&client, "sss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    engine.def_type(
        Shape::new("SSS")
            .field("S1", FieldKind::String)
            .field("I1", FieldKind::Opt(Box::new(FieldKind::Int)))
            .field("B1", FieldKind::Bool)
            .field("S2", FieldKind::Ref("SS".to_string()))
            .field("S3", FieldKind::Opt(Box::new(FieldKind::Ref("SS".to_string())))),
    );
    let mut fq = FieldResource::new("SSS");
    fq.allow = Allow::POST;
    fq.fields = vec!["S1".to_string(), "I1".to_string()];
    fq.context_ref.insert("B1".to_string(), "CB1".to_string());
    fq.context_ref.insert("S2".to_string(), "CS2".to_string());
    fq.context_ref.insert("S3".to_string(), "CS3".to_string());
    engine.def_res("test-sss", fq).await.unwrap();
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let ss_id = bson::oid::ObjectId::parse_str("513b090869ca940ef500000b").unwrap();
    let ss_ref = Value::Ref(RecordRef { shape: "SS".to_string(), id: ss_id });
    ctx.set("CB1", Value::Bool(true));
    ctx.set("CS2", ss_ref.clone());
    ctx.set("CS3", ss_ref);

    let res = engine
        .resource(ResId::parse("/test-sss/hello-world/123").unwrap(), &ctx)
        .unwrap();
    let mut body = Record::new("SSS");
    body.set("S1", Value::Str("Hello World".to_string()));
    let posted = res.post(body, &mut ctx).await.unwrap().into_record();

    assert_eq!(posted.get("S1"), Some(&Value::Str("hello-world".to_string())));
    assert_eq!(posted.get("I1"), Some(&Value::Int(123)));
    assert_eq!(posted.get("B1"), Some(&Value::Bool(true)));
    assert_eq!(
        posted.get("S2").unwrap().as_ref_value().unwrap().id.to_hex(),
        "513b090869ca940ef500000b"
    );
    assert_eq!(
        posted.get("S3").unwrap().as_ref_value().unwrap().id.to_hex(),
        "513b090869ca940ef500000b"
    );
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn hooks_run_around_post() {
    let client = client().await;
    drop_collection(&client, "ss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    let mut fq = FieldResource::new("SS");
    fq.allow = Allow::GET | Allow::POST;
    engine.def_res("test-ss", fq).await.unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let before_seen = Arc::clone(&seen);
    engine.before(
        Method::Post,
        "test-ss",
        Arc::new(move |req: &mogogo::Req, _ctx: &mut mogogo::Context| {
            let seen = Arc::clone(&before_seen);
            let s1 = req.record().get("S1").and_then(|v| v.as_str().map(String::from));
            async move {
                seen.lock().unwrap().push(format!("before {}", s1.unwrap_or_default()));
                HookOutcome::go_on()
            }
            .boxed()
        }),
    );
    let after_seen = Arc::clone(&seen);
    engine.after(
        Method::Post,
        "test-ss",
        Arc::new(move |_req: &mogogo::Req, _ctx: &mut mogogo::Context, result: &mogogo::Result<Outcome>| {
            let seen = Arc::clone(&after_seen);
            let ok = result.is_ok();
            async move {
                seen.lock().unwrap().push(format!("after ok={}", ok));
                HookOutcome::go_on()
            }
            .boxed()
        }),
    );
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    let mut body = Record::new("SS");
    body.set("S1", Value::Str("Hello World".to_string()));
    res.post(body, &mut ctx).await.unwrap();
    ctx.close();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), ["before Hello World", "after ok=true"]);
}

#[tokio::test]
#[ignore]
async fn before_hook_short_circuits() {
    let client = client().await;
    drop_collection(&client, "ss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    let mut fq = FieldResource::new("SS");
    fq.allow = Allow::GET | Allow::POST;
    engine.def_res("test-ss", fq).await.unwrap();
    engine.before(
        Method::Post,
        "test-ss",
        Arc::new(|_req: &mogogo::Req, _ctx: &mut mogogo::Context| {
            async move {
                HookOutcome::short_circuit(
                    None,
                    Some(mogogo::Error::forbidden("blocked by hook")),
                )
            }
            .boxed()
        }),
    );
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    let mut body = Record::new("SS");
    body.set("S1", Value::Str("x".to_string()));
    let err = res.post(body, &mut ctx).await.unwrap_err();
    assert_eq!(err.kind, mogogo::ErrorKind::Forbidden);
    ctx.close();
}

async fn seeded_engine(sorted: bool) -> Arc<Engine> {
    let client = client().await;
    drop_collection(&client, "ss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    let mut fq = FieldResource::new("SS");
    fq.allow = Allow::GET | Allow::POST;
    fq.count = true;
    fq.limit = 4;
    if sorted {
        fq.sort_fields = vec!["S1".to_string()];
    }
    engine.def_res("test-ss", fq).await.unwrap();
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    for i in 0..5 {
        let mut body = Record::new("SS");
        body.set("S1", Value::Str(format!("Hello {}", i)));
        res.post(body, &mut ctx).await.unwrap();
    }
    ctx.close();
    engine
}

fn items_s1(slice: &mogogo::Slice) -> Vec<String> {
    slice
        .items()
        .iter()
        .map(|r| r.get("S1").unwrap().as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
#[ignore]
async fn sorted_pagination_walks_both_ways() {
    let engine = seeded_engine(true).await;
    let mut ctx = engine.new_context();

    let res = engine
        .resource(ResId::parse("/test-ss?n=2").unwrap(), &ctx)
        .unwrap();
    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    let slice = iter.slice(&engine, &mut ctx).await.unwrap();
    // count is capped at the configured limit
    assert_eq!(slice.count, Some(4));
    assert!(slice.more);
    assert!(slice.prev.is_none());
    assert_eq!(items_s1(&slice), ["Hello 0", "Hello 1"]);

    let next = slice.next.clone().unwrap();
    let res = engine.resource(next, &ctx).unwrap();
    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    let slice2 = iter.slice(&engine, &mut ctx).await.unwrap();
    assert_eq!(items_s1(&slice2), ["Hello 2", "Hello 3"]);
    // no count beyond the first page
    assert_eq!(slice2.count, None);

    let prev = slice2.prev.clone().unwrap();
    let res = engine.resource(prev, &ctx).unwrap();
    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    let slice3 = iter.slice(&engine, &mut ctx).await.unwrap();
    assert_eq!(items_s1(&slice3), ["Hello 0", "Hello 1"]);
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn timeline_pagination_is_newest_first() {
    let engine = seeded_engine(false).await;
    let mut ctx = engine.new_context();

    let res = engine
        .resource(ResId::parse("/test-ss?n=2").unwrap(), &ctx)
        .unwrap();
    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    let slice = iter.slice(&engine, &mut ctx).await.unwrap();
    assert_eq!(slice.count, Some(4));
    assert!(slice.more);
    assert_eq!(items_s1(&slice), ["Hello 4", "Hello 3"]);

    let next = slice.next.clone().unwrap();
    let res = engine.resource(next, &ctx).unwrap();
    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    let slice2 = iter.slice(&engine, &mut ctx).await.unwrap();
    assert_eq!(items_s1(&slice2), ["Hello 2", "Hello 1"]);

    let prev = slice2.prev.clone().unwrap();
    let res = engine.resource(prev, &ctx).unwrap();
    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    let slice3 = iter.slice(&engine, &mut ctx).await.unwrap();
    assert_eq!(items_s1(&slice3), ["Hello 4", "Hello 3"]);
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn streaming_iteration_and_extract() {
    let engine = seeded_engine(false).await;
    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    assert_eq!(iter.count(&ctx).await, 5);
    let mut seen = Vec::new();
    while let Some(rec) = iter.next(&engine, &ctx).await {
        seen.push(rec.get("S1").unwrap().as_str().unwrap().to_string());
    }
    assert_eq!(seen, ["Hello 4", "Hello 3", "Hello 2", "Hello 1", "Hello 0"]);
    let distinct = iter.extract(&ctx, "S1").await;
    assert_eq!(distinct.len(), 5);
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn soft_delete_updates_instead_of_removing() {
    let client = client().await;
    drop_collection(&client, "ss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    let mut fq = FieldResource::new("SS");
    fq.allow = Allow::GET | Allow::POST | Allow::DELETE;
    fq.update_when_delete
        .insert("S1".to_string(), Value::Str("Deleted".to_string()));
    engine.def_res("test-ss", fq).await.unwrap();
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    for i in 0..5 {
        let mut body = Record::new("SS");
        body.set("S1", Value::Str(format!("Hello {}", i)));
        res.post(body, &mut ctx).await.unwrap();
    }
    match res.delete(&mut ctx).await.unwrap() {
        Outcome::None => {}
        other => panic!("unexpected {:?}", other),
    }

    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    assert_eq!(iter.count(&ctx).await, 5);
    while let Some(rec) = iter.next(&engine, &ctx).await {
        assert_eq!(rec.get("S1"), Some(&Value::Str("Deleted".to_string())));
    }
    let distinct = iter.extract(&ctx, "S1").await;
    assert_eq!(distinct, vec![Value::Str("Deleted".to_string())]);
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn patch_sets_fields_across_match_set() {
    let client = client().await;
    drop_collection(&client, "ss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    let mut fq = FieldResource::new("SS");
    fq.allow = Allow::GET | Allow::POST | Allow::PATCH;
    fq.patch_fields = vec!["S1".to_string()];
    engine.def_res("test-ss", fq).await.unwrap();
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    for i in 0..5 {
        let mut body = Record::new("SS");
        body.set("S1", Value::Str(format!("Hello {}", i)));
        res.post(body, &mut ctx).await.unwrap();
    }

    let updater = mogogo::Updater {
        set: vec![("S1".to_string(), Value::Str("Hello Patch".to_string()))],
        add: vec![],
    };
    res.patch(updater, &mut ctx).await.unwrap();

    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    let distinct = iter.extract(&ctx, "S1").await;
    assert_eq!(distinct, vec![Value::Str("Hello Patch".to_string())]);
    // mt refreshed past ct on every patched record
    while let Some(rec) = iter.next(&engine, &ctx).await {
        assert!(rec.base.mt.unwrap() >= rec.base.ct.unwrap());
    }
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn put_inserts_then_updates_preserving_ct() {
    let client = client().await;
    drop_collection(&client, "sss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    engine.def_type(
        Shape::new("SSS")
            .field("S1", FieldKind::String)
            .field("I1", FieldKind::Opt(Box::new(FieldKind::Int)))
            .field("B1", FieldKind::Bool),
    );
    let mut fq = FieldResource::new("SSS");
    fq.allow = Allow::PUT | Allow::DELETE;
    fq.fields = vec!["S1".to_string(), "I1".to_string()];
    fq.context_ref.insert("B1".to_string(), "CB1".to_string());
    fq.unique = true;
    engine.def_res("test-sss", fq).await.unwrap();
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    ctx.set("CB1", Value::Bool(true));
    let res = engine
        .resource(ResId::parse("/test-sss/hello-world/456").unwrap(), &ctx)
        .unwrap();

    let mut body = Record::new("SSS");
    body.set("S1", Value::Str("Hello World".to_string()));
    let first = res.put(body, &mut ctx).await.unwrap().into_record();
    assert!(first.base.is_new);
    let first_ct = first.base.ct.unwrap();

    let mut again = Record::new("SSS");
    again.set("S1", Value::Str("Hello World".to_string()));
    let second = res.put(again, &mut ctx).await.unwrap().into_record();
    assert!(!second.base.is_new);
    assert_eq!(second.id(), first.id());
    // ct preserved, mt refreshed
    assert_eq!(second.base.ct.unwrap().timestamp(), first_ct.timestamp());
    assert!(second.base.mt.unwrap() >= second.base.ct.unwrap());

    res.delete(&mut ctx).await.unwrap();
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn selector_resource_filters_and_sorts() {
    let engine_setup = async {
        let client = client().await;
        drop_collection(&client, "ss").await;
        let mut engine = Engine::dial(client, TEST_DB);
        engine.def_type(ss_shape());
        let mut fq = FieldResource::new("SS");
        fq.allow = Allow::GET | Allow::POST;
        engine.def_res("test-ss", fq).await.unwrap();
        let sq = SelectorResource {
            type_name: "SS".to_string(),
            selector: Arc::new(|_req: &mogogo::Req, _ctx: &mut mogogo::Context| {
                let mut gt = std::collections::BTreeMap::new();
                gt.insert(
                    "$gt".to_string(),
                    SelVal::Value(Value::Str("Hello 2".to_string())),
                );
                let mut sel = Selector::new();
                sel.insert("S1".to_string(), SelVal::Map(gt));
                Ok(sel)
            }),
            sort_fields: vec!["S1".to_string()],
            segment_types: vec![],
            count: false,
            limit: 0,
        };
        engine.def_res("test-ss-sel", sq).await.unwrap();
        Arc::new(engine)
    };
    let engine = engine_setup.await;

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    for i in 0..5 {
        let mut body = Record::new("SS");
        body.set("S1", Value::Str(format!("Hello {}", i)));
        res.post(body, &mut ctx).await.unwrap();
    }

    let res = engine
        .resource(ResId::parse("/test-ss-sel").unwrap(), &ctx)
        .unwrap();
    let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
    assert_eq!(iter.count(&ctx).await, 2);
    let mut seen = Vec::new();
    while let Some(rec) = iter.next(&engine, &ctx).await {
        seen.push(rec.get("S1").unwrap().as_str().unwrap().to_string());
    }
    assert_eq!(seen, ["Hello 3", "Hello 4"]);
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn bound_relations_compose_identifiers() {
    let client = client().await;
    drop_collection(&client, "ss").await;
    drop_collection(&client, "sschild").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    engine.def_type(
        Shape::new("SSChild")
            .field("P", FieldKind::Ref("SS".to_string()))
            .field("S1", FieldKind::String)
            .field("B1", FieldKind::Bool),
    );
    let mut fq = FieldResource::new("SS");
    fq.allow = Allow::GET | Allow::POST;
    engine.def_res("test-ss", fq).await.unwrap();
    let mut child_fq = FieldResource::new("SSChild");
    child_fq.allow = Allow::GET | Allow::POST;
    child_fq.fields = vec!["P".to_string(), "B1".to_string()];
    engine.def_res("ss-child", child_fq).await.unwrap();
    engine.bind(
        "child",
        "SS",
        "ss-child",
        vec![
            mogogo::SegmentRef::Field("Id".to_string()),
            mogogo::SegmentRef::Value(Value::Bool(true)),
        ],
    );
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    let mut body = Record::new("SS");
    body.set("S1", Value::Str("Hello World".to_string()));
    let parent = res.post(body, &mut ctx).await.unwrap().into_record();

    let child_id = engine.rel(&parent, "child");
    let child_res = engine.resource(child_id.clone(), &ctx).unwrap();
    for _ in 0..2 {
        let mut child = Record::new("SSChild");
        child.set("S1", Value::Str("Hello Child".to_string()));
        let posted = child_res.post(child, &mut ctx).await.unwrap().into_record();
        assert_eq!(posted.get("B1"), Some(&Value::Bool(true)));
        assert_eq!(
            posted.get("P").unwrap().as_ref_value().unwrap().id,
            parent.id().unwrap()
        );
    }

    let mut iter = child_res.get(&mut ctx).await.unwrap().into_iter_outcome();
    assert_eq!(iter.count(&ctx).await, 2);
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn load_populates_unloaded_reference() {
    let client = client().await;
    drop_collection(&client, "ss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    let mut fq = FieldResource::new("SS");
    fq.allow = Allow::GET | Allow::POST;
    engine.def_res("test-ss", fq).await.unwrap();
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    let mut body = Record::new("SS");
    body.set("S1", Value::Str("Hello World".to_string()));
    let posted = res.post(body, &mut ctx).await.unwrap().into_record();

    let mut handle = Record::with_id("SS", posted.id().unwrap());
    assert!(engine.load(&mut handle, &ctx).await);
    assert_eq!(handle.get("S1"), Some(&Value::Str("Hello World".to_string())));
    assert!(handle.base.loaded);

    let mut missing = Record::with_id("SS", bson::oid::ObjectId::new());
    assert!(!engine.load(&mut missing, &ctx).await);
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn unique_get_misses_with_not_found() {
    let client = client().await;
    drop_collection(&client, "ss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    let engine = Arc::new(engine);

    let mut ctx = engine.new_context();
    let res = engine
        .resource(
            ResId::parse(&format!("/ss/{}", bson::oid::ObjectId::new().to_hex())).unwrap(),
            &ctx,
        )
        .unwrap();
    let err = res.get(&mut ctx).await.unwrap_err();
    assert_eq!(err.kind, mogogo::ErrorKind::NotFound);
    ctx.close();
}

#[tokio::test]
#[ignore]
async fn pull_get_drains_after_matching_post() {
    let client = client().await;
    drop_collection(&client, "ss").await;
    let mut engine = Engine::dial(client, TEST_DB);
    engine.def_type(ss_shape());
    let mut fq = FieldResource::new("SS");
    fq.allow = Allow::GET | Allow::POST;
    fq.pull = true;
    engine.def_res("test-ss", fq).await.unwrap();
    let engine = Arc::new(engine);

    // Waiter: an empty timeline page under `last` blocks on the
    // broadcaster until the insert below lands.
    let waiter_engine = Arc::clone(&engine);
    let waiter = tokio::spawn(async move {
        let mut ctx = waiter_engine.new_context();
        let res = waiter_engine
            .resource(ResId::parse("/test-ss?last=true").unwrap(), &ctx)
            .unwrap();
        let mut iter = res.get(&mut ctx).await.unwrap().into_iter_outcome();
        let slice = iter.slice(&waiter_engine, &mut ctx).await.unwrap();
        ctx.close();
        slice
    });

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let mut ctx = engine.new_context();
    let res = engine
        .resource(ResId::parse("/test-ss").unwrap(), &ctx)
        .unwrap();
    let mut body = Record::new("SS");
    body.set("S1", Value::Str("Hello Pull".to_string()));
    res.post(body, &mut ctx).await.unwrap();
    ctx.close();

    let slice = waiter.await.unwrap();
    assert_eq!(items_s1(&slice), ["Hello Pull"]);
}
