use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::json;
use sharesync::{
    BatchScheduler, ItemState, MemoryBackend, Notifier, RemoteDoc, ResourceSpec, ShareSync,
    SyncConfig, SyncError, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const GRACE: Duration = Duration::from_secs(3);

fn setup() -> (MemoryBackend, ShareSync) {
    let backend = MemoryBackend::new();
    let sync = ShareSync::new(backend.clone(), SyncConfig::default());
    (backend, sync)
}

fn counting() -> (Notifier, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_ref = hits.clone();
    let notifier = Notifier::new(move || {
        hits_ref.fetch_add(1, Ordering::SeqCst);
    });
    (notifier, hits)
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_consumers_share_one_document_subscription() {
    let (backend, sync) = setup();
    backend.set_document("users", "u1", json!({"name": "Ada"}));
    let key = ResourceSpec::doc("users", Some("u1")).key().clone();

    let a = sync.create_item(ResourceSpec::doc("users", Some("u1")), "a");
    a.init().await.expect("a should init");
    a.ref_model().expect("a should attach");
    assert_eq!(sync.registry().ref_count(&key), 1);
    assert_eq!(backend.document_subscribe_calls("users", "u1"), 1);

    let b = sync.create_item(ResourceSpec::doc("users", Some("u1")), "b");
    b.init().await.expect("b should init");
    b.ref_model().expect("b should attach");
    assert_eq!(sync.registry().ref_count(&key), 2);
    assert_eq!(
        backend.document_subscribe_calls("users", "u1"),
        1,
        "b must reuse a's subscription"
    );
    assert_eq!(sync.tree().get("b").unwrap()["name"], "Ada");

    a.destroy();
    assert_eq!(sync.registry().ref_count(&key), 1);
    tokio::time::sleep(GRACE * 2).await;
    assert!(sync.registry().contains(&key), "b still holds a reference");

    b.destroy();
    assert_eq!(sync.registry().ref_count(&key), 0);
    assert!(sync.registry().contains(&key), "teardown waits for the grace window");

    tokio::time::sleep(GRACE + Duration::from_millis(1)).await;
    assert!(!sync.registry().contains(&key));
    assert_eq!(backend.unsubscribe_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remount_inside_grace_window_keeps_subscription() {
    let (backend, sync) = setup();
    backend.set_document("users", "u1", json!({"name": "Ada"}));

    for _ in 0..5 {
        let binding = sync.binding();
        binding
            .declare(ResourceSpec::doc("users", Some("u1")))
            .expect("remote kinds spawn an init")
            .await
            .unwrap();
        assert_eq!(binding.data().unwrap()["name"], "Ada");
        drop(binding);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    assert_eq!(backend.document_subscribe_calls("users", "u1"), 1);
    assert_eq!(backend.unsubscribe_calls(), 0);

    tokio::time::sleep(GRACE).await;
    assert_eq!(backend.unsubscribe_calls(), 1);
    assert!(sync.registry().is_empty());
}

#[test]
fn test_batched_adds_notify_once() {
    let scheduler = BatchScheduler::new();
    let (f, hits) = counting();

    scheduler.batch(|| {
        scheduler.add(f.clone());
        scheduler.add(f.clone());
        scheduler.add(f.clone());
    });
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    scheduler.batch(|| scheduler.batch(|| scheduler.add(f.clone())));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_double_destroy_never_double_releases() {
    let (backend, sync) = setup();
    backend.set_document("users", "u1", json!({"name": "Ada"}));
    let key = ResourceSpec::doc("users", Some("u1")).key().clone();

    let keeper = sync.create_item(ResourceSpec::doc("users", Some("u1")), "keeper");
    keeper.init().await.unwrap();
    let item = sync.create_item(ResourceSpec::doc("users", Some("u1")), "item");
    item.init().await.unwrap();
    item.ref_model().unwrap();

    item.destroy();
    item.destroy();
    assert_eq!(sync.registry().ref_count(&key), 1);
    assert_eq!(keeper.state(), ItemState::Initializing);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_init_releases_exactly_once() {
    let (backend, sync) = setup();
    backend.set_latency(Duration::from_millis(100));
    backend.set_document("users", "u1", json!({"name": "Ada"}));
    let key = ResourceSpec::doc("users", Some("u1")).key().clone();

    let item = sync.create_item(ResourceSpec::doc("users", Some("u1")), "user");
    let init = {
        let item = item.clone();
        tokio::spawn(async move { item.init().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    item.cancel();

    init.await.unwrap().expect("cancellation is not an error");
    item.ref_model().unwrap();
    assert_ne!(item.state(), ItemState::Attached);
    assert_eq!(sync.tree().get("user"), None);
    assert_eq!(sync.registry().ref_count(&key), 0);

    item.destroy();
    assert_eq!(sync.registry().ref_count(&key), 0);

    tokio::time::sleep(GRACE * 2).await;
    assert!(sync.registry().is_empty());
    assert_eq!(backend.unsubscribe_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_query_insert_lands_at_index_with_one_notification() {
    let (backend, sync) = setup();
    let query = json!({"team": "core"});
    backend
        .set_query(
            "users",
            &query,
            vec![
                RemoteDoc::new("a", json!({"name": "A"})),
                RemoteDoc::new("b", json!({"name": "B"})),
                RemoteDoc::new("c", json!({"name": "C"})),
            ],
            None,
        )
        .unwrap();

    let binding = sync.binding_at("users");
    binding
        .declare(ResourceSpec::query("users", Some(query.clone())))
        .unwrap()
        .await
        .unwrap();

    let (notifier, hits) = counting();
    let observer = sync.tree().observer(notifier);
    observer.track(|view| view.read("users"));

    backend
        .query_insert("users", &query, 2, vec![RemoteDoc::new("x", json!({"name": "X"}))])
        .unwrap();
    backend
        .query_insert("users", &query, 0, vec![RemoteDoc::new("y", json!({"name": "Y"}))])
        .unwrap();
    settle().await;

    assert_eq!(binding.ids(), Some(json!(["y", "a", "b", "x", "c"])));
    assert_eq!(binding.data().unwrap()[3]["name"], "X");
    assert_eq!(
        hits.load(Ordering::SeqCst),
        1,
        "events queued together apply in one batch"
    );
}

#[tokio::test(start_paused = true)]
async fn test_debounced_async_call_publishes_only_latest() {
    let (_, sync) = setup();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let spec = |n: i64| {
        let calls = calls.clone();
        let lookup = move |input: Value| -> BoxFuture<'static, sharesync::Result<Value>> {
            calls.lock().unwrap().push(input.clone());
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(json!(input.as_i64().unwrap_or(0) * 10))
            }
            .boxed()
        };
        ResourceSpec::async_call("lookup", json!(n), lookup)
            .unwrap()
            .with_debounce(Duration::from_millis(50))
    };

    let binding = sync.binding();
    let (notifier, hits) = counting();
    let observer = sync.tree().observer(notifier);
    observer.track(|view| view.read(binding.slot()));

    let first = binding.declare(spec(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = binding.declare(spec(2)).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = binding.declare(spec(3)).unwrap();

    for task in [first, second, third] {
        task.await.unwrap();
    }

    assert_eq!(binding.data(), Some(json!(30)));
    assert_eq!(binding.ready_count(), 1);
    assert_eq!(
        *calls.lock().unwrap(),
        vec![json!(1), json!(3)],
        "the superseded call never leaves its debounce window"
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ignored_field_changes_notify_nobody() {
    let (backend, sync) = setup();
    backend.set_document("users", "u1", json!({"name": "Ada"}));

    let binding = sync.binding();
    binding
        .declare(ResourceSpec::doc("users", Some("u1")))
        .unwrap()
        .await
        .unwrap();

    let (notifier, hits) = counting();
    let observer = sync.tree().observer(notifier);
    observer.track(|view| view.read(binding.slot()));

    backend.update_field("users", "u1", "_meta", json!({"rev": 2}));
    backend.update_field("users", "u1", "updatedBy", json!("system"));
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    drop(observer);
    backend.update_field("users", "u1", "name", json!("Grace"));
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0, "dropped observers stay silent");
    assert_eq!(binding.data().unwrap()["name"], "Grace");
}

#[tokio::test(start_paused = true)]
async fn test_failed_acquire_retries_cleanly() {
    let (backend, sync) = setup();
    backend.fail_collection("users", "unavailable");
    backend.set_document("users", "u1", json!({"name": "Ada"}));
    let key = ResourceSpec::doc("users", Some("u1")).key().clone();

    let item = sync.create_item(ResourceSpec::doc("users", Some("u1")), "user");
    let err = item.init().await.unwrap_err();
    assert!(matches!(err, SyncError::Subscription { .. }));
    assert_eq!(sync.registry().ref_count(&key), 0);
    assert!(!sync.registry().contains(&key));

    backend.clear_failures();
    let retry = sync.create_item(ResourceSpec::doc("users", Some("u1")), "user");
    retry.init().await.expect("retry should succeed");
    assert_eq!(backend.document_subscribe_calls("users", "u1"), 1);
    assert_eq!(sync.registry().ref_count(&key), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_requests_mount_empty() {
    let (_, sync) = setup();

    let spec = ResourceSpec::doc("users", None);
    assert!(spec.is_invalid());

    let binding = sync.binding();
    binding.declare(spec).unwrap().await.unwrap();
    assert!(binding.is_ready());
    assert_eq!(binding.data(), Some(Value::Null));

    let query = ResourceSpec::query("users", Some(json!("not an object")));
    assert!(query.is_invalid());
    let list = sync.binding();
    list.declare(query).unwrap().await.unwrap();
    assert_eq!(list.data(), Some(json!([])));
}

#[tokio::test(start_paused = true)]
async fn test_query_results_track_document_changes() {
    let (backend, sync) = setup();
    let query = json!({"team": "core"});
    backend.set_document("users", "a", json!({"n": 1}));
    backend
        .set_query("users", &query, vec![RemoteDoc::new("a", json!({"n": 1}))], None)
        .unwrap();

    let doc = sync.create_item(ResourceSpec::doc("users", Some("a")), "doc");
    let list = sync.create_item(ResourceSpec::query("users", Some(query)), "list");
    for item in [&doc, &list] {
        item.init().await.unwrap();
        item.ref_model().unwrap();
    }

    let (notifier, hits) = counting();
    let observer = sync.tree().observer(notifier);
    observer.track(|view| view.read("list"));

    backend.update_field("users", "a", "n", json!(9));
    settle().await;

    assert_eq!(sync.tree().get("doc"), Some(json!({"n": 9})));
    assert_eq!(sync.tree().get("list"), Some(json!([{"n": 9}])));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_inits_still_in_flight() {
    let (backend, sync) = setup();
    backend.set_latency(Duration::from_millis(100));
    backend.set_document("users", "u1", json!({"name": "Ada"}));

    let item = sync.create_item(ResourceSpec::doc("users", Some("u1")), "user");
    let init = {
        let item = item.clone();
        tokio::spawn(async move { item.init().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    sync.shutdown();
    let err = init.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::Subscription { .. }));
    assert!(!item.is_ready());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sync.registry().is_empty());
    assert_eq!(backend.active_feeds(), 0);
}
