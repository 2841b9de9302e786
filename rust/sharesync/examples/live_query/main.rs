use sharesync::prelude::*;
use sharesync::telemetry::{self, TelemetryConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(TelemetryConfig::new("live_query").with_default_filter("sharesync=debug"))?;

    let backend = MemoryBackend::new();
    let active = json!({"active": true});
    backend.set_query(
        "users",
        &active,
        vec![
            RemoteDoc::new("ada", json!({"name": "Ada", "active": true})),
            RemoteDoc::new("grace", json!({"name": "Grace", "active": true})),
        ],
        None,
    )?;

    let sync = ShareSync::new(
        backend.clone(),
        SyncConfig::new().with_teardown_delay(Duration::from_millis(500)),
    );

    // two consumers of the same query share one backend subscription
    let sidebar = sync.binding_at("users");
    let table = sync.binding_at("activeUsers");
    for binding in [&sidebar, &table] {
        if let Some(init) = binding.declare(ResourceSpec::query("users", Some(active.clone()))) {
            init.await?;
        }
    }
    println!(
        "subscriptions opened: {}",
        backend.query_subscribe_calls("users", &active)
    );

    let renders = Arc::new(AtomicUsize::new(0));
    let renders_ref = renders.clone();
    let observer = sync.tree().observer(Notifier::new(move || {
        renders_ref.fetch_add(1, Ordering::SeqCst);
    }));
    observer.track(|view| view.read(sidebar.slot()));

    backend.query_insert(
        "users",
        &active,
        1,
        vec![RemoteDoc::new("linus", json!({"name": "Linus", "active": true}))],
    )?;
    backend.query_move("users", &active, 0, 2, 1)?;
    sleep(Duration::from_millis(10)).await;

    println!("sidebar ids: {}", sidebar.ids().unwrap_or(Value::Null));
    println!("table: {}", table.data().unwrap_or(Value::Null));
    println!("renders: {}", renders.load(Ordering::SeqCst));

    drop(table);
    println!("after one unmount: {} live subscriptions", sync.registry().len());
    drop(sidebar);
    sleep(Duration::from_secs(1)).await;
    println!("after grace window: {} live subscriptions", sync.registry().len());

    Ok(())
}
