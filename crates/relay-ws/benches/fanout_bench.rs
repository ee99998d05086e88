//! Criterion benchmarks for notification fan-out.
//!
//! Measures [`ConnectionRegistry::publish`] against growing numbers of
//! connected clients, half of them subscribed to the published module.
//!
//! Run with:
//! ```bash
//! cargo bench --package relay-ws --bench fanout_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relay_core::Notification;
use relay_ws::application::ConnectionRegistry;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// A registry with `clients` connections; even ids subscribe to "web".
fn make_registry(clients: usize) -> (ConnectionRegistry, Vec<UnboundedReceiver<String>>) {
    let registry = ConnectionRegistry::new();
    let mut receivers = Vec::with_capacity(clients);
    for i in 0..clients {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(tx);
        let module = if i % 2 == 0 { "web" } else { "other" };
        let request = format!(r#"{{"action":"subscribe","params":["{module}","time"]}}"#);
        registry
            .handle_message(id, &request)
            .expect("subscribe must succeed");
        receivers.push(rx);
    }
    (registry, receivers)
}

fn make_notification() -> Notification {
    Notification::new(
        "web",
        "set_language",
        json!({"language": "cs", "languages": ["cs", "de", "en"]}),
    )
}

fn drain(receivers: &mut [UnboundedReceiver<String>]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    for clients in [1usize, 10, 100, 1000] {
        let (registry, mut receivers) = make_registry(clients);
        drain(&mut receivers);
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, _| {
            b.iter(|| {
                let delivered =
                    registry.publish(black_box("00000A1B2C3D4E5F"), "web", make_notification());
                drain(&mut receivers);
                black_box(delivered)
            })
        });
    }
    group.finish();
}

fn bench_handle_message(c: &mut Criterion) {
    let (registry, mut receivers) = make_registry(1);
    drain(&mut receivers);
    let id = relay_core::ClientId::from_raw(1);

    c.bench_function("handle_message/subscribe", |b| {
        b.iter(|| {
            registry
                .handle_message(id, black_box(r#"{"action":"subscribe","params":["a","b","c"]}"#))
                .expect("subscribe must succeed");
            drain(&mut receivers);
        })
    });

    c.bench_function("handle_message/malformed", |b| {
        b.iter(|| {
            registry
                .handle_message(id, black_box("not json"))
                .expect("error reply must be sent");
            drain(&mut receivers);
        })
    });
}

criterion_group!(benches, bench_publish, bench_handle_message);
criterion_main!(benches);
