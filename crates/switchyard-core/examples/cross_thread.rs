//! A background producer talking to a host-pumped "UI" loop.
//!
//! Run with `RUST_LOG=switchyard_core=debug cargo run --example cross_thread`
//! to see the dispatcher logs.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use switchyard_core::{
    ConnectionType, Context, DispatcherRole, EventBus, LoopDispatcher, Signal, SlotFailure,
    Subscriber, WorkerDispatcher,
};

#[derive(Debug)]
struct DownloadFinished {
    url: String,
    bytes: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let ui = Arc::new(LoopDispatcher::new());
    let context = Context::builder()
        .provide(Arc::new(EventBus::new()))
        .dispatcher(DispatcherRole::Main, ui.clone())
        .with_default_dispatcher()?
        .build();

    let bus = context.require::<EventBus>()?;
    let main = context.require_dispatcher(DispatcherRole::Main)?;
    let background = context.require_dispatcher(DispatcherRole::Background)?;

    bus.on_exception().connect(|failure: &SlotFailure| {
        eprintln!("handler failed: {failure}");
    });

    let status_bar = Subscriber::builder()
        .name("status-bar")
        .on::<DownloadFinished>(|event| {
            println!(
                "[{}] {} finished ({} bytes)",
                thread::current().name().unwrap_or("?"),
                event.url,
                event.bytes
            );
        })
        .build();
    bus.register_on(&status_bar, main, ConnectionType::Auto);

    // Ask the background dispatcher a question and wait for the answer.
    let checksum = Signal::<Vec<u8>, u32>::returning();
    checksum.connect_to(
        |data| data.iter().map(|&b| u32::from(b)).sum(),
        background,
        ConnectionType::Queued,
    );
    println!("checksum = {:?}", checksum.emit(b"switchyard".to_vec())?);

    let producer_bus = bus.clone();
    let producer = thread::spawn(move || {
        for (i, url) in ["a.txt", "b.txt", "c.txt"].iter().enumerate() {
            thread::sleep(Duration::from_millis(10));
            let event = DownloadFinished {
                url: (*url).to_string(),
                bytes: (i + 1) * 1024,
            };
            if let Err(err) = producer_bus.post(event) {
                tracing::warn!(url = %url, error = %err, "download event was not delivered");
            }
        }
    });

    // The "UI loop": pump until the producer is done and nothing is left.
    while !producer.is_finished() || ui.pending_tasks() > 0 {
        ui.pump_timeout(Duration::from_millis(20));
    }
    producer.join().map_err(|_| "producer thread panicked")?;

    if let Some(worker) = context.get::<WorkerDispatcher>() {
        worker.shutdown_and_join();
    }
    Ok(())
}
