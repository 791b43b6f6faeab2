//! Stage Chain Example
//!
//! Demonstrates the scope lifecycle of one asynchronous pipeline stage:
//! acquire a scope, publish a product from a continuation, and read it
//! back from a terminal analyze scope - without ever blocking the host
//! thread on GPU work.
//!
//! Requires CUDA hardware.
//!
//! Run with: `cargo run -p hetstream --example stage_chain`

use std::sync::{mpsc, Arc};
use std::time::Duration;

use hetstream::prelude::*;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    if !hetstream::is_cuda_available() {
        eprintln!("No CUDA device present; nothing to demonstrate.");
        return Ok(());
    }
    println!(
        "Found {} CUDA device(s); running on lane 0.",
        hetstream::device_count()
    );

    let (tx, rx) = mpsc::channel();

    // The scheduler hands the stage a waiting task; it fires when all
    // work queued under the acquire scope has completed.
    let holder = WaitingTaskHolder::new(move |status| {
        let _ = tx.send(status);
    });

    let state = Arc::new(ContextState::new());
    let mut acquire = AcquireContext::with_state(LaneId::new(0), holder, Arc::clone(&state))?;
    println!(
        "Acquired scope on device {} (state captured: {})",
        acquire.device(),
        state.has_stream()
    );

    // Chain the produce phase: it runs once the acquire-phase work has
    // drained, reusing the same stream by taking it out of the state.
    let produce_state = Arc::clone(&state);
    acquire.push_next_task(move |task| {
        println!("Continuation running on device {}", task.device());

        let produce = match ProduceContext::from_state(&produce_state) {
            Ok(scope) => scope,
            Err(err) => {
                eprintln!("Produce phase failed: {err}");
                return;
            }
        };
        let product = produce.wrap(vec![1.0f32, 2.0, 3.0]);
        drop(produce); // records the producer-done boundary

        // A terminal consumer on the producer's own stream: the getter
        // needs no synchronization at all.
        match AnalyzeContext::from_product(product.base())
            .and_then(|scope| scope.get(&product).map(Clone::clone))
        {
            Ok(values) => println!("Analyze scope read back {values:?}"),
            Err(err) => eprintln!("Analyze phase failed: {err}"),
        }
    })?;

    drop(acquire); // binds the scheduler notification to the stream

    match rx.recv_timeout(Duration::from_secs(10))? {
        TaskStatus::Done => println!("Scheduler notified: stage complete."),
        TaskStatus::Failed(err) => eprintln!("Scheduler notified: stage failed: {err}"),
    }

    println!("{}", hetstream::sync_metrics().snapshot());
    Ok(())
}
