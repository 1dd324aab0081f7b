//! Dependency gating on deliberate failures.
//!
//! `a` raises, `b` succeeds, `c` runs because its edge on `a` accepts
//! any outcome, and `d` waits for both `b` and `c`.
//!
//! ```sh
//! cargo run --example failure_gating
//! ```

use anyhow::anyhow;
use awflow::{job, schedule, ScheduleOptions, ScheduleOutput, Status, Workflow};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> awflow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut workflow = Workflow::new();

    let a = workflow.add(job("a").body(|| {
        println!("a");
        std::thread::sleep(Duration::from_millis(300));
        Err(anyhow!("a always fails"))
    }))?;

    let b = workflow.add(job("b").body(|| {
        println!("b");
        std::thread::sleep(Duration::from_millis(100));
        Ok(json!("b"))
    }))?;

    let c = workflow.add(
        job("c")
            .array(0..4)
            .body_indexed(|i| {
                println!("c{i}");
                Ok(json!(i))
            })
            .after_status(a, Status::Any)
            .after(b),
    )?;

    let d = workflow.add(
        job("d")
            .body(|| {
                println!("d");
                Ok(json!("d"))
            })
            .after(b)
            .after(c),
    )?;

    let output = schedule(workflow, &[d], ScheduleOptions::local()).await?;

    if let ScheduleOutput::Local(results) = output {
        for result in results {
            match result {
                Ok(value) => println!("result: {value}"),
                Err(failure) => println!("failure: {failure}"),
            }
        }
    }

    Ok(())
}
