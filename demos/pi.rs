//! Monte-Carlo π estimation as a resumable workflow.
//!
//! Each array element samples points and leaves a file behind; the
//! postconditions make a re-run skip everything that already exists.
//!
//! ```sh
//! cargo run --example pi
//! ```

use awflow::{job, processor, schedule, ScheduleOptions, ScheduleOutput, Workflow};
use rand::Rng;
use serde_json::json;
use std::path::{Path, PathBuf};

const SAMPLES: u64 = 100_000;
const TASKS: u32 = 10;

fn sample_file(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("pi-{index}.json"))
}

#[tokio::main]
async fn main() -> awflow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let dir = std::env::temp_dir().join("awflow-pi");
    std::fs::create_dir_all(&dir)?;

    let mut workflow = Workflow::new();

    let out = dir.clone();
    let check = dir.clone();
    let estimate = workflow.add(
        job("estimate")
            .array(TASKS)
            .cpus(1)
            .memory("1GB")
            .body_indexed(move |i| {
                let mut rng = rand::thread_rng();
                let inside = (0..SAMPLES)
                    .filter(|_| {
                        let x: f64 = rng.gen();
                        let y: f64 = rng.gen();
                        x * x + y * y <= 1.0
                    })
                    .count() as u64;
                std::fs::write(sample_file(&out, i), json!(inside).to_string())?;
                Ok(json!(inside))
            })
            .ensure_each(move |i| sample_file(&check, i).is_file()),
    )?;

    let samples = dir.clone();
    let check = dir.clone();
    let merge = workflow.add(
        job("merge")
            .body(move || {
                let mut inside = 0u64;
                for i in 0..TASKS {
                    let raw = std::fs::read_to_string(sample_file(&samples, i))?;
                    inside += raw.parse::<u64>().map_err(anyhow::Error::from)?;
                }
                let pi = 4.0 * inside as f64 / (SAMPLES * TASKS as u64) as f64;
                std::fs::write(samples.join("pi.json"), json!(pi).to_string())?;
                println!("pi is approximately {pi}");
                Ok(json!(pi))
            })
            .ensure(move || check.join("pi.json").is_file())
            .after(estimate),
    )?;

    // Inside a cluster allocation this process is the subordinate
    // processor; otherwise it falls through and schedules.
    processor::dispatch();

    let output = schedule(workflow, &[merge], ScheduleOptions::local()).await?;
    if let ScheduleOutput::Local(results) = output {
        if results.is_empty() {
            println!(
                "nothing to do, delete {} to start over",
                dir.display()
            );
        }
    }

    Ok(())
}
