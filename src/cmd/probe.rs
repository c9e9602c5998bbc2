//! Host sample (`gearbox probe`).

use anyhow::{Context, Result};
use std::time::Duration;

use gearbox::monitor::{ResourceMonitor, ResourceProbe};

pub async fn cmd_probe(interval_secs: f64) -> Result<()> {
    if !(interval_secs.is_finite() && interval_secs > 0.0) {
        anyhow::bail!("--interval must be greater than zero");
    }

    let mut monitor = ResourceMonitor::new();
    monitor.sample().context("Failed to read host counters")?;
    tokio::time::sleep(Duration::from_secs_f64(interval_secs)).await;
    let sample = monitor.sample().context("Failed to read host counters")?;

    println!(
        "memory used: {:.1} GB of {:.1} GB",
        sample.used_memory_gb(),
        sample.total_memory_gb()
    );
    println!("cpu:         {}", sample.cpu);
    Ok(())
}
