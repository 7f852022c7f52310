//! Feeds synthetic traffic through the engine and prints what the tasks
//! aggregated: one dominant source, one super-spreader, and background noise.
//!
//! Run with: cargo run --example synthetic_traffic

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;

use netspectra::config::Config;
use netspectra::health::HealthMetrics;
use netspectra::manager::Manager;
use netspectra::model::RawPacket;
use netspectra::task::SnapshotPayload;

const CONFIG: &str = r#"
aggregator:
  types: [exact, sketch]
  period: 5m
  num_workers: 4
  size_of_packet_channel: 65536
  exact:
    tasks:
      - name: per_src
        num_shards: 64
        key_fields: [SrcIP]
  sketch:
    tasks:
      - name: heavy_flows
        skt_type: 0
        flow_fields: [SrcIP]
        width: 65536
        depth: 3
        count_threshold: 1000
        size_threshold: 1000000
      - name: spreaders
        skt_type: 1
        flow_fields: [SrcIP]
        element_fields: [DstIP]
        width: 8192
        depth: 2
        count_threshold: 500
        m: 128
        size: 5
        base: 0.5
        b: 1.08
"#;

fn packet(src: [u8; 4], dst: [u8; 4], len: u32) -> RawPacket {
    RawPacket {
        timestamp: SystemTime::now(),
        src_addr: src.to_vec(),
        dst_addr: dst.to_vec(),
        src_port: 40000,
        dst_port: 443,
        protocol: 6,
        length: len,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cfg: Config = serde_yaml::from_str(CONFIG)?;
    cfg.validate()?;

    let health = Arc::new(HealthMetrics::new(":0")?);
    let mut manager = Manager::new(&cfg, health)?;
    let inbox = manager.inbox();
    manager.start().await?;

    // One source dominating by volume.
    for _ in 0..5_000 {
        inbox.push(packet([203, 0, 113, 9], [192, 0, 2, 1], 1400));
    }

    // One source scanning 2000 distinct destinations.
    for i in 0..2_000u16 {
        let dst = [198, 51, (i >> 8) as u8, (i & 0xff) as u8];
        inbox.push(packet([203, 0, 113, 77], dst, 60));
    }

    // Background noise.
    for i in 0..500u16 {
        let src = [10, 0, (i >> 8) as u8, (i & 0xff) as u8];
        inbox.push(packet(src, [192, 0, 2, 1], 200));
    }

    manager.stop().await;

    for task in manager.tasks() {
        match task.snapshot() {
            SnapshotPayload::Exact(snap) => {
                let (packets, bytes, flows) = snap.totals();
                println!(
                    "[{}] {} flows, {} packets, {} bytes",
                    task.name(),
                    flows,
                    packets,
                    bytes,
                );
            }
            SnapshotPayload::Heavy(record) => {
                let descriptor = task.field_descriptor();
                let axis = if record.is_spread { "spread" } else { "count" };
                println!("[{}] {} heavy hitters ({axis}):", task.name(), record.count.len());
                for entry in record.count.iter().take(5) {
                    println!("  {} -> {}", descriptor.decode(&entry.flow), entry.value);
                }
            }
        }
    }

    Ok(())
}
