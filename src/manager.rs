use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerter::Alerter;
use crate::config::Config;
use crate::factory::{Registry, TaskGroup};
use crate::health::HealthMetrics;
use crate::model::RawPacket;
use crate::notify::{EmailNotifier, Notifier};
use crate::stats::{protocol_name, PacketStats};
use crate::task::Task;
use crate::writer::Writer;

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Handle for pushing packets into the manager's bounded inbox. A full inbox
/// drops the packet at this boundary; the engine never blocks the producer.
#[derive(Clone)]
pub struct Inbox {
    tx: mpsc::Sender<RawPacket>,
    health: Arc<HealthMetrics>,
}

impl Inbox {
    /// Attempts to enqueue a packet. Returns false when the inbox is full or
    /// closed.
    pub fn push(&self, packet: RawPacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(_) => {
                self.health
                    .packets_dropped
                    .with_label_values(&["inbox_full"])
                    .inc();
                false
            }
        }
    }
}

/// Orchestrates the aggregation engine: the packet worker pool that fans
/// every packet out to every task, one snapshotter per writer on that
/// writer's cadence, the global resetter on the measurement period, and the
/// alerter.
pub struct Manager {
    period: Duration,
    num_workers: usize,

    packet_tx: mpsc::Sender<RawPacket>,
    packet_rx: Option<mpsc::Receiver<RawPacket>>,
    shared_rx: Option<Arc<tokio::sync::Mutex<mpsc::Receiver<RawPacket>>>>,

    groups: Option<Vec<TaskGroup>>,
    all_tasks: Vec<Arc<Task>>,

    alerter: Option<Alerter>,

    stats: Arc<PacketStats>,
    health: Arc<HealthMetrics>,

    worker_cancel: CancellationToken,
    timer_cancel: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    timer_handles: Vec<JoinHandle<()>>,
}

impl Manager {
    /// Builds tasks and writers from configuration. Configuration problems
    /// (unknown aggregator kind, unknown key field, bad sketch type) are
    /// fatal here.
    pub fn new(cfg: &Config, health: Arc<HealthMetrics>) -> Result<Self> {
        if cfg.aggregator.period.is_zero() {
            anyhow::bail!("aggregator period must be a positive duration");
        }

        let groups = Registry::builtin()
            .create(cfg)
            .context("building task groups")?;

        let all_tasks: Vec<Arc<Task>> = groups
            .iter()
            .flat_map(|g| g.tasks.iter().cloned())
            .collect();

        for group in &groups {
            health
                .tasks_configured
                .with_label_values(&[group.kind])
                .set(group.tasks.len() as f64);
        }

        let (packet_tx, packet_rx) = mpsc::channel(cfg.aggregator.size_of_packet_channel);
        health
            .inbox_capacity
            .set(cfg.aggregator.size_of_packet_channel as f64);

        let alerter = if cfg.alerter.enabled {
            let mut notifiers = Vec::new();
            if cfg.smtp.is_configured() {
                match EmailNotifier::new(&cfg.smtp) {
                    Ok(n) => notifiers.push(Notifier::Email(n)),
                    Err(e) => warn!(error = %e, "email notifier unavailable"),
                }
            }

            if notifiers.is_empty() {
                info!("alerter enabled but no notifiers configured, alerter will not run");
                None
            } else {
                Some(Alerter::new(
                    &cfg.alerter,
                    all_tasks.clone(),
                    notifiers,
                    Arc::clone(&health),
                ))
            }
        } else {
            None
        };

        Ok(Self {
            period: cfg.aggregator.period,
            num_workers: cfg.aggregator.num_workers,
            packet_tx,
            packet_rx: Some(packet_rx),
            shared_rx: None,
            groups: Some(groups),
            all_tasks,
            alerter,
            stats: Arc::new(PacketStats::new()),
            health,
            worker_cancel: CancellationToken::new(),
            timer_cancel: CancellationToken::new(),
            worker_handles: Vec::new(),
            timer_handles: Vec::new(),
        })
    }

    /// Replaces the alerter with one using the given notifiers, keeping the
    /// configured rules and cadence. Must be called before `start`.
    pub fn set_alert_notifiers(&mut self, cfg: &Config, notifiers: Vec<Notifier>) {
        self.alerter = Some(Alerter::new(
            &cfg.alerter,
            self.all_tasks.clone(),
            notifiers,
            Arc::clone(&self.health),
        ));
    }

    /// The ingest interface handed to transports.
    pub fn inbox(&self) -> Inbox {
        Inbox {
            tx: self.packet_tx.clone(),
            health: Arc::clone(&self.health),
        }
    }

    /// Tasks across all groups, in group order.
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.all_tasks
    }

    /// Spawns snapshotters, the resetter, the alerter, and the worker pool.
    pub async fn start(&mut self) -> Result<()> {
        let groups = self.groups.take().context("start called more than once")?;

        // One snapshotter per writer, on that writer's own cadence. The
        // snapshotter owns the writer, so its writes are serialized.
        for group in groups {
            let kind = group.kind;
            for writer in group.writers {
                info!(
                    group = kind,
                    writer = writer.name(),
                    interval = ?writer.interval(),
                    tasks = group.tasks.len(),
                    "starting snapshotter",
                );
                self.timer_handles.push(tokio::spawn(run_snapshotter(
                    writer,
                    group.tasks.clone(),
                    self.timer_cancel.child_token(),
                    Arc::clone(&self.health),
                )));
            }
        }

        // Global resetter over every task in every group.
        self.timer_handles.push(tokio::spawn(run_resetter(
            self.all_tasks.clone(),
            self.period,
            self.timer_cancel.child_token(),
            Arc::clone(&self.health),
        )));
        info!(period = ?self.period, "started global resetter");

        if let Some(alerter) = &mut self.alerter {
            alerter.start();
        }

        // Packet worker pool over a shared inbox receiver.
        let rx = self.packet_rx.take().context("start called more than once")?;
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        self.shared_rx = Some(Arc::clone(&rx));

        for _ in 0..self.num_workers {
            self.worker_handles.push(tokio::spawn(run_worker(
                Arc::clone(&rx),
                self.all_tasks.clone(),
                Arc::clone(&self.stats),
                Arc::clone(&self.health),
                self.worker_cancel.child_token(),
            )));
        }

        self.timer_handles.push(tokio::spawn(run_stats_reporter(
            Arc::clone(&self.stats),
            self.packet_tx.clone(),
            self.timer_cancel.child_token(),
            Arc::clone(&self.health),
        )));

        info!(workers = self.num_workers, "manager started");

        Ok(())
    }

    /// Graceful shutdown: stop the workers once the inbox backlog is
    /// drained, close the inbox, take one final snapshot per writer, then
    /// run the alerter's final evaluation.
    pub async fn stop(&mut self) {
        info!("manager stopping");

        // 1. Signal workers; each drains the remaining backlog before it
        //    exits.
        self.worker_cancel.cancel();
        for handle in self.worker_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker join failed");
            }
        }
        debug!("all workers drained");

        // 2. Close the inbox so producers see the engine as gone.
        if let Some(rx) = &self.shared_rx {
            rx.lock().await.close();
        }

        // 3. Signal snapshotters (final snapshot) and the resetter to exit.
        self.timer_cancel.cancel();
        for handle in self.timer_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "timer task join failed");
            }
        }

        // 4. Stop the alerter; it runs one last evaluation.
        if let Some(alerter) = &mut self.alerter {
            alerter.stop().await;
        }

        info!("manager stopped");
    }
}

/// Dequeues packets, normalizes them, and fans each one out to every task in
/// every group. Exits when the inbox is closed, or when shutdown is
/// signalled and the backlog is drained. Only one worker holds the receiver
/// lock at a time; it releases the lock before processing so the pool stays
/// parallel.
async fn run_worker(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RawPacket>>>,
    tasks: Vec<Arc<Task>>,
    stats: Arc<PacketStats>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    loop {
        let packet = {
            let mut guard = rx.lock().await;
            if cancel.is_cancelled() {
                // Drain the backlog without blocking; exit once empty.
                guard.try_recv().ok()
            } else {
                tokio::select! {
                    p = guard.recv() => p,
                    _ = cancel.cancelled() => continue,
                }
            }
        };
        let Some(raw) = packet else {
            return;
        };

        health.packets_received.inc();

        let Some(info) = raw.normalize() else {
            health
                .packets_dropped
                .with_label_values(&["malformed"])
                .inc();
            continue;
        };

        stats.record(info.five_tuple.protocol);

        for task in &tasks {
            task.process(&info);
        }
    }
}

/// Periodic snapshot loop for a single writer and its group's tasks. Takes
/// one final snapshot when signalled to stop.
async fn run_snapshotter(
    writer: Writer,
    tasks: Vec<Arc<Task>>,
    cancel: CancellationToken,
    health: Arc<HealthMetrics>,
) {
    if let Err(e) = writer.start().await {
        warn!(
            writer = writer.name(),
            error = %e,
            "writer initialization failed, writes will retry",
        );
    }

    let mut ticker = tokio::time::interval(writer.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                snapshot_for_writer(&writer, &tasks, &health).await;
                debug!(writer = writer.name(), "snapshotter stopped");
                return;
            }
            _ = ticker.tick() => {
                snapshot_for_writer(&writer, &tasks, &health).await;
            }
        }
    }
}

/// Captures snapshots from all tasks concurrently, then writes them through
/// the writer one at a time. Write failures are logged and never propagate.
async fn snapshot_for_writer(writer: &Writer, tasks: &[Arc<Task>], health: &HealthMetrics) {
    let timestamp = SystemTime::now();

    let handles: Vec<_> = tasks
        .iter()
        .map(|task| {
            let task = Arc::clone(task);
            tokio::task::spawn_blocking(move || {
                let payload = task.snapshot();
                let descriptor = task.field_descriptor();
                (task, payload, descriptor)
            })
        })
        .collect();

    for handle in handles {
        let (task, payload, descriptor) = match handle.await {
            Ok(captured) => captured,
            Err(e) => {
                error!(error = %e, "snapshot capture panicked");
                continue;
            }
        };

        match writer
            .write(&payload, timestamp, task.name(), &descriptor)
            .await
        {
            Ok(rows) => {
                health
                    .snapshots_total
                    .with_label_values(&[writer.name()])
                    .inc();
                if rows > 0 {
                    debug!(writer = writer.name(), task = task.name(), rows, "snapshot written");
                }
            }
            Err(e) => {
                health
                    .snapshot_write_errors
                    .with_label_values(&[writer.name()])
                    .inc();
                error!(
                    writer = writer.name(),
                    task = task.name(),
                    error = %e,
                    "snapshot write failed",
                );
            }
        }
    }
}

/// Resets every task at each measurement-window boundary. Not synchronized
/// with snapshotters; a snapshot taken just after a reset may be empty.
async fn run_resetter(
    tasks: Vec<Arc<Task>>,
    period: Duration,
    cancel: CancellationToken,
    health: Arc<HealthMetrics>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("resetter stopped");
                return;
            }
            _ = ticker.tick() => {
                let handles: Vec<_> = tasks
                    .iter()
                    .map(|task| {
                        let task = Arc::clone(task);
                        tokio::task::spawn_blocking(move || task.reset())
                    })
                    .collect();
                for handle in handles {
                    if let Err(e) = handle.await {
                        error!(error = %e, "task reset panicked");
                    }
                }
                health.resets_total.inc();
                info!("all tasks reset for new measurement window");
            }
        }
    }
}

/// Logs ingest statistics once a minute and keeps the inbox depth gauge
/// current.
async fn run_stats_reporter(
    stats: Arc<PacketStats>,
    tx: mpsc::Sender<RawPacket>,
    cancel: CancellationToken,
    health: Arc<HealthMetrics>,
) {
    let mut ticker = tokio::time::interval(STATS_REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                health
                    .inbox_length
                    .set((tx.max_capacity() - tx.capacity()) as f64);

                let snapshot = stats.snapshot();
                let total: u64 = snapshot.iter().map(|(_, n)| n).sum();
                if total == 0 {
                    continue;
                }

                info!(packets = total, "ingest stats (60s)");
                for (protocol, count) in &snapshot {
                    debug!(protocol = %protocol_name(*protocol), count, "  by protocol (60s)");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn test_config(yaml: &str) -> Config {
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        cfg.validate().expect("valid");
        cfg
    }

    fn raw_packet(src: [u8; 4]) -> RawPacket {
        RawPacket {
            timestamp: SystemTime::UNIX_EPOCH,
            src_addr: src.to_vec(),
            dst_addr: vec![8, 8, 8, 8],
            src_port: 1000,
            dst_port: 53,
            protocol: 17,
            length: 100,
        }
    }

    const BASE: &str = r#"
aggregator:
  types: [exact]
  period: 1h
  num_workers: 2
  size_of_packet_channel: 1024
  exact:
    tasks:
      - name: per_src
        num_shards: 8
        key_fields: [SrcIP]
"#;

    #[tokio::test]
    async fn test_packets_reach_tasks_before_shutdown() {
        let cfg = test_config(BASE);
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let mut manager = Manager::new(&cfg, health).expect("builds");
        let inbox = manager.inbox();

        manager.start().await.expect("starts");
        for i in 0..100u8 {
            assert!(inbox.push(raw_packet([10, 0, 0, i])));
        }
        manager.stop().await;

        let tasks = manager.tasks();
        let crate::task::SnapshotPayload::Exact(snap) = tasks[0].snapshot() else {
            panic!("exact payload expected");
        };
        let (packets, bytes, flows) = snap.totals();
        assert_eq!(packets, 100);
        assert_eq!(bytes, 100 * 100);
        assert_eq!(flows, 100);
    }

    #[tokio::test]
    async fn test_inbox_rejects_after_stop() {
        let cfg = test_config(BASE);
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let mut manager = Manager::new(&cfg, health).expect("builds");
        let inbox = manager.inbox();

        manager.start().await.expect("starts");
        manager.stop().await;

        assert!(!inbox.push(raw_packet([10, 0, 0, 1])));
    }

    #[tokio::test]
    async fn test_malformed_packets_counted_not_processed() {
        let cfg = test_config(BASE);
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let mut manager = Manager::new(&cfg, Arc::clone(&health)).expect("builds");
        let inbox = manager.inbox();

        manager.start().await.expect("starts");
        let mut bad = raw_packet([10, 0, 0, 1]);
        bad.src_addr = vec![1, 2, 3];
        inbox.push(bad);
        manager.stop().await;

        let crate::task::SnapshotPayload::Exact(snap) = manager.tasks()[0].snapshot() else {
            panic!("exact payload expected");
        };
        assert!(snap.is_empty());
    }

    #[test]
    fn test_unknown_kind_fails_construction() {
        let cfg = test_config(
            r#"
aggregator:
  types: [quantum]
  period: 1h
"#,
        );
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        assert!(Manager::new(&cfg, health).is_err());
    }
}
