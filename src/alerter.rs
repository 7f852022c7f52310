use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AlerterConfig, AlerterRule};
use crate::health::HealthMetrics;
use crate::notify::Notifier;
use crate::task::Task;

/// Per-notifier delivery deadline.
const NOTIFY_DEADLINE: Duration = Duration::from_secs(30);

/// Periodically evaluates alert rules against live task aggregates and hands
/// a consolidated HTML report to every notifier. One final evaluation runs
/// on stop.
pub struct Alerter {
    check_interval: Duration,
    rules: Arc<Vec<AlerterRule>>,
    tasks: Vec<Arc<Task>>,
    notifiers: Arc<Vec<Notifier>>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Alerter {
    pub fn new(
        cfg: &AlerterConfig,
        tasks: Vec<Arc<Task>>,
        notifiers: Vec<Notifier>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            check_interval: cfg.check_interval,
            rules: Arc::new(cfg.rules.clone()),
            tasks,
            notifiers: Arc::new(notifiers),
            health,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Spawns the periodic evaluation loop.
    pub fn start(&mut self) {
        let tasks = self.tasks.clone();
        let rules = Arc::clone(&self.rules);
        let notifiers = Arc::clone(&self.notifiers);
        let health = Arc::clone(&self.health);
        let cancel = self.cancel.clone();
        let check_interval = self.check_interval;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        evaluate_all(&tasks, &rules, &notifiers, &health).await;
                        info!("alerter stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        evaluate_all(&tasks, &rules, &notifiers, &health).await;
                    }
                }
            }
        }));

        info!(
            check_interval = ?self.check_interval,
            rules = self.rules.len(),
            notifiers = self.notifiers.len(),
            "alerter started",
        );
    }

    /// Signals the loop to stop and waits for its final evaluation.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "alerter task join failed");
            }
        }
    }
}

/// Evaluates every task in parallel and dispatches one consolidated report
/// when anything triggered.
async fn evaluate_all(
    tasks: &[Arc<Task>],
    rules: &[AlerterRule],
    notifiers: &[Notifier],
    health: &HealthMetrics,
) {
    let mut handles = Vec::new();

    for task in tasks {
        let relevant: Vec<AlerterRule> = rules
            .iter()
            .filter(|r| r.task_name == task.name())
            .cloned()
            .collect();
        if relevant.is_empty() {
            continue;
        }

        let task = Arc::clone(task);
        handles.push(tokio::task::spawn_blocking(move || {
            task.alert_message(&relevant)
        }));
    }

    let mut messages = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(msg) if !msg.is_empty() => messages.push(msg),
            Ok(_) => {}
            Err(e) => error!(error = %e, "alert evaluation task panicked"),
        }
    }

    health.alert_evaluations.inc();
    debug!(triggered = messages.len(), "alerter evaluation completed");

    if messages.is_empty() {
        return;
    }

    health.alerts_triggered.inc();

    let subject = format!("netspectra Alert Summary ({} Triggered)", messages.len());
    let body = format!(
        "<h1>netspectra Alert Summary</h1>\
         <p>The following alerts were triggered during the last check:</p><hr>{}",
        messages.join("<hr>"),
    );

    for notifier in notifiers {
        match tokio::time::timeout(NOTIFY_DEADLINE, notifier.send(&subject, &body)).await {
            Ok(Ok(())) => {
                info!(notifier = notifier.name(), "consolidated alert notification sent");
            }
            Ok(Err(e)) => {
                health.notifications_failed.inc();
                error!(notifier = notifier.name(), error = %e, "alert notification failed");
            }
            Err(_) => {
                health.notifications_failed.inc();
                error!(
                    notifier = notifier.name(),
                    deadline = ?NOTIFY_DEADLINE,
                    "alert notification timed out",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{normalize_addr, FiveTuple, PacketInfo};
    use crate::notify::MemoryNotifier;
    use crate::task::ExactTask;
    use std::time::SystemTime;

    fn task_with_packets(n: usize) -> Arc<Task> {
        let task = ExactTask::new("per_src", &["SrcIP".to_string()], 4).unwrap();
        let packet = PacketInfo {
            timestamp: SystemTime::UNIX_EPOCH,
            five_tuple: FiveTuple {
                src_ip: normalize_addr(&[10, 0, 0, 1]).unwrap(),
                dst_ip: normalize_addr(&[8, 8, 8, 8]).unwrap(),
                src_port: 1,
                dst_port: 2,
                protocol: 6,
            },
            length: 100,
        };
        for _ in 0..n {
            task.process(&packet);
        }
        Arc::new(Task::Exact(task))
    }

    fn cfg(threshold: f64) -> AlerterConfig {
        AlerterConfig {
            enabled: true,
            check_interval: Duration::from_secs(3600),
            rules: vec![AlerterRule {
                name: "packet volume".to_string(),
                task_name: "per_src".to_string(),
                metric: "total_packets".to_string(),
                operator: ">".to_string(),
                threshold,
            }],
        }
    }

    #[tokio::test]
    async fn test_final_evaluation_on_stop_notifies() {
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let memory = MemoryNotifier::new();
        let mut alerter = Alerter::new(
            &cfg(5.0),
            vec![task_with_packets(10)],
            vec![Notifier::Memory(memory.clone())],
            Arc::clone(&health),
        );

        alerter.start();
        alerter.stop().await;

        let messages = memory.messages();
        assert_eq!(messages.len(), 1);
        let (subject, body) = &messages[0];
        assert_eq!(subject, "netspectra Alert Summary (1 Triggered)");
        assert!(body.contains("<h3>Alert: packet volume</h3>"));
        assert!(body.contains("<code>per_src</code>"));
        assert_eq!(body.matches("<h3>").count(), 1);
    }

    #[tokio::test]
    async fn test_quiet_rules_send_nothing() {
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let memory = MemoryNotifier::new();
        let mut alerter = Alerter::new(
            &cfg(1_000_000.0),
            vec![task_with_packets(10)],
            vec![Notifier::Memory(memory.clone())],
            Arc::clone(&health),
        );

        alerter.start();
        alerter.stop().await;

        assert!(memory.messages().is_empty());
    }
}
