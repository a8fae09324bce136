//! Remote log aggregator sink (Loki push protocol)
//!
//! `write` only enqueues. A background task batches entries, groups them by
//! label set and pushes them with a bounded per-request timeout and retry.
//! When the queue is full new records are dropped and counted, so a slow or
//! unreachable aggregator never blocks the caller.

use super::{LogSink, SinkError};
use crate::formatter::{render_object, AggregatorEntry, FormattedRecord, Labels};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};

/// Retry behaviour for a single batch push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Saturates at `max_delay`, including when the product overflows
    fn next_delay(&self, delay: Duration) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0);
        Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Push endpoint, e.g. `http://loki:3100/loki/api/v1/push`
    pub url: String,
    /// Value of the `application` label
    pub application: String,
    /// Additional static labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            application: application.into(),
            labels: BTreeMap::new(),
            timeout: default_timeout(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            retry: RetryPolicy::default(),
        }
    }

    /// Labels attached to every delivery
    pub fn static_labels(&self) -> Labels {
        let mut labels = self.labels.clone();
        labels.insert("application".to_string(), self.application.clone());
        labels
    }
}

/// Delivery counters for the remote sink
#[derive(Debug, Default)]
pub struct RemoteStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteStatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl RemoteStats {
    pub fn snapshot(&self) -> RemoteStatsSnapshot {
        RemoteStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

enum RemoteCommand {
    Entry(AggregatorEntry),
    Flush,
}

pub struct RemoteSink {
    tx: mpsc::Sender<RemoteCommand>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RemoteStats>,
}

impl RemoteSink {
    /// Build the HTTP client and start the delivery task. Must be called from
    /// within a tokio runtime.
    pub fn spawn(config: RemoteConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("roster-logging/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SinkError::Setup(format!("Failed to build HTTP client: {}", e)))?;

        Self::with_client(config, client)
    }

    pub fn with_client(config: RemoteConfig, client: reqwest::Client) -> Result<Self, SinkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SinkError::Setup(format!("Remote sink needs a tokio runtime: {}", e)))?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(RemoteStats::default());

        let worker = DeliveryWorker {
            client,
            url: config.url.clone(),
            static_labels: config.static_labels(),
            timeout: config.timeout,
            retry: config.retry.clone(),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            stats: stats.clone(),
        };
        let handle = runtime.spawn(worker.run(rx, shutdown_rx));

        Ok(Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(handle)),
            stats,
        })
    }

    pub fn stats(&self) -> Arc<RemoteStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl LogSink for RemoteSink {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn write(&self, record: &FormattedRecord) -> Result<(), SinkError> {
        let entry = match record {
            FormattedRecord::Entry(entry) => entry.clone(),
            FormattedRecord::Line(_) => {
                return Err(SinkError::Unsupported {
                    sink: "remote",
                    reason: "expects an aggregator entry".to_string(),
                })
            }
        };

        if *self.shutdown.borrow() {
            return Err(SinkError::Closed);
        }

        match self.tx.try_send(RemoteCommand::Entry(entry)) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    fn flush(&self) -> Result<(), SinkError> {
        // A full queue already triggers a push
        let _ = self.tx.try_send(RemoteCommand::Flush);
        Ok(())
    }

    async fn close(&self, grace: Duration) -> Result<(), SinkError> {
        self.shutdown.send_replace(true);

        let handle = self.worker.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Remote log delivery did not finish within grace period, abandoning pending records"
                );
            }
        }
        Ok(())
    }
}

impl Drop for RemoteSink {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct DeliveryWorker {
    client: reqwest::Client,
    url: String,
    static_labels: Labels,
    timeout: Duration,
    retry: RetryPolicy,
    batch_size: usize,
    flush_interval: Duration,
    stats: Arc<RemoteStats>,
}

impl DeliveryWorker {
    async fn run(
        self,
        mut rx: mpsc::Receiver<RemoteCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut batch: Vec<AggregatorEntry> = Vec::with_capacity(self.batch_size);
        let period = self.flush_interval.max(Duration::from_millis(1));
        let mut flush_timer = interval_at(tokio::time::Instant::now() + period, period);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = flush_timer.tick() => {
                    self.deliver(&mut batch).await;
                }
                command = rx.recv() => {
                    match command {
                        Some(RemoteCommand::Entry(entry)) => {
                            batch.push(entry);
                            if batch.len() >= self.batch_size {
                                self.deliver(&mut batch).await;
                            }
                        }
                        Some(RemoteCommand::Flush) => self.deliver(&mut batch).await,
                        None => {
                            self.deliver(&mut batch).await;
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    while let Ok(command) = rx.try_recv() {
                        if let RemoteCommand::Entry(entry) = command {
                            batch.push(entry);
                            if batch.len() >= self.batch_size {
                                self.deliver(&mut batch).await;
                            }
                        }
                    }
                    self.deliver(&mut batch).await;
                    break;
                }
            }
        }

        tracing::debug!("Remote log delivery worker stopped");
    }

    async fn deliver(&self, batch: &mut Vec<AggregatorEntry>) {
        if batch.is_empty() {
            return;
        }
        let entries = std::mem::take(batch);
        let count = entries.len() as u64;
        let payload = self.build_payload(&entries);

        match self.send_with_retry(&payload).await {
            Ok(()) => {
                self.stats.delivered.fetch_add(count, Ordering::Relaxed);
            }
            Err(error) => {
                self.stats.failed.fetch_add(count, Ordering::Relaxed);
                tracing::warn!(records = count, error = %error, "Failed to deliver logs to aggregator");
            }
        }
    }

    /// Group entries into Loki streams keyed by their full label set
    fn build_payload(&self, entries: &[AggregatorEntry]) -> serde_json::Value {
        let mut streams: BTreeMap<Labels, Vec<[String; 2]>> = BTreeMap::new();

        for entry in entries {
            let mut labels = entry.labels.clone();
            labels.insert("level".to_string(), entry.level.to_lowercase());
            // static labels win over per-record metadata
            labels.extend(self.static_labels.clone());

            let timestamp = entry
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string();
            streams
                .entry(labels)
                .or_default()
                .push([timestamp, render_object(&entry.body)]);
        }

        let streams: Vec<_> = streams
            .into_iter()
            .map(|(stream, values)| json!({ "stream": stream, "values": values }))
            .collect();
        json!({ "streams": streams })
    }

    async fn send_with_retry(&self, payload: &serde_json::Value) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        let mut delay = self.retry.initial_delay;

        loop {
            attempt += 1;

            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await;

            let error = match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    let retryable = status.is_server_error() || status.as_u16() == 429;
                    let error = DeliveryError::Status(status.as_u16());
                    if !retryable {
                        return Err(error);
                    }
                    error
                }
                Err(e) if e.is_timeout() => DeliveryError::Timeout,
                Err(e) => DeliveryError::Network(e.to_string()),
            };

            if attempt >= self.retry.max_attempts.max(1) {
                return Err(error);
            }

            tracing::debug!(
                attempt,
                max_attempts = self.retry.max_attempts,
                error = %error,
                "Log push failed, retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
            delay = self.retry.next_delay(delay);
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum DeliveryError {
    #[error("aggregator responded with HTTP {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LogEvent, LogLevel};
    use crate::fields;
    use crate::formatter::AggregatorEnvelope;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry(message: &str) -> FormattedRecord {
        FormattedRecord::Entry(AggregatorEnvelope.format(&LogEvent::new(LogLevel::Info, message)))
    }

    fn test_config(server: &MockServer) -> RemoteConfig {
        let mut config = RemoteConfig::new(format!("{}/loki/api/v1/push", server.uri()), "roster");
        config.flush_interval = Duration::from_millis(20);
        config.retry.initial_delay = Duration::from_millis(10);
        config
    }

    async fn pushed_bodies(server: &MockServer) -> Vec<serde_json::Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| serde_json::from_slice(&request.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_delivers_with_static_and_extracted_labels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/loki/api/v1/push"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let sink = RemoteSink::spawn(test_config(&server)).unwrap();
        let event = LogEvent::new(LogLevel::Info, "All users shown").with_fields(fields! {
            "request_id" => "abc123",
            "loki_metadata" => json!({ "team": "core" }),
        });
        sink.write(&FormattedRecord::Entry(AggregatorEnvelope.format(&event)))
            .unwrap();
        sink.close(Duration::from_secs(5)).await.unwrap();

        let bodies = pushed_bodies(&server).await;
        assert_eq!(bodies.len(), 1);
        let stream = &bodies[0]["streams"][0];
        assert_eq!(stream["stream"]["application"], json!("roster"));
        assert_eq!(stream["stream"]["team"], json!("core"));
        assert_eq!(stream["stream"]["level"], json!("info"));

        let line: serde_json::Value =
            serde_json::from_str(stream["values"][0][1].as_str().unwrap()).unwrap();
        assert_eq!(line["request_id"], json!("abc123"));
        assert!(line.get("loki_metadata").is_none());

        assert_eq!(sink.stats().snapshot().delivered, 1);
    }

    #[tokio::test]
    async fn test_groups_streams_by_labels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.batch_size = 3;
        config.flush_interval = Duration::from_secs(60);
        let sink = RemoteSink::spawn(config).unwrap();

        sink.write(&entry("one")).unwrap();
        sink.write(&entry("two")).unwrap();
        let error = LogEvent::new(LogLevel::Error, "three");
        sink.write(&FormattedRecord::Entry(AggregatorEnvelope.format(&error)))
            .unwrap();
        sink.close(Duration::from_secs(5)).await.unwrap();

        let bodies = pushed_bodies(&server).await;
        assert_eq!(bodies.len(), 1);
        let streams = bodies[0]["streams"].as_array().unwrap();
        assert_eq!(streams.len(), 2);
        let total: usize = streams
            .iter()
            .map(|s| s["values"].as_array().unwrap().len())
            .sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let server = MockServer::start().await;
        let mut config = test_config(&server);
        config.queue_capacity = 1;
        let sink = RemoteSink::spawn(config).unwrap();

        // the current-thread runtime does not run the worker until we yield
        assert!(sink.write(&entry("kept")).is_ok());
        assert!(matches!(sink.write(&entry("lost")), Err(SinkError::QueueFull)));

        let stats = sink.stats().snapshot();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let sink = RemoteSink::spawn(test_config(&server)).unwrap();
        sink.write(&entry("eventually")).unwrap();
        sink.close(Duration::from_secs(5)).await.unwrap();

        assert_eq!(pushed_bodies(&server).await.len(), 2);
        let stats = sink.stats().snapshot();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let sink = RemoteSink::spawn(test_config(&server)).unwrap();
        sink.write(&entry("rejected")).unwrap();
        sink.close(Duration::from_secs(5)).await.unwrap();

        assert_eq!(pushed_bodies(&server).await.len(), 1);
        assert_eq!(sink.stats().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.timeout = Duration::from_millis(100);
        config.retry = RetryPolicy::no_retry();
        let sink = RemoteSink::spawn(config).unwrap();

        let started = Instant::now();
        sink.write(&entry("slow")).unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));

        sink.close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(sink.stats().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_close_abandons_after_grace() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let sink = RemoteSink::spawn(test_config(&server)).unwrap();
        sink.write(&entry("never")).unwrap();

        let started = Instant::now();
        sink.close(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(matches!(sink.write(&entry("late")), Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn test_rejects_plain_lines() {
        let server = MockServer::start().await;
        let sink = RemoteSink::spawn(test_config(&server)).unwrap();
        let result = sink.write(&FormattedRecord::Line("{}".into()));
        assert!(matches!(result, Err(SinkError::Unsupported { .. })));
    }

    #[test]
    fn test_spawn_requires_runtime() {
        let config = RemoteConfig::new("http://localhost:3100/loki/api/v1/push", "roster");
        assert!(matches!(RemoteSink::spawn(config), Err(SinkError::Setup(_))));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            backoff_multiplier: 2.0,
        };
        let second = policy.next_delay(policy.initial_delay);
        assert_eq!(second, Duration::from_secs(2));
        assert_eq!(policy.next_delay(second), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_overflow_saturates() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.0e30,
        };
        assert_eq!(policy.next_delay(policy.initial_delay), Duration::from_secs(10));

        let policy = RetryPolicy {
            backoff_multiplier: f64::INFINITY,
            ..policy
        };
        assert_eq!(policy.next_delay(Duration::from_secs(1)), Duration::from_secs(10));

        let policy = RetryPolicy {
            backoff_multiplier: f64::NAN,
            ..policy
        };
        assert_eq!(policy.next_delay(Duration::from_secs(1)), Duration::from_secs(1));
    }
}
