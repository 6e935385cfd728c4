use crate::{
    config::{CallRecordConfig, WebhookDestination},
    CallDirection,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod summary;

pub use summary::{OpenAiSummarizer, Summarizer};

pub type CallRecordSender = tokio::sync::mpsc::UnboundedSender<CallRecord>;
pub type CallRecordReceiver = tokio::sync::mpsc::UnboundedReceiver<CallRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptLine {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    NoAnswer,
    Busy,
    Failed,
    Canceled,
}

/// The "call completed" notification body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub tenant_id: String,
    pub call_id: String,
    pub direction: CallDirection,
    pub caller: Option<String>,
    pub callee: Option<String>,
    pub job_id: Option<String>,
    pub transcript: Vec<TranscriptLine>,
    pub summary: Option<String>,
    pub extracted_fields: HashMap<String, serde_json::Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: u64,
    pub outcome: CallOutcome,
    pub hangup_reason: Option<String>,
    pub interruptions: u32,
    pub nudges: u32,
}

impl CallRecord {
    pub fn transcript_text(&self) -> String {
        self.transcript
            .iter()
            .map(|line| {
                let who = match line.speaker {
                    Speaker::Caller => "Caller",
                    Speaker::Agent => "Agent",
                };
                format!("{}: {}", who, line.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, destination: &WebhookDestination, record: &CallRecord) -> Result<()>;
}

pub struct HttpDeliverer {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDeliverer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, destination: &WebhookDestination, record: &CallRecord) -> Result<()> {
        let mut request = self
            .client
            .post(&destination.url)
            .json(record)
            .timeout(self.timeout);
        if let Some(headers) = &destination.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "webhook {} failed with status: {} - {}",
                destination.url,
                response.status(),
                response.text().await.unwrap_or_default()
            ))
        }
    }
}

/// How long a delivered (call id, destination) pair keeps suppressing
/// duplicates.
const DELIVERY_RETENTION: Duration = Duration::from_secs(3600);

/// (call id, destination url) pairs attempted within the retention window.
struct DeliveryLedger {
    retention: Duration,
    attempted: Mutex<HashMap<(String, String), Instant>>,
}

impl Default for DeliveryLedger {
    fn default() -> Self {
        Self::new(DELIVERY_RETENTION)
    }
}

impl DeliveryLedger {
    fn new(retention: Duration) -> Self {
        Self {
            retention,
            attempted: Mutex::new(HashMap::new()),
        }
    }

    /// True for the first claim of a pair only. Expired pairs are pruned
    /// here, so the ledger never outgrows one retention window of calls.
    fn claim(&self, call_id: &str, url: &str, now: Instant) -> bool {
        let mut attempted = self.attempted.lock().unwrap_or_else(PoisonError::into_inner);
        attempted.retain(|_, at| now.saturating_duration_since(*at) < self.retention);
        let key = (call_id.to_string(), url.to_string());
        if attempted.contains_key(&key) {
            return false;
        }
        attempted.insert(key, now);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct CallRecordManager {
    pub sender: CallRecordSender,
    config: Arc<CallRecordConfig>,
    cancel_token: CancellationToken,
    receiver: CallRecordReceiver,
    deliverer: Arc<dyn Deliverer>,
    summarizer: Option<Arc<dyn Summarizer>>,
    ledger: Arc<DeliveryLedger>,
}

pub struct CallRecordManagerBuilder {
    pub cancel_token: Option<CancellationToken>,
    pub config: Option<CallRecordConfig>,
    deliverer: Option<Arc<dyn Deliverer>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl Default for CallRecordManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRecordManagerBuilder {
    pub fn new() -> Self {
        Self {
            cancel_token: None,
            config: None,
            deliverer: None,
            summarizer: None,
        }
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_config(mut self, config: CallRecordConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_deliverer(mut self, deliverer: Arc<dyn Deliverer>) -> Self {
        self.deliverer = Some(deliverer);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn build(self) -> CallRecordManager {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let config = Arc::new(self.config.unwrap_or_default());
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let deliverer = self.deliverer.unwrap_or_else(|| {
            Arc::new(HttpDeliverer::new(Duration::from_secs(
                config.timeout_secs.max(1),
            )))
        });
        info!(
            inbound = config.inbound.len(),
            outbound = config.outbound.len(),
            "CallRecordManager configured"
        );
        CallRecordManager {
            sender,
            config,
            cancel_token,
            receiver,
            deliverer,
            summarizer: self.summarizer,
            ledger: Arc::new(DeliveryLedger::default()),
        }
    }
}

impl CallRecordManager {
    pub async fn serve(&mut self) {
        let token = self.cancel_token.clone();
        select! {
            _ = self.cancel_token.cancelled() => {
                info!("CallRecordManager cancelled");
            }
            _ = Self::recv_loop(
                token,
                self.config.clone(),
                self.deliverer.clone(),
                self.summarizer.clone(),
                self.ledger.clone(),
                &mut self.receiver,
            ) => {
                info!("CallRecordManager received done");
            }
        }
    }

    async fn recv_loop(
        cancel_token: CancellationToken,
        config: Arc<CallRecordConfig>,
        deliverer: Arc<dyn Deliverer>,
        summarizer: Option<Arc<dyn Summarizer>>,
        ledger: Arc<DeliveryLedger>,
        receiver: &mut CallRecordReceiver,
    ) -> Result<()> {
        while let Some(record) = receiver.recv().await {
            let token = cancel_token.clone();
            let config = config.clone();
            let deliverer = deliverer.clone();
            let summarizer = summarizer.clone();
            let ledger = ledger.clone();
            tokio::spawn(async move {
                select! {
                    _ = token.cancelled() => {
                        info!("CallRecordManager cancelled");
                    }
                    _ = Self::process(config, deliverer, summarizer, ledger, record) => {}
                }
            });
        }
        Ok(())
    }

    async fn process(
        config: Arc<CallRecordConfig>,
        deliverer: Arc<dyn Deliverer>,
        summarizer: Option<Arc<dyn Summarizer>>,
        ledger: Arc<DeliveryLedger>,
        mut record: CallRecord,
    ) {
        let destinations = match record.direction {
            CallDirection::Inbound => &config.inbound,
            CallDirection::Outbound => &config.outbound,
        };
        if destinations.is_empty() {
            return;
        }
        if record.summary.is_none() && !record.transcript.is_empty() {
            if let Some(summarizer) = &summarizer {
                match summarizer.summarize(&record).await {
                    Ok(summary) => record.summary = Some(summary),
                    Err(e) => warn!(call_id = record.call_id, "summary failed: {}", e),
                }
            }
        }
        let direction = record.direction.to_string();
        for destination in destinations {
            if !ledger.claim(&record.call_id, &destination.url, Instant::now()) {
                info!(
                    call_id = record.call_id,
                    url = destination.url,
                    "call record already delivered, skipping"
                );
                crate::metrics::callrecord::duplicate_suppressed();
                continue;
            }
            match deliverer.deliver(destination, &record).await {
                Ok(_) => {
                    info!(
                        call_id = record.call_id,
                        url = destination.url,
                        "call record delivered"
                    );
                    crate::metrics::callrecord::delivered(&direction, true);
                }
                Err(e) => {
                    error!(
                        call_id = record.call_id,
                        url = destination.url,
                        "failed to deliver call record: {}",
                        e
                    );
                    crate::metrics::callrecord::delivered(&direction, false);
                }
            }
        }
    }
}
