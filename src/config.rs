use crate::media::{codecs::CodecType, vad::VadOption};
use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "voicebridge.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub media: MediaConfig,
    pub turn: TurnConfig,
    pub lifecycle: LifecycleConfig,
    pub backend: BackendConfig,
    pub slots: SlotConfig,
    pub dialer: DialerConfig,
    pub callrecord: CallRecordConfig,
    pub summary: Option<SummaryConfig>,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MediaConfig {
    pub ptime_ms: u64,
    pub telephony_codec: CodecType,
    pub telephony_sample_rate: u32,
    pub backend_sample_rate: u32,
    /// Outbound frame queue capacity, in frames
    pub queue_capacity: usize,
    /// Fraction of capacity the queue is trimmed down to on overflow
    pub overflow_watermark: f32,
    pub blocked_write_threshold_ms: u64,
    pub vad: VadOption,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TurnConfig {
    pub echo_guard_ms: u64,
    pub min_utterance_ms: u64,
    pub min_words: usize,
    /// Candidate mean energy must exceed the ambient floor by this much
    pub energy_margin_db: f32,
    /// Margin that counts as "high energy" for short acknowledgements
    pub high_energy_margin_db: f32,
    pub ack_confidence: f32,
    pub ack_phrases: Vec<String>,
    pub debounce_ms: u64,
    pub validation_window_ms: u64,
    pub ambient_floor_db: f32,
    pub protect_greeting: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub silence_timeout_secs: u64,
    pub max_nudges: u32,
    pub nudge_cooldown_secs: u64,
    pub nudge_instructions: String,
    pub closing_phrases: Vec<String>,
    pub closing_grace_ms: u64,
    pub poll_interval_ms: u64,
    /// How long the telephony leg may take to send its start event
    pub start_timeout_secs: u64,
    /// How long a dialed outbound call may take to connect its media stream
    pub dial_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub greeting_instructions: Option<String>,
    pub transcription_model: Option<String>,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub fallback_audio: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotStoreConfig {
    Memory,
    Sqlite { path: String },
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SlotConfig {
    pub max_slots: usize,
    pub tenant_max_slots: HashMap<String, usize>,
    pub token_ttl_secs: u64,
    pub waiter_poll_ms: u64,
    pub reap_interval_secs: u64,
    pub store: SlotStoreConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DialerConfig {
    pub enabled: bool,
    pub worker_id: Option<String>,
    /// sqlite database path, `:memory:` keeps runs in process memory
    pub database: String,
    pub poll_interval_ms: u64,
    pub run_heartbeat_ttl_secs: u64,
    pub reclaim_interval_secs: u64,
    pub max_runs_per_worker: usize,
    pub dial_url: Option<String>,
    pub hangup_url: Option<String>,
    pub from_number: Option<String>,
    pub stream_url: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct WebhookDestination {
    pub url: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CallRecordConfig {
    pub inbound: Vec<WebhookDestination>,
    pub outbound: Vec<WebhookDestination>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SummaryConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            media: MediaConfig::default(),
            turn: TurnConfig::default(),
            lifecycle: LifecycleConfig::default(),
            backend: BackendConfig::default(),
            slots: SlotConfig::default(),
            dialer: DialerConfig::default(),
            callrecord: CallRecordConfig::default(),
            summary: None,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ptime_ms: 20,
            telephony_codec: CodecType::PCMU,
            telephony_sample_rate: 8000,
            backend_sample_rate: 24000,
            queue_capacity: 250,
            overflow_watermark: 0.6,
            blocked_write_threshold_ms: 10,
            vad: VadOption::default(),
        }
    }
}

impl MediaConfig {
    pub fn ptime(&self) -> Duration {
        Duration::from_millis(self.ptime_ms.max(1))
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            echo_guard_ms: 350,
            min_utterance_ms: 500,
            min_words: 2,
            energy_margin_db: 6.0,
            high_energy_margin_db: 15.0,
            ack_confidence: 0.85,
            ack_phrases: ["yes", "no", "yeah", "ok", "okay", "stop", "wait", "sure", "nope"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            debounce_ms: 600,
            validation_window_ms: 2500,
            ambient_floor_db: -55.0,
            protect_greeting: true,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            silence_timeout_secs: 20,
            max_nudges: 1,
            nudge_cooldown_secs: 5,
            nudge_instructions:
                "The caller has been silent. Briefly ask whether they are still there.".to_string(),
            closing_phrases: ["goodbye", "good bye", "bye now", "have a great day"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            closing_grace_ms: 400,
            poll_interval_ms: 200,
            start_timeout_secs: 10,
            dial_timeout_secs: 90,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            api_key: None,
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            instructions: "You are a helpful phone assistant. Keep answers short.".to_string(),
            greeting_instructions: Some("Greet the caller and ask how you can help.".to_string()),
            transcription_model: Some("whisper-1".to_string()),
            max_retries: 3,
            retry_backoff_ms: 500,
            fallback_audio: None,
        }
    }
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            max_slots: 3,
            tenant_max_slots: HashMap::new(),
            token_ttl_secs: 600,
            waiter_poll_ms: 250,
            reap_interval_secs: 30,
            store: SlotStoreConfig::Memory,
        }
    }
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_id: None,
            database: ":memory:".to_string(),
            poll_interval_ms: 1000,
            run_heartbeat_ttl_secs: 300,
            reclaim_interval_secs: 60,
            max_runs_per_worker: 4,
            dial_url: None,
            hangup_url: None,
            from_number: None,
            stream_url: None,
            auth_token: None,
        }
    }
}

impl Default for CallRecordConfig {
    fn default() -> Self {
        Self {
            inbound: vec![],
            outbound: vec![],
            timeout_secs: 10,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn worker_id(&self) -> String {
        self.dialer
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            http_addr = "127.0.0.1:9000"

            [turn]
            echo_guard_ms = 400

            [slots]
            max_slots = 5
            store = { type = "sqlite", path = "/tmp/slots.db" }

            [[callrecord.inbound]]
            url = "http://crm.local/inbound"
            "#,
        )
        .unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:9000");
        assert_eq!(config.turn.echo_guard_ms, 400);
        assert_eq!(config.turn.min_utterance_ms, 500);
        assert_eq!(config.lifecycle.silence_timeout_secs, 20);
        assert_eq!(config.slots.max_slots, 5);
        assert!(matches!(config.slots.store, SlotStoreConfig::Sqlite { .. }));
        assert_eq!(config.callrecord.inbound.len(), 1);
        assert!(config.callrecord.outbound.is_empty());
        assert_eq!(config.media.telephony_codec, CodecType::PCMU);
    }

    #[test]
    fn test_webhook_destination_headers() {
        let config: CallRecordConfig = toml::from_str(
            r#"
            [[outbound]]
            url = "http://crm.local/outbound"
            headers = { Authorization = "Bearer abc" }
            "#,
        )
        .unwrap();
        let destination = &config.outbound[0];
        assert_eq!(
            destination
                .headers
                .as_ref()
                .and_then(|h| h.get("Authorization"))
                .map(String::as_str),
            Some("Bearer abc")
        );
        assert_eq!(destination.clone(), *destination);
    }

    #[test]
    fn test_codec_names() {
        let media: MediaConfig = toml::from_str(r#"telephony_codec = "pcma""#).unwrap();
        assert_eq!(media.telephony_codec, CodecType::PCMA);
        assert_eq!(media.ptime(), Duration::from_millis(20));
    }
}
