use serde::{Deserialize, Serialize};

pub mod app;
pub mod backend;
pub mod call;
pub mod callrecord;
pub mod config;
pub mod dialer;
pub mod handler;
pub mod media;
pub mod metrics;
pub mod slots;
pub mod turn;

pub type CallId = String;
pub type TenantId = String;
pub type Sample = i16;
pub type PcmBuf = Vec<Sample>;

/// One fixed-duration chunk of linear PCM audio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioFrame {
    pub samples: PcmBuf,
    /// Milliseconds since the start of the stream this frame belongs to.
    pub timestamp: u64,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: PcmBuf, timestamp: u64, sample_rate: u32) -> Self {
        Self {
            samples,
            timestamp,
            sample_rate,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl std::fmt::Display for CallDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallDirection::Inbound => write!(f, "inbound"),
            CallDirection::Outbound => write!(f, "outbound"),
        }
    }
}

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
