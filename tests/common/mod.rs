#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use voicebridge::{
    backend::mock::MockSession,
    config::Config,
    media::{
        codecs::{create_encoder, CodecType},
        pacer::MediaSink,
        vad::VadType,
    },
};

#[derive(Debug, PartialEq)]
pub enum SinkEvent {
    Media(Bytes),
    Clear,
    Closed,
}

/// Telephony leg that reports every write on a channel.
pub struct ChannelSink(pub mpsc::UnboundedSender<SinkEvent>);

#[async_trait]
impl MediaSink for ChannelSink {
    async fn send_media(&mut self, payload: Bytes) -> anyhow::Result<()> {
        self.0.send(SinkEvent::Media(payload)).ok();
        Ok(())
    }

    async fn send_clear(&mut self) -> anyhow::Result<()> {
        self.0.send(SinkEvent::Clear).ok();
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.0.send(SinkEvent::Closed).ok();
        Ok(())
    }
}

pub struct NullSink;

#[async_trait]
impl MediaSink for NullSink {
    async fn send_media(&mut self, _payload: Bytes) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_clear(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.media.vad.r#type = VadType::Energy;
    config.backend.max_retries = 0;
    config.metrics.enabled = false;
    config
}

/// One 20ms µ-law frame of a loud tone.
pub fn loud_frame() -> Bytes {
    let samples: Vec<i16> = (0..160)
        .map(|i| ((i as f32 * 0.35).sin() * 8000.0) as i16)
        .collect();
    Bytes::from(create_encoder(CodecType::PCMU, 8000).encode(&samples))
}

/// Keep a mock backend session open, ignoring what it is told, until the
/// call closes its command channel.
pub fn drain_session(mut session: MockSession) {
    tokio::spawn(async move {
        while session.commands.recv().await.is_some() {}
    });
}

pub async fn next_media(sink_rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> Bytes {
    loop {
        match sink_rx.recv().await {
            Some(SinkEvent::Media(payload)) => return payload,
            Some(_) => continue,
            None => panic!("sink closed"),
        }
    }
}
