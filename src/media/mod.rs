pub mod codecs;
pub mod pacer;
pub mod queue;
pub mod transport;
pub mod vad;
