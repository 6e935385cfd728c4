use super::*;
use crate::config::TurnConfig;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn config() -> TurnConfig {
    TurnConfig::default()
}

struct Harness {
    tracker: TurnTracker,
    t0: Instant,
}

impl Harness {
    fn new(config: TurnConfig) -> Self {
        Self {
            tracker: TurnTracker::new(&config),
            t0: Instant::now(),
        }
    }

    fn at(&self, offset: u64) -> Instant {
        self.t0 + ms(offset)
    }

    fn send(&mut self, input: TurnInput) -> TurnDecision {
        self.tracker.handle(input)
    }

    /// Response `id` starts at `start` and its audio is fully produced at `audio_done`.
    fn ai_turn(&mut self, id: &str, start: u64, audio_done: u64) {
        self.send(TurnInput::ResponseStarted {
            at: self.at(start),
            response_id: id.to_string(),
        });
        self.send(TurnInput::ResponseAudio {
            at: self.at(start + 10),
            response_id: id.to_string(),
        });
        self.send(TurnInput::ResponseAudioDone {
            at: self.at(audio_done),
            response_id: id.to_string(),
        });
        self.send(TurnInput::ResponseDone {
            at: self.at(audio_done),
            response_id: id.to_string(),
        });
    }

    fn drained(&mut self, at: u64) -> TurnDecision {
        self.send(TurnInput::PlaybackDrained { at: self.at(at) })
    }

    fn voice_started(&mut self, at: u64) -> TurnDecision {
        self.send(TurnInput::VoiceStarted {
            at: self.at(at),
            source: VoiceSource::Local,
        })
    }

    /// Voiced frames every 20ms in `[from, to)`.
    fn speak(&mut self, from: u64, to: u64, energy_db: f32) -> Vec<TurnDecision> {
        let mut decisions = vec![];
        let mut ts = from;
        while ts < to {
            let d = self.send(TurnInput::VoiceFrame {
                at: self.at(ts),
                energy_db,
                is_voice: true,
            });
            if d != TurnDecision::None {
                decisions.push(d);
            }
            ts += 20;
        }
        decisions
    }

    fn transcript(&mut self, at: u64, text: &str, confidence: Option<f32>) -> TurnDecision {
        self.send(TurnInput::UserTranscript {
            at: self.at(at),
            text: text.to_string(),
            confidence,
            is_final: true,
        })
    }

    /// Greeting plays for one second and drains; the second response is in flight.
    fn past_greeting_mid_response(&mut self) {
        self.ai_turn("greeting", 0, 500);
        self.drained(1000);
        assert!(!self.tracker.greeting_protected());
        self.send(TurnInput::ResponseStarted {
            at: self.at(3000),
            response_id: "resp-2".to_string(),
        });
        self.send(TurnInput::ResponseAudio {
            at: self.at(3010),
            response_id: "resp-2".to_string(),
        });
        assert_eq!(self.tracker.state(), TurnState::AiSpeaking);
    }
}

#[test]
fn test_user_speech_from_silence() {
    let mut h = Harness::new(config());
    assert_eq!(
        h.voice_started(100),
        TurnDecision::Floor {
            from: TurnState::Silence,
            to: TurnState::UserSpeaking
        }
    );
    let stopped = h.send(TurnInput::VoiceStopped {
        at: h.at(900),
        source: VoiceSource::Local,
    });
    assert_eq!(
        stopped,
        TurnDecision::Floor {
            from: TurnState::UserSpeaking,
            to: TurnState::Silence
        }
    );
}

#[test]
fn test_echo_guard_rejects_trigger_after_ai_audio() {
    let mut h = Harness::new(config());
    h.ai_turn("greeting", 0, 500);
    h.drained(1000);
    assert_eq!(h.tracker.state(), TurnState::Silence);

    for offset in [0, 100, 349] {
        assert_eq!(
            h.voice_started(1000 + offset),
            TurnDecision::Rejected(RejectReason::EchoGuard)
        );
        assert_eq!(h.tracker.state(), TurnState::Silence);
    }
    assert!(matches!(
        h.voice_started(1350),
        TurnDecision::Floor {
            to: TurnState::UserSpeaking,
            ..
        }
    ));
}

#[test]
fn test_echo_guard_window_is_configurable() {
    let mut h = Harness::new(TurnConfig {
        echo_guard_ms: 100,
        ..config()
    });
    h.ai_turn("greeting", 0, 500);
    h.drained(600);
    assert_eq!(
        h.voice_started(650),
        TurnDecision::Rejected(RejectReason::EchoGuard)
    );
    assert_eq!(h.tracker.state(), TurnState::Silence);
    assert!(matches!(h.voice_started(720), TurnDecision::Floor { .. }));
}

#[test]
fn test_greeting_is_protected_until_audio_finished_and_played() {
    let mut h = Harness::new(config());
    h.send(TurnInput::ResponseStarted {
        at: h.at(0),
        response_id: "greeting".to_string(),
    });
    h.send(TurnInput::ResponseAudio {
        at: h.at(10),
        response_id: "greeting".to_string(),
    });
    assert!(h.tracker.greeting_protected());
    assert_eq!(
        h.voice_started(800),
        TurnDecision::Rejected(RejectReason::GreetingProtected)
    );
    h.speak(800, 2000, -10.0);
    h.transcript(2000, "hello there can you hear me", Some(0.99));
    assert_eq!(h.tracker.state(), TurnState::AiSpeaking);
    assert_eq!(h.tracker.interruptions(), 0);

    // backend done producing, caller still hearing the tail
    h.send(TurnInput::ResponseAudioDone {
        at: h.at(2500),
        response_id: "greeting".to_string(),
    });
    assert!(h.tracker.greeting_protected());
    assert_eq!(
        h.voice_started(3000),
        TurnDecision::Rejected(RejectReason::GreetingProtected)
    );

    h.send(TurnInput::ResponseDone {
        at: h.at(2500),
        response_id: "greeting".to_string(),
    });
    h.drained(4000);
    assert!(!h.tracker.greeting_protected());
    assert_eq!(h.tracker.state(), TurnState::Silence);
}

#[test]
fn test_interruption_honored_after_greeting() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();

    assert_eq!(h.voice_started(4000), TurnDecision::None);
    assert!(h.tracker.has_candidate());
    assert!(h.speak(4000, 4600, -12.0).is_empty());
    let decision = h.transcript(4620, "hold on", Some(0.95));
    assert_eq!(
        decision,
        TurnDecision::Interrupt {
            response_id: Some("resp-2".to_string())
        }
    );
    assert_eq!(h.tracker.state(), TurnState::Interrupted);
    assert!(h.tracker.is_cancelled("resp-2"));

    assert_eq!(
        h.tracker.interruption_applied(h.at(4625)),
        TurnDecision::Floor {
            from: TurnState::Interrupted,
            to: TurnState::UserSpeaking
        }
    );
    // late audio of the cancelled response does not take the floor back
    h.send(TurnInput::ResponseAudio {
        at: h.at(4630),
        response_id: "resp-2".to_string(),
    });
    assert_eq!(h.tracker.state(), TurnState::UserSpeaking);
}

#[test]
fn test_short_utterance_rejected() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();
    h.voice_started(4000);
    h.speak(4000, 4200, -12.0);
    h.send(TurnInput::VoiceStopped {
        at: h.at(4200),
        source: VoiceSource::Local,
    });
    let decision = h.transcript(4400, "uh huh", Some(0.9));
    assert_eq!(decision, TurnDecision::Rejected(RejectReason::TooShort));
    assert_eq!(h.tracker.state(), TurnState::AiSpeaking);
    assert!(!h.tracker.has_candidate());
}

#[test]
fn test_quiet_utterance_rejected() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();
    h.voice_started(4000);
    // floor starts at -55, margin is 6dB
    h.speak(4000, 5000, -52.0);
    h.send(TurnInput::VoiceStopped {
        at: h.at(5000),
        source: VoiceSource::Local,
    });
    let decision = h.transcript(5100, "this is a background television", Some(0.9));
    assert_eq!(decision, TurnDecision::Rejected(RejectReason::TooQuiet));
    assert_eq!(h.tracker.state(), TurnState::AiSpeaking);
}

#[test]
fn test_single_word_rejected_unless_acknowledgement() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();
    h.voice_started(4000);
    h.speak(4000, 4800, -12.0);
    h.send(TurnInput::VoiceStopped {
        at: h.at(4800),
        source: VoiceSource::Local,
    });
    assert_eq!(
        h.transcript(4900, "um", Some(0.99)),
        TurnDecision::Rejected(RejectReason::TooFewWords)
    );
    assert_eq!(h.tracker.state(), TurnState::AiSpeaking);
}

#[test]
fn test_short_acknowledgement_at_high_energy_accepted() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();
    h.voice_started(4000);
    // 200ms, 40dB above the floor
    h.speak(4000, 4200, -15.0);
    let decision = h.transcript(4250, "Stop!", Some(0.92));
    assert!(matches!(decision, TurnDecision::Interrupt { .. }));
}

#[test]
fn test_acknowledgement_with_low_confidence_rejected() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();
    h.voice_started(4000);
    h.speak(4000, 4200, -15.0);
    h.send(TurnInput::VoiceStopped {
        at: h.at(4200),
        source: VoiceSource::Local,
    });
    assert_eq!(
        h.transcript(4250, "stop", Some(0.4)),
        TurnDecision::Rejected(RejectReason::TooFewWords)
    );
}

#[test]
fn test_candidate_expires_without_transcript() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();
    h.voice_started(4000);
    h.speak(4000, 4700, -12.0);
    assert_eq!(
        h.tracker.poll(h.at(4000 + 2500)),
        TurnDecision::Rejected(RejectReason::ValidationTimeout)
    );
    assert!(!h.tracker.has_candidate());
    assert_eq!(h.tracker.state(), TurnState::AiSpeaking);
}

#[test]
fn test_debounce_after_interruption() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();
    h.voice_started(4000);
    h.speak(4000, 4600, -12.0);
    assert!(matches!(
        h.transcript(4600, "wait a second", None),
        TurnDecision::Interrupt { .. }
    ));
    h.tracker.interruption_applied(h.at(4600));
    h.send(TurnInput::VoiceStopped {
        at: h.at(4800),
        source: VoiceSource::Local,
    });
    assert_eq!(h.tracker.state(), TurnState::Silence);
    assert_eq!(
        h.voice_started(5000),
        TurnDecision::Rejected(RejectReason::Debounce)
    );
    assert!(matches!(h.voice_started(5300), TurnDecision::Floor { .. }));
}

#[test]
fn test_candidate_dropped_when_playback_drains() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();
    h.send(TurnInput::ResponseAudioDone {
        at: h.at(3500),
        response_id: "resp-2".to_string(),
    });
    h.send(TurnInput::ResponseDone {
        at: h.at(3500),
        response_id: "resp-2".to_string(),
    });
    assert_eq!(h.tracker.state(), TurnState::AiSpeaking);
    h.voice_started(4000);
    assert!(h.tracker.has_candidate());
    assert_eq!(
        h.drained(4100),
        TurnDecision::Floor {
            from: TurnState::AiSpeaking,
            to: TurnState::Silence
        }
    );
    assert!(!h.tracker.has_candidate());
}

#[test]
fn test_ambient_floor_raises_energy_bar() {
    let mut h = Harness::new(config());
    h.past_greeting_mid_response();
    // noisy line: background settles near -30dB
    for i in 0..300u64 {
        h.send(TurnInput::VoiceFrame {
            at: h.at(3020 + i),
            energy_db: -30.0,
            is_voice: false,
        });
    }
    assert!(h.tracker.ambient_floor_db() > -31.0);
    h.voice_started(4000);
    h.speak(4000, 4800, -27.0);
    h.send(TurnInput::VoiceStopped {
        at: h.at(4800),
        source: VoiceSource::Local,
    });
    assert_eq!(
        h.transcript(4900, "some chatter in the room", Some(0.9)),
        TurnDecision::Rejected(RejectReason::TooQuiet)
    );
}

#[test]
fn test_greeting_protection_disabled() {
    let mut h = Harness::new(TurnConfig {
        protect_greeting: false,
        ..config()
    });
    h.send(TurnInput::ResponseStarted {
        at: h.at(0),
        response_id: "greeting".to_string(),
    });
    h.send(TurnInput::ResponseAudio {
        at: h.at(10),
        response_id: "greeting".to_string(),
    });
    assert!(!h.tracker.greeting_protected());
    assert_eq!(h.voice_started(500), TurnDecision::None);
    h.speak(500, 1100, -12.0);
    assert!(matches!(
        h.transcript(1100, "sorry who is this", Some(0.9)),
        TurnDecision::Interrupt { .. }
    ));
}
