//! Forwarding of timed events to an external synthesizer.
//!
//! Every event becomes one `/dirt/play` message inside a bundle whose time
//! tag is the event's absolute deadline (transport epoch + begin / cps), so
//! the target can schedule it sample-accurately regardless of network jitter.
//!
//! Delivery is best effort. Late events, events arriving while the transport
//! is stopped, and failed sends are dropped without retry; the next cycle's
//! events supersede them.

use crate::osc::OscTarget;
use crate::transport::{system_time_to_osc, SharedTransport};
use rosc::OscType;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};

/// OSC address understood by SuperDirt-style targets.
pub const PLAY_ADDRESS: &str = "/dirt/play";

/// Octave assumed for note names without one (`"c"` is `c3`).
pub const DEFAULT_OCTAVE: i64 = 3;

pub type ControlMap = Map<String, Value>;

/// One scheduled occurrence produced by the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    /// Start, in cycles.
    pub begin: f64,
    /// End, in cycles.
    pub end: f64,
    pub value: ControlMap,
}

impl TimedEvent {
    pub fn new(begin: f64, end: f64, value: ControlMap) -> Self {
        Self { begin, end, value }
    }

    /// Length in cycles.
    pub fn duration(&self) -> f64 {
        self.end - self.begin
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// "host:port" of the external synth
    pub target: String,
    /// Added to every time tag
    pub latency: Duration,
    /// Log dropped events
    pub debug: bool,
}

/// What happened to a forwarded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Sent,
    /// No external target is bound.
    Disabled,
    /// The transport is not playing.
    Stopped,
    /// The deadline already passed.
    Late,
    /// Encoding or sending failed.
    Failed,
}

pub struct EventRelay {
    target: OscTarget,
    transport: SharedTransport,
    latency: Duration,
    debug: bool,
}

impl EventRelay {
    /// Relay for `config`, or a disabled relay when `config` is `None` or the
    /// socket cannot be created.
    pub fn new(config: Option<&RelayConfig>, transport: SharedTransport) -> Self {
        let Some(config) = config else {
            return Self::with_target(OscTarget::unbound(), transport, Duration::ZERO, false);
        };
        let target = match OscTarget::bind(config.target.clone()) {
            Ok(target) => {
                log::info!("[RELAY] Forwarding events to {}", config.target);
                target
            }
            Err(e) => {
                log::warn!("[RELAY] Cannot open OSC socket, relay disabled: {}", e);
                OscTarget::unbound()
            }
        };
        Self::with_target(target, transport, config.latency, config.debug)
    }

    pub fn with_target(
        target: OscTarget,
        transport: SharedTransport,
        latency: Duration,
        debug: bool,
    ) -> Self {
        Self {
            target,
            transport,
            latency,
            debug,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_bound()
    }

    /// Send one event. Never fails; the outcome is informational.
    pub fn forward(&self, event: &TimedEvent) -> RelayOutcome {
        if !self.target.is_bound() {
            return RelayOutcome::Disabled;
        }

        let (playing, cps, deadline) = self.transport.with(|clock| {
            (clock.is_playing(), clock.cps(), clock.deadline(event.begin))
        });
        if !playing {
            return self.dropped(RelayOutcome::Stopped, event);
        }
        if deadline < SystemTime::now() {
            return self.dropped(RelayOutcome::Late, event);
        }

        let controls = control_map(event, cps);
        let message = OscTarget::msg(PLAY_ADDRESS, osc_args(&controls));
        let timetag = system_time_to_osc(deadline + self.latency);
        match self.target.send_bundle(timetag, vec![message]) {
            Ok(()) => RelayOutcome::Sent,
            Err(e) => {
                if self.debug {
                    log::debug!("[RELAY] Send to {} failed: {}", self.target.addr, e);
                }
                RelayOutcome::Failed
            }
        }
    }

    fn dropped(&self, outcome: RelayOutcome, event: &TimedEvent) -> RelayOutcome {
        if self.debug {
            log::debug!(
                "[RELAY] Dropped event at cycle {:.3} ({:?})",
                event.begin,
                outcome
            );
        }
        outcome
    }

    /// Drain `events` until the channel closes or `shutdown` flips to true.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<TimedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            self.forward(&event);
                        }
                        None => break,
                    }
                }
            }
        }
        log::debug!("[RELAY] Event stream closed");
    }
}

/// Flatten an event into the control map sent to the target.
///
/// Transport fields (`cps`, `cycle`, `delta`) come first and are overridden
/// by the event's own controls of the same name.
pub fn control_map(event: &TimedEvent, cps: f64) -> ControlMap {
    let mut controls = ControlMap::new();
    controls.insert("cps".to_string(), number(cps));
    controls.insert("cycle".to_string(), number(event.begin));
    controls.insert("delta".to_string(), number(event.duration() / cps));
    for (key, value) in &event.value {
        controls.insert(key.clone(), value.clone());
    }

    if let Some(n) = controls.get("n").and_then(parse_numeral) {
        controls.insert("n".to_string(), number(n));
    }

    if let Some(Value::String(name)) = controls.get("note").cloned() {
        let octave = controls
            .get("octave")
            .and_then(Value::as_f64)
            .map(|o| o as i64)
            .unwrap_or(DEFAULT_OCTAVE);
        match note_to_midi(&name, octave) {
            Some(midi) => {
                controls.insert("note".to_string(), number(midi as f64));
            }
            None => log::debug!("[RELAY] Not a note name: {}", name),
        }
    }

    let banked = match (controls.get("bank"), controls.get("s")) {
        (Some(Value::String(bank)), Some(Value::String(sound))) => {
            Some(format!("{}_{}", bank, sound))
        }
        _ => None,
    };
    if let Some(sound) = banked {
        controls.insert("s".to_string(), Value::String(sound));
    }

    if let Some(size) = controls.get("roomsize").and_then(parse_numeral) {
        controls.insert("size".to_string(), number(size));
    }

    let cycle_unit = matches!(
        controls.get("unit").and_then(Value::as_str),
        Some("c") | Some("cycles")
    );
    if cycle_unit {
        if let Some(speed) = controls.get("speed").and_then(Value::as_f64) {
            controls.insert("speed".to_string(), number(speed / cps));
        }
    }

    let channels = controls
        .get("channels")
        .filter(|c| !c.is_string())
        .map(|c| c.to_string());
    if let Some(encoded) = channels {
        controls.insert("channels".to_string(), Value::String(encoded));
    }

    controls
}

/// Alternating key / value OSC arguments: strings as `s`, everything
/// numeric as `f`. Null controls are skipped.
pub fn osc_args(controls: &ControlMap) -> Vec<OscType> {
    let mut args = Vec::with_capacity(controls.len() * 2);
    for (key, value) in controls {
        let arg = match value {
            Value::Null => continue,
            Value::String(s) => OscType::String(s.clone()),
            Value::Number(n) => OscType::Float(n.as_f64().unwrap_or(0.0) as f32),
            Value::Bool(b) => OscType::Float(if *b { 1.0 } else { 0.0 }),
            other => OscType::String(other.to_string()),
        };
        args.push(OscType::String(key.clone()));
        args.push(arg);
    }
    args
}

/// MIDI number for a scientific pitch name such as `c4`, `eb3` or `f#`.
///
/// Accidentals: `#`/`s` raise, `b`/`f` lower. Octave defaults to
/// `default_octave`. `a4` is 69.
pub fn note_to_midi(name: &str, default_octave: i64) -> Option<i64> {
    static NOTE_PATTERN: OnceLock<Option<regex::Regex>> = OnceLock::new();
    let pattern = NOTE_PATTERN
        .get_or_init(|| regex::Regex::new(r"^([a-gA-G])([#bsf]*)(-?\d+)?$").ok())
        .as_ref()?;
    let caps = pattern.captures(name.trim())?;

    let chroma = match caps.get(1)?.as_str().to_ascii_lowercase().as_str() {
        "c" => 0,
        "d" => 2,
        "e" => 4,
        "f" => 5,
        "g" => 7,
        "a" => 9,
        "b" => 11,
        _ => return None,
    };
    let offset: i64 = caps
        .get(2)
        .map(|m| {
            m.as_str()
                .chars()
                .map(|c| if c == '#' || c == 's' { 1 } else { -1 })
                .sum()
        })
        .unwrap_or(0);
    let octave = match caps.get(3) {
        Some(m) => m.as_str().parse::<i64>().ok()?,
        None => default_octave,
    };
    Some((octave + 1) * 12 + chroma + offset)
}

fn parse_numeral(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosc::OscPacket;
    use serde_json::json;
    use std::net::UdpSocket;
    use std::time::Instant;

    fn event(begin: f64, end: f64, value: Value) -> TimedEvent {
        match value {
            Value::Object(map) => TimedEvent::new(begin, end, map),
            _ => panic!("event value must be an object"),
        }
    }

    fn playing_transport(cps: f64) -> SharedTransport {
        let transport = SharedTransport::new();
        transport.with(|c| {
            let now = Instant::now();
            c.set_cps(cps, now);
            c.play(now);
        });
        transport
    }

    #[test]
    fn test_note_names() {
        assert_eq!(note_to_midi("a4", DEFAULT_OCTAVE), Some(69));
        assert_eq!(note_to_midi("c4", DEFAULT_OCTAVE), Some(60));
        assert_eq!(note_to_midi("c", DEFAULT_OCTAVE), Some(48));
        assert_eq!(note_to_midi("C#3", DEFAULT_OCTAVE), Some(49));
        assert_eq!(note_to_midi("eb5", DEFAULT_OCTAVE), Some(75));
        assert_eq!(note_to_midi("fs2", DEFAULT_OCTAVE), Some(42));
        assert_eq!(note_to_midi("bf", 4), Some(70));
        assert_eq!(note_to_midi("h2", DEFAULT_OCTAVE), None);
        assert_eq!(note_to_midi("", DEFAULT_OCTAVE), None);
    }

    #[test]
    fn test_transport_fields_are_merged() {
        let controls = control_map(&event(2.0, 2.5, json!({"s": "bd"})), 0.5);
        assert_eq!(controls["cps"], json!(0.5));
        assert_eq!(controls["cycle"], json!(2.0));
        assert_eq!(controls["delta"], json!(1.0));
        assert_eq!(controls["s"], json!("bd"));
    }

    #[test]
    fn test_event_controls_override_transport_fields() {
        let controls = control_map(&event(0.0, 1.0, json!({"cps": 2.0})), 1.0);
        assert_eq!(controls["cps"], json!(2.0));
    }

    #[test]
    fn test_note_resolution() {
        let controls = control_map(&event(0.0, 1.0, json!({"note": "a4"})), 1.0);
        assert_eq!(controls["note"], json!(69.0));

        let controls = control_map(&event(0.0, 1.0, json!({"note": "c", "octave": 5})), 1.0);
        assert_eq!(controls["note"], json!(72.0));

        let controls = control_map(&event(0.0, 1.0, json!({"note": 61})), 1.0);
        assert_eq!(controls["note"], json!(61));

        let controls = control_map(&event(0.0, 1.0, json!({"note": "zz"})), 1.0);
        assert_eq!(controls["note"], json!("zz"));
    }

    #[test]
    fn test_bank_prefix() {
        let controls = control_map(
            &event(0.0, 1.0, json!({"s": "bd", "bank": "RolandTR909"})),
            1.0,
        );
        assert_eq!(controls["s"], json!("RolandTR909_bd"));

        let controls = control_map(&event(0.0, 1.0, json!({"bank": "RolandTR909"})), 1.0);
        assert!(controls.get("s").is_none());
    }

    #[test]
    fn test_speed_rescaled_for_cycle_unit() {
        let controls = control_map(
            &event(0.0, 1.0, json!({"speed": 1.0, "unit": "c"})),
            0.5,
        );
        assert_eq!(controls["speed"], json!(2.0));

        let controls = control_map(
            &event(0.0, 1.0, json!({"speed": 1.0, "unit": "cycles"})),
            0.25,
        );
        assert_eq!(controls["speed"], json!(4.0));

        let controls = control_map(&event(0.0, 1.0, json!({"speed": 1.0})), 0.5);
        assert_eq!(controls["speed"], json!(1.0));
    }

    #[test]
    fn test_numeral_and_structured_controls() {
        let controls = control_map(
            &event(
                0.0,
                1.0,
                json!({"n": "3", "roomsize": "0.8", "channels": [1, 2]}),
            ),
            1.0,
        );
        assert_eq!(controls["n"], json!(3.0));
        assert_eq!(controls["size"], json!(0.8));
        assert_eq!(controls["channels"], json!("[1,2]"));
    }

    #[test]
    fn test_osc_args_alternate_keys_and_values() {
        let mut controls = ControlMap::new();
        controls.insert("gain".to_string(), json!(0.5));
        controls.insert("legato".to_string(), Value::Null);
        controls.insert("loop".to_string(), json!(true));
        controls.insert("s".to_string(), json!("bd"));

        let args = osc_args(&controls);
        assert_eq!(
            args,
            vec![
                OscType::String("gain".to_string()),
                OscType::Float(0.5),
                OscType::String("loop".to_string()),
                OscType::Float(1.0),
                OscType::String("s".to_string()),
                OscType::String("bd".to_string()),
            ]
        );
    }

    #[test]
    fn test_unbound_relay_is_noop() {
        let relay = EventRelay::new(None, playing_transport(1.0));
        assert!(!relay.is_enabled());
        let outcome = relay.forward(&event(1.0, 2.0, json!({"s": "bd"})));
        assert_eq!(outcome, RelayOutcome::Disabled);
    }

    #[test]
    fn test_stopped_and_late_events_are_dropped() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = OscTarget::bind(listener.local_addr().unwrap().to_string()).unwrap();

        let stopped = SharedTransport::new();
        let relay = EventRelay::with_target(target.clone(), stopped, Duration::ZERO, true);
        assert_eq!(
            relay.forward(&event(1.0, 2.0, json!({"s": "bd"}))),
            RelayOutcome::Stopped
        );

        let relay = EventRelay::with_target(target, playing_transport(1.0), Duration::ZERO, true);
        assert_eq!(
            relay.forward(&event(-1.0, -0.5, json!({"s": "bd"}))),
            RelayOutcome::Late
        );
    }

    #[test]
    fn test_forward_sends_time_tagged_bundle() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let config = RelayConfig {
            target: listener.local_addr().unwrap().to_string(),
            latency: Duration::from_millis(100),
            debug: false,
        };
        let transport = playing_transport(2.0);
        let relay = EventRelay::new(Some(&config), transport.clone());
        assert!(relay.is_enabled());

        let ev = event(4.0, 4.5, json!({"s": "sd", "bank": "tr808"}));
        assert_eq!(relay.forward(&ev), RelayOutcome::Sent);

        let mut buf = [0u8; 2048];
        let (size, _) = listener.recv_from(&mut buf).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&buf[..size]).unwrap();
        let OscPacket::Bundle(bundle) = packet else {
            panic!("expected a bundle");
        };

        let expected = system_time_to_osc(transport.deadline(4.0) + Duration::from_millis(100));
        assert_eq!(bundle.timetag, expected);

        let OscPacket::Message(msg) = &bundle.content[0] else {
            panic!("expected a message");
        };
        assert_eq!(msg.addr, PLAY_ADDRESS);
        let s_index = msg
            .args
            .iter()
            .position(|a| a == &OscType::String("s".to_string()))
            .unwrap();
        assert_eq!(msg.args[s_index + 1], OscType::String("tr808_sd".to_string()));
        let delta_index = msg
            .args
            .iter()
            .position(|a| a == &OscType::String("delta".to_string()))
            .unwrap();
        assert_eq!(msg.args[delta_index + 1], OscType::Float(0.25));
    }

    #[tokio::test]
    async fn test_run_drains_until_channel_closes() {
        let relay = EventRelay::new(None, playing_transport(1.0));
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(relay.run(rx, shutdown_rx));

        tx.send(event(1.0, 2.0, json!({"s": "bd"}))).await.unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
