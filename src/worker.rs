//! The dispatch loop at the center of the backend.
//!
//! `BackendWorker` owns the instrument, the acquisition engine and the
//! transport mux, and runs the single-threaded loop that serves both request
//! channels and drives acquisition. Each loop iteration serves at most one
//! request per channel, then runs at most one acquisition cycle. The poll
//! timeout depends on state: while an acquisition mode is running the loop
//! must keep cycling, so polling is non-blocking; otherwise the loop parks
//! until a request arrives.
//!
//! State is the admission gate. `BUSY` rejects everything; the running modes
//! reject everything except the stop command; mode starts are only accepted
//! from `IDLE`. Every observable state change is broadcast on the
//! `backend_state` topic.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::acquisition::{AcquisitionEngine, Capture};
use crate::error::{ScopeError, ScopeResult};
use crate::instrument::Instrument;
use crate::protocol::{topics, AcquisitionMode, Command, Reply, Request};
use crate::transport::{PollStatus, Sink, TransportMux};

/// Operational state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Ready for any command.
    Idle,
    /// Mid-command; everything else is rejected.
    Busy,
    /// Acquisition cycles repeat until stopped.
    ContinuousAcquisition,
    /// One acquisition cycle, then back to idle.
    Single,
}

impl WorkerState {
    /// Wire name used on the `backend_state` topic.
    pub fn name(self) -> &'static str {
        match self {
            WorkerState::Idle => "IDLE",
            WorkerState::Busy => "BUSY",
            WorkerState::ContinuousAcquisition => "CONTINUOUS_ACQUISITION",
            WorkerState::Single => "SINGLE",
        }
    }

    /// True for the states in which the loop must keep producing
    /// acquisition cycles.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            WorkerState::ContinuousAcquisition | WorkerState::Single
        )
    }
}

enum Admission {
    Allow,
    Reject(String),
    /// Well-formed but without effect; acknowledged with a warning and no
    /// state broadcast.
    Noop(&'static str),
}

/// The backend's single worker.
pub struct BackendWorker {
    state: WorkerState,
    engine: AcquisitionEngine,
    instrument: Box<dyn Instrument>,
    mux: TransportMux,
}

impl BackendWorker {
    /// Assemble a worker starting in `IDLE`.
    pub fn new(
        instrument: Box<dyn Instrument>,
        engine: AcquisitionEngine,
        mux: TransportMux,
    ) -> Self {
        BackendWorker {
            state: WorkerState::Idle,
            engine,
            instrument,
            mux,
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run the dispatch loop until every request endpoint is gone.
    pub async fn run(mut self) {
        info!("backend worker started in state {}", self.state.name());
        if let Err(e) = self.mux.send_handshake() {
            warn!("startup handshake not delivered: {e}");
        }

        loop {
            let timeout = if self.state.is_running() {
                Some(Duration::ZERO)
            } else {
                None
            };
            let ready = match self.mux.poll(timeout).await {
                PollStatus::Ready(ready) => ready,
                PollStatus::Disconnected => {
                    info!("all request channels disconnected, worker stopping");
                    break;
                }
            };

            for origin in ready {
                let reply = match self.mux.receive(origin) {
                    Ok(command) => self.serve(Request { command, origin }).await,
                    Err(e) => {
                        warn!("undecodable request on {origin:?}: {e}");
                        Reply::error(e.to_string())
                    }
                };
                if let Err(e) = self.mux.reply(origin, &reply) {
                    warn!("reply to {origin:?} not delivered: {e}");
                }
            }

            if self.state.is_running() {
                self.run_acquisition_cycle().await;
                if self.state == WorkerState::Single {
                    self.set_state(WorkerState::Idle);
                }
            }
        }

        self.mux.shutdown();
    }

    /// Dispatch one request, containing any handler panic so a faulty
    /// command can never take the loop down.
    async fn serve(&mut self, request: Request) -> Reply {
        let name = request.command.name();
        match AssertUnwindSafe(self.dispatch(request)).catch_unwind().await {
            Ok(reply) => reply,
            Err(_) => {
                error!("handler for '{name}' panicked");
                self.set_state(WorkerState::Idle);
                self.broadcast(
                    topics::ERROR,
                    &json!("Critical error: command handler failed. Returning to IDLE."),
                );
                Reply::error("Internal error: command handler failed")
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> Reply {
        debug!(
            "dispatching '{}' from {:?} in state {}",
            request.command.name(),
            request.origin,
            self.state.name()
        );
        match self.admit(&request.command) {
            Admission::Reject(message) => {
                return Reply::error(ScopeError::Admission(message).to_string())
            }
            Admission::Noop(message) => return Reply::warning(message),
            Admission::Allow => {}
        }
        match self.handle(request.command).await {
            Ok(payload) => Reply::ok(payload),
            Err(e) => Reply::error(e.to_string()),
        }
    }

    fn admit(&self, command: &Command) -> Admission {
        if self.state == WorkerState::Busy {
            return Admission::Reject("device is busy with a previous command".to_string());
        }
        match command {
            Command::SetAcquisitionMode {
                state: AcquisitionMode::Off,
            } => {
                if self.state == WorkerState::Idle {
                    Admission::Noop("acquisition already stopped")
                } else {
                    Admission::Allow
                }
            }
            Command::SetAcquisitionMode { .. } => {
                if self.state == WorkerState::Idle {
                    Admission::Allow
                } else {
                    Admission::Reject(
                        "acquisition mode can only be started while idle".to_string(),
                    )
                }
            }
            _ => {
                if self.state.is_running() {
                    Admission::Reject(format!(
                        "'{}' is not allowed during acquisition",
                        command.name()
                    ))
                } else {
                    Admission::Allow
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) -> ScopeResult<Value> {
        match command {
            Command::SetAcquisitionTimeout { level } => {
                self.engine.set_timeout_ms(level)?;
                Ok(json!(level))
            }
            Command::SetAcquisitionIgnore { state } => {
                self.engine.set_ignore_timeout(state);
                Ok(json!(state))
            }
            Command::SetAcquisitionMode { state } => Ok(self.switch_mode(state)),
            device_command => self.execute_blocking(device_command).await,
        }
    }

    fn switch_mode(&mut self, mode: AcquisitionMode) -> Value {
        match mode {
            AcquisitionMode::Continuous => {
                self.set_state(WorkerState::ContinuousAcquisition);
                json!("Continuous acquisition started")
            }
            AcquisitionMode::Single => {
                self.set_state(WorkerState::Single);
                json!("Single acquisition armed")
            }
            AcquisitionMode::Off => {
                self.set_state(WorkerState::Idle);
                json!("Acquisition stopped")
            }
        }
    }

    /// Run a device-touching command inside the `BUSY` bracket.
    ///
    /// The worker is back in `IDLE` afterwards whether the device call
    /// succeeded or failed; this is the only path through `BUSY`.
    async fn execute_blocking(&mut self, command: Command) -> ScopeResult<Value> {
        self.set_state(WorkerState::Busy);
        let result = self.run_on_device(command).await;
        self.set_state(WorkerState::Idle);
        result
    }

    async fn run_on_device(&mut self, command: Command) -> ScopeResult<Value> {
        let device = self.instrument.as_mut();
        match command {
            Command::SetChannelEnabled { channel, enabled } => {
                device.set_channel_enabled(channel, enabled).await?;
                Ok(success())
            }
            Command::SetChannelScale { channel, scale } => {
                device.set_channel_scale(channel, scale).await?;
                Ok(success())
            }
            Command::SetTriggerChannel { channel } => {
                device.set_trigger_channel(channel).await?;
                Ok(success())
            }
            Command::SetTriggerSlope { slope } => {
                device.set_trigger_slope(slope).await?;
                Ok(success())
            }
            Command::SetTriggerLevel { level } => {
                device.set_trigger_level(level).await?;
                Ok(success())
            }
            Command::SetAcquisitionTimediv { level } => {
                device.set_time_division(level).await?;
                Ok(success())
            }
            Command::RawQuery { query } => Ok(json!(device.query(&query).await?)),
            Command::RawWrite { command } => {
                device.write(&command).await?;
                Ok(success())
            }
            other => Err(ScopeError::Internal(format!(
                "'{}' does not touch the device",
                other.name()
            ))),
        }
    }

    async fn run_acquisition_cycle(&mut self) {
        match self.engine.run_cycle(self.instrument.as_mut()).await {
            Ok(capture) => self.publish_capture(&capture),
            Err(e) if e.is_acquisition_timeout() => {
                warn!("{e}");
                self.broadcast(topics::ERROR, &json!(e.to_string()));
                if !self.engine.ignore_timeout() {
                    self.set_state(WorkerState::Idle);
                }
            }
            Err(e) => {
                error!("acquisition cycle failed: {e}");
                self.broadcast(topics::ERROR, &json!(e.to_string()));
                self.set_state(WorkerState::Idle);
            }
        }
    }

    fn publish_capture(&mut self, capture: &Capture) {
        let mut console_waveforms = serde_json::Map::new();
        for (channel, samples) in &capture.waveforms {
            let csv = samples
                .iter()
                .map(f64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            self.publish(
                Sink::PeerTelemetry,
                &topics::waveform_channel(*channel),
                &json!(csv),
            );
            console_waveforms.insert(channel.to_string(), json!(samples));
        }
        self.publish(
            Sink::PeerTelemetry,
            topics::WAVEFORM_TIMEDIV,
            &json!(capture.time_increment),
        );
        self.publish(
            Sink::ConsoleFeed,
            topics::WAVEFORM,
            &json!({
                "time_increment": capture.time_increment,
                "waveforms": Value::Object(console_waveforms),
            }),
        );
    }

    fn set_state(&mut self, new_state: WorkerState) {
        if self.state == new_state {
            return;
        }
        self.state = new_state;
        info!("state change: {}", new_state.name());
        self.broadcast(topics::BACKEND_STATE, &json!(new_state.name()));
    }

    fn broadcast(&self, topic: &str, payload: &Value) {
        self.publish(Sink::PeerTelemetry, topic, payload);
        self.publish(Sink::ConsoleFeed, topic, payload);
    }

    fn publish(&self, sink: Sink, topic: &str, payload: &Value) {
        if let Err(e) = self.mux.publish(sink, topic, payload) {
            warn!("broadcast '{topic}' on {sink:?} failed: {e}");
        }
    }
}

fn success() -> Value {
    Value::String("Success".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MockScope;
    use crate::protocol::Origin;
    use crate::transport::{Multipart, MuxEndpoints};

    fn worker_with(scope: MockScope) -> (BackendWorker, MuxEndpoints) {
        let (mux, endpoints) = TransportMux::new();
        let worker = BackendWorker::new(Box::new(scope), AcquisitionEngine::new(), mux);
        (worker, endpoints)
    }

    fn request(command: Command) -> Request {
        Request {
            command,
            origin: Origin::Peer,
        }
    }

    fn drain_states(feed: &mut tokio::sync::broadcast::Receiver<Multipart>) -> Vec<String> {
        let mut states = Vec::new();
        while let Ok(frames) = feed.try_recv() {
            if frames[0] == b"backend_state" {
                let state: String =
                    serde_json::from_slice(&frames[1]).expect("bad state payload");
                states.push(state);
            }
        }
        states
    }

    #[tokio::test]
    async fn test_busy_state_rejects_everything() {
        let (mut worker, _endpoints) = worker_with(MockScope::new());
        worker.state = WorkerState::Busy;

        let reply = worker
            .dispatch(request(Command::SetTriggerLevel { level: 0.5 }))
            .await;
        assert!(!reply.is_ok());
        assert!(reply.message.expect("no message").contains("busy"));
        assert_eq!(worker.state(), WorkerState::Busy);
    }

    #[tokio::test]
    async fn test_running_mode_rejects_all_but_stop() {
        let (mut worker, _endpoints) = worker_with(MockScope::new());
        worker.state = WorkerState::ContinuousAcquisition;

        let reply = worker
            .dispatch(request(Command::RawQuery {
                query: "*IDN?".to_string(),
            }))
            .await;
        assert!(!reply.is_ok());
        assert_eq!(worker.state(), WorkerState::ContinuousAcquisition);

        let restart = worker
            .dispatch(request(Command::SetAcquisitionMode {
                state: AcquisitionMode::Single,
            }))
            .await;
        assert!(!restart.is_ok());
        assert_eq!(worker.state(), WorkerState::ContinuousAcquisition);

        let stop = worker
            .dispatch(request(Command::SetAcquisitionMode {
                state: AcquisitionMode::Off,
            }))
            .await;
        assert!(stop.is_ok());
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_execute_blocking_restores_idle_on_success_and_failure() {
        let (mut worker, endpoints) = worker_with(MockScope::new());
        let mut feed = endpoints.console_feed.subscribe();

        let reply = worker
            .dispatch(request(Command::RawQuery {
                query: "*IDN?".to_string(),
            }))
            .await;
        assert!(reply.is_ok());
        assert_eq!(reply.payload, Some(json!("INSTR,1.0")));
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(drain_states(&mut feed), vec!["BUSY", "IDLE"]);

        let reply = worker
            .dispatch(request(Command::RawQuery {
                query: "NOPE?".to_string(),
            }))
            .await;
        assert!(!reply.is_ok());
        assert!(reply.message.expect("no message").starts_with("Device error"));
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(drain_states(&mut feed), vec!["BUSY", "IDLE"]);
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_warning_without_broadcast() {
        let (mut worker, endpoints) = worker_with(MockScope::new());
        let mut feed = endpoints.console_feed.subscribe();

        let reply = worker
            .dispatch(request(Command::SetAcquisitionMode {
                state: AcquisitionMode::Off,
            }))
            .await;
        assert!(reply.is_ok());
        let payload = reply.payload.expect("no payload");
        assert!(payload
            .as_str()
            .expect("payload not a string")
            .contains("Warning"));
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(drain_states(&mut feed).is_empty());
    }

    #[tokio::test]
    async fn test_mode_start_broadcasts_once() {
        let (mut worker, endpoints) = worker_with(MockScope::new());
        let mut feed = endpoints.console_feed.subscribe();

        let reply = worker
            .dispatch(request(Command::SetAcquisitionMode {
                state: AcquisitionMode::Continuous,
            }))
            .await;
        assert!(reply.is_ok());
        assert_eq!(drain_states(&mut feed), vec!["CONTINUOUS_ACQUISITION"]);
    }

    #[tokio::test]
    async fn test_engine_settings_do_not_touch_busy_state() {
        let (mut worker, endpoints) = worker_with(MockScope::new());
        let mut feed = endpoints.console_feed.subscribe();

        let reply = worker
            .dispatch(request(Command::SetAcquisitionTimeout { level: 2_000 }))
            .await;
        assert!(reply.is_ok());
        let reply = worker
            .dispatch(request(Command::SetAcquisitionIgnore { state: true }))
            .await;
        assert!(reply.is_ok());
        assert!(drain_states(&mut feed).is_empty());
        assert_eq!(worker.engine.timeout_ms(), 2_000);
        assert!(worker.engine.ignore_timeout());
    }

    #[tokio::test]
    async fn test_invalid_timeout_value_is_rejected() {
        let (mut worker, _endpoints) = worker_with(MockScope::new());
        let reply = worker
            .dispatch(request(Command::SetAcquisitionTimeout { level: 0 }))
            .await;
        assert!(!reply.is_ok());
        assert!(reply
            .message
            .expect("no message")
            .starts_with("Invalid request"));
        assert_eq!(worker.engine.timeout_ms(), crate::acquisition::DEFAULT_TIMEOUT_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_cycle_ends_continuous_unless_ignored() {
        let (mut worker, endpoints) = worker_with(MockScope::new().with_hold_busy());
        let mut feed = endpoints.console_feed.subscribe();
        worker
            .engine
            .set_timeout_ms(50)
            .expect("set timeout failed");

        worker.state = WorkerState::ContinuousAcquisition;
        worker.run_acquisition_cycle().await;
        assert_eq!(worker.state(), WorkerState::Idle);

        worker.engine.set_ignore_timeout(true);
        worker.state = WorkerState::ContinuousAcquisition;
        worker.run_acquisition_cycle().await;
        assert_eq!(worker.state(), WorkerState::ContinuousAcquisition);

        // Both cycles raised an error broadcast.
        let mut errors = 0;
        while let Ok(frames) = feed.try_recv() {
            if frames[0] == b"error" {
                errors += 1;
            }
        }
        assert_eq!(errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_fault_in_cycle_forces_idle() {
        let (mut worker, _endpoints) =
            worker_with(MockScope::new().with_start_fault("link lost"));
        worker.engine.set_ignore_timeout(true);
        worker.state = WorkerState::ContinuousAcquisition;
        worker.run_acquisition_cycle().await;
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_capture_publishes_per_channel_and_combined() {
        let (mut worker, endpoints) = worker_with(MockScope::new());
        let mut telemetry = endpoints.peer_telemetry.subscribe();
        let mut feed = endpoints.console_feed.subscribe();

        worker.publish_capture(&Capture {
            waveforms: vec![(1, vec![0.5, 1.0]), (3, vec![1.5, 2.0])],
            time_increment: 4e-6,
        });

        let mut peer_topics = Vec::new();
        while let Ok(frames) = telemetry.try_recv() {
            peer_topics.push(String::from_utf8(frames[0].clone()).expect("bad topic"));
        }
        assert_eq!(
            peer_topics,
            vec!["waveform_ch1", "waveform_ch3", "waveform_timediv"]
        );

        let frames = feed.try_recv().expect("no console waveform");
        assert_eq!(frames[0], b"waveform");
        let doc: Value = serde_json::from_slice(&frames[1]).expect("bad json");
        assert!((doc["time_increment"].as_f64().expect("missing") - 4e-6).abs() < 1e-12);
        assert!(doc["waveforms"].get("1").is_some());
        assert!(doc["waveforms"].get("3").is_some());
        assert!(doc["waveforms"].get("2").is_none());
    }
}
