//! Mock Hardware Implementations
//!
//! Simulated outputs for running the engine without a DAQ board or laser
//! controller. All mocks use async-safe timing (`tokio::time::sleep`), so tests
//! can run them under a paused clock.
//!
//! # Available Mocks
//!
//! - `TriggerBus` - shared edge counter standing in for the trigger wire
//! - `MockChannel` - output channel that completes after the trigger edge
//! - `MockTrigger` - master trigger line that counts fired pulses
//! - `MockJournal` - ordered log of every device call across mocks
//! - `ScriptedTransport` - line transport with canned replies for protocol tests
//!
//! Each mock comes with a cloneable handle for failure injection and
//! inspection after the device has been boxed into a session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use super::capabilities::{ChannelConfig, OutputChannel, TriggerOutput};
use super::serial::LineTransport;
use crate::error::{AppResult, DaqError};
use crate::waveform::WaveformBuffer;

/// Identity reported and expected by a [`MockChannel`] unless overridden.
pub const MOCK_IDENTITY: &str = "mock";

// =============================================================================
// TriggerBus - Simulated Trigger Wire
// =============================================================================

/// Counts rising edges on the simulated trigger line.
#[derive(Clone)]
pub struct TriggerBus {
    edges: Arc<watch::Sender<u64>>,
}

impl TriggerBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { edges: Arc::new(tx) }
    }

    /// Emit one rising edge.
    pub fn fire(&self) {
        self.edges.send_modify(|n| *n += 1);
    }

    /// Edges seen so far.
    pub fn edges(&self) -> u64 {
        *self.edges.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.edges.subscribe()
    }
}

impl Default for TriggerBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// MockJournal - Cross-Device Call Log
// =============================================================================

/// Ordered record of `"<device>:<operation>"` entries.
#[derive(Clone, Default)]
pub struct MockJournal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl MockJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, device: &str, operation: &str) {
        self.entries.lock().push(format!("{device}:{operation}"));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Position of the first matching entry.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e == entry)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

// =============================================================================
// MockChannel - Simulated Output Channel
// =============================================================================

#[derive(Debug)]
struct ChannelBehavior {
    identity: String,
    fail_next_configure: bool,
    fail_next_load: bool,
    fail_next_start: bool,
    fail_next_stop: bool,
    completes: bool,
    run_time: Duration,
    loads: usize,
    stops: usize,
    config: Option<ChannelConfig>,
    last_buffer: Option<WaveformBuffer>,
}

impl Default for ChannelBehavior {
    fn default() -> Self {
        Self {
            identity: MOCK_IDENTITY.to_owned(),
            fail_next_configure: false,
            fail_next_load: false,
            fail_next_start: false,
            fail_next_stop: false,
            completes: true,
            run_time: Duration::ZERO,
            loads: 0,
            stops: 0,
            config: None,
            last_buffer: None,
        }
    }
}

/// Failure injection and inspection for a boxed [`MockChannel`].
#[derive(Clone)]
pub struct MockChannelHandle {
    behavior: Arc<Mutex<ChannelBehavior>>,
}

impl MockChannelHandle {
    /// Identity string reported during the handshake.
    pub fn set_identity(&self, identity: &str) {
        self.behavior.lock().identity = identity.to_owned();
    }

    pub fn fail_next_configure(&self) {
        self.behavior.lock().fail_next_configure = true;
    }

    pub fn fail_next_load(&self) {
        self.behavior.lock().fail_next_load = true;
    }

    pub fn fail_next_start(&self) {
        self.behavior.lock().fail_next_start = true;
    }

    pub fn fail_next_stop(&self) {
        self.behavior.lock().fail_next_stop = true;
    }

    /// When `false`, the channel never finishes after the trigger.
    pub fn set_completes(&self, completes: bool) {
        self.behavior.lock().completes = completes;
    }

    /// Output duration after the trigger edge.
    pub fn set_run_time(&self, run_time: Duration) {
        self.behavior.lock().run_time = run_time;
    }

    pub fn load_count(&self) -> usize {
        self.behavior.lock().loads
    }

    pub fn stop_count(&self) -> usize {
        self.behavior.lock().stops
    }

    pub fn config(&self) -> Option<ChannelConfig> {
        self.behavior.lock().config.clone()
    }

    pub fn last_buffer(&self) -> Option<WaveformBuffer> {
        self.behavior.lock().last_buffer.clone()
    }
}

/// Output channel that plays out after the next trigger edge.
pub struct MockChannel {
    name: String,
    bus: TriggerBus,
    journal: Option<MockJournal>,
    behavior: Arc<Mutex<ChannelBehavior>>,
    armed_at: u64,
}

impl MockChannel {
    pub fn new(name: &str, bus: TriggerBus) -> (Self, MockChannelHandle) {
        let behavior = Arc::new(Mutex::new(ChannelBehavior::default()));
        let channel = Self {
            name: name.to_owned(),
            bus,
            journal: None,
            behavior: Arc::clone(&behavior),
            armed_at: 0,
        };
        (channel, MockChannelHandle { behavior })
    }

    #[must_use]
    pub fn with_journal(mut self, journal: MockJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    fn record(&self, operation: &str) {
        if let Some(journal) = &self.journal {
            journal.record(&self.name, operation);
        }
    }

    fn injected(&self, operation: &str) -> DaqError {
        DaqError::Instrument(format!("{}: injected {operation} failure", self.name))
    }
}

#[async_trait]
impl OutputChannel for MockChannel {
    async fn handshake(&mut self) -> AppResult<()> {
        let received = self.behavior.lock().identity.clone();
        if received == MOCK_IDENTITY {
            Ok(())
        } else {
            Err(DaqError::DeviceHandshake {
                device: self.name.clone(),
                expected: MOCK_IDENTITY.to_owned(),
                received,
            })
        }
    }

    async fn configure(&mut self, config: &ChannelConfig) -> AppResult<()> {
        {
            let mut behavior = self.behavior.lock();
            if std::mem::take(&mut behavior.fail_next_configure) {
                return Err(self.injected("configure"));
            }
            behavior.config = Some(config.clone());
        }
        self.record("configure");
        Ok(())
    }

    async fn load(&mut self, buffer: &WaveformBuffer) -> AppResult<()> {
        {
            let mut behavior = self.behavior.lock();
            if std::mem::take(&mut behavior.fail_next_load) {
                return Err(self.injected("load"));
            }
            behavior.loads += 1;
            behavior.last_buffer = Some(buffer.clone());
        }
        self.record("load");
        Ok(())
    }

    async fn start(&mut self) -> AppResult<()> {
        if std::mem::take(&mut self.behavior.lock().fail_next_start) {
            return Err(self.injected("start"));
        }
        self.armed_at = self.bus.edges();
        self.record("start");
        Ok(())
    }

    async fn wait_until_done(&mut self) -> AppResult<()> {
        let mut edges = self.bus.subscribe();
        let armed_at = self.armed_at;
        let triggered = edges.wait_for(|&n| n > armed_at).await.is_ok();
        if !triggered {
            return Err(DaqError::Instrument(format!(
                "{}: trigger line dropped",
                self.name
            )));
        }

        let (completes, run_time) = {
            let behavior = self.behavior.lock();
            (behavior.completes, behavior.run_time)
        };
        if !completes {
            std::future::pending::<()>().await;
        }
        if !run_time.is_zero() {
            sleep(run_time).await;
        }
        self.record("done");
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        {
            let mut behavior = self.behavior.lock();
            if std::mem::take(&mut behavior.fail_next_stop) {
                return Err(self.injected("stop"));
            }
            behavior.stops += 1;
        }
        self.record("stop");
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.record("close");
        Ok(())
    }
}

// =============================================================================
// MockTrigger - Simulated Master Trigger Line
// =============================================================================

#[derive(Debug, Default)]
struct TriggerState {
    fired: u64,
    fail_next_fire: bool,
    last_pattern: Vec<bool>,
}

/// Inspection handle for a boxed [`MockTrigger`].
#[derive(Clone)]
pub struct MockTriggerHandle {
    state: Arc<Mutex<TriggerState>>,
}

impl MockTriggerHandle {
    /// Pulses written to the line.
    pub fn fired_count(&self) -> u64 {
        self.state.lock().fired
    }

    pub fn fail_next_fire(&self) {
        self.state.lock().fail_next_fire = true;
    }

    pub fn last_pattern(&self) -> Vec<bool> {
        self.state.lock().last_pattern.clone()
    }
}

/// Master trigger line that drives a [`TriggerBus`].
pub struct MockTrigger {
    line: String,
    bus: TriggerBus,
    journal: Option<MockJournal>,
    state: Arc<Mutex<TriggerState>>,
}

impl MockTrigger {
    pub fn new(bus: TriggerBus) -> (Self, MockTriggerHandle) {
        let state = Arc::new(Mutex::new(TriggerState::default()));
        let trigger = Self {
            line: "master_trigger".into(),
            bus,
            journal: None,
            state: Arc::clone(&state),
        };
        (trigger, MockTriggerHandle { state })
    }

    /// Name the simulated line after the physical output it stands in for.
    #[must_use]
    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.line = line.into();
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: MockJournal) -> Self {
        self.journal = Some(journal);
        self
    }
}

#[async_trait]
impl TriggerOutput for MockTrigger {
    fn name(&self) -> &str {
        &self.line
    }

    async fn write_pattern(&mut self, pattern: &[bool]) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            if std::mem::take(&mut state.fail_next_fire) {
                return Err(DaqError::Instrument(format!(
                    "{}: injected write failure",
                    self.line
                )));
            }
            state.last_pattern = pattern.to_vec();
        }

        let rising_edges = pattern.windows(2).filter(|w| !w[0] && w[1]).count();
        for _ in 0..rising_edges {
            self.state.lock().fired += 1;
            self.bus.fire();
        }
        if let Some(journal) = &self.journal {
            journal.record(&self.line, "fire");
        }
        Ok(())
    }
}

// =============================================================================
// ScriptedTransport - Canned Serial Replies
// =============================================================================

#[derive(Default)]
struct Script {
    replies: HashMap<String, VecDeque<String>>,
    sent: Vec<String>,
}

/// Line transport answering queries from a script.
///
/// Clones share the script, so a test keeps one clone to inspect what the
/// driver sent.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` for the next `query`. The last queued reply for a query
    /// repeats once the queue is down to one entry. Unscripted commands get
    /// an empty acknowledgement.
    pub fn reply(&self, query: &str, reply: &str) -> &Self {
        self.script
            .lock()
            .replies
            .entry(query.to_owned())
            .or_default()
            .push_back(reply.to_owned());
        self
    }

    /// Every line written, queries included.
    pub fn sent(&self) -> Vec<String> {
        self.script.lock().sent.clone()
    }
}

#[async_trait]
impl LineTransport for ScriptedTransport {
    async fn query(&mut self, line: &str) -> AppResult<String> {
        let mut script = self.script.lock();
        script.sent.push(line.to_owned());
        let reply = match script.replies.get_mut(line) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(reply.unwrap_or_default())
    }
}
