//! Symbolic state machine builder
//!
//! A `StateMachine` is created per trial, populated through the builder
//! methods, compiled once and then consumed by a single trial run. States are
//! referenced by name; forward references are allowed and resolved by the
//! compiler.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::channels::{ChannelLayout, EventKind, OutputKind};
use crate::hardware::HardwareDescriptor;

/// Builder errors
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("error creating state {state}: {event} is an invalid event name")]
    InvalidEvent { state: String, event: String },
    #[error("error creating state {state}: {output} is an invalid output for value {value}")]
    InvalidOutput { state: String, output: String, value: String },
    #[error("{0} is an invalid output channel name")]
    InvalidChannel(String),
    #[error("flex channel voltages must be in the range [0, 5], got {0}")]
    InvalidVoltage(f64),
    #[error(
        "threshold mask must be a bit string or 0/1 list with one bit per flex channel ({expected})"
    )]
    InvalidThresholdMask { expected: usize },
    #[error("{what} {value} does not fit the wire format")]
    Overflow { what: &'static str, value: u64 },
    #[error("cannot load more than 256 serial messages on a single UART channel")]
    TooManySerialMessages,
    #[error("serial message must be 1..={max} bytes")]
    SerialMessageTooLong { max: usize },
    #[error("invalid {what} number {number}")]
    InvalidIndex { what: &'static str, number: usize },
}

/// Where a transition goes.
///
/// `Exit` and `Back` are serialized as `total_states_added` and 255 at emit
/// time; `Unresolved` carries an index into the undeclared-name list until
/// the compiler's resolution pass replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    State(u16),
    Exit,
    Back,
    Unresolved(u16),
}

/// Value attached to an output action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionValue {
    Int(u32),
    /// Analog voltage, quantized to 12 bits for analog-output flex channels
    Volts(f64),
    /// Implicit serial message payload for a UART channel
    Bytes(Vec<u8>),
    /// MSB-first bit string, e.g. `"0001"`
    Bits(String),
    /// MSB-first list of 0/1 values
    BitList(Vec<u8>),
}

impl ActionValue {
    fn as_int(&self) -> Option<u32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn as_volts(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(f64::from(*v)),
            Self::Volts(v) => Some(*v),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Volts(v) => v.to_string(),
            Self::Bytes(b) => format!("{b:?}"),
            Self::Bits(s) => s.clone(),
            Self::BitList(b) => format!("{b:?}"),
        }
    }
}

impl From<u8> for ActionValue {
    fn from(v: u8) -> Self {
        Self::Int(u32::from(v))
    }
}

impl From<u16> for ActionValue {
    fn from(v: u16) -> Self {
        Self::Int(u32::from(v))
    }
}

impl From<u32> for ActionValue {
    fn from(v: u32) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ActionValue {
    fn from(v: f64) -> Self {
        Self::Volts(v)
    }
}

impl From<&[u8]> for ActionValue {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for ActionValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&str> for ActionValue {
    fn from(v: &str) -> Self {
        Self::Bits(v.to_string())
    }
}

// ============================================================================
// Global resources
// ============================================================================

/// Global timer table plus the per-state trigger/cancel masks.
///
/// Trigger and cancel masks are separate fields from the `end_matrix`
/// transition list; they answer different questions and are serialized in
/// different blocks.
#[derive(Debug, Clone)]
pub struct GlobalTimers {
    /// Timer durations in seconds, one slot per hardware timer
    pub timers: Vec<f64>,
    pub on_set_delays: Vec<f64>,
    /// Output channel driven while the timer runs, 255 = none
    pub channels: Vec<u8>,
    pub on_messages: Vec<u16>,
    pub off_messages: Vec<u16>,
    pub loop_mode: Vec<u8>,
    pub loop_intervals: Vec<f64>,
    pub send_events: Vec<u8>,
    /// Per-timer bitmask of other timers to trigger at onset
    pub onset_matrix: Vec<u32>,
    /// Per-state timer-start transitions: (event code, destination)
    pub start_matrix: Vec<Vec<(u8, Destination)>>,
    /// Per-state timer-end transitions
    pub end_matrix: Vec<Vec<(u8, Destination)>>,
    /// Per-state bitmask of timers triggered on state entry
    pub triggers_matrix: Vec<u32>,
    /// Cancel flags, laid out the way the wire block expects them
    pub cancels_matrix: Vec<u32>,
    used: Option<usize>,
}

impl GlobalTimers {
    fn new(n_timers: usize) -> Self {
        Self {
            timers: vec![0.0; n_timers],
            on_set_delays: vec![0.0; n_timers],
            channels: vec![255; n_timers],
            on_messages: vec![0; n_timers],
            off_messages: vec![0; n_timers],
            loop_mode: vec![0; n_timers],
            loop_intervals: vec![0.0; n_timers],
            send_events: vec![1; n_timers],
            onset_matrix: vec![0; n_timers],
            start_matrix: Vec::new(),
            end_matrix: Vec::new(),
            triggers_matrix: Vec::new(),
            cancels_matrix: vec![0; n_timers],
            used: None,
        }
    }

    fn mark_used(&mut self, index: usize) {
        self.used = Some(self.used.map_or(index, |u| u.max(index)));
    }

    /// Number of timer slots the compiled descriptor must cover.
    pub fn highest_used_count(&self) -> usize {
        self.used.map_or(0, |u| u + 1)
    }
}

/// Global counter table and per-state reset assignments.
#[derive(Debug, Clone)]
pub struct GlobalCounters {
    /// Event code each counter counts
    pub attached_events: Vec<u8>,
    pub thresholds: Vec<u32>,
    /// Per-state counter-end transitions
    pub matrix: Vec<Vec<(u8, Destination)>>,
    /// Counter number reset on entering each state, 0 = none
    pub reset_matrix: Vec<u8>,
    used: Option<usize>,
}

impl GlobalCounters {
    fn new(n_counters: usize) -> Self {
        Self {
            attached_events: vec![0; n_counters],
            thresholds: vec![0; n_counters],
            matrix: Vec::new(),
            reset_matrix: Vec::new(),
            used: None,
        }
    }

    fn mark_used(&mut self, index: usize) {
        self.used = Some(self.used.map_or(index, |u| u.max(index)));
    }

    pub fn highest_used_count(&self) -> usize {
        self.used.map_or(0, |u| u + 1)
    }
}

/// Condition table: an input channel value predicate checked on state entry.
#[derive(Debug, Clone)]
pub struct Conditions {
    /// Input channel index each condition watches
    pub channels: Vec<u8>,
    pub values: Vec<u8>,
    /// Per-state condition transitions
    pub matrix: Vec<Vec<(u8, Destination)>>,
    used: Option<usize>,
}

impl Conditions {
    fn new(n_conditions: usize) -> Self {
        Self {
            channels: vec![0; n_conditions],
            values: vec![0; n_conditions],
            matrix: Vec::new(),
            used: None,
        }
    }

    fn mark_used(&mut self, index: usize) {
        self.used = Some(self.used.map_or(index, |u| u.max(index)));
    }

    pub fn highest_used_count(&self) -> usize {
        self.used.map_or(0, |u| u + 1)
    }
}

// ============================================================================
// Serial message library
// ============================================================================

/// Per-UART-channel message store.
///
/// Two views behind one façade: bytes-to-index for dedup, index-to-bytes for
/// retrieval when the load block is emitted.
#[derive(Debug, Clone, Default)]
pub struct SerialMessageLibrary {
    by_bytes: HashMap<Vec<u8>, u8>,
    messages: Vec<Vec<u8>>,
}

impl SerialMessageLibrary {
    /// Store a message, returning its library index. The same byte sequence
    /// always maps to the same index.
    pub fn intern(&mut self, bytes: &[u8], max_len: usize) -> Result<u8, StateMachineError> {
        if bytes.is_empty() || bytes.len() > max_len {
            return Err(StateMachineError::SerialMessageTooLong { max: max_len });
        }
        if let Some(&index) = self.by_bytes.get(bytes) {
            return Ok(index);
        }
        if self.messages.len() >= 256 {
            return Err(StateMachineError::TooManySerialMessages);
        }
        let index = self.messages.len() as u8;
        self.by_bytes.insert(bytes.to_vec(), index);
        self.messages.push(bytes.to_vec());
        Ok(index)
    }

    pub fn get(&self, index: u8) -> Option<&[u8]> {
        self.messages.get(usize::from(index)).map(Vec::as_slice)
    }

    /// Messages in index order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.messages.iter().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Parameters for [`StateMachine::set_global_timer`].
#[derive(Debug, Clone)]
pub struct GlobalTimerSettings {
    /// Duration in seconds after the (possibly delayed) start
    pub duration: f64,
    pub on_set_delay: f64,
    /// Output channel to drive while the timer runs
    pub channel: Option<String>,
    pub on_message: u16,
    pub off_message: u16,
    pub loop_mode: u8,
    pub loop_interval: f64,
    /// Whether start/end events are reported back to the host
    pub send_events: bool,
    /// Bitmask of other timers to trigger when this one starts
    pub onset_triggers: Option<u32>,
}

impl Default for GlobalTimerSettings {
    fn default() -> Self {
        Self {
            duration: 0.0,
            on_set_delay: 0.0,
            channel: None,
            on_message: 1,
            off_message: 0,
            loop_mode: 0,
            loop_interval: 0.0,
            send_events: true,
            onset_triggers: None,
        }
    }
}

// ============================================================================
// State machine
// ============================================================================

/// Symbolic state machine under construction.
#[derive(Debug, Clone)]
pub struct StateMachine {
    hardware: Arc<HardwareDescriptor>,
    layout: Arc<ChannelLayout>,
    pub state_names: Vec<String>,
    /// Per-state timeout in seconds
    pub state_timers: Vec<f64>,
    /// Declared state count; `Exit` destinations serialize to this value
    pub total_states_added: usize,
    /// Destination taken when the state timer fires; defaults to the state
    /// itself ("stay")
    pub state_timer_matrix: Vec<Destination>,
    /// Per-state input transitions: (event code, destination)
    pub input_matrix: Vec<Vec<(u8, Destination)>>,
    /// Per-state output actions: (output channel code, value)
    pub output_matrix: Vec<Vec<(u8, u32)>>,
    pub global_timers: GlobalTimers,
    pub global_counters: GlobalCounters,
    pub conditions: Conditions,
    /// Declared state names, append-only
    pub manifest: Vec<String>,
    /// Names referenced as targets before declaration
    pub undeclared: Vec<String>,
    /// Whether any transition targets the previous state (encoded as 255)
    pub use_255_back_signal: bool,
    /// 0 = messages loaded manually, 1 = implicitly from output actions
    pub serial_message_mode: u8,
    serial_messages: Vec<SerialMessageLibrary>,
}

impl StateMachine {
    pub fn new(hardware: Arc<HardwareDescriptor>, layout: Arc<ChannelLayout>) -> Self {
        let n_timers = usize::from(hardware.n_global_timers);
        let n_counters = usize::from(hardware.n_global_counters);
        let n_conditions = usize::from(hardware.n_conditions);
        let n_uart = hardware.n_uart_channels();
        Self {
            hardware,
            layout,
            state_names: Vec::new(),
            state_timers: Vec::new(),
            total_states_added: 0,
            state_timer_matrix: Vec::new(),
            input_matrix: Vec::new(),
            output_matrix: Vec::new(),
            global_timers: GlobalTimers::new(n_timers),
            global_counters: GlobalCounters::new(n_counters),
            conditions: Conditions::new(n_conditions),
            manifest: Vec::new(),
            undeclared: Vec::new(),
            use_255_back_signal: false,
            serial_message_mode: 0,
            serial_messages: vec![SerialMessageLibrary::default(); n_uart],
        }
    }

    pub fn hardware(&self) -> &HardwareDescriptor {
        &self.hardware
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn serial_messages(&self) -> &[SerialMessageLibrary] {
        &self.serial_messages
    }

    /// Add (or redeclare) a state.
    ///
    /// `transitions` maps event names to target state names; `"exit"` leaves
    /// the matrix, `"back"` returns to the previous state, and names not yet
    /// declared are resolved at compile time. `actions` are output channel
    /// name / value pairs applied on state entry.
    pub fn add_state(
        &mut self,
        state_name: &str,
        state_timer: f64,
        transitions: &[(&str, &str)],
        actions: &[(&str, ActionValue)],
    ) -> Result<(), StateMachineError> {
        let index = self.declare(state_name);
        self.state_timer_matrix[index] = Destination::State(index as u16);
        self.state_timers[index] = state_timer;

        for (event_name, target) in transitions {
            self.add_transition(index, state_name, event_name, target)?;
        }
        for (action_name, value) in actions {
            self.add_action(index, state_name, action_name, value)?;
        }
        Ok(())
    }

    /// Legacy single-parameter timer setup kept for older protocols.
    pub fn set_global_timer_legacy(
        &mut self,
        number: usize,
        duration: f64,
    ) -> Result<(), StateMachineError> {
        let index = self.timer_index(number)?;
        self.global_timers.timers[index] = duration;
        self.global_timers.mark_used(index);
        Ok(())
    }

    /// Configure a global timer. `number` is 1-based, matching the event
    /// names (`GlobalTimer1_Start` is timer number 1).
    pub fn set_global_timer(
        &mut self,
        number: usize,
        settings: GlobalTimerSettings,
    ) -> Result<(), StateMachineError> {
        let index = self.timer_index(number)?;
        let channel_code = match &settings.channel {
            Some(name) => {
                let code = self
                    .layout
                    .output_code(name)
                    .ok_or_else(|| StateMachineError::InvalidChannel(name.clone()))?;
                byte_sized("output code", code)?
            }
            None => 255,
        };

        let timers = &mut self.global_timers;
        timers.timers[index] = settings.duration;
        timers.on_set_delays[index] = settings.on_set_delay;
        timers.channels[index] = channel_code;
        timers.on_messages[index] = settings.on_message;
        timers.off_messages[index] = settings.off_message;
        timers.loop_mode[index] = settings.loop_mode;
        timers.loop_intervals[index] = settings.loop_interval;
        timers.send_events[index] = u8::from(settings.send_events);
        if let Some(mask) = settings.onset_triggers {
            timers.onset_matrix[index] = mask;
        }
        timers.mark_used(index);
        Ok(())
    }

    /// Attach a counter to an event and set its threshold.
    pub fn set_global_counter(
        &mut self,
        number: usize,
        target_event: &str,
        threshold: u32,
    ) -> Result<(), StateMachineError> {
        if number == 0 || number > usize::from(self.hardware.n_global_counters) {
            return Err(StateMachineError::InvalidIndex {
                what: "global counter",
                number,
            });
        }
        let code = self
            .layout
            .event_code(target_event)
            .ok_or_else(|| StateMachineError::InvalidEvent {
                state: String::new(),
                event: target_event.to_string(),
            })?;
        let index = number - 1;
        self.global_counters.attached_events[index] = byte_sized("event code", code)?;
        self.global_counters.thresholds[index] = threshold;
        self.global_counters.mark_used(index);
        Ok(())
    }

    /// Define a condition: on entering a state that handles it, the input
    /// channel is sampled and the transition fires if the value matches.
    pub fn set_condition(
        &mut self,
        number: usize,
        channel: &str,
        value: u8,
    ) -> Result<(), StateMachineError> {
        if number == 0 || number > usize::from(self.hardware.n_conditions) {
            return Err(StateMachineError::InvalidIndex {
                what: "condition",
                number,
            });
        }
        let code = self
            .layout
            .input_channel_code(channel)
            .ok_or_else(|| StateMachineError::InvalidChannel(channel.to_string()))?;
        let index = number - 1;
        self.conditions.channels[index] = byte_sized("input channel code", code)?;
        self.conditions.values[index] = value;
        self.conditions.mark_used(index);
        Ok(())
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Reserve (or find) the ordinal for `state_name`, clearing its rows on
    /// redeclaration.
    fn declare(&mut self, state_name: &str) -> usize {
        if let Some(index) = self.manifest.iter().position(|n| n == state_name) {
            self.state_names[index] = state_name.to_string();
            self.input_matrix[index].clear();
            self.output_matrix[index].clear();
            self.global_timers.start_matrix[index].clear();
            self.global_timers.end_matrix[index].clear();
            self.global_timers.triggers_matrix[index] = 0;
            self.global_counters.matrix[index].clear();
            self.global_counters.reset_matrix[index] = 0;
            self.conditions.matrix[index].clear();
            return index;
        }

        let index = self.manifest.len();
        self.manifest.push(state_name.to_string());
        self.state_names.push(state_name.to_string());
        self.state_timers.push(0.0);
        self.state_timer_matrix.push(Destination::State(index as u16));
        self.input_matrix.push(Vec::new());
        self.output_matrix.push(Vec::new());
        self.global_timers.start_matrix.push(Vec::new());
        self.global_timers.end_matrix.push(Vec::new());
        self.global_timers.triggers_matrix.push(0);
        if self.global_timers.cancels_matrix.len() < index + 1 {
            self.global_timers.cancels_matrix.push(0);
        }
        self.global_counters.matrix.push(Vec::new());
        self.global_counters.reset_matrix.push(0);
        self.conditions.matrix.push(Vec::new());
        self.total_states_added += 1;
        index
    }

    fn destination(&mut self, target: &str) -> Destination {
        match target {
            "exit" | ">exit" => Destination::Exit,
            "back" | ">back" => {
                self.use_255_back_signal = true;
                Destination::Back
            }
            name => match self.manifest.iter().position(|n| n == name) {
                Some(i) => Destination::State(i as u16),
                None => {
                    self.undeclared.push(name.to_string());
                    Destination::Unresolved((self.undeclared.len() - 1) as u16)
                }
            },
        }
    }

    fn add_transition(
        &mut self,
        index: usize,
        state_name: &str,
        event_name: &str,
        target: &str,
    ) -> Result<(), StateMachineError> {
        let code = self.layout.event_code(event_name).ok_or_else(|| {
            StateMachineError::InvalidEvent {
                state: state_name.to_string(),
                event: event_name.to_string(),
            }
        })?;
        let code_u8 = byte_sized("event code", code)?;
        let destination = self.destination(target);

        let kind = self.layout.events[code].kind;
        match kind {
            EventKind::StateTimer => self.state_timer_matrix[index] = destination,
            EventKind::Condition { condition } => {
                self.conditions.matrix[index].push((code_u8, destination));
                self.conditions.mark_used(usize::from(condition));
            }
            EventKind::GlobalCounterEnd { counter } => {
                self.global_counters.matrix[index].push((code_u8, destination));
                self.global_counters.mark_used(usize::from(counter));
            }
            EventKind::GlobalTimerStart { timer } => {
                self.global_timers.start_matrix[index].push((code_u8, destination));
                self.global_timers.mark_used(usize::from(timer));
            }
            EventKind::GlobalTimerEnd { timer } => {
                self.global_timers.end_matrix[index].push((code_u8, destination));
                self.global_timers.mark_used(usize::from(timer));
            }
            EventKind::Io => self.input_matrix[index].push((code_u8, destination)),
        }
        Ok(())
    }

    fn add_action(
        &mut self,
        index: usize,
        state_name: &str,
        action_name: &str,
        value: &ActionValue,
    ) -> Result<(), StateMachineError> {
        let invalid = || StateMachineError::InvalidOutput {
            state: state_name.to_string(),
            output: action_name.to_string(),
            value: value.describe(),
        };

        // "Valve" and "LED" are conveniences that rewrite both the channel
        // and the value.
        if let Some((prefix, constant)) = match action_name {
            "Valve" => Some(("Valve", 1u32)),
            "LED" => Some(("PWM", 255u32)),
            _ => None,
        } {
            let n = value.as_int().ok_or_else(|| invalid())?;
            let code = self
                .layout
                .output_code(&format!("{prefix}{n}"))
                .ok_or_else(|| invalid())?;
            self.output_matrix[index].push((byte_sized("output code", code)?, constant));
            return Ok(());
        }

        let code = self.layout.output_code(action_name).ok_or_else(|| invalid())?;
        let output_kind = self.layout.outputs[code].kind;
        let wire_value = match output_kind {
            OutputKind::GlobalCounterReset => {
                let counter = value.as_int().ok_or_else(|| invalid())? as usize;
                if counter != 0 {
                    if counter > usize::from(self.hardware.n_global_counters) {
                        return Err(StateMachineError::InvalidIndex {
                            what: "global counter",
                            number: counter,
                        });
                    }
                    self.global_counters.reset_matrix[index] = counter as u8;
                    self.global_counters.mark_used(counter - 1);
                }
                counter as u32
            }
            OutputKind::GlobalTimerTrig => {
                // Integers name a single timer; bit strings trigger several.
                let mask = match value {
                    ActionValue::Int(n) => {
                        let n = *n as usize;
                        if n == 0 || n > usize::from(self.hardware.n_global_timers) {
                            return Err(StateMachineError::InvalidIndex {
                                what: "global timer",
                                number: n,
                            });
                        }
                        1u32 << (n - 1)
                    }
                    ActionValue::Bits(bits) => {
                        u32::from_str_radix(bits, 2).map_err(|_| invalid())?
                    }
                    _ => return Err(invalid()),
                };
                for bit in 0..32 {
                    if mask & (1 << bit) != 0 {
                        if bit >= usize::from(self.hardware.n_global_timers) {
                            return Err(StateMachineError::InvalidIndex {
                                what: "global timer",
                                number: bit + 1,
                            });
                        }
                        self.global_timers.mark_used(bit);
                    }
                }
                self.global_timers.triggers_matrix[index] = mask;
                mask
            }
            OutputKind::GlobalTimerCancel => {
                let timer = value.as_int().ok_or_else(|| invalid())? as usize;
                if timer == 0 || timer > usize::from(self.hardware.n_global_timers) {
                    return Err(StateMachineError::InvalidIndex {
                        what: "global timer",
                        number: timer,
                    });
                }
                self.global_timers.cancels_matrix[timer - 1] = 1;
                self.global_timers.mark_used(timer - 1);
                timer as u32
            }
            OutputKind::FlexAnalog { .. } => {
                let volts = value.as_volts().ok_or_else(|| invalid())?;
                quantize_volts(volts)?
            }
            OutputKind::AnalogThreshEnable | OutputKind::AnalogThreshDisable => {
                threshold_mask(value, self.layout.n_flex_channels)?
            }
            OutputKind::Uart { index: uart } => match value {
                // A byte list means implicit serial message programming; the
                // stored value becomes the library index.
                ActionValue::Bytes(bytes) => {
                    self.serial_message_mode = 1;
                    let max = self.hardware.serial_message_max_bytes();
                    u32::from(self.serial_messages[usize::from(uart)].intern(bytes, max)?)
                }
                _ => value.as_int().ok_or_else(|| invalid())?,
            },
            _ => value.as_int().ok_or_else(|| invalid())?,
        };

        self.output_matrix[index].push((byte_sized("output code", code)?, wire_value));
        Ok(())
    }

    fn timer_index(&self, number: usize) -> Result<usize, StateMachineError> {
        if number == 0 || number > usize::from(self.hardware.n_global_timers) {
            return Err(StateMachineError::InvalidIndex {
                what: "global timer",
                number,
            });
        }
        Ok(number - 1)
    }
}

fn byte_sized(what: &'static str, value: usize) -> Result<u8, StateMachineError> {
    u8::try_from(value).map_err(|_| StateMachineError::Overflow {
        what,
        value: value as u64,
    })
}

/// 12-bit quantization of a flex analog output voltage.
fn quantize_volts(volts: f64) -> Result<u32, StateMachineError> {
    const MAX_FLEX_VOLTAGE: f64 = 5.0;
    if !(0.0..=MAX_FLEX_VOLTAGE).contains(&volts) {
        return Err(StateMachineError::InvalidVoltage(volts));
    }
    Ok(((volts / MAX_FLEX_VOLTAGE) * 4095.0).round() as u32)
}

/// Encode an analog-threshold channel selection. MSB first: the rightmost
/// bit is flex channel index 0. A zero bit leaves that channel untouched.
fn threshold_mask(value: &ActionValue, n_flex: usize) -> Result<u32, StateMachineError> {
    let err = StateMachineError::InvalidThresholdMask { expected: n_flex };
    match value {
        ActionValue::Bits(bits) if bits.len() == n_flex => {
            u32::from_str_radix(bits, 2).map_err(|_| err)
        }
        ActionValue::BitList(bits) if bits.len() == n_flex => {
            if bits.iter().any(|b| *b > 1) {
                return Err(err);
            }
            Ok(bits.iter().fold(0u32, |acc, b| (acc << 1) | u32::from(*b)))
        }
        _ => Err(err),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::channels::ChannelLayout;
    use crate::hardware::testing::{classic_descriptor, flex_descriptor};
    use crate::hardware::FlexChannelType;
    use crate::modules::ModuleRegistry;

    pub fn classic_machine() -> StateMachine {
        let hw = Arc::new(classic_descriptor());
        let layout = Arc::new(ChannelLayout::resolve(&hw, &ModuleRegistry::detached(&hw)));
        StateMachine::new(hw, layout)
    }

    pub fn flex_machine(types: [FlexChannelType; 4]) -> StateMachine {
        let hw = Arc::new(flex_descriptor(types));
        let layout = Arc::new(ChannelLayout::resolve(&hw, &ModuleRegistry::detached(&hw)));
        StateMachine::new(hw, layout)
    }
}
