//! Trial run loop
//!
//! Streams a compiled state machine to the controller, demultiplexes the
//! event stream it sends back, keeps the per-trial bookkeeping and delivers
//! everything to the session sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channels::ChannelLayout;
use crate::compiler::CompiledStateMachine;
use crate::protocol::{command, reply, trial_opcode};
use crate::session::SessionSink;
use crate::transport::{Transport, TransportError, TransportExt};

/// Trial loop errors
#[derive(Debug, Error)]
pub enum TrialError {
    /// The controller answered something other than the install success code
    #[error("controller rejected the state machine descriptor (status {0})")]
    InstallRejected(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The cancel token was already tripped before the descriptor was sent
    #[error("trial cancelled before it started")]
    Cancelled,
}

/// One visit to a state (or a NaN pair for a state never entered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateOccurrence {
    pub name: String,
    /// Entry time in seconds from trial start
    pub start: f64,
    pub end: f64,
}

impl StateOccurrence {
    /// Whether the state was entered at all during the trial.
    pub fn visited(&self) -> bool {
        !self.start.is_nan()
    }
}

/// One input event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventOccurrence {
    pub code: u8,
    pub name: String,
    /// Seconds from trial start
    pub timestamp: f64,
}

/// Everything one trial produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: u32,
    /// Visited state ordinals in entry order
    pub states: Vec<u8>,
    /// Entry timestamps matching `states`, in seconds
    pub state_timestamps: Vec<f64>,
    pub state_occurrences: Vec<StateOccurrence>,
    pub events: Vec<EventOccurrence>,
    /// Trial end in seconds; NaN when the trial ended abnormally
    pub end_timestamp: f64,
    pub cancelled: bool,
}

impl Trial {
    fn new(id: u32) -> Self {
        Self {
            id,
            states: Vec::new(),
            state_timestamps: Vec::new(),
            state_occurrences: Vec::new(),
            events: Vec::new(),
            end_timestamp: f64::NAN,
            cancelled: false,
        }
    }
}

/// Cloneable stop signal for a running trial.
///
/// Safe to trip from another thread; the trial loop polls it between reads,
/// sends the abort opcode and drains the stream to the trial-end record.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token for the next trial.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs one trial over an exclusively borrowed transport.
pub struct TrialRunner<'a, T: Transport> {
    transport: &'a mut T,
    layout: &'a ChannelLayout,
    session: &'a mut dyn SessionSink,
    cancel: CancelToken,
    read_timeout: Duration,
}

impl<'a, T: Transport> TrialRunner<'a, T> {
    pub fn new(
        transport: &'a mut T,
        layout: &'a ChannelLayout,
        session: &'a mut dyn SessionSink,
        cancel: CancelToken,
        read_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            layout,
            session,
            cancel,
            read_timeout,
        }
    }

    /// Send the descriptor and run the trial to completion.
    pub fn run(
        &mut self,
        trial_id: u32,
        compiled: &CompiledStateMachine,
    ) -> Result<Trial, TrialError> {
        if self.cancel.is_cancelled() {
            return Err(TrialError::Cancelled);
        }

        self.transport.write_all(&compiled.frame())?;
        let status = self.install_status()?;
        if status != reply::STATE_MACHINE_INSTALLED {
            return Err(TrialError::InstallRejected(status));
        }

        let mut trial = Trial::new(trial_id);
        let ticks_per_second = f64::from(compiled.cycle_frequency);
        let mut aborting = false;

        loop {
            let opcode = match self.next_opcode(&mut aborting) {
                Ok(opcode) => opcode,
                Err(TransportError::Timeout) => {
                    // Dead air mid-trial: drain whatever straggles in and
                    // hand the session a synthetic end record.
                    let _ = self.transport.drain(Duration::from_millis(50));
                    self.session.on_info("trial read timed out");
                    self.session.on_trial(&trial);
                    return Err(TrialError::Transport(TransportError::Timeout));
                }
                Err(other) => return Err(TrialError::Transport(other)),
            };

            match opcode {
                trial_opcode::EVENT_BUNDLE => {
                    let count = self.transport.read_u8()?;
                    for _ in 0..count {
                        let code = self.transport.read_u8()?;
                        let timestamp =
                            f64::from(self.transport.read_u32()?) / ticks_per_second;
                        self.record(&mut trial, compiled, code, timestamp);
                    }
                }
                trial_opcode::SOFTCODE => {
                    let softcode = self.transport.read_u8()?;
                    self.session.on_softcode(softcode);
                }
                trial_opcode::TRIAL_END => {
                    trial.end_timestamp =
                        f64::from(self.transport.read_u32()?) / ticks_per_second;
                    break;
                }
                reply::KEEPALIVE_PING => {
                    tracing::debug!("keep-alive ping during trial, ignoring");
                }
                stray => {
                    tracing::debug!(byte = stray, "stray byte in trial stream, ignoring");
                }
            }
        }

        trial.cancelled = aborting;
        self.finish(&mut trial, compiled);
        Ok(trial)
    }

    /// Wait for the install confirmation, swallowing idle pings that were
    /// already in flight when the descriptor went out.
    fn install_status(&mut self) -> Result<u8, TrialError> {
        loop {
            let byte = self.transport.read_u8_within(self.read_timeout)?;
            if byte == reply::KEEPALIVE_PING {
                tracing::debug!("keep-alive ping before install status, ignoring");
                continue;
            }
            return Ok(byte);
        }
    }

    /// Next opcode, polling the cancel token while waiting. Trips once: the
    /// abort opcode is sent and the loop keeps draining until the trial-end
    /// record arrives.
    fn next_opcode(&mut self, aborting: &mut bool) -> Result<u8, TransportError> {
        let poll = Duration::from_millis(50).min(self.read_timeout);
        let mut waited = Duration::ZERO;
        loop {
            if self.cancel.is_cancelled() && !*aborting {
                *aborting = true;
                self.transport.write_all(&[command::STOP_TRIAL])?;
            }
            let mut buf = [0u8; 1];
            match self.transport.read_with_timeout(&mut buf, poll)? {
                0 => {
                    waited += poll;
                    if waited >= self.read_timeout {
                        return Err(TransportError::Timeout);
                    }
                }
                _ => return Ok(buf[0]),
            }
        }
    }

    /// Classify one bundle code: low codes are event occurrences, codes from
    /// `state_code_offset` upward announce state entries.
    fn record(
        &mut self,
        trial: &mut Trial,
        compiled: &CompiledStateMachine,
        code: u8,
        timestamp: f64,
    ) {
        let offset = compiled.state_code_offset;
        let code_usize = usize::from(code);
        if code_usize >= offset {
            let state = code_usize - offset;
            if state < usize::from(compiled.total_states) {
                trial.states.push(state as u8);
                trial.state_timestamps.push(timestamp);
            } else if state == usize::from(compiled.total_states) {
                tracing::debug!("exit marker in event stream");
            } else {
                tracing::debug!(code, "state code out of range, ignoring");
            }
        } else {
            trial.events.push(EventOccurrence {
                code,
                name: self.layout.event_name(code_usize).to_string(),
                timestamp,
            });
        }
    }

    /// Convert the raw visit list into per-state occurrences and deliver the
    /// whole trial through the session sink.
    fn finish(&mut self, trial: &mut Trial, compiled: &CompiledStateMachine) {
        let mut visited = vec![false; usize::from(compiled.total_states)];
        for (i, state) in trial.states.iter().enumerate() {
            let start = trial.state_timestamps[i];
            let end = trial
                .state_timestamps
                .get(i + 1)
                .copied()
                .unwrap_or(trial.end_timestamp);
            visited[usize::from(*state)] = true;
            trial.state_occurrences.push(StateOccurrence {
                name: compiled.state_names[usize::from(*state)].clone(),
                start,
                end,
            });
        }
        for (state, was_visited) in visited.iter().enumerate() {
            if !was_visited {
                trial.state_occurrences.push(StateOccurrence {
                    name: compiled.state_names[state].clone(),
                    start: f64::NAN,
                    end: f64::NAN,
                });
            }
        }

        for occurrence in &trial.state_occurrences {
            self.session.on_state(occurrence);
        }
        for event in &trial.events {
            self.session.on_event(event);
        }
        self.session.on_trial(trial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::session::MemorySession;
    use crate::state_machine::testing::classic_machine;
    use crate::state_machine::StateMachine;
    use crate::transport::testing::{ScriptedPort, SharedPort};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn two_state_machine() -> StateMachine {
        let mut sma = classic_machine();
        sma.add_state("Lit", 0.5, &[("Port1In", "Dark")], &[("LED", 1u8.into())])
            .unwrap();
        sma.add_state("Dark", 1.0, &[("Tup", "exit")], &[]).unwrap();
        sma
    }

    #[test]
    fn test_trial_streams_states_and_events() {
        let sma = two_state_machine();
        let compiled = compile(&sma, false).unwrap();
        let offset = compiled.state_code_offset as u8;
        let port1_in = sma.layout().event_code("Port1In").unwrap() as u8;

        let mut port = ScriptedPort::new();
        port.feed(&[reply::STATE_MACHINE_INSTALLED]);
        // bundle: enter state 0 at t=0, Port1In at 5000 cycles, enter state 1
        port.feed(&[trial_opcode::EVENT_BUNDLE, 3]);
        port.feed(&[offset]);
        port.feed(&0u32.to_le_bytes());
        port.feed(&[port1_in]);
        port.feed(&5_000u32.to_le_bytes());
        port.feed(&[offset + 1]);
        port.feed(&5_000u32.to_le_bytes());
        // end at 15000 cycles
        port.feed(&[trial_opcode::TRIAL_END]);
        port.feed(&15_000u32.to_le_bytes());

        let mut session = MemorySession::new();
        let layout = sma.layout().clone();
        let mut runner = TrialRunner::new(
            &mut port,
            &layout,
            &mut session,
            CancelToken::new(),
            TIMEOUT,
        );
        let trial = runner.run(1, &compiled).unwrap();

        // the descriptor went out first
        assert_eq!(&port.outgoing, &compiled.frame());
        assert_eq!(trial.states, vec![0, 1]);
        assert_eq!(trial.state_timestamps, vec![0.0, 0.5]);
        assert_eq!(trial.end_timestamp, 1.5);
        assert!(!trial.cancelled);

        assert_eq!(trial.state_occurrences.len(), 2);
        assert_eq!(trial.state_occurrences[0].name, "Lit");
        assert_eq!(trial.state_occurrences[0].start, 0.0);
        assert_eq!(trial.state_occurrences[0].end, 0.5);
        assert_eq!(trial.state_occurrences[1].end, 1.5);

        assert_eq!(trial.events.len(), 1);
        assert_eq!(trial.events[0].name, "Port1In");
        assert_eq!(trial.events[0].timestamp, 0.5);

        assert_eq!(session.trials.len(), 1);
        assert_eq!(session.states.len(), 2);
        assert_eq!(session.events.len(), 1);
    }

    #[test]
    fn test_unvisited_states_get_nan_occurrences() {
        let mut sma = classic_machine();
        sma.add_state("A", 0.1, &[("Tup", "B")], &[]).unwrap();
        sma.add_state("B", 0.1, &[("Tup", "C")], &[]).unwrap();
        sma.add_state("C", 0.1, &[("Tup", "exit")], &[]).unwrap();
        let compiled = compile(&sma, false).unwrap();
        let offset = compiled.state_code_offset as u8;

        let mut port = ScriptedPort::new();
        port.feed(&[reply::STATE_MACHINE_INSTALLED]);
        port.feed(&[trial_opcode::EVENT_BUNDLE, 1, offset]);
        port.feed(&0u32.to_le_bytes());
        port.feed(&[trial_opcode::TRIAL_END]);
        port.feed(&1_000u32.to_le_bytes());

        let mut session = MemorySession::new();
        let layout = sma.layout().clone();
        let mut runner = TrialRunner::new(
            &mut port,
            &layout,
            &mut session,
            CancelToken::new(),
            TIMEOUT,
        );
        let trial = runner.run(7, &compiled).unwrap();

        assert_eq!(trial.state_occurrences.len(), 3);
        assert!(trial.state_occurrences[0].visited());
        let unvisited: Vec<&str> = trial
            .state_occurrences
            .iter()
            .filter(|o| !o.visited())
            .map(|o| o.name.as_str())
            .collect();
        assert_eq!(unvisited, vec!["B", "C"]);
    }

    #[test]
    fn test_softcodes_reach_the_session() {
        let sma = two_state_machine();
        let compiled = compile(&sma, false).unwrap();

        let mut port = ScriptedPort::new();
        port.feed(&[reply::STATE_MACHINE_INSTALLED]);
        port.feed(&[trial_opcode::SOFTCODE, 9]);
        port.feed(&[trial_opcode::TRIAL_END]);
        port.feed(&0u32.to_le_bytes());

        let mut session = MemorySession::new();
        let layout = sma.layout().clone();
        let mut runner = TrialRunner::new(
            &mut port,
            &layout,
            &mut session,
            CancelToken::new(),
            TIMEOUT,
        );
        runner.run(1, &compiled).unwrap();
        assert_eq!(session.softcodes, vec![9]);
    }

    #[test]
    fn test_install_rejection() {
        let sma = two_state_machine();
        let compiled = compile(&sma, false).unwrap();

        let mut port = ScriptedPort::new();
        port.feed(&[3]);
        let mut session = MemorySession::new();
        let layout = sma.layout().clone();
        let mut runner = TrialRunner::new(
            &mut port,
            &layout,
            &mut session,
            CancelToken::new(),
            TIMEOUT,
        );
        let err = runner.run(1, &compiled).unwrap_err();
        assert!(matches!(err, TrialError::InstallRejected(3)));
    }

    #[test]
    fn test_pings_before_install_status_are_consumed() {
        let sma = two_state_machine();
        let compiled = compile(&sma, false).unwrap();

        let mut port = ScriptedPort::new();
        port.feed(&[reply::KEEPALIVE_PING, reply::KEEPALIVE_PING]);
        port.feed(&[reply::STATE_MACHINE_INSTALLED]);
        port.feed(&[trial_opcode::TRIAL_END]);
        port.feed(&0u32.to_le_bytes());

        let mut session = MemorySession::new();
        let layout = sma.layout().clone();
        let mut runner = TrialRunner::new(
            &mut port,
            &layout,
            &mut session,
            CancelToken::new(),
            TIMEOUT,
        );
        assert!(runner.run(1, &compiled).is_ok());
    }

    #[test]
    fn test_timeout_drains_and_posts_synthetic_record() {
        let sma = two_state_machine();
        let compiled = compile(&sma, false).unwrap();

        let mut port = ScriptedPort::new();
        port.feed(&[reply::STATE_MACHINE_INSTALLED]);
        // then silence

        let mut session = MemorySession::new();
        let layout = sma.layout().clone();
        let mut runner = TrialRunner::new(
            &mut port,
            &layout,
            &mut session,
            CancelToken::new(),
            Duration::from_millis(60),
        );
        let err = runner.run(1, &compiled).unwrap_err();
        assert!(matches!(err, TrialError::Transport(TransportError::Timeout)));
        assert_eq!(session.infos, vec!["trial read timed out"]);
        assert_eq!(session.trials.len(), 1);
        assert!(session.trials[0].end_timestamp.is_nan());
    }

    #[test]
    fn test_pre_tripped_token_refuses_to_start() {
        let sma = two_state_machine();
        let compiled = compile(&sma, false).unwrap();
        let mut port = ScriptedPort::new();
        let mut session = MemorySession::new();
        let token = CancelToken::new();
        token.cancel();
        let layout = sma.layout().clone();
        let mut runner = TrialRunner::new(&mut port, &layout, &mut session, token, TIMEOUT);
        let err = runner.run(1, &compiled).unwrap_err();
        assert!(matches!(err, TrialError::Cancelled));
        assert!(port.outgoing.is_empty());
    }

    #[test]
    fn test_cancellation_sends_abort_and_drains_to_end() {
        let sma = two_state_machine();
        let compiled = compile(&sma, false).unwrap();

        let port = SharedPort::new();
        port.feed(&[reply::STATE_MACHINE_INSTALLED]);

        let token = CancelToken::new();
        let feeder = {
            let port = port.clone();
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                token.cancel();
                std::thread::sleep(Duration::from_millis(60));
                let mut end = vec![trial_opcode::TRIAL_END];
                end.extend_from_slice(&10_000u32.to_le_bytes());
                port.feed(&end);
            })
        };

        let mut session = MemorySession::new();
        let layout = sma.layout().clone();
        let mut transport = port.clone();
        let mut runner = TrialRunner::new(
            &mut transport,
            &layout,
            &mut session,
            token,
            Duration::from_secs(5),
        );
        let trial = runner.run(1, &compiled).unwrap();
        feeder.join().unwrap();

        assert!(trial.cancelled);
        assert_eq!(trial.end_timestamp, 1.0);
        let outgoing = port.outgoing();
        assert_eq!(outgoing.last(), Some(&command::STOP_TRIAL));
    }
}
