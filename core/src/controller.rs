//! Controller connection
//!
//! Owns the serial transport for its whole lifetime, performs the connect
//! handshake and capability discovery, and exposes the host API surface:
//! channel configuration, serial message management, descriptor upload and
//! trial execution.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channels::ChannelLayout;
use crate::compiler::{compile, CompileError, CompiledStateMachine};
use crate::hardware::{FlexChannelType, HardwareDecodeError, HardwareDescriptor};
use crate::modules::ModuleRegistry;
use crate::protocol::{command, reply};
use crate::session::SessionSink;
use crate::state_machine::{StateMachine, StateMachineError};
use crate::transport::{Transport, TransportError, TransportExt};
use crate::trial::{CancelToken, Trial, TrialError, TrialRunner};

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unexpected handshake byte 0x{0:02x}")]
    UnexpectedByte(u8),
    /// Reported through the session as a warning; fatal only when the
    /// firmware cannot speak this protocol at all
    #[error("controller firmware {device} does not match target {target}")]
    WrongFirmware { device: u16, target: u16 },
    #[error("unsupported machine type {0}")]
    WrongMachine(u16),
}

/// Connection-level errors
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Hardware(#[from] HardwareDecodeError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Trial(#[from] TrialError),
    #[error("command 0x{command:02x} failed with status {status}")]
    CommandFailed { command: u8, status: u8 },
    #[error("{what} has the wrong length")]
    BadParameter { what: &'static str },
    #[error("connection is no longer usable, only close() is allowed")]
    ConnectionPoisoned,
}

impl Error {
    fn poisons(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Trial(TrialError::Transport(_))
        )
    }
}

/// Connection parameters.
///
/// `serial_port` is consumed by whichever adapter opens the link; the core
/// only carries it. `target_firmware` drives nothing but a compatibility
/// warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub serial_port: String,
    pub target_firmware: u16,
    /// Channel mirroring state transitions, 255 = off
    pub sync_channel: u8,
    pub sync_mode: u8,
    pub handshake_timeout: Duration,
    pub trial_read_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyACM0".into(),
            target_firmware: 23,
            sync_channel: 255,
            sync_mode: 1,
            handshake_timeout: Duration::from_secs(1),
            trial_read_timeout: Duration::from_secs(600),
        }
    }
}

/// A live connection to the controller.
pub struct Controller<T: Transport> {
    transport: T,
    config: Config,
    hardware: Arc<HardwareDescriptor>,
    layout: Arc<ChannelLayout>,
    modules: ModuleRegistry,
    session: Box<dyn SessionSink>,
    cancel: CancelToken,
    usable: bool,
}

impl<T: Transport> std::fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("usable", &self.usable)
            .finish()
    }
}

impl<T: Transport> Controller<T> {
    /// Handshake, discover capabilities, probe modules and resolve the
    /// channel layout.
    pub fn open(
        mut transport: T,
        mut session: Box<dyn SessionSink>,
        config: Config,
    ) -> Result<Self, Error> {
        let deadline = config.handshake_timeout;

        transport.write_all(&[command::HANDSHAKE])?;
        loop {
            let byte = transport.read_u8_within(deadline)?;
            match byte {
                reply::HANDSHAKE_OK => break,
                reply::KEEPALIVE_PING => {
                    tracing::debug!("keep-alive ping during handshake, ignoring");
                }
                other => return Err(HandshakeError::UnexpectedByte(other).into()),
            }
        }

        transport.write_all(&[command::FIRMWARE_VERSION])?;
        let firmware_version = transport.read_u16()?;
        // Legacy firmware answers with the version alone; newer lines append
        // the machine type.
        let mut type_buf = [0u8; 2];
        let machine_type = match transport.read_with_timeout(&mut type_buf, deadline)? {
            2 => {
                let raw = u16::from_le_bytes(type_buf);
                if raw == 0 || raw > 4 {
                    return Err(HandshakeError::WrongMachine(raw).into());
                }
                raw as u8
            }
            0 => {
                tracing::debug!("no machine type in firmware reply, assuming legacy machine");
                1
            }
            _ => return Err(HandshakeError::UnexpectedByte(type_buf[0]).into()),
        };

        if firmware_version != config.target_firmware {
            let warning = HandshakeError::WrongFirmware {
                device: firmware_version,
                target: config.target_firmware,
            };
            tracing::warn!(%warning, "firmware mismatch");
            session.on_info(&warning.to_string());
        }

        let hardware = HardwareDescriptor::read_from(&mut transport, firmware_version, machine_type)?;

        Self::expect_ok_on(
            &mut transport,
            deadline,
            command::ENABLE_PORTS,
            &hardware.default_inputs_enabled(),
        )?;
        Self::expect_ok_on(
            &mut transport,
            deadline,
            command::SYNC_CHANNEL_MODE,
            &[config.sync_channel, config.sync_mode],
        )?;

        let modules = ModuleRegistry::probe(&mut transport, &hardware, deadline)?;
        let layout = ChannelLayout::resolve(&hardware, &modules);
        session.on_info(&format!(
            "connected: firmware {firmware_version}, machine type {machine_type}, {} events",
            layout.events.len()
        ));

        Ok(Self {
            transport,
            config,
            hardware: Arc::new(hardware),
            layout: Arc::new(layout),
            modules,
            session,
            cancel: CancelToken::new(),
            usable: true,
        })
    }

    pub fn hardware(&self) -> &HardwareDescriptor {
        &self.hardware
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fresh symbolic machine bound to this connection's layout.
    pub fn new_state_machine(&self) -> StateMachine {
        StateMachine::new(Arc::clone(&self.hardware), Arc::clone(&self.layout))
    }

    /// Handle for stopping the running trial from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Reconfigure flex channel directions. The descriptor and channel
    /// layout are re-resolved, so existing `StateMachine`s keep the old
    /// index space and should be discarded.
    pub fn set_flex_channel_types(&mut self, types: &[FlexChannelType]) -> Result<(), Error> {
        self.ensure_usable()?;
        let payload: Vec<u8> = types.iter().map(|t| *t as u8).collect();
        let result = (|| {
            self.command_ok(command::SET_FLEX_CHANNEL_TYPES, &payload)?;
            let mut hardware = (*self.hardware).clone();
            hardware.set_flex_channel_types(types)?;
            let layout = ChannelLayout::resolve(&hardware, &self.modules);
            self.hardware = Arc::new(hardware);
            self.layout = Arc::new(layout);
            Ok(())
        })();
        self.track(result)
    }

    /// Set the low/high analog thresholds (raw 12-bit units) per flex channel.
    pub fn set_analog_input_thresholds(&mut self, low: &[u16], high: &[u16]) -> Result<(), Error> {
        self.ensure_usable()?;
        self.check_flex_len("analog thresholds", low.len())?;
        self.check_flex_len("analog thresholds", high.len())?;
        let mut payload = Vec::with_capacity((low.len() + high.len()) * 2);
        for value in low.iter().chain(high) {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        let result = self.command_ok(command::SET_ANALOG_INPUT_THRESHOLDS, &payload);
        self.track(result)
    }

    /// Threshold crossing direction per flex channel: 0 fires above, 1 below.
    pub fn set_analog_input_threshold_polarity(
        &mut self,
        low: &[u8],
        high: &[u8],
    ) -> Result<(), Error> {
        self.ensure_usable()?;
        self.check_flex_len("threshold polarity", low.len())?;
        self.check_flex_len("threshold polarity", high.len())?;
        let mut payload = Vec::with_capacity(low.len() + high.len());
        payload.extend_from_slice(low);
        payload.extend_from_slice(high);
        let result = self.command_ok(command::SET_ANALOG_THRESHOLD_POLARITY, &payload);
        self.track(result)
    }

    /// Threshold re-arm behavior per flex channel.
    pub fn set_analog_input_threshold_mode(&mut self, modes: &[u8]) -> Result<(), Error> {
        self.ensure_usable()?;
        self.check_flex_len("threshold mode", modes.len())?;
        let result = self.command_ok(command::SET_ANALOG_THRESHOLD_MODE, modes);
        self.track(result)
    }

    /// Enable or disable one threshold (1 or 2) on one flex channel.
    pub fn enable_analog_input_threshold(
        &mut self,
        threshold: u8,
        channel: u8,
        enable: bool,
    ) -> Result<(), Error> {
        self.ensure_usable()?;
        let result = self.command_ok(
            command::ENABLE_ANALOG_THRESHOLD,
            &[threshold, channel, u8::from(enable)],
        );
        self.track(result)
    }

    /// Store one message in the controller's serial message library.
    pub fn load_serial_message(
        &mut self,
        channel: u8,
        index: u8,
        message: &[u8],
    ) -> Result<(), Error> {
        self.ensure_usable()?;
        let max = self.hardware.serial_message_max_bytes();
        if message.is_empty() || message.len() > max {
            return Err(StateMachineError::SerialMessageTooLong { max }.into());
        }
        let mut payload = vec![channel, 1, index, message.len() as u8];
        payload.extend_from_slice(message);
        let result = self.command_ok(command::LOAD_SERIAL_MESSAGE, &payload);
        self.track(result)
    }

    /// Clear every serial message library on the controller.
    pub fn reset_serial_messages(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        let result = self.command_ok(command::RESET_SERIAL_MESSAGES, &[]);
        self.track(result)
    }

    /// Zero the controller's trial clock.
    pub fn reset_clock(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        let result = self.command_ok(command::RESET_CLOCK, &[]);
        self.track(result)
    }

    /// Compile and install a state machine without running it. With `asap`
    /// the controller applies it as soon as the current trial allows.
    pub fn send_state_machine(
        &mut self,
        sma: &StateMachine,
        asap: bool,
    ) -> Result<CompiledStateMachine, Error> {
        self.ensure_usable()?;
        let compiled = compile(sma, asap)?;
        let result = (|| {
            self.transport.write_all(&compiled.frame())?;
            let status = self.read_reply_byte()?;
            if status != reply::STATE_MACHINE_INSTALLED {
                return Err(TrialError::InstallRejected(status).into());
            }
            Ok(())
        })();
        self.track(result)?;
        Ok(compiled)
    }

    /// Compile, install and run one trial to completion.
    pub fn run_state_machine(&mut self, trial_id: u32, sma: &StateMachine) -> Result<Trial, Error> {
        self.ensure_usable()?;
        let compiled = compile(sma, false)?;
        let result = {
            let mut runner = TrialRunner::new(
                &mut self.transport,
                &self.layout,
                &mut *self.session,
                self.cancel.clone(),
                self.config.trial_read_timeout,
            );
            runner.run(trial_id, &compiled).map_err(Error::from)
        };
        // a consumed stop signal must not leak into the next trial
        self.cancel.reset();
        self.track(result)
    }

    /// Trip the cancel signal for the trial in progress.
    pub fn stop(&mut self) {
        self.cancel.cancel();
    }

    /// Direct access to the session sink.
    pub fn session(&mut self) -> &mut dyn SessionSink {
        &mut *self.session
    }

    /// Disconnect. On a poisoned connection this is a plain drop.
    pub fn close(mut self) -> Result<(), Error> {
        if !self.usable {
            return Ok(());
        }
        self.transport.write_all(&[command::DISCONNECT])?;
        let status = self.read_reply_byte()?;
        if status != reply::DISCONNECT_OK {
            return Err(Error::CommandFailed {
                command: command::DISCONNECT,
                status,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn ensure_usable(&self) -> Result<(), Error> {
        if self.usable {
            Ok(())
        } else {
            Err(Error::ConnectionPoisoned)
        }
    }

    fn track<V>(&mut self, result: Result<V, Error>) -> Result<V, Error> {
        if let Err(error) = &result {
            if error.poisons() {
                tracing::warn!(%error, "transport failure, poisoning connection");
                self.usable = false;
            }
        }
        result
    }

    fn check_flex_len(&self, what: &'static str, len: usize) -> Result<(), Error> {
        if len == self.hardware.n_flex_channels() {
            Ok(())
        } else {
            Err(Error::BadParameter { what })
        }
    }

    /// One reply byte, ignoring idle keep-alive pings.
    fn read_reply_byte(&mut self) -> Result<u8, Error> {
        loop {
            let byte = self
                .transport
                .read_u8_within(self.config.handshake_timeout)?;
            if byte == reply::KEEPALIVE_PING {
                tracing::debug!("keep-alive ping, ignoring");
                continue;
            }
            return Ok(byte);
        }
    }

    fn command_ok(&mut self, opcode: u8, payload: &[u8]) -> Result<(), Error> {
        let mut message = Vec::with_capacity(1 + payload.len());
        message.push(opcode);
        message.extend_from_slice(payload);
        self.transport.write_all(&message)?;
        let status = self.read_reply_byte()?;
        if status != reply::COMMAND_OK {
            return Err(Error::CommandFailed {
                command: opcode,
                status,
            });
        }
        Ok(())
    }

    fn expect_ok_on(
        transport: &mut T,
        deadline: Duration,
        opcode: u8,
        payload: &[u8],
    ) -> Result<(), Error> {
        let mut message = Vec::with_capacity(1 + payload.len());
        message.push(opcode);
        message.extend_from_slice(payload);
        transport.write_all(&message)?;
        loop {
            let status = transport.read_u8_within(deadline)?;
            if status == reply::KEEPALIVE_PING {
                continue;
            }
            if status != reply::COMMAND_OK {
                return Err(Error::CommandFailed {
                    command: opcode,
                    status,
                });
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::trial_opcode;
    use crate::session::MemorySession;
    use crate::transport::testing::ScriptedPort;

    /// Feed the full open() conversation for the classic machine.
    fn feed_open_replies(port: &mut ScriptedPort, firmware: u16, machine_type: u16) {
        port.feed(&[reply::HANDSHAKE_OK]);
        port.feed(&firmware.to_le_bytes());
        port.feed(&machine_type.to_le_bytes());
        // capability reply
        port.feed(&255u16.to_le_bytes());
        port.feed(&100u16.to_le_bytes());
        port.feed(&45u16.to_le_bytes());
        port.feed(&[5, 5, 5]);
        port.feed(&[11]);
        port.feed(b"UUXBBWWPPPP");
        port.feed(&[15]);
        port.feed(b"UUXVVVVBBWWPPPP");
        // enable ports, sync channel
        port.feed(&[reply::COMMAND_OK, reply::COMMAND_OK]);
        // module probe: both UART channels empty
        port.feed(&[0, 0]);
    }

    fn open_classic() -> Controller<ScriptedPort> {
        let mut port = ScriptedPort::new();
        feed_open_replies(&mut port, 22, 3);
        Controller::open(port, Box::new(MemorySession::new()), Config::default()).unwrap()
    }

    #[test]
    fn test_open_handshake_sequence() {
        let mut port = ScriptedPort::new();
        // a stray ping in front of the handshake reply must be ignored
        port.feed(&[reply::KEEPALIVE_PING]);
        feed_open_replies(&mut port, 22, 3);
        let controller =
            Controller::open(port, Box::new(MemorySession::new()), Config::default()).unwrap();

        assert_eq!(controller.hardware().firmware_version, 22);
        assert_eq!(controller.hardware().machine_type, 3);
        assert_eq!(controller.layout().events.len(), 82);
        assert_eq!(controller.modules().len(), 2);

        let out = &controller.transport.outgoing;
        assert_eq!(out[0], command::HANDSHAKE);
        assert_eq!(out[1], command::FIRMWARE_VERSION);
        assert_eq!(out[2], command::HARDWARE_DESCRIPTION);
        assert_eq!(out[3], command::ENABLE_PORTS);
        // enable flags for UUXBBWWPPPP
        assert_eq!(&out[4..15], &[0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 0]);
        assert_eq!(out[15], command::SYNC_CHANNEL_MODE);
        assert_eq!(&out[16..18], &[255, 1]);
        assert_eq!(out[18], command::GET_MODULES);
    }

    #[test]
    fn test_open_rejects_bad_handshake_byte() {
        let mut port = ScriptedPort::new();
        port.feed(&[b'4']);
        let err = Controller::open(port, Box::new(MemorySession::new()), Config::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::UnexpectedByte(b'4'))
        ));
    }

    #[test]
    fn test_open_legacy_firmware_without_machine_type() {
        use crate::transport::testing::SharedPort;

        let port = SharedPort::new();
        port.feed(&[reply::HANDSHAKE_OK]);
        port.feed(&6u16.to_le_bytes());
        // the machine type never arrives; the descriptor shows up only once
        // the capability query goes out
        let feeder = {
            let port = port.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(150));
                port.feed(&128u16.to_le_bytes());
                port.feed(&100u16.to_le_bytes());
                port.feed(&45u16.to_le_bytes());
                port.feed(&[5, 5, 5]);
                port.feed(&[4]);
                port.feed(b"UXBP");
                port.feed(&[4]);
                port.feed(b"UXBP");
                port.feed(&[reply::COMMAND_OK, reply::COMMAND_OK]);
                port.feed(&[0]);
            })
        };

        let config = Config {
            handshake_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let controller =
            Controller::open(port, Box::new(MemorySession::new()), config).unwrap();
        feeder.join().unwrap();
        assert_eq!(controller.hardware().machine_type, 1);
        assert_eq!(controller.hardware().board_version(), 5);
    }

    #[test]
    fn test_open_warns_on_firmware_mismatch() {
        use std::sync::{Arc, Mutex};

        let mut port = ScriptedPort::new();
        feed_open_replies(&mut port, 22, 3);
        let session = Arc::new(Mutex::new(MemorySession::new()));
        // default target firmware is 23, the device says 22
        let _controller =
            Controller::open(port, Box::new(session.clone()), Config::default()).unwrap();

        let infos = session.lock().unwrap().infos.clone();
        assert!(infos[0].contains("firmware 22"));
        assert!(infos[0].contains("target 23"));
        assert!(infos[1].starts_with("connected:"));
    }

    #[test]
    fn test_command_failure_does_not_poison() {
        let mut controller = open_classic();
        controller.transport.feed(&[0]);
        let err = controller.reset_clock().unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        // connection still usable for the next command
        controller.transport.feed(&[reply::COMMAND_OK]);
        assert!(controller.reset_clock().is_ok());
    }

    #[test]
    fn test_transport_failure_poisons_connection() {
        let mut controller = open_classic();
        // nothing fed: reply read times out
        let err = controller.reset_clock().unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Timeout)));
        let err = controller.reset_clock().unwrap_err();
        assert!(matches!(err, Error::ConnectionPoisoned));
        // close on a poisoned connection is a silent drop
        assert!(controller.close().is_ok());
    }

    #[test]
    fn test_load_serial_message_validates_and_frames() {
        let mut controller = open_classic();
        let err = controller
            .load_serial_message(0, 0, &[1, 2, 3, 4])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StateMachine(StateMachineError::SerialMessageTooLong { max: 3 })
        ));

        controller.transport.feed(&[reply::COMMAND_OK]);
        controller.transport.outgoing.clear();
        controller.load_serial_message(1, 4, &[9, 8]).unwrap();
        assert_eq!(
            controller.transport.outgoing,
            vec![command::LOAD_SERIAL_MESSAGE, 1, 1, 4, 2, 9, 8]
        );
    }

    #[test]
    fn test_run_state_machine_round_trip() {
        let mut controller = open_classic();
        let mut sma = controller.new_state_machine();
        sma.add_state("Only", 1.0, &[("Tup", "exit")], &[]).unwrap();

        let offset = controller.layout().positions.tup + 1;
        controller.transport.feed(&[reply::STATE_MACHINE_INSTALLED]);
        controller
            .transport
            .feed(&[trial_opcode::EVENT_BUNDLE, 1, offset as u8]);
        controller.transport.feed(&0u32.to_le_bytes());
        controller.transport.feed(&[trial_opcode::TRIAL_END]);
        controller.transport.feed(&10_000u32.to_le_bytes());

        let trial = controller.run_state_machine(3, &sma).unwrap();
        assert_eq!(trial.id, 3);
        assert_eq!(trial.states, vec![0]);
        assert_eq!(trial.end_timestamp, 1.0);
    }

    #[test]
    fn test_close_sends_disconnect() {
        let mut controller = open_classic();
        controller.transport.feed(&[reply::DISCONNECT_OK]);
        controller.transport.outgoing.clear();
        // move out for close
        let controller = controller;
        controller.close().unwrap();
    }
}
