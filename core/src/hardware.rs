//! Controller hardware description
//! Decoded from the capability reply and used everywhere a channel count or
//! format width is needed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::command;
use crate::transport::{Transport, TransportError, TransportExt};

/// Channel type tag reported by the controller for each physical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelTag {
    /// UART channel, optionally backed by an attached module
    Uart,
    /// USB softcode channel
    Usb,
    /// Behavior port (IR detector + LED + valve driver)
    Port,
    Bnc,
    Wire,
    /// Runtime-configurable flex channel
    Flex,
    Valve,
    Sync,
    /// Logical slot for global timer/counter wire positions
    Global,
}

impl ChannelTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'U' => Some(Self::Uart),
            b'X' => Some(Self::Usb),
            b'P' => Some(Self::Port),
            b'B' => Some(Self::Bnc),
            b'W' => Some(Self::Wire),
            b'F' => Some(Self::Flex),
            b'V' => Some(Self::Valve),
            b'S' => Some(Self::Sync),
            b'G' => Some(Self::Global),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Uart => b'U',
            Self::Usb => b'X',
            Self::Port => b'P',
            Self::Bnc => b'B',
            Self::Wire => b'W',
            Self::Flex => b'F',
            Self::Valve => b'V',
            Self::Sync => b'S',
            Self::Global => b'G',
        }
    }
}

/// Direction/mode a flex channel is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FlexChannelType {
    DigitalIn = 0,
    DigitalOut = 1,
    AnalogIn = 2,
    AnalogOut = 3,
}

impl FlexChannelType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::DigitalIn),
            1 => Some(Self::DigitalOut),
            2 => Some(Self::AnalogIn),
            3 => Some(Self::AnalogOut),
            _ => None,
        }
    }
}

/// Capability reply decode errors
#[derive(Debug, Error)]
pub enum HardwareDecodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unknown channel tag 0x{0:02x} in capability reply")]
    UnknownTag(u8),
    #[error("flex channel type list must have {expected} entries, got {got}")]
    FlexTypeCount { expected: usize, got: usize },
}

/// Everything the controller reports about itself.
///
/// Built once per connection and read-only afterwards, except for the flex
/// channel configuration which the connection replaces wholesale when the
/// user reconfigures flex directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareDescriptor {
    pub max_states: u16,
    /// State machine cycle period in microseconds
    pub cycle_period_us: u16,
    pub max_serial_events: u16,
    pub n_global_timers: u8,
    pub n_global_counters: u8,
    pub n_conditions: u8,
    pub inputs: Vec<ChannelTag>,
    /// Physical outputs plus three trailing `Global` slots for the
    /// timer-trigger, timer-cancel and counter-reset logical channels
    pub outputs: Vec<ChannelTag>,
    /// One entry per `Flex` input tag
    pub flex_channel_types: Vec<FlexChannelType>,
    pub firmware_version: u16,
    pub machine_type: u8,
}

impl HardwareDescriptor {
    /// Issue the capability query and decode the reply.
    pub fn read_from<T: Transport + ?Sized>(
        transport: &mut T,
        firmware_version: u16,
        machine_type: u8,
    ) -> Result<Self, HardwareDecodeError> {
        transport.write_all(&[command::HARDWARE_DESCRIPTION])?;

        let max_states = transport.read_u16()?;
        let cycle_period_us = transport.read_u16()?;
        let max_serial_events = transport.read_u16()?;
        let n_global_timers = transport.read_u8()?;
        let n_global_counters = transport.read_u8()?;
        let n_conditions = transport.read_u8()?;

        let n_inputs = transport.read_u8()? as usize;
        let mut inputs = Vec::with_capacity(n_inputs);
        for byte in transport.read_vec(n_inputs)? {
            inputs.push(ChannelTag::from_byte(byte).ok_or(HardwareDecodeError::UnknownTag(byte))?);
        }

        let n_outputs = transport.read_u8()? as usize;
        let mut outputs = Vec::with_capacity(n_outputs + 3);
        for byte in transport.read_vec(n_outputs)? {
            outputs.push(ChannelTag::from_byte(byte).ok_or(HardwareDecodeError::UnknownTag(byte))?);
        }
        outputs.extend([ChannelTag::Global; 3]);

        let n_flex = inputs.iter().filter(|t| **t == ChannelTag::Flex).count();
        let descriptor = Self {
            max_states,
            cycle_period_us,
            max_serial_events,
            n_global_timers,
            n_global_counters,
            n_conditions,
            inputs,
            outputs,
            // Flex channels come up as digital inputs until reconfigured.
            flex_channel_types: vec![FlexChannelType::DigitalIn; n_flex],
            firmware_version,
            machine_type,
        };
        tracing::debug!(?descriptor, "decoded hardware description");
        Ok(descriptor)
    }

    /// State machine tick rate in Hz.
    pub fn cycle_frequency(&self) -> u32 {
        1_000_000 / u32::from(self.cycle_period_us)
    }

    /// Coarse hardware generation, derived from the firmware line.
    pub fn board_version(&self) -> u8 {
        if self.firmware_version < 7 {
            5
        } else {
            7
        }
    }

    /// Whether the wide binary format (u16 output values, u16 serial message
    /// indices, flex features, analog threshold ops) applies.
    pub fn wide_format(&self) -> bool {
        self.machine_type > 3
    }

    /// Longest serial message the controller's message library accepts.
    pub fn serial_message_max_bytes(&self) -> usize {
        if self.machine_type > 3 {
            5
        } else {
            3
        }
    }

    pub fn n_uart_channels(&self) -> usize {
        self.inputs
            .iter()
            .filter(|t| **t == ChannelTag::Uart)
            .count()
    }

    pub fn n_flex_channels(&self) -> usize {
        self.flex_channel_types.len()
    }

    /// Input-enable flags sent right after the handshake: BNC and Wire
    /// inputs on, the first three behavior ports on, everything else off.
    pub fn default_inputs_enabled(&self) -> Vec<u8> {
        let mut enabled = vec![0u8; self.inputs.len()];
        let mut ports_enabled = 0;
        for (i, tag) in self.inputs.iter().enumerate() {
            match tag {
                ChannelTag::Bnc | ChannelTag::Wire => enabled[i] = 1,
                ChannelTag::Port if ports_enabled < 3 => {
                    enabled[i] = 1;
                    ports_enabled += 1;
                }
                _ => {}
            }
        }
        enabled
    }

    /// Replace the flex channel configuration. The list must cover every
    /// flex channel.
    pub fn set_flex_channel_types(
        &mut self,
        types: &[FlexChannelType],
    ) -> Result<(), HardwareDecodeError> {
        let expected = self
            .inputs
            .iter()
            .filter(|t| **t == ChannelTag::Flex)
            .count();
        if types.len() != expected {
            return Err(HardwareDecodeError::FlexTypeCount {
                expected,
                got: types.len(),
            });
        }
        self.flex_channel_types = types.to_vec();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Canned descriptors shared by the layout, builder and compiler tests.

    use super::*;

    fn tags(pattern: &str) -> Vec<ChannelTag> {
        pattern
            .bytes()
            .map(|b| ChannelTag::from_byte(b).unwrap())
            .collect()
    }

    /// Classic machine: two UARTs, a softcode channel, BNC/Wire pairs and
    /// four behavior ports with their valve drivers. Narrow binary format.
    pub fn classic_descriptor() -> HardwareDescriptor {
        let mut outputs = tags("UUXVVVVBBWWPPPP");
        outputs.extend([ChannelTag::Global; 3]);
        HardwareDescriptor {
            max_states: 255,
            cycle_period_us: 100,
            max_serial_events: 45,
            n_global_timers: 5,
            n_global_counters: 5,
            n_conditions: 5,
            inputs: tags("UUXBBWWPPPP"),
            outputs,
            flex_channel_types: vec![],
            firmware_version: 22,
            machine_type: 3,
        }
    }

    /// Flex-generation machine: wide format, four flex channels.
    pub fn flex_descriptor(flex_types: [FlexChannelType; 4]) -> HardwareDescriptor {
        let mut outputs = tags("UUXVVVVFFFFBBPPPP");
        outputs.extend([ChannelTag::Global; 3]);
        HardwareDescriptor {
            max_states: 255,
            cycle_period_us: 100,
            max_serial_events: 45,
            n_global_timers: 5,
            n_global_counters: 5,
            n_conditions: 5,
            inputs: tags("UUXFFFFBBPPPP"),
            outputs,
            flex_channel_types: flex_types.to_vec(),
            firmware_version: 23,
            machine_type: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{classic_descriptor, flex_descriptor};
    use super::*;
    use crate::transport::testing::ScriptedPort;

    #[test]
    fn test_tag_round_trip() {
        for byte in [b'U', b'X', b'P', b'B', b'W', b'F', b'V', b'S', b'G'] {
            let tag = ChannelTag::from_byte(byte).unwrap();
            assert_eq!(tag.as_byte(), byte);
        }
        assert_eq!(ChannelTag::from_byte(b'Q'), None);
    }

    #[test]
    fn test_read_from_capability_reply() {
        let mut port = ScriptedPort::new();
        port.feed(&[0xFF, 0x00]); // max_states = 255
        port.feed(&[100, 0]); // cycle period 100us
        port.feed(&[45, 0]); // max serial events
        port.feed(&[5, 5, 5]); // timers, counters, conditions
        port.feed(&[4]);
        port.feed(b"UXBP");
        port.feed(&[3]);
        port.feed(b"UXP");

        let hw = HardwareDescriptor::read_from(&mut port, 22, 3).unwrap();
        assert_eq!(port.outgoing, vec![command::HARDWARE_DESCRIPTION]);
        assert_eq!(hw.max_states, 255);
        assert_eq!(hw.cycle_frequency(), 10_000);
        assert_eq!(hw.inputs.len(), 4);
        // three logical Global slots are appended to the physical outputs
        assert_eq!(hw.outputs.len(), 6);
        assert_eq!(&hw.outputs[3..], [ChannelTag::Global; 3]);
        assert!(!hw.wide_format());
        assert_eq!(hw.serial_message_max_bytes(), 3);
    }

    #[test]
    fn test_read_from_rejects_unknown_tag() {
        let mut port = ScriptedPort::new();
        port.feed(&[1, 0, 100, 0, 45, 0, 5, 5, 5, 1]);
        port.feed(b"Q");
        let err = HardwareDescriptor::read_from(&mut port, 22, 3).unwrap_err();
        assert!(matches!(err, HardwareDecodeError::UnknownTag(b'Q')));
    }

    #[test]
    fn test_board_version_tracks_firmware_line() {
        let mut hw = classic_descriptor();
        hw.firmware_version = 6;
        assert_eq!(hw.board_version(), 5);
        hw.firmware_version = 7;
        assert_eq!(hw.board_version(), 7);
    }

    #[test]
    fn test_default_inputs_enabled() {
        let hw = classic_descriptor();
        // UUXBBWWPPPP: BNC + Wire on, first three ports on
        assert_eq!(hw.default_inputs_enabled(), vec![0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 0]);
    }

    #[test]
    fn test_flex_type_replacement_checks_length() {
        let mut hw = flex_descriptor([FlexChannelType::DigitalIn; 4]);
        assert!(hw
            .set_flex_channel_types(&[FlexChannelType::AnalogOut; 4])
            .is_ok());
        let err = hw
            .set_flex_channel_types(&[FlexChannelType::AnalogOut; 3])
            .unwrap_err();
        assert!(matches!(
            err,
            HardwareDecodeError::FlexTypeCount { expected: 4, got: 3 }
        ));
        assert_eq!(hw.serial_message_max_bytes(), 5);
        assert!(hw.wide_format());
    }
}
