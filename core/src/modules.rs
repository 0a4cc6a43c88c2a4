//! UART module registry
//! Probes the controller for modules attached to its UART channels. Connected
//! modules contribute their own names and event names to the channel layout;
//! empty channels fall back to generic `Serial{n}` naming.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hardware::HardwareDescriptor;
use crate::protocol::{command, reply};
use crate::transport::{Transport, TransportError, TransportExt};

/// One UART channel, connected module or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartModule {
    pub connected: bool,
    /// Module self-reported name, or `Serial{n}` when nothing answered
    pub name: String,
    pub firmware_version: u32,
    /// Event slots this channel occupies in the event list
    pub n_serial_events: usize,
    /// Module-defined event names; slots past the end are numbered
    pub event_names: Vec<String>,
}

impl UartModule {
    /// Placeholder for a channel with nothing attached.
    pub fn disconnected(channel_index: usize, n_serial_events: usize) -> Self {
        Self {
            connected: false,
            name: format!("Serial{}", channel_index + 1),
            firmware_version: 0,
            n_serial_events,
            event_names: Vec::new(),
        }
    }
}

/// The set of UART channels as last probed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRegistry {
    modules: Vec<UartModule>,
}

impl ModuleRegistry {
    /// Registry built from an explicit module list.
    pub fn from_modules(modules: Vec<UartModule>) -> Self {
        Self { modules }
    }

    /// Registry for a machine where no modules are attached.
    pub fn detached(hardware: &HardwareDescriptor) -> Self {
        let n_uart = hardware.n_uart_channels();
        let per_channel = default_events_per_channel(hardware, n_uart);
        Self {
            modules: (0..n_uart)
                .map(|i| UartModule::disconnected(i, per_channel))
                .collect(),
        }
    }

    /// Ask the controller what is attached to each UART channel.
    ///
    /// The reply carries one record per channel: a connected flag, then for
    /// connected modules the firmware version, a length-prefixed name, and a
    /// run of flagged sub-records (`'#'` extra event slots, `'E'` event
    /// names) terminated by a zero flag.
    pub fn probe<T: Transport + ?Sized>(
        transport: &mut T,
        hardware: &HardwareDescriptor,
        deadline: Duration,
    ) -> Result<Self, TransportError> {
        let n_uart = hardware.n_uart_channels();
        let per_channel = default_events_per_channel(hardware, n_uart);

        transport.write_all(&[command::GET_MODULES])?;
        let mut modules = Vec::with_capacity(n_uart);
        for channel in 0..n_uart {
            let connected = transport.read_u8_within(deadline)?;
            if connected != 1 {
                modules.push(UartModule::disconnected(channel, per_channel));
                continue;
            }

            let firmware_version = transport.read_u32()?;
            let name_len = transport.read_u8()? as usize;
            let name = String::from_utf8_lossy(&transport.read_vec(name_len)?).into_owned();
            let mut module = UartModule {
                connected: true,
                name,
                firmware_version,
                n_serial_events: per_channel,
                event_names: Vec::new(),
            };

            while transport.read_u8()? == reply::MODULE_MORE_INFO {
                match transport.read_u8()? {
                    reply::MODULE_REQUESTED_EVENTS => {
                        module.n_serial_events = transport.read_u8()? as usize;
                    }
                    reply::MODULE_EVENT_NAMES => {
                        let count = transport.read_u8()? as usize;
                        for _ in 0..count {
                            let len = transport.read_u8()? as usize;
                            module
                                .event_names
                                .push(String::from_utf8_lossy(&transport.read_vec(len)?).into_owned());
                        }
                    }
                    other => {
                        tracing::debug!(record = other, channel, "skipping unknown module record");
                        break;
                    }
                }
            }
            tracing::debug!(name = %module.name, channel, "module connected");
            modules.push(module);
        }
        Ok(Self { modules })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get(&self, channel: usize) -> Option<&UartModule> {
        self.modules.get(channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UartModule> {
        self.modules.iter()
    }
}

/// Event slots granted to each serial channel: the softcode channel counts
/// as one more consumer of the shared event pool.
fn default_events_per_channel(hardware: &HardwareDescriptor, n_uart: usize) -> usize {
    usize::from(hardware.max_serial_events) / (n_uart + 1)
}
