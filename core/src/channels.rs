//! Channel layout resolution
//!
//! The controller addresses events and outputs by dense indices. This module
//! deterministically expands the hardware's channel type tags (plus the
//! probed module registry) into the three ordered name spaces and the table
//! of base positions used when encoding a state machine. Reproducing the
//! exact ordering is the compatibility contract with the firmware;
//! placeholder `"---"` entries keep indices stable when flex channels change
//! direction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::hardware::{ChannelTag, FlexChannelType, HardwareDescriptor};
use crate::modules::ModuleRegistry;

/// What an event means to the state machine builder.
///
/// Classification happens once, here; `add_state` dispatches on the tag and
/// never inspects event names again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Ordinary input event (port, BNC, wire, flex, module, softcode)
    Io,
    GlobalTimerStart { timer: u8 },
    GlobalTimerEnd { timer: u8 },
    GlobalCounterEnd { counter: u8 },
    Condition { condition: u8 },
    /// The per-state timer expiry (`Tup`)
    StateTimer,
}

/// An entry in the event list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub kind: EventKind,
}

/// What an output channel does, resolved once at layout time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    /// UART channel; `index` is the serial message library it addresses
    Uart { index: u8 },
    SoftCode,
    Valve,
    Bnc,
    Wire,
    Pwm,
    FlexDigital { flex: u8 },
    FlexAnalog { flex: u8 },
    /// Flex channel currently configured as an input
    Placeholder,
    GlobalTimerTrig,
    GlobalTimerCancel,
    GlobalCounterReset,
    AnalogThreshEnable,
    AnalogThreshDisable,
}

/// An entry in the output channel list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChannel {
    pub name: String,
    pub kind: OutputKind,
}

/// Base positions of each channel family, zero-based indices into the
/// respective list. Used when encoding matrices as offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPositions {
    pub event_usb: usize,
    pub event_port: usize,
    pub event_bnc: usize,
    pub event_wire: usize,
    pub event_flex: usize,
    pub global_timer_start: usize,
    pub global_timer_end: usize,
    pub global_counter: usize,
    pub condition: usize,
    pub tup: usize,
    pub output_usb: usize,
    pub output_valve: usize,
    pub output_bnc: usize,
    pub output_wire: usize,
    pub output_pwm: usize,
    pub output_flex: usize,
    pub global_timer_trigger: usize,
    pub global_timer_cancel: usize,
    pub global_counter_reset: usize,
    pub analog_thresh_enable: usize,
    pub analog_thresh_disable: usize,
}

/// The resolved channel layout. Immutable after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub events: Vec<Event>,
    pub input_channel_names: Vec<String>,
    pub outputs: Vec<OutputChannel>,
    pub positions: EventPositions,
    pub n_flex_channels: usize,
    event_index: HashMap<String, usize>,
    input_index: HashMap<String, usize>,
    output_index: HashMap<String, usize>,
}

impl ChannelLayout {
    /// Expand the hardware description into the dense event and output
    /// channel index spaces.
    pub fn resolve(hardware: &HardwareDescriptor, modules: &ModuleRegistry) -> Self {
        let mut layout = Self {
            events: Vec::new(),
            input_channel_names: Vec::new(),
            outputs: Vec::new(),
            positions: EventPositions::default(),
            n_flex_channels: hardware.n_flex_channels(),
            event_index: HashMap::new(),
            input_index: HashMap::new(),
            output_index: HashMap::new(),
        };
        layout.resolve_inputs(hardware, modules);
        layout.resolve_outputs(hardware, modules);
        layout.index_names();
        tracing::debug!(
            n_events = layout.events.len(),
            n_outputs = layout.outputs.len(),
            "resolved channel layout"
        );
        layout
    }

    fn resolve_inputs(&mut self, hardware: &HardwareDescriptor, modules: &ModuleRegistry) {
        let mut n_usb = 0usize;
        let mut n_uart = 0usize;
        let mut n_ports = 0usize;
        let mut n_bnc = 0usize;
        let mut n_wires = 0usize;
        let mut n_flex = 0usize;
        let softcodes = usize::from(hardware.max_serial_events) / (modules.len() + 1);

        for tag in &hardware.inputs {
            match tag {
                ChannelTag::Uart => {
                    n_uart += 1;
                    let (module_name, slots, names) = match modules.get(n_uart - 1) {
                        Some(m) if m.connected => {
                            (m.name.clone(), m.n_serial_events, m.event_names.clone())
                        }
                        Some(m) => (m.name.clone(), m.n_serial_events, Vec::new()),
                        None => (format!("Serial{n_uart}"), 0, Vec::new()),
                    };
                    self.input_channel_names.push(module_name.clone());
                    for j in 0..slots {
                        let event = match names.get(j) {
                            Some(n) => format!("{module_name}_{n}"),
                            None => format!("{module_name}_{}", j + 1),
                        };
                        self.push_event(event, EventKind::Io);
                    }
                }
                ChannelTag::Usb => {
                    if n_usb == 0 {
                        self.positions.event_usb = self.events.len();
                    }
                    n_usb += 1;
                    self.input_channel_names.push(format!("USB{n_usb}"));
                    for j in 0..softcodes {
                        self.push_event(format!("SoftCode{}", j + 1), EventKind::Io);
                    }
                }
                ChannelTag::Port => {
                    if n_ports == 0 {
                        self.positions.event_port = self.events.len();
                    }
                    n_ports += 1;
                    let channel = format!("Port{n_ports}");
                    self.push_event(format!("{channel}In"), EventKind::Io);
                    self.push_event(format!("{channel}Out"), EventKind::Io);
                    self.input_channel_names.push(channel);
                }
                ChannelTag::Bnc => {
                    if n_bnc == 0 {
                        self.positions.event_bnc = self.events.len();
                    }
                    n_bnc += 1;
                    let channel = format!("BNC{n_bnc}");
                    self.push_event(format!("{channel}High"), EventKind::Io);
                    self.push_event(format!("{channel}Low"), EventKind::Io);
                    self.input_channel_names.push(channel);
                }
                ChannelTag::Wire => {
                    if n_wires == 0 {
                        self.positions.event_wire = self.events.len();
                    }
                    n_wires += 1;
                    let channel = format!("Wire{n_wires}");
                    self.push_event(format!("{channel}High"), EventKind::Io);
                    self.push_event(format!("{channel}Low"), EventKind::Io);
                    self.input_channel_names.push(channel);
                }
                ChannelTag::Flex => {
                    if n_flex == 0 {
                        self.positions.event_flex = self.events.len();
                    }
                    let flex_type = hardware.flex_channel_types.get(n_flex).copied();
                    n_flex += 1;
                    match flex_type {
                        Some(FlexChannelType::DigitalIn) => {
                            let channel = format!("Flex{n_flex}");
                            self.push_event(format!("{channel}High"), EventKind::Io);
                            self.push_event(format!("{channel}Low"), EventKind::Io);
                            self.input_channel_names.push(channel);
                        }
                        Some(FlexChannelType::AnalogIn) => {
                            let channel = format!("Flex{n_flex}");
                            self.push_event(format!("{channel}Trig1"), EventKind::Io);
                            self.push_event(format!("{channel}Trig2"), EventKind::Io);
                            self.input_channel_names.push(channel);
                        }
                        // Output-configured flex channels hold their two
                        // event slots with placeholders.
                        _ => {
                            self.push_event("---".into(), EventKind::Io);
                            self.push_event("---".into(), EventKind::Io);
                            self.input_channel_names.push("---".into());
                        }
                    }
                }
                _ => {}
            }
        }

        self.positions.global_timer_start = self.events.len();
        for k in 0..hardware.n_global_timers {
            self.push_event(
                format!("GlobalTimer{}_Start", k + 1),
                EventKind::GlobalTimerStart { timer: k },
            );
        }

        self.positions.global_timer_end = self.events.len();
        for k in 0..hardware.n_global_timers {
            self.push_event(
                format!("GlobalTimer{}_End", k + 1),
                EventKind::GlobalTimerEnd { timer: k },
            );
            self.input_channel_names.push(format!("GlobalTimer{}", k + 1));
        }

        self.positions.global_counter = self.events.len();
        for k in 0..hardware.n_global_counters {
            self.push_event(
                format!("GlobalCounter{}_End", k + 1),
                EventKind::GlobalCounterEnd { counter: k },
            );
        }

        self.positions.condition = self.events.len();
        for k in 0..hardware.n_conditions {
            self.push_event(format!("Condition{}", k + 1), EventKind::Condition { condition: k });
        }

        self.positions.tup = self.events.len();
        self.push_event("Tup".into(), EventKind::StateTimer);
    }

    fn resolve_outputs(&mut self, hardware: &HardwareDescriptor, modules: &ModuleRegistry) {
        let mut n_usb = 0usize;
        let mut n_uart = 0usize;
        let mut n_valves = 0usize;
        let mut n_bnc = 0usize;
        let mut n_wires = 0usize;
        let mut n_ports = 0usize;
        let mut n_flex = 0usize;

        for tag in &hardware.outputs {
            match tag {
                ChannelTag::Uart => {
                    n_uart += 1;
                    let name = match modules.get(n_uart - 1) {
                        Some(m) if m.connected => m.name.clone(),
                        _ => format!("Serial{n_uart}"),
                    };
                    self.push_output(name, OutputKind::Uart { index: (n_uart - 1) as u8 });
                }
                ChannelTag::Usb => {
                    if n_usb == 0 {
                        self.positions.output_usb = self.outputs.len();
                    }
                    n_usb += 1;
                    self.push_output("SoftCode".into(), OutputKind::SoftCode);
                }
                ChannelTag::Valve => {
                    if n_valves == 0 {
                        self.positions.output_valve = self.outputs.len();
                    }
                    n_valves += 1;
                    self.push_output(format!("Valve{n_valves}"), OutputKind::Valve);
                }
                ChannelTag::Bnc => {
                    if n_bnc == 0 {
                        self.positions.output_bnc = self.outputs.len();
                    }
                    n_bnc += 1;
                    self.push_output(format!("BNC{n_bnc}"), OutputKind::Bnc);
                }
                ChannelTag::Wire => {
                    if n_wires == 0 {
                        self.positions.output_wire = self.outputs.len();
                    }
                    n_wires += 1;
                    self.push_output(format!("Wire{n_wires}"), OutputKind::Wire);
                }
                ChannelTag::Port => {
                    if n_ports == 0 {
                        self.positions.output_pwm = self.outputs.len();
                    }
                    n_ports += 1;
                    self.push_output(format!("PWM{n_ports}"), OutputKind::Pwm);
                }
                ChannelTag::Flex => {
                    if n_flex == 0 {
                        self.positions.output_flex = self.outputs.len();
                    }
                    let flex_type = hardware.flex_channel_types.get(n_flex).copied();
                    let flex = n_flex as u8;
                    n_flex += 1;
                    match flex_type {
                        Some(FlexChannelType::DigitalOut) => {
                            self.push_output(format!("Flex{n_flex}DO"), OutputKind::FlexDigital { flex });
                        }
                        Some(FlexChannelType::AnalogOut) => {
                            self.push_output(format!("Flex{n_flex}AO"), OutputKind::FlexAnalog { flex });
                        }
                        _ => self.push_output("---".into(), OutputKind::Placeholder),
                    }
                }
                _ => {}
            }
        }

        self.positions.global_timer_trigger = self.outputs.len();
        self.push_output("GlobalTimerTrig".into(), OutputKind::GlobalTimerTrig);
        self.positions.global_timer_cancel = self.outputs.len();
        self.push_output("GlobalTimerCancel".into(), OutputKind::GlobalTimerCancel);
        self.positions.global_counter_reset = self.outputs.len();
        self.push_output("GlobalCounterReset".into(), OutputKind::GlobalCounterReset);

        if hardware.machine_type > 3 {
            self.positions.analog_thresh_enable = self.outputs.len();
            self.push_output("AnalogThreshEnable".into(), OutputKind::AnalogThreshEnable);
            self.positions.analog_thresh_disable = self.outputs.len();
            self.push_output("AnalogThreshDisable".into(), OutputKind::AnalogThreshDisable);
        }
    }

    fn push_event(&mut self, name: String, kind: EventKind) {
        self.events.push(Event { name, kind });
    }

    fn push_output(&mut self, name: String, kind: OutputKind) {
        self.outputs.push(OutputChannel { name, kind });
    }

    /// Build the name lookup maps, skipping placeholders. First occurrence
    /// wins for duplicated names.
    fn index_names(&mut self) {
        for (i, event) in self.events.iter().enumerate() {
            if event.name != "---" {
                self.event_index.entry(event.name.clone()).or_insert(i);
            }
        }
        for (i, name) in self.input_channel_names.iter().enumerate() {
            if name != "---" {
                self.input_index.entry(name.clone()).or_insert(i);
            }
        }
        for (i, output) in self.outputs.iter().enumerate() {
            if output.name != "---" {
                self.output_index.entry(output.name.clone()).or_insert(i);
            }
        }
    }

    pub fn event_code(&self, name: &str) -> Option<usize> {
        self.event_index.get(name).copied()
    }

    pub fn event(&self, code: usize) -> Option<&Event> {
        self.events.get(code)
    }

    pub fn event_name(&self, code: usize) -> &str {
        self.events.get(code).map(|e| e.name.as_str()).unwrap_or("unknown event")
    }

    pub fn output_code(&self, name: &str) -> Option<usize> {
        self.output_index.get(name).copied()
    }

    pub fn input_channel_code(&self, name: &str) -> Option<usize> {
        self.input_index.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::testing::{classic_descriptor, flex_descriptor};
    use crate::hardware::FlexChannelType;
    use crate::modules::UartModule;

    fn classic_layout() -> ChannelLayout {
        let hw = classic_descriptor();
        ChannelLayout::resolve(&hw, &ModuleRegistry::detached(&hw))
    }

    #[test]
    fn test_event_walk_order_and_positions() {
        let layout = classic_layout();
        // UUXBBWWPPPP with 15 events per serial channel
        assert_eq!(layout.events[0].name, "Serial1_1");
        assert_eq!(layout.events[14].name, "Serial1_15");
        assert_eq!(layout.events[15].name, "Serial2_1");
        assert_eq!(layout.positions.event_usb, 30);
        assert_eq!(layout.events[30].name, "SoftCode1");
        assert_eq!(layout.positions.event_bnc, 45);
        assert_eq!(layout.events[45].name, "BNC1High");
        assert_eq!(layout.events[46].name, "BNC1Low");
        assert_eq!(layout.positions.event_wire, 49);
        assert_eq!(layout.positions.event_port, 53);
        assert_eq!(layout.events[53].name, "Port1In");
        assert_eq!(layout.events[54].name, "Port1Out");

        // tails: 5 timers start, 5 end, 5 counters, 5 conditions, Tup
        assert_eq!(layout.positions.global_timer_start, 61);
        assert_eq!(layout.events[61].name, "GlobalTimer1_Start");
        assert_eq!(layout.positions.global_timer_end, 66);
        assert_eq!(layout.positions.global_counter, 71);
        assert_eq!(layout.positions.condition, 76);
        assert_eq!(layout.positions.tup, 81);
        assert_eq!(layout.events[81].name, "Tup");
        assert_eq!(layout.events.len(), 82);
        assert_eq!(layout.events[81].kind, EventKind::StateTimer);
        assert_eq!(
            layout.events[66].kind,
            EventKind::GlobalTimerEnd { timer: 0 }
        );
    }

    #[test]
    fn test_input_channel_names_include_timer_channels() {
        let layout = classic_layout();
        let names = &layout.input_channel_names;
        assert_eq!(&names[..3], &["Serial1", "Serial2", "USB1"]);
        assert!(names.contains(&"GlobalTimer5".to_string()));
        assert_eq!(layout.input_channel_code("Port2"), Some(8));
    }

    #[test]
    fn test_output_walk_order_and_positions() {
        let layout = classic_layout();
        // UUXVVVVBBWWPPPP + trig/cancel/reset
        assert_eq!(layout.outputs[0].name, "Serial1");
        assert_eq!(layout.positions.output_usb, 2);
        assert_eq!(layout.positions.output_valve, 3);
        assert_eq!(layout.outputs[3].name, "Valve1");
        assert_eq!(layout.positions.output_bnc, 7);
        assert_eq!(layout.positions.output_wire, 9);
        assert_eq!(layout.positions.output_pwm, 11);
        assert_eq!(layout.outputs[11].name, "PWM1");
        assert_eq!(layout.positions.global_timer_trigger, 15);
        assert_eq!(layout.outputs[15].name, "GlobalTimerTrig");
        assert_eq!(layout.positions.global_timer_cancel, 16);
        assert_eq!(layout.positions.global_counter_reset, 17);
        assert_eq!(layout.outputs.len(), 18);
        // narrow machines have no analog threshold channels
        assert_eq!(layout.output_code("AnalogThreshEnable"), None);
    }

    #[test]
    fn test_flex_layout_mixed_directions() {
        let hw = flex_descriptor([
            FlexChannelType::DigitalIn,
            FlexChannelType::AnalogIn,
            FlexChannelType::DigitalOut,
            FlexChannelType::AnalogOut,
        ]);
        let layout = ChannelLayout::resolve(&hw, &ModuleRegistry::detached(&hw));

        // inputs UUXFFFFBB...: flex events start after 2x15 serial + 15 softcodes
        assert_eq!(layout.positions.event_flex, 45);
        assert_eq!(layout.events[45].name, "Flex1High");
        assert_eq!(layout.events[46].name, "Flex1Low");
        assert_eq!(layout.events[47].name, "Flex2Trig1");
        assert_eq!(layout.events[48].name, "Flex2Trig2");
        // output-configured channels hold their slots with placeholders
        assert_eq!(layout.events[49].name, "---");
        assert_eq!(layout.events[52].name, "---");
        assert_eq!(layout.event_code("---"), None);

        // outputs UUXVVVVFFFF...: placeholders for the input-configured flex
        assert_eq!(layout.positions.output_flex, 7);
        assert_eq!(layout.outputs[7].name, "---");
        assert_eq!(layout.outputs[8].name, "---");
        assert_eq!(layout.outputs[9].name, "Flex3DO");
        assert_eq!(layout.outputs[10].name, "Flex4AO");
        assert_eq!(
            layout.outputs[10].kind,
            OutputKind::FlexAnalog { flex: 3 }
        );

        // wide machines append the analog threshold channels
        let n = layout.outputs.len();
        assert_eq!(layout.outputs[n - 2].name, "AnalogThreshEnable");
        assert_eq!(layout.outputs[n - 1].name, "AnalogThreshDisable");
        assert_eq!(layout.positions.analog_thresh_enable, n - 2);
        assert_eq!(layout.positions.analog_thresh_disable, n - 1);
    }

    #[test]
    fn test_connected_module_names_events() {
        let hw = classic_descriptor();
        let mut probed = UartModule::disconnected(0, 3);
        probed.connected = true;
        probed.name = "RotaryEncoder1".into();
        probed.event_names = vec!["cw".into(), "ccw".into()];
        let modules =
            ModuleRegistry::from_modules(vec![probed, UartModule::disconnected(1, 15)]);
        let layout = ChannelLayout::resolve(&hw, &modules);
        assert_eq!(layout.events[0].name, "RotaryEncoder1_cw");
        assert_eq!(layout.events[1].name, "RotaryEncoder1_ccw");
        assert_eq!(layout.events[2].name, "RotaryEncoder1_3");
        assert_eq!(layout.events[3].name, "Serial2_1");
        assert_eq!(layout.input_channel_names[0], "RotaryEncoder1");
        assert_eq!(layout.outputs[0].name, "RotaryEncoder1");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let hw = classic_descriptor();
        let modules = ModuleRegistry::detached(&hw);
        let a = ChannelLayout::resolve(&hw, &modules);
        let b = ChannelLayout::resolve(&hw, &modules);
        assert_eq!(a, b);
    }
}
