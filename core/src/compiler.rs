//! State machine compiler
//!
//! Resolves forward references, validates ranges and emits the exact binary
//! descriptor the controller installs. The format is conditional on machine
//! type (narrow/wide value widths) and firmware version (counter reset
//! compression). Compilation is pure: the symbolic machine is not modified.

use thiserror::Error;

use crate::codec::WireWriter;
use crate::protocol::command;
use crate::state_machine::{Destination, StateMachine};

/// Compiler errors
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("state {0} was referenced by name but never declared")]
    UndeclaredState(String),
    #[error("some states were referenced by name but not subsequently declared")]
    DanglingReference,
    #[error("{what} {value} does not fit the wire format")]
    Overflow { what: &'static str, value: u64 },
}

/// The fully serialized descriptor plus the metadata the trial runner needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStateMachine {
    /// `['C', asap, use_255_back]` + u16 body length
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    /// Trigger/cancel/onset masks, element width set by the timer count
    pub timer_block: Vec<u8>,
    /// Tick-converted state timers, timer durations/delays/intervals and
    /// counter thresholds
    pub bit32_block: Vec<u8>,
    /// Flag-prefixed configuration ops executed at trial onset
    pub additional_ops: Vec<u8>,
    pub state_names: Vec<String>,
    pub total_states: u8,
    pub cycle_frequency: u32,
    /// First wire code that denotes a state entry in the trial stream; codes
    /// below it are plain event occurrences
    pub state_code_offset: usize,
}

impl CompiledStateMachine {
    /// The five blocks in transmission order.
    pub fn frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(
            self.header.len()
                + self.body.len()
                + self.timer_block.len()
                + self.bit32_block.len()
                + self.additional_ops.len(),
        );
        frame.extend_from_slice(&self.header);
        frame.extend_from_slice(&self.body);
        frame.extend_from_slice(&self.timer_block);
        frame.extend_from_slice(&self.bit32_block);
        frame.extend_from_slice(&self.additional_ops);
        frame
    }
}

/// Per-state transition rows with all forward references replaced.
struct ResolvedMatrices {
    state_timer: Vec<Destination>,
    input: Vec<Vec<(u8, Destination)>>,
    timer_start: Vec<Vec<(u8, Destination)>>,
    timer_end: Vec<Vec<(u8, Destination)>>,
    counter: Vec<Vec<(u8, Destination)>>,
    condition: Vec<Vec<(u8, Destination)>>,
}

/// Compile a symbolic machine into the controller's binary descriptor.
pub fn compile(sma: &StateMachine, asap: bool) -> Result<CompiledStateMachine, CompileError> {
    let hardware = sma.hardware();
    let layout = sma.layout();

    if sma.manifest.len() > sma.total_states_added {
        return Err(CompileError::DanglingReference);
    }
    let n_states = u8::try_from(sma.total_states_added).map_err(|_| CompileError::Overflow {
        what: "state count",
        value: sma.total_states_added as u64,
    })?;

    let resolved = resolve(sma)?;
    let wide = hardware.wide_format();
    let n_timers = sma.global_timers.highest_used_count();
    let n_counters = sma.global_counters.highest_used_count();
    let n_conditions = sma.conditions.highest_used_count();

    // ------------------------------------------------------------------
    // body
    // ------------------------------------------------------------------
    let mut body = WireWriter::new();
    body.put_u8(n_states);
    body.put_u8(n_timers as u8);
    body.put_u8(n_counters as u8);
    body.put_u8(n_conditions as u8);

    // STATE_TIMER_MATRIX
    for destination in &resolved.state_timer {
        body.put_u8(destination_byte(*destination, n_states)?);
    }

    // INPUT_MATRIX: raw event codes
    put_transition_rows(&mut body, &resolved.input, 0, n_states)?;

    // OUTPUT_MATRIX: only physical outputs, the logical channels past the
    // timer-trigger position live in their own blocks
    let trigger_position = layout.positions.global_timer_trigger;
    for row in &sma.output_matrix {
        let entries: Vec<&(u8, u32)> = row
            .iter()
            .filter(|(code, _)| usize::from(*code) < trigger_position)
            .collect();
        put_scalar(&mut body, entries.len() as u32, wide, "output count")?;
        for (code, value) in entries {
            put_scalar(&mut body, u32::from(*code), wide, "output code")?;
            put_scalar(&mut body, *value, wide, "output value")?;
        }
    }

    // Transition matrices addressed relative to their base positions
    put_transition_rows(
        &mut body,
        &resolved.timer_start,
        layout.positions.global_timer_start,
        n_states,
    )?;
    put_transition_rows(
        &mut body,
        &resolved.timer_end,
        layout.positions.global_timer_end,
        n_states,
    )?;
    put_transition_rows(
        &mut body,
        &resolved.counter,
        layout.positions.global_counter,
        n_states,
    )?;
    put_transition_rows(
        &mut body,
        &resolved.condition,
        layout.positions.condition,
        n_states,
    )?;

    // GLOBAL_TIMER_CHANNELS
    for i in 0..n_timers {
        body.put_u8(sma.global_timers.channels[i]);
    }
    // GLOBAL_TIMER_ON/OFF_MESSAGES: zero means "no message" on the wire
    for i in 0..n_timers {
        let v = sma.global_timers.on_messages[i];
        put_scalar(&mut body, u32::from(if v == 0 { 255 } else { v }), wide, "timer on message")?;
    }
    for i in 0..n_timers {
        let v = sma.global_timers.off_messages[i];
        put_scalar(&mut body, u32::from(if v == 0 { 255 } else { v }), wide, "timer off message")?;
    }
    for i in 0..n_timers {
        body.put_u8(sma.global_timers.loop_mode[i]);
    }
    for i in 0..n_timers {
        body.put_u8(sma.global_timers.send_events[i]);
    }
    // GLOBAL_COUNTER_ATTACHED_EVENTS
    for i in 0..n_counters {
        body.put_u8(sma.global_counters.attached_events[i]);
    }
    // CONDITION_CHANNELS / CONDITION_VALUES
    for i in 0..n_conditions {
        body.put_u8(sma.conditions.channels[i]);
    }
    for i in 0..n_conditions {
        body.put_u8(sma.conditions.values[i]);
    }

    // GLOBAL_COUNTER_RESETS: firmware 23 sends only the overrides
    if hardware.firmware_version < 23 {
        for i in 0..usize::from(n_states) {
            body.put_u8(sma.global_counters.reset_matrix[i]);
        }
    } else {
        let overrides: Vec<(usize, u8)> = sma
            .global_counters
            .reset_matrix
            .iter()
            .enumerate()
            .take(usize::from(n_states))
            .filter(|(_, counter)| **counter != 0)
            .map(|(i, counter)| (i, *counter))
            .collect();
        body.put_u8(byte_checked(overrides.len(), "counter reset override count")?);
        for (state, counter) in overrides {
            body.put_u8(state as u8);
            body.put_u8(counter);
        }
    }

    // ANALOG_THRESHOLDS_ENABLE / _DISABLE: wide machines only, non-zero
    // masks only
    if wide {
        for position in [
            layout.positions.analog_thresh_enable,
            layout.positions.analog_thresh_disable,
        ] {
            let mut pairs: Vec<(u8, u8)> = Vec::new();
            for (state, row) in sma.output_matrix.iter().enumerate().take(usize::from(n_states)) {
                for (code, value) in row {
                    if usize::from(*code) == position && *value != 0 {
                        pairs.push((
                            state as u8,
                            u8::try_from(*value).map_err(|_| CompileError::Overflow {
                                what: "analog threshold mask",
                                value: u64::from(*value),
                            })?,
                        ));
                    }
                }
            }
            body.put_u8(byte_checked(pairs.len(), "analog threshold override count")?);
            for (state, mask) in pairs {
                body.put_u8(state);
                body.put_u8(mask);
            }
        }
    }

    // ------------------------------------------------------------------
    // timer block
    // ------------------------------------------------------------------
    let mask_width = timer_mask_width(hardware.n_global_timers);
    let mut timer_block = WireWriter::new();
    for i in 0..usize::from(n_states) {
        put_mask(&mut timer_block, sma.global_timers.triggers_matrix[i], mask_width)?;
    }
    for i in 0..usize::from(n_states) {
        let cancel = sma.global_timers.cancels_matrix.get(i).copied().unwrap_or(0);
        put_mask(&mut timer_block, cancel, mask_width)?;
    }
    for i in 0..n_timers {
        put_mask(&mut timer_block, sma.global_timers.onset_matrix[i], mask_width)?;
    }

    // ------------------------------------------------------------------
    // 32-bit block: everything in controller cycles
    // ------------------------------------------------------------------
    let frequency = f64::from(hardware.cycle_frequency());
    let mut bit32 = WireWriter::new();
    for i in 0..usize::from(n_states) {
        bit32.put_u32(ticks(sma.state_timers[i], frequency, "state timer")?);
    }
    for i in 0..n_timers {
        bit32.put_u32(ticks(sma.global_timers.timers[i], frequency, "global timer duration")?);
    }
    for i in 0..n_timers {
        bit32.put_u32(ticks(
            sma.global_timers.on_set_delays[i],
            frequency,
            "global timer on-set delay",
        )?);
    }
    for i in 0..n_timers {
        bit32.put_u32(ticks(
            sma.global_timers.loop_intervals[i],
            frequency,
            "global timer loop interval",
        )?);
    }
    for i in 0..n_counters {
        bit32.put_u32(sma.global_counters.thresholds[i]);
    }

    // ------------------------------------------------------------------
    // additional ops: implicit serial message library loads
    // ------------------------------------------------------------------
    let mut ops = WireWriter::new();
    if sma.serial_message_mode == 1 {
        for (channel, library) in sma.serial_messages().iter().enumerate() {
            if library.is_empty() {
                continue;
            }
            ops.put_u8(1);
            ops.put_u8(command::LOAD_SERIAL_MESSAGE);
            ops.put_u8(channel as u8);
            ops.put_u8(byte_checked(library.len(), "serial message count")?);
            for (index, message) in library.iter().enumerate() {
                ops.put_u8(index as u8);
                ops.put_prefixed_bytes(message);
            }
        }
    }
    ops.put_u8(0);

    // ------------------------------------------------------------------
    // header
    // ------------------------------------------------------------------
    let body_len = u16::try_from(body.len()).map_err(|_| CompileError::Overflow {
        what: "body length",
        value: body.len() as u64,
    })?;
    let mut header = WireWriter::with_capacity(5);
    header.put_u8(command::NEW_STATE_MATRIX);
    header.put_u8(u8::from(asap));
    header.put_u8(u8::from(sma.use_255_back_signal));
    header.put_u16(body_len);

    let compiled = CompiledStateMachine {
        header: header.into_bytes(),
        body: body.into_bytes(),
        timer_block: timer_block.into_bytes(),
        bit32_block: bit32.into_bytes(),
        additional_ops: ops.into_bytes(),
        state_names: sma.state_names.clone(),
        total_states: n_states,
        cycle_frequency: hardware.cycle_frequency(),
        state_code_offset: layout.positions.tup + 1,
    };
    tracing::debug!(
        states = n_states,
        body_len,
        timers = n_timers,
        counters = n_counters,
        conditions = n_conditions,
        "compiled state machine"
    );
    Ok(compiled)
}

/// Replace every `Unresolved` destination with the ordinal the name ended up
/// with in the manifest.
fn resolve(sma: &StateMachine) -> Result<ResolvedMatrices, CompileError> {
    let lookup = |destination: Destination| -> Result<Destination, CompileError> {
        match destination {
            Destination::Unresolved(k) => {
                let name = &sma.undeclared[usize::from(k)];
                match sma.manifest.iter().position(|n| n == name) {
                    Some(i) => Ok(Destination::State(i as u16)),
                    None => Err(CompileError::UndeclaredState(name.clone())),
                }
            }
            other => Ok(other),
        }
    };
    let rows = |matrix: &[Vec<(u8, Destination)>]| -> Result<Vec<Vec<(u8, Destination)>>, CompileError> {
        matrix
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(code, destination)| Ok((*code, lookup(*destination)?)))
                    .collect()
            })
            .collect()
    };

    Ok(ResolvedMatrices {
        state_timer: sma
            .state_timer_matrix
            .iter()
            .map(|d| lookup(*d))
            .collect::<Result<_, _>>()?,
        input: rows(&sma.input_matrix)?,
        timer_start: rows(&sma.global_timers.start_matrix)?,
        timer_end: rows(&sma.global_timers.end_matrix)?,
        counter: rows(&sma.global_counters.matrix)?,
        condition: rows(&sma.conditions.matrix)?,
    })
}

fn destination_byte(destination: Destination, n_states: u8) -> Result<u8, CompileError> {
    match destination {
        Destination::State(i) => u8::try_from(i).map_err(|_| CompileError::Overflow {
            what: "destination state",
            value: u64::from(i),
        }),
        Destination::Exit => Ok(n_states),
        Destination::Back => Ok(255),
        Destination::Unresolved(_) => Err(CompileError::DanglingReference),
    }
}

/// Length-prefixed (code, destination) rows; codes stored as offsets from
/// the family's base position.
fn put_transition_rows(
    writer: &mut WireWriter,
    rows: &[Vec<(u8, Destination)>],
    base: usize,
    n_states: u8,
) -> Result<(), CompileError> {
    for row in rows {
        writer.put_u8(byte_checked(row.len(), "transition count")?);
        for (code, destination) in row {
            writer.put_u8((usize::from(*code) - base) as u8);
            writer.put_u8(destination_byte(*destination, n_states)?);
        }
    }
    Ok(())
}

/// u8 on narrow machines, u16 on wide ones.
fn put_scalar(
    writer: &mut WireWriter,
    value: u32,
    wide: bool,
    what: &'static str,
) -> Result<(), CompileError> {
    if wide {
        let v = u16::try_from(value).map_err(|_| CompileError::Overflow {
            what,
            value: u64::from(value),
        })?;
        writer.put_u16(v);
    } else {
        let v = u8::try_from(value).map_err(|_| CompileError::Overflow {
            what,
            value: u64::from(value),
        })?;
        writer.put_u8(v);
    }
    Ok(())
}

/// Element width of the trigger/cancel/onset masks.
fn timer_mask_width(n_global_timers: u8) -> usize {
    if n_global_timers > 16 {
        4
    } else if n_global_timers > 8 {
        2
    } else {
        1
    }
}

fn put_mask(writer: &mut WireWriter, value: u32, width: usize) -> Result<(), CompileError> {
    match width {
        1 => writer.put_u8(u8::try_from(value).map_err(|_| CompileError::Overflow {
            what: "timer mask",
            value: u64::from(value),
        })?),
        2 => writer.put_u16(u16::try_from(value).map_err(|_| CompileError::Overflow {
            what: "timer mask",
            value: u64::from(value),
        })?),
        _ => writer.put_u32(value),
    }
    Ok(())
}

/// Seconds to controller cycles, rounded.
fn ticks(seconds: f64, frequency: f64, what: &'static str) -> Result<u32, CompileError> {
    let cycles = (seconds * frequency).round();
    if !(0.0..=f64::from(u32::MAX)).contains(&cycles) {
        return Err(CompileError::Overflow {
            what,
            value: cycles as u64,
        });
    }
    Ok(cycles as u32)
}

fn byte_checked(value: usize, what: &'static str) -> Result<u8, CompileError> {
    u8::try_from(value).map_err(|_| CompileError::Overflow {
        what,
        value: value as u64,
    })
}
