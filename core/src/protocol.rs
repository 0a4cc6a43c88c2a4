//! Serial protocol opcodes
//! Command bytes sent to the controller and the reply codes it answers with.

/// Commands sent from the host to the controller.
pub mod command {
    pub const HANDSHAKE: u8 = b'6';
    pub const FIRMWARE_VERSION: u8 = b'F';
    pub const HARDWARE_DESCRIPTION: u8 = b'H';
    pub const ENABLE_PORTS: u8 = b'E';
    pub const SYNC_CHANNEL_MODE: u8 = b'K';
    /// Header byte of a compiled state machine descriptor.
    pub const NEW_STATE_MATRIX: u8 = b'C';
    pub const GET_MODULES: u8 = b'M';
    pub const LOAD_SERIAL_MESSAGE: u8 = b'L';
    pub const RESET_SERIAL_MESSAGES: u8 = b'>';
    pub const RESET_CLOCK: u8 = b'*';
    /// Aborts the running trial; the controller finishes with a trial-end record.
    pub const STOP_TRIAL: u8 = b'X';
    pub const DISCONNECT: u8 = b'Z';
    pub const SET_FLEX_CHANNEL_TYPES: u8 = b'J';
    pub const SET_ANALOG_INPUT_THRESHOLDS: u8 = b't';
    pub const SET_ANALOG_THRESHOLD_POLARITY: u8 = b'p';
    pub const SET_ANALOG_THRESHOLD_MODE: u8 = b'm';
    pub const ENABLE_ANALOG_THRESHOLD: u8 = b'+';
}

/// Reply codes received from the controller.
pub mod reply {
    /// Written every ~100 ms on the primary port while idle (firmware 22).
    /// 0xDE is 222 in decimal, a nod to the firmware version.
    pub const KEEPALIVE_PING: u8 = 0xDE;
    pub const HANDSHAKE_OK: u8 = b'5';
    pub const SECONDARY_PORT_HANDSHAKE_OK: u8 = 222;
    pub const ANALOG_PORT_HANDSHAKE_OK: u8 = 223;
    /// Generic success code shared by the configuration commands.
    pub const COMMAND_OK: u8 = 1;
    /// Confirmation that a state machine descriptor was installed.
    pub const STATE_MACHINE_INSTALLED: u8 = 1;
    pub const DISCONNECT_OK: u8 = b'1';
    /// Module info sub-record: the module requests extra event slots.
    pub const MODULE_REQUESTED_EVENTS: u8 = b'#';
    /// Module info sub-record: the module supplies custom event names.
    pub const MODULE_EVENT_NAMES: u8 = b'E';
    /// Continuation flag preceding each module info sub-record.
    pub const MODULE_MORE_INFO: u8 = 1;
}

/// Opcodes streamed by the controller during a trial.
pub mod trial_opcode {
    /// Bundle of timestamped event/state-change codes.
    pub const EVENT_BUNDLE: u8 = b'R';
    /// Host-addressed softcode follows.
    pub const SOFTCODE: u8 = b'#';
    /// End of trial; the end timestamp follows.
    pub const TRIAL_END: u8 = b'E';
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_bytes() {
        assert_eq!(command::HANDSHAKE, 0x36);
        assert_eq!(command::NEW_STATE_MATRIX, 0x43);
        assert_eq!(command::RESET_SERIAL_MESSAGES, 0x3E);
        assert_eq!(command::DISCONNECT, 0x5A);
    }

    #[test]
    fn test_reply_bytes() {
        assert_eq!(reply::KEEPALIVE_PING, 222);
        assert_eq!(reply::HANDSHAKE_OK, 0x35);
        assert_eq!(reply::DISCONNECT_OK, 0x31);
    }
}
