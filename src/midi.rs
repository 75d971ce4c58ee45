//! MIDI event helpers
//!
//! The echo engine forwards raw bytes untouched. The only thing it needs to
//! know about an event is which subsystem call carries it.

/// System Exclusive start byte
pub const SYSEX_START: u8 = 0xF0;

/// Largest event that fits a short message
pub const SHORT_MESSAGE_MAX: usize = 3;

/// Which subsystem send primitive an event needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventShape {
    /// Channel or system message of 1 to 3 bytes
    Short,
    /// Sysex or any other buffered message
    Long,
}

impl EventShape {
    /// Classify raw event bytes. Empty events have no shape.
    pub fn classify(data: &[u8]) -> Option<Self> {
        match data.first() {
            None => None,
            Some(&SYSEX_START) => Some(EventShape::Long),
            Some(_) if data.len() > SHORT_MESSAGE_MAX => Some(EventShape::Long),
            Some(_) => Some(EventShape::Short),
        }
    }
}

/// Short human label for the status byte, used in trace output
pub fn status_label(data: &[u8]) -> &'static str {
    let Some(&status) = data.first() else {
        return "empty";
    };
    match status {
        0x00..=0x7F => "data",
        0x80..=0x8F => "noteOff",
        0x90..=0x9F => "noteOn",
        0xA0..=0xAF => "polyPressure",
        0xB0..=0xBF => "controlChange",
        0xC0..=0xCF => "programChange",
        0xD0..=0xDF => "channelPressure",
        0xE0..=0xEF => "pitchBend",
        0xF0 => "sysex",
        0xF8 => "clock",
        0xFA => "start",
        0xFB => "continue",
        0xFC => "stop",
        0xFE => "activeSensing",
        0xFF => "reset",
        _ => "system",
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
