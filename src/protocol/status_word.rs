//! Table-driven decoding of the generator's packed status words.
//!
//! `SR:nn` returns one status byte. Words 1, 2, 3, 4 and 6 are bit fields
//! described by a [`StatusWordMap`]; word 12 is a fault code looked up in
//! [`FAULT_MESSAGES`]; words 14 and 15 are plain water-flow rates and are not
//! decoded here.
//!
//! Bit 7 is the most significant bit. Every map lists its fields from the MSB
//! down, which is also the order of the decoded output.

use crate::error::{XrayError, XrayResult};
use serde::Serialize;

/// One named bit of a status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub bit: u8,
    pub name: &'static str,
    /// Symbol reported when the bit is set.
    pub set: &'static str,
    /// Symbol reported when the bit is clear.
    pub clear: &'static str,
}

const fn bit(bit: u8, name: &'static str, set: &'static str, clear: &'static str) -> BitField {
    BitField {
        bit,
        name,
        set,
        clear,
    }
}

/// Static description of a status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWordMap {
    /// Number used in the `SR:nn` query.
    pub id: u8,
    pub width: usize,
    pub fields: &'static [BitField],
}

/// Status word 1: generator summary.
pub const SW1: StatusWordMap = StatusWordMap {
    id: 1,
    width: 8,
    fields: &[
        bit(7, "external_computer_control", "ON", "OFF"),
        bit(6, "high_voltage", "ON", "OFF"),
        bit(5, "cooling_circuit", "NOT OK", "OK"),
        bit(4, "buffer_battery", "EMPTY", "OK"),
        bit(3, "current_nominal_equals_actual", "NOT OK", "OK"),
        bit(2, "voltage_nominal_equals_actual", "NOT OK", "OK"),
        bit(1, "shutter_status", "NOT OK", "OK"),
    ],
};

/// Status word 2: timers and shutter control source.
pub const SW2: StatusWordMap = StatusWordMap {
    id: 2,
    width: 8,
    fields: &[
        bit(7, "timer_1", "ON", "OFF"),
        bit(6, "timer_2", "ON", "OFF"),
        bit(5, "timer_3", "ON", "OFF"),
        bit(4, "timer_4", "ON", "OFF"),
        bit(3, "shutter_1_control", "COMPUTER", "MANUAL"),
        bit(2, "shutter_2_control", "COMPUTER", "MANUAL"),
        bit(1, "shutter_3_control", "COMPUTER", "MANUAL"),
        bit(0, "shutter_4_control", "COMPUTER", "MANUAL"),
    ],
};

/// Status word 3: shutters 1 and 2.
pub const SW3: StatusWordMap = StatusWordMap {
    id: 3,
    width: 8,
    fields: &[
        bit(7, "shutter_1_command", "OPEN", "CLOSED"),
        bit(6, "shutter_1_status", "OPEN", "CLOSED"),
        bit(5, "shutter_1_non_systematically_closed", "YES", "NO"),
        bit(4, "shutter_1_connected", "NO", "YES"),
        bit(3, "shutter_2_command", "OPEN", "CLOSED"),
        bit(2, "shutter_2_status", "OPEN", "CLOSED"),
        bit(1, "shutter_2_non_systematically_closed", "YES", "NO"),
        bit(0, "shutter_2_connected", "NO", "YES"),
    ],
};

/// Status word 4: shutters 3 and 4.
pub const SW4: StatusWordMap = StatusWordMap {
    id: 4,
    width: 8,
    fields: &[
        bit(7, "shutter_3_command", "OPEN", "CLOSED"),
        bit(6, "shutter_3_status", "OPEN", "CLOSED"),
        bit(5, "shutter_3_non_systematically_closed", "YES", "NO"),
        bit(4, "shutter_3_connected", "NO", "YES"),
        bit(3, "shutter_4_command", "OPEN", "CLOSED"),
        bit(2, "shutter_4_status", "OPEN", "CLOSED"),
        bit(1, "shutter_4_non_systematically_closed", "YES", "NO"),
        bit(0, "shutter_4_connected", "NO", "YES"),
    ],
};

/// Status word 6: warm-up program. Bits 7..4 unused.
pub const SW6: StatusWordMap = StatusWordMap {
    id: 6,
    width: 8,
    fields: &[
        bit(3, "warmup_program", "ACTIVE", "NOT ACTIVE"),
        bit(2, "warmup_aborted", "YES", "NO"),
        bit(1, "warmup_via_computer", "YES", "NO"),
        bit(0, "warmup_via_keyboard", "YES", "NO"),
    ],
};

/// All bit-field status words, in polling order.
pub const STATUS_WORDS: [&StatusWordMap; 5] = [&SW1, &SW2, &SW3, &SW4, &SW6];

/// Look up the map of a bit-field status word by its `SR` number.
pub fn map_for(id: u8) -> Option<&'static StatusWordMap> {
    STATUS_WORDS.iter().copied().find(|m| m.id == id)
}

/// One decoded bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedBit {
    pub name: &'static str,
    pub symbol: &'static str,
    pub set: bool,
}

/// A status word with every declared field resolved to its symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedStatusWord {
    pub id: u8,
    pub raw: u8,
    /// `raw` in binary, zero-padded to the map width.
    pub binary: String,
    pub fields: Vec<DecodedBit>,
}

impl DecodedStatusWord {
    /// Symbol of the named field.
    pub fn symbol(&self, name: &str) -> Option<&'static str> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.symbol)
    }

    pub fn is_set(&self, name: &str) -> Option<bool> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.set)
    }
}

/// Decode `word` against `map`.
pub fn decode(word: u8, map: &StatusWordMap) -> DecodedStatusWord {
    let fields = map
        .fields
        .iter()
        .map(|f| {
            let set = word & (1 << f.bit) != 0;
            DecodedBit {
                name: f.name,
                symbol: if set { f.set } else { f.clear },
                set,
            }
        })
        .collect();

    DecodedStatusWord {
        id: map.id,
        raw: word,
        binary: format!("{:0width$b}", word, width = map.width),
        fields,
    }
}

/// Fault messages reported through `SR:12`.
pub const FAULT_MESSAGES: &[(i32, &str)] = &[
    (0, "No messages"),
    (33, "Cooling system failed"),
    (37, "Absolute undervoltage monitoring"),
    (38, "Absolute overvoltage monitoring"),
    (39, "Absolute undercurrent monitoring"),
    (43, "Extern stop"),
    (46, "EMERGENCY-STOP"),
    (49, "Preselection exceeded rated power"),
    (50, "Tube overpower"),
    (51, "Preselection out of range"),
    (52, "Presel.exceeding rated generator current"),
    (53, "High voltage lamp defective"),
    (55, "Relative overcurrent monitoring"),
    (56, "Relative undervoltage monitoring"),
    (60, "Relative undercurrent monitoring"),
    (63, "Door contact 1 and 2 open"),
    (64, "Door contact 1 open"),
    (65, "Door contact 2 open"),
    (67, "Temp. supervision cooling system"),
    (70, "Tube to be warmed up?"),
    (72, "Preselection out of range"),
    (76, "----Stand-by----"),
    (80, "Temperature supervision power module"),
    (86, "HV contact faulty"),
    (90, "Fault in filament circuit"),
    (91, "Buffer battery empty"),
    (96, "Shutter non-systematically closed"),
    (97, "Shutter not connected"),
    (98, "Shutter not opened"),
    (99, "Shutter not closed"),
    (104, "External warning lamp failed"),
    (105, "Temperature supervision generator"),
    (106, "Warm-up necessary"),
    (108, "Power fail (low voltage)"),
    (109, "Warm-up! 0=No"),
    (112, "Shutter safety circuit open"),
    (113, "Absolute overcurrent monitoring"),
    (114, "Relative overvoltage monitoring"),
    (116, "Warm-up terminated after 3 attempts"),
    (117, "Warm-up aborted. Try again"),
    (118, "Push START button"),
];

/// Resolve a fault code against `table`.
pub fn decode_fault_code(code: i32, table: &[(i32, &'static str)]) -> XrayResult<&'static str> {
    table
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, msg)| *msg)
        .ok_or(XrayError::UnknownFaultCode(code))
}

/// Fault message for display; unknown codes fall back to `unknown code N`.
pub fn fault_message(code: i32) -> String {
    match decode_fault_code(code, FAULT_MESSAGES) {
        Ok(msg) => msg.to_string(),
        Err(_) => {
            tracing::warn!(code, "Fault code not in message table");
            format!("unknown code {}", code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_word_decodes_totally() {
        for map in STATUS_WORDS {
            for word in 0..=255u8 {
                let decoded = decode(word, map);
                assert_eq!(decoded.fields.len(), map.fields.len());
                assert_eq!(decoded.binary.len(), 8);
                assert_eq!(u8::from_str_radix(&decoded.binary, 2).unwrap(), word);
                for (field, out) in map.fields.iter().zip(&decoded.fields) {
                    assert_eq!(field.name, out.name);
                    let expected = if word & (1 << field.bit) != 0 {
                        field.set
                    } else {
                        field.clear
                    };
                    assert_eq!(out.symbol, expected, "SW{} word {} {}", map.id, word, field.name);
                }
            }
        }
    }

    #[test]
    fn test_maps_have_unique_bits() {
        for map in STATUS_WORDS {
            let mut seen = [false; 8];
            for field in map.fields {
                assert!(field.bit < 8);
                assert!(!seen[field.bit as usize], "SW{} bit {}", map.id, field.bit);
                seen[field.bit as usize] = true;
            }
        }
    }

    #[test]
    fn test_sw1_high_voltage() {
        let decoded = decode(0b0100_0000, &SW1);
        assert_eq!(decoded.symbol("high_voltage"), Some("ON"));
        assert_eq!(decoded.symbol("cooling_circuit"), Some("OK"));
        assert_eq!(decoded.binary, "01000000");

        // Simulator power-up value: cooling circuit flagged, HV off.
        let decoded = decode(32, &SW1);
        assert_eq!(decoded.symbol("high_voltage"), Some("OFF"));
        assert_eq!(decoded.symbol("cooling_circuit"), Some("NOT OK"));
    }

    #[test]
    fn test_connected_bit_is_inverted() {
        let decoded = decode(0b0001_0000, &SW3);
        assert_eq!(decoded.symbol("shutter_1_connected"), Some("NO"));
        assert_eq!(decoded.symbol("shutter_2_connected"), Some("YES"));
    }

    #[test]
    fn test_sw4_beam_shutter_status() {
        let decoded = decode(0b1100_0000, &SW4);
        assert_eq!(decoded.is_set("shutter_3_status"), Some(true));
        assert_eq!(decoded.symbol("shutter_3_command"), Some("OPEN"));
        assert_eq!(decoded.symbol("shutter_4_status"), Some("CLOSED"));
    }

    #[test]
    fn test_sw6_ignores_unused_bits() {
        let decoded = decode(0b1111_0100, &SW6);
        assert_eq!(decoded.fields.len(), 4);
        assert_eq!(decoded.symbol("warmup_aborted"), Some("YES"));
        assert_eq!(decoded.symbol("warmup_program"), Some("NOT ACTIVE"));
    }

    #[test]
    fn test_map_lookup() {
        assert_eq!(map_for(4), Some(&SW4));
        assert_eq!(map_for(12), None);
    }

    #[test]
    fn test_fault_codes() {
        assert_eq!(decode_fault_code(0, FAULT_MESSAGES).unwrap(), "No messages");
        assert_eq!(fault_message(76), "----Stand-by----");
        assert_eq!(fault_message(46), "EMERGENCY-STOP");
        assert!(matches!(
            decode_fault_code(119, FAULT_MESSAGES),
            Err(XrayError::UnknownFaultCode(119))
        ));
        assert_eq!(fault_message(119), "unknown code 119");
        assert_eq!(FAULT_MESSAGES.len(), 41);
    }
}
