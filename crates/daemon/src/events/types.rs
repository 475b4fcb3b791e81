//! Semantic hardware events and enclosure state snapshots

use crate::thermal::ThermalLevel;
use serde::Serialize;

/// Hook kinds recognized in configuration, one per dispatchable event.
pub const HOOK_KINDS: [&str; 11] = [
    "system_up",
    "system_down",
    "drive_presence_changed",
    "power_supply_changed",
    "temperature_changed",
    "usb_copy_button",
    "usb_copy_button_long",
    "lcd_up_button",
    "lcd_up_button_long",
    "lcd_down_button",
    "lcd_down_button_long",
];

/// A semantic event produced by the router, governor, or runtime.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SystemUp,
    SystemDown,
    DrivePresenceChanged {
        bay: usize,
        present: bool,
    },
    PowerSupplyChanged {
        socket: u8,
        energized: bool,
    },
    TemperatureLevelChanged {
        new_level: ThermalLevel,
        old_level: ThermalLevel,
        hottest_c: f64,
    },
    UsbCopyButton {
        long: bool,
    },
    LcdUpButton {
        long: bool,
    },
    LcdDownButton {
        long: bool,
    },
}

impl Event {
    /// The configuration key family this event dispatches under.
    pub fn hook_kind(&self) -> &'static str {
        match self {
            Event::SystemUp => "system_up",
            Event::SystemDown => "system_down",
            Event::DrivePresenceChanged { .. } => "drive_presence_changed",
            Event::PowerSupplyChanged { .. } => "power_supply_changed",
            Event::TemperatureLevelChanged { .. } => "temperature_changed",
            Event::UsbCopyButton { long: false } => "usb_copy_button",
            Event::UsbCopyButton { long: true } => "usb_copy_button_long",
            Event::LcdUpButton { long: false } => "lcd_up_button",
            Event::LcdUpButton { long: true } => "lcd_up_button_long",
            Event::LcdDownButton { long: false } => "lcd_down_button",
            Event::LcdDownButton { long: true } => "lcd_down_button_long",
        }
    }

    /// Placeholder substitutions available to hook argument templates.
    pub fn placeholders(&self) -> Vec<(&'static str, String)> {
        match self {
            Event::DrivePresenceChanged { bay, present } => vec![
                ("drive_bay", bay.to_string()),
                ("state", if *present { "present" } else { "absent" }.to_string()),
            ],
            Event::PowerSupplyChanged { socket, energized } => vec![
                ("socket", socket.to_string()),
                ("state", if *energized { "on" } else { "off" }.to_string()),
            ],
            Event::TemperatureLevelChanged {
                new_level,
                old_level,
                hottest_c,
            } => vec![
                ("new_level", new_level.to_string()),
                ("old_level", old_level.to_string()),
                ("monitor_data", format!("{:.1}", hottest_c)),
            ],
            _ => Vec::new(),
        }
    }
}

/// Drive alert LED state as exposed over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLed {
    Off,
    On,
    Blinking,
}

impl AlertLed {
    pub fn name(self) -> &'static str {
        match self {
            AlertLed::Off => "off",
            AlertLed::On => "on",
            AlertLed::Blinking => "blinking",
        }
    }
}

/// One drive bay.
#[derive(Debug, Clone, Serialize)]
pub struct BayStatus {
    pub present: bool,
    pub powered: bool,
    pub alert: AlertLed,
}

/// Enclosure snapshot: bays and power sockets. Written by the router (and
/// initialized by the runtime), read by the IPC server.
#[derive(Debug, Clone, Serialize)]
pub struct BayState {
    /// 2 or 4, from the chassis indicator bit of the presence register.
    pub chassis_bays: usize,
    pub bays: Vec<BayStatus>,
    /// Energized flags for sockets 1 and 2.
    pub sockets: [bool; 2],
}

impl BayState {
    /// Build the boot-time snapshot from the raw register values.
    ///
    /// Presence bits are active-low. The enable register carries power
    /// enable in the low nibble and steady alert LEDs in the high nibble;
    /// the blink bitmap overrides steady state; status bits 1 and 2 carry
    /// sockets 2 and 1.
    pub fn from_registers(dp0: u8, de0: u8, dlb: u8, sta: u8) -> Self {
        let chassis_bays = if dp0 & 0x10 != 0 { 4 } else { 2 };
        let bays = (0..chassis_bays)
            .map(|bay| BayStatus {
                present: dp0 & (1 << bay) == 0,
                powered: de0 & (1 << bay) != 0,
                alert: if dlb & (1 << bay) != 0 {
                    AlertLed::Blinking
                } else if de0 & (1 << (bay + 4)) != 0 {
                    AlertLed::On
                } else {
                    AlertLed::Off
                },
            })
            .collect();
        Self {
            chassis_bays,
            bays,
            sockets: [sta & 0x04 != 0, sta & 0x02 != 0],
        }
    }

    /// Human-readable position of a bay in this chassis.
    pub fn bay_label(&self, bay: usize) -> &'static str {
        if self.chassis_bays == 4 {
            ["leftmost", "center-left", "center-right", "rightmost"]
                .get(bay)
                .copied()
                .unwrap_or("unknown")
        } else {
            ["right", "left"].get(bay).copied().unwrap_or("unknown")
        }
    }
}

impl Default for BayState {
    fn default() -> Self {
        Self {
            chassis_bays: 2,
            bays: vec![
                BayStatus {
                    present: false,
                    powered: false,
                    alert: AlertLed::Off,
                };
                2
            ],
            sockets: [false, false],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_kind_distinguishes_long_press() {
        assert_eq!(
            Event::UsbCopyButton { long: false }.hook_kind(),
            "usb_copy_button"
        );
        assert_eq!(
            Event::UsbCopyButton { long: true }.hook_kind(),
            "usb_copy_button_long"
        );
    }

    #[test]
    fn test_every_event_kind_is_recognized() {
        let events = [
            Event::SystemUp,
            Event::SystemDown,
            Event::DrivePresenceChanged {
                bay: 0,
                present: true,
            },
            Event::PowerSupplyChanged {
                socket: 1,
                energized: true,
            },
            Event::TemperatureLevelChanged {
                new_level: ThermalLevel::Warm,
                old_level: ThermalLevel::Normal,
                hottest_c: 51.0,
            },
            Event::UsbCopyButton { long: false },
            Event::UsbCopyButton { long: true },
            Event::LcdUpButton { long: false },
            Event::LcdUpButton { long: true },
            Event::LcdDownButton { long: false },
            Event::LcdDownButton { long: true },
        ];
        for event in &events {
            assert!(HOOK_KINDS.contains(&event.hook_kind()));
        }
    }

    #[test]
    fn test_placeholders_for_presence_event() {
        let ph = Event::DrivePresenceChanged {
            bay: 2,
            present: false,
        }
        .placeholders();
        assert!(ph.contains(&("drive_bay", "2".to_string())));
        assert!(ph.contains(&("state", "absent".to_string())));
    }

    #[test]
    fn test_bay_state_from_registers_four_bay() {
        // Chassis bit set, bays 0 and 3 empty, bay 1 powered with alert LED.
        let state = BayState::from_registers(0x99, 0x22, 0x00, 0x06);
        assert_eq!(state.chassis_bays, 4);
        assert!(!state.bays[0].present);
        assert!(state.bays[1].present);
        assert!(state.bays[1].powered);
        assert_eq!(state.bays[1].alert, AlertLed::On);
        assert!(!state.bays[3].present);
        // STA 0x06: both sockets energized.
        assert_eq!(state.sockets, [true, true]);
    }

    #[test]
    fn test_bay_state_from_registers_two_bay() {
        let state = BayState::from_registers(0x00, 0x03, 0x00, 0x02);
        assert_eq!(state.chassis_bays, 2);
        assert_eq!(state.bays.len(), 2);
        assert!(state.bays[0].present && state.bays[1].present);
        // Socket 1 off (bit 2 clear), socket 2 on (bit 1 set).
        assert_eq!(state.sockets, [false, true]);
    }

    #[test]
    fn test_blink_bitmap_overrides_steady_alert() {
        let state = BayState::from_registers(0x00, 0x10, 0x01, 0x00);
        assert_eq!(state.bays[0].alert, AlertLed::Blinking);
        assert_eq!(state.bays[1].alert, AlertLed::Off);
    }

    #[test]
    fn test_bay_labels_depend_on_chassis() {
        let four = BayState::from_registers(0x10, 0, 0, 0);
        assert_eq!(four.bay_label(0), "leftmost");
        assert_eq!(four.bay_label(3), "rightmost");
        let two = BayState::from_registers(0x00, 0, 0, 0);
        assert_eq!(two.bay_label(0), "right");
        assert_eq!(two.bay_label(1), "left");
    }
}
