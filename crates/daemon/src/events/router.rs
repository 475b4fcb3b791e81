//! Event router: interrupts to semantic events
//!
//! Turns raw button edges into short/long presses, diffs drive-presence
//! bitmaps into per-bay transitions, and keeps the enclosure snapshot
//! current. Auto bay power is applied here on insert/remove.

use super::types::{BayState, Event};
use crate::pmc::{registers, Button, PmcClient, PmcInterrupt};
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-button edge tracking. The PMC reports edges only, so pressed state
/// is reconstructed by toggling.
#[derive(Debug, Default, Clone, Copy)]
struct ButtonState {
    pressed: bool,
    since: Option<Instant>,
}

pub struct EventRouter {
    client: PmcClient,
    interrupts: broadcast::Receiver<PmcInterrupt>,
    event_tx: mpsc::Sender<Event>,
    lcd_activity: mpsc::Sender<()>,
    bays: Arc<RwLock<BayState>>,
    long_press: Duration,
    auto_power: bool,
    buttons: [ButtonState; 3],
}

impl EventRouter {
    pub fn new(
        client: PmcClient,
        interrupts: broadcast::Receiver<PmcInterrupt>,
        event_tx: mpsc::Sender<Event>,
        lcd_activity: mpsc::Sender<()>,
        bays: Arc<RwLock<BayState>>,
        long_press: Duration,
        auto_power: bool,
    ) -> Self {
        Self {
            client,
            interrupts,
            event_tx,
            lcd_activity,
            bays,
            long_press,
            auto_power,
            buttons: [ButtonState::default(); 3],
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.interrupts.recv().await {
                Ok(interrupt) => self.handle(interrupt).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event router lagged, {} interrupts lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    bail!("interrupt stream closed");
                }
            }
        }
    }

    async fn handle(&mut self, interrupt: PmcInterrupt) {
        match interrupt {
            PmcInterrupt::ButtonEdge { button } => self.on_button_edge(button).await,
            PmcInterrupt::DrivePresenceMaskChanged { mask, previous } => {
                self.on_presence_change(mask, previous).await
            }
            PmcInterrupt::PowerSupplyChanged { socket, energized } => {
                {
                    let mut bays = self.bays.write().await;
                    if let Some(slot) = bays.sockets.get_mut(usize::from(socket) - 1) {
                        *slot = energized;
                    }
                }
                info!(
                    "power socket {} {}",
                    socket,
                    if energized { "energized" } else { "lost power" }
                );
                self.emit(Event::PowerSupplyChanged { socket, energized })
                    .await;
            }
        }
    }

    async fn on_button_edge(&mut self, button: Button) {
        let idx = match button {
            Button::UsbCopy => 0,
            Button::LcdUp => 1,
            Button::LcdDown => 2,
        };
        let state = &mut self.buttons[idx];

        if !state.pressed {
            state.pressed = true;
            state.since = Some(Instant::now());
            debug!("{:?} pressed", button);
            if matches!(button, Button::LcdUp | Button::LcdDown) {
                // Wake the LCD backlight; a full queue means a wake is
                // already on its way.
                let _ = self.lcd_activity.try_send(());
            }
            return;
        }

        state.pressed = false;
        let held = state
            .since
            .take()
            .map(|since| since.elapsed())
            .unwrap_or_default();
        let long = held >= self.long_press;
        debug!("{:?} released after {:?} ({})", button, held, if long { "long" } else { "short" });

        let event = match button {
            Button::UsbCopy => Event::UsbCopyButton { long },
            Button::LcdUp => Event::LcdUpButton { long },
            Button::LcdDown => Event::LcdDownButton { long },
        };
        self.emit(event).await;
    }

    async fn on_presence_change(&mut self, mask: u8, previous: u8) {
        let (bay_count, labels): (usize, Vec<&'static str>) = {
            let bays = self.bays.read().await;
            (
                bays.chassis_bays,
                (0..bays.chassis_bays).map(|b| bays.bay_label(b)).collect(),
            )
        };

        for bay in 0..bay_count {
            let bit = 1u8 << bay;
            // Presence bits are active-low.
            let was_present = previous & bit == 0;
            let present = mask & bit == 0;
            if was_present == present {
                continue;
            }

            info!(
                "drive bay {} ({}) is now {}",
                bay,
                labels[bay],
                if present { "present" } else { "absent" }
            );

            let mut powered = None;
            if self.auto_power {
                let result = if present {
                    self.client.set_u8(&registers::DLS, bit).await
                } else {
                    self.client.set_u8(&registers::DLC, bit).await
                };
                match result {
                    Ok(()) => powered = Some(present),
                    Err(e) => warn!("bay {} power update failed: {}", bay, e),
                }
            } else if !present {
                // The drive is gone regardless of what the enable bit says.
                powered = Some(false);
            }

            {
                let mut bays = self.bays.write().await;
                if let Some(slot) = bays.bays.get_mut(bay) {
                    slot.present = present;
                    if let Some(powered) = powered {
                        slot.powered = powered;
                    }
                }
            }

            self.emit(Event::DrivePresenceChanged { bay, present }).await;
        }
    }

    async fn emit(&self, event: Event) {
        if self.event_tx.send(event).await.is_err() {
            warn!("event channel closed, event not dispatched");
        }
    }
}
