//! Five-button front panel. Presses are debounced in hardware interrupts and
//! pushed into an mpsc channel the supervisor drains; a press never
//! interrupts an in-flight render.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::ButtonPins;

#[allow(dead_code)]
pub const DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Up,
    Down,
    Left,
    Right,
    Center,
}

#[cfg(feature = "raspberry_pi")]
mod real {
    use super::{ButtonEvent, DEBOUNCE};
    use crate::config::ButtonPins;
    use rppal::gpio::{Gpio, InputPin, Trigger};
    use tokio::sync::mpsc;
    use tracing::warn;

    /// Keeps the interrupt-wired input pins alive.
    pub struct ButtonPanel {
        _pins: Vec<InputPin>,
    }

    impl ButtonPanel {
        pub fn setup(
            pins: &ButtonPins,
            tx: mpsc::Sender<ButtonEvent>,
        ) -> anyhow::Result<Self> {
            let gpio = Gpio::new()?;
            let mut held = Vec::new();

            let mapping = [
                (pins.up, ButtonEvent::Up),
                (pins.down, ButtonEvent::Down),
                (pins.left, ButtonEvent::Left),
                (pins.right, ButtonEvent::Right),
                (pins.center, ButtonEvent::Center),
            ];

            for (pin_number, event) in mapping {
                let mut pin = gpio.get(pin_number)?.into_input_pullup();
                let tx = tx.clone();
                // Buttons pull the line to ground when pressed.
                pin.set_async_interrupt(Trigger::FallingEdge, Some(DEBOUNCE), move |_| {
                    if tx.try_send(event).is_err() {
                        warn!(?event, "button queue full, press dropped");
                    }
                })?;
                held.push(pin);
            }

            Ok(Self { _pins: held })
        }
    }
}

#[cfg(not(feature = "raspberry_pi"))]
mod dummy {
    use super::ButtonEvent;
    use crate::config::ButtonPins;
    use tokio::sync::mpsc;

    /// Inert stand-in for development machines; events only ever come from
    /// tests injecting into the channel directly.
    pub struct ButtonPanel;

    impl ButtonPanel {
        pub fn setup(
            _pins: &ButtonPins,
            _tx: mpsc::Sender<ButtonEvent>,
        ) -> anyhow::Result<Self> {
            Ok(Self)
        }
    }
}

#[cfg(feature = "raspberry_pi")]
pub use real::ButtonPanel;

#[cfg(not(feature = "raspberry_pi"))]
pub use dummy::ButtonPanel;

/// Channel plus panel, wired together. The receiver goes to the supervisor.
pub fn wire(pins: &ButtonPins) -> anyhow::Result<(ButtonPanel, mpsc::Receiver<ButtonEvent>)> {
    let (tx, rx) = mpsc::channel(16);
    let panel = ButtonPanel::setup(pins, tx)?;
    Ok((panel, rx))
}
