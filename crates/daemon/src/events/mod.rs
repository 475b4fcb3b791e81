//! Semantic events and the interrupt-to-event router

pub mod router;
pub mod types;

pub use router::EventRouter;
pub use types::{AlertLed, BayState, BayStatus, Event, HOOK_KINDS};
