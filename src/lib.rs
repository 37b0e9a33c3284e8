//! OSDP control-panel core.
//!
//! This crate multiplexes OSDP card readers over shared serial (or TCP)
//! buses and presents each reader as a logical device: it drives the
//! poll/reply cycle, brings up per-device secure channels, installs fresh
//! keys in install mode, renders reader feedback (LED, buzzer, idle
//! heartbeat), aggregates keypad input into PIN entries and fans the
//! resulting card, PIN and status events out to subscribers. An optional
//! packet trace captures every frame for diagnostics.
//!
//! The entry point is [`Manager`]: register [`DeviceConfig`]s, `start()`,
//! and subscribe to [`events::Event`]s. Persistence, UI and plugin
//! execution live outside this crate, behind the collaborator traits in
//! [`manager::Collaborators`].
//!
//! Concurrency model: one thread per bus owns its transport and linearizes
//! every frame on that wire; sessions are plain state machines driven by
//! their bus; subscribers consume events from bounded queues that can never
//! stall a bus.

pub mod bus;
pub mod config;
pub mod entropy;
pub mod events;
pub mod feedback;
pub mod manager;
pub mod pin;
pub mod protocol;
pub mod trace;
pub mod transport;

mod session;
mod util;

pub use crate::bus::SendError;
pub use crate::config::{BaudRate, ConfigError, DeviceConfig, SecurityMode};
pub use crate::events::{
	CardReadEvent, Event, EventKind, PinCompletionReason, PinDigitEvent, PinReadEvent,
	SecurityModeChange, StatusChange, Subscription,
};
pub use crate::feedback::{Feedback, FeedbackConfigurationService, IdleState, LedColor};
pub use crate::manager::{AddDeviceError, Collaborators, Manager, StartError};
pub use crate::pin::{PinEventSink, PinLimits};
pub use crate::session::SecurityModeUpdateService;
pub use crate::trace::{PacketTraceSink, TraceEntry, TraceFilter, TraceService};
pub use crate::transport::{SerialPortService, SystemSerialPorts, Transport, TransportError};
