//! Bus-facing surface: the publish seam and agent-addressed commands.

/// Subject-addressed publish transport and in-process implementation
pub mod bus;
/// Config-update envelopes and the command publisher
pub mod commands;

pub use bus::{InProcessBus, MessageBus};
pub use commands::{
    agent_subject, BusEnvelope, BusMessageType, CommandPublisher, ConfigUpdateRequest,
};
