//! Simulated actuator service: the websocket peer a sequencer talks to,
//! with output pins modelled in memory.

mod net;
mod outputs;

pub use net::{ActuatorEvent, ActuatorOptions, ActuatorThread, EVENT_CAP};
pub use outputs::{default_mapping, OutputBank, DEFAULT_MAPPING};
