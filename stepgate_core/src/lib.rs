//! Sequencer core: step grid, drift-aware clock and the reconnecting
//! session to the actuator service.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod sequence;
pub mod session;

pub use clock::{
    ManualTimeSource, RuntimeTimeSource, StallPolicy, StepClock, StepEvent, TimeSource,
    STEP_COUNT,
};
pub use config::{SequencerConfig, SessionConfig};
pub use dispatch::{TriggerCommand, TriggerDispatch};
pub use error::{ActuatorError, ClockInitError, ConfigError, InvalidIndexError, TriggerError};
pub use sequence::{Grid, PlaybackState, SequenceState, CHANNEL_COUNT};
pub use session::{ConnectionPhase, ConnectionSession, ConnectionState, SessionBuilder};
