use thiserror::Error;

/// The step clock could not be started.
///
/// Never retried automatically: the caller re-invokes `play()` once the
/// precondition holds.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ClockInitError {
    #[error("no async runtime is available to drive the step clock")]
    NoRuntime,
    #[error("time source is locked until a user gesture activates it")]
    GestureRequired,
    #[error(transparent)]
    StartStep(#[from] InvalidIndexError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidIndexError {
    #[error("channel {index} out of range (0..{bound})")]
    Channel { index: usize, bound: usize },
    #[error("step {index} out of range (0..{bound})")]
    Step { index: usize, bound: usize },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TriggerError {
    #[error(transparent)]
    InvalidIndex(#[from] InvalidIndexError),
    #[error("trigger duration must be greater than zero")]
    ZeroDuration,
    #[error("batch trigger needs at least one channel")]
    EmptyBatch,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid actuator url {value:?}: {source}")]
    Url {
        value: String,
        source: url::ParseError,
    },
    #[error("unsupported url scheme {0:?} (expected ws or wss)")]
    Scheme(String),
    #[error("{name}={value:?} is not a valid number")]
    Number { name: &'static str, value: String },
    #[error("unknown stall policy {0:?} (expected skip or catch_up)")]
    StallPolicy(String),
    #[error("reconnect cap {max_ms}ms is below the base interval {base_ms}ms")]
    Backoff { base_ms: u64, max_ms: u64 },
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
}

/// Failure reported by the actuator for a command it received.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("actuator error{}: {message}", on_channel(.channel))]
pub struct ActuatorError {
    pub message: String,
    pub channel: Option<i64>,
}

fn on_channel(channel: &Option<i64>) -> String {
    channel.map(|c| format!(" on channel {c}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actuator_error_names_the_channel_when_known() {
        let err = ActuatorError {
            message: "pin busy".into(),
            channel: Some(4),
        };
        assert_eq!(err.to_string(), "actuator error on channel 4: pin busy");

        let err = ActuatorError {
            message: "bad json".into(),
            channel: None,
        };
        assert_eq!(err.to_string(), "actuator error: bad json");
        let _: &dyn std::error::Error = &err;
    }

    #[test]
    fn out_of_range_start_step_reads_as_an_index_error() {
        let err = ClockInitError::from(InvalidIndexError::Step { index: 16, bound: 16 });
        assert_eq!(err.to_string(), "step 16 out of range (0..16)");
    }
}
