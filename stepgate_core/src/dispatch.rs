use crate::error::{InvalidIndexError, TriggerError};
use crate::sequence::CHANNEL_COUNT;
use stepgate_protocol::ClientMessage;

/// A trigger request, validated on construction and consumed by one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerCommand {
    /// Every active channel of one step. Channels are ascending and unique.
    Batch { channels: Vec<u8>, duration_ms: u32 },
    Immediate { channel: u8, duration_ms: u32 },
}

impl TriggerCommand {
    pub fn batch(channels: &[usize], duration_ms: u32) -> Result<Self, TriggerError> {
        if duration_ms == 0 {
            return Err(TriggerError::ZeroDuration);
        }
        if channels.is_empty() {
            return Err(TriggerError::EmptyBatch);
        }
        let mut checked = channels
            .iter()
            .map(|&c| check_channel(c))
            .collect::<Result<Vec<u8>, _>>()?;
        checked.sort_unstable();
        checked.dedup();
        Ok(TriggerCommand::Batch {
            channels: checked,
            duration_ms,
        })
    }

    pub fn immediate(channel: usize, duration_ms: u32) -> Result<Self, TriggerError> {
        if duration_ms == 0 {
            return Err(TriggerError::ZeroDuration);
        }
        Ok(TriggerCommand::Immediate {
            channel: check_channel(channel)?,
            duration_ms,
        })
    }

    pub fn into_message(self) -> ClientMessage {
        match self {
            TriggerCommand::Batch {
                channels,
                duration_ms,
            } => ClientMessage::GpioTrigger {
                channels,
                duration: duration_ms,
            },
            TriggerCommand::Immediate {
                channel,
                duration_ms,
            } => ClientMessage::ImmediateTrigger {
                channel,
                duration: duration_ms,
            },
        }
    }
}

/// Where trigger commands go. Implemented by the connection session; the
/// sequencer only knows this seam.
pub trait TriggerDispatch {
    /// Hands the command over for transmission. `false` means it was not
    /// accepted (typically: not connected); the caller does not retry.
    fn dispatch(&self, command: TriggerCommand) -> bool;
}

impl<D: TriggerDispatch + ?Sized> TriggerDispatch for &D {
    fn dispatch(&self, command: TriggerCommand) -> bool {
        (**self).dispatch(command)
    }
}

pub(crate) fn check_channel(channel: usize) -> Result<u8, InvalidIndexError> {
    if channel < CHANNEL_COUNT {
        Ok(channel as u8)
    } else {
        Err(InvalidIndexError::Channel {
            index: channel,
            bound: CHANNEL_COUNT,
        })
    }
}
