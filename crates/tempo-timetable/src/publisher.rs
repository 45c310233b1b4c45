use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use tempo_store::MqTransmission;

use crate::error::{Result, TimetableError};

/// Hands a unit of work over to the workers.
pub trait Publisher: Send + Sync {
    fn publish(&self, message: &MqTransmission) -> Result<()>;
}

/// In-process dispatch over a bounded tokio channel.
///
/// Never blocks: a full channel is reported as a dispatch failure and the
/// next scheduler tick republishes.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<MqTransmission>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MqTransmission>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, message: &MqTransmission) -> Result<()> {
        match self.tx.try_send(message.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    process = %message.process_name,
                    uow = message.unit_of_work_id,
                    "dispatch channel full"
                );
                Err(TimetableError::Dispatch("dispatch channel full".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(TimetableError::Dispatch("dispatch channel closed".to_string()))
            }
        }
    }
}
