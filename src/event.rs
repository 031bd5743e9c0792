//! Characteristic change events, passed from the application to the accessory server through a channel.
use crate::{CharId, ConnectionId, HapError};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};

/// Number of events that can be queued before senders block.
pub const EVENT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HapEvent {
    /// The value of a characteristic changed.
    CharacteristicChanged {
        iid: CharId,
        /// Connection that caused the change, it is not notified about its own write. None for local changes.
        origin: Option<ConnectionId>,
    },
}

pub type HapEventChannel<M> = Channel<M, HapEvent, EVENT_QUEUE_DEPTH>;

/// Application side of the event channel.
pub struct HapInterfaceSender<'a, M: RawMutex> {
    sender: Sender<'a, M, HapEvent, EVENT_QUEUE_DEPTH>,
}

impl<'a, M: RawMutex> HapInterfaceSender<'a, M> {
    pub fn new(channel: &'a HapEventChannel<M>) -> Self {
        Self {
            sender: channel.sender(),
        }
    }

    /// Report a local change, waits for room in the queue.
    pub async fn characteristic_changed(&self, iid: CharId) {
        self.sender
            .send(HapEvent::CharacteristicChanged { iid, origin: None })
            .await
    }

    /// Report a local change without waiting, fails with [`HapError::OutOfResources`] if the queue is full.
    pub fn try_characteristic_changed(&self, iid: CharId) -> Result<(), HapError> {
        self.sender
            .try_send(HapEvent::CharacteristicChanged { iid, origin: None })
            .map_err(|_| HapError::OutOfResources)
    }
}

/// Server side of the event channel.
pub struct HapInterfaceReceiver<'a, M: RawMutex> {
    receiver: Receiver<'a, M, HapEvent, EVENT_QUEUE_DEPTH>,
}

impl<'a, M: RawMutex> HapInterfaceReceiver<'a, M> {
    pub fn new(channel: &'a HapEventChannel<M>) -> Self {
        Self {
            receiver: channel.receiver(),
        }
    }

    pub fn try_receive(&self) -> Option<HapEvent> {
        self.receiver.try_receive().ok()
    }

    pub async fn receive(&self) -> HapEvent {
        self.receiver.receive().await
    }
}
