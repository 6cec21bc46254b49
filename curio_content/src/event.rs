use std::path::PathBuf;

use curio_shared::{
    crossbeam_channel::{self, Receiver, Sender},
    log::{trace, warn},
    parking_lot::Mutex,
};

use crate::{asset_info::TransformState, AssetGuid};

/// Events that are sent to the observers of a [`Curator`](crate::Curator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CuratorEvent {
    /// All assets have been forgotten.
    AssetListReset,
    AssetAdded(AssetGuid),
    AssetRemoved(AssetGuid),
    /// The file of an asset has been moved. The GUID stays the same.
    AssetMoved { guid: AssetGuid, from: PathBuf, to: PathBuf },
    AssetStateChanged {
        guid: AssetGuid,
        profile: String,
        old: TransformState,
        new: TransformState,
    },
    /// `rejected` claims the GUID of the asset in `kept` and is ignored.
    GuidCollision { guid: AssetGuid, kept: PathBuf, rejected: PathBuf },
    ActiveProfileChanged(String),
}

/// Delivers [`CuratorEvent`]s to every receiver returned by [`EventBus::observe`].
#[derive(Default)]
pub struct EventBus {
    senders: Mutex<Vec<Sender<CuratorEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a channel that receives all events that are sent from now on.
    pub fn observe(&self) -> Receiver<CuratorEvent> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.senders.lock().push(sender);
        receiver
    }

    /// Sends the events to all observers and removes the channels whose receiver has been dropped.
    pub fn send_all(&self, events: impl IntoIterator<Item = CuratorEvent>) {
        let mut senders = self.senders.lock();
        for event in events {
            trace!("Sending event: {event:?}");
            senders.retain(|sender| match sender.send(event.clone()) {
                Ok(()) => true,
                Err(err) => {
                    warn!("Failed to send event {:?}: \"{err}\". Channel will be removed.", err.0);
                    false
                }
            });
        }
    }

    pub fn send(&self, event: CuratorEvent) {
        self.send_all([event]);
    }

    pub fn observer_count(&self) -> usize {
        self.senders.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_observers_receive_events() {
        let bus = EventBus::new();
        let first = bus.observe();
        let second = bus.observe();

        bus.send(CuratorEvent::AssetListReset);

        assert_eq!(first.try_recv(), Ok(CuratorEvent::AssetListReset));
        assert_eq!(second.try_recv(), Ok(CuratorEvent::AssetListReset));
    }

    #[test]
    fn dropped_observers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.observe();
        drop(bus.observe());

        let guid = AssetGuid::new_v4();
        bus.send_all([CuratorEvent::AssetAdded(guid), CuratorEvent::AssetRemoved(guid)]);

        assert_eq!(bus.observer_count(), 1);
        assert_eq!(kept.try_iter().collect::<Vec<_>>().len(), 2);
    }
}
