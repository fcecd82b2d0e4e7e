use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Which stream of changes a subscriber follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Appointment creation, status changes, moves and deletions.
    Appointments,
    /// Services, weekly hours, blocked dates and clients.
    Catalog,
}

impl Topic {
    pub fn of(event: &Event) -> Topic {
        if event.appointment_date().is_some() {
            Topic::Appointments
        } else {
            Topic::Catalog
        }
    }
}

/// Broadcast hub for applied events. The booking notifier (e-mail, dashboard
/// refresh) subscribes here.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        if let Some(sender) = self.channels.get(&Topic::of(event)) {
            let _ = sender.send(event.clone());
        }
    }
}
