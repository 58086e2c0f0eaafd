//! Per-category event dispatch for the relay client

use super::room::RoomMessage;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayEventKind {
    Invite,
    Message,
}

/// We were invited into a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteEvent {
    pub room_id: String,
    pub members: Vec<String>,
}

/// A message arrived in a room we are part of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub room_id: String,
    pub message: RoomMessage,
    /// Unix millis
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Invite(InviteEvent),
    Message(MessageEvent),
}

impl RelayEvent {
    pub fn kind(&self) -> RelayEventKind {
        match self {
            RelayEvent::Invite(_) => RelayEventKind::Invite,
            RelayEvent::Message(_) => RelayEventKind::Message,
        }
    }
}

/// Handle returned by `subscribe`, used to remove exactly that listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

pub type RelayListener = Arc<dyn Fn(&RelayEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, RelayEventKind, RelayListener)>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: RelayEventKind, listener: RelayListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, kind, listener));
        id
    }

    /// Returns false if the listener was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn unsubscribe_all(&self, kind: RelayEventKind) {
        self.listeners.write().retain(|(_, k, _)| *k != kind);
    }

    pub fn listener_count(&self, kind: RelayEventKind) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }

    /// Deliver to every listener of the event's category. Listeners may
    /// subscribe or unsubscribe from inside the callback.
    pub fn emit(&self, event: &RelayEvent) {
        let kind = event.kind();
        let targets: Vec<RelayListener> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in targets {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn invite() -> RelayEvent {
        RelayEvent::Invite(InviteEvent {
            room_id: "!r".to_string(),
            members: vec![],
        })
    }

    fn counter(emitter: &EventEmitter, kind: RelayEventKind) -> (ListenerId, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = emitter.subscribe(
            kind,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (id, count)
    }

    #[test]
    fn test_emit_reaches_only_matching_category() {
        let emitter = EventEmitter::new();
        let (_, invites) = counter(&emitter, RelayEventKind::Invite);
        let (_, messages) = counter(&emitter, RelayEventKind::Message);

        emitter.emit(&invite());

        assert_eq!(invites.load(Ordering::SeqCst), 1);
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_one_and_all() {
        let emitter = EventEmitter::new();
        let (first, first_count) = counter(&emitter, RelayEventKind::Invite);
        let (_, second_count) = counter(&emitter, RelayEventKind::Invite);

        assert!(emitter.unsubscribe(first));
        assert!(!emitter.unsubscribe(first));
        emitter.emit(&invite());
        assert_eq!(first_count.load(Ordering::SeqCst), 0);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);

        emitter.unsubscribe_all(RelayEventKind::Invite);
        assert_eq!(emitter.listener_count(RelayEventKind::Invite), 0);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let emitter = Arc::new(EventEmitter::new());
        let slot: Arc<RwLock<Option<ListenerId>>> = Arc::new(RwLock::new(None));

        let e = emitter.clone();
        let s = slot.clone();
        let id = emitter.subscribe(
            RelayEventKind::Invite,
            Arc::new(move |_| {
                if let Some(id) = *s.read() {
                    e.unsubscribe(id);
                }
            }),
        );
        *slot.write() = Some(id);

        emitter.emit(&invite());
        assert_eq!(emitter.listener_count(RelayEventKind::Invite), 0);
    }
}
