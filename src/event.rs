//! Ordered event dispatch.
//!
//! [`EventHandler`] hands an event to its listeners front to back until one
//! of them answers [`EventResponse::Accepted`].

use glam::Vec2;

/// What a listener did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResponse {
    /// Consumed; later listeners do not see it.
    Accepted,
    /// Passed on to the next listener.
    Continue,
}

impl EventResponse {
    pub fn is_accepted(self) -> bool {
        self == EventResponse::Accepted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Other(u16),
}

/// Pointer and keyboard input routed through a processor network.
///
/// Positions are in pixels of the render port the event arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum InteractionEvent {
    MouseMove {
        position: Vec2,
        delta: Vec2,
    },
    MouseButton {
        button: MouseButton,
        pressed: bool,
        position: Vec2,
    },
    Wheel {
        delta: Vec2,
        position: Vec2,
    },
    Key {
        code: u32,
        pressed: bool,
    },
}

impl InteractionEvent {
    /// Pointer position, if the event has one.
    pub fn position(&self) -> Option<Vec2> {
        match self {
            InteractionEvent::MouseMove { position, .. }
            | InteractionEvent::MouseButton { position, .. }
            | InteractionEvent::Wheel { position, .. } => Some(*position),
            InteractionEvent::Key { .. } => None,
        }
    }
}

/// Something that can react to events of type `E`.
///
/// Closures taking `&mut E` implement it, so most listeners are written
/// inline:
///
/// ```
/// use phalanx::{EventHandler, EventResponse, InteractionEvent};
///
/// let mut handler = EventHandler::<InteractionEvent>::new();
/// handler.add_listener_back(|event: &mut InteractionEvent| match event {
///     InteractionEvent::Key { .. } => EventResponse::Accepted,
///     _ => EventResponse::Continue,
/// });
///
/// let mut key = InteractionEvent::Key { code: 32, pressed: true };
/// assert!(handler.broadcast(&mut key).is_accepted());
/// ```
pub trait EventListener<E> {
    fn on_event(&mut self, event: &mut E) -> EventResponse;
}

impl<E, F> EventListener<E> for F
where
    F: FnMut(&mut E) -> EventResponse,
{
    fn on_event(&mut self, event: &mut E) -> EventResponse {
        self(event)
    }
}

/// Names a listener for [`EventHandler::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An ordered list of listeners for events of type `E`.
pub struct EventHandler<E> {
    listeners: Vec<(ListenerId, Box<dyn EventListener<E>>)>,
    next_id: u64,
}

impl<E> Default for EventHandler<E> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            next_id: 0,
        }
    }
}

impl<E> EventHandler<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener that is asked before all current ones.
    pub fn add_listener_front(&mut self, listener: impl EventListener<E> + 'static) -> ListenerId {
        let id = self.next();
        self.listeners.insert(0, (id, Box::new(listener)));
        id
    }

    /// Adds a listener that is asked after all current ones.
    pub fn add_listener_back(&mut self, listener: impl EventListener<E> + 'static) -> ListenerId {
        let id = self.next();
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener, _)| *listener != id);
        self.listeners.len() != before
    }

    /// Offers `event` to each listener in order, stopping at the first that
    /// accepts it.
    pub fn broadcast(&mut self, event: &mut E) -> EventResponse {
        for (_, listener) in &mut self.listeners {
            if listener.on_event(event).is_accepted() {
                return EventResponse::Accepted;
            }
        }
        EventResponse::Continue
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn next(&mut self) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        id
    }
}
