//! Single-source-of-truth entity cache plus named view projections.
//!
//! Views hold entity ids, never field copies, so one upsert updates
//! every view referencing that id with no propagation step. All
//! mutations are synchronous and atomic; subscribers are notified
//! synchronously right after each mutation, outside the store lock.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::{Conversation, Entity, EntityKind, FieldDeltas, Message, Post, UserProfile};

/// Named ordered projection over the entity cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ViewName {
    Feed,
    Mine,
    Drafts,
    Search,
    /// Listings of one seller.
    Seller(String),
    Conversations,
    /// Message history of one conversation.
    Thread(String),
}

impl fmt::Display for ViewName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feed => write!(f, "feed"),
            Self::Mine => write!(f, "mine"),
            Self::Drafts => write!(f, "drafts"),
            Self::Search => write!(f, "search"),
            Self::Seller(user_id) => write!(f, "seller:{user_id}"),
            Self::Conversations => write!(f, "conversations"),
            Self::Thread(conversation_id) => write!(f, "thread:{conversation_id}"),
        }
    }
}

/// Load status of a view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Error,
}

/// Per-view projection state: ordered ids plus pagination/load status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ViewSnapshot {
    pub ordered_ids: Vec<String>,
    pub has_more: bool,
    /// Page counter: 0 before the first load, then 1-based.
    pub cursor: u32,
    pub load_state: LoadState,
    pub error_message: Option<String>,
}

/// Mutation notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    EntityUpserted { id: String },
    EntityRemoved { id: String },
    ViewChanged { name: ViewName },
}

/// Field-level restore instruction used by rollback.
///
/// `prior: None` means the field did not exist before the mutation and
/// must be removed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRestore {
    pub key: String,
    pub prior: Option<serde_json::Value>,
}

/// The cache and view state proper. Access goes through [`SharedStore`].
#[derive(Debug, Default)]
pub struct Store {
    entities: HashMap<String, Entity>,
    views: HashMap<ViewName, ViewSnapshot>,
}

impl Store {
    /// Shallow-merge fields into an entity, creating it on first sight.
    pub fn upsert(
        &mut self,
        id: &str,
        kind: EntityKind,
        deltas: &FieldDeltas,
        events: &mut Vec<StoreEvent>,
    ) {
        match self.entities.get_mut(id) {
            Some(entity) => entity.merge(deltas),
            None => {
                self.entities
                    .insert(id.to_owned(), Entity::new(id, kind, deltas.clone()));
            }
        }
        trace!(entity_id = %id, field_count = deltas.len(), "entity upserted");
        events.push(StoreEvent::EntityUpserted { id: id.to_owned() });
    }

    /// Set or remove individual fields; used to rewind a mutation.
    pub fn restore_fields(
        &mut self,
        id: &str,
        restores: &[FieldRestore],
        events: &mut Vec<StoreEvent>,
    ) {
        let Some(entity) = self.entities.get_mut(id) else {
            return;
        };
        for restore in restores {
            match &restore.prior {
                Some(value) => {
                    entity.fields.insert(restore.key.clone(), value.clone());
                }
                None => {
                    entity.fields.remove(&restore.key);
                }
            }
        }
        events.push(StoreEvent::EntityUpserted { id: id.to_owned() });
    }

    /// Delete an entity and strip its id from every view.
    ///
    /// Returns the removed entity so callers can snapshot it.
    pub fn remove(&mut self, id: &str, events: &mut Vec<StoreEvent>) -> Option<Entity> {
        let removed = self.entities.remove(id)?;
        for (name, view) in &mut self.views {
            let before = view.ordered_ids.len();
            view.ordered_ids.retain(|existing| existing != id);
            if view.ordered_ids.len() != before {
                events.push(StoreEvent::ViewChanged { name: name.clone() });
            }
        }
        debug!(entity_id = %id, "entity removed from cache and views");
        events.push(StoreEvent::EntityRemoved { id: id.to_owned() });
        Some(removed)
    }

    /// Re-insert a previously removed entity and splice its id back
    /// into each view at its captured position.
    pub fn reinsert(
        &mut self,
        entity: Entity,
        positions: &[(ViewName, usize)],
        events: &mut Vec<StoreEvent>,
    ) {
        let id = entity.id.clone();
        self.entities.insert(id.clone(), entity);
        events.push(StoreEvent::EntityUpserted { id: id.clone() });

        for (name, index) in positions {
            let view = self.views.entry(name.clone()).or_default();
            if view.ordered_ids.iter().any(|existing| existing == &id) {
                continue;
            }
            let at = (*index).min(view.ordered_ids.len());
            view.ordered_ids.insert(at, id.clone());
            events.push(StoreEvent::ViewChanged { name: name.clone() });
        }
    }

    /// `(view, index)` positions of an id across all views.
    pub fn positions_of(&self, id: &str) -> Vec<(ViewName, usize)> {
        self.views
            .iter()
            .filter_map(|(name, view)| {
                view.ordered_ids
                    .iter()
                    .position(|existing| existing == id)
                    .map(|index| (name.clone(), index))
            })
            .collect()
    }

    /// Rename an entity id in the cache and every view, in place.
    ///
    /// Used when a locally created entity receives its server id.
    pub fn rename_entity(&mut self, old_id: &str, new_id: &str, events: &mut Vec<StoreEvent>) {
        let Some(mut entity) = self.entities.remove(old_id) else {
            return;
        };
        entity.id = new_id.to_owned();
        entity
            .fields
            .insert("id".to_owned(), serde_json::Value::String(new_id.to_owned()));
        self.entities.insert(new_id.to_owned(), entity);

        for (name, view) in &mut self.views {
            let mut touched = false;
            for existing in &mut view.ordered_ids {
                if existing == old_id {
                    *existing = new_id.to_owned();
                    touched = true;
                }
            }
            if touched {
                events.push(StoreEvent::ViewChanged { name: name.clone() });
            }
        }
        events.push(StoreEvent::EntityRemoved {
            id: old_id.to_owned(),
        });
        events.push(StoreEvent::EntityUpserted {
            id: new_id.to_owned(),
        });
    }

    /// Reset a view to page 1 with fresh ids; clears any error.
    pub fn replace_view(
        &mut self,
        name: &ViewName,
        ids: Vec<String>,
        has_more: bool,
        events: &mut Vec<StoreEvent>,
    ) {
        let view = self.views.entry(name.clone()).or_default();
        view.ordered_ids = ids;
        view.has_more = has_more;
        view.cursor = 1;
        view.load_state = LoadState::Idle;
        view.error_message = None;
        debug!(view = %name, len = view.ordered_ids.len(), has_more, "view replaced");
        events.push(StoreEvent::ViewChanged { name: name.clone() });
    }

    /// Grow a view for infinite scroll; the caller guarantees no
    /// duplicate ids across pages.
    pub fn append_view(
        &mut self,
        name: &ViewName,
        ids: Vec<String>,
        has_more: bool,
        events: &mut Vec<StoreEvent>,
    ) {
        let view = self.views.entry(name.clone()).or_default();
        view.ordered_ids.extend(ids);
        view.has_more = has_more;
        view.cursor += 1;
        view.load_state = LoadState::Idle;
        view.error_message = None;
        debug!(view = %name, len = view.ordered_ids.len(), has_more, "view appended");
        events.push(StoreEvent::ViewChanged { name: name.clone() });
    }

    /// Append a single id to a view without touching pagination state.
    ///
    /// Used for locally created entities (for example an outgoing
    /// message) that are not part of a fetched page.
    pub fn push_view_id(&mut self, name: &ViewName, id: &str, events: &mut Vec<StoreEvent>) {
        let view = self.views.entry(name.clone()).or_default();
        if view.ordered_ids.iter().any(|existing| existing == id) {
            return;
        }
        view.ordered_ids.push(id.to_owned());
        events.push(StoreEvent::ViewChanged { name: name.clone() });
    }

    /// Mark a view as loading. Must be paired with a `replace_view`/
    /// `append_view`/`set_view_error` on every exit path.
    pub fn set_view_loading(&mut self, name: &ViewName, events: &mut Vec<StoreEvent>) {
        let view = self.views.entry(name.clone()).or_default();
        view.load_state = LoadState::Loading;
        events.push(StoreEvent::ViewChanged { name: name.clone() });
    }

    /// Surface an error in the view's error slot; clears loading.
    pub fn set_view_error(
        &mut self,
        name: &ViewName,
        message: impl Into<String>,
        events: &mut Vec<StoreEvent>,
    ) {
        let view = self.views.entry(name.clone()).or_default();
        view.load_state = LoadState::Error;
        view.error_message = Some(message.into());
        events.push(StoreEvent::ViewChanged { name: name.clone() });
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn view(&self, name: &ViewName) -> Option<&ViewSnapshot> {
        self.views.get(name)
    }
}

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct SubscriberSet {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Cheap-clone handle over the store plus its subscriber list.
///
/// Every mutation runs inside one synchronous lock section; listeners
/// are invoked after the lock is released, so they may read back into
/// the store.
#[derive(Clone, Default)]
pub struct SharedStore {
    store: Arc<RwLock<Store>>,
    subscribers: Arc<Mutex<SubscriberSet>>,
}

/// Active subscription; dropping it (or calling [`Self::unsubscribe`])
/// detaches the listener.
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<SubscriberSet>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .listeners
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a compound mutation atomically, then notify subscribers.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Store, &mut Vec<StoreEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut store = self.store.write();
            f(&mut store, &mut events)
        };
        self.dispatch(&events);
        result
    }

    /// Read without mutating.
    pub fn read<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.store.read())
    }

    /// Attach a listener invoked synchronously after each mutation.
    pub fn subscribe(&self, listener: impl Fn(&StoreEvent) + Send + Sync + 'static) -> Subscription {
        let mut subscribers = self.subscribers.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    fn dispatch(&self, events: &[StoreEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .subscribers
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }

    // Convenience single-operation wrappers.

    pub fn upsert(&self, id: &str, kind: EntityKind, deltas: &FieldDeltas) {
        self.mutate(|store, events| store.upsert(id, kind, deltas, events));
    }

    pub fn remove(&self, id: &str) -> Option<Entity> {
        self.mutate(|store, events| store.remove(id, events))
    }

    pub fn replace_view(&self, name: &ViewName, ids: Vec<String>, has_more: bool) {
        self.mutate(|store, events| store.replace_view(name, ids, has_more, events));
    }

    pub fn append_view(&self, name: &ViewName, ids: Vec<String>, has_more: bool) {
        self.mutate(|store, events| store.append_view(name, ids, has_more, events));
    }

    pub fn set_view_loading(&self, name: &ViewName) {
        self.mutate(|store, events| store.set_view_loading(name, events));
    }

    pub fn set_view_error(&self, name: &ViewName, message: impl Into<String>) {
        self.mutate(|store, events| store.set_view_error(name, message, events));
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.read(|store| store.entity(id).cloned())
    }

    pub fn view_snapshot(&self, name: &ViewName) -> Option<ViewSnapshot> {
        self.read(|store| store.view(name).cloned())
    }

    pub fn post(&self, id: &str) -> Option<Post> {
        self.entity(id).and_then(|entity| entity.to_typed().ok())
    }

    pub fn profile(&self, id: &str) -> Option<UserProfile> {
        self.entity(id).and_then(|entity| entity.to_typed().ok())
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.entity(id).and_then(|entity| entity.to_typed().ok())
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.entity(id).and_then(|entity| entity.to_typed().ok())
    }
}
