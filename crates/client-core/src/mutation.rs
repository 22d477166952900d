//! Optimistic mutation with explicit two-phase resolution.
//!
//! `apply_optimistic` makes the change visible immediately and returns
//! a handle carrying a freshly computed inverse; the caller later
//! resolves the handle with `confirm` (keep) or `rollback` (rewind).
//! In-flight mutations are first-class values, not call-stack state.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    store::{FieldRestore, SharedStore, ViewName},
    types::{Entity, EntityKind, FieldDeltas},
};

/// In-flight optimistic mutation, resolvable exactly once.
///
/// `confirm`/`rollback` on an already-resolved handle are no-ops, so a
/// handle superseded by a later same-field mutation can no longer
/// clobber state.
#[derive(Debug)]
pub struct MutationHandle {
    id: u64,
    entity_id: String,
    inverse: Vec<FieldRestore>,
    delete_restore: Option<DeleteRestore>,
    resolved: Arc<AtomicBool>,
}

#[derive(Debug)]
struct DeleteRestore {
    entity: Entity,
    positions: Vec<(ViewName, usize)>,
}

impl MutationHandle {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }
}

struct Claim {
    handle_id: u64,
    resolved: Arc<AtomicBool>,
}

#[derive(Default)]
struct CoordinatorState {
    next_handle_id: u64,
    /// One outstanding claim per `(entity_id, field)`.
    claims: HashMap<(String, String), Claim>,
}

/// Applies optimistic field deltas and drives their resolution.
#[derive(Clone)]
pub struct MutationCoordinator {
    store: SharedStore,
    state: Arc<Mutex<CoordinatorState>>,
}

impl MutationCoordinator {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(CoordinatorState::default())),
        }
    }

    /// Apply `deltas` optimistically and return a rollback handle.
    ///
    /// The inverse is computed from the *current* cache values, not a
    /// fixed baseline, so interleaved mutations on other fields cannot
    /// skew the rewind. A second mutation touching a still-pending
    /// field supersedes the earlier handle: that handle is resolved in
    /// place and its later confirm/rollback becomes a no-op.
    pub fn apply_optimistic(
        &self,
        entity_id: &str,
        kind: EntityKind,
        deltas: FieldDeltas,
    ) -> MutationHandle {
        let mut state = self.state.lock();
        state.next_handle_id += 1;
        let handle_id = state.next_handle_id;
        let resolved = Arc::new(AtomicBool::new(false));

        for key in deltas.keys() {
            let claim_key = (entity_id.to_owned(), key.clone());
            if let Some(previous) = state.claims.remove(&claim_key) {
                previous.resolved.store(true, Ordering::SeqCst);
                debug!(
                    entity_id = %entity_id,
                    field = %key,
                    superseded_handle = previous.handle_id,
                    "pending mutation superseded"
                );
            }
            state.claims.insert(
                claim_key,
                Claim {
                    handle_id,
                    resolved: resolved.clone(),
                },
            );
        }

        let inverse = self.store.mutate(|store, events| {
            let inverse = deltas
                .keys()
                .map(|key| FieldRestore {
                    key: key.clone(),
                    prior: store
                        .entity(entity_id)
                        .and_then(|entity| entity.field(key).cloned()),
                })
                .collect();
            store.upsert(entity_id, kind, &deltas, events);
            inverse
        });

        trace!(entity_id = %entity_id, handle_id, "optimistic mutation applied");
        MutationHandle {
            id: handle_id,
            entity_id: entity_id.to_owned(),
            inverse,
            delete_restore: None,
            resolved,
        }
    }

    /// Remove an entity optimistically, capturing a restore snapshot.
    ///
    /// Rollback re-inserts the entity and splices its id back into
    /// each view at the position captured here. Deleting an unknown id
    /// yields an already-resolved no-op handle.
    pub fn apply_optimistic_delete(&self, entity_id: &str) -> MutationHandle {
        let mut state = self.state.lock();
        state.next_handle_id += 1;
        let handle_id = state.next_handle_id;

        // A delete supersedes every pending field mutation on the entity.
        state.claims.retain(|(claimed_entity, _), claim| {
            if claimed_entity == entity_id {
                claim.resolved.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });

        let restore = self.store.mutate(|store, events| {
            let positions = store.positions_of(entity_id);
            store
                .remove(entity_id, events)
                .map(|entity| DeleteRestore { entity, positions })
        });

        let resolved = Arc::new(AtomicBool::new(restore.is_none()));
        MutationHandle {
            id: handle_id,
            entity_id: entity_id.to_owned(),
            inverse: Vec::new(),
            delete_restore: restore,
            resolved,
        }
    }

    /// Keep the optimistic state as canonical. Idempotent.
    pub fn confirm(&self, handle: &MutationHandle) {
        if handle.resolved.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_claims(handle.id);
        trace!(entity_id = %handle.entity_id, handle_id = handle.id, "mutation confirmed");
    }

    /// Rewind the optimistic state. Idempotent.
    pub fn rollback(&self, handle: &MutationHandle) {
        if handle.resolved.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_claims(handle.id);

        match &handle.delete_restore {
            Some(restore) => {
                self.store.mutate(|store, events| {
                    store.reinsert(restore.entity.clone(), &restore.positions, events);
                });
            }
            None => {
                self.store.mutate(|store, events| {
                    store.restore_fields(&handle.entity_id, &handle.inverse, events);
                });
            }
        }
        debug!(entity_id = %handle.entity_id, handle_id = handle.id, "mutation rolled back");
    }

    fn release_claims(&self, handle_id: u64) {
        self.state
            .lock()
            .claims
            .retain(|_, claim| claim.handle_id != handle_id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::field_map;

    fn setup() -> (SharedStore, MutationCoordinator) {
        let store = SharedStore::new();
        store.upsert(
            "post-7",
            EntityKind::Post,
            &field_map(json!({
                "id": "post-7",
                "title": "Bike",
                "seller_id": "user-9",
                "is_liked": false,
                "like_count": 24,
            })),
        );
        let coordinator = MutationCoordinator::new(store.clone());
        (store, coordinator)
    }

    fn toggle_deltas(store: &SharedStore, post_id: &str) -> FieldDeltas {
        let post = store.post(post_id).expect("post should exist");
        let delta = if post.is_liked { -1 } else { 1 };
        field_map(json!({
            "is_liked": !post.is_liked,
            "like_count": post.like_count + delta,
        }))
    }

    #[test]
    fn rollback_restores_exact_prior_values() {
        let (store, coordinator) = setup();

        let deltas = toggle_deltas(&store, "post-7");
        let handle = coordinator.apply_optimistic("post-7", EntityKind::Post, deltas);

        let post = store.post("post-7").expect("post");
        assert!(post.is_liked);
        assert_eq!(post.like_count, 25);

        coordinator.rollback(&handle);
        let post = store.post("post-7").expect("post");
        assert!(!post.is_liked);
        assert_eq!(post.like_count, 24);
    }

    #[test]
    fn rollback_removes_fields_that_did_not_exist() {
        let (store, coordinator) = setup();

        let handle = coordinator.apply_optimistic(
            "post-7",
            EntityKind::Post,
            field_map(json!({"sold_at_ms": 1_700_000_000_000_u64})),
        );
        assert!(
            store
                .entity("post-7")
                .expect("post")
                .field("sold_at_ms")
                .is_some()
        );

        coordinator.rollback(&handle);
        assert!(
            store
                .entity("post-7")
                .expect("post")
                .field("sold_at_ms")
                .is_none()
        );
    }

    #[test]
    fn repeated_toggles_never_drift() {
        let (store, coordinator) = setup();

        for _ in 0..3 {
            let deltas = toggle_deltas(&store, "post-7");
            let handle = coordinator.apply_optimistic("post-7", EntityKind::Post, deltas);
            coordinator.confirm(&handle);

            let deltas = toggle_deltas(&store, "post-7");
            let handle = coordinator.apply_optimistic("post-7", EntityKind::Post, deltas);
            coordinator.rollback(&handle);
        }

        let post = store.post("post-7").expect("post");
        assert!(post.is_liked);
        assert_eq!(post.like_count, 25);
    }

    #[test]
    fn resolution_is_idempotent_in_both_orders() {
        let (store, coordinator) = setup();

        let handle = coordinator.apply_optimistic(
            "post-7",
            EntityKind::Post,
            field_map(json!({"like_count": 25})),
        );
        coordinator.confirm(&handle);
        coordinator.rollback(&handle);
        assert_eq!(store.post("post-7").expect("post").like_count, 25);

        let handle = coordinator.apply_optimistic(
            "post-7",
            EntityKind::Post,
            field_map(json!({"like_count": 30})),
        );
        coordinator.rollback(&handle);
        coordinator.confirm(&handle);
        assert_eq!(store.post("post-7").expect("post").like_count, 25);
    }

    #[test]
    fn second_same_field_mutation_supersedes_the_first() {
        let (store, coordinator) = setup();

        let first = coordinator.apply_optimistic(
            "post-7",
            EntityKind::Post,
            field_map(json!({"title": "Bike (reduced)"})),
        );
        let second = coordinator.apply_optimistic(
            "post-7",
            EntityKind::Post,
            field_map(json!({"title": "Bike (sold)"})),
        );

        assert!(first.is_resolved());
        // The superseded handle can no longer rewind anything.
        coordinator.rollback(&first);
        assert_eq!(
            store.entity("post-7").expect("post").field("title"),
            Some(&json!("Bike (sold)"))
        );

        // The live handle rewinds to its own apply-time baseline.
        coordinator.rollback(&second);
        assert_eq!(
            store.entity("post-7").expect("post").field("title"),
            Some(&json!("Bike (reduced)"))
        );
    }

    #[test]
    fn delete_rollback_restores_entity_at_prior_view_position() {
        let (store, coordinator) = setup();
        store.upsert(
            "post-8",
            EntityKind::Post,
            &field_map(json!({"id": "post-8", "title": "Lamp", "seller_id": "user-9"})),
        );
        store.replace_view(
            &ViewName::Feed,
            vec!["post-7".to_owned(), "post-8".to_owned()],
            false,
        );
        store.replace_view(&ViewName::Mine, vec!["post-7".to_owned()], false);

        let handle = coordinator.apply_optimistic_delete("post-7");
        assert_eq!(
            store.view_snapshot(&ViewName::Feed).expect("feed").ordered_ids,
            vec!["post-8"]
        );
        assert!(store.entity("post-7").is_none());

        coordinator.rollback(&handle);
        assert_eq!(
            store.view_snapshot(&ViewName::Feed).expect("feed").ordered_ids,
            vec!["post-7", "post-8"]
        );
        assert_eq!(
            store.view_snapshot(&ViewName::Mine).expect("mine").ordered_ids,
            vec!["post-7"]
        );
        assert_eq!(store.post("post-7").expect("post").like_count, 24);
    }

    #[test]
    fn delete_confirm_keeps_entity_gone() {
        let (store, coordinator) = setup();
        store.replace_view(&ViewName::Feed, vec!["post-7".to_owned()], false);

        let handle = coordinator.apply_optimistic_delete("post-7");
        coordinator.confirm(&handle);
        coordinator.rollback(&handle);

        assert!(store.entity("post-7").is_none());
        assert!(
            store
                .view_snapshot(&ViewName::Feed)
                .expect("feed")
                .ordered_ids
                .is_empty()
        );
    }

    #[test]
    fn deleting_unknown_id_is_a_resolved_no_op() {
        let (store, coordinator) = setup();
        let handle = coordinator.apply_optimistic_delete("post-404");
        assert!(handle.is_resolved());
        coordinator.rollback(&handle);
        assert!(store.entity("post-404").is_none());
    }

    #[test]
    fn delete_supersedes_pending_field_mutations_on_the_entity() {
        let (store, coordinator) = setup();
        store.replace_view(&ViewName::Feed, vec!["post-7".to_owned()], false);

        let field_handle = coordinator.apply_optimistic(
            "post-7",
            EntityKind::Post,
            field_map(json!({"title": "Bike (reduced)"})),
        );
        let delete_handle = coordinator.apply_optimistic_delete("post-7");
        assert!(field_handle.is_resolved());

        coordinator.rollback(&delete_handle);
        // The stale field handle cannot interleave after the restore.
        coordinator.rollback(&field_handle);
        assert_eq!(
            store.entity("post-7").expect("post").field("title"),
            Some(&json!("Bike (reduced)"))
        );
    }
}
