//! Injectable client context wiring the store, coordinator, and
//! resilience stack over one transport.
//!
//! Constructed once and handed to consumers; nothing here is ambient
//! process state, so tests build as many isolated clients as they need.

use std::sync::Arc;

use client_transport::{RawResponse, Request, Transport};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    breaker::{CircuitBreaker, CircuitState},
    config::ClientConfig,
    conversation::ConversationHub,
    diagnostics::{ErrorLog, ErrorReport},
    error::{ClientError, now_unix_ms},
    mutation::{MutationCoordinator, MutationHandle},
    retry::retry_with_backoff,
    store::{SharedStore, StoreEvent, Subscription, ViewName},
    types::{Entity, EntityKind, FieldDeltas, Message, field_map, page_from_body},
};

/// Downstream resource class guarded by the client's breaker.
const API_RESOURCE: &str = "marketplace-api";

/// How a list load lands in its view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    /// Reset to page 1.
    Replace,
    /// Grow the view for infinite scroll.
    Append,
}

/// Client context: one store, one error log, one breaker, one transport.
pub struct Client<T: Transport> {
    store: SharedStore,
    errors: Arc<ErrorLog>,
    breaker: Arc<CircuitBreaker>,
    transport: T,
    config: ClientConfig,
    current_user_id: String,
    coordinator: MutationCoordinator,
    conversations: ConversationHub<T>,
    cancel: CancellationToken,
}

impl<T: Transport + Clone + 'static> Client<T> {
    pub fn new(transport: T, config: ClientConfig, current_user_id: impl Into<String>) -> Self {
        let current_user_id = current_user_id.into();
        let store = SharedStore::new();
        let errors = Arc::new(ErrorLog::new());
        let breaker = Arc::new(CircuitBreaker::new(
            API_RESOURCE,
            config.breaker_threshold,
            config.breaker_timeout(),
        ));
        let conversations = ConversationHub::new(
            store.clone(),
            transport.clone(),
            errors.clone(),
            current_user_id.clone(),
            config.poll_interval(),
            config.page_size,
        );

        Self {
            coordinator: MutationCoordinator::new(store.clone()),
            store,
            errors,
            breaker,
            transport,
            config,
            current_user_id,
            conversations,
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn conversations(&self) -> &ConversationHub<T> {
        &self.conversations
    }

    pub fn current_user_id(&self) -> &str {
        &self.current_user_id
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Diagnostic snapshot of recently classified failures.
    pub fn error_report(&self) -> ErrorReport {
        self.errors.report()
    }

    /// Attach a store listener, notified synchronously per mutation.
    pub fn subscribe(&self, listener: impl Fn(&StoreEvent) + Send + Sync + 'static) -> Subscription {
        self.store.subscribe(listener)
    }

    /// Cancel in-flight retry sleeps and stop background polling.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.conversations.stop_polling().await;
    }

    /// Load one page of a named view with full loading discipline:
    /// Loading before the fetch, cleared on every exit path.
    pub async fn load_view(&self, view: &ViewName, mode: PageMode) -> Result<(), ClientError> {
        let page = match mode {
            PageMode::Replace => 1,
            PageMode::Append => {
                self.store
                    .view_snapshot(view)
                    .map(|snapshot| snapshot.cursor)
                    .unwrap_or(0)
                    + 1
            }
        };
        let (path, kind) = self.view_source(view);
        let separator = if path.contains('?') { '&' } else { '?' };
        let request = Request::get(format!(
            "{path}{separator}page={page}&limit={}",
            self.config.page_size
        ));
        self.load_into(view, kind, request, mode).await
    }

    /// Full-text listing search into the search view.
    pub async fn search(&self, query: &str) -> Result<(), ClientError> {
        let request = Request::get(format!(
            "/posts/search?q={query}&page=1&limit={}",
            self.config.page_size
        ));
        self.load_into(&ViewName::Search, EntityKind::Post, request, PageMode::Replace)
            .await
    }

    async fn load_into(
        &self,
        view: &ViewName,
        kind: EntityKind,
        request: Request,
        mode: PageMode,
    ) -> Result<(), ClientError> {
        self.store.set_view_loading(view);

        let response = match self.resilient_send(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(view = %view, code = %err.code, "view load failed");
                self.store.set_view_error(view, err.message.clone());
                return Err(err);
            }
        };

        let page = match page_from_body(&response.body, kind) {
            Ok(page) => page,
            Err(err) => {
                self.store.set_view_error(view, err.message.clone());
                return Err(err);
            }
        };

        self.store.mutate(|store, events| {
            for entity in &page.entities {
                store.upsert(&entity.id, kind, &entity.fields, events);
            }
            match mode {
                PageMode::Replace => store.replace_view(view, page.ids.clone(), page.has_more, events),
                PageMode::Append => store.append_view(view, page.ids.clone(), page.has_more, events),
            }
        });
        Ok(())
    }

    /// Optimistically toggle the like state of a listing.
    pub async fn toggle_like(&self, post_id: &str, view: &ViewName) -> Result<(), ClientError> {
        let post = self.store.post(post_id).ok_or_else(|| {
            ClientError::internal("unknown_entity", format!("post '{post_id}' is not cached"))
        })?;

        let liked = !post.is_liked;
        let deltas = field_map(json!({
            "is_liked": liked,
            "like_count": post.like_count + if liked { 1 } else { -1 },
        }));
        let handle = self
            .coordinator
            .apply_optimistic(post_id, EntityKind::Post, deltas);

        let request = Request::post(format!("/posts/{post_id}/like"), json!({"liked": liked}));
        self.run_mutation(handle, view, request).await.map(|_| ())
    }

    /// Optimistically apply arbitrary field edits to a listing.
    pub async fn update_post(
        &self,
        post_id: &str,
        deltas: FieldDeltas,
        view: &ViewName,
    ) -> Result<(), ClientError> {
        let body = serde_json::Value::Object(deltas.clone());
        let handle = self
            .coordinator
            .apply_optimistic(post_id, EntityKind::Post, deltas);
        let request = Request::put(format!("/posts/{post_id}"), body);
        self.run_mutation(handle, view, request).await.map(|_| ())
    }

    /// Optimistically delete a listing; rollback restores it at its
    /// prior position in every view.
    pub async fn delete_post(&self, post_id: &str, view: &ViewName) -> Result<(), ClientError> {
        let handle = self.coordinator.apply_optimistic_delete(post_id);
        let request = Request::delete(format!("/posts/{post_id}"));
        self.run_mutation(handle, view, request).await.map(|_| ())
    }

    /// Send a message: a local message appears in the thread
    /// immediately and is renamed to its server id on confirmation.
    ///
    /// Returns the final message id.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
    ) -> Result<String, ClientError> {
        let thread = ViewName::Thread(conversation_id.to_owned());
        let local_id = format!("local-{}", Uuid::new_v4());
        let now = now_unix_ms();
        let message = Message {
            id: local_id.clone(),
            conversation_id: conversation_id.to_owned(),
            sender_id: self.current_user_id.clone(),
            body: body.to_owned(),
            sent_at_ms: now,
            is_read: true,
        };
        let entity = Entity::from_typed(&local_id, EntityKind::Message, &message)?;

        let message_count = self
            .store
            .conversation(conversation_id)
            .map(|conversation| conversation.message_count)
            .unwrap_or(0);

        self.store.mutate(|store, events| {
            store.upsert(&local_id, EntityKind::Message, &entity.fields, events);
            store.push_view_id(&thread, &local_id, events);
        });
        let handle = self.coordinator.apply_optimistic(
            conversation_id,
            EntityKind::Conversation,
            field_map(json!({
                "last_message_preview": body,
                "last_activity_ms": now,
                "message_count": message_count + 1,
            })),
        );

        let request = Request::post(
            format!("/conversations/{conversation_id}/messages"),
            json!({"sender_id": self.current_user_id, "body": body}),
        );
        match self.resilient_send(request).await {
            Ok(response) => {
                self.coordinator.confirm(&handle);
                let final_id = match response.body.get("id").and_then(|id| id.as_str()) {
                    Some(server_id) => {
                        let fields = field_map(response.body.clone());
                        self.store.mutate(|store, events| {
                            store.rename_entity(&local_id, server_id, events);
                            store.upsert(server_id, EntityKind::Message, &fields, events);
                        });
                        server_id.to_owned()
                    }
                    None => {
                        warn!(conversation_id = %conversation_id, "send ack carried no message id");
                        local_id.clone()
                    }
                };
                debug!(conversation_id = %conversation_id, message_id = %final_id, "message sent");
                Ok(final_id)
            }
            Err(err) => {
                self.coordinator.rollback(&handle);
                self.store.remove(&local_id);
                self.store.set_view_error(&thread, err.message.clone());
                Err(err)
            }
        }
    }

    /// Breaker-guarded, retry-wrapped transport call.
    async fn resilient_send(&self, request: Request) -> Result<RawResponse, ClientError> {
        let policy = self.config.backoff_policy();
        let errors = &self.errors;
        let cancel = &self.cancel;
        let transport = &self.transport;
        self.breaker
            .call(|| {
                retry_with_backoff(policy, errors, cancel, move || {
                    let request = request.clone();
                    async move { transport.send(request).await }
                })
            })
            .await
    }

    fn view_source(&self, view: &ViewName) -> (String, EntityKind) {
        match view {
            ViewName::Feed => ("/posts".to_owned(), EntityKind::Post),
            ViewName::Mine => (
                format!("/users/{}/posts", self.current_user_id),
                EntityKind::Post,
            ),
            ViewName::Drafts => (
                format!("/users/{}/drafts", self.current_user_id),
                EntityKind::Post,
            ),
            ViewName::Search => ("/posts/search".to_owned(), EntityKind::Post),
            ViewName::Seller(user_id) => (format!("/users/{user_id}/posts"), EntityKind::Post),
            ViewName::Conversations => ("/conversations".to_owned(), EntityKind::Conversation),
            ViewName::Thread(conversation_id) => (
                format!("/conversations/{conversation_id}/messages"),
                EntityKind::Message,
            ),
        }
    }

    async fn run_mutation(
        &self,
        handle: MutationHandle,
        view: &ViewName,
        request: Request,
    ) -> Result<RawResponse, ClientError> {
        match self.resilient_send(request).await {
            Ok(response) => {
                self.coordinator.confirm(&handle);
                Ok(response)
            }
            Err(err) => {
                self.coordinator.rollback(&handle);
                warn!(
                    entity_id = %handle.entity_id(),
                    view = %view,
                    code = %err.code,
                    "optimistic mutation rolled back"
                );
                self.store.set_view_error(view, err.message.clone());
                Err(err)
            }
        }
    }
}
