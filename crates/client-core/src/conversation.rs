//! Conversation polling, read-state, and typing indicators.
//!
//! One conversation is polled at a time through a cancellable tokio
//! task. A page-visibility signal pauses ticks without tearing the
//! loop down; cancellation is checked again after each fetch so a
//! stale tick never mutates a torn-down view.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use client_transport::{Request, Transport};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    diagnostics::ErrorLog,
    error::ClientError,
    fallback::with_default,
    store::{SharedStore, ViewName},
    types::{EntityKind, field_map, page_from_body},
};

/// Poll loop phase: `Idle → Polling ⇄ Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Polling,
    Paused,
}

struct ActivePoll {
    conversation_id: String,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Conversation subsystem: background refresh plus ephemeral state.
pub struct ConversationHub<T: Transport> {
    store: SharedStore,
    transport: T,
    errors: Arc<ErrorLog>,
    current_user_id: String,
    poll_interval: Duration,
    page_size: u16,
    active: Mutex<Option<ActivePoll>>,
    typing: Mutex<HashMap<String, HashSet<String>>>,
}

impl<T: Transport + Clone + 'static> ConversationHub<T> {
    pub fn new(
        store: SharedStore,
        transport: T,
        errors: Arc<ErrorLog>,
        current_user_id: impl Into<String>,
        poll_interval: Duration,
        page_size: u16,
    ) -> Self {
        Self {
            store,
            transport,
            errors,
            current_user_id: current_user_id.into(),
            poll_interval,
            page_size,
            active: Mutex::new(None),
            typing: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self) -> PollPhase {
        match self.active.lock().as_ref() {
            None => PollPhase::Idle,
            Some(poll) if poll.paused.load(Ordering::SeqCst) => PollPhase::Paused,
            Some(_) => PollPhase::Polling,
        }
    }

    /// Conversation currently being polled, if any.
    pub fn polled_conversation(&self) -> Option<String> {
        self.active
            .lock()
            .as_ref()
            .map(|poll| poll.conversation_id.clone())
    }

    /// Start background polling for one conversation, replacing any
    /// previous poll loop.
    pub async fn start_polling(&self, conversation_id: &str) {
        if self
            .active
            .lock()
            .as_ref()
            .is_some_and(|poll| poll.conversation_id == conversation_id)
        {
            return;
        }
        self.stop_polling().await;

        let cancel = CancellationToken::new();
        let paused = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(poll_loop(
            self.store.clone(),
            self.transport.clone(),
            self.errors.clone(),
            conversation_id.to_owned(),
            self.poll_interval,
            self.page_size,
            cancel.child_token(),
            paused.clone(),
        ));

        debug!(conversation_id = %conversation_id, "conversation polling started");
        *self.active.lock() = Some(ActivePoll {
            conversation_id: conversation_id.to_owned(),
            cancel,
            paused,
            task,
        });
    }

    /// Cancel the poll loop and wait for its task to finish.
    pub async fn stop_polling(&self) {
        let running = self.active.lock().take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        let _ = running.task.await;
        debug!(conversation_id = %running.conversation_id, "conversation polling stopped");
    }

    /// Page-visibility signal: hidden pauses ticks, visible resumes
    /// with the same interval configuration.
    pub fn visibility_changed(&self, hidden: bool) {
        if let Some(poll) = self.active.lock().as_ref() {
            poll.paused.store(hidden, Ordering::SeqCst);
            trace!(hidden, conversation_id = %poll.conversation_id, "poll visibility changed");
        }
    }

    /// Open a conversation: mark its messages read and zero the unread
    /// badge in the same local step as firing the read receipt.
    ///
    /// The receipt send is optimistic; its failure is logged only.
    pub async fn open_conversation(&self, conversation_id: &str) {
        let thread = ViewName::Thread(conversation_id.to_owned());
        self.store.mutate(|store, events| {
            let message_ids: Vec<String> = store
                .view(&thread)
                .map(|view| view.ordered_ids.clone())
                .unwrap_or_default();
            let read_delta = field_map(serde_json::json!({"is_read": true}));
            for id in message_ids {
                store.upsert(&id, EntityKind::Message, &read_delta, events);
            }
            store.upsert(
                conversation_id,
                EntityKind::Conversation,
                &field_map(serde_json::json!({"unread_count": 0})),
                events,
            );
        });

        let errors = self.errors.clone();
        let receipt = Request::post(
            format!("/conversations/{conversation_id}/read"),
            serde_json::json!({"reader_id": self.current_user_id}),
        );
        with_default(
            async {
                self.transport.send(receipt).await.map(|_| ()).map_err(|failure| {
                    let record = errors.classify_and_record(&failure);
                    warn!(
                        conversation_id = %conversation_id,
                        classification = record.classification.label(),
                        "read receipt failed"
                    );
                    ClientError::from_record(&record)
                })
            },
            (),
        )
        .await;
    }

    /// Close a conversation: stop polling it and drop its typing set.
    pub async fn close_conversation(&self, conversation_id: &str) {
        if self.polled_conversation().as_deref() == Some(conversation_id) {
            self.stop_polling().await;
        }
        self.typing.lock().remove(conversation_id);
    }

    /// Ephemeral typing indicator; last writer wins, no rollback.
    pub fn set_typing(&self, conversation_id: &str, user_id: &str, typing: bool) {
        let mut sets = self.typing.lock();
        let set = sets.entry(conversation_id.to_owned()).or_default();
        if typing {
            set.insert(user_id.to_owned());
        } else {
            set.remove(user_id);
            if set.is_empty() {
                sets.remove(conversation_id);
            }
        }
    }

    /// User ids currently typing in a conversation, sorted.
    pub fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .typing
            .lock()
            .get(conversation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop<T: Transport>(
    store: SharedStore,
    transport: T,
    errors: Arc<ErrorLog>,
    conversation_id: String,
    interval: Duration,
    page_size: u16,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if cancel.is_cancelled() {
            break;
        }
        if paused.load(Ordering::SeqCst) {
            continue;
        }
        poll_once(
            &store,
            &transport,
            &errors,
            &conversation_id,
            page_size,
            &cancel,
        )
        .await;
    }
}

/// One background tick: fetch the latest message page and, when the
/// message count changed, replace the thread silently (no loading
/// indicator, never marks-as-read).
async fn poll_once<T: Transport>(
    store: &SharedStore,
    transport: &T,
    errors: &ErrorLog,
    conversation_id: &str,
    page_size: u16,
    cancel: &CancellationToken,
) {
    let request = Request::get(format!(
        "/conversations/{conversation_id}/messages?limit={page_size}"
    ));
    let page = with_default(
        async {
            let response = transport.send(request).await.map_err(|failure| {
                let record = errors.classify_and_record(&failure);
                warn!(
                    conversation_id = %conversation_id,
                    classification = record.classification.label(),
                    "background poll failed"
                );
                ClientError::from_record(&record)
            })?;
            page_from_body(&response.body, EntityKind::Message)
                .map(Some)
                .map_err(|err| {
                    warn!(conversation_id = %conversation_id, %err, "background poll payload rejected");
                    err
                })
        },
        None,
    )
    .await;

    let Some(page) = page else {
        return;
    };
    // A tick that raced a teardown must not touch the store.
    if cancel.is_cancelled() {
        return;
    }

    let thread = ViewName::Thread(conversation_id.to_owned());
    store.mutate(|inner, events| {
        let cached_count = inner
            .view(&thread)
            .map(|view| view.ordered_ids.len())
            .unwrap_or(0);
        if cached_count == page.ids.len() {
            return;
        }

        trace!(
            conversation_id = %conversation_id,
            cached_count,
            fetched_count = page.ids.len(),
            "background refresh replacing thread"
        );
        for entity in &page.entities {
            inner.upsert(&entity.id, EntityKind::Message, &entity.fields, events);
        }
        let preview = page
            .entities
            .last()
            .and_then(|entity| entity.field("body").cloned());
        inner.replace_view(&thread, page.ids.clone(), page.has_more, events);
        inner.upsert(
            conversation_id,
            EntityKind::Conversation,
            &field_map(serde_json::json!({
                "message_count": page.ids.len(),
                "last_message_preview": preview,
            })),
            events,
        );
    });
}

#[cfg(test)]
mod tests {
    use client_transport::{RawFailure, ScriptedTransport};
    use serde_json::json;

    use super::*;
    use crate::store::LoadState;

    fn message_page(ids: &[&str], read: bool) -> serde_json::Value {
        let items: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "conversation_id": "conv-1",
                    "sender_id": "user-2",
                    "body": format!("body of {id}"),
                    "is_read": read,
                })
            })
            .collect();
        json!({"items": items, "has_more": false})
    }

    fn hub(transport: ScriptedTransport) -> ConversationHub<ScriptedTransport> {
        ConversationHub::new(
            SharedStore::new(),
            transport,
            Arc::new(ErrorLog::new()),
            "user-1",
            Duration::from_secs(5),
            20,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn polling_phase_follows_start_visibility_and_stop() {
        let hub = hub(ScriptedTransport::new());
        assert_eq!(hub.phase(), PollPhase::Idle);

        hub.start_polling("conv-1").await;
        assert_eq!(hub.phase(), PollPhase::Polling);

        hub.visibility_changed(true);
        assert_eq!(hub.phase(), PollPhase::Paused);

        hub.visibility_changed(false);
        assert_eq!(hub.phase(), PollPhase::Polling);

        hub.stop_polling().await;
        assert_eq!(hub.phase(), PollPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_replaces_thread_silently_when_count_changes() {
        let transport = ScriptedTransport::new();
        transport.push_ok(message_page(&["msg-1", "msg-2"], false));
        let hub = hub(transport);
        let store = hub.store.clone();

        hub.start_polling("conv-1").await;
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        hub.stop_polling().await;

        let thread = store
            .view_snapshot(&ViewName::Thread("conv-1".to_owned()))
            .expect("thread view should exist");
        assert_eq!(thread.ordered_ids, vec!["msg-1", "msg-2"]);
        assert_eq!(thread.load_state, LoadState::Idle);

        let conversation = store.conversation("conv-1").expect("conversation preview");
        assert_eq!(conversation.message_count, 2);
        assert_eq!(
            conversation.last_message_preview.as_deref(),
            Some("body of msg-2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_count_leaves_view_untouched() {
        let transport = ScriptedTransport::new();
        transport.push_ok(message_page(&["msg-1"], false));
        let hub = hub(transport);
        let store = hub.store.clone();
        store.replace_view(
            &ViewName::Thread("conv-1".to_owned()),
            vec!["msg-old".to_owned()],
            false,
        );

        hub.start_polling("conv-1").await;
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        hub.stop_polling().await;

        let thread = store
            .view_snapshot(&ViewName::Thread("conv-1".to_owned()))
            .expect("thread");
        assert_eq!(thread.ordered_ids, vec!["msg-old"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_is_logged_only() {
        let transport = ScriptedTransport::new();
        transport.push_failure(RawFailure::http(500, "poll down"));
        let hub = hub(transport);
        let store = hub.store.clone();
        store.replace_view(
            &ViewName::Thread("conv-1".to_owned()),
            vec!["msg-1".to_owned()],
            false,
        );

        hub.start_polling("conv-1").await;
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        hub.stop_polling().await;

        let thread = store
            .view_snapshot(&ViewName::Thread("conv-1".to_owned()))
            .expect("thread");
        assert_eq!(thread.ordered_ids, vec!["msg-1"]);
        assert_eq!(thread.load_state, LoadState::Idle);
        assert_eq!(thread.error_message, None);
        assert_eq!(hub.errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_loop_issues_no_requests() {
        let transport = ScriptedTransport::new();
        transport.push_ok(message_page(&["msg-1"], false));
        let hub = hub(transport.clone());

        hub.start_polling("conv-1").await;
        hub.visibility_changed(true);
        tokio::time::sleep(Duration::from_millis(15_100)).await;
        hub.stop_polling().await;

        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_never_marks_messages_read() {
        let transport = ScriptedTransport::new();
        transport.push_ok(message_page(&["msg-1"], false));
        let hub = hub(transport);
        let store = hub.store.clone();
        store.upsert(
            "conv-1",
            EntityKind::Conversation,
            &field_map(json!({"id": "conv-1", "participant_ids": ["user-1", "user-2"], "unread_count": 3})),
        );

        hub.start_polling("conv-1").await;
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        hub.stop_polling().await;

        let message = store.message("msg-1").expect("message");
        assert!(!message.is_read);
        assert_eq!(store.conversation("conv-1").expect("conv").unread_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn open_marks_read_zeroes_badge_and_sends_receipt() {
        let transport = ScriptedTransport::new();
        transport.push_ok(json!({}));
        let hub = hub(transport.clone());
        let store = hub.store.clone();

        store.upsert(
            "conv-1",
            EntityKind::Conversation,
            &field_map(json!({"id": "conv-1", "participant_ids": ["user-1", "user-2"], "unread_count": 2})),
        );
        store.upsert(
            "msg-1",
            EntityKind::Message,
            &field_map(json!({
                "id": "msg-1", "conversation_id": "conv-1", "sender_id": "user-2",
                "body": "hi", "is_read": false,
            })),
        );
        store.replace_view(
            &ViewName::Thread("conv-1".to_owned()),
            vec!["msg-1".to_owned()],
            false,
        );

        hub.open_conversation("conv-1").await;

        assert!(store.message("msg-1").expect("message").is_read);
        assert_eq!(store.conversation("conv-1").expect("conv").unread_count, 0);
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/conversations/conv-1/read");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_receipt_keeps_local_read_state() {
        let transport = ScriptedTransport::new();
        transport.push_failure(RawFailure::network("receipt lost"));
        let hub = hub(transport);
        let store = hub.store.clone();
        store.upsert(
            "conv-1",
            EntityKind::Conversation,
            &field_map(json!({"id": "conv-1", "participant_ids": ["user-1", "user-2"], "unread_count": 1})),
        );

        hub.open_conversation("conv-1").await;

        assert_eq!(store.conversation("conv-1").expect("conv").unread_count, 0);
        assert_eq!(hub.errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicators_are_ephemeral_and_cleared_on_close() {
        let hub = hub(ScriptedTransport::new());

        hub.set_typing("conv-1", "user-2", true);
        hub.set_typing("conv-1", "user-3", true);
        hub.set_typing("conv-1", "user-3", true);
        assert_eq!(hub.typing_users("conv-1"), vec!["user-2", "user-3"]);

        hub.set_typing("conv-1", "user-2", false);
        assert_eq!(hub.typing_users("conv-1"), vec!["user-3"]);

        hub.close_conversation("conv-1").await;
        assert!(hub.typing_users("conv-1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_loop_issues_no_further_requests() {
        let transport = ScriptedTransport::new();
        transport.push_ok(message_page(&["msg-1"], false));
        transport.push_ok(message_page(&["msg-1", "msg-2"], false));
        let hub = hub(transport.clone());

        hub.start_polling("conv-1").await;
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        hub.stop_polling().await;
        tokio::time::sleep(Duration::from_millis(20_000)).await;

        assert_eq!(transport.requests().len(), 1);
        assert_eq!(transport.remaining(), 1);
    }
}
