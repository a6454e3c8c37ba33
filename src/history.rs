//! Chat history view model and the store that holds it.
//!
//! The normalizer produces a [`ChatHistory`]; the store keeps the latest one
//! and tells subscribers (SSE clients, sidebar refreshers) when it changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Prefix the backend puts on internal SQL-generation threads and messages.
/// Anything carrying it is hidden from users.
pub const INTERNAL_MARKER: &str = "SQL Generated by LLM:";

/// Who sent a message, as the chat UI renders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    /// `"user"` maps to [`Sender::User`]; every other role is the bot.
    pub fn from_role(role: Option<&str>) -> Self {
        match role {
            Some("user") => Sender::User,
            _ => Sender::Bot,
        }
    }
}

/// A single rendered chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// `msg-<queryId>-<index>`
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: String,
    pub query_id: String,
    pub bookmarked: bool,
}

/// Messages produced by one query, kept together in thread order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageGroup {
    pub query_id: String,
    pub messages: Vec<ChatMessage>,
}

/// One chat thread as the sidebar lists it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<MessageGroup>,
    pub query_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark_id: Option<String>,
    pub bookmarked: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A query attached to a bookmark folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderQuery {
    pub query_id: String,
    pub messages: Vec<ChatMessage>,
}

/// Folder shape shared by aitable folders and bookmark groups.
///
/// Aitable folders only carry `id`/`name`; bookmark groups also list their queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFolder {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<FolderQuery>>,
}

/// Everything the chat UI renders from one history fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    pub chat_sessions: Vec<ChatSession>,
    pub folders: Vec<ChatFolder>,
    pub bookmarks: Vec<ChatFolder>,
}

impl ChatHistory {
    pub fn is_empty(&self) -> bool {
        self.chat_sessions.is_empty() && self.folders.is_empty() && self.bookmarks.is_empty()
    }
}

/// Events broadcast when the store changes
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StoreEvent {
    /// A fresh history replaced the previous one
    #[serde(rename = "history_replaced")]
    Replaced {
        revision: u64,
        sessions: usize,
        folders: usize,
        bookmarks: usize,
    },
    /// A refresh attempt failed; the stored history is unchanged
    #[serde(rename = "refresh_failed")]
    RefreshFailed { revision: u64, reason: String },
}

/// A stored history together with its session lookup
#[derive(Default)]
struct Snapshot {
    history: Arc<ChatHistory>,
    /// Session ID -> position in `chat_sessions`; the first session with an id wins
    by_id: HashMap<String, usize>,
}

impl Snapshot {
    fn new(history: ChatHistory) -> Self {
        let mut by_id = HashMap::with_capacity(history.chat_sessions.len());
        for (i, session) in history.chat_sessions.iter().enumerate() {
            by_id.entry(session.id.clone()).or_insert(i);
        }
        Self {
            history: Arc::new(history),
            by_id,
        }
    }
}

/// Holds the current chat history and notifies subscribers on change.
///
/// Every `replace` swaps the whole view model. There is no incremental
/// patching and no merge between refreshes: the last write wins.
pub struct HistoryStore {
    current: RwLock<Snapshot>,
    revision: AtomicU64,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl HistoryStore {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            current: RwLock::new(Snapshot::default()),
            revision: AtomicU64::new(0),
            event_tx,
        })
    }

    /// Replace the stored history wholesale. Returns the new revision.
    pub async fn replace(&self, history: ChatHistory) -> u64 {
        let counts = (
            history.chat_sessions.len(),
            history.folders.len(),
            history.bookmarks.len(),
        );
        let next = Snapshot::new(history);

        let mut current = self.current.write().await;
        *current = next;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        drop(current);

        let _ = self.event_tx.send(StoreEvent::Replaced {
            revision,
            sessions: counts.0,
            folders: counts.1,
            bookmarks: counts.2,
        });
        revision
    }

    /// Report a failed refresh without touching the stored data
    pub fn record_failure(&self, reason: impl Into<String>) {
        let _ = self.event_tx.send(StoreEvent::RefreshFailed {
            revision: self.revision(),
            reason: reason.into(),
        });
    }

    /// The current history
    pub async fn snapshot(&self) -> Arc<ChatHistory> {
        self.current.read().await.history.clone()
    }

    /// Look up a session in the current history
    pub async fn get_session(&self, session_id: &str) -> Option<ChatSession> {
        let current = self.current.read().await;
        current
            .by_id
            .get(session_id)
            .and_then(|&i| current.history.chat_sessions.get(i))
            .cloned()
    }

    /// Sessions whose derived folder is `folder_id`, in sidebar order
    pub async fn sessions_in_folder(&self, folder_id: &str) -> Vec<ChatSession> {
        self.snapshot()
            .await
            .chat_sessions
            .iter()
            .filter(|s| s.folder_id.as_deref() == Some(folder_id))
            .cloned()
            .collect()
    }

    pub async fn bookmarked_sessions(&self) -> Vec<ChatSession> {
        self.snapshot()
            .await
            .chat_sessions
            .iter()
            .filter(|s| s.bookmarked)
            .cloned()
            .collect()
    }

    /// Number of successful replacements so far
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, folder: Option<&str>, bookmarked: bool) -> ChatSession {
        ChatSession {
            id: id.to_string(),
            title: format!("Chat {}", id),
            messages: Vec::new(),
            query_ids: Vec::new(),
            folder_id: folder.map(str::to_string),
            bookmark_id: bookmarked.then(|| "b1".to_string()),
            bookmarked,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            updated_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_sender_from_role() {
        assert_eq!(Sender::from_role(Some("user")), Sender::User);
        assert_eq!(Sender::from_role(Some("assistant")), Sender::Bot);
        assert_eq!(Sender::from_role(None), Sender::Bot);
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let json = serde_json::to_value(session("t1", None, false)).unwrap();
        assert_eq!(json["queryIds"], serde_json::json!([]));
        assert_eq!(json["createdAt"], "2026-01-01T00:00:00.000Z");
        assert!(json.get("folderId").is_none());
        assert!(json.get("bookmarkId").is_none());
        assert_eq!(json["bookmarked"], false);
    }

    #[test]
    fn test_aitable_folder_omits_queries() {
        let folder = ChatFolder { id: "f1".to_string(), name: "Sales".to_string(), queries: None };
        let json = serde_json::to_value(folder).unwrap();
        assert_eq!(json, serde_json::json!({"id": "f1", "name": "Sales"}));
    }

    #[tokio::test]
    async fn test_replace_swaps_whole_history() {
        let store = HistoryStore::new();
        store
            .replace(ChatHistory {
                chat_sessions: vec![session("t1", None, false), session("t2", None, false)],
                ..Default::default()
            })
            .await;
        assert!(store.get_session("t1").await.is_some());

        let revision = store
            .replace(ChatHistory {
                chat_sessions: vec![session("t3", None, false)],
                ..Default::default()
            })
            .await;

        assert_eq!(revision, 2);
        assert!(store.get_session("t1").await.is_none());
        assert!(store.get_session("t2").await.is_none());
        assert!(store.get_session("t3").await.is_some());
        assert_eq!(store.snapshot().await.chat_sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_replacements() {
        let store = HistoryStore::new();
        let mut rx = store.subscribe();

        store
            .replace(ChatHistory {
                chat_sessions: vec![session("t1", None, false)],
                folders: vec![ChatFolder { id: "f1".to_string(), name: "A".to_string(), queries: None }],
                bookmarks: Vec::new(),
            })
            .await;

        match rx.recv().await.unwrap() {
            StoreEvent::Replaced { revision, sessions, folders, bookmarks } => {
                assert_eq!((revision, sessions, folders, bookmarks), (1, 1, 1, 0));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_history() {
        let store = HistoryStore::new();
        store
            .replace(ChatHistory {
                chat_sessions: vec![session("t1", None, false)],
                ..Default::default()
            })
            .await;
        let mut rx = store.subscribe();

        store.record_failure("upstream returned 500");

        match rx.recv().await.unwrap() {
            StoreEvent::RefreshFailed { revision, reason } => {
                assert_eq!(revision, 1);
                assert!(reason.contains("500"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(store.snapshot().await.chat_sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_folder_and_bookmark_filters() {
        let store = HistoryStore::new();
        store
            .replace(ChatHistory {
                chat_sessions: vec![
                    session("t1", Some("f1"), false),
                    session("t2", Some("f2"), true),
                    session("t3", Some("f1"), true),
                ],
                ..Default::default()
            })
            .await;

        let in_f1: Vec<String> = store.sessions_in_folder("f1").await.into_iter().map(|s| s.id).collect();
        assert_eq!(in_f1, vec!["t1", "t3"]);

        let marked: Vec<String> = store.bookmarked_sessions().await.into_iter().map(|s| s.id).collect();
        assert_eq!(marked, vec!["t2", "t3"]);
    }

    #[tokio::test]
    async fn test_duplicate_session_ids_resolve_to_first() {
        let store = HistoryStore::new();
        let mut first = session("t1", Some("f1"), false);
        first.title = "First".to_string();
        let mut second = session("t1", Some("f2"), false);
        second.title = "Second".to_string();
        store
            .replace(ChatHistory {
                chat_sessions: vec![first, second],
                ..Default::default()
            })
            .await;

        assert_eq!(store.snapshot().await.chat_sessions.len(), 2);
        assert_eq!(store.get_session("t1").await.unwrap().title, "First");
    }
}
