//! Chat history normalizer - turns the raw "all user history" payload into
//! the view model the chat sidebar renders.
//!
//! Input collections (all optional):
//! - `thread`: chat threads, each listing the queries it ran
//! - `query`: per-query message arrays (sometimes nested one level too deep)
//! - `aitables`: folders, each listing the queries filed under it
//! - `bookmarks`: bookmark groups, each listing bookmarked queries
//!
//! Produces a [`ChatHistory`]: sessions with messages grouped per query,
//! aitable folders, and bookmark groups.
//!
//! Index passes are last-write-wins (a query filed under two tables maps to
//! the later one). Thread assembly is first-match-wins (a thread's folder is
//! the folder of its first query that has one). Both are intentional.

use crate::history::{
    ChatFolder, ChatHistory, ChatMessage, ChatSession, FolderQuery, MessageGroup, Sender,
    INTERNAL_MARKER,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, warn};

const UNNAMED_TABLE: &str = "Unnamed Table";
const UNNAMED_BOOKMARK: &str = "Unnamed Bookmark";
const UNTITLED_CHAT: &str = "Untitled Chat";

/// Threads are spaced one day apart, newest first
const THREAD_SPACING_DAYS: i64 = 1;
/// Messages within a query are spaced ten seconds apart
const MESSAGE_SPACING_SECS: i64 = 10;

/// Why a payload could not be normalized
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed history payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("`{field}` for query {query_id} is not an array")]
    NotAnArray { field: &'static str, query_id: String },
}

/// Top-level payload from the history endpoint
#[derive(Debug, Default, Deserialize)]
struct HistoryPayload {
    #[serde(default, deserialize_with = "seq_or_null")]
    aitables: Vec<AiTableRecord>,
    #[serde(default, deserialize_with = "seq_or_null")]
    bookmarks: Vec<BookmarkRecord>,
    #[serde(default, deserialize_with = "seq_or_null")]
    query: Vec<QueryRecord>,
    #[serde(default, deserialize_with = "seq_or_null")]
    thread: Vec<ThreadRecord>,
}

#[derive(Debug, Deserialize)]
struct ThreadRecord {
    #[serde(default)]
    thread_id: Value,
    #[serde(default)]
    thread_name: Value,
    #[serde(default, deserialize_with = "seq_or_null")]
    querydetails: Vec<QueryRef>,
}

/// Query reference inside `querydetails` or `aitables[*].queries`.
/// Elements that are not objects carry no `query_id` and are skipped later.
#[derive(Debug, Deserialize)]
#[serde(from = "Value")]
struct QueryRef {
    /// String id, or an array holding the id (possibly among nulls)
    query_id: Value,
}

impl From<Value> for QueryRef {
    fn from(mut entry: Value) -> Self {
        Self {
            query_id: take_field(&mut entry, "query_id"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryRecord {
    #[serde(default)]
    query_id: Value,
    /// Flat message array, or an array whose first element is the message array
    #[serde(default)]
    message: Value,
}

#[derive(Debug, Deserialize)]
struct AiTableRecord {
    #[serde(default)]
    table_id: Value,
    #[serde(default)]
    table_name: Value,
    #[serde(default, deserialize_with = "seq_or_null")]
    queries: Vec<QueryRef>,
}

#[derive(Debug, Deserialize)]
struct BookmarkRecord {
    #[serde(default)]
    bookmark_id: Value,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    bookmark_name: Value,
    #[serde(default)]
    name: Value,
    #[serde(default, deserialize_with = "seq_or_null")]
    queries: Vec<BookmarkQueryRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(from = "Value")]
struct BookmarkQueryRecord {
    query_id: Value,
    messages: Value,
}

impl From<Value> for BookmarkQueryRecord {
    fn from(mut entry: Value) -> Self {
        Self {
            query_id: take_field(&mut entry, "query_id"),
            messages: take_field(&mut entry, "messages"),
        }
    }
}

/// Move a field out of a JSON object; `Null` for anything else
fn take_field(entry: &mut Value, key: &str) -> Value {
    entry
        .as_object_mut()
        .and_then(|obj| obj.remove(key))
        .unwrap_or(Value::Null)
}

/// Absent and `null` collections both mean "empty"
fn seq_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Normalize a history payload. Never fails: on a malformed payload the
/// error is logged and an empty history is returned.
pub fn normalize(payload: &Value, now: DateTime<Utc>) -> ChatHistory {
    match try_normalize(payload, now) {
        Ok(history) => {
            debug!(
                "Normalized history: {} sessions, {} folders, {} bookmarks",
                history.chat_sessions.len(),
                history.folders.len(),
                history.bookmarks.len()
            );
            history
        }
        Err(e) => {
            error!(error = %e, "Failed to normalize chat history, returning empty result");
            ChatHistory::default()
        }
    }
}

/// [`normalize`] against the current wall clock
pub fn normalize_now(payload: &Value) -> ChatHistory {
    normalize(payload, Utc::now())
}

/// Normalize a history payload, surfacing the failure cause
pub fn try_normalize(payload: &Value, now: DateTime<Utc>) -> Result<ChatHistory, NormalizeError> {
    let payload = HistoryPayload::deserialize(payload)?;

    let folders = extract_folders(&payload.aitables);
    let folder_index = build_folder_index(&payload.aitables);
    let message_index = build_message_index(&payload.query)?;
    let bookmark_index = build_bookmark_index(&payload.bookmarks);
    let bookmarks = project_bookmarks(&payload.bookmarks, &message_index, now)?;

    let indexes = Indexes {
        folders: &folder_index,
        messages: &message_index,
        bookmarks: &bookmark_index,
    };

    let chat_sessions = payload
        .thread
        .iter()
        .filter(|t| !is_internal(t.thread_name.as_str()))
        .filter_map(|t| match id_string(&t.thread_id) {
            Some(id) => Some((id, t)),
            None => {
                warn!("Skipping thread without an id: {:?}", t.thread_name);
                None
            }
        })
        .enumerate()
        .map(|(index, (id, thread))| assemble_session(index, id, thread, &indexes, now))
        .collect();

    Ok(ChatHistory {
        chat_sessions,
        folders,
        bookmarks,
    })
}

/// Lookups built from the non-thread collections
struct Indexes<'a> {
    /// query_id -> table_id
    folders: &'a HashMap<String, String>,
    /// query_id -> flattened raw messages
    messages: &'a HashMap<String, Vec<Value>>,
    /// query_id -> bookmark_id
    bookmarks: &'a HashMap<String, String>,
}

fn is_internal(text: Option<&str>) -> bool {
    text.is_some_and(|t| t.starts_with(INTERNAL_MARKER))
}

/// Render an id field as a string; empty strings count as absent
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Resolve a query id that may be a plain id or an array holding it.
/// Arrays resolve to their first non-null element.
pub fn resolve_query_id(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => items.iter().find(|v| !v.is_null()).and_then(id_string),
        other => id_string(other),
    }
}

fn text_or<'a>(value: &'a Value, fallback: &'a Value, default: &'a str) -> &'a str {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .or_else(|| fallback.as_str().filter(|s| !s.is_empty()))
        .unwrap_or(default)
}

/// Unique folders from aitables, first occurrence of each table_id wins
fn extract_folders(tables: &[AiTableRecord]) -> Vec<ChatFolder> {
    let mut seen = std::collections::HashSet::new();
    tables
        .iter()
        .filter_map(|table| {
            let id = id_string(&table.table_id)?;
            if !seen.insert(id.clone()) {
                return None;
            }
            Some(ChatFolder {
                name: text_or(&table.table_name, &Value::Null, UNNAMED_TABLE).to_string(),
                id,
                queries: None,
            })
        })
        .collect()
}

/// query_id -> table_id; a query listed under several tables maps to the last one
fn build_folder_index(tables: &[AiTableRecord]) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for table in tables {
        let Some(table_id) = id_string(&table.table_id) else {
            continue;
        };
        for query in &table.queries {
            match resolve_query_id(&query.query_id) {
                Some(query_id) => {
                    index.insert(query_id, table_id.clone());
                }
                None => warn!("Skipping unresolvable query in table {}", table_id),
            }
        }
    }
    index
}

/// Flatten the `message` field. Returns `None` when there is nothing to show.
fn flatten_messages(
    message: &Value,
    field: &'static str,
    query_id: &str,
) -> Result<Option<Vec<Value>>, NormalizeError> {
    let items = match message {
        Value::Null => return Ok(None),
        Value::Array(items) => items,
        _ => {
            return Err(NormalizeError::NotAnArray {
                field,
                query_id: query_id.to_string(),
            })
        }
    };

    let flat = match items.first() {
        Some(Value::Array(inner)) => inner.clone(),
        _ => items.clone(),
    };

    Ok((!flat.is_empty()).then_some(flat))
}

/// query_id -> flattened messages. Entries without an id or messages are skipped.
fn build_message_index(queries: &[QueryRecord]) -> Result<HashMap<String, Vec<Value>>, NormalizeError> {
    let mut index = HashMap::new();
    for query in queries {
        let Some(query_id) = id_string(&query.query_id) else {
            debug!("Skipping query entry without query_id");
            continue;
        };
        match flatten_messages(&query.message, "message", &query_id)? {
            Some(messages) => {
                index.insert(query_id, messages);
            }
            None => debug!("Skipping query {} with no messages", query_id),
        }
    }
    Ok(index)
}

fn bookmark_id(bookmark: &BookmarkRecord) -> Option<String> {
    id_string(&bookmark.bookmark_id).or_else(|| id_string(&bookmark.id))
}

/// query_id -> bookmark_id; last bookmark wins
fn build_bookmark_index(bookmarks: &[BookmarkRecord]) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for bookmark in bookmarks {
        let Some(id) = bookmark_id(bookmark) else {
            continue;
        };
        for query in &bookmark.queries {
            if let Some(query_id) = resolve_query_id(&query.query_id) {
                index.insert(query_id, id.clone());
            }
        }
    }
    index
}

/// Bookmark groups as folders that carry their queries
fn project_bookmarks(
    bookmarks: &[BookmarkRecord],
    message_index: &HashMap<String, Vec<Value>>,
    now: DateTime<Utc>,
) -> Result<Vec<ChatFolder>, NormalizeError> {
    let mut folders = Vec::with_capacity(bookmarks.len());
    for bookmark in bookmarks {
        let Some(id) = bookmark_id(bookmark) else {
            warn!("Skipping bookmark without an id: {:?}", bookmark.bookmark_name);
            continue;
        };
        let name = text_or(&bookmark.bookmark_name, &bookmark.name, UNNAMED_BOOKMARK).to_string();

        let mut queries = Vec::with_capacity(bookmark.queries.len());
        for query in &bookmark.queries {
            let Some(query_id) = resolve_query_id(&query.query_id) else {
                warn!("Dropping unresolvable query in bookmark {}: {}", id, query.query_id);
                continue;
            };
            let raw = match flatten_messages(&query.messages, "messages", &query_id)? {
                Some(own) => own,
                None => message_index.get(&query_id).cloned().unwrap_or_default(),
            };
            let messages = chat_messages(&query_id, &raw, true, now - Duration::days(THREAD_SPACING_DAYS));
            queries.push(FolderQuery { query_id, messages });
        }

        folders.push(ChatFolder {
            id,
            name,
            queries: Some(queries),
        });
    }
    Ok(folders)
}

/// Message text: non-empty `content`, then `results.data`, then `results`
pub fn message_text(message: &Value) -> String {
    if let Some(content) = message.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            return content.to_string();
        }
    }
    let results = message.get("results");
    results
        .and_then(|r| r.get("data"))
        .and_then(non_empty_text)
        .or_else(|| results.and_then(non_empty_text))
        .unwrap_or_default()
}

fn non_empty_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Map raw messages to chat messages, dropping internal ones
fn chat_messages(
    query_id: &str,
    raw: &[Value],
    bookmarked: bool,
    base: DateTime<Utc>,
) -> Vec<ChatMessage> {
    raw.iter()
        .filter(|m| m.is_object())
        .filter(|m| !is_internal(m.get("content").and_then(Value::as_str)))
        .enumerate()
        .map(|(i, m)| ChatMessage {
            id: format!("msg-{}-{}", query_id, i),
            sender: Sender::from_role(m.get("role").and_then(Value::as_str)),
            text: message_text(m),
            timestamp: format_timestamp(base + Duration::seconds(MESSAGE_SPACING_SECS * i as i64)),
            query_id: query_id.to_string(),
            bookmarked,
        })
        .collect()
}

fn assemble_session(
    index: usize,
    id: String,
    thread: &ThreadRecord,
    indexes: &Indexes<'_>,
    now: DateTime<Utc>,
) -> ChatSession {
    let base = now - Duration::days(THREAD_SPACING_DAYS * (index as i64 + 1));

    let mut groups = Vec::new();
    let mut query_ids = Vec::new();
    let mut folder_id: Option<String> = None;
    let mut bookmark_id: Option<String> = None;

    for detail in &thread.querydetails {
        let Some(query_id) = resolve_query_id(&detail.query_id) else {
            warn!("Thread {} references a query without an id", id);
            continue;
        };
        let Some(raw) = indexes.messages.get(&query_id) else {
            warn!("Thread {} references query {} with no messages", id, query_id);
            continue;
        };

        if folder_id.is_none() {
            folder_id = indexes.folders.get(&query_id).cloned();
        }
        if bookmark_id.is_none() {
            bookmark_id = indexes.bookmarks.get(&query_id).cloned();
        }

        let bookmarked = indexes.bookmarks.contains_key(&query_id);
        groups.push(MessageGroup {
            messages: chat_messages(&query_id, raw, bookmarked, base),
            query_id: query_id.clone(),
        });
        query_ids.push(query_id);
    }

    let latest = groups.iter().map(|g| g.messages.len()).max().unwrap_or(0);
    let updated = base + Duration::seconds(MESSAGE_SPACING_SECS * latest.saturating_sub(1) as i64);

    ChatSession {
        title: thread
            .thread_name
            .as_str()
            .unwrap_or(UNTITLED_CHAT)
            .to_string(),
        id,
        messages: groups,
        query_ids,
        folder_id,
        bookmarked: bookmark_id.is_some(),
        bookmark_id,
        created_at: format_timestamp(base),
        updated_at: format_timestamp(updated),
    }
}
