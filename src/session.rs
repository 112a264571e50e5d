//! Client-side session list: creation, switching, renaming, deletion and
//! message history, mirrored to a [`KvStore`] after every change.

use crate::chat::{ChatSession, Message};
use crate::store::KvStore;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

pub const SESSIONS_KEY: &str = "chat_sessions";
pub const ACTIVE_KEY: &str = "active_chat_id";
pub const DEFAULT_NAME_PREFIX: &str = "Chat";

const DISPLAY_NAME_LIMIT: usize = 30;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("A request is already pending for session {0}")]
    Busy(String),
    #[error("Message text is empty")]
    EmptyMessage,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

pub struct SessionStore<S: KvStore> {
    port: S,
    name_prefix: String,
    default_name: Regex,
    sessions: Vec<ChatSession>,
    active_id: String,
    in_flight: HashSet<String>,
}

impl<S: KvStore> SessionStore<S> {
    /// Rehydrates from the port. Missing or corrupt state falls back to a
    /// single fresh session, which is persisted immediately.
    pub async fn load(port: S, name_prefix: impl Into<String>) -> Result<Self> {
        let name_prefix = name_prefix.into();
        let mut store = Self {
            port,
            default_name: default_name_pattern(&name_prefix)?,
            name_prefix,
            sessions: Vec::new(),
            active_id: String::new(),
            in_flight: HashSet::new(),
        };

        let stored = match store.port.get(SESSIONS_KEY).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to read stored sessions, starting fresh: {:#}", e);
                None
            }
        };

        if let Some(raw) = stored {
            match serde_json::from_str::<Vec<ChatSession>>(&raw) {
                Ok(sessions) => store.sessions = sessions,
                Err(e) => warn!("Stored sessions are corrupt, starting fresh: {}", e),
            }
        }

        if store.sessions.is_empty() {
            store.new_chat().await?;
            return Ok(store);
        }

        let saved_active = store.port.get(ACTIVE_KEY).await.unwrap_or_else(|e| {
            warn!("Failed to read active session id: {:#}", e);
            None
        });

        store.active_id = match saved_active {
            Some(id) if store.get(&id).is_some() => id,
            _ => most_recent_id(&store.sessions).unwrap_or_default(),
        };

        debug!(
            "Loaded {} sessions, active {}",
            store.sessions.len(),
            store.active_id
        );

        store.write(&store.sessions, &store.active_id).await?;
        Ok(store)
    }

    /// Builds a new session named `"{prefix} {n}"`, where `n` is the smallest
    /// positive number not taken by an existing default-named session.
    /// Does not insert it.
    pub fn create_session(&self, name_prefix: &str) -> ChatSession {
        ChatSession::new(format!(
            "{} {}",
            name_prefix,
            self.next_default_number(&self.sessions)
        ))
    }

    pub async fn insert_session(&mut self, session: ChatSession, activate: bool) -> Result<()> {
        let mut active_id = self.active_id.clone();
        if activate || active_id.is_empty() {
            active_id = session.id.clone();
        }
        let mut sessions = self.sessions.clone();
        sessions.insert(0, session);
        self.commit(sessions, active_id).await
    }

    /// Creates a default-named session, inserts it and makes it active.
    pub async fn new_chat(&mut self) -> Result<String> {
        let session = self.create_session(&self.name_prefix.clone());
        let id = session.id.clone();
        self.insert_session(session, true).await?;
        Ok(id)
    }

    pub async fn switch_active(&mut self, session_id: &str) -> Result<()> {
        if self.get(session_id).is_none() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        self.write(&self.sessions, session_id).await?;
        self.active_id = session_id.to_string();
        Ok(())
    }

    /// Removes a session. When the active one goes, the most recently used
    /// survivor takes over, or a fresh session when nothing is left.
    pub async fn delete_session(&mut self, session_id: &str) -> Result<()> {
        let index = self
            .sessions
            .iter()
            .position(|s| s.id == session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let mut sessions = self.sessions.clone();
        sessions.remove(index);

        let mut active_id = self.active_id.clone();
        if active_id == session_id {
            active_id = match most_recent_id(&sessions) {
                Some(id) => id,
                None => {
                    let fresh = ChatSession::new(format!(
                        "{} {}",
                        self.name_prefix,
                        self.next_default_number(&sessions)
                    ));
                    let id = fresh.id.clone();
                    sessions.insert(0, fresh);
                    id
                }
            };
        }

        self.commit(sessions, active_id).await?;
        self.in_flight.remove(session_id);
        Ok(())
    }

    /// Returns `false` and leaves the name alone when `new_name` is blank.
    pub async fn rename_session(&mut self, session_id: &str, new_name: &str) -> Result<bool> {
        if self.get(session_id).is_none() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let trimmed = new_name.trim();
        if trimmed.is_empty() {
            return Ok(false);
        }
        self.update_session(session_id, false, |session| {
            session.name = trimmed.to_string();
        })
        .await?;
        Ok(true)
    }

    /// Replaces the whole message list. Callers must pass the full history;
    /// two callers doing this concurrently will lose each other's writes.
    pub async fn replace_messages(
        &mut self,
        session_id: &str,
        messages: Vec<Message>,
    ) -> Result<()> {
        self.update_session(session_id, true, |session| session.messages = messages)
            .await
    }

    pub async fn append_message(&mut self, session_id: &str, message: Message) -> Result<()> {
        self.update_session(session_id, true, |session| session.messages.push(message))
            .await
    }

    /// Claims the single request slot of a session.
    pub fn begin_request(&mut self, session_id: &str) -> Result<()> {
        if self.get(session_id).is_none() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        if !self.in_flight.insert(session_id.to_string()) {
            return Err(SessionError::Busy(session_id.to_string()));
        }
        Ok(())
    }

    pub fn finish_request(&mut self, session_id: &str) {
        self.in_flight.remove(session_id);
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.in_flight.contains(session_id)
    }

    pub fn display_name(&self, session: &ChatSession) -> String {
        if !self.default_name.is_match(&session.name) {
            return session.name.clone();
        }

        match session.first_user_message() {
            Some(message) => truncate(&message.text, DISPLAY_NAME_LIMIT),
            None => session.name.clone(),
        }
    }

    pub fn active(&self) -> Option<&ChatSession> {
        self.get(&self.active_id)
    }

    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    pub fn get(&self, session_id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions_by_activity(&self) -> Vec<&ChatSession> {
        let mut sorted: Vec<&ChatSession> = self.sessions.iter().collect();
        sorted.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sorted
    }

    fn next_default_number(&self, sessions: &[ChatSession]) -> u64 {
        let taken: BTreeSet<u64> = sessions
            .iter()
            .filter_map(|s| {
                self.default_name
                    .captures(&s.name)
                    .and_then(|c| c[1].parse::<u64>().ok())
            })
            .filter(|n| *n > 0)
            .collect();

        let mut next = 1;
        for n in taken {
            if n != next {
                break;
            }
            next += 1;
        }
        next
    }

    async fn update_session(
        &mut self,
        session_id: &str,
        touch: bool,
        apply: impl FnOnce(&mut ChatSession),
    ) -> Result<()> {
        let mut sessions = self.sessions.clone();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        apply(session);
        if touch {
            session.touch();
        }
        let active_id = self.active_id.clone();
        self.commit(sessions, active_id).await
    }

    /// Adopts the new state only after the port accepted it, so a failed
    /// write leaves memory as it was. A failure between the two key writes
    /// can still leave the port with the new list and the old active id.
    async fn commit(&mut self, sessions: Vec<ChatSession>, active_id: String) -> Result<()> {
        self.write(&sessions, &active_id).await?;
        self.sessions = sessions;
        self.active_id = active_id;
        Ok(())
    }

    async fn write(&self, sessions: &[ChatSession], active_id: &str) -> Result<()> {
        let json = serde_json::to_string(sessions).map_err(anyhow::Error::from)?;
        self.port.set(SESSIONS_KEY, &json).await?;
        if !active_id.is_empty() {
            self.port.set(ACTIVE_KEY, active_id).await?;
        }
        Ok(())
    }
}

fn most_recent_id(sessions: &[ChatSession]) -> Option<String> {
    sessions
        .iter()
        .max_by_key(|s| s.last_activity)
        .map(|s| s.id.clone())
}

fn default_name_pattern(prefix: &str) -> anyhow::Result<Regex> {
    Ok(Regex::new(&format!(r"^{} (\d+)$", regex::escape(prefix)))?)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        let head: String = text.chars().take(limit).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Sender;
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Memory store whose writes can be switched to fail.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: Arc<AtomicBool>,
    }

    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.set(key, value).await
        }
    }

    async fn fresh() -> (SessionStore<MemoryStore>, MemoryStore) {
        let port = MemoryStore::new();
        let store = SessionStore::load(port.clone(), DEFAULT_NAME_PREFIX)
            .await
            .unwrap();
        (store, port)
    }

    fn names(store: &SessionStore<MemoryStore>) -> Vec<String> {
        let mut names: Vec<String> = store.sessions.iter().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn load_without_state_creates_one_active_session() {
        let (store, port) = fresh().await;
        assert_eq!(store.len(), 1);
        let active = store.active().unwrap();
        assert_eq!(active.name, "Chat 1");
        assert_eq!(
            port.get(ACTIVE_KEY).await.unwrap().as_deref(),
            Some(active.id.as_str())
        );
        assert!(port.get(SESSIONS_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn load_with_corrupt_state_falls_back() {
        let port = MemoryStore::new();
        port.set(SESSIONS_KEY, "{not json").await.unwrap();
        port.set(ACTIVE_KEY, "whatever").await.unwrap();

        let store = SessionStore::load(port.clone(), "Chat").await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.active().unwrap().name, "Chat 1");
    }

    #[tokio::test]
    async fn load_with_dangling_active_id_picks_most_recent() {
        let mut old = ChatSession::new("Chat 1");
        old.last_activity = Utc::now() - Duration::hours(2);
        let recent = ChatSession::new("Chat 2");
        let port = MemoryStore::new();
        port.set(
            SESSIONS_KEY,
            &serde_json::to_string(&vec![old, recent.clone()]).unwrap(),
        )
        .await
        .unwrap();
        port.set(ACTIVE_KEY, "gone").await.unwrap();

        let store = SessionStore::load(port, "Chat").await.unwrap();
        assert_eq!(store.active_id(), recent.id);
    }

    #[tokio::test]
    async fn default_names_fill_gaps_first() {
        let (mut store, _) = fresh().await;
        store.new_chat().await.unwrap();
        let third = store.new_chat().await.unwrap();
        assert_eq!(names(&store), vec!["Chat 1", "Chat 2", "Chat 3"]);

        let second = store
            .sessions
            .iter()
            .find(|s| s.name == "Chat 2")
            .unwrap()
            .id
            .clone();
        store.delete_session(&second).await.unwrap();
        assert_eq!(store.create_session("Chat").name, "Chat 2");

        store.delete_session(&third).await.unwrap();
        store.new_chat().await.unwrap();
        assert_eq!(names(&store), vec!["Chat 1", "Chat 2"]);
    }

    #[tokio::test]
    async fn custom_names_and_duplicates_do_not_confuse_numbering() {
        let (mut store, _) = fresh().await;
        let id = store.new_chat().await.unwrap();
        store.rename_session(&id, "Chat 1").await.unwrap();
        let other = store.new_chat().await.unwrap();
        store.rename_session(&other, "Chat 0").await.unwrap();
        assert_eq!(store.create_session("Chat").name, "Chat 2");
    }

    #[tokio::test]
    async fn create_session_has_no_side_effects() {
        let (store, _) = fresh().await;
        let created = store.create_session("Chat");
        assert_eq!(store.len(), 1);
        assert!(store.get(&created.id).is_none());
    }

    #[tokio::test]
    async fn switch_to_unknown_session_is_an_error() {
        let (mut store, _) = fresh().await;
        let before = store.active_id().to_string();
        let err = store.switch_active("nope").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert_eq!(store.active_id(), before);
    }

    #[tokio::test]
    async fn insert_without_activation_keeps_pointer() {
        let (mut store, _) = fresh().await;
        let before = store.active_id().to_string();
        let session = store.create_session("Chat");
        store.insert_session(session, false).await.unwrap();
        assert_eq!(store.active_id(), before);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn deleting_active_moves_to_most_recent() {
        let (mut store, _) = fresh().await;
        let first = store.active_id().to_string();
        let second = store.new_chat().await.unwrap();
        let third = store.new_chat().await.unwrap();

        store.append_message(&first, Message::user("bump")).await.unwrap();
        store.switch_active(&third).await.unwrap();
        store.delete_session(&third).await.unwrap();

        assert_eq!(store.active_id(), first);
        assert!(store.get(&second).is_some());
    }

    #[tokio::test]
    async fn deleting_inactive_keeps_pointer() {
        let (mut store, _) = fresh().await;
        let first = store.active_id().to_string();
        let second = store.new_chat().await.unwrap();
        store.delete_session(&first).await.unwrap();
        assert_eq!(store.active_id(), second);
    }

    #[tokio::test]
    async fn deleting_last_session_creates_a_new_active_one() {
        let (mut store, port) = fresh().await;
        let only = store.active_id().to_string();
        store.delete_session(&only).await.unwrap();

        assert_eq!(store.len(), 1);
        let active = store.active().unwrap();
        assert_ne!(active.id, only);
        assert_eq!(active.name, "Chat 1");
        assert_eq!(
            port.get(ACTIVE_KEY).await.unwrap().as_deref(),
            Some(active.id.as_str())
        );
    }

    #[tokio::test]
    async fn delete_never_leaves_a_dangling_pointer() {
        let (mut store, _) = fresh().await;
        for _ in 0..4 {
            store.new_chat().await.unwrap();
        }
        for _ in 0..8 {
            let victim = store.sessions_by_activity()[0].id.clone();
            store.delete_session(&victim).await.unwrap();
            assert!(!store.is_empty());
            assert!(store.active().is_some());
        }
    }

    #[tokio::test]
    async fn delete_unknown_session_is_an_error() {
        let (mut store, _) = fresh().await;
        assert!(matches!(
            store.delete_session("nope").await,
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn blank_rename_is_ignored() {
        let (mut store, _) = fresh().await;
        let id = store.active_id().to_string();
        assert!(!store.rename_session(&id, "   ").await.unwrap());
        assert!(!store.rename_session(&id, "").await.unwrap());
        assert_eq!(store.active().unwrap().name, "Chat 1");

        assert!(store.rename_session(&id, "  Trip plans ").await.unwrap());
        assert_eq!(store.active().unwrap().name, "Trip plans");
    }

    #[tokio::test]
    async fn display_name_rules() {
        let (mut store, _) = fresh().await;
        let id = store.active_id().to_string();
        assert_eq!(store.display_name(store.active().unwrap()), "Chat 1");

        store.append_message(&id, Message::bot("welcome")).await.unwrap();
        assert_eq!(store.display_name(store.active().unwrap()), "Chat 1");

        let long = "abcdefghijklmnopqrstuvwxyz0123456789";
        store.append_message(&id, Message::user(long)).await.unwrap();
        let shown = store.display_name(store.active().unwrap());
        assert_eq!(shown, format!("{}...", &long[..30]));

        store.rename_session(&id, "Custom").await.unwrap();
        assert_eq!(store.display_name(store.active().unwrap()), "Custom");
    }

    #[tokio::test]
    async fn display_name_keeps_short_messages_whole() {
        let (mut store, _) = fresh().await;
        let id = store.active_id().to_string();
        let exact = "x".repeat(30);
        store.append_message(&id, Message::user(exact.clone())).await.unwrap();
        assert_eq!(store.display_name(store.active().unwrap()), exact);
    }

    #[tokio::test]
    async fn replace_messages_swaps_history_and_touches() {
        let (mut store, _) = fresh().await;
        let id = store.active_id().to_string();
        let before = store.active().unwrap().last_activity;

        let history = vec![Message::user("one"), Message::bot("two")];
        store.replace_messages(&id, history.clone()).await.unwrap();
        let active = store.active().unwrap();
        assert_eq!(active.messages, history);
        assert!(active.last_activity >= before);

        store.replace_messages(&id, vec![]).await.unwrap();
        assert!(store.active().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn sessions_are_ordered_by_activity() {
        let (mut store, _) = fresh().await;
        let first = store.active_id().to_string();
        store.new_chat().await.unwrap();
        store
            .append_message(&first, Message::user("latest"))
            .await
            .unwrap();
        assert_eq!(store.sessions_by_activity()[0].id, first);
    }

    #[tokio::test]
    async fn single_flight_per_session() {
        let (mut store, _) = fresh().await;
        let id = store.active_id().to_string();
        store.begin_request(&id).unwrap();
        assert!(store.is_busy(&id));
        assert!(matches!(store.begin_request(&id), Err(SessionError::Busy(_))));

        let other = store.new_chat().await.unwrap();
        store.begin_request(&other).unwrap();

        store.finish_request(&id);
        assert!(!store.is_busy(&id));
        store.begin_request(&id).unwrap();
    }

    #[tokio::test]
    async fn state_round_trips_through_the_port() {
        let (mut store, port) = fresh().await;
        let id = store.active_id().to_string();
        store.append_message(&id, Message::user("hello")).await.unwrap();
        store.append_message(&id, Message::bot("hi")).await.unwrap();
        let second = store.new_chat().await.unwrap();
        store.rename_session(&second, "Notes").await.unwrap();

        let reloaded = SessionStore::load(port, "Chat").await.unwrap();
        assert_eq!(reloaded.active_id(), second);
        assert_eq!(reloaded.len(), 2);

        let before = store.get(&id).unwrap();
        let restored = reloaded.get(&id).unwrap();
        assert_eq!(restored.created_at, before.created_at);
        assert_eq!(restored.last_activity, before.last_activity);
        assert_eq!(restored.messages, before.messages);
        assert_eq!(restored.messages[0].sender, Sender::User);
        assert_eq!(reloaded.get(&second).unwrap().name, "Notes");
    }

    #[tokio::test]
    async fn custom_prefix_drives_numbering_and_display() {
        let port = MemoryStore::new();
        let mut store = SessionStore::load(port, "Chat (beta)").await.unwrap();
        assert_eq!(store.active().unwrap().name, "Chat (beta) 1");
        store.new_chat().await.unwrap();
        assert_eq!(store.create_session("Chat (beta)").name, "Chat (beta) 3");

        let id = store.active_id().to_string();
        store.append_message(&id, Message::user("hi")).await.unwrap();
        assert_eq!(store.display_name(store.active().unwrap()), "hi");
    }

    #[tokio::test]
    async fn failed_writes_leave_memory_untouched() {
        let port = FlakyStore::default();
        let mut store = SessionStore::load(port.clone(), "Chat").await.unwrap();
        let first = store.active_id().to_string();
        let second = store.new_chat().await.unwrap();
        store.append_message(&second, Message::user("kept")).await.unwrap();
        let persisted = port.get(SESSIONS_KEY).await.unwrap();

        port.fail_writes.store(true, Ordering::SeqCst);

        assert!(matches!(
            store.append_message(&second, Message::user("lost")).await,
            Err(SessionError::Storage(_))
        ));
        assert!(store.rename_session(&second, "Renamed").await.is_err());
        assert!(store.switch_active(&first).await.is_err());
        assert!(store.delete_session(&second).await.is_err());
        assert!(store.new_chat().await.is_err());

        assert_eq!(store.len(), 2);
        assert_eq!(store.active_id(), second);
        let active = store.active().unwrap();
        assert_eq!(active.name, "Chat 2");
        assert_eq!(active.messages.len(), 1);
        assert_eq!(active.messages[0].text, "kept");
        assert_eq!(port.get(SESSIONS_KEY).await.unwrap(), persisted);

        port.fail_writes.store(false, Ordering::SeqCst);
        store.delete_session(&second).await.unwrap();
        assert_eq!(store.active_id(), first);
    }
}
