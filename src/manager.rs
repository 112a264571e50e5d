use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::chat::Message;
use crate::filter::{clean_reply, ReplyFilter};
use crate::relay::client::RelayClient;
use crate::session::{Result, SessionError, SessionStore};
use crate::store::KvStore;

/// Drives one exchange: user message in, relay call, cleaned bot reply out.
pub struct Manager<S: KvStore> {
    store: Mutex<SessionStore<S>>,
    client: RelayClient,
    filter: Arc<dyn ReplyFilter>,
}

impl<S: KvStore> Manager<S> {
    pub fn new(store: SessionStore<S>, client: RelayClient, filter: Arc<dyn ReplyFilter>) -> Self {
        Self {
            store: Mutex::new(store),
            client,
            filter,
        }
    }

    /// Locks the session store for direct list management.
    pub async fn sessions(&self) -> MutexGuard<'_, SessionStore<S>> {
        self.store.lock().await
    }

    /// Sends `text` in the active session.
    pub async fn submit(&self, text: &str) -> Result<Message> {
        let session_id = self.store.lock().await.active_id().to_string();
        self.submit_to(&session_id, text).await
    }

    /// Sends `text` in a given session and returns the bot message that was
    /// stored for it. Relay failures become a bot-authored error message, so
    /// only store-level problems surface as `Err`.
    pub async fn submit_to(&self, session_id: &str, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        {
            let mut store = self.store.lock().await;
            store.begin_request(session_id)?;
            if let Err(e) = store.append_message(session_id, Message::user(text)).await {
                store.finish_request(session_id);
                return Err(e);
            }
        }

        let reply = match self.client.send(text).await {
            Ok(prediction) => {
                Message::bot(clean_reply(self.filter.as_ref(), prediction.as_deref()))
            }
            Err(e) => {
                warn!("Chat request failed: {:#}", e);
                Message::error(format!(
                    "Could not reach the assistant: {}. Please try again.",
                    e
                ))
            }
        };

        let mut store = self.store.lock().await;
        store.finish_request(session_id);
        store.append_message(session_id, reply.clone()).await?;
        info!("Stored reply {} in session {}", reply.id, session_id);

        Ok(reply)
    }
}
