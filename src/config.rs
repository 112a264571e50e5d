use clap::{Args, ValueEnum};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use crate::filter::{NoopFilter, ReplyFilter, ThinkTagFilter};
use crate::session::DEFAULT_NAME_PREFIX;

#[derive(Debug, Clone, Args)]
pub struct RelayConfig {
    /// Address the relay listens on.
    #[arg(long, env = "RELAY_BIND", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    /// Base URL of the inference service; requests go to `{url}/predict`.
    #[arg(long, env = "RELAY_UPSTREAM_URL", default_value = "http://127.0.0.1:8000")]
    pub upstream_url: String,

    /// Forward the `stream` flag and pipe event streams back.
    #[arg(
        long,
        env = "RELAY_STREAMING",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub streaming: bool,

    /// Timeout for buffered upstream requests.
    #[arg(long, env = "RELAY_UPSTREAM_TIMEOUT_SECS", default_value_t = 300)]
    pub upstream_timeout_secs: u64,

    /// Largest accepted request body in bytes; 0 accepts any size.
    #[arg(long, env = "RELAY_MAX_BODY_BYTES", default_value_t = 0)]
    pub max_body_bytes: usize,
}

impl RelayConfig {
    pub fn predict_url(&self) -> String {
        format!("{}/predict", self.upstream_url.trim_end_matches('/'))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn body_limit(&self) -> Option<usize> {
        (self.max_body_bytes > 0).then_some(self.max_body_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterKind {
    /// Strip `<think>...</think>` reasoning traces.
    Think,
    /// Keep replies as they are.
    #[value(name = "none")]
    Plain,
}

impl FilterKind {
    pub fn build(self) -> anyhow::Result<Arc<dyn ReplyFilter>> {
        let filter: Arc<dyn ReplyFilter> = match self {
            FilterKind::Think => Arc::new(ThinkTagFilter::new()?),
            FilterKind::Plain => Arc::new(NoopFilter),
        };
        Ok(filter)
    }
}

#[derive(Debug, Clone, Args)]
pub struct ChatConfig {
    /// Base URL of the relay.
    #[arg(long, env = "CHAT_RELAY_URL", default_value = "http://127.0.0.1:3000")]
    pub relay_url: String,

    /// SQLite file holding the session list. Defaults to ~/.chatrelay/sessions.db.
    #[arg(long = "db", env = "CHAT_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Prefix of auto-generated session names.
    #[arg(long, env = "CHAT_NAME_PREFIX", default_value = DEFAULT_NAME_PREFIX)]
    pub name_prefix: String,

    #[arg(long, env = "CHAT_REPLY_FILTER", value_enum, default_value_t = FilterKind::Think)]
    pub reply_filter: FilterKind,
}

impl ChatConfig {
    pub fn db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => path.clone(),
            None => {
                let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(home_dir).join(".chatrelay").join("sessions.db")
            }
        }
    }
}
