//! Transport-side session handling: the session cookie and idle expiry.
//!
//! The routing core owns session state; this adapter only decides which id a
//! request carries and tells the core when an id has been idle for too long.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use http::{HeaderMap, HeaderValue, header::COOKIE};
use tokio::task::JoinHandle;

use crate::{config::models::SessionConfig, core::RoutingEngine, utils::ShutdownToken};

/// The session id for one request and the cookie to send back, if any.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub id: String,
    /// Present when the id was issued by this request
    pub set_cookie: Option<HeaderValue>,
}

pub struct SessionTracker {
    cookie_name: String,
    idle_timeout: Duration,
    sweep_interval: Duration,
    last_seen: scc::HashMap<String, Instant>,
}

impl SessionTracker {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            cookie_name: config.cookie_name.clone(),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            last_seen: scc::HashMap::new(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Number of ids currently considered live.
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Value of our cookie in the request's `Cookie` headers.
    fn cookie_value<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value.trim())
    }

    /// The id carried by the request if it is one we issued and still track;
    /// otherwise a fresh id together with its `Set-Cookie` value.
    pub async fn ticket(&self, headers: &HeaderMap) -> SessionTicket {
        if let Some(id) = self.cookie_value(headers) {
            if self.touch(id).await {
                return SessionTicket {
                    id: id.to_string(),
                    set_cookie: None,
                };
            }
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let _ = self.last_seen.insert_async(id.clone(), Instant::now()).await;
        let cookie = format!("{}={id}; HttpOnly; SameSite=Lax; Path=/", self.cookie_name);
        SessionTicket {
            set_cookie: HeaderValue::from_str(&cookie).ok(),
            id,
        }
    }

    /// Refresh the idle clock of a tracked id. Returns false for unknown ids.
    pub async fn touch(&self, id: &str) -> bool {
        match self.last_seen.get_async(id).await {
            Some(mut entry) => {
                *entry.get_mut() = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Forget every id idle for longer than the timeout, as of `now`.
    pub async fn expire_idle(&self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        let expired_ref = &mut expired;
        let idle_timeout = self.idle_timeout;
        self.last_seen
            .retain_async(|id, seen| {
                if now.saturating_duration_since(*seen) > idle_timeout {
                    expired_ref.push(id.clone());
                    false
                } else {
                    true
                }
            })
            .await;
        expired
    }

    /// Periodically expire idle ids and invalidate them in the routing core.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        engine: Arc<RoutingEngine>,
        mut shutdown: ShutdownToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = self.expire_idle(Instant::now()).await;
                        for id in &expired {
                            engine.on_session_expired(id).await;
                        }
                        if !expired.is_empty() {
                            tracing::info!(expired = expired.len(), "Expired idle sessions");
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        tracing::debug!("Session sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
