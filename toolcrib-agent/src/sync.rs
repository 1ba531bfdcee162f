//! Server synchronization
//!
//! Pull: ask `/api/changes` since the last known server revision and fetch
//! `/api/full-data` only when something moved. Push: send the whole local
//! snapshot to `/api/sync` with `If-Match` on that revision.
//!
//! Conflicts resolve server-wins: a rejected push adopts the server
//! snapshot and the local edits are logged as lost. A server whose revision
//! went backwards (fresh store after a corrupted blob) is adopted whole.
//! Failures never stop the loop; the local store keeps serving the last
//! known state.

use crate::kv_store::{KvStore, SyncState};
use chrono::Utc;
use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};
use toolcrib_core::{ChangeKind, ReplaceSource, Snapshot, Store, StoreError, StoreEvent};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server answered {status} ({code}): {message}")]
    Server { status: u16, code: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync state: {0}")]
    State(#[from] anyhow::Error),
}

#[derive(Debug, Deserialize)]
pub struct ChangesSummary {
    pub has_changes: bool,
    pub current_revision: u64,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted { revision: u64 },
    /// Server moved on, its snapshot replaced the local one
    Conflict { adopted: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    Applied { revision: u64 },
    /// Older than what we already have
    Discarded { revision: u64, base: u64 },
}

#[derive(Deserialize)]
struct PushAck {
    revision: u64,
}

/// Thin HTTP client over the kernel API
#[derive(Clone)]
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl SyncClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let rb = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => rb.header("x-api-key", key),
            None => rb,
        }
    }

    async fn server_error(resp: Response) -> SyncError {
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        SyncError::Server {
            status,
            code: body["code"].as_str().unwrap_or("unknown").to_string(),
            message: body["error"].as_str().unwrap_or_default().to_string(),
        }
    }

    pub async fn check_changes(&self, since: u64) -> Result<ChangesSummary, SyncError> {
        let resp = self
            .request(Method::GET, &format!("/api/changes?since={since}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::server_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    /// `None` when the server still is at `known`
    pub async fn fetch_full(&self, known: Option<u64>) -> Result<Option<Snapshot>, SyncError> {
        let mut rb = self.request(Method::GET, "/api/full-data");
        if let Some(rev) = known {
            rb = rb.header(header::IF_NONE_MATCH, format!("\"{rev}\""));
        }
        let resp = rb.send().await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::server_error(resp).await);
        }
        Ok(Some(resp.json().await?))
    }

    /// `Ok(None)` on a revision conflict
    pub async fn push(&self, snapshot: &Snapshot, base: u64) -> Result<Option<u64>, SyncError> {
        let resp = self
            .request(Method::POST, "/api/sync")
            .header(header::IF_MATCH, format!("\"{base}\""))
            .json(snapshot)
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::server_error(resp).await);
        }
        let ack: PushAck = resp.json().await?;
        Ok(Some(ack.revision))
    }
}

/// Local store + server client + persisted bookkeeping
pub struct Syncer {
    store: Arc<Store>,
    kv: KvStore,
    client: SyncClient,
    state: SyncState,
}

impl Syncer {
    pub fn new(store: Arc<Store>, kv: KvStore, client: SyncClient) -> Self {
        let state = SyncState::load(&kv);
        Self {
            store,
            kv,
            client,
            state,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    fn save_state(&self) -> Result<(), SyncError> {
        self.state.save(&self.kv)?;
        Ok(())
    }

    /// Records that the local snapshot holds unpushed edits
    pub fn mark_dirty(&mut self) -> Result<(), SyncError> {
        if !self.state.dirty {
            self.state.dirty = true;
            self.save_state()?;
        }
        Ok(())
    }

    pub async fn pull(&mut self) -> Result<PullOutcome, SyncError> {
        // ne jamais écraser des modifs locales non poussées
        if self.state.dirty {
            if let PushOutcome::Conflict { adopted } = self.push().await? {
                return Ok(PullOutcome::Applied { revision: adopted });
            }
        }

        let Some(base) = self.state.base_revision else {
            let revision = self.fetch_and_adopt().await?;
            return Ok(PullOutcome::Applied { revision });
        };

        let changes = self.client.check_changes(base).await?;
        if changes.current_revision < base {
            warn!(
                "[sync] server went back to revision {} (we were at {base}), reloading its copy",
                changes.current_revision
            );
            let revision = self.fetch_and_adopt().await?;
            return Ok(PullOutcome::Applied { revision });
        }
        if changes.truncated {
            debug!("[sync] change journal no longer reaches revision {base}, fetching the full snapshot");
        } else if !changes.has_changes {
            debug!("[sync] server still at revision {}", changes.current_revision);
            return Ok(PullOutcome::UpToDate);
        }

        match self.client.fetch_full(Some(base)).await? {
            None => Ok(PullOutcome::UpToDate),
            Some(snapshot) => self.apply_remote(snapshot),
        }
    }

    /// Unconditional fetch, the server copy replaces the local one
    async fn fetch_and_adopt(&mut self) -> Result<u64, SyncError> {
        match self.client.fetch_full(None).await? {
            Some(snapshot) => self.adopt_remote(snapshot),
            None => Err(SyncError::Server {
                status: 304,
                code: "not_modified".into(),
                message: "unconditional fetch answered 304".into(),
            }),
        }
    }

    /// Applies a pulled snapshot unless it is older than the local base
    pub(crate) fn apply_remote(&mut self, snapshot: Snapshot) -> Result<PullOutcome, SyncError> {
        let revision = snapshot.revision;
        if let Some(base) = self.state.base_revision {
            if revision < base {
                warn!("[sync] discarding server revision {revision}, already at {base}");
                return Ok(PullOutcome::Discarded { revision, base });
            }
        }
        let revision = self.adopt_remote(snapshot)?;
        Ok(PullOutcome::Applied { revision })
    }

    fn adopt_remote(&mut self, snapshot: Snapshot) -> Result<u64, SyncError> {
        let revision = snapshot.revision;
        self.store.replace_from_remote(snapshot)?;
        self.state.base_revision = Some(revision);
        self.state.dirty = false;
        self.state.last_pull = Some(Utc::now());
        self.save_state()?;
        info!("[sync] applied server revision {revision}");
        Ok(revision)
    }

    pub async fn push(&mut self) -> Result<PushOutcome, SyncError> {
        let snapshot = self.store.get_all();
        let base = self.state.base_revision.unwrap_or(0);

        if let Some(revision) = self.client.push(&snapshot, base).await? {
            self.state.base_revision = Some(revision);
            self.state.dirty = false;
            self.state.last_push = Some(Utc::now());
            self.save_state()?;
            info!("[sync] pushed local snapshot, server at revision {revision}");
            return Ok(PushOutcome::Accepted { revision });
        }

        warn!("[sync] server is no longer at revision {base}, local changes dropped in favor of the server copy");
        // le serveur gagne, même si sa révision est plus basse que la nôtre
        let adopted = self.fetch_and_adopt().await?;
        Ok(PushOutcome::Conflict { adopted })
    }

    /// Pull and push timers, plus an immediate push after each local change
    pub async fn run<F>(
        mut self,
        pull_every: Duration,
        push_every: Duration,
        shutdown: impl Future<Output = ()>,
        mut on_change: F,
    ) -> Result<(), SyncError>
    where
        F: FnMut(&Store),
    {
        let mut events = self.store.subscribe();
        let mut pull_timer = interval(pull_every);
        let mut push_timer = interval(push_every);
        pull_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        push_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("[sync] syncing with {} every {:?}", self.client.base_url(), pull_every);
        loop {
            tokio::select! {
                _ = pull_timer.tick() => match self.pull().await {
                    Ok(PullOutcome::Applied { .. }) => on_change(self.store.as_ref()),
                    Ok(_) => {}
                    Err(e) => warn!("[sync] pull failed, keeping local state: {e}"),
                },
                _ = push_timer.tick() => {
                    if self.state.dirty {
                        if let Err(e) = self.push().await {
                            warn!("[sync] push failed, will retry: {e}");
                        }
                    }
                },
                event = events.recv() => match event {
                    Ok(ev) if is_remote(&ev) => {}
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        self.mark_dirty()?;
                        on_change(self.store.as_ref());
                        if let Err(e) = self.push().await {
                            warn!("[sync] push failed, will retry: {e}");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut shutdown => {
                    info!("[sync] shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn is_remote(event: &StoreEvent) -> bool {
    matches!(
        event.change,
        ChangeKind::SnapshotReplaced {
            source: ReplaceSource::Remote
        }
    )
}
