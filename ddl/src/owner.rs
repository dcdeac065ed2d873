use crate::clock::Clock;
use crate::error::Result;
use crate::retry::Backoff;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tessel_meta::CampaignOutcome;
use tessel_meta::MetaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::warn;

/// Proof of ownership handed to workers; every mutating step is fenced on
/// `token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerToken {
    pub token: String,
    pub epoch: i64,
    pub lease_until_ms: i64,
}

#[async_trait]
pub trait OwnerManager: Send + Sync {
    fn node_id(&self) -> &str;

    /// Start campaigning in the background and return immediately. The loop
    /// keeps renewing while elected and re-campaigns after losing the lease,
    /// until `cancel` fires.
    fn campaign_owner(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()>;

    /// Whether this node holds a lease that has not yet expired.
    fn is_owner(&self) -> bool;

    /// The live token, if this node is the owner right now.
    fn current_token(&self) -> Option<OwnerToken>;

    fn subscribe(&self) -> watch::Receiver<Option<OwnerToken>>;

    /// Release ownership so another node can take over without waiting for
    /// the lease to run out.
    async fn resign(&self) -> Result<()>;
}

/// [`OwnerManager`] backed by the `ddl_owner` lease row in the meta store.
pub struct LeaseOwnerManager {
    node_id: String,
    store: MetaStore,
    clock: Arc<dyn Clock>,
    lease: Duration,
    retry: RetryPolicy,
    state: watch::Sender<Option<OwnerToken>>,
}

impl LeaseOwnerManager {
    pub fn new(
        node_id: impl Into<String>,
        store: MetaStore,
        clock: Arc<dyn Clock>,
        lease: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            node_id: node_id.into(),
            store,
            clock,
            lease,
            retry,
            state,
        }
    }

    fn lease_ms(&self) -> i64 {
        self.lease.as_millis() as i64
    }

    /// Renew at a third of the lease so two missed renewals still leave time.
    fn renew_interval(&self) -> Duration {
        self.lease / 3
    }

    /// One campaign or renewal round; returns how long to wait before the
    /// next one.
    async fn tick(&self, backoff: &mut Backoff) -> Duration {
        let now_ms = self.clock.now_ms();
        let held = self.state.borrow().clone();
        match held {
            Some(token) => {
                match self
                    .store
                    .renew_owner_lease(&self.node_id, &token.token, self.lease_ms(), now_ms)
                    .await
                {
                    Ok(Some(lease_until_ms)) => {
                        backoff.reset();
                        self.state.send_replace(Some(OwnerToken {
                            lease_until_ms,
                            ..token
                        }));
                        self.renew_interval()
                    }
                    Ok(None) => {
                        warn!(epoch = token.epoch, "lost ddl owner lease");
                        self.state.send_replace(None);
                        Duration::ZERO
                    }
                    Err(err) => {
                        warn!("failed to renew ddl owner lease: {err}");
                        if now_ms >= token.lease_until_ms {
                            self.state.send_replace(None);
                        }
                        backoff.next_delay().min(self.renew_interval())
                    }
                }
            }
            None => match self
                .store
                .try_campaign_owner(&self.node_id, self.lease_ms(), now_ms)
                .await
            {
                Ok(CampaignOutcome::Elected {
                    token,
                    epoch,
                    lease_until,
                }) => {
                    info!(epoch, "became ddl owner");
                    backoff.reset();
                    self.state.send_replace(Some(OwnerToken {
                        token,
                        epoch,
                        lease_until_ms: lease_until,
                    }));
                    self.renew_interval()
                }
                Ok(CampaignOutcome::HeldBy {
                    owner_id,
                    lease_until,
                }) => {
                    debug!(%owner_id, lease_until, "ddl owner lease is held");
                    let remaining =
                        Duration::from_millis(lease_until.saturating_sub(now_ms).max(0) as u64);
                    backoff.next_delay().min(remaining)
                }
                Err(err) => {
                    warn!("ddl owner campaign failed: {err}");
                    backoff.next_delay()
                }
            },
        }
    }
}

#[async_trait]
impl OwnerManager for LeaseOwnerManager {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn campaign_owner(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        // A previous incarnation's token is never reused.
        self.state.send_replace(None);
        let span = info_span!("ddl_owner_campaign", node_id = %self.node_id);
        tokio::spawn(
            async move {
                let mut backoff = Backoff::new(self.retry.clone());
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let delay = self.tick(&mut backoff).await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                debug!("ddl owner campaign stopped");
            }
            .instrument(span),
        )
    }

    fn is_owner(&self) -> bool {
        self.current_token().is_some()
    }

    fn current_token(&self) -> Option<OwnerToken> {
        let now_ms = self.clock.now_ms();
        self.state
            .borrow()
            .as_ref()
            .filter(|token| now_ms < token.lease_until_ms)
            .cloned()
    }

    fn subscribe(&self) -> watch::Receiver<Option<OwnerToken>> {
        self.state.subscribe()
    }

    async fn resign(&self) -> Result<()> {
        if let Some(token) = self.state.send_replace(None) {
            self.store.resign_owner(&token.token).await?;
            info!(epoch = token.epoch, "resigned ddl ownership");
        }
        Ok(())
    }
}
