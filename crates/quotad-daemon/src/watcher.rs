//! Claim watcher: turns periodic claim listings into update notifications.
//!
//! The first listing only seeds the cache. Every later listing compares
//! resource versions against the cache and hands each changed claim to the
//! handler, one at a time, in listing order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use quotad_core::model::{Claim, ClaimPhase};
use quotad_core::orchestrator::{OrchestratorClient, OrchestratorError};
use tracing::{debug, info, warn};

use crate::handler::ClaimUpdateHandler;

type ClaimKey = (String, String);

/// Polls claims and dispatches changes to a [`ClaimUpdateHandler`].
pub struct ClaimWatcher {
    orchestrator: Arc<dyn OrchestratorClient>,
    handler: Arc<dyn ClaimUpdateHandler>,
    interval: Duration,
    known: Option<HashMap<ClaimKey, Claim>>,
    shutdown: Arc<AtomicBool>,
}

impl ClaimWatcher {
    /// Creates a watcher listing claims every `interval`.
    #[must_use]
    pub fn new(
        orchestrator: Arc<dyn OrchestratorClient>,
        handler: Arc<dyn ClaimUpdateHandler>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            handler,
            interval,
            known: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle for requesting shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Polls until shutdown is requested.
    pub async fn run(&mut self) {
        info!(
            interval = %humantime::format_duration(self.interval),
            "claim watcher starting"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll_once().await {
                Ok(delivered) if delivered > 0 => debug!(delivered, "dispatched claim updates"),
                Ok(_) => {},
                Err(e) => warn!(error = %e, "failed to list claims"),
            }
            tokio::time::sleep(self.interval).await;
        }

        info!("claim watcher shutting down");
    }

    /// Lists claims once and dispatches every change since the last
    /// listing. Returns the number of updates delivered.
    ///
    /// A claim first seen after the initial listing is delivered as an
    /// update from an unbound, unannotated state so that a bind completed
    /// between two listings is not missed.
    pub async fn poll_once(&mut self) -> Result<usize, OrchestratorError> {
        let claims = self.orchestrator.list_claims().await?;

        let Some(known) = self.known.as_mut() else {
            let seeded: HashMap<_, _> = claims.into_iter().map(|c| (key(&c), c)).collect();
            debug!(claims = seeded.len(), "seeded claim cache");
            self.known = Some(seeded);
            return Ok(0);
        };

        let mut current = HashMap::with_capacity(claims.len());
        let mut delivered = 0;
        for claim in claims {
            let k = key(&claim);
            match known.remove(&k) {
                Some(old) if old.resource_version == claim.resource_version => {},
                Some(old) => {
                    self.handler.on_claim_update(&old, &claim).await;
                    delivered += 1;
                },
                None => {
                    self.handler.on_claim_update(&unbound(&claim), &claim).await;
                    delivered += 1;
                },
            }
            current.insert(k, claim);
        }

        *known = current;
        Ok(delivered)
    }
}

fn key(claim: &Claim) -> ClaimKey {
    (claim.namespace.clone(), claim.name.clone())
}

fn unbound(claim: &Claim) -> Claim {
    Claim {
        phase: ClaimPhase::Pending,
        volume_name: None,
        annotations: Default::default(),
        resource_version: String::new(),
        ..claim.clone()
    }
}
