//! Master Election Handler.
//!
//! Arbitrates through the [`CoordinationStore`] lease which controller replica
//! may publish cluster states. Leadership is handed to the rest of the
//! controller as a [`MasterToken`], which only this module can create.

use std::fmt;
use std::sync::Arc;

use super::traits::{CoordinationStore, MasterTerm};

/// Proof of mastership for the current tick.
///
/// Publishing and broadcasting take a `&MasterToken`. The token is neither
/// `Clone` nor constructible outside this module, so code that was not handed
/// one by [`MasterElectionHandler::token`] cannot publish.
#[derive(Debug)]
pub struct MasterToken {
    term: MasterTerm,
}

impl MasterToken {
    fn new(term: MasterTerm) -> Self {
        Self { term }
    }

    #[must_use]
    pub fn term(&self) -> MasterTerm {
        self.term
    }
}

/// Election state of this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Follower,
    /// Holds the lease but waits out the cooldown before acting as master.
    Candidate { since_ms: u64 },
    Master,
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionState::Follower => f.write_str("follower"),
            ElectionState::Candidate { .. } => f.write_str("candidate"),
            ElectionState::Master => f.write_str("master"),
        }
    }
}

/// Leadership edge observed during one election step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    Unchanged,
    BecameMaster,
    LostMastership,
}

pub struct MasterElectionHandler {
    replica: u16,
    lease_ms: u64,
    cooldown_ms: u64,
    store: Arc<dyn CoordinationStore>,
    state: ElectionState,
    token: Option<MasterToken>,
}

impl fmt::Debug for MasterElectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterElectionHandler")
            .field("replica", &self.replica)
            .field("state", &self.state)
            .field("term", &self.token.as_ref().map(MasterToken::term))
            .finish_non_exhaustive()
    }
}

impl MasterElectionHandler {
    #[must_use]
    pub fn new(
        replica: u16,
        lease_ms: u64,
        cooldown_ms: u64,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        Self {
            replica,
            lease_ms,
            cooldown_ms,
            store,
            state: ElectionState::Follower,
            token: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ElectionState {
        self.state
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        self.token.is_some()
    }

    /// The mastership capability, while this replica is master.
    #[must_use]
    pub fn token(&self) -> Option<&MasterToken> {
        self.token.as_ref()
    }

    /// Attempts to acquire or renew the lease and advances the state machine.
    pub async fn step(&mut self, now_ms: u64) -> ElectionOutcome {
        let granted = match self
            .store
            .acquire_lease(self.replica, now_ms, self.lease_ms)
            .await
        {
            Ok(granted) => granted,
            Err(e) => {
                tracing::warn!(replica = self.replica, error = %e, "master lease request failed");
                None
            }
        };

        let Some(term) = granted else {
            return self.demote();
        };

        match self.state {
            ElectionState::Follower => {
                tracing::debug!(replica = self.replica, epoch = term.epoch, "master lease granted");
                self.state = ElectionState::Candidate { since_ms: now_ms };
                self.promote_if_cooled_down(term, now_ms, now_ms)
            }
            ElectionState::Candidate { since_ms } => {
                self.promote_if_cooled_down(term, since_ms, now_ms)
            }
            ElectionState::Master => {
                let held_epoch = self.token.as_ref().map(|t| t.term.epoch);
                if held_epoch != Some(term.epoch) {
                    // The lease lapsed and was re-acquired; another replica
                    // may have published in between.
                    let outcome = self.demote();
                    self.state = ElectionState::Candidate { since_ms: now_ms };
                    return outcome;
                }
                self.token = Some(MasterToken::new(term));
                ElectionOutcome::Unchanged
            }
        }
    }

    fn promote_if_cooled_down(
        &mut self,
        term: MasterTerm,
        since_ms: u64,
        now_ms: u64,
    ) -> ElectionOutcome {
        if since_ms.saturating_add(self.cooldown_ms) > now_ms {
            return ElectionOutcome::Unchanged;
        }
        tracing::info!(replica = self.replica, epoch = term.epoch, "became fleetcontroller master");
        self.state = ElectionState::Master;
        self.token = Some(MasterToken::new(term));
        ElectionOutcome::BecameMaster
    }

    fn demote(&mut self) -> ElectionOutcome {
        let was_master = self.token.take().is_some();
        self.state = ElectionState::Follower;
        if was_master {
            tracing::warn!(replica = self.replica, "lost fleetcontroller mastership");
            ElectionOutcome::LostMastership
        } else {
            ElectionOutcome::Unchanged
        }
    }

    /// Steps down without touching the lease, e.g. after failing to persist
    /// controller state.
    pub fn abdicate(&mut self) -> ElectionOutcome {
        self.demote()
    }

    /// Gives up the lease, e.g. on shutdown.
    pub async fn relinquish(&mut self) -> ElectionOutcome {
        if let Err(e) = self.store.release_lease(self.replica).await {
            tracing::warn!(replica = self.replica, error = %e, "failed to release master lease");
        }
        self.demote()
    }
}
