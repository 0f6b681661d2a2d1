use crate::error::{Error, Result};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinState {
    Unjoined,
    Joining,
    Joined,
}

/// Drives joining the cluster through the transport.
///
/// The state exchange itself happens inside the transport's join, which calls
/// `local_state` / `merge_remote_state` on both sides with `join = true`.
pub struct Reconciler<T> {
    transport: Arc<T>,
    state: watch::Sender<JoinState>,
    /// Seed count and reason of the most recent failed attempt
    last_failure: Mutex<Option<(usize, String)>>,
}

impl<T: Transport> Reconciler<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let (state, _) = watch::channel(JoinState::Unjoined);
        Self {
            transport,
            state,
            last_failure: Mutex::new(None),
        }
    }

    pub fn state(&self) -> JoinState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JoinState> {
        self.state.subscribe()
    }

    /// The `JoinFailed` error of the latest attempt, if that attempt failed
    pub fn last_error(&self) -> Option<Error> {
        self.failure_slot()
            .clone()
            .map(|(seeds, reason)| Error::JoinFailed { seeds, reason })
    }

    fn failure_slot(&self) -> MutexGuard<'_, Option<(usize, String)>> {
        self.last_failure.lock().expect("Failed to lock join failure")
    }

    fn fail(&self, seeds: usize, reason: String) -> Error {
        *self.failure_slot() = Some((seeds, reason.clone()));
        Error::JoinFailed { seeds, reason }
    }

    /// Join via `seeds`. On failure the previous state is restored and the
    /// node keeps serving as it did before.
    #[tracing::instrument(skip_all, fields(seeds = seeds.len()))]
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        if seeds.is_empty() {
            return Err(self.fail(0, "no seed peers given".to_string()));
        }

        let previous = self.state.send_replace(JoinState::Joining);
        info!("Joining cluster via {} seed(s)...", seeds.len());

        let outcome = self.transport.join(seeds).await;
        match outcome {
            Ok(contacted) if contacted > 0 => {
                self.state.send_replace(JoinState::Joined);
                *self.failure_slot() = None;
                info!(
                    contacted,
                    members = self.transport.num_members(),
                    "Joined cluster"
                );
                Ok(contacted)
            }
            Ok(_) => {
                self.state.send_replace(previous);
                warn!("Join contacted no seed peer");
                Err(self.fail(seeds.len(), "no seed peer could be contacted".to_string()))
            }
            Err(e) => {
                self.state.send_replace(previous);
                warn!("Failed to join cluster: {e:#}");
                Err(self.fail(seeds.len(), format!("{e:#}")))
            }
        }
    }
}
