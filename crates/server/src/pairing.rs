//! Pairing approval state machine.
//!
//! Each pairing token nonce moves through `pending -> approved|rejected`
//! with automatic expiry. The TUI (or any authenticated client) approves
//! or rejects; the exchange endpoint consults `status` before handing
//! out real tokens. Expired rows are swept on every mutating call.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::info;

use cdev_protocol::{new_id, now_rfc3339, EventKind, PairingState};

use crate::hub::EventHub;

#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub id: String,
    pub nonce: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub created_at: String,
    pub expires_at: DateTime<Utc>,
    pub state: PairingState,
}

pub struct PairingManager {
    requests: Mutex<HashMap<String, PairingRequest>>,
    hub: EventHub,
}

impl PairingManager {
    pub fn new(hub: EventHub) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            hub,
        }
    }

    /// Idempotently register a pending request for `nonce`: a second
    /// call returns the existing row instead of creating a duplicate.
    pub fn ensure_pending(
        &self,
        nonce: &str,
        remote_addr: &str,
        user_agent: &str,
        expires_at: DateTime<Utc>,
    ) -> PairingRequest {
        let mut requests = self.requests.lock().expect("pairing map poisoned");
        Self::sweep_locked(&mut requests);

        if let Some(existing) = requests.get(nonce) {
            return existing.clone();
        }

        let request = PairingRequest {
            id: new_id(),
            nonce: nonce.to_string(),
            remote_addr: remote_addr.to_string(),
            user_agent: user_agent.to_string(),
            created_at: now_rfc3339(),
            expires_at,
            state: PairingState::Pending,
        };
        requests.insert(nonce.to_string(), request.clone());
        drop(requests);

        info!(
            component = "pairing",
            event = "pairing.pending",
            request_id = %request.id,
            remote_addr = %remote_addr,
            "Pairing request pending approval"
        );
        self.publish_state(&request);
        request
    }

    /// Current state for a nonce; `None` when unknown or swept.
    pub fn status(&self, nonce: &str) -> Option<PairingState> {
        let requests = self.requests.lock().expect("pairing map poisoned");
        let request = requests.get(nonce)?;
        if request.expires_at < Utc::now() {
            return Some(PairingState::Expired);
        }
        Some(request.state)
    }

    pub fn approve(&self, request_id: &str) -> Option<PairingRequest> {
        self.transition(request_id, PairingState::Approved)
    }

    pub fn reject(&self, request_id: &str) -> Option<PairingRequest> {
        self.transition(request_id, PairingState::Rejected)
    }

    fn transition(&self, request_id: &str, to: PairingState) -> Option<PairingRequest> {
        let mut requests = self.requests.lock().expect("pairing map poisoned");
        Self::sweep_locked(&mut requests);

        let request = requests
            .values_mut()
            .find(|r| r.id == request_id && r.state == PairingState::Pending)?;
        request.state = to;
        let snapshot = request.clone();
        drop(requests);

        info!(
            component = "pairing",
            event = "pairing.decided",
            request_id = %request_id,
            state = ?to,
            "Pairing request decided"
        );
        self.publish_state(&snapshot);
        Some(snapshot)
    }

    pub fn list_pending(&self) -> Vec<PairingRequest> {
        let mut requests = self.requests.lock().expect("pairing map poisoned");
        Self::sweep_locked(&mut requests);
        let mut pending: Vec<_> = requests
            .values()
            .filter(|r| r.state == PairingState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Remove a nonce entirely (after a successful exchange).
    pub fn clear(&self, nonce: &str) {
        let mut requests = self.requests.lock().expect("pairing map poisoned");
        Self::sweep_locked(&mut requests);
        requests.remove(nonce);
    }

    fn sweep_locked(requests: &mut HashMap<String, PairingRequest>) {
        let now = Utc::now();
        requests.retain(|_, r| r.expires_at >= now);
    }

    fn publish_state(&self, request: &PairingRequest) {
        self.hub.publish(
            "",
            EventKind::PairingState {
                request_id: request.id.clone(),
                state: request.state,
                remote_addr: request.remote_addr.clone(),
            },
        );
    }
}
