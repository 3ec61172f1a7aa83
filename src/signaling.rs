//! Typed access to call records on top of a [`SignalingStore`].

use crate::error::StoreError;
use crate::peer::types::{IceCandidate, NegotiationMessage};
use crate::session::{CallSession, Paths, SessionStatus};
use crate::store::{SignalingStore, SubscriptionId, Watch};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn SignalingStore>,
    paths: Paths,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn SignalingStore>, paths: Paths) -> Self {
        Self { store, paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub async fn create_session(&self, session: &CallSession) -> Result<(), StoreError> {
        let path = self.paths.session(&session.id);
        self.store.write(&path, encode(&path, session)?).await
    }

    pub async fn read_session(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        let path = self.paths.session(id);
        decode(&path, self.store.read(&path).await?)
    }

    pub async fn write_status(&self, id: &str, status: SessionStatus) -> Result<(), StoreError> {
        let path = self.paths.status(id);
        debug!("signaling: {} <- {:?}", path, status);
        self.store.write(&path, encode(&path, &status)?).await
    }

    pub async fn write_offer(&self, id: &str, offer: &NegotiationMessage) -> Result<(), StoreError> {
        let path = self.paths.offer(id);
        self.store.write(&path, encode(&path, offer)?).await
    }

    pub async fn read_offer(&self, id: &str) -> Result<Option<NegotiationMessage>, StoreError> {
        let path = self.paths.offer(id);
        decode(&path, self.store.read(&path).await?)
    }

    pub async fn write_answer(
        &self,
        id: &str,
        answer: &NegotiationMessage,
    ) -> Result<(), StoreError> {
        let path = self.paths.answer(id);
        self.store.write(&path, encode(&path, answer)?).await
    }

    /// Returns the generated key of the new candidate.
    pub async fn push_candidate(
        &self,
        id: &str,
        peer_id: &str,
        candidate: &IceCandidate,
    ) -> Result<String, StoreError> {
        let path = self.paths.candidates(id, peer_id);
        self.store.push(&path, encode(&path, candidate)?).await
    }

    pub async fn watch_status(&self, id: &str) -> Result<Watch, StoreError> {
        self.store.watch(&self.paths.status(id)).await
    }

    pub async fn watch_answer(&self, id: &str) -> Result<Watch, StoreError> {
        self.store.watch(&self.paths.answer(id)).await
    }

    pub async fn watch_candidates(&self, id: &str, peer_id: &str) -> Result<Watch, StoreError> {
        self.store.watch(&self.paths.candidates(id, peer_id)).await
    }

    /// Sessions addressed to `callee_id`, served as a filtered query.
    pub async fn watch_invitations(&self, callee_id: &str) -> Result<Watch, StoreError> {
        self.store
            .watch_query(self.paths.calls(), "calleeId", Value::from(callee_id))
            .await
    }

    pub async fn remove_session(&self, id: &str) -> Result<(), StoreError> {
        self.store.remove(&self.paths.session(id)).await
    }

    pub fn unwatch(&self, id: SubscriptionId) {
        self.store.unwatch(id);
    }
}

fn encode<T: Serialize>(path: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Malformed {
        path: path.to_string(),
        source,
    })
}

/// Decodes a watched or read value; absent stays absent.
pub fn decode<T: DeserializeOwned>(path: &str, value: Option<Value>) -> Result<Option<T>, StoreError> {
    value
        .map(|v| {
            serde_json::from_value(v).map_err(|source| StoreError::Malformed {
                path: path.to_string(),
                source,
            })
        })
        .transpose()
}
