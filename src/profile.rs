//! Caller identity lookup.

use crate::error::CallError;
use crate::signaling::decode;
use crate::store::SignalingStore;
use crate::session::Paths;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `users/{id}` as stored.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn lookup(&self, user_id: &str) -> Result<Option<Profile>, CallError>;
}

/// Reads profiles from the `users` collection of the signaling store.
pub struct StoreProfiles {
    store: Arc<dyn SignalingStore>,
    paths: Paths,
}

impl StoreProfiles {
    pub fn new(store: Arc<dyn SignalingStore>, paths: Paths) -> Self {
        Self { store, paths }
    }
}

#[async_trait]
impl ProfileDirectory for StoreProfiles {
    async fn lookup(&self, user_id: &str) -> Result<Option<Profile>, CallError> {
        let path = self.paths.user(user_id);
        let value = self.store.read(&path).await?;
        Ok(decode(&path, value)?)
    }
}
