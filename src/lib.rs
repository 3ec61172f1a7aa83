pub mod call;
pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod profile;
pub mod scanner;
pub mod session;
pub mod signaling;
pub mod store;
pub mod utils;

pub use call::{CallStatus, CallView};
pub use client::CallClient;
pub use config::CallConfig;
pub use error::{CallError, StoreError};
pub use scanner::Invitation;
pub use session::{CallSession, CallType, SessionStatus};
pub use store::{MemoryStore, SignalingStore};
