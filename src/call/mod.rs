pub mod controller;
pub mod disposer;
pub mod state;
mod status;

#[cfg(test)]
mod scenario_tests;

pub use controller::CallController;
pub use disposer::Disposer;
pub use state::{CallView, LocalCallState, Role};
pub use status::CallStatus;
