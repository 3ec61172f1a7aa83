use serde::Serialize;
use std::fmt;

/// Local status of the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    Calling,
    Ringing,
    Connecting,
    Connected,
    Ended,
    Rejected,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Rejected)
    }

    /// A call is using local resources.
    pub fn is_engaged(self) -> bool {
        matches!(
            self,
            CallStatus::Calling | CallStatus::Connecting | CallStatus::Connected
        )
    }

    /// Whether `next` is a legal step from `self`. Nothing leaves a terminal status and
    /// staying put is never a transition.
    pub fn accepts(self, next: CallStatus) -> bool {
        use CallStatus::*;
        match (self, next) {
            (Ended | Rejected, _) => false,
            (_, Ended | Rejected) => true,
            (Idle, Calling | Ringing | Connecting) => true,
            (Calling, Ringing | Connecting) => true,
            (Ringing, Connecting) => true,
            (Calling | Ringing | Connecting, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallStatus::Idle => "idle",
            CallStatus::Calling => "calling",
            CallStatus::Ringing => "ringing",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
        };
        f.write_str(name)
    }
}
