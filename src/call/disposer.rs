use crate::call::state::{LocalCallState, Role};
use crate::scanner::IncomingCallScanner;
use crate::signaling::SignalingChannel;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Releases what a call holds. Every step tolerates resources that were never created,
/// so running it again is harmless.
pub struct Disposer {
    channel: SignalingChannel,
    scanner: Option<Arc<IncomingCallScanner>>,
    teardowns: AtomicUsize,
}

impl Disposer {
    pub fn new(channel: SignalingChannel, scanner: Option<Arc<IncomingCallScanner>>) -> Self {
        Self {
            channel,
            scanner,
            teardowns: AtomicUsize::new(0),
        }
    }

    /// Returns `true` on the first run for this call.
    pub async fn dispose(&self, state: &mut LocalCallState) -> bool {
        let first = !state.disposed;
        state.disposed = true;
        if first {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            info!(
                "disposer: tearing down call {:?} (generation {})",
                state.session_id, state.generation
            );
        } else {
            debug!("disposer: call {:?} already torn down", state.session_id);
        }

        if let Some(stream) = state.local_stream.take() {
            stream.stop_all();
        }

        if let Some(engine) = state.engine.take() {
            if let Err(e) = engine.close().await {
                warn!("disposer: closing peer connection failed: {}", e);
            }
        }

        for id in state.subscriptions.drain(..) {
            self.channel.unwatch(id);
        }

        if let (Some(scanner), Some(id)) = (&self.scanner, &state.session_id) {
            scanner.release_session_watch(id).await;
        }

        if first && state.role == Some(Role::Caller) {
            if let Some(id) = &state.session_id {
                if let Err(e) = self.channel.remove_session(id).await {
                    warn!("disposer: removing session {} failed: {}", id, e);
                }
            }
        }
        first
    }

    /// How many calls have been torn down.
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}
