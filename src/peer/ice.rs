use crate::peer::types::IceCandidate;
use log::{info, warn};
use std::collections::{HashSet, VecDeque};

/// Remote candidates seen so far, plus those waiting for a remote description.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    seen: HashSet<String>,
    pending: VecDeque<(String, IceCandidate)>,
}

impl CandidateQueue {
    /// Returns false when `id` was already admitted.
    pub fn admit(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    /// Queue a candidate received before the remote description
    pub fn defer(&mut self, id: String, candidate: IceCandidate) {
        self.pending.push_back((id, candidate));
    }

    /// Pending candidates in receipt order.
    pub fn drain(&mut self) -> Vec<(String, IceCandidate)> {
        self.pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.pending.clear();
    }
}

pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count, srflx_count, relay_count
    );

    if relay_count == 0 {
        warn!("No TURN relay candidates found, connection through NAT may fail");
    }
}
