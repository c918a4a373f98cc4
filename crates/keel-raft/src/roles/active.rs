//! Voter logic shared by follower, candidate, and leader.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::replica::Replica;
use crate::types::*;

/// Whether a candidate's log is at least as up-to-date as ours: a
/// strictly greater last term wins, an equal last term needs at least our
/// last index.
pub(crate) fn log_up_to_date(
    replica: &Replica,
    candidate_last_term: Term,
    candidate_last_index: Index,
) -> bool {
    match replica.log().last_entry() {
        None => true,
        Some((local_index, local_term)) => {
            candidate_last_term > local_term
                || (candidate_last_term == local_term && candidate_last_index >= local_index)
        }
    }
}

/// Decide a vote request.
///
/// A greater request term is adopted first. The vote is granted iff no
/// different vote was cast this term and the candidate's log is at least
/// as up-to-date as ours; granting persists the vote.
pub(crate) async fn handle_vote(replica: &Arc<Replica>, request: VoteRequest) -> VoteResponse {
    if request.term > replica.term() {
        if let Err(e) = replica.update_term_and_leader(request.term, None) {
            warn!(error = %e, "failed to adopt term from vote request");
            return VoteResponse::ok(replica.term(), false);
        }
    }

    let current_term = replica.term();
    if request.term < current_term {
        debug!(
            candidate = %request.candidate,
            request_term = %request.term,
            term = %current_term,
            "rejecting vote from stale term"
        );
        return VoteResponse::ok(current_term, false);
    }

    if !replica.cluster().contains(&request.candidate) {
        warn!(candidate = %request.candidate, "vote request from unknown member");
        return VoteResponse::ok(current_term, false);
    }

    if let Some(voted_for) = replica.last_voted_for() {
        if voted_for != request.candidate {
            debug!(
                candidate = %request.candidate,
                voted_for = %voted_for,
                "vote already cast this term"
            );
            return VoteResponse::ok(current_term, false);
        }
    }

    if !log_up_to_date(replica, request.last_log_term, request.last_log_index) {
        debug!(candidate = %request.candidate, "candidate log not up to date");
        return VoteResponse::ok(current_term, false);
    }

    match replica.set_last_voted_for(request.candidate.clone()) {
        Ok(()) => {
            debug!(candidate = %request.candidate, term = %current_term, "vote granted");
            VoteResponse::ok(current_term, true)
        }
        Err(e) => {
            warn!(candidate = %request.candidate, error = %e, "failed to record vote");
            VoteResponse::ok(current_term, false)
        }
    }
}

/// Decide a poll (pre-vote): the same term and up-to-date comparison as a
/// vote, without mutating the recorded vote.
pub(crate) async fn handle_poll(replica: &Arc<Replica>, request: PollRequest) -> PollResponse {
    if request.term > replica.term() {
        if let Err(e) = replica.update_term_and_leader(request.term, None) {
            warn!(error = %e, "failed to adopt term from poll request");
            return PollResponse::ok(replica.term(), false);
        }
    }
    let current_term = replica.term();
    let accepted = request.term >= current_term
        && log_up_to_date(replica, request.last_log_term, request.last_log_index);
    PollResponse::ok(current_term, accepted)
}
