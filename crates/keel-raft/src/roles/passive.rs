//! Follower-side handling shared by every role: log replication from the
//! leader and snapshot installs.

use bytes::BytesMut;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::replica::Replica;
use crate::types::*;

fn local_last_index(replica: &Replica) -> Index {
    replica
        .log()
        .last_entry()
        .map(|(index, _)| index)
        .unwrap_or(Index::ZERO)
}

/// Append entries from the leader.
///
/// Adopts a greater term (recording the leader), checks log consistency
/// at `prev_log_index`, truncates any conflicting suffix, appends the new
/// entries, and advances the commit index to
/// `min(request.commit_index, last new entry)`.
pub(crate) async fn handle_append(replica: &Arc<Replica>, request: AppendRequest) -> AppendResponse {
    if request.term >= replica.term() {
        if let Err(e) = replica.update_term_and_leader(request.term, Some(&request.leader)) {
            warn!(error = %e, "failed to adopt term from append; stepping down");
            let _ = replica.step_down(None, None);
            return AppendResponse::ok(replica.term(), false, local_last_index(replica));
        }
    }

    let current_term = replica.term();
    if request.term < current_term {
        debug!(
            request_term = %request.term,
            term = %current_term,
            "rejecting append from stale term"
        );
        return AppendResponse::ok(current_term, false, local_last_index(replica));
    }

    let log = replica.log();

    // The log must contain the leader's previous entry, unless the
    // snapshot boundary already covers it.
    if request.prev_log_index > Index::ZERO && request.prev_log_index >= log.first_index() {
        let matches = match log.entry(request.prev_log_index) {
            Ok(Some(entry)) => entry.term == request.prev_log_term,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, index = %request.prev_log_index, "log read failed");
                false
            }
        };
        if !matches {
            let last = local_last_index(replica);
            debug!(
                prev_index = %request.prev_log_index,
                prev_term = %request.prev_log_term,
                last = %last,
                "log inconsistent with leader; rejecting"
            );
            return AppendResponse::ok(current_term, false, last);
        }
    }

    // Append, truncating a conflicting suffix where terms diverge.
    let mut last_new = request.prev_log_index;
    for entry in &request.entries {
        let expected = last_new.next();
        if entry.index != expected {
            warn!(index = %entry.index, expected = %expected, "append entries out of order");
            return AppendResponse {
                status: ResponseStatus::Error,
                error: Some(ResponseError::ProtocolError),
                term: current_term,
                succeeded: false,
                last_log_index: local_last_index(replica),
            };
        }
        match log.entry(entry.index) {
            Ok(Some(existing)) if existing.term == entry.term => {
                last_new = entry.index;
                continue;
            }
            Ok(Some(_)) => {
                if let Err(e) = log.truncate(entry.index) {
                    warn!(error = %e, index = %entry.index, "log truncate failed");
                    return AppendResponse::ok(current_term, false, local_last_index(replica));
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, index = %entry.index, "log read failed");
                return AppendResponse::ok(current_term, false, local_last_index(replica));
            }
        }
        if let Err(e) = log.append(entry.clone()) {
            warn!(error = %e, index = %entry.index, "log append failed");
            return AppendResponse::ok(current_term, false, local_last_index(replica));
        }
        last_new = entry.index;
    }

    // Record the leader's commit index as the readiness target on the
    // first append, then advance our own commit.
    replica.set_commit_index(request.commit_index);
    replica.commit(request.commit_index.min(last_new));

    AppendResponse::ok(current_term, true, last_new)
}

/// Consume a streamed snapshot install.
///
/// Chunks accumulate until `done`; the assembled snapshot replaces the
/// state machine's state, the covered log prefix, and the commit index.
pub(crate) async fn handle_install(
    replica: &Arc<Replica>,
    mut chunks: mpsc::Receiver<InstallRequest>,
) -> InstallResponse {
    let mut data = BytesMut::new();
    while let Some(chunk) = chunks.recv().await {
        let current_term = replica.term();
        if chunk.term > current_term
            || (chunk.term == current_term && replica.role() == RoleType::Candidate)
        {
            if let Err(e) = replica.step_down(Some(chunk.term), Some(chunk.leader.clone())) {
                warn!(error = %e, "failed to adopt term from install");
                return InstallResponse::rejected(ResponseError::ProtocolError, replica.term());
            }
        } else if chunk.term < current_term {
            debug!(request_term = %chunk.term, term = %current_term, "rejecting stale install");
            return InstallResponse::rejected(ResponseError::ProtocolError, current_term);
        } else if replica.role() == RoleType::Leader {
            warn!(leader = %chunk.leader, term = %chunk.term, "install from a leader of our own term");
            return InstallResponse::rejected(ResponseError::ProtocolError, current_term);
        }

        if chunk.offset != data.len() as u64 {
            warn!(offset = chunk.offset, received = data.len(), "snapshot chunk out of order");
            return InstallResponse::rejected(ResponseError::ProtocolError, replica.term());
        }
        data.extend_from_slice(&chunk.data);

        if chunk.done {
            {
                let mut sm = replica.state_machine().lock().await;
                if let Err(e) = sm.restore(data.freeze()).await {
                    warn!(error = %e, "state machine rejected snapshot");
                    return InstallResponse::rejected(
                        ResponseError::ApplicationError,
                        replica.term(),
                    );
                }
            }
            if let Err(e) = replica.log().reset(chunk.last_index, chunk.last_term) {
                warn!(error = %e, "failed to reset log to snapshot boundary");
                return InstallResponse::rejected(ResponseError::ProtocolError, replica.term());
            }
            replica.set_commit_index(chunk.last_index);
            replica.commit(chunk.last_index);
            replica.note_applied(chunk.last_index);
            debug!(last_index = %chunk.last_index, "snapshot installed");
            return InstallResponse::ok(replica.term());
        }
    }
    // Stream ended before the final chunk.
    InstallResponse::rejected(ResponseError::ProtocolError, replica.term())
}

/// Acknowledge a leader-originated configuration push.
///
/// Membership composition is static here; the request still proves a live
/// leader for its term.
pub(crate) fn handle_configure(replica: &Arc<Replica>, request: ConfigureRequest) -> ConfigureResponse {
    if request.term >= replica.term() {
        if let Err(e) = replica.update_term_and_leader(request.term, Some(&request.leader)) {
            warn!(error = %e, "failed to adopt term from configure");
            return ConfigureResponse::rejected(ResponseError::ProtocolError, replica.term());
        }
    }
    let current_term = replica.term();
    if request.term < current_term {
        return ConfigureResponse::rejected(ResponseError::ProtocolError, current_term);
    }
    ConfigureResponse::ok(current_term)
}
