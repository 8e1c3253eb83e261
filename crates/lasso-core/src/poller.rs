//! The poll loop behind a running session.
//!
//! One task per session.  Each cycle fetches the target's plays since the
//! high-water mark, drops anything already relayed, and submits the rest
//! oldest first.  Submission stops at the first failure so the follower's
//! history never gets a later play ahead of an earlier one; the remainder is
//! picked up again on the next cycle.

use std::sync::Arc;

use chrono::Utc;
use lasso_proto::protocol::{ErrorKind, SessionError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::SinkError;
use crate::engine::{EngineEvent, Shared};
use crate::session::{CommitOutcome, CycleContext, CycleStart, Disposition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Halt,
}

pub(crate) async fn run(shared: Arc<Shared>, session_id: String, cancel: CancellationToken) {
    let mut state_rx = shared.watch_state();
    debug!("poll loop for session {} started", session_id);

    loop {
        // Mark before reading so a resume landing in between still wakes us.
        state_rx.borrow_and_update();
        if cancel.is_cancelled() {
            break;
        }

        let start = shared.machine.read().await.cycle_start(&session_id);
        match start {
            CycleStart::Halt => break,
            CycleStart::Hold => {
                debug!("session {} paused, waiting", session_id);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            CycleStart::Run(ctx) => {
                if run_cycle(&shared, &session_id, ctx, &cancel).await == Flow::Halt {
                    break;
                }
                // Ignore the cycle's own state changes; only commands cut the
                // wait short.
                state_rx.borrow_and_update();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!("poll loop for session {} exited", session_id);
}

async fn run_cycle(
    shared: &Shared,
    session_id: &str,
    ctx: CycleContext,
    cancel: &CancellationToken,
) -> Flow {
    let timeout = shared.config.request_timeout;

    let fetched = tokio::time::timeout(
        timeout,
        shared
            .source
            .fetch_recent_plays(&ctx.target_username, ctx.since),
    )
    .await;
    let plays = match fetched {
        Ok(Ok(plays)) => plays,
        Ok(Err(e)) => {
            let message = format!("fetching plays for {}: {}", ctx.target_username, e);
            return fail(shared, session_id, SessionError::new(e.kind(), message)).await;
        }
        Err(_) => {
            let message = format!(
                "fetching plays for {} timed out after {:?}",
                ctx.target_username, timeout
            );
            return fail(shared, session_id, SessionError::new(ErrorKind::Timeout, message))
                .await;
        }
    };

    let fetched_count = plays.len();
    let pending = {
        let mut machine = shared.machine.write().await;
        machine.observe_now_playing(session_id, &plays, Utc::now());
        machine.pending_plays(session_id, plays)
    };
    debug!(
        "session {}: fetched {} plays, {} to relay",
        session_id,
        fetched_count,
        pending.len()
    );

    for play in pending {
        if cancel.is_cancelled() {
            return Flow::Halt;
        }
        let Some(played_at) = play.played_at else {
            continue;
        };

        let submitted = tokio::time::timeout(
            timeout,
            shared.sink.submit_scrobble(
                &play.title,
                &play.artist,
                play.album.as_deref(),
                played_at,
            ),
        )
        .await;
        let disposition = match submitted {
            Ok(Ok(())) => Disposition::Relayed,
            Ok(Err(SinkError::Rejected(reason))) => {
                warn!(
                    "scrobble of {} - {} rejected: {}",
                    play.artist, play.title, reason
                );
                Disposition::Rejected
            }
            Ok(Err(e)) => {
                let kind = e.kind().unwrap_or(ErrorKind::NetworkError);
                let message = format!("scrobbling {} - {}: {}", play.artist, play.title, e);
                return fail(shared, session_id, SessionError::new(kind, message)).await;
            }
            Err(_) => {
                let message = format!(
                    "scrobbling {} - {} timed out after {:?}",
                    play.artist, play.title, timeout
                );
                return fail(shared, session_id, SessionError::new(ErrorKind::Timeout, message))
                    .await;
            }
        };

        let mut machine = shared.machine.write().await;
        match machine.commit(session_id, &play, disposition, Utc::now()) {
            CommitOutcome::Stale => {
                debug!("session {} ended mid-cycle, dropping result", session_id);
                return Flow::Halt;
            }
            CommitOutcome::Recorded => shared.publish(&machine),
            CommitOutcome::Relayed(event) => {
                info!("scrobbled {} - {}", event.artist, event.title);
                shared.publish(&machine);
                shared.emit(EngineEvent::Scrobbled(event));
            }
        }
    }

    let mut machine = shared.machine.write().await;
    if machine.report_cycle_recovered(session_id, Utc::now()) {
        info!("session {} recovered", session_id);
        shared.publish(&machine);
    }
    Flow::Continue
}

/// Attach `error` to the session.  Fatal errors end the loop.
async fn fail(shared: &Shared, session_id: &str, error: SessionError) -> Flow {
    let fatal = error.kind.is_fatal_to_session();
    if fatal {
        error!("session {}: {}", session_id, error.message);
    } else {
        warn!("session {}: {}", session_id, error.message);
    }

    let mut machine = shared.machine.write().await;
    if machine.report_cycle_error(session_id, error.clone(), Utc::now()) {
        shared.publish(&machine);
        shared.emit(EngineEvent::CycleError(error));
    }
    if fatal {
        Flow::Halt
    } else {
        Flow::Continue
    }
}
