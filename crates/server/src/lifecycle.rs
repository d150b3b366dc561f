//! Session lifecycle: creation, membership, state transitions, termination
//! and abandonment.
//!
//! ```text
//! Created -> Active <-> Paused
//! Created | Active | Paused -> Completed
//! Active | Paused -> Abandoned   (nobody connected for abandon_timeout_ms)
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use strokesync_replay::LogEntry;
use strokesync_store::{LifecycleState, SessionId, SessionSnapshot, SessionState, UserId};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::archive::FinishedSession;
use crate::broadcast::CloseReason;
use crate::error::{CoordinatorError, Result};
use crate::session::{SessionEntry, SessionHandle};
use crate::validation::validate_target;
use crate::{Coordinator, EndReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long an Active or Paused session may go without a connected
    /// participant before it is abandoned.
    pub abandon_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Ended sessions remembered so late callers get `SessionClosed`.
    pub tombstone_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            abandon_timeout_ms: 120_000,
            sweep_interval_ms: 5_000,
            tombstone_capacity: 4_096,
        }
    }
}

impl Coordinator {
    /// Create a session in `Created`, owned by `owner_id`.
    pub fn create_session(
        &self,
        owner_id: UserId,
        target_distance_m: Option<f64>,
    ) -> Result<Arc<SessionSnapshot>> {
        validate_target(target_distance_m)?;
        let now = self.clock.now_ms();

        let mut arena = self.arena.write();
        let session_id = arena.allocate_id();
        let state = SessionState::new(session_id, owner_id, now, target_distance_m);
        let handle = Arc::new(SessionHandle::new(SessionEntry::new(
            state,
            self.config.validation,
        )));
        let snapshot = handle.latest();
        arena.insert(handle);
        drop(arena);

        info!(session_id, owner_id, ?target_distance_m, "session created");
        Ok(snapshot)
    }

    /// Add a participant. Allowed in `Created` and `Active`; joining again
    /// only marks the participant connected.
    pub async fn join(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Arc<SessionSnapshot>> {
        let handle = self.handle(session_id, "join")?;
        let mut entry = handle.lock("join").await?;
        let at = self.clock.now_ms();

        let snapshot =
            self.commit_entry(&handle, &mut entry, LogEntry::Join { user_id, at }, "join")?;
        debug!(session_id, user_id, "participant joined");
        Ok(snapshot)
    }

    /// Remove a participant together with its metrics and stream.
    pub async fn leave(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Arc<SessionSnapshot>> {
        let handle = self.handle(session_id, "leave")?;
        let mut entry = handle.lock("leave").await?;
        let at = self.clock.now_ms();

        let snapshot =
            self.commit_entry(&handle, &mut entry, LogEntry::Leave { user_id, at }, "leave")?;
        entry.intake.forget(user_id);
        self.broadcaster
            .unsubscribe(session_id, user_id, CloseReason::Unsubscribed);
        debug!(session_id, user_id, "participant left");

        let finished = self.complete_if_all_finished(&handle, &mut entry)?;
        drop(entry);
        if let Some(finished) = finished {
            self.archive_finished(finished).await;
        }
        Ok(snapshot)
    }

    /// `Created -> Active`.
    pub async fn start(&self, session_id: SessionId) -> Result<Arc<SessionSnapshot>> {
        self.transition_from(session_id, LifecycleState::Created, LifecycleState::Active, "start")
            .await
    }

    /// `Active -> Paused`.
    pub async fn pause(&self, session_id: SessionId) -> Result<Arc<SessionSnapshot>> {
        self.transition_from(session_id, LifecycleState::Active, LifecycleState::Paused, "pause")
            .await
    }

    /// `Paused -> Active`.
    pub async fn resume(&self, session_id: SessionId) -> Result<Arc<SessionSnapshot>> {
        self.transition_from(session_id, LifecycleState::Paused, LifecycleState::Active, "resume")
            .await
    }

    async fn transition_from(
        &self,
        session_id: SessionId,
        from: LifecycleState,
        to: LifecycleState,
        operation: &'static str,
    ) -> Result<Arc<SessionSnapshot>> {
        let handle = self.handle(session_id, operation)?;
        let mut entry = handle.lock(operation).await?;

        let state = entry.state.state();
        if state != from {
            return Err(CoordinatorError::SessionClosed {
                session_id,
                state,
                operation,
            });
        }

        let at = self.clock.now_ms();
        let snapshot =
            self.commit_entry(&handle, &mut entry, LogEntry::Transition { to, at }, operation)?;
        info!(session_id, from = %from, to = %to, "session {operation}");
        Ok(snapshot)
    }

    /// Any non-terminal state -> `Completed`. Publishes the final snapshot,
    /// closes every stream and hands the session to the archive.
    pub async fn complete(&self, session_id: SessionId) -> Result<Arc<SessionSnapshot>> {
        let handle = self.handle(session_id, "complete")?;
        let mut entry = handle.lock("complete").await?;
        let finished = self.terminate(&handle, &mut entry, EndReason::Completed)?;
        drop(entry);

        let snapshot = Arc::clone(&finished.snapshot);
        self.archive_finished(finished).await;
        Ok(snapshot)
    }

    /// Mark a participant connected again.
    pub async fn connect(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Arc<SessionSnapshot>> {
        let handle = self.handle(session_id, "connect")?;
        let mut entry = handle.lock("connect").await?;
        let at = self.clock.now_ms();

        let snapshot = self.commit_entry(
            &handle,
            &mut entry,
            LogEntry::Connection {
                user_id,
                connected: true,
                at,
            },
            "connect",
        )?;
        debug!(session_id, user_id, "participant connected");
        Ok(snapshot)
    }

    /// Mark a participant disconnected and end its stream. Both happen under
    /// the session lock, so a concurrent `subscribe` lands entirely before or
    /// entirely after.
    pub async fn disconnect(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Arc<SessionSnapshot>> {
        let handle = self.handle(session_id, "disconnect")?;
        let mut entry = handle.lock("disconnect").await?;
        self.broadcaster
            .unsubscribe(session_id, user_id, CloseReason::Disconnected);

        let at = self.clock.now_ms();
        let snapshot = self.commit_entry(
            &handle,
            &mut entry,
            LogEntry::Connection {
                user_id,
                connected: false,
                at,
            },
            "disconnect",
        )?;
        debug!(session_id, user_id, "participant disconnected");
        Ok(snapshot)
    }

    /// Abandon every session that has been unattended for the configured
    /// timeout. Returns the abandoned session ids.
    pub async fn sweep_abandoned(&self) -> Vec<SessionId> {
        let timeout_ms = self.config.lifecycle.abandon_timeout_ms;
        let handles = self.arena.read().live_handles();
        let mut abandoned = Vec::new();

        for handle in handles {
            let Ok(mut entry) = handle.lock("abandon").await else {
                continue;
            };
            let now = self.clock.now_ms();
            if !entry.is_unattended_for(now, timeout_ms) {
                continue;
            }

            match self.terminate(&handle, &mut entry, EndReason::Abandoned) {
                Ok(finished) => {
                    drop(entry);
                    abandoned.push(handle.id());
                    self.archive_finished(finished).await;
                }
                Err(err) => {
                    warn!(session_id = handle.id(), error = %err, "failed to abandon session");
                }
            }
        }

        abandoned
    }

    /// Run [`Coordinator::sweep_abandoned`] every `sweep_interval_ms` until the
    /// coordinator is dropped.
    pub fn spawn_abandon_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.lifecycle.sweep_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    debug!("coordinator dropped, stopping abandon monitor");
                    break;
                };
                let abandoned = coordinator.sweep_abandoned().await;
                if !abandoned.is_empty() {
                    info!(count = abandoned.len(), ?abandoned, "abandoned sessions swept");
                }
            }
        })
    }

    /// Complete a session with a target once every participant reached it.
    pub(crate) fn complete_if_all_finished(
        &self,
        handle: &SessionHandle,
        entry: &mut SessionEntry,
    ) -> Result<Option<FinishedSession>> {
        if entry.state.state().is_terminal()
            || entry.state.target_distance_m().is_none()
            || !entry.state.all_finished()
        {
            return Ok(None);
        }
        info!(session_id = handle.id(), "all participants finished");
        self.terminate(handle, entry, EndReason::Completed).map(Some)
    }

    /// Move to the terminal state for `reason`, publish the final snapshot,
    /// close all streams, retire the session and seal its log.
    ///
    /// The caller must hold the entry lock and archive the result after
    /// releasing it.
    pub(crate) fn terminate(
        &self,
        handle: &SessionHandle,
        entry: &mut SessionEntry,
        reason: EndReason,
    ) -> Result<FinishedSession> {
        let session_id = handle.id();
        let to = reason.state();
        let at = self.clock.now_ms();

        let snapshot =
            self.commit_entry(handle, entry, LogEntry::Transition { to, at }, reason.operation())?;
        let closed = self.broadcaster.close_session(session_id);
        self.arena.write().retire(session_id, to);
        let log = entry.recorder.finalize(&snapshot, reason.as_str());

        info!(
            session_id,
            state = %to,
            sequence = snapshot.sequence,
            participants = snapshot.participants.len(),
            streams_closed = closed,
            "session ended"
        );

        Ok(FinishedSession {
            snapshot,
            end_reason: reason,
            log,
        })
    }

    pub(crate) async fn archive_finished(&self, finished: FinishedSession) {
        let session_id = finished.session_id();
        if let Err(err) = self.archive.store(finished).await {
            warn!(session_id, error = %err, "failed to archive session");
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use strokesync_replay::verify_log;
    use strokesync_wire::RawTelemetryProto;

    use super::*;
    use crate::testing::{coordinator, coordinator_with};

    fn stroke(ts: u64, distance: f64) -> RawTelemetryProto {
        RawTelemetryProto {
            client_timestamp_ms: ts,
            distance_delta_m: distance,
            stroke_rate_spm: 24.0,
            strokes: 1,
        }
    }

    #[tokio::test]
    async fn test_create_session_starts_in_created() {
        let (coord, _, _) = coordinator();
        let snapshot = coord.create_session(7, Some(2_000.0)).unwrap();
        assert_eq!(snapshot.state, LifecycleState::Created);
        assert_eq!(snapshot.owner_id, 7);
        assert_eq!(snapshot.sequence, 0);
        assert!(snapshot.participants.is_empty());

        let other = coord.create_session(7, None).unwrap();
        assert_ne!(snapshot.session_id, other.session_id);
    }

    #[tokio::test]
    async fn test_create_session_rejects_bad_target() {
        let (coord, _, _) = coordinator();
        let err = coord.create_session(1, Some(-3.0)).unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_join_only_while_created_or_active() {
        let (coord, _, _) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        coord.start(id).await.unwrap();
        coord.join(id, 2).await.unwrap();
        coord.pause(id).await.unwrap();

        let err = coord.join(id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::SessionClosed {
                state: LifecycleState::Paused,
                operation: "join",
                ..
            }
        ));
        assert_eq!(coord.get_snapshot(id).unwrap().participants.len(), 2);
    }

    #[tokio::test]
    async fn test_start_only_from_created() {
        let (coord, _, _) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.start(id).await.unwrap();
        assert!(matches!(
            coord.start(id).await,
            Err(CoordinatorError::SessionClosed {
                state: LifecycleState::Active,
                ..
            })
        ));

        coord.pause(id).await.unwrap();
        // Resuming is not starting.
        assert!(coord.start(id).await.is_err());
        assert!(coord.pause(id).await.is_err());
        coord.resume(id).await.unwrap();
        assert!(coord.resume(id).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (coord, _, _) = coordinator();
        assert_eq!(
            coord.start(404).await.unwrap_err(),
            CoordinatorError::SessionNotFound { session_id: 404 }
        );
    }

    #[tokio::test]
    async fn test_complete_from_created() {
        let (coord, _, archive) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        let last = coord.complete(id).await.unwrap();
        assert_eq!(last.state, LifecycleState::Completed);
        assert_eq!(archive.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_everything() {
        let (coord, _, archive) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        coord.start(id).await.unwrap();
        coord.complete(id).await.unwrap();

        for result in [
            coord.join(id, 2).await,
            coord.start(id).await,
            coord.pause(id).await,
            coord.resume(id).await,
            coord.complete(id).await,
            coord.connect(id, 1).await,
        ] {
            assert!(matches!(
                result,
                Err(CoordinatorError::SessionClosed {
                    state: LifecycleState::Completed,
                    ..
                })
            ));
        }
        assert!(matches!(
            coord.get_snapshot(id),
            Err(CoordinatorError::SessionNotFound { .. })
        ));
        // Only archived once.
        assert_eq!(archive.sessions().len(), 1);
        assert_eq!(coord.live_session_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_closes_streams_after_final_snapshot() {
        let (coord, _, _) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        coord.start(id).await.unwrap();
        let mut stream = coord.subscribe(id, 1).await.unwrap();

        coord.complete(id).await.unwrap();

        let states: Vec<LifecycleState> = (&mut stream).map(|s| s.state).collect().await;
        assert_eq!(
            states,
            vec![LifecycleState::Active, LifecycleState::Completed]
        );
        assert_eq!(stream.close_reason(), Some(CloseReason::SessionEnded));
    }

    #[tokio::test]
    async fn test_leave_removes_participant_and_stream() {
        let (coord, _, _) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        coord.join(id, 2).await.unwrap();
        let mut stream = coord.subscribe(id, 2).await.unwrap();
        assert!(stream.next().await.is_some());

        let snapshot = coord.leave(id, 2).await.unwrap();
        assert!(snapshot.participant(2).is_none());
        assert!(stream.next().await.is_none());
        assert_eq!(stream.close_reason(), Some(CloseReason::Unsubscribed));

        assert!(coord.leave(id, 2).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream_and_connect_restores() {
        let (coord, _, _) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        let mut stream = coord.subscribe(id, 1).await.unwrap();

        let snapshot = coord.disconnect(id, 1).await.unwrap();
        assert!(!snapshot.participant(1).unwrap().connected);
        assert!(stream.next().await.is_none());
        assert_eq!(stream.close_reason(), Some(CloseReason::Disconnected));

        let snapshot = coord.connect(id, 1).await.unwrap();
        assert!(snapshot.participant(1).unwrap().connected);
    }

    #[tokio::test]
    async fn test_abandoned_after_timeout() {
        let (coord, clock, archive) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        coord.join(id, 2).await.unwrap();
        coord.start(id).await.unwrap();
        coord.submit(id, 1, stroke(0, 10.0)).await.unwrap();

        coord.disconnect(id, 1).await.unwrap();
        clock.advance(60_000);
        coord.disconnect(id, 2).await.unwrap();

        clock.advance(119_999);
        assert!(coord.sweep_abandoned().await.is_empty());
        clock.advance(1);
        assert_eq!(coord.sweep_abandoned().await, vec![id]);

        assert!(matches!(
            coord.submit(id, 1, stroke(1_000, 10.0)).await,
            Err(CoordinatorError::SessionClosed {
                state: LifecycleState::Abandoned,
                ..
            })
        ));
        assert!(coord.get_snapshot(id).is_err());

        let finished = archive.get(id).unwrap();
        assert_eq!(finished.end_reason, EndReason::Abandoned);
        assert_eq!(finished.snapshot.state, LifecycleState::Abandoned);
        let replayed = verify_log(&finished.log).unwrap();
        assert_eq!(replayed.digest, finished.snapshot.digest);
    }

    #[tokio::test]
    async fn test_lagged_participant_can_be_abandoned() {
        let mut config = crate::ServerConfig::default();
        config.broadcast.subscriber_buffer = 1;
        config.lifecycle.abandon_timeout_ms = 1_000;
        let (coord, clock, archive) = coordinator_with(config);
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        coord.start(id).await.unwrap();

        // Never read: the initial snapshot fills the queue.
        let stream = coord.subscribe(id, 1).await.unwrap();
        coord.submit(id, 1, stroke(0, 10.0)).await.unwrap();
        assert_eq!(stream.close_reason(), Some(CloseReason::Lagged));
        assert_eq!(coord.subscriber_count(id), 0);
        assert!(!coord.get_snapshot(id).unwrap().participant(1).unwrap().connected);

        clock.advance(1_000);
        assert_eq!(coord.sweep_abandoned().await, vec![id]);
        let replayed = verify_log(&archive.get(id).unwrap().log).unwrap();
        assert_eq!(replayed.state, LifecycleState::Abandoned);
    }

    #[tokio::test]
    async fn test_dropped_stream_marks_participant_disconnected() {
        let (coord, clock, _) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        coord.join(id, 2).await.unwrap();
        coord.start(id).await.unwrap();

        drop(coord.subscribe(id, 2).await.unwrap());
        coord.submit(id, 1, stroke(0, 10.0)).await.unwrap();

        let snapshot = coord.get_snapshot(id).unwrap();
        assert!(!snapshot.participant(2).unwrap().connected);
        assert!(snapshot.participant(1).unwrap().connected);
        assert_eq!(snapshot.sequence, 1);

        coord.disconnect(id, 1).await.unwrap();
        clock.advance(120_000);
        assert_eq!(coord.sweep_abandoned().await, vec![id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disconnect_and_subscribe_never_interleave() {
        let (coord, _, _) = coordinator();
        let coord = Arc::new(coord);
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        coord.start(id).await.unwrap();

        let mut streams = Vec::new();
        for _ in 0..50 {
            let subscriber = tokio::spawn({
                let coord = Arc::clone(&coord);
                async move { coord.subscribe(id, 1).await }
            });
            let disconnector = tokio::spawn({
                let coord = Arc::clone(&coord);
                async move { coord.disconnect(id, 1).await }
            });
            streams.push(subscriber.await.unwrap().unwrap());
            disconnector.await.unwrap().unwrap();

            let connected = coord.get_snapshot(id).unwrap().participant(1).unwrap().connected;
            assert_eq!(coord.subscriber_count(id), usize::from(connected));
        }
    }

    #[tokio::test]
    async fn test_reconnect_prevents_abandonment() {
        let (coord, clock, _) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.join(id, 1).await.unwrap();
        coord.start(id).await.unwrap();

        coord.disconnect(id, 1).await.unwrap();
        clock.advance(100_000);
        coord.connect(id, 1).await.unwrap();
        clock.advance(100_000);
        assert!(coord.sweep_abandoned().await.is_empty());
        assert_eq!(
            coord.get_snapshot(id).unwrap().state,
            LifecycleState::Active
        );
    }

    #[tokio::test]
    async fn test_created_session_never_abandoned() {
        let (coord, clock, _) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        clock.advance(10_000_000);
        assert!(coord.sweep_abandoned().await.is_empty());
        assert!(coord.get_snapshot(id).is_ok());
    }

    #[tokio::test]
    async fn test_start_with_nobody_connected_counts_as_unattended() {
        let (coord, clock, _) = coordinator();
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.start(id).await.unwrap();
        clock.advance(120_000);
        assert_eq!(coord.sweep_abandoned().await, vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_monitor_sweeps_in_background() {
        let (coord, clock, _) = coordinator();
        let coord = Arc::new(coord);
        let id = coord.create_session(1, None).unwrap().session_id;
        coord.start(id).await.unwrap();
        clock.advance(120_000);

        let monitor = coord.spawn_abandon_monitor();
        let mut ended = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            if coord.get_snapshot(id).is_err() {
                ended = true;
                break;
            }
        }
        assert!(ended);

        // The monitor holds only a weak reference.
        drop(coord);
        tokio::time::timeout(Duration::from_secs(30), monitor)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_tombstone_eviction_reports_not_found() {
        let mut config = crate::ServerConfig::default();
        config.lifecycle.tombstone_capacity = 1;
        let (coord, _, _) = coordinator_with(config);

        let first = coord.create_session(1, None).unwrap().session_id;
        let second = coord.create_session(1, None).unwrap().session_id;
        coord.complete(first).await.unwrap();
        coord.complete(second).await.unwrap();

        assert!(coord.start(first).await.unwrap_err().is_not_found());
        assert!(coord.start(second).await.unwrap_err().is_user_visible_denial());
    }
}
