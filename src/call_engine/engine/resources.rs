//! Ressourcen einer Session: Erwerb und Teardown
//!
//! Jeder Erwerb prüft danach die Generation; ist die Session inzwischen
//! beendet, wird das Erworbene sofort wieder freigegeben.

use super::{CallError, CallEvent, CallSignalingEngine, EngineInput};
use crate::call_engine::media::LocalMedia;
use crate::call_engine::peer::{PeerEventSink, PeerSession};
use crate::call_engine::session::{CallKind, CallPhase, EndReason};
use std::sync::Arc;

impl CallSignalingEngine {
    pub(super) async fn acquire_media(
        &self,
        generation: u64,
        kind: CallKind,
    ) -> Result<Arc<dyn LocalMedia>, CallError> {
        let media: Arc<dyn LocalMedia> = match self.inner.media.acquire(kind).await {
            Ok(media) => Arc::from(media),
            Err(e) => {
                tracing::error!("Media acquisition failed: {}", e);
                return Err(self.abort(generation, e.into()).await);
            }
        };

        let stored = self
            .with_call(generation, |call| call.media = Some(Arc::clone(&media)))
            .is_some();
        if !stored {
            tracing::info!("Call ended during media acquisition, releasing media");
            media.stop();
            return Err(CallError::Cancelled);
        }
        Ok(media)
    }

    pub(super) async fn create_peer(
        &self,
        generation: u64,
    ) -> Result<Arc<dyn PeerSession>, CallError> {
        let tx = self.inner.input_tx.clone();
        let sink: PeerEventSink = Arc::new(move |event| {
            let _ = tx.send(EngineInput::Peer { generation, event });
        });

        let peer = match self.inner.peers.create(sink).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.abort(generation, e.into()).await),
        };

        let stored = self
            .with_call(generation, |call| call.peer = Some(Arc::clone(&peer)))
            .is_some();
        if !stored {
            tracing::info!("Call ended while creating peer session, closing it");
            peer.close().await;
            return Err(CallError::Cancelled);
        }
        Ok(peer)
    }

    pub(super) async fn attach_tracks(
        &self,
        generation: u64,
        peer: &Arc<dyn PeerSession>,
        media: &Arc<dyn LocalMedia>,
    ) -> Result<(), CallError> {
        for track in media.tracks() {
            if let Err(e) = peer.add_local_track(&track).await {
                return Err(self.abort(generation, e.into()).await);
            }
        }
        Ok(())
    }

    /// Beendet die Session mit `Failed(error)`.
    ///
    /// Gibt `Cancelled` zurück, falls die Session schon beendet war.
    pub(super) async fn abort(&self, generation: u64, error: CallError) -> CallError {
        if self
            .end_session(generation, EndReason::Failed(error.clone()))
            .await
        {
            error
        } else {
            CallError::Cancelled
        }
    }

    /// Einziger Teardown-Pfad: Media stoppen, PeerSession schließen,
    /// Signaling-Records entfernen, `Ended` melden
    pub(super) async fn end_session(&self, generation: u64, reason: EndReason) -> bool {
        let (session, peer, media, subscriptions, grace_timer) = {
            let mut state = self.inner.state.lock();
            let Some(call) = state.active.as_mut() else {
                return false;
            };
            if call.session.generation() != generation || call.session.is_ended() {
                return false;
            }
            call.session.phase = CallPhase::Ended(reason.clone());
            (
                call.session.clone(),
                call.peer.take(),
                call.media.take(),
                std::mem::take(&mut call.subscriptions),
                call.grace_timer.take(),
            )
        };

        drop(subscriptions);
        if let Some(timer) = grace_timer {
            timer.abort();
        }

        match &reason {
            EndReason::Failed(error) => {
                tracing::warn!("Call {} failed: {}", session.call_id, error)
            }
            _ => tracing::info!("Call {} ended: {:?}", session.call_id, reason),
        }

        if let Some(media) = media {
            media.stop();
        }
        if let Some(peer) = peer {
            peer.close().await;
        }

        self.remove_quietly(&session.channel_path).await;
        self.remove_quietly(&session.candidate_record_path()).await;

        {
            let mut state = self.inner.state.lock();
            if state
                .active
                .as_ref()
                .is_some_and(|call| call.session.generation() == generation)
            {
                state.active = None;
            }
        }

        self.emit(CallEvent::Ended {
            call_id: session.call_id,
            reason,
        });
        true
    }

    pub(super) async fn remove_quietly(&self, path: &str) {
        if let Err(e) = self.inner.channel.remove(path).await {
            tracing::warn!("Failed to remove {}: {}", path, e);
        }
    }
}
