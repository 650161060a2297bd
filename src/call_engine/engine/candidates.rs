//! Candidate-Relay
//!
//! Remote-Candidates warten, bis die Remote Description angewendet ist;
//! lokale Candidates warten, bis der eigene Record im Kanal liegt.

use super::{CallError, CallSignalingEngine};
use crate::call_engine::peer::PeerSession;
use crate::call_engine::record::IceCandidate;
use crate::signaling::{child_path, ChannelEvent};
use std::sync::Arc;

impl CallSignalingEngine {
    pub(super) async fn handle_remote_candidate(&self, generation: u64, event: ChannelEvent) {
        // Entfernte Candidate-Records haben keine Bedeutung
        let ChannelEvent::ChildAdded { key, value } = event else {
            return;
        };
        let Some(candidate) = IceCandidate::from_value(&value) else {
            tracing::warn!("Ignoring malformed candidate {}", key);
            return;
        };

        let peer = self
            .with_call(generation, |call| {
                if call.remote_ready {
                    return call.peer.clone();
                }
                tracing::debug!("Queueing remote candidate {} until answer is applied", key);
                call.session
                    .pending_remote_candidates
                    .push_back(candidate.clone());
                None
            })
            .flatten();

        if let Some(peer) = peer {
            apply_candidate(&peer, &candidate).await;
        }
    }

    /// Wendet die Queue in Ankunftsreihenfolge an; erst wenn sie leer ist,
    /// werden neue Candidates direkt angewendet
    pub(super) async fn drain_remote_candidates(&self, generation: u64) {
        loop {
            let next = self
                .with_call(generation, |call| {
                    match call.session.pending_remote_candidates.pop_front() {
                        Some(candidate) => call.peer.clone().map(|peer| (peer, candidate)),
                        None => {
                            call.remote_ready = true;
                            None
                        }
                    }
                })
                .flatten();

            let Some((peer, candidate)) = next else {
                return;
            };
            apply_candidate(&peer, &candidate).await;
        }
    }

    pub(super) async fn handle_local_candidate(&self, generation: u64, candidate: IceCandidate) {
        let path = self
            .with_call(generation, |call| {
                if call.signaling_ready {
                    return Some(call.session.outbound_candidates_path());
                }
                call.session
                    .pending_local_candidates
                    .push_back(candidate.clone());
                None
            })
            .flatten();

        if let Some(path) = path {
            let _ = self.push_candidate(generation, &path, &candidate).await;
        }
    }

    /// Schreibt lokale Candidates, die vor dem eigenen Record entstanden sind
    pub(super) async fn flush_local_candidates(&self, generation: u64) -> Result<(), CallError> {
        loop {
            let next = self
                .with_call(generation, |call| {
                    match call.session.pending_local_candidates.pop_front() {
                        Some(candidate) => {
                            Some((call.session.outbound_candidates_path(), candidate))
                        }
                        None => {
                            call.signaling_ready = true;
                            None
                        }
                    }
                })
                .flatten();

            let Some((path, candidate)) = next else {
                return Ok(());
            };
            self.push_candidate(generation, &path, &candidate).await?;
        }
    }

    pub(super) async fn push_candidate(
        &self,
        generation: u64,
        path: &str,
        candidate: &IceCandidate,
    ) -> Result<(), CallError> {
        match self.inner.channel.push(path, candidate.to_value()).await {
            Ok(key) => {
                if !self.is_current(generation) {
                    self.remove_quietly(&child_path(path, &key)).await;
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to write candidate to {}: {}", path, e);
                Err(self.abort(generation, e.into()).await)
            }
        }
    }
}

async fn apply_candidate(peer: &Arc<dyn PeerSession>, candidate: &IceCandidate) {
    if let Err(e) = peer.add_ice_candidate(candidate).await {
        tracing::warn!("Failed to add ICE candidate: {}", e);
    }
}
