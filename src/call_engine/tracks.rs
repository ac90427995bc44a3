//! Track Coordinator
//!
//! Bindet die ausgehenden Tracks an die Peer Engine, führt den Mute-Status
//! und spielt beim Unmute den Transmit-Ton über den Audio-Sender.

use super::media::{LocalStream, LocalTrack, MediaKind};
use super::peer::{MediaSender, PeerEngine, PeerError};
use super::tone::{Tone, ToneSource, ToneSpec};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Ergebnis eines Ton-Versuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneOutcome {
    /// Ton gespielt und Original-Track wiederhergestellt
    Played,
    /// Kein Audio-Sender oder kein lebender Track
    Skipped,
    /// Es läuft bereits ein Ton
    Busy,
    Failed,
}

// ============================================================================
// GUARDS
// ============================================================================

/// Hält das In-Progress-Flag; beim Drop wird es wieder freigegeben
struct ToneGuard {
    flag: Arc<AtomicBool>,
}

impl ToneGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for ToneGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Stellt den Original-Track am Sender wieder her.
///
/// Wird die Ton-Task abgebrochen bevor [`Restore::finish`] lief, übernimmt
/// `Drop` die Wiederherstellung in einer eigenen Task.
struct Restore {
    sender: Arc<dyn MediaSender>,
    original: Option<LocalTrack>,
    tone: Option<Tone>,
    guard: Option<ToneGuard>,
}

impl Restore {
    fn new(sender: Arc<dyn MediaSender>, original: LocalTrack, guard: ToneGuard) -> Self {
        Self {
            sender,
            original: Some(original),
            tone: None,
            guard: Some(guard),
        }
    }

    async fn finish(mut self) -> Result<(), PeerError> {
        let original = self.original.take();
        let result = self.sender.replace_track(original).await;
        if let Some(tone) = self.tone.take() {
            tone.release();
        }
        result
    }
}

impl Drop for Restore {
    fn drop(&mut self) {
        let Some(original) = self.original.take() else {
            return;
        };

        let sender = Arc::clone(&self.sender);
        let tone = self.tone.take();
        let guard = self.guard.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sender.replace_track(Some(original)).await {
                        tracing::error!("Failed to restore original track: {}", e);
                    }
                    if let Some(tone) = tone {
                        tone.release();
                    }
                    drop(guard);
                });
            }
            Err(_) => tracing::error!("No runtime left to restore the original track"),
        }
    }
}

// ============================================================================
// TRACK COORDINATOR
// ============================================================================

pub struct TrackCoordinator {
    outbound: LocalStream,
    tone_enabled: bool,
    tone_spec: ToneSpec,
    tone_source: Arc<dyn ToneSource>,
    muted: Mutex<bool>,
    audio_sender: Mutex<Option<Arc<dyn MediaSender>>>,
    tone_in_progress: Arc<AtomicBool>,
    tone_cut: Notify,
}

impl TrackCoordinator {
    pub fn new(outbound: LocalStream, tone_enabled: bool, tone_source: Arc<dyn ToneSource>) -> Self {
        Self {
            outbound,
            tone_enabled,
            tone_spec: ToneSpec::default(),
            tone_source,
            muted: Mutex::new(false),
            audio_sender: Mutex::new(None),
            tone_in_progress: Arc::new(AtomicBool::new(false)),
            tone_cut: Notify::new(),
        }
    }

    pub fn outbound(&self) -> &LocalStream {
        &self.outbound
    }

    /// Fügt jeden ausgehenden Track als Sender zur Peer Engine hinzu.
    ///
    /// Der erste Audio-Sender wird zum Sender für Mute und Ton. Auf einem
    /// frischen Handle ersetzt ein erneuter Aufruf die alte Bindung.
    pub async fn bind_outbound_tracks(&self, peer: &dyn PeerEngine) -> Result<usize, PeerError> {
        let mut audio_sender = None;
        for track in self.outbound.tracks() {
            let sender = peer.add_track(track.clone()).await?;
            if audio_sender.is_none() && track.kind() == Some(MediaKind::Audio) {
                audio_sender = Some(sender);
            }
        }

        if audio_sender.is_none() {
            tracing::warn!("Outbound stream {} has no audio track", self.outbound.id());
        }
        *self.audio_sender.lock() = audio_sender;

        let bound = self.outbound.tracks().len();
        tracing::debug!("Bound {} outbound track(s)", bound);
        Ok(bound)
    }

    /// Vergisst die Sender des geschlossenen Handles
    pub fn unbind(&self) {
        self.audio_sender.lock().take();
    }

    pub fn audio_sender(&self) -> Option<Arc<dyn MediaSender>> {
        self.audio_sender.lock().clone()
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.lock()
    }

    pub fn is_tone_playing(&self) -> bool {
        self.tone_in_progress.load(Ordering::SeqCst)
    }

    /// Setzt den Mute-Status.
    ///
    /// Nur der Übergang stumm → laut startet den Ton, und nur wenn er
    /// konfiguriert ist und gerade keiner läuft. Stummschalten während eines
    /// Tons bricht ihn ab. Gibt `true` zurück wenn eine Ton-Task gestartet
    /// wurde.
    pub fn set_mute(self: &Arc<Self>, muted: bool) -> bool {
        let was_muted = std::mem::replace(&mut *self.muted.lock(), muted);
        for track in self.outbound.audio_tracks() {
            track.set_enabled(!muted);
        }

        if was_muted != muted {
            tracing::info!("Outbound audio {}", if muted { "muted" } else { "unmuted" });
        }
        if muted {
            self.tone_cut.notify_waiters();
        }
        if !(was_muted && !muted) || !self.tone_enabled {
            return false;
        }

        let Some(guard) = ToneGuard::acquire(&self.tone_in_progress) else {
            tracing::debug!("Tone already playing, skipping");
            return false;
        };

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.play_tone_guarded(guard).await;
        });
        true
    }

    /// Spielt den Ton über den Audio-Sender und stellt danach den
    /// Original-Track wieder her.
    pub async fn play_tone(&self) -> ToneOutcome {
        match ToneGuard::acquire(&self.tone_in_progress) {
            Some(guard) => self.play_tone_guarded(guard).await,
            None => ToneOutcome::Busy,
        }
    }

    async fn play_tone_guarded(&self, guard: ToneGuard) -> ToneOutcome {
        let Some(sender) = self.audio_sender() else {
            tracing::warn!("No audio sender bound, skipping tone");
            return ToneOutcome::Skipped;
        };
        let Some(original) = sender.track().await.filter(LocalTrack::is_live) else {
            tracing::warn!("Audio sender has no live track, skipping tone");
            return ToneOutcome::Skipped;
        };

        let tone = match self.tone_source.synthesize(&self.tone_spec, &original).await {
            Ok(tone) => tone,
            Err(e) => {
                tracing::warn!("Failed to synthesize tone: {}", e);
                return ToneOutcome::Failed;
            }
        };

        let mut restore = Restore::new(Arc::clone(&sender), original, guard);
        let swapped = sender.replace_track(Some(tone.track().clone())).await;
        let tone = restore.tone.insert(tone);

        let mut outcome = ToneOutcome::Played;
        match swapped {
            Ok(()) => {
                let cut = self.tone_cut.notified();
                tokio::pin!(cut);
                cut.as_mut().enable();

                if self.is_muted() {
                    tracing::debug!("Muted before tone started, restoring");
                } else {
                    tone.start();
                    tracing::debug!("Playing tone on {}", tone.track().id());
                    tokio::select! {
                        _ = tokio::time::sleep(self.tone_spec.duration) => {}
                        _ = &mut cut => tracing::debug!("Tone cut short by mute"),
                    }
                }
            }
            Err(e) => {
                // Der Sender kann trotzdem schon auf dem Ton stehen
                tracing::warn!("Failed to swap to tone track: {}", e);
                outcome = ToneOutcome::Failed;
            }
        }

        if let Err(e) = restore.finish().await {
            tracing::error!("Failed to restore original track: {}", e);
            outcome = ToneOutcome::Failed;
        }
        outcome
    }
}

impl Drop for TrackCoordinator {
    /// Beendet die ausgehenden Tracks, damit deren Capture-Forwarder enden
    fn drop(&mut self) {
        for track in self.outbound.tracks() {
            track.stop();
        }
        tracing::debug!("Outbound stream {} stopped", self.outbound.id());
    }
}

impl std::fmt::Debug for TrackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackCoordinator")
            .field("outbound", &self.outbound.id())
            .field("tone_enabled", &self.tone_enabled)
            .field("muted", &self.is_muted())
            .field("tone_in_progress", &self.is_tone_playing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::tone::TONE_DURATION;
    use crate::test_support::{audio_track, video_track, MockPeerEngine, MockSender, MockToneSource};
    use std::time::Duration;

    fn coordinator(tone_enabled: bool, tones: Arc<MockToneSource>) -> (Arc<TrackCoordinator>, LocalTrack) {
        let mic = audio_track("mic");
        let stream = LocalStream::new("pulse", vec![mic.clone()]);
        (
            Arc::new(TrackCoordinator::new(stream, tone_enabled, tones)),
            mic,
        )
    }

    fn bind_sender(coordinator: &TrackCoordinator, track: &LocalTrack) -> Arc<MockSender> {
        let sender = Arc::new(MockSender::new(Some(track.clone())));
        *coordinator.audio_sender.lock() = Some(Arc::clone(&sender) as Arc<dyn MediaSender>);
        sender
    }

    async fn settle() {
        tokio::time::sleep(TONE_DURATION + Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_rising_edge_plays_tone() {
        let tones = Arc::new(MockToneSource::new());
        let (coordinator, mic) = coordinator(true, Arc::clone(&tones));
        let sender = bind_sender(&coordinator, &mic);

        // Startzustand ist laut
        assert!(!coordinator.set_mute(false));
        assert!(!coordinator.set_mute(true));
        assert!(!coordinator.set_mute(true));
        assert!(!mic.is_enabled());
        settle().await;
        assert_eq!(tones.synthesized(), 0);
        assert!(sender.replacements().is_empty());

        assert!(coordinator.set_mute(false));
        assert!(mic.is_enabled());
        settle().await;
        assert_eq!(tones.synthesized(), 1);
        assert!(!coordinator.is_tone_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_tone() {
        let tones = Arc::new(MockToneSource::new());
        let (coordinator, mic) = coordinator(true, Arc::clone(&tones));
        let sender = bind_sender(&coordinator, &mic);

        coordinator.set_mute(true);
        assert!(coordinator.set_mute(false));
        coordinator.set_mute(true);
        assert!(!coordinator.set_mute(false));
        assert!(!coordinator.set_mute(false));
        settle().await;

        assert_eq!(tones.synthesized(), 1);
        let replacements = sender.replacements();
        assert_eq!(replacements.len(), 2);
        assert_eq!(replacements[1].as_deref(), Some("mic"));
        assert_eq!(sender.current_track_id().as_deref(), Some("mic"));
        assert!(!coordinator.is_tone_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tone_disabled_never_plays() {
        let tones = Arc::new(MockToneSource::new());
        let (coordinator, mic) = coordinator(false, Arc::clone(&tones));
        bind_sender(&coordinator, &mic);

        coordinator.set_mute(true);
        assert!(!coordinator.set_mute(false));
        settle().await;
        assert_eq!(tones.synthesized(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_after_failed_swap() {
        let tones = Arc::new(MockToneSource::new());
        let (coordinator, mic) = coordinator(true, tones);
        let sender = bind_sender(&coordinator, &mic);
        sender.fail_next_replace();

        assert_eq!(coordinator.play_tone().await, ToneOutcome::Failed);

        let replacements = sender.replacements();
        assert_eq!(replacements.len(), 2);
        assert!(replacements[0].as_deref().is_some_and(|id| id.starts_with("tone")));
        assert_eq!(sender.current_track_id().as_deref(), Some("mic"));
        assert!(!coordinator.is_tone_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tone_waits_full_duration() {
        let tones = Arc::new(MockToneSource::new());
        let (coordinator, mic) = coordinator(true, tones);
        let sender = bind_sender(&coordinator, &mic);

        let started = tokio::time::Instant::now();
        assert_eq!(coordinator.play_tone().await, ToneOutcome::Played);
        assert!(started.elapsed() >= TONE_DURATION);
        assert_eq!(sender.current_track_id().as_deref(), Some("mic"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_without_sender_or_live_track() {
        let tones = Arc::new(MockToneSource::new());
        let (coordinator, mic) = coordinator(true, Arc::clone(&tones));

        assert_eq!(coordinator.play_tone().await, ToneOutcome::Skipped);
        assert!(!coordinator.is_tone_playing());

        bind_sender(&coordinator, &mic);
        mic.stop();
        assert_eq!(coordinator.play_tone().await, ToneOutcome::Skipped);
        assert_eq!(tones.synthesized(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_failure_clears_flag() {
        let tones = Arc::new(MockToneSource::new());
        tones.fail(true);
        let (coordinator, mic) = coordinator(true, Arc::clone(&tones));
        let sender = bind_sender(&coordinator, &mic);

        assert_eq!(coordinator.play_tone().await, ToneOutcome::Failed);
        assert!(!coordinator.is_tone_playing());
        assert!(sender.replacements().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_cuts_tone_short() {
        let tones = Arc::new(MockToneSource::new());
        let (coordinator, mic) = coordinator(true, Arc::clone(&tones));
        let sender = bind_sender(&coordinator, &mic);

        let started = tokio::time::Instant::now();
        coordinator.set_mute(true);
        assert!(coordinator.set_mute(false));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sender.current_track_id().unwrap().starts_with("tone"));

        coordinator.set_mute(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sender.current_track_id().as_deref(), Some("mic"));
        assert!(!coordinator.is_tone_playing());
        assert!(started.elapsed() < TONE_DURATION);
        assert!(!mic.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_tone_restores_original() {
        let tones = Arc::new(MockToneSource::new());
        let (coordinator, mic) = coordinator(true, tones);
        let sender = bind_sender(&coordinator, &mic);

        let task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.play_tone().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sender.current_track_id().unwrap().starts_with("tone"));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sender.current_track_id().as_deref(), Some("mic"));
        assert!(!coordinator.is_tone_playing());
    }

    #[test]
    fn test_drop_stops_outbound_tracks() {
        let (coordinator, mic) = coordinator(false, Arc::new(MockToneSource::new()));
        assert!(mic.is_live());
        drop(coordinator);
        assert!(!mic.is_live());
    }

    #[tokio::test]
    async fn test_bind_picks_first_audio_sender() {
        let stream = LocalStream::new(
            "pulse",
            vec![video_track("cam"), audio_track("mic-1"), audio_track("mic-2")],
        );
        let coordinator = TrackCoordinator::new(stream, false, Arc::new(MockToneSource::new()));
        let peer = MockPeerEngine::new();

        assert_eq!(coordinator.bind_outbound_tracks(&peer).await.unwrap(), 3);
        assert_eq!(peer.added_tracks(), vec!["cam", "mic-1", "mic-2"]);

        let sender = coordinator.audio_sender().unwrap();
        assert_eq!(sender.track().await.unwrap().id(), "mic-1");

        coordinator.unbind();
        assert!(coordinator.audio_sender().is_none());
    }
}
