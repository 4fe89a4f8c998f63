//! Local media capture
//!
//! Hardware access sits behind the [`MediaSource`] trait. The
//! [`MediaCaptureManager`] owns the single captured stream of a session and is
//! the only component allowed to flip its track-enabled flags. Every peer
//! connection shares the same [`LocalMedia`] through an `Arc`, so a mute is
//! visible to all of them at once without renegotiation.

use crate::types::{MediaConstraints, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused access to camera or microphone
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Requested device is missing or busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A stream is already held by this manager
    #[error("Local media already acquired")]
    AlreadyAcquired,
}

/// Opaque handle to a captured hardware stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    /// Source-assigned stream identifier
    pub id: String,
    /// Stream carries a microphone track
    pub audio: bool,
    /// Stream carries a camera track
    pub video: bool,
}

/// Capability interface over the host's capture devices
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open camera and/or microphone according to `constraints`
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::PermissionDenied`] or
    /// [`MediaError::DeviceUnavailable`]
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<StreamHandle, MediaError>;

    /// Enable or disable one track without closing the device
    fn set_track_enabled(&self, stream: &StreamHandle, kind: TrackKind, enabled: bool);

    /// Stop all tracks of the stream and free the hardware
    fn release(&self, stream: &StreamHandle);

    /// Source type name for logging
    fn source_type(&self) -> &'static str {
        "unknown"
    }
}

/// Captured local stream shared read-only by every peer connection
#[derive(Debug)]
pub struct LocalMedia {
    handle: StreamHandle,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    released: AtomicBool,
}

impl LocalMedia {
    fn new(handle: StreamHandle, muted: bool, camera_off: bool) -> Self {
        Self {
            audio_enabled: AtomicBool::new(handle.audio && !muted),
            video_enabled: AtomicBool::new(handle.video && !camera_off),
            released: AtomicBool::new(false),
            handle,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.handle.id
    }

    /// Underlying hardware handle
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Whether the stream has a microphone track
    pub fn has_audio(&self) -> bool {
        self.handle.audio
    }

    /// Whether the stream has a camera track
    pub fn has_video(&self) -> bool {
        self.handle.video
    }

    /// Whether microphone samples are currently sent
    pub fn is_audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Acquire)
    }

    /// Whether camera frames are currently sent
    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Acquire)
    }

    /// Whether the hardware has been released
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MediaPreferences {
    muted: bool,
    camera_off: bool,
}

/// Owner of the local camera/microphone stream
///
/// Mute and camera-off preferences outlive a single stream: toggling while no
/// stream is held records the preference and it is applied to the next
/// acquired stream.
pub struct MediaCaptureManager {
    source: Arc<dyn MediaSource>,
    current: Mutex<Option<Arc<LocalMedia>>>,
    preferences: Mutex<MediaPreferences>,
}

impl MediaCaptureManager {
    /// Create a manager over a media source
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            current: Mutex::new(None),
            preferences: Mutex::new(MediaPreferences::default()),
        }
    }

    /// Acquire camera and microphone
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::AlreadyAcquired`] if a stream is held, otherwise
    /// whatever the source reports
    #[tracing::instrument(skip(self), fields(source = self.source.source_type()))]
    pub async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<LocalMedia>, MediaError> {
        if self.current.lock().is_some() {
            return Err(MediaError::AlreadyAcquired);
        }

        let handle = self.source.acquire(constraints).await?;
        let prefs = *self.preferences.lock();
        let media = Arc::new(LocalMedia::new(handle, prefs.muted, prefs.camera_off));

        {
            let mut current = self.current.lock();
            if current.is_some() {
                // Lost a race with a concurrent acquire
                drop(current);
                self.source.release(media.handle());
                return Err(MediaError::AlreadyAcquired);
            }
            *current = Some(media.clone());
        }

        if media.has_audio() {
            self.source
                .set_track_enabled(media.handle(), TrackKind::Audio, !prefs.muted);
        }
        if media.has_video() {
            self.source
                .set_track_enabled(media.handle(), TrackKind::Video, !prefs.camera_off);
        }

        tracing::info!(
            stream_id = %media.id(),
            audio = media.has_audio(),
            video = media.has_video(),
            "Local media acquired"
        );
        Ok(media)
    }

    /// Mute or unmute the microphone
    pub fn set_muted(&self, muted: bool) {
        self.preferences.lock().muted = muted;
        if let Some(media) = self.current.lock().as_ref() {
            if media.has_audio() {
                media.audio_enabled.store(!muted, Ordering::Release);
                self.source
                    .set_track_enabled(media.handle(), TrackKind::Audio, !muted);
            }
        }
        tracing::debug!(muted, "Microphone toggled");
    }

    /// Turn the camera off or on
    pub fn set_camera_off(&self, camera_off: bool) {
        self.preferences.lock().camera_off = camera_off;
        if let Some(media) = self.current.lock().as_ref() {
            if media.has_video() {
                media.video_enabled.store(!camera_off, Ordering::Release);
                self.source
                    .set_track_enabled(media.handle(), TrackKind::Video, !camera_off);
            }
        }
        tracing::debug!(camera_off, "Camera toggled");
    }

    /// Flip the mute flag and return the new value
    pub fn toggle_muted(&self) -> bool {
        let muted = !self.is_muted();
        self.set_muted(muted);
        muted
    }

    /// Flip the camera-off flag and return the new value
    pub fn toggle_camera_off(&self) -> bool {
        let camera_off = !self.is_camera_off();
        self.set_camera_off(camera_off);
        camera_off
    }

    /// Current mute preference
    pub fn is_muted(&self) -> bool {
        self.preferences.lock().muted
    }

    /// Current camera-off preference
    pub fn is_camera_off(&self) -> bool {
        self.preferences.lock().camera_off
    }

    /// Stop all hardware tracks
    ///
    /// Idempotent: releasing without a held stream does nothing.
    pub fn release(&self) {
        let taken = self.current.lock().take();
        if let Some(media) = taken {
            media.released.store(true, Ordering::Release);
            media.audio_enabled.store(false, Ordering::Release);
            media.video_enabled.store(false, Ordering::Release);
            self.source.release(media.handle());
            tracing::info!(stream_id = %media.id(), "Local media released");
        }
    }

    /// Whether a hardware stream is currently held
    pub fn is_active(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Currently held stream
    pub fn local_media(&self) -> Option<Arc<LocalMedia>> {
        self.current.lock().clone()
    }
}

impl Drop for MediaCaptureManager {
    fn drop(&mut self) {
        self.release();
    }
}

// Compile-time assertion: shared across peer tasks
#[allow(dead_code)]
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<LocalMedia>();
    assert_send_sync::<MediaCaptureManager>();
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSource {
        deny: bool,
        acquired: AtomicUsize,
        released: AtomicUsize,
        toggles: std::sync::Mutex<Vec<(TrackKind, bool)>>,
    }

    #[async_trait]
    impl MediaSource for CountingSource {
        async fn acquire(
            &self,
            constraints: &MediaConstraints,
        ) -> Result<StreamHandle, MediaError> {
            if self.deny {
                return Err(MediaError::PermissionDenied("camera blocked".to_string()));
            }
            let n = self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(StreamHandle {
                id: format!("stream-{n}"),
                audio: constraints.audio,
                video: constraints.video,
            })
        }

        fn set_track_enabled(&self, _stream: &StreamHandle, kind: TrackKind, enabled: bool) {
            self.toggles.lock().unwrap().push((kind, enabled));
        }

        fn release(&self, _stream: &StreamHandle) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let source = Arc::new(CountingSource::default());
        let manager = MediaCaptureManager::new(source.clone());

        let media = manager.acquire(&MediaConstraints::video_call()).await.unwrap();
        assert!(manager.is_active());
        assert!(media.is_audio_enabled());
        assert!(media.is_video_enabled());

        manager.release();
        assert!(!manager.is_active());
        assert!(media.is_released());
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let source = Arc::new(CountingSource::default());
        let manager = MediaCaptureManager::new(source.clone());
        manager.acquire(&MediaConstraints::audio_only()).await.unwrap();

        manager.release();
        manager.release();
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_acquire_rejected() {
        let source = Arc::new(CountingSource::default());
        let manager = MediaCaptureManager::new(source.clone());
        manager.acquire(&MediaConstraints::video_call()).await.unwrap();

        let second = manager.acquire(&MediaConstraints::video_call()).await;
        assert!(matches!(second, Err(MediaError::AlreadyAcquired)));
        assert_eq!(source.acquired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_holds_nothing() {
        let source = Arc::new(CountingSource {
            deny: true,
            ..Default::default()
        });
        let manager = MediaCaptureManager::new(source);

        let result = manager.acquire(&MediaConstraints::video_call()).await;
        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_mute_flips_shared_flag() {
        let source = Arc::new(CountingSource::default());
        let manager = MediaCaptureManager::new(source.clone());
        let media = manager.acquire(&MediaConstraints::video_call()).await.unwrap();
        let seen_by_peer = media.clone();

        assert!(manager.toggle_muted());
        assert!(!seen_by_peer.is_audio_enabled());
        assert!(seen_by_peer.is_video_enabled());

        assert!(manager.toggle_camera_off());
        assert!(!seen_by_peer.is_video_enabled());

        assert!(!manager.toggle_muted());
        assert!(seen_by_peer.is_audio_enabled());

        let toggles = source.toggles.lock().unwrap();
        assert!(toggles.contains(&(TrackKind::Audio, false)));
        assert!(toggles.contains(&(TrackKind::Video, false)));
    }

    #[tokio::test]
    async fn test_preferences_applied_on_acquire() {
        let source = Arc::new(CountingSource::default());
        let manager = MediaCaptureManager::new(source);

        manager.set_muted(true);
        let media = manager.acquire(&MediaConstraints::video_call()).await.unwrap();
        assert!(!media.is_audio_enabled());
        assert!(media.is_video_enabled());
        assert!(manager.is_muted());
    }

    #[tokio::test]
    async fn test_drop_releases_hardware() {
        let source = Arc::new(CountingSource::default());
        {
            let manager = MediaCaptureManager::new(source.clone());
            manager.acquire(&MediaConstraints::video_call()).await.unwrap();
        }
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
    }
}
