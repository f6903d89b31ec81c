//! Renderer trait (§6): the seam between the client controller and a
//! device-backend collaborator (ALSA, CoreAudio, a test harness). Mirrors
//! the `StreamControl`/`ImageCache` capability-seam pattern already used for
//! other out-of-scope externals.

use async_trait::async_trait;

use crate::error::SnapResult;
use crate::time::TimeVal;

/// Consumes decoded PCM and plays it out at the scheduled steady-clock time.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn start(&self) -> SnapResult<()>;
    async fn stop(&self) -> SnapResult<()>;

    /// Hands `payload` (decoded PCM) to the renderer, to be played at
    /// `play_at` on the client's own steady clock.
    async fn write(&self, payload: bytes::Bytes, play_at: TimeVal) -> SnapResult<()>;

    async fn set_volume(&self, volume: u8) -> SnapResult<()>;
    async fn set_mute(&self, mute: bool) -> SnapResult<()>;
}

/// No device backend configured: accepts every call and discards the audio.
/// The default for headless test/reference clients.
pub struct NullRenderer;

#[async_trait]
impl Renderer for NullRenderer {
    async fn start(&self) -> SnapResult<()> {
        Ok(())
    }

    async fn stop(&self) -> SnapResult<()> {
        Ok(())
    }

    async fn write(&self, _payload: bytes::Bytes, _play_at: TimeVal) -> SnapResult<()> {
        Ok(())
    }

    async fn set_volume(&self, _volume: u8) -> SnapResult<()> {
        Ok(())
    }

    async fn set_mute(&self, _mute: bool) -> SnapResult<()> {
        Ok(())
    }
}
