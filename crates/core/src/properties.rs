//! Stream identity and the MPRIS-ish properties record carried alongside it:
//! playback status, shuffle/loop/rate flags, `can_*` capability flags, and
//! optional track metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::SampleFormat;
use crate::uri::StreamUri;

/// Overall playback state a stream occupies. Distinct from [`PlaybackStatus`]
/// (which mirrors a *player's* transport status): this is the reader-driven
/// state machine of §4.C ("idle" on starvation, "playing" on non-silent
/// audio, "disabled" on a fatal codec/init failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Playing,
    Disabled,
}

/// Player transport status, reported in [`Properties`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
}

/// Track metadata, populated by a reader's metadata subchannel (Airplay's
/// pipe, Librespot's stderr scrape, or a control script's `GetProperties`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: Option<String>,
    pub artist: Option<Vec<String>>,
    pub album: Option<String>,
    /// Track duration, in seconds.
    pub duration: Option<f64>,
    /// A URL pointing at cached cover art, assigned by the image-cache
    /// collaborator once raw bytes have been handed off. Mutually exclusive
    /// with `art_data` in any message actually placed on the wire — see
    /// [`Properties::strip_art_data`].
    pub art_url: Option<String>,
    /// Raw cover-art bytes, present only transiently between a reader
    /// emitting them and the image cache assigning `art_url`. Never
    /// broadcast: [`Properties::strip_art_data`] removes it first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub art_data: Option<Vec<u8>>,
}

impl Metadata {
    /// Fills any field left `None` in `self` with the value from `previous`,
    /// the "enrich missing metadata from previous" rule of §4.E.
    pub fn enrich_from(&mut self, previous: &Metadata) {
        if self.title.is_none() {
            self.title = previous.title.clone();
        }
        if self.artist.is_none() {
            self.artist = previous.artist.clone();
        }
        if self.album.is_none() {
            self.album = previous.album.clone();
        }
        if self.duration.is_none() {
            self.duration = previous.duration;
        }
        if self.art_url.is_none() && self.art_data.is_none() {
            self.art_url = previous.art_url.clone();
        }
    }
}

/// `can_*` capability flags. A control operation whose flag is false is
/// rejected with the matching `CanXIsFalse` error (§7) before ever reaching
/// the stream-control script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_play: bool,
    pub can_pause: bool,
    pub can_seek: bool,
    pub can_go_next: bool,
    pub can_go_previous: bool,
    pub can_control: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            can_play: false,
            can_pause: false,
            can_seek: false,
            can_go_next: false,
            can_go_previous: false,
            can_control: false,
        }
    }
}

/// Per-stream properties: playback status, shuffle/loop/rate flags,
/// capability flags, and optional metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub playback_status: PlaybackStatus,
    pub shuffle: bool,
    #[serde(rename = "loop")]
    pub loop_status: LoopStatus,
    pub rate: f64,
    pub volume: u8,
    pub mute: bool,
    pub capabilities: Capabilities,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    None,
    Track,
    Playlist,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            playback_status: PlaybackStatus::Stopped,
            shuffle: false,
            loop_status: LoopStatus::None,
            rate: 1.0,
            volume: 100,
            mute: false,
            capabilities: Capabilities::default(),
            metadata: None,
        }
    }
}

impl Properties {
    /// Merges `new` into `self` following §4.E's `on_properties_changed`
    /// rule: take every field from `new`, but enrich absent metadata fields
    /// from what `self` already held.
    pub fn merge(&mut self, mut new: Properties) {
        if let Some(new_meta) = new.metadata.as_mut() {
            if let Some(prev_meta) = self.metadata.as_ref() {
                new_meta.enrich_from(prev_meta);
            }
        } else {
            new.metadata = self.metadata.clone();
        }
        *self = new;
    }

    /// Removes raw `art_data` from the outgoing broadcast copy. Called after
    /// the image cache has had a chance to turn it into an `art_url` (or
    /// immediately, if no cache collaborator is wired up — the bytes are
    /// then simply dropped rather than ever reaching a session).
    pub fn strip_art_data(&mut self) {
        if let Some(meta) = self.metadata.as_mut() {
            meta.art_data = None;
        }
    }

    pub fn art_data(&self) -> Option<&[u8]> {
        self.metadata.as_ref().and_then(|m| m.art_data.as_deref())
    }

    pub fn set_art_url(&mut self, url: String) {
        if let Some(meta) = self.metadata.as_mut() {
            meta.art_url = Some(url);
        }
    }
}

/// A server-side stream's identity: the things a client or the control plane
/// needs to address it by, independent of its live reader/encoder state.
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub id: String,
    pub uri: StreamUri,
    pub sample_format: SampleFormat,
    pub codec_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_enriches_missing_fields_from_previous() {
        let mut props = Properties::default();
        props.metadata = Some(Metadata {
            title: Some("Song A".into()),
            artist: Some(vec!["Artist".into()]),
            ..Default::default()
        });

        let update = Properties {
            metadata: Some(Metadata { title: Some("Song B".into()), ..Default::default() }),
            ..Properties::default()
        };
        props.merge(update);

        let meta = props.metadata.unwrap();
        assert_eq!(meta.title.as_deref(), Some("Song B"));
        assert_eq!(meta.artist, Some(vec!["Artist".to_string()]));
    }

    #[test]
    fn strip_art_data_drops_bytes_but_keeps_url() {
        let mut props = Properties::default();
        props.metadata = Some(Metadata {
            art_data: Some(vec![1, 2, 3]),
            art_url: Some("http://cache/1.jpg".into()),
            ..Default::default()
        });
        props.strip_art_data();
        let meta = props.metadata.unwrap();
        assert!(meta.art_data.is_none());
        assert_eq!(meta.art_url.as_deref(), Some("http://cache/1.jpg"));
    }

    #[test]
    fn set_art_url_after_cache_assigns_it() {
        let mut props = Properties::default();
        props.metadata = Some(Metadata { art_data: Some(vec![9]), ..Default::default() });
        props.set_art_url("http://cache/2.jpg".into());
        props.strip_art_data();
        let meta = props.metadata.unwrap();
        assert!(meta.art_data.is_none());
        assert_eq!(meta.art_url.as_deref(), Some("http://cache/2.jpg"));
    }
}

/// JSON passthrough helper: types used in persisted config that must not
/// clobber fields the core doesn't own (`server.json` schema, §6 `[ADD]`).
pub type JsonPassthrough = Value;
