//! Component E: a logical audio stream. Owns exactly one reader and one
//! encoder, tracks properties/capabilities, and fans encoded chunks out to
//! every subscribed listener (a session bound to this stream, in practice).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::chunk::{Chunk, SampleFormat};
use crate::codec::{make_encoder, Encoder};
use crate::control::{JsonRpcRequest, NullStreamControl, StreamControl};
use crate::error::{SnapError, SnapResult};
use crate::properties::{Capabilities, Properties, StreamState};
use crate::reader::{spawn_reader, ReaderEvent, ReaderHandle};
use crate::time::TimeVal;
use crate::uri::StreamUri;
use crate::wire::CodecHeaderBody;

fn ms_to_timeval(ms: i64) -> TimeVal {
    TimeVal::new((ms / 1000) as i32, ((ms % 1000) * 1000) as i32)
}

/// Hands raw cover-art bytes to an external collaborator, which returns a
/// URL the broadcast copy of `Properties` can reference instead of the raw
/// blob. Mirrors the `DeviceCapture`/`StreamControl` capability-seam pattern
/// already used for other out-of-scope externals.
#[async_trait]
pub trait ImageCache: Send + Sync {
    async fn cache(&self, stream_id: &str, bytes: &[u8]) -> SnapResult<String>;
}

/// No image-cache collaborator configured: cover art bytes are simply
/// dropped rather than ever reaching a session.
pub struct NullImageCache;

#[async_trait]
impl ImageCache for NullImageCache {
    async fn cache(&self, _stream_id: &str, _bytes: &[u8]) -> SnapResult<String> {
        Err(SnapError::CapabilityDenied("no image cache configured".into()))
    }
}

/// Events broadcast to every session bound to a stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    CodecHeader(CodecHeaderBody),
    Chunk { timestamp: TimeVal, payload: Bytes },
    PropertiesChanged(Properties),
    StateChanged(StreamState),
}

struct Running {
    reader: ReaderHandle,
    drive_task: JoinHandle<()>,
}

/// One logical audio stream: reader + encoder + properties, fanning encoded
/// chunks out over a broadcast channel every bound session subscribes to.
pub struct Stream {
    pub id: String,
    pub uri: StreamUri,
    sample_format: Mutex<SampleFormat>,
    codec_name: String,
    state: Mutex<StreamState>,
    properties: Mutex<Properties>,
    control: Arc<dyn StreamControl>,
    image_cache: Arc<dyn ImageCache>,
    events: broadcast::Sender<StreamEvent>,
    codec_header: Mutex<Option<CodecHeaderBody>>,
    running: Mutex<Option<Running>>,
}

impl Stream {
    /// Resolves the sample format and codec from the URI's canonical keys
    /// (falling back to 48000:16:2 / pcm) and constructs the stream in the
    /// `idle` state. The encoder is constructed but not yet `init`'d — that
    /// happens in [`Stream::start`], where an init failure disables the
    /// stream rather than failing construction.
    pub fn new(id: String, uri: StreamUri, control: Arc<dyn StreamControl>) -> SnapResult<Arc<Self>> {
        let (rate, bits, channels) = match uri.sample_format() {
            Some(s) => SampleFormat::parse(s)?,
            None => (None, None, None),
        };
        let format = SampleFormat::new(rate.unwrap_or(48000), bits.unwrap_or(16), channels.unwrap_or(2));
        let codec_name = uri.codec().unwrap_or("pcm").to_string();

        let (events, _rx) = broadcast::channel(256);
        Ok(Arc::new(Self {
            id,
            uri,
            sample_format: Mutex::new(format),
            codec_name,
            state: Mutex::new(StreamState::Idle),
            properties: Mutex::new(Properties::default()),
            control,
            image_cache: Arc::new(NullImageCache),
            events,
            codec_header: Mutex::new(None),
            running: Mutex::new(None),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn sample_format(&self) -> SampleFormat {
        *self.sample_format.lock()
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn properties(&self) -> Properties {
        self.properties.lock().clone()
    }

    pub fn codec_header(&self) -> Option<CodecHeaderBody> {
        self.codec_header.lock().clone()
    }

    /// Spawns the reader and the encode/fan-out loop. A codec init failure
    /// transitions the stream to `disabled` and returns the error (§7's "a
    /// codec init failure fails the whole stream").
    pub async fn start(self: &Arc<Self>) -> SnapResult<()> {
        let mut encoder = make_encoder(&self.codec_name)?;
        let format = self.sample_format();
        if let Err(err) = encoder.init(format) {
            *self.state.lock() = StreamState::Disabled;
            return Err(err);
        }
        let header = encoder.header();
        *self.codec_header.lock() = Some(header.clone());
        let _ = self.events.send(StreamEvent::CodecHeader(header));

        let (reader, mut rx) = spawn_reader(self.id.clone(), &self.uri, format)?;

        let server_settings = json!({ "streamId": self.id });
        let _ = self.control.start(&self.id, &server_settings).await;

        let this = Arc::clone(self);
        let drive_task = tokio::spawn(async move {
            let mut tv_encoded_chunk: Option<TimeVal> = None;
            while let Some(event) = rx.recv().await {
                match event {
                    ReaderEvent::Chunk(chunk) => {
                        this.handle_chunk(&mut *encoder, chunk, &mut tv_encoded_chunk);
                    }
                    ReaderEvent::StateChanged(state) => {
                        *this.state.lock() = state;
                        let _ = this.events.send(StreamEvent::StateChanged(state));
                    }
                    ReaderEvent::PropertiesChanged(props) => {
                        this.on_properties_changed(props).await;
                    }
                    ReaderEvent::Resync { lag_ms } => {
                        log::debug!("stream '{}' reader resynced, lag={lag_ms}ms", this.id);
                    }
                }
            }
        });

        *self.running.lock() = Some(Running { reader, drive_task });
        Ok(())
    }

    fn handle_chunk(&self, encoder: &mut dyn Encoder, chunk: Chunk, tv_encoded_chunk: &mut Option<TimeVal>) {
        let anchor = *tv_encoded_chunk.get_or_insert(chunk.timestamp);
        let mut tv = anchor;
        let events = self.events.clone();
        let mut on_encoded = |payload: Bytes, duration_ms: u64| {
            let _ = events.send(StreamEvent::Chunk { timestamp: tv, payload });
            tv = tv + ms_to_timeval(duration_ms as i64);
        };
        if let Err(err) = encoder.encode(&chunk, &mut on_encoded) {
            log::warn!("stream '{}' encode failed: {err}", self.id);
        }
        *tv_encoded_chunk = Some(tv);
    }

    /// Stops the reader and drive task; the encoder and properties are
    /// dropped with the stream itself.
    pub async fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.reader.stop().await;
            running.drive_task.abort();
        }
    }

    /// Merges `new` into the stream's current properties (enriching missing
    /// metadata fields from the previous value), hands any raw cover-art
    /// bytes to the image cache, strips them from the broadcast copy, and
    /// notifies listeners.
    pub async fn on_properties_changed(&self, mut new: Properties) {
        if let Some(art) = new.art_data().map(<[u8]>::to_vec) {
            match self.image_cache.cache(&self.id, &art).await {
                Ok(url) => new.set_art_url(url),
                Err(_) => {}
            }
        }
        new.strip_art_data();

        let merged = {
            let mut props = self.properties.lock();
            props.merge(new);
            props.clone()
        };
        let _ = self.events.send(StreamEvent::PropertiesChanged(merged));
    }

    fn capabilities(&self) -> Capabilities {
        self.properties.lock().capabilities
    }

    async fn command(&self, method: &str, params: Value) -> SnapResult<()> {
        self.control.command(JsonRpcRequest { method: method.into(), params }).await.map(|_| ())
    }

    pub async fn set_shuffle(&self, shuffle: bool) -> SnapResult<()> {
        if !self.capabilities().can_control {
            return Err(SnapError::CanControlIsFalse);
        }
        self.command("Control.SetShuffle", json!({ "shuffle": shuffle })).await
    }

    pub async fn set_loop_status(&self, status: &str) -> SnapResult<()> {
        if !self.capabilities().can_control {
            return Err(SnapError::CanControlIsFalse);
        }
        self.command("Control.SetLoopStatus", json!({ "loopStatus": status })).await
    }

    pub async fn set_volume(&self, volume: u8) -> SnapResult<()> {
        if !self.capabilities().can_control {
            return Err(SnapError::CanControlIsFalse);
        }
        self.command("Control.SetVolume", json!({ "volume": volume })).await
    }

    pub async fn set_mute(&self, mute: bool) -> SnapResult<()> {
        if !self.capabilities().can_control {
            return Err(SnapError::CanControlIsFalse);
        }
        self.command("Control.SetMute", json!({ "mute": mute })).await
    }

    pub async fn set_rate(&self, rate: f64) -> SnapResult<()> {
        if !self.capabilities().can_control {
            return Err(SnapError::CanControlIsFalse);
        }
        self.command("Control.SetRate", json!({ "rate": rate })).await
    }

    pub async fn set_position(&self, position_secs: f64) -> SnapResult<()> {
        if !self.capabilities().can_seek {
            return Err(SnapError::CanSeekIsFalse);
        }
        self.command("Control.SetPosition", json!({ "position": position_secs })).await
    }

    pub async fn seek(&self, offset_secs: f64) -> SnapResult<()> {
        if !self.capabilities().can_seek {
            return Err(SnapError::CanSeekIsFalse);
        }
        self.command("Control.Seek", json!({ "offset": offset_secs })).await
    }

    pub async fn next(&self) -> SnapResult<()> {
        if !self.capabilities().can_go_next {
            return Err(SnapError::CanGoNextIsFalse);
        }
        self.command("Control.Next", Value::Null).await
    }

    pub async fn previous(&self) -> SnapResult<()> {
        if !self.capabilities().can_go_previous {
            return Err(SnapError::CanGoPreviousIsFalse);
        }
        self.command("Control.Previous", Value::Null).await
    }

    pub async fn pause(&self) -> SnapResult<()> {
        if !self.capabilities().can_pause {
            return Err(SnapError::CanPauseIsFalse);
        }
        self.command("Control.Pause", Value::Null).await
    }

    pub async fn play(&self) -> SnapResult<()> {
        if !self.capabilities().can_play {
            return Err(SnapError::CanPlayIsFalse);
        }
        self.command("Control.Play", Value::Null).await
    }

    pub async fn play_pause(&self) -> SnapResult<()> {
        if !self.capabilities().can_play {
            return Err(SnapError::CanPlayIsFalse);
        }
        self.command("Control.PlayPause", Value::Null).await
    }

    pub async fn stop_playback(&self) -> SnapResult<()> {
        if !self.capabilities().can_play {
            return Err(SnapError::CanPlayIsFalse);
        }
        self.command("Control.Stop", Value::Null).await
    }
}

/// Builds a stream with no control script (`NullStreamControl`), the
/// default when a source URI carries no `controlscript` key.
pub fn uncontrolled(id: String, uri: StreamUri) -> SnapResult<Arc<Stream>> {
    Stream::new(id, uri, Arc::new(NullStreamControl))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_uri(extra: &str) -> StreamUri {
        StreamUri::parse(&format!("pipe:///tmp/does-not-exist?name=t&codec=pcm&sampleformat=48000:16:2{extra}")).unwrap()
    }

    #[test]
    fn new_stream_starts_idle_with_default_properties() {
        let stream = uncontrolled("s1".into(), test_uri("")).unwrap();
        assert_eq!(stream.state(), StreamState::Idle);
        assert_eq!(stream.properties().volume, 100);
    }

    #[tokio::test]
    async fn control_without_capability_is_denied() {
        let stream = uncontrolled("s1".into(), test_uri("")).unwrap();
        let err = stream.play().await.unwrap_err();
        assert!(matches!(err, SnapError::CanPlayIsFalse));
    }

    #[tokio::test]
    async fn control_with_capability_reaches_null_control_and_is_denied_there() {
        let stream = uncontrolled("s1".into(), test_uri("")).unwrap();
        {
            let mut props = stream.properties.lock();
            props.capabilities.can_play = true;
        }
        let err = stream.play().await.unwrap_err();
        assert!(matches!(err, SnapError::CapabilityDenied(_)));
    }

    #[tokio::test]
    async fn properties_changed_enriches_from_previous_and_broadcasts() {
        let stream = uncontrolled("s1".into(), test_uri("")).unwrap();
        let mut rx = stream.subscribe();

        stream
            .on_properties_changed(Properties {
                metadata: Some(crate::properties::Metadata { title: Some("A".into()), ..Default::default() }),
                ..Properties::default()
            })
            .await;
        stream
            .on_properties_changed(Properties {
                metadata: Some(crate::properties::Metadata { artist: Some(vec!["B".into()]), ..Default::default() }),
                ..Properties::default()
            })
            .await;

        let merged = stream.properties();
        let meta = merged.metadata.unwrap();
        assert_eq!(meta.title.as_deref(), Some("A"));
        assert_eq!(meta.artist, Some(vec!["B".to_string()]));

        // two PropertiesChanged events were broadcast
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn start_fails_stream_on_bad_opus_format() {
        let uri = StreamUri::parse("pipe:///tmp/x?codec=opus&sampleformat=44100:16:2").unwrap();
        let stream = uncontrolled("s1".into(), uri).unwrap();
        let err = stream.start().await.unwrap_err();
        assert!(matches!(err, SnapError::InvalidArgument(_)));
        assert_eq!(stream.state(), StreamState::Disabled);
    }
}
