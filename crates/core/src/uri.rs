//! Source URI grammar: `scheme://host/path?k1=v1&k2=v2&...`.
//!
//! `scheme` selects a reader type; the query carries reader-specific options
//! plus the canonical keys every reader understands (`name`, `codec`,
//! `sampleformat`, `chunk_ms`, `controlscript`, `controlscriptparams`).

use std::collections::HashMap;

use crate::error::{SnapError, SnapResult};

/// Reader variant selected by a [`StreamUri`]'s scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderScheme {
    Pipe,
    File,
    Process,
    Tcp,
    Alsa,
    Jack,
    Pipewire,
    Airplay,
    Librespot,
    Spotify,
    Meta,
}

impl ReaderScheme {
    fn parse(s: &str) -> SnapResult<Self> {
        Ok(match s {
            "pipe" => Self::Pipe,
            "file" => Self::File,
            "process" => Self::Process,
            "tcp" => Self::Tcp,
            "alsa" => Self::Alsa,
            "jack" => Self::Jack,
            "pipewire" => Self::Pipewire,
            "airplay" => Self::Airplay,
            "librespot" => Self::Librespot,
            "spotify" => Self::Spotify,
            "meta" => Self::Meta,
            other => return Err(SnapError::InvalidArgument(format!("unknown source scheme '{other}'"))),
        })
    }
}

/// A parsed stream source URI.
#[derive(Debug, Clone)]
pub struct StreamUri {
    pub scheme: ReaderScheme,
    pub path: String,
    options: HashMap<String, String>,
}

impl StreamUri {
    /// Parses `scheme://path?k=v&...`. Query keys and values are not
    /// percent-decoded: stream-reader URIs in practice never carry reserved
    /// characters.
    pub fn parse(raw: &str) -> SnapResult<Self> {
        let (scheme_str, rest) = raw
            .split_once("://")
            .ok_or_else(|| SnapError::InvalidArgument(format!("missing scheme in URI '{raw}'")))?;
        let scheme = ReaderScheme::parse(scheme_str)?;

        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };

        let mut options = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => {
                        options.insert(k.to_string(), v.to_string());
                    }
                    None => {
                        options.insert(pair.to_string(), String::new());
                    }
                }
            }
        }

        Ok(Self { scheme, path: path.to_string(), options })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.options.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    pub fn get_u32(&self, key: &str) -> SnapResult<Option<u32>> {
        self.get(key)
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|_| SnapError::InvalidArgument(format!("'{key}' must be an integer, got '{v}'")))
            })
            .transpose()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        }
    }

    /// Canonical `name` key, defaulting to the scheme-specific path when absent.
    pub fn name(&self) -> String {
        self.get_or("name", &self.path)
    }

    pub fn codec(&self) -> Option<&str> {
        self.get("codec")
    }

    pub fn sample_format(&self) -> Option<&str> {
        self.get("sampleformat")
    }

    pub fn chunk_ms(&self) -> SnapResult<u32> {
        Ok(self.get_u32("chunk_ms")?.unwrap_or(crate::protocol_constants::DEFAULT_CHUNK_MS))
    }

    /// `(script_path, params)` if this source has a `controlscript` key.
    pub fn control_script(&self) -> Option<(String, String)> {
        self.get("controlscript")
            .map(|script| (script.to_string(), self.get_or("controlscriptparams", "")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_path_and_query() {
        let uri = StreamUri::parse("pipe:///tmp/t?name=x&codec=pcm&sampleformat=48000:16:2&chunk_ms=20").unwrap();
        assert_eq!(uri.scheme, ReaderScheme::Pipe);
        assert_eq!(uri.path, "/tmp/t");
        assert_eq!(uri.name(), "x");
        assert_eq!(uri.codec(), Some("pcm"));
        assert_eq!(uri.sample_format(), Some("48000:16:2"));
        assert_eq!(uri.chunk_ms().unwrap(), 20);
    }

    #[test]
    fn defaults_chunk_ms_when_absent() {
        let uri = StreamUri::parse("pipe:///tmp/t").unwrap();
        assert_eq!(uri.chunk_ms().unwrap(), 20);
    }

    #[test]
    fn name_defaults_to_path() {
        let uri = StreamUri::parse("file:///tmp/audio.pcm").unwrap();
        assert_eq!(uri.name(), "/tmp/audio.pcm");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(StreamUri::parse("ftp://host").is_err());
    }

    #[test]
    fn rejects_missing_scheme_separator() {
        assert!(StreamUri::parse("not-a-uri").is_err());
    }

    #[test]
    fn tcp_scheme_specific_keys() {
        let uri = StreamUri::parse("tcp://0.0.0.0?mode=server&port=4953").unwrap();
        assert_eq!(uri.get("mode"), Some("server"));
        assert_eq!(uri.get_u32("port").unwrap(), Some(4953));
    }
}
