//! The library adapter interface: the only capabilities the core
//! requires from the music-library collaborator.
//!
//! Grounded on `pmosource::MusicSource`: a small `Debug + Send + Sync`
//! trait with a handful of default-free methods and a typed leaf error.

use std::io::Read;
use std::sync::Arc;

/// Errors the library adapter may report back to the core.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("track {0} not found")]
    TrackNotFound(u64),
    #[error("playlist {0} not found")]
    PlaylistNotFound(u64),
    #[error("failed to open audio stream: {0}")]
    OpenAudioFailed(String),
}

pub type Result<T> = std::result::Result<T, LibraryError>;

/// A readable, seekable-enough audio byte stream plus its total length.
/// The HTTP writer reads from `stream` starting wherever the caller has
/// already positioned it (see `open_audio`'s `offset` parameter).
pub struct AudioStream {
    pub reader: Box<dyn Read + Send>,
    pub length: u64,
}

/// Opaque track entity produced by the library adapter.
#[derive(Debug, Clone)]
pub struct Track {
    pub item_id: u64,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub track_number: u16,
    pub disc_number: u16,
    pub duration_ms: u32,
    /// File extension used as the stream's format hint (e.g. "mp3").
    pub format: String,
    pub bitrate_kbps: u16,
    /// Opaque token the adapter can reopen via `open_audio`.
    pub file_locator: String,
    pub artwork_locator: Option<String>,
}

/// A playlist entry: a track's membership in a specific playlist.
/// `container_id` is playlist-local and assigned by the playlist diff
/// engine, not by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub item_id: u64,
    pub container_id: u32,
}

/// A playlist as reported by the adapter: just its identity and the
/// authoritative, ordered sequence of member track ids. The core derives
/// container ids itself (see `crate::playlist::PlaylistState`).
#[derive(Debug, Clone)]
pub struct PlaylistListing {
    pub playlist_id: u64,
    pub name: String,
    pub track_ids: Vec<u64>,
}

/// The abstraction the core consumes. Out of scope: enumeration details,
/// audio decoding, and persistence all live on the other side of this
/// trait.
pub trait LibraryProvider: std::fmt::Debug + Send + Sync {
    fn database_id(&self) -> u64;
    fn database_name(&self) -> &str;

    fn iter_tracks(&self) -> Vec<Track>;
    fn lookup_track(&self, id: u64) -> Option<Track>;

    /// Playlist 1 ("all tracks") always exists even if not returned here;
    /// callers should treat it as implicit if absent.
    fn iter_playlists(&self) -> Vec<PlaylistListing>;
    fn lookup_playlist(&self, id: u64) -> Option<PlaylistListing>;

    fn open_audio(&self, track: &Track, offset: u64) -> Result<AudioStream>;

    /// Artwork bytes and MIME subtype (e.g. `("...", "jpeg")`), if any.
    fn get_artwork(&self, track: &Track) -> Option<(Vec<u8>, String)>;

    /// Registers a callback the adapter invokes whenever the library
    /// mutates (a track or playlist added, removed, or reordered). The
    /// core uses this to bump the revision counter; it never polls.
    /// Adapters that never mutate after construction can leave this as
    /// the default no-op.
    fn subscribe_changes(&self, _callback: Box<dyn Fn() + Send + Sync>) {}
}

pub type SharedLibrary = Arc<dyn LibraryProvider>;
