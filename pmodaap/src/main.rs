//! The `daap-server` binary: reads configuration, builds a demo
//! in-memory library (the real adapter is out of scope, per spec.md's
//! Non-goals), starts the HTTP listener and mDNS advertisement, and
//! waits for Ctrl+C to shut down gracefully.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pmodaap::{AudioStream, LibraryError, LibraryProvider, PlaylistListing, Server, ServerState, Track};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// A small, fixed in-memory catalog demonstrating the `LibraryProvider`
/// contract. Real deployments supply their own adapter over an actual
/// music collection; building one is explicitly out of scope here.
#[derive(Debug)]
struct DemoLibrary {
    tracks: Vec<Track>,
}

impl DemoLibrary {
    fn new() -> Self {
        let tracks = vec![
            Track {
                item_id: 1,
                title: "Morning".to_string(),
                artist: "Example Artist".to_string(),
                album: "Example Album".to_string(),
                genre: "Ambient".to_string(),
                track_number: 1,
                disc_number: 1,
                duration_ms: 180_000,
                format: "mp3".to_string(),
                bitrate_kbps: 192,
                file_locator: "demo://1".to_string(),
                artwork_locator: None,
            },
            Track {
                item_id: 2,
                title: "Afternoon".to_string(),
                artist: "Example Artist".to_string(),
                album: "Example Album".to_string(),
                genre: "Ambient".to_string(),
                track_number: 2,
                disc_number: 1,
                duration_ms: 210_000,
                format: "mp3".to_string(),
                bitrate_kbps: 192,
                file_locator: "demo://2".to_string(),
                artwork_locator: None,
            },
        ];
        Self { tracks }
    }
}

impl LibraryProvider for DemoLibrary {
    fn database_id(&self) -> u64 {
        1
    }

    fn database_name(&self) -> &str {
        "Demo Library"
    }

    fn iter_tracks(&self) -> Vec<Track> {
        self.tracks.clone()
    }

    fn lookup_track(&self, id: u64) -> Option<Track> {
        self.tracks.iter().find(|t| t.item_id == id).cloned()
    }

    fn iter_playlists(&self) -> Vec<PlaylistListing> {
        Vec::new()
    }

    fn lookup_playlist(&self, _id: u64) -> Option<PlaylistListing> {
        None
    }

    fn open_audio(&self, _track: &Track, _offset: u64) -> Result<AudioStream, LibraryError> {
        Err(LibraryError::OpenAudioFailed(
            "the bundled demo library has no real audio behind it".to_string(),
        ))
    }

    fn get_artwork(&self, _track: &Track) -> Option<(Vec<u8>, String)> {
        None
    }
}

fn init_logging(config: &pmoconfig::Config) {
    let min_level = config.get_log_min_level().unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(min_level));
    let enable_console = config.get_log_enable_console().unwrap_or(true);

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if enable_console {
        subscriber.init();
    } else {
        subscriber.with_writer(std::io::sink).init();
    }
}

fn main() -> Result<()> {
    let config = pmoconfig::get_config();
    init_logging(&config);

    let name = config.get_name();
    let port = config.get_port();
    let auth_method = config.get_auth_method();
    let credentials = config.get_credentials().unwrap_or_default();
    let max_users = config.get_max_users().unwrap_or(0);
    let session_timeout = Duration::from_secs(config.get_session_timeout_secs());
    let machine_id = config.get_machine_id().unwrap_or_else(|| name.clone());
    let publish = config.get_publish().unwrap_or(true);

    let library: pmodaap::SharedLibrary = Arc::new(DemoLibrary::new());
    let state = Arc::new(ServerState::new(
        library,
        name.clone(),
        auth_method,
        credentials,
        max_users,
        session_timeout,
        None,
    ));

    let server = Arc::new(Server::new(state));
    let bind_addr = format!("0.0.0.0:{port}").parse()?;
    let bound = server.listen(bind_addr)?;
    info!(addr = %bound, "daap-server listening");

    if publish {
        if let Err(e) = server.advertise(&name, bound.port(), &machine_id) {
            error!(error = %e, "failed to advertise DAAP service over mDNS; continuing without it");
        }
    }

    let shutdown_server = Arc::clone(&server);
    ctrlc::set_handler(move || {
        info!("received interrupt signal, shutting down");
        shutdown_server.stop();
        std::process::exit(0);
    })?;

    info!("press Ctrl+C to stop");
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
