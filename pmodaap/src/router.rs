//! The request router: maps URL patterns to handlers, enforces
//! session/auth preconditions, and marshals results into the HTTP
//! writer.
//!
//! Grounded on `pmomediaserver::contentdirectory` (an action-name to
//! handler-fn dispatch table keyed off a small, fixed set of known
//! requests) generalized from SOAP action names to URL path patterns.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use pmoconfig::{AuthMethod, Credential};
use tracing::warn;

use crate::error::ErrorKind;
use crate::http::{query_u64, ParsedRequest, ResponseWriter};
use crate::library::{LibraryError, PlaylistListing, SharedLibrary};
use crate::playlist::PlaylistState;
use crate::revision::RevisionManager;
use crate::session::SessionManager;
use crate::tree;

/// Optional hooks the embedding application can observe. Every method
/// defaults to a no-op; errors returned from an implementation are
/// caught and logged, never allowed to interrupt the response (spec.md
/// §7's propagation policy for user-registered event handlers).
pub trait ServerEvents: std::fmt::Debug + Send + Sync {
    fn track_requested(&self, _track_id: u64) -> anyhow::Result<()> {
        Ok(())
    }
    fn database_requested(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn user_login(&self, _session_id: u32, _username: Option<&str>) -> anyhow::Result<()> {
        Ok(())
    }
    fn user_logout(&self, _session_id: u32) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct NoopEvents;
impl ServerEvents for NoopEvents {}

fn run_event(label: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(hook = label, error = %e, "event hook failed; response unaffected");
    }
}

/// All the shared, lock-protected state a single DAAP server instance
/// needs to answer requests. Owned by `crate::server::Server`; the
/// router holds only a non-owning `Arc`.
pub struct ServerState {
    pub library: SharedLibrary,
    pub sessions: SessionManager,
    pub revisions: RevisionManager,
    pub playlists: RwLock<std::collections::HashMap<u64, std::sync::Mutex<PlaylistState>>>,
    pub name: String,
    pub auth_method: AuthMethod,
    pub credentials: Vec<Credential>,
    pub session_timeout: Duration,
    pub events: Arc<dyn ServerEvents>,
    pub running: AtomicBool,
    /// The root track set's ids as of the last observed library change,
    /// used to compute the deletion set the revision manager records for
    /// the *next* change (spec.md §4.6's "bounded map deletions: revision
    /// → set<item_id> for the root track set", distinct from the
    /// per-playlist deletion history `PlaylistState` owns).
    root_snapshot: std::sync::Mutex<Vec<u64>>,
}

impl ServerState {
    pub fn new(
        library: SharedLibrary,
        name: String,
        auth_method: AuthMethod,
        credentials: Vec<Credential>,
        max_users: usize,
        session_timeout: Duration,
        events: Option<Arc<dyn ServerEvents>>,
    ) -> Self {
        let root_snapshot = library.iter_tracks().iter().map(|t| t.item_id).collect();
        Self {
            library,
            sessions: SessionManager::new(max_users),
            revisions: RevisionManager::new(),
            playlists: RwLock::new(std::collections::HashMap::new()),
            name,
            auth_method,
            credentials,
            session_timeout,
            events: events.unwrap_or_else(|| Arc::new(NoopEvents)),
            running: AtomicBool::new(true),
            root_snapshot: std::sync::Mutex::new(root_snapshot),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.revisions.stop();
    }

    /// Invoked whenever the library adapter reports a mutation (see
    /// `crate::library::LibraryProvider::subscribe_changes`). Diffs the
    /// adapter's current root track ids against the last-observed
    /// snapshot, bumps the revision with whatever is now missing, and
    /// stores the new snapshot — independent of, and simpler than, the
    /// per-playlist diff `PlaylistState` performs on demand.
    pub fn record_library_change(&self) {
        let current: Vec<u64> = self.library.iter_tracks().iter().map(|t| t.item_id).collect();
        let mut snapshot = self.root_snapshot.lock().unwrap();
        let removed: Vec<u64> = snapshot.iter().filter(|id| !current.contains(id)).copied().collect();
        *snapshot = current;
        drop(snapshot);
        self.revisions.bump(removed);
    }

    fn check_credentials(&self, basic_auth: Option<(Option<String>, String)>) -> Result<Option<String>, ErrorKind> {
        match self.auth_method {
            AuthMethod::None => Ok(basic_auth.and_then(|(u, _)| u)),
            AuthMethod::Password => match basic_auth {
                Some((username, password)) if self.credentials.iter().any(|c| c.password == password) => {
                    Ok(username)
                }
                _ => Err(ErrorKind::Unauthorized),
            },
            AuthMethod::UserAndPassword => match basic_auth {
                Some((Some(username), password))
                    if self
                        .credentials
                        .iter()
                        .any(|c| c.username.as_deref() == Some(username.as_str()) && c.password == password) =>
                {
                    Ok(Some(username))
                }
                _ => Err(ErrorKind::Unauthorized),
            },
        }
    }

    /// The adapter's own playlists, with the implicit base playlist (id
    /// 1, "all tracks") prepended if the adapter didn't already report
    /// one — it "always exists" per spec.md §4.4 whether or not the
    /// adapter enumerates it explicitly.
    fn effective_playlists(&self) -> Vec<PlaylistListing> {
        let mut playlists = self.library.iter_playlists();
        if !playlists.iter().any(|p| p.playlist_id == 1) {
            let all_ids: Vec<u64> = self.library.iter_tracks().iter().map(|t| t.item_id).collect();
            playlists.insert(
                0,
                PlaylistListing {
                    playlist_id: 1,
                    name: self.library.database_name().to_string(),
                    track_ids: all_ids,
                },
            );
        }
        playlists
    }

    fn lookup_playlist(&self, id: u64) -> Option<PlaylistListing> {
        if id == 1 {
            return self.effective_playlists().into_iter().find(|p| p.playlist_id == 1);
        }
        self.library.lookup_playlist(id)
    }
}

/// Maps a track's format hint to an audio MIME type. Unknown/unlisted
/// extensions fall back to a generic octet stream type rather than
/// guessing wrong.
pub fn audio_mime_for_format(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "opus" => "audio/opus",
        "m4a" | "aac" => "audio/aac",
        "wav" => "audio/wav",
        "aiff" | "aif" => "audio/aiff",
        _ => "application/octet-stream",
    }
}

pub struct Router {
    pub state: Arc<ServerState>,
}

impl Router {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Dispatches one parsed request, writing the full response.
    /// Returns `true` if the connection should be closed afterward.
    pub fn dispatch(&self, req: &ParsedRequest, peer: SocketAddr, stream: &mut TcpStream) -> std::io::Result<bool> {
        let state = &self.state;
        let mut writer = ResponseWriter::new(stream, &state.name);

        let segments: Vec<&str> = req.path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            ["server-info"] => {
                let node = tree::server_info(&state.name, state.auth_method, state.session_timeout.as_secs() as u32, 1);
                writer.write_dmap(&node)?;
                Ok(false)
            }
            ["content-codes"] => {
                writer.write_dmap(&tree::content_codes())?;
                Ok(false)
            }
            ["login"] => self.handle_login(req, peer, &mut writer),
            ["logout"] => self.handle_logout(req, &mut writer),
            ["update"] => self.handle_update(req, &mut writer),
            ["databases"] => self.with_session(req, &mut writer, |_| {
                let track_count = state.library.iter_tracks().len() as u32;
                let node = tree::databases(state.library.database_id(), state.library.database_name(), track_count);
                Ok(Some(node))
            }),
            ["databases", db, "items"] => self.with_session(req, &mut writer, |_| {
                self.handle_items(req, db).map(Some)
            }),
            // These two write raw bytes rather than a DMAP node, so they
            // can't go through `with_session`; they check the session
            // precondition themselves before touching the library.
            ["databases", db, "items", track_file] => {
                self.handle_stream(req, db, track_file, &mut writer)
            }
            ["databases", db, "items", track_file, "extra_data", "artwork"] => {
                self.handle_artwork(req, db, track_file, &mut writer)
            }
            ["databases", db, "containers"] => self.with_session(req, &mut writer, |_| {
                self.handle_containers(db).map(Some)
            }),
            ["databases", db, "containers", pl, "items"] => self.with_session(req, &mut writer, |_| {
                self.handle_container_items(req, db, pl).map(Some)
            }),
            _ => {
                writer.write_error_empty_body(&ErrorKind::ForbiddenNoSession)?;
                Ok(false)
            }
        }
    }

    /// Shared precondition for every endpoint except `/server-info`,
    /// `/content-codes`, and `/login`: a known `session-id` query
    /// parameter, read under the sessions lock (spec.md §9's fix for
    /// the original's unguarded read).
    fn with_session<W: std::io::Write, F>(
        &self,
        req: &ParsedRequest,
        writer: &mut ResponseWriter<W>,
        handler: F,
    ) -> std::io::Result<bool>
    where
        F: FnOnce(u32) -> Result<Option<pmodmap::ContentNode>, ErrorKind>,
    {
        let session_id = req.query.get("session-id").and_then(|v| v.parse::<u32>().ok());
        let Some(session_id) = session_id else {
            writer.write_error(&ErrorKind::ForbiddenNoSession)?;
            return Ok(false);
        };
        if !self.state.sessions.exists(session_id) {
            writer.write_error(&ErrorKind::ForbiddenNoSession)?;
            return Ok(false);
        }
        self.state.sessions.touch(session_id);

        match handler(session_id) {
            Ok(Some(node)) => {
                writer.write_dmap(&node)?;
                Ok(false)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                writer.write_error(&e)?;
                Ok(false)
            }
        }
    }

    fn handle_login(&self, req: &ParsedRequest, peer: SocketAddr, writer: &mut ResponseWriter<TcpStream>) -> std::io::Result<bool> {
        let state = &self.state;

        let username = match state.check_credentials(req.basic_auth.clone()) {
            Ok(username) => username,
            Err(ErrorKind::Unauthorized) => {
                writer.write_auth_challenge(&state.name)?;
                return Ok(false);
            }
            Err(other) => {
                writer.write_error(&other)?;
                return Ok(false);
            }
        };

        for expired_id in state.sessions.expire_idle(state.session_timeout) {
            run_event("user_logout", state.events.user_logout(expired_id));
        }

        match state.sessions.login(peer, username.clone()) {
            Ok(session_id) => {
                run_event("user_login", state.events.user_login(session_id, username.as_deref()));
                writer.write_dmap(&tree::login(session_id))?;
                Ok(false)
            }
            Err(ErrorKind::TooManyUsers) => {
                writer.write_error(&ErrorKind::TooManyUsers)?;
                Ok(false)
            }
            Err(other) => {
                writer.write_error(&other)?;
                Ok(false)
            }
        }
    }

    fn handle_logout(&self, req: &ParsedRequest, writer: &mut ResponseWriter<TcpStream>) -> std::io::Result<bool> {
        let state = &self.state;
        let session_id = req.query.get("session-id").and_then(|v| v.parse::<u32>().ok());
        match session_id.filter(|id| state.sessions.exists(*id)) {
            Some(id) => {
                state.sessions.logout(id);
                run_event("user_logout", state.events.user_logout(id));
                writer.write_dmap(&tree::logout())?;
                Ok(true)
            }
            None => {
                writer.write_error(&ErrorKind::ForbiddenNoSession)?;
                Ok(false)
            }
        }
    }

    fn handle_update(&self, req: &ParsedRequest, writer: &mut ResponseWriter<TcpStream>) -> std::io::Result<bool> {
        let state = &self.state;
        let session_id = req.query.get("session-id").and_then(|v| v.parse::<u32>().ok());
        let Some(session_id) = session_id.filter(|id| state.sessions.exists(*id)) else {
            writer.write_error(&ErrorKind::ForbiddenNoSession)?;
            return Ok(false);
        };
        state.sessions.touch(session_id);

        let client_rev = query_u64(&req.query, "revision-number");
        let observed = state.revisions.wait_for_update(client_rev);
        if !state.is_running() {
            writer.write_error(&ErrorKind::NotFound)?;
            return Ok(false);
        }
        writer.write_dmap(&tree::update(observed))?;
        Ok(false)
    }

    fn handle_items(&self, req: &ParsedRequest, db: &str) -> Result<pmodmap::ContentNode, ErrorKind> {
        let state = &self.state;
        let db_id: u64 = db.parse().map_err(|_| ErrorKind::MalformedRequest)?;
        if db_id != state.library.database_id() {
            return Err(ErrorKind::MalformedRequest);
        }
        run_event("database_requested", state.events.database_requested());

        let meta_param = req.query.get("meta").cloned().unwrap_or_default();
        let meta: Vec<&str> = meta_param.split(',').filter(|s| !s.is_empty()).collect();
        let delta = query_u64(&req.query, "delta");

        let tracks = state.library.iter_tracks();
        let node = if delta == 0 {
            tree::track_listing(&tracks, &meta, 0, None)
        } else {
            let deleted = state.revisions.deleted_since(delta);
            tree::track_listing(&tracks, &meta, 1, Some(&deleted))
        };
        Ok(node)
    }

    fn handle_stream(
        &self,
        req: &ParsedRequest,
        db: &str,
        track_file: &str,
        writer: &mut ResponseWriter<TcpStream>,
    ) -> std::io::Result<bool> {
        let state = &self.state;
        let session_id = req.query.get("session-id").and_then(|v| v.parse::<u32>().ok());
        let Some(session_id) = session_id.filter(|id| state.sessions.exists(*id)) else {
            writer.write_error(&ErrorKind::ForbiddenNoSession)?;
            return Ok(false);
        };
        state.sessions.touch(session_id);

        let Ok(db_id) = db.parse::<u64>() else {
            writer.write_error(&ErrorKind::MalformedRequest)?;
            return Ok(false);
        };
        if db_id != state.library.database_id() {
            writer.write_error(&ErrorKind::MalformedRequest)?;
            return Ok(false);
        }
        let track_id = track_file.split('.').next().and_then(|s| s.parse::<u64>().ok());
        let Some(track_id) = track_id else {
            writer.write_error(&ErrorKind::MalformedRequest)?;
            return Ok(false);
        };
        let Some(track) = state.library.lookup_track(track_id) else {
            writer.write_error(&ErrorKind::MalformedRequest)?;
            return Ok(false);
        };
        run_event("track_requested", state.events.track_requested(track_id));

        let offset = req.range_start.unwrap_or(0);
        match state.library.open_audio(&track, offset) {
            Ok(mut stream) => {
                let mime = audio_mime_for_format(&track.format);
                writer.write_file(&mut *stream.reader, stream.length, offset, mime)?;
                Ok(false)
            }
            Err(LibraryError::OpenAudioFailed(msg)) => {
                warn!(track_id, error = %msg, "failed to open audio stream");
                writer.write_error(&ErrorKind::Internal("no file".to_string()))?;
                Ok(false)
            }
            Err(other) => {
                warn!(track_id, error = %other, "library error opening audio stream");
                writer.write_error(&ErrorKind::Internal("no file".to_string()))?;
                Ok(false)
            }
        }
    }

    fn handle_artwork(
        &self,
        req: &ParsedRequest,
        db: &str,
        track_file: &str,
        writer: &mut ResponseWriter<TcpStream>,
    ) -> std::io::Result<bool> {
        let state = &self.state;
        let session_id = req.query.get("session-id").and_then(|v| v.parse::<u32>().ok());
        let Some(session_id) = session_id.filter(|id| state.sessions.exists(*id)) else {
            writer.write_error(&ErrorKind::ForbiddenNoSession)?;
            return Ok(false);
        };
        state.sessions.touch(session_id);

        let Ok(db_id) = db.parse::<u64>() else {
            writer.write_error(&ErrorKind::MalformedRequest)?;
            return Ok(true);
        };
        if db_id != state.library.database_id() {
            writer.write_error(&ErrorKind::MalformedRequest)?;
            return Ok(true);
        }
        let track_id = track_file.split('.').next().and_then(|s| s.parse::<u64>().ok());
        let Some(track_id) = track_id else {
            writer.write_error(&ErrorKind::MalformedRequest)?;
            return Ok(true);
        };
        let Some(track) = state.library.lookup_track(track_id) else {
            writer.write_error(&ErrorKind::MalformedRequest)?;
            return Ok(true);
        };
        match state.library.get_artwork(&track) {
            Some((bytes, mime)) => writer.write_artwork(&bytes, &mime)?,
            None => writer.write_error(&ErrorKind::NotFound)?,
        }
        Ok(true)
    }

    fn handle_containers(&self, db: &str) -> Result<pmodmap::ContentNode, ErrorKind> {
        let state = &self.state;
        let db_id: u64 = db.parse().map_err(|_| ErrorKind::MalformedRequest)?;
        if db_id != state.library.database_id() {
            return Err(ErrorKind::MalformedRequest);
        }
        let playlists = state.effective_playlists();
        let pairs: Vec<(&PlaylistListing, u32)> = playlists.iter().map(|p| (p, p.track_ids.len() as u32)).collect();
        Ok(tree::playlist_listing(&pairs))
    }

    fn handle_container_items(&self, req: &ParsedRequest, db: &str, pl: &str) -> Result<pmodmap::ContentNode, ErrorKind> {
        let state = &self.state;
        let db_id: u64 = db.parse().map_err(|_| ErrorKind::MalformedRequest)?;
        if db_id != state.library.database_id() {
            return Err(ErrorKind::MalformedRequest);
        }
        let playlist_id: u64 = pl.parse().map_err(|_| ErrorKind::MalformedRequest)?;
        let listing = state.lookup_playlist(playlist_id).ok_or(ErrorKind::MalformedRequest)?;

        let mut playlists = state.playlists.write().unwrap();
        let entry = playlists
            .entry(playlist_id)
            .or_insert_with(|| std::sync::Mutex::new(PlaylistState::new(playlist_id, listing.name.clone())));
        let mut pl_state = entry.lock().unwrap();
        let removed = pl_state.refresh(&listing.track_ids);

        let delta = query_u64(&req.query, "delta");
        let node = if delta == 0 {
            tree::playlist_items(pl_state.entries(), 0, None)
        } else {
            tree::playlist_items(pl_state.entries(), 1, Some(&removed))
        };
        Ok(node)
    }
}
