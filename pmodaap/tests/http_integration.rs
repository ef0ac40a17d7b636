//! End-to-end tests over a real loopback `TcpStream`, exercising the
//! full accept loop → router → DMAP encoding path rather than calling
//! the router's internals directly.
//!
//! Grounded on SPEC_FULL.md §10.4's test-tooling note: an in-memory
//! `LibraryProvider` stub stands in for `pmoplaylist`/`pmocache`'s
//! `tempfile` on-disk fixtures, since this crate's library adapter is an
//! in-memory trait rather than a filesystem.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pmodaap::{AudioStream, LibraryError, LibraryProvider, PlaylistListing, Server, ServerState, Track};
use pmoconfig::AuthMethod;

struct FixtureLibrary {
    tracks: Mutex<Vec<Track>>,
    on_change: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl std::fmt::Debug for FixtureLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureLibrary").field("tracks", &self.tracks.lock().unwrap().len()).finish()
    }
}

impl FixtureLibrary {
    fn new() -> Self {
        Self {
            on_change: Mutex::new(None),
            tracks: Mutex::new(vec![
                Track {
                    item_id: 1,
                    title: "One".into(),
                    artist: "Artist".into(),
                    album: "Album".into(),
                    genre: "Rock".into(),
                    track_number: 1,
                    disc_number: 1,
                    duration_ms: 1000,
                    format: "mp3".into(),
                    bitrate_kbps: 320,
                    file_locator: "fixture://1".into(),
                    artwork_locator: None,
                },
                Track {
                    item_id: 2,
                    title: "Two".into(),
                    artist: "Artist".into(),
                    album: "Album".into(),
                    genre: "Rock".into(),
                    track_number: 2,
                    disc_number: 1,
                    duration_ms: 2000,
                    format: "mp3".into(),
                    bitrate_kbps: 320,
                    file_locator: "fixture://2".into(),
                    artwork_locator: None,
                },
            ]),
        }
    }

    /// Removes `id` from the catalog and notifies the subscribed
    /// callback, mirroring how a real adapter would report a mutation.
    fn remove_track(&self, id: u64) {
        self.tracks.lock().unwrap().retain(|t| t.item_id != id);
        if let Some(callback) = self.on_change.lock().unwrap().as_ref() {
            callback();
        }
    }
}

impl LibraryProvider for FixtureLibrary {
    fn database_id(&self) -> u64 {
        1
    }

    fn database_name(&self) -> &str {
        "Fixture"
    }

    fn iter_tracks(&self) -> Vec<Track> {
        self.tracks.lock().unwrap().clone()
    }

    fn lookup_track(&self, id: u64) -> Option<Track> {
        self.tracks.lock().unwrap().iter().find(|t| t.item_id == id).cloned()
    }

    fn iter_playlists(&self) -> Vec<PlaylistListing> {
        Vec::new()
    }

    fn lookup_playlist(&self, _id: u64) -> Option<PlaylistListing> {
        None
    }

    fn open_audio(&self, _track: &Track, _offset: u64) -> Result<AudioStream, LibraryError> {
        Err(LibraryError::OpenAudioFailed("fixture has no audio bytes".to_string()))
    }

    fn get_artwork(&self, _track: &Track) -> Option<(Vec<u8>, String)> {
        None
    }

    fn subscribe_changes(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.on_change.lock().unwrap() = Some(callback);
    }
}

fn start_test_server() -> (Arc<Server>, SocketAddr) {
    let (server, addr, _library) = start_test_server_with_library();
    (server, addr)
}

fn start_test_server_with_library() -> (Arc<Server>, SocketAddr, Arc<FixtureLibrary>) {
    let library = Arc::new(FixtureLibrary::new());
    let shared: pmodaap::SharedLibrary = library.clone();
    let state = Arc::new(ServerState::new(
        shared,
        "Integration Test".to_string(),
        AuthMethod::None,
        vec![],
        0,
        Duration::from_secs(1800),
        None,
    ));
    let server = Arc::new(Server::new(state));
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let bound = server.listen(addr).expect("listen should succeed");
    (server, bound, library)
}

/// Reads a full HTTP response, returning the raw body bytes rather than
/// lossy UTF-8 — needed to decode a DMAP body.
fn send_request_raw(addr: SocketAddr, request: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("connect should succeed");
    stream.write_all(request.as_bytes()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" || line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).unwrap();
    (status_line, body)
}

fn send_request(addr: SocketAddr, request: &str) -> (String, String) {
    let mut stream = TcpStream::connect(addr).expect("connect should succeed");
    stream.write_all(request.as_bytes()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();

    let mut headers = String::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" || line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
        headers.push_str(&line);
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).unwrap();
    (status_line, String::from_utf8_lossy(&body).into_owned())
}

#[test]
fn server_info_returns_200_with_dmap_body() {
    let (server, addr) = start_test_server();
    let (status, _body) = send_request(addr, "GET /server-info HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(status.starts_with("HTTP/1.1 200"), "got: {status}");
    server.stop();
}

#[test]
fn login_then_databases_then_logout_flow() {
    let (server, addr) = start_test_server();

    let (login_status, login_body) =
        send_request(addr, "GET /login HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(login_status.starts_with("HTTP/1.1 200"), "login: {login_status}");
    // mlid is a tagged uint32; the raw session id bytes are embedded in
    // the DMAP body rather than parsed here — this test only asserts the
    // login path accepts an unauthenticated request under AuthMethod::None
    // and returns a well-formed response body.
    assert!(!login_body.is_empty());

    let (databases_status, _) =
        send_request(addr, "GET /databases?session-id=1 HTTP/1.1\r\nConnection: close\r\n\r\n");
    // An arbitrary session id is rejected (403) since this test doesn't
    // parse the real id out of the binary login body; this still
    // exercises the with_session precondition path end-to-end.
    assert!(databases_status.starts_with("HTTP/1.1 403"), "databases: {databases_status}");

    server.stop();
}

#[test]
fn unknown_path_returns_403() {
    let (server, addr) = start_test_server();
    let (status, _) = send_request(addr, "GET /nonexistent HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(status.starts_with("HTTP/1.1 403"), "got: {status}");
    server.stop();
}

/// Scenario 1 (handshake), the `/update` half: a long-poll blocks until
/// the library adapter reports a change, at which point the revision the
/// server observes has advanced past what the client already held.
#[test]
fn library_change_wakes_a_blocked_update_long_poll() {
    let (server, addr, library) = start_test_server_with_library();

    let (login_status, login_body) =
        send_request_raw(addr, "GET /login HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(login_status.starts_with("HTTP/1.1 200"), "login: {login_status}");
    let login_node =
        pmodmap::decode(&login_body, |code| pmodmap::codes::lookup(code).map(|e| e.kind)).unwrap();
    let pmodmap::NodeValue::Container(login_children) = login_node.value else { panic!("expected container") };
    let mlid = login_children.iter().find(|c| c.code == "mlid").expect("mlid present");
    let pmodmap::NodeValue::Uint32(session_id) = mlid.value else { panic!("expected uint32 mlid") };

    let update_request = format!(
        "GET /update?session-id={session_id}&revision-number=1 HTTP/1.1\r\nConnection: close\r\n\r\n"
    );
    let waiter = std::thread::spawn(move || send_request_raw(addr, &update_request));

    std::thread::sleep(Duration::from_millis(100));
    library.remove_track(2);

    let (status, body) = waiter.join().expect("update request thread should not panic");
    assert!(status.starts_with("HTTP/1.1 200"), "got: {status}");

    let node = pmodmap::decode(&body, |code| pmodmap::codes::lookup(code).map(|e| e.kind)).unwrap();
    assert_eq!(node.code, "mupd");
    let pmodmap::NodeValue::Container(children) = node.value else { panic!("expected container") };
    let musr = children.iter().find(|c| c.code == "musr").expect("musr present");
    assert_eq!(musr.value, pmodmap::NodeValue::Uint32(2));

    server.stop();
}

#[test]
fn content_codes_lists_the_bundled_registry() {
    let (server, addr) = start_test_server();
    let (status, body) = send_request(addr, "GET /content-codes HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(status.starts_with("HTTP/1.1 200"), "got: {status}");
    assert!(!body.is_empty());
    server.stop();
}
