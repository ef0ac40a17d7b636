//! The DAAP server core: session/revision/playlist state, the HTTP/1.1
//! subset transport, the request router, and mDNS advertisement.
//!
//! Wire encoding and the content-code registry live in `pmodmap`, kept
//! endpoint-agnostic; this crate supplies the DAAP-specific semantics on
//! top of it and the [`Server`] that wires everything into a running
//! process (see `src/main.rs`, the `daap-server` binary).

pub mod advertiser;
pub mod error;
pub mod library;
pub mod playlist;
pub mod revision;
pub mod router;
pub mod server;
pub mod session;
pub mod tree;

pub mod http;

pub use error::ErrorKind;
pub use library::{AudioStream, LibraryError, LibraryProvider, PlaylistEntry, PlaylistListing, SharedLibrary, Track};
pub use router::{ServerEvents, ServerState};
pub use server::Server;
