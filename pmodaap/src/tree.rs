//! Content-tree builders: pure functions over the library adapter and
//! revision state that build the canonical DMAP subtree for each
//! endpoint.
//!
//! Grounded on `pmomediaserver::contentdirectory::actions::browse` /
//! `pmoqobuz::didl::ToDIDL` (entity-to-tree conversion functions, one
//! builder per response shape, no implicit field selection) generalized
//! from DIDL-Lite XML to DMAP containers.

use pmoconfig::AuthMethod;
use pmodmap::{codes, ContentNode, Version};

use crate::library::{PlaylistEntry, PlaylistListing, Track};

/// DMAP wire protocol version advertised at `/server-info`.
pub const DMAP_VERSION: Version = Version::new(2, 0);
/// DAAP wire protocol version advertised at `/server-info`.
pub const DAAP_VERSION: Version = Version::new(3, 12);

fn auth_method_code(auth: AuthMethod) -> u8 {
    match auth {
        AuthMethod::None => 0,
        AuthMethod::Password => 1,
        AuthMethod::UserAndPassword => 2,
    }
}

/// `/server-info` → `msrv`.
pub fn server_info(name: &str, auth: AuthMethod, timeout_secs: u32, database_count: u32) -> ContentNode {
    ContentNode::container(
        "msrv",
        vec![
            ContentNode::uint32("mstt", 200),
            ContentNode::version("mpro", DMAP_VERSION.major, DMAP_VERSION.minor),
            ContentNode::version("apro", DAAP_VERSION.major, DAAP_VERSION.minor),
            ContentNode::string("minm", name),
            ContentNode::uint8("msau", auth_method_code(auth)),
            ContentNode::uint32("mstm", timeout_secs),
            ContentNode::uint32("msdc", database_count),
            // No query language support beyond plain listing; 0 = none advertised.
            ContentNode::uint32("mqty", 0),
        ],
    )
}

/// `/content-codes` → `mccr`, enumerating the bundled code bag verbatim.
pub fn content_codes() -> ContentNode {
    let mut children = vec![ContentNode::uint32("mstt", 200)];
    for entry in codes::CODE_BAG {
        children.push(ContentNode::container(
            "mdcl",
            vec![
                ContentNode::string("mcnm", entry.code),
                ContentNode::string("mcna", entry.name),
                ContentNode::uint16("mcty", entry.kind as u16),
            ],
        ));
    }
    ContentNode::container("mccr", children)
}

/// `/login` → `mlog`.
pub fn login(session_id: u32) -> ContentNode {
    ContentNode::container(
        "mlog",
        vec![
            ContentNode::uint32("mstt", 200),
            ContentNode::uint32("mlid", session_id),
        ],
    )
}

/// `/logout` → `mlog`, status only; no session id echoed back.
pub fn logout() -> ContentNode {
    ContentNode::container("mlog", vec![ContentNode::uint32("mstt", 200)])
}

/// `/update` → `mupd`.
pub fn update(revision: u64) -> ContentNode {
    ContentNode::container(
        "mupd",
        vec![
            ContentNode::uint32("mstt", 200),
            ContentNode::uint32("musr", revision as u32),
        ],
    )
}

/// `/databases` → `avdb`, listing exactly the one served database.
pub fn databases(db_id: u64, db_name: &str, track_count: u32) -> ContentNode {
    let entry = ContentNode::container(
        "mlit",
        vec![
            ContentNode::uint32("miid", db_id as u32),
            ContentNode::string("minm", db_name),
            ContentNode::uint32("mimc", track_count),
        ],
    );
    ContentNode::container(
        "avdb",
        vec![
            ContentNode::uint32("mstt", 200),
            ContentNode::uint8("muty", 0),
            ContentNode::uint32("mtco", 1),
            ContentNode::uint32("mrco", 1),
            ContentNode::container("mlcl", vec![entry]),
        ],
    )
}

/// Resolves one comma-separated `meta` field (a DMAP name such as
/// `dmap.itemname`) to the track field it selects. Unknown names are
/// silently ignored by the caller.
fn track_field(track: &Track, dmap_name: &str) -> Option<ContentNode> {
    match dmap_name {
        "dmap.itemid" => Some(ContentNode::uint32("miid", track.item_id as u32)),
        "dmap.itemname" => Some(ContentNode::string("minm", track.title.clone())),
        "dmap.persistentid" => Some(ContentNode::uint64("mper", track.item_id)),
        "daap.songalbum" => Some(ContentNode::string("asal", track.album.clone())),
        "daap.songartist" => Some(ContentNode::string("asar", track.artist.clone())),
        "daap.songgenre" => Some(ContentNode::string("asgn", track.genre.clone())),
        "daap.songtracknumber" => Some(ContentNode::uint16("astn", track.track_number)),
        "daap.songdiscnumber" => Some(ContentNode::uint16("asdn", track.disc_number)),
        "daap.songtime" => Some(ContentNode::uint32("astm", track.duration_ms)),
        "daap.songformat" => Some(ContentNode::string("asfm", track.format.clone())),
        "daap.songbitrate" => Some(ContentNode::uint16("asbr", track.bitrate_kbps)),
        _ => None,
    }
}

/// Builds one `mlit` for a track, selecting fields named in `meta`
/// (comma-separated DMAP names). Unknown names are ignored; `miid` is
/// always included so a client can at least identify the row.
fn track_item(track: &Track, meta: &[&str]) -> ContentNode {
    let mut children = vec![ContentNode::uint32("miid", track.item_id as u32)];
    for name in meta {
        if *name == "dmap.itemid" {
            continue; // already emitted above
        }
        if let Some(node) = track_field(track, name) {
            children.push(node);
        }
    }
    ContentNode::container("mlit", children)
}

/// `/databases/{db}/items` → `adbs`.
///
/// `updatetype` is 0 for a full listing, 1 for a delta. `deleted_ids` is
/// only emitted (as `mudl`) for deltas.
pub fn track_listing(
    tracks: &[Track],
    meta: &[&str],
    updatetype: u8,
    deleted_ids: Option<&[u64]>,
) -> ContentNode {
    let total = tracks.len() as u32;
    let listing: Vec<ContentNode> = tracks.iter().map(|t| track_item(t, meta)).collect();

    let mut children = vec![
        ContentNode::uint32("mstt", 200),
        ContentNode::uint8("muty", updatetype),
        ContentNode::uint32("mtco", total),
        ContentNode::uint32("mrco", total),
        ContentNode::container("mlcl", listing),
    ];

    if let Some(deleted) = deleted_ids {
        let deleted_nodes = deleted.iter().map(|id| ContentNode::uint32("miid", *id as u32)).collect();
        children.push(ContentNode::container("mudl", deleted_nodes));
    }

    ContentNode::container("adbs", children)
}

/// `/databases/{db}/containers` → `aply`.
pub fn playlist_listing(playlists: &[(&PlaylistListing, u32)]) -> ContentNode {
    let total = playlists.len() as u32;
    let listing = playlists
        .iter()
        .map(|(pl, item_count)| {
            ContentNode::container(
                "mlit",
                vec![
                    ContentNode::uint32("miid", pl.playlist_id as u32),
                    ContentNode::string("minm", pl.name.clone()),
                    ContentNode::uint32("mimc", *item_count),
                ],
            )
        })
        .collect();

    ContentNode::container(
        "aply",
        vec![
            ContentNode::uint32("mstt", 200),
            ContentNode::uint8("muty", 0),
            ContentNode::uint32("mtco", total),
            ContentNode::uint32("mrco", total),
            ContentNode::container("mlcl", listing),
        ],
    )
}

/// `/databases/{db}/containers/{pl}/items` → `apso`.
pub fn playlist_items(
    entries: &[PlaylistEntry],
    updatetype: u8,
    deleted_ids: Option<&[u64]>,
) -> ContentNode {
    let total = entries.len() as u32;
    let listing = entries
        .iter()
        .map(|e| {
            ContentNode::container(
                "mlit",
                vec![
                    ContentNode::uint32("miid", e.item_id as u32),
                    ContentNode::uint32("mcti", e.container_id),
                ],
            )
        })
        .collect();

    let mut children = vec![
        ContentNode::uint32("mstt", 200),
        ContentNode::uint8("muty", updatetype),
        ContentNode::uint32("mtco", total),
        ContentNode::uint32("mrco", total),
        ContentNode::container("mlcl", listing),
    ];

    if let Some(deleted) = deleted_ids {
        let deleted_nodes = deleted.iter().map(|id| ContentNode::uint32("miid", *id as u32)).collect();
        children.push(ContentNode::container("mudl", deleted_nodes));
    }

    ContentNode::container("apso", children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmodmap::encode;

    fn track(id: u64, title: &str) -> Track {
        Track {
            item_id: id,
            title: title.to_string(),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            genre: "Rock".to_string(),
            track_number: 1,
            disc_number: 1,
            duration_ms: 1000,
            format: "mp3".to_string(),
            bitrate_kbps: 320,
            file_locator: format!("{id}.mp3"),
            artwork_locator: None,
        }
    }

    #[test]
    fn server_info_reports_database_count_and_name() {
        let node = server_info("Test", AuthMethod::None, 1800, 1);
        assert_eq!(node.code, "msrv");
        let bytes = encode(&node);
        assert!(bytes.len() > 8);
    }

    #[test]
    fn content_codes_enumerates_required_codes() {
        let node = content_codes();
        let pmodmap::NodeValue::Container(children) = node.value else {
            panic!("expected container");
        };
        let names: Vec<&str> = children
            .iter()
            .filter_map(|c| match &c.value {
                pmodmap::NodeValue::Container(grandchildren) => grandchildren.iter().find_map(|g| {
                    if let pmodmap::NodeValue::String(s) = &g.value {
                        (g.code == "mcnm").then_some(s.as_str())
                    } else {
                        None
                    }
                }),
                _ => None,
            })
            .collect();
        for required in ["miid", "minm", "mstt"] {
            assert!(names.contains(&required), "missing {required}");
        }
    }

    #[test]
    fn track_listing_full_selects_only_requested_meta_fields() {
        let tracks = vec![track(1, "A"), track(2, "B"), track(3, "C")];
        let node = track_listing(&tracks, &["dmap.itemid", "dmap.itemname"], 0, None);
        assert_eq!(node.code, "adbs");
        let pmodmap::NodeValue::Container(children) = &node.value else { panic!() };
        let mtco = children.iter().find(|c| c.code == "mtco").unwrap();
        assert_eq!(mtco.value, pmodmap::NodeValue::Uint32(3));
        let mlcl = children.iter().find(|c| c.code == "mlcl").unwrap();
        let pmodmap::NodeValue::Container(items) = &mlcl.value else { panic!() };
        assert_eq!(items.len(), 3);
        let pmodmap::NodeValue::Container(first_fields) = &items[0].value else { panic!() };
        // Only miid + minm requested.
        assert_eq!(first_fields.len(), 2);
    }

    #[test]
    fn track_listing_delta_includes_deletion_listing() {
        let tracks = vec![track(1, "A"), track(3, "C")];
        let node = track_listing(&tracks, &["dmap.itemid"], 1, Some(&[2]));
        let pmodmap::NodeValue::Container(children) = &node.value else { panic!() };
        let muty = children.iter().find(|c| c.code == "muty").unwrap();
        assert_eq!(muty.value, pmodmap::NodeValue::Uint8(1));
        let mudl = children.iter().find(|c| c.code == "mudl").expect("mudl present");
        let pmodmap::NodeValue::Container(deleted) = &mudl.value else { panic!() };
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].value, pmodmap::NodeValue::Uint32(2));
    }

    #[test]
    fn playlist_items_carries_item_and_container_ids() {
        let entries = vec![
            PlaylistEntry { item_id: 10, container_id: 1 },
            PlaylistEntry { item_id: 30, container_id: 3 },
        ];
        let node = playlist_items(&entries, 0, None);
        let pmodmap::NodeValue::Container(children) = &node.value else { panic!() };
        let mlcl = children.iter().find(|c| c.code == "mlcl").unwrap();
        let pmodmap::NodeValue::Container(items) = &mlcl.value else { panic!() };
        assert_eq!(items.len(), 2);
    }
}
