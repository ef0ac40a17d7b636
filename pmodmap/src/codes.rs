//! The content code registry: the compatibility contract with clients.
//!
//! Integer widths are determined here, by the code, never by the runtime
//! value being encoded.

/// Wire type of a content code, as reported by `/content-codes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmapType {
    UInt8 = 1,
    UInt16 = 3,
    UInt32 = 5,
    UInt64 = 7,
    String = 9,
    Bytes = 13,
    Timestamp = 10,
    Version = 11,
    Container = 12,
}

/// One entry of the content code registry: the 4-byte tag, its
/// human-readable DMAP name, and its wire type.
#[derive(Debug, Clone, Copy)]
pub struct CodeEntry {
    pub code: &'static str,
    pub name: &'static str,
    pub kind: DmapType,
}

const fn entry(code: &'static str, name: &'static str, kind: DmapType) -> CodeEntry {
    CodeEntry { code, name, kind }
}

/// The fixed code bag bundled with the server. `/content-codes`
/// enumerates exactly this table.
pub static CODE_BAG: &[CodeEntry] = &[
    entry("mstt", "dmap.status", DmapType::UInt32),
    entry("muty", "dmap.updatetype", DmapType::UInt8),
    entry("mtco", "dmap.specifiedtotalcount", DmapType::UInt32),
    entry("mrco", "dmap.returnedcount", DmapType::UInt32),
    entry("mlcl", "dmap.listing", DmapType::Container),
    entry("mlit", "dmap.listingitem", DmapType::Container),
    entry("miid", "dmap.itemid", DmapType::UInt32),
    entry("minm", "dmap.itemname", DmapType::String),
    entry("mper", "dmap.persistentid", DmapType::UInt64),
    entry("mimc", "dmap.itemcount", DmapType::UInt32),
    entry("apso", "daap.playlistsongs", DmapType::Container),
    entry("aply", "daap.databaseplaylists", DmapType::Container),
    entry("mupd", "dmap.updateresponse", DmapType::Container),
    entry("musr", "dmap.serverrevision", DmapType::UInt32),
    entry("mudl", "dmap.deletedidlisting", DmapType::Container),
    entry("mlog", "dmap.loginresponse", DmapType::Container),
    entry("mlid", "dmap.sessionid", DmapType::UInt32),
    entry("msrv", "dmap.serverinforesponse", DmapType::Container),
    entry("mccr", "dmap.contentcodesresponse", DmapType::Container),
    entry("mdcl", "dmap.dictionary", DmapType::Container),
    entry("mcnm", "dmap.contentcodesnumber", DmapType::String),
    entry("mcna", "dmap.contentcodesname", DmapType::String),
    entry("mcty", "dmap.contentcodestype", DmapType::UInt16),
    entry("avdb", "daap.serverdatabases", DmapType::Container),
    entry("adbs", "daap.databasesongs", DmapType::Container),
    entry("apro", "daap.protocolversion", DmapType::Version),
    entry("mpro", "dmap.protocolversion", DmapType::Version),
    entry("msau", "dmap.authenticationmethod", DmapType::UInt8),
    entry("mstm", "dmap.timeoutinterval", DmapType::UInt32),
    entry("msdc", "dmap.databasescount", DmapType::UInt32),
    entry("mqty", "dmap.supportedquerylanguages", DmapType::UInt32),
    entry("mdbk", "dmap.databasekind", DmapType::UInt8),
    entry("mdst", "daap.database.id", DmapType::UInt32),
    entry("mcti", "dmap.containeritemid", DmapType::UInt32),
    // daap.* per-track metadata, selected by the `meta` query parameter.
    entry("asal", "daap.songalbum", DmapType::String),
    entry("asar", "daap.songartist", DmapType::String),
    entry("asgn", "daap.songgenre", DmapType::String),
    entry("astn", "daap.songtracknumber", DmapType::UInt16),
    entry("asdn", "daap.songdiscnumber", DmapType::UInt16),
    entry("astm", "daap.songtime", DmapType::UInt32),
    entry("asfm", "daap.songformat", DmapType::String),
    entry("asbr", "daap.songbitrate", DmapType::UInt16),
    entry("ascp", "daap.songcomposer", DmapType::String),
    entry("asco", "daap.songcompilation", DmapType::UInt8),
    entry("asyr", "daap.songyear", DmapType::UInt16),
];

/// Looks up a code's registry entry.
pub fn lookup(code: &str) -> Option<&'static CodeEntry> {
    CODE_BAG.iter().find(|e| e.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_bag_has_no_duplicate_codes() {
        let mut seen = std::collections::HashSet::new();
        for entry in CODE_BAG {
            assert!(seen.insert(entry.code), "duplicate code {}", entry.code);
        }
    }

    #[test]
    fn required_listing_codes_are_present() {
        for code in ["mstt", "muty", "mtco", "mrco", "mlcl", "mlit", "miid", "minm"] {
            assert!(lookup(code).is_some(), "missing required code {code}");
        }
    }
}
