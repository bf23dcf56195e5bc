use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::net::SocketAddr;

use log::warn;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use crate::info_hash::InfoHash;

// query values are opaque to the uri layer, so everything outside the
// unreserved set gets escaped on the way out
const ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const TRACKER_SCHEMES: [&str; 3] = ["http", "https", "udp"];
const SEED_SCHEMES: [&str; 3] = ["http", "https", "ftp"];

/// A parsed magnet uri: everything a client needs to join a swarm before it
/// holds the torrent's metadata.
///
/// Trackers are kept in tiers (BEP 12): unnumbered `tr=` keys form tier 0,
/// `tr.N=` keys form one tier per `N`, emitted in ascending order. The flat
/// tracker list visible through [`MagnetDescriptor::trackers`] is always the
/// in-order concatenation of the tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetDescriptor {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub exact_length: Option<u64>,
    pub tracker_tiers: Vec<Vec<String>>,
    pub web_seeds: Vec<String>,
    pub acceptable_sources: Vec<String>,
    /// BEP 53 file selection; sorted, deduplicated, absent when no valid index
    pub selected_file_indices: Option<Vec<usize>>,
    /// `x.pe=` peer addresses handed to us by whoever built the uri
    pub peers: Vec<SocketAddr>,
}

impl MagnetDescriptor {
    /// Parses a magnet uri. Returns `None` when the input is not a magnet,
    /// carries no usable info hash, or carries a malformed one; malformed
    /// sub-fields are dropped without failing the whole parse.
    pub fn parse(text: &str) -> Option<MagnetDescriptor> {
        let descriptor = Self::parse_fields(text);

        if descriptor.is_none() {
            warn!("discarding unusable magnet uri: {}", text);
        }

        descriptor
    }

    fn parse_fields(text: &str) -> Option<MagnetDescriptor> {
        let query = text.strip_prefix("magnet:?")?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut exact_length = None;
        let mut peers = Vec::new();

        // tier 0 collects unnumbered tr= keys, so numbered and unnumbered
        // trackers merge into one ascending map
        let mut tiers: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        let mut seeds = NumberedList::default();
        let mut sources = NumberedList::default();
        let mut indices = BTreeSet::new();

        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };

            let (Some(key), Some(value)) = (decode(key), decode(value)) else {
                continue;
            };

            match key.as_str() {
                "xt" => {
                    let hash = if let Some(rest) = value.strip_prefix("urn:btih:") {
                        rest.parse().ok()?
                    } else if let Some(rest) = value.strip_prefix("urn:sha1:") {
                        // the sha1 urn form is hex only
                        InfoHash::from_hex(rest).ok()?
                    } else {
                        return None;
                    };

                    info_hash.get_or_insert(hash);
                }

                "dn" => display_name = Some(value),

                "xl" => {
                    if let Ok(n) = value.parse() {
                        exact_length.get_or_insert(n);
                    }
                }

                // tr values may pack several uris separated by commas
                "tr" => {
                    for uri in value.split(',') {
                        if has_scheme(uri, &TRACKER_SCHEMES) {
                            tiers.entry(0).or_default().push(uri.into());
                        }
                    }
                }

                "ws" => seeds.push_plain(value),
                "as" => sources.push_plain(value),

                "so" => {
                    if let Ok(n) = value.parse::<usize>() {
                        indices.insert(n);
                    }
                }

                "x.pe" => {
                    if let Ok(addr) = value.parse() {
                        peers.push(addr);
                    }
                }

                other => {
                    // tr.N / ws.N / as.N / so.N; anything else is ignored
                    let Some((base, n)) = other.split_once('.') else {
                        continue;
                    };
                    let Ok(n) = n.parse::<u32>() else {
                        continue;
                    };

                    match base {
                        "tr" => {
                            for uri in value.split(',') {
                                if has_scheme(uri, &TRACKER_SCHEMES) {
                                    tiers.entry(n).or_default().push(uri.into());
                                }
                            }
                        }
                        "ws" => seeds.push_numbered(n, value),
                        "as" => sources.push_numbered(n, value),
                        "so" => {
                            if let Ok(i) = value.parse::<usize>() {
                                indices.insert(i);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        Some(MagnetDescriptor {
            info_hash: info_hash?,
            display_name,
            exact_length,
            tracker_tiers: tiers.into_values().collect(),
            web_seeds: seeds.into_flat(),
            acceptable_sources: sources.into_flat(),
            selected_file_indices: if indices.is_empty() {
                None
            } else {
                Some(indices.into_iter().collect())
            },
            peers,
        })
    }

    /// Flat tracker list: the tiers concatenated in tier order.
    pub fn trackers(&self) -> impl Iterator<Item = &str> {
        self.tracker_tiers
            .iter()
            .flatten()
            .map(|tracker| tracker.as_str())
    }

    /// Renders the descriptor back into a magnet uri.
    ///
    /// Tier structure is not preserved: trackers are emitted flat, so a
    /// reparse regroups them all into tier 0.
    pub fn to_uri(&self) -> String {
        let mut uri = format!("magnet:?xt=urn:btih:{}", self.info_hash.to_hex());

        if let Some(dn) = &self.display_name {
            let _ = write!(uri, "&dn={}", escape(dn));
        }

        for tracker in self.trackers() {
            let _ = write!(uri, "&tr={}", escape(tracker));
        }

        if let Some(xl) = self.exact_length {
            let _ = write!(uri, "&xl={}", xl);
        }

        for seed in &self.web_seeds {
            let _ = write!(uri, "&ws={}", escape(seed));
        }

        for source in &self.acceptable_sources {
            let _ = write!(uri, "&as={}", escape(source));
        }

        if let Some(indices) = &self.selected_file_indices {
            for i in indices {
                let _ = write!(uri, "&so={}", i);
            }
        }

        for peer in &self.peers {
            let _ = write!(uri, "&x.pe={}", escape(&peer.to_string()));
        }

        uri
    }
}

impl std::str::FromStr for MagnetDescriptor {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<MagnetDescriptor, Self::Err> {
        MagnetDescriptor::parse(s).ok_or(crate::error::Error::NotAMagnet)
    }
}

fn decode(field: &str) -> Option<String> {
    percent_decode_str(field)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

fn escape(field: &str) -> impl std::fmt::Display + '_ {
    utf8_percent_encode(field, ESCAPE)
}

fn has_scheme(uri: &str, schemes: &[&str]) -> bool {
    match Url::parse(uri) {
        Ok(url) => schemes.contains(&url.scheme()),
        Err(_) => false,
    }
}

/// `ws=` / `ws.N=` style accumulator: unnumbered entries come first in
/// declaration order, numbered entries follow in key order.
#[derive(Default)]
struct NumberedList {
    plain: Vec<String>,
    numbered: BTreeMap<u32, Vec<String>>,
}

impl NumberedList {
    fn push_plain(&mut self, uri: String) {
        if has_scheme(&uri, &SEED_SCHEMES) {
            self.plain.push(uri);
        }
    }

    fn push_numbered(&mut self, n: u32, uri: String) {
        if has_scheme(&uri, &SEED_SCHEMES) {
            self.numbered.entry(n).or_default().push(uri);
        }
    }

    fn into_flat(self) -> Vec<String> {
        let mut flat = self.plain;
        flat.extend(self.numbered.into_values().flatten());
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::MagnetDescriptor;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn single_tier() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=test+file&tr=http://a.example/&tr=http://b.example/",
            HASH
        );
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(magnet.info_hash.to_hex(), HASH);
        assert_eq!(magnet.display_name.as_deref(), Some("test+file"));
        assert_eq!(
            magnet.tracker_tiers,
            [["http://a.example/", "http://b.example/"]]
        );
        assert_eq!(
            magnet.trackers().collect::<Vec<_>>(),
            ["http://a.example/", "http://b.example/"]
        );
    }

    #[test]
    fn numbered_tiers() {
        let uri = format!("magnet:?xt=urn:btih:{}&tr.1=http://a&tr.2=http://b", HASH);
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(magnet.tracker_tiers, [["http://a"], ["http://b"]]);
        assert_eq!(magnet.trackers().collect::<Vec<_>>(), ["http://a", "http://b"]);
    }

    #[test]
    fn unnumbered_trackers_share_tier_zero() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&tr=http://a&tr.1=http://c&tr=http://b",
            HASH
        );
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(magnet.tracker_tiers, [vec!["http://a", "http://b"], vec!["http://c"]]);
    }

    #[test]
    fn comma_separated_trackers() {
        let uri = format!("magnet:?xt=urn:btih:{}&tr=http://a,udp://b:6969", HASH);
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(magnet.trackers().collect::<Vec<_>>(), ["http://a", "udp://b:6969"]);
    }

    #[test]
    fn tracker_scheme_filter() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&tr=ftp://nope/&tr=wss://nope/&tr=udp://yes:1337/",
            HASH
        );
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(magnet.trackers().collect::<Vec<_>>(), ["udp://yes:1337/"]);
    }

    #[test]
    fn selection_indices_sorted_deduped() {
        let uri = format!("magnet:?xt=urn:btih:{}&so=2&so=invalid&so=-1&so=0&so=2", HASH);
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(magnet.selected_file_indices, Some(vec![0, 2]));
    }

    #[test]
    fn selection_absent_when_all_invalid() {
        let uri = format!("magnet:?xt=urn:btih:{}&so=x&so=-3", HASH);
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(magnet.selected_file_indices, None);
    }

    #[test]
    fn web_seed_scheme_filter() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&ws=invalid://x&ws=http://w.example/f",
            HASH
        );
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(magnet.web_seeds, ["http://w.example/f"]);
    }

    #[test]
    fn numbered_seeds_after_unnumbered() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&ws.2=ftp://c&ws=http://a&ws.1=http://b",
            HASH
        );
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(magnet.web_seeds, ["http://a", "http://b", "ftp://c"]);
    }

    #[test]
    fn exact_length() {
        let magnet =
            MagnetDescriptor::parse(&format!("magnet:?xt=urn:btih:{}&xl=12345", HASH)).unwrap();
        assert_eq!(magnet.exact_length, Some(12345));

        // malformed xl is dropped, not fatal
        let magnet =
            MagnetDescriptor::parse(&format!("magnet:?xt=urn:btih:{}&xl=-4&xl=zero", HASH)).unwrap();
        assert_eq!(magnet.exact_length, None);
    }

    #[test]
    fn direct_peers() {
        let uri = format!("magnet:?xt=urn:btih:{}&x.pe=10.0.0.2:6881&x.pe=junk", HASH);
        let magnet = MagnetDescriptor::parse(&uri).unwrap();

        assert_eq!(
            magnet.peers,
            ["10.0.0.2:6881".parse::<std::net::SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn base32_info_hash() {
        let magnet =
            MagnetDescriptor::parse("magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
                .unwrap();

        assert_eq!(magnet.info_hash.as_bytes(), &[0; 20]);
    }

    #[test]
    fn parse_rejects() {
        let md5 = format!("magnet:?xt=urn:md5:{}", HASH);
        let cases = [
            "http://example.com/file.torrent", // not a magnet
            "magnet:?dn=no-hash",              // xt missing
            "magnet:?xt=urn:btih:0123",        // hash too short
            md5.as_str(),                      // unknown urn
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef0123456", // 39 chars
        ];

        for case in cases {
            assert!(MagnetDescriptor::parse(case).is_none(), "{:?}", case);
        }
    }

    #[test]
    fn sha1_urn_is_hex_only() {
        let magnet = MagnetDescriptor::parse(&format!("magnet:?xt=urn:sha1:{}", HASH)).unwrap();
        assert_eq!(magnet.info_hash.to_hex(), HASH);

        // base32 is reserved for the btih form
        assert!(
            MagnetDescriptor::parse("magnet:?xt=urn:sha1:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
                .is_none()
        );
    }

    #[test]
    fn from_str_surfaces_an_error() {
        let magnet: Result<MagnetDescriptor, _> = "magnet:?dn=no-hash".parse();
        assert!(magnet.is_err());

        let magnet: MagnetDescriptor = format!("magnet:?xt=urn:btih:{}", HASH).parse().unwrap();
        assert_eq!(magnet.info_hash.to_hex(), HASH);
    }

    #[test]
    fn round_trip() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=big%20buck%20bunny&tr=http://a.example/announce&tr=udp://b.example:6969/&xl=262144&ws=http://seed.example/f&so=1&so=3&x.pe=10.1.2.3:51413",
            HASH
        );
        let magnet = MagnetDescriptor::parse(&uri).unwrap();
        let rebuilt = MagnetDescriptor::parse(&magnet.to_uri()).unwrap();

        // flat-only input, so regrouping into tier 0 is the identity
        assert_eq!(magnet, rebuilt);
    }

    #[test]
    fn to_uri_escapes_values() {
        let magnet = MagnetDescriptor::parse(&format!(
            "magnet:?xt=urn:btih:{}&dn=a%26b%3Dc&tr=http://t.example/announce%3Fkey%3D1",
            HASH
        ))
        .unwrap();

        assert_eq!(magnet.display_name.as_deref(), Some("a&b=c"));

        let uri = magnet.to_uri();
        assert!(uri.contains("dn=a%26b%3Dc"), "{}", uri);

        let rebuilt = MagnetDescriptor::parse(&uri).unwrap();
        assert_eq!(magnet, rebuilt);
    }
}
