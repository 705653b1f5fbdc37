//! Origin & Mirror model: the endpoint and mirror-group types used to
//! describe where repository content can be fetched from.
//!
//! Grounded on `examples/original_source/zypp-logic/zypp-core/MirroredOrigin.h`.
//! Where the original uses copy-on-write shared pointers so callers can pass
//! these values freely, this crate uses plain owned value types:
//! `OriginEndpoint`/`MirroredOrigin` are `Clone`, and mutation happens through
//! `&mut self` methods on an owned value rather than through a builder
//! indirection.

use std::collections::HashMap;
use url::Url;

/// A single configurable network endpoint: a URL plus a free-form settings
/// map.
///
/// The settings map is modeled here as a `String -> Bytes` escape hatch
/// rather than `std::any`, since callers on the Rust side know their own
/// setting types and can encode/decode through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginEndpoint {
    url: Url,
    settings: HashMap<String, Vec<u8>>,
}

impl OriginEndpoint {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            settings: HashMap::new(),
        }
    }

    pub fn with_settings(url: Url, settings: HashMap<String, Vec<u8>>) -> Self {
        Self { url, settings }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    pub fn has_config(&self, key: &str) -> bool {
        self.settings.contains_key(key)
    }

    pub fn get_config(&self, key: &str) -> Option<&[u8]> {
        self.settings.get(key).map(|v| v.as_slice())
    }

    pub fn set_config(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.settings.insert(key.into(), value.into());
    }

    pub fn erase_config(&mut self, key: &str) {
        self.settings.remove(key);
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Whether this endpoint's scheme is one the transfer engine can
    /// actually fetch over (http/https/ftp), as opposed to e.g. local media
    /// schemes (`cd`, `dvd`, `dir`, `file`).
    pub fn scheme_is_downloading(&self) -> bool {
        scheme_is_downloading(self.url.scheme())
    }

    pub fn is_valid(&self) -> bool {
        !self.url.scheme().is_empty()
    }
}

fn scheme_is_downloading(scheme: &str) -> bool {
    matches!(
        scheme,
        "http" | "https" | "ftp" | "tftp" | "sftp" | "cifs" | "smb" | "nfs" | "nfs4"
    )
}

/// Two `OriginEndpoint`s are equal iff their fully-rendered URLs match;
/// ordering follows the same key.
impl PartialOrd for OriginEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OriginEndpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.url.as_str().cmp(other.url.as_str())
    }
}

/// An authority endpoint plus an ordered list of scheme-compatible mirrors.
#[derive(Debug, Clone)]
pub struct MirroredOrigin {
    authority: OriginEndpoint,
    mirrors: Vec<OriginEndpoint>,
}

/// Whether `mirror` is compatible with `authority`: same scheme, or both
/// schemes are "downloading" schemes.
fn mirror_compatible(authority: &OriginEndpoint, mirror: &OriginEndpoint) -> bool {
    mirror.scheme() == authority.scheme()
        || (authority.scheme_is_downloading() && mirror.scheme_is_downloading())
}

impl MirroredOrigin {
    pub fn new(authority: OriginEndpoint) -> Self {
        Self {
            authority,
            mirrors: Vec::new(),
        }
    }

    pub fn with_mirrors(authority: OriginEndpoint, mirrors: Vec<OriginEndpoint>) -> Self {
        let mut origin = Self::new(authority);
        for mirror in mirrors {
            origin.add_mirror(mirror);
        }
        origin
    }

    pub fn authority(&self) -> &OriginEndpoint {
        &self.authority
    }

    pub fn mirrors(&self) -> &[OriginEndpoint] {
        &self.mirrors
    }

    /// Replace the authority; mirrors that are no longer scheme-compatible
    /// with the new authority are dropped.
    pub fn set_authority(&mut self, authority: OriginEndpoint) {
        self.authority = authority;
        let authority = &self.authority;
        self.mirrors
            .retain(|mirror| mirror_compatible(authority, mirror));
    }

    /// Append `mirror` iff it is scheme-compatible with the current
    /// authority. Returns whether it was added; incompatible mirrors are
    /// silently skipped rather than treated as an error.
    pub fn add_mirror(&mut self, mirror: OriginEndpoint) -> bool {
        if mirror_compatible(&self.authority, &mirror) {
            self.mirrors.push(mirror);
            true
        } else {
            false
        }
    }

    pub fn clear_mirrors(&mut self) {
        self.mirrors.clear();
    }

    pub fn scheme(&self) -> &str {
        self.authority.scheme()
    }

    pub fn scheme_is_downloading(&self) -> bool {
        self.authority.scheme_is_downloading()
    }

    pub fn is_valid(&self) -> bool {
        self.authority.is_valid()
    }

    /// Total endpoint count, authority included.
    pub fn endpoint_count(&self) -> usize {
        1 + self.mirrors.len()
    }

    /// Index-based access, index 0 is always the authority.
    pub fn at(&self, index: usize) -> Result<&OriginEndpoint, OutOfRange> {
        if index == 0 {
            Ok(&self.authority)
        } else {
            self.mirrors.get(index - 1).ok_or(OutOfRange)
        }
    }

    /// Iterate authority first, then mirrors in order.
    pub fn iter(&self) -> impl Iterator<Item = &OriginEndpoint> {
        std::iter::once(&self.authority).chain(self.mirrors.iter())
    }
}

/// Returned by fallible index-based access; every other operation on these
/// types is infallible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("index out of range")]
pub struct OutOfRange;

/// An insertion-ordered sequence of `MirroredOrigin`s, grouped by scheme.
#[derive(Debug, Clone, Default)]
pub struct MirroredOriginSet {
    origins: Vec<MirroredOrigin>,
}

impl MirroredOriginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_endpoints(endpoints: Vec<OriginEndpoint>) -> Self {
        let mut set = Self::new();
        set.add_endpoints(endpoints);
        set
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn at(&self, idx: usize) -> Result<&MirroredOrigin, OutOfRange> {
        self.origins.get(idx).ok_or(OutOfRange)
    }

    pub fn at_mut(&mut self, idx: usize) -> Result<&mut MirroredOrigin, OutOfRange> {
        self.origins.get_mut(idx).ok_or(OutOfRange)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MirroredOrigin> {
        self.origins.iter()
    }

    pub fn clear(&mut self) {
        self.origins.clear();
    }

    /// Add a single endpoint, routing it to the correct `MirroredOrigin`.
    ///
    /// For downloading schemes, at most one group exists: the endpoint is
    /// appended as a mirror to that group (creating it, with this endpoint
    /// as authority, if it doesn't exist yet). Non-downloading schemes each
    /// get their own group, in first-seen order.
    pub fn add_endpoint(&mut self, endpoint: OriginEndpoint) {
        if endpoint.scheme_is_downloading() {
            if let Some(origin) = self
                .origins
                .iter_mut()
                .find(|o| o.scheme_is_downloading())
            {
                origin.add_mirror(endpoint);
            } else {
                self.origins.push(MirroredOrigin::new(endpoint));
            }
        } else if let Some(origin) = self
            .origins
            .iter_mut()
            .find(|o| o.scheme() == endpoint.scheme())
        {
            origin.add_mirror(endpoint);
        } else {
            self.origins.push(MirroredOrigin::new(endpoint));
        }
    }

    pub fn add_endpoints(&mut self, endpoints: Vec<OriginEndpoint>) {
        for endpoint in endpoints {
            self.add_endpoint(endpoint);
        }
    }

    /// Search both authorities and mirrors of every group for `url`.
    pub fn find_by_url(&self, url: &Url) -> Option<&MirroredOrigin> {
        self.origins
            .iter()
            .find(|origin| origin.iter().any(|ep| ep.url() == url))
    }

    /// Whether this set contains more than one endpoint in total.
    pub fn has_fallback_urls(&self) -> bool {
        self.origins.iter().map(|o| o.endpoint_count()).sum::<usize>() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> OriginEndpoint {
        OriginEndpoint::new(Url::parse(s).unwrap())
    }

    #[test]
    fn incompatible_mirror_is_skipped_not_errored() {
        let mut origin = MirroredOrigin::new(ep("http://a.example.com/repo"));
        assert!(!origin.add_mirror(ep("cd:///")));
        assert_eq!(origin.mirrors().len(), 0);
    }

    #[test]
    fn downloading_mirror_accepted_across_downloading_schemes() {
        let mut origin = MirroredOrigin::new(ep("http://a.example.com/repo"));
        assert!(origin.add_mirror(ep("https://b.example.com/repo")));
        assert_eq!(origin.mirrors().len(), 1);
    }

    #[test]
    fn set_authority_drops_incompatible_mirrors() {
        let mut origin = MirroredOrigin::new(ep("http://a.example.com/repo"));
        origin.add_mirror(ep("https://b.example.com/repo"));
        origin.set_authority(ep("cd:///"));
        assert!(origin.mirrors().is_empty());
    }

    #[test]
    fn iteration_exposes_authority_first() {
        let mut origin = MirroredOrigin::new(ep("http://a.example.com/repo"));
        origin.add_mirror(ep("http://b.example.com/repo"));
        let urls: Vec<_> = origin.iter().map(|e| e.url().as_str()).collect();
        assert_eq!(urls[0], "http://a.example.com/repo");
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn origin_set_groups_downloading_schemes_into_one() {
        let mut set = MirroredOriginSet::new();
        set.add_endpoint(ep("http://a.example.com/repo"));
        set.add_endpoint(ep("https://b.example.com/repo"));
        set.add_endpoint(ep("cd:///"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.at(0).unwrap().endpoint_count(), 2);
        assert_eq!(set.at(1).unwrap().endpoint_count(), 1);
    }

    #[test]
    fn has_fallback_urls() {
        let mut set = MirroredOriginSet::new();
        assert!(!set.has_fallback_urls());
        set.add_endpoint(ep("http://a.example.com/repo"));
        assert!(!set.has_fallback_urls());
        set.add_endpoint(ep("http://b.example.com/repo"));
        assert!(set.has_fallback_urls());
    }

    #[test]
    fn out_of_range_index() {
        let origin = MirroredOrigin::new(ep("http://a.example.com/repo"));
        assert_eq!(origin.at(1), Err(OutOfRange));
    }
}
