//! Peer-address mount gate.
//!
//! The gate owns the served filesystem and decides, per connecting peer,
//! whether to hand it out. Handle management is left to an outer
//! [`CachingHandler`](crate::caching::CachingHandler).

use std::io;
use std::net::IpAddr;

use ipnet::IpNet;
use metrics::counter;
use tracing::{debug, warn};

use crate::change::change_capability;
use crate::error::HandleError;
use crate::filesystem::{Change, Filesystem};
use crate::handler::{
    AuthFlavor, FsRef, FsStat, MountRequest, MountResponse, MountStatus, NfsHandler, Resolved,
};

/// A single allowlist entry.
///
/// Entries that fail to parse are kept so they can be reported, but they
/// never match anything. Parsing is strict: surrounding whitespace makes a
/// rule malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowRule {
    raw: String,
    net: Option<IpNet>,
}

impl AllowRule {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let net = raw.parse::<IpNet>().ok();
        Self { raw, net }
    }

    /// The rule as written in configuration.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn network(&self) -> Option<IpNet> {
        self.net
    }

    pub fn is_valid(&self) -> bool {
        self.net.is_some()
    }

    pub fn contains(&self, peer: IpAddr) -> bool {
        self.net.is_some_and(|net| net.contains(&peer))
    }
}

/// Evaluates `peer` against an allowlist.
///
/// An empty list allows everyone. Otherwise the first rule containing the
/// peer allows it and no match denies. IPv4-mapped IPv6 peers are compared
/// in their IPv4 form.
pub fn is_allowed(peer: IpAddr, rules: &[AllowRule]) -> bool {
    if rules.is_empty() {
        return true;
    }
    let peer = peer.to_canonical();
    rules.iter().any(|rule| rule.contains(peer))
}

/// Handler that gates mounts by peer address.
pub struct CidrAuthHandler {
    fs: FsRef,
    rules: Vec<AllowRule>,
}

impl CidrAuthHandler {
    pub fn new<S: AsRef<str>>(fs: FsRef, allow_cidrs: &[S]) -> Self {
        let rules: Vec<AllowRule> = allow_cidrs
            .iter()
            .map(|raw| AllowRule::parse(raw.as_ref()))
            .collect();
        for rule in rules.iter().filter(|r| !r.is_valid()) {
            warn!(rule = rule.raw(), "Ignoring malformed CIDR in allowlist");
        }
        debug!(rules = rules.len(), "Mount gate configured");
        Self { fs, rules }
    }

    pub fn rules(&self) -> &[AllowRule] {
        &self.rules
    }
}

impl NfsHandler for CidrAuthHandler {
    fn mount(&self, request: &MountRequest) -> MountResponse {
        if !is_allowed(request.peer, &self.rules) {
            warn!(
                peer = %request.peer,
                path = %request.path,
                "Mount denied: peer not in allowlist"
            );
            counter!("webfs_mount_requests_total", "decision" => "deny").increment(1);
            return MountResponse::denied();
        }

        debug!(peer = %request.peer, path = %request.path, "Mount allowed");
        counter!("webfs_mount_requests_total", "decision" => "allow").increment(1);
        MountResponse {
            status: MountStatus::Ok,
            filesystem: Some(FsRef::clone(&self.fs)),
            auth_flavors: vec![AuthFlavor::Des],
        }
    }

    fn change<'a>(&self, fs: &'a dyn Filesystem) -> Option<&'a dyn Change> {
        change_capability(fs)
    }

    fn fs_stat(&self, _fs: &dyn Filesystem, _stat: &mut FsStat) -> io::Result<()> {
        Ok(())
    }

    fn to_handle(&self, _fs: &FsRef, _path: &[String]) -> Vec<u8> {
        Vec::new()
    }

    fn from_handle(&self, _handle: &[u8]) -> Result<Option<Resolved>, HandleError> {
        Ok(None)
    }

    fn handle_limit(&self) -> Option<usize> {
        None
    }
}
