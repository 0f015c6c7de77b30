//! Cluster topology model
//!
//! An immutable snapshot of the segment configuration catalog:
//! - Segments with closed role/status/mode enums
//! - Primary/mirror pairing derived from content id
//! - Groupings by host and by content for batching remote work
//!
//! A topology is never mutated in place. Callers that need fresh state
//! re-read the catalog and build a new snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SegrecoverError};
use crate::COORDINATOR_CONTENT_ID;

/// Segment role, current or preferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Mirror,
}

impl Role {
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'p' => Ok(Role::Primary),
            'm' => Ok(Role::Mirror),
            other => Err(SegrecoverError::InvalidField {
                field: "role",
                value: other.to_string(),
            }),
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Role::Primary => 'p',
            Role::Mirror => 'm',
        }
    }
}

/// Liveness as recorded by the fault prober
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Up,
    Down,
}

impl Status {
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'u' => Ok(Status::Up),
            'd' => Ok(Status::Down),
            other => Err(SegrecoverError::InvalidField {
                field: "status",
                value: other.to_string(),
            }),
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Status::Up => 'u',
            Status::Down => 'd',
        }
    }
}

/// Replication mode between the members of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Synchronized,
    NotInSync,
    ChangeTracking,
    Resyncing,
}

impl Mode {
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            's' => Ok(Mode::Synchronized),
            'n' => Ok(Mode::NotInSync),
            'c' => Ok(Mode::ChangeTracking),
            'r' => Ok(Mode::Resyncing),
            other => Err(SegrecoverError::InvalidField {
                field: "mode",
                value: other.to_string(),
            }),
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Mode::Synchronized => 's',
            Mode::NotInSync => 'n',
            Mode::ChangeTracking => 'c',
            Mode::Resyncing => 'r',
        }
    }

    /// Human-readable label used in plan output
    pub fn label(self) -> &'static str {
        match self {
            Mode::Synchronized => "Synchronized",
            Mode::NotInSync => "Not In Sync",
            Mode::ChangeTracking => "Change Tracking",
            Mode::Resyncing => "Resynchronizing",
        }
    }
}

fn single_char(field: &'static str, value: &str) -> Result<char> {
    let mut chars = value.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(SegrecoverError::InvalidField {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| SegrecoverError::InvalidField {
            field,
            value: value.to_string(),
        })
}

/// One database instance as recorded in the configuration catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub dbid: i32,
    pub content: i32,
    pub role: Role,
    pub preferred_role: Role,
    pub mode: Mode,
    pub status: Status,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub datadir: String,
    /// Set when a reachability check against the host failed
    #[serde(default)]
    pub unreachable: bool,
}

impl Segment {
    /// Number of fields in a catalog row / pipe-delimited line
    pub const FIELD_COUNT: usize = 10;

    /// Build a segment from catalog columns in
    /// `dbid, content, role, preferred_role, mode, status, hostname, address, port, datadir` order.
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Result<Self> {
        if fields.len() != Self::FIELD_COUNT {
            return Err(SegrecoverError::InvalidSegment(format!(
                "expected {} fields, got {}",
                Self::FIELD_COUNT,
                fields.len()
            )));
        }
        let f = |i: usize| fields[i].as_ref();

        let hostname = f(6).trim().to_string();
        let address = f(7).trim().to_string();
        let datadir = f(9).trim().to_string();
        if hostname.is_empty() || address.is_empty() || datadir.is_empty() {
            return Err(SegrecoverError::InvalidSegment(
                "hostname, address and datadir must not be empty".to_string(),
            ));
        }

        Ok(Self {
            dbid: parse_number("dbid", f(0))?,
            content: parse_number("content", f(1))?,
            role: Role::from_char(single_char("role", f(2))?)?,
            preferred_role: Role::from_char(single_char("preferred_role", f(3))?)?,
            mode: Mode::from_char(single_char("mode", f(4))?)?,
            status: Status::from_char(single_char("status", f(5))?)?,
            hostname,
            address,
            port: parse_number("port", f(8))?,
            datadir,
            unreachable: false,
        })
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn is_mirror(&self) -> bool {
        self.role == Role::Mirror
    }

    pub fn is_up(&self) -> bool {
        self.status == Status::Up
    }

    pub fn is_down(&self) -> bool {
        self.status == Status::Down
    }

    pub fn is_synchronized(&self) -> bool {
        self.mode == Mode::Synchronized
    }

    pub fn is_in_preferred_role(&self) -> bool {
        self.role == self.preferred_role
    }

    /// True for the coordinator and its standby
    pub fn is_coordinator_content(&self) -> bool {
        self.content == COORDINATOR_CONTENT_ID
    }

    /// `host:port:datadir` identity used in log lines
    pub fn location(&self) -> String {
        format!("{}:{}:{}", self.address, self.port, self.datadir)
    }
}

impl FromStr for Segment {
    type Err = SegrecoverError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split('|').collect();
        Self::from_fields(&fields)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.dbid,
            self.content,
            self.role.as_char(),
            self.preferred_role.as_char(),
            self.mode.as_char(),
            self.status.as_char(),
            self.hostname,
            self.address,
            self.port,
            self.datadir
        )
    }
}

/// The primary and (optional) mirror serving one content id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPair {
    pub primary: Segment,
    pub mirror: Option<Segment>,
}

impl SegmentPair {
    pub fn content(&self) -> i32 {
        self.primary.content
    }

    pub fn members(&self) -> impl Iterator<Item = &Segment> {
        std::iter::once(&self.primary).chain(self.mirror.iter())
    }

    /// Every member is up
    pub fn up(&self) -> bool {
        self.members().all(Segment::is_up)
    }

    /// No member sits on a host that failed a reachability check
    pub fn reachable(&self) -> bool {
        self.members().all(|s| !s.unreachable)
    }

    /// Both members replicate in synchronized mode
    pub fn synchronized(&self) -> bool {
        match &self.mirror {
            Some(mirror) => self.primary.is_synchronized() && mirror.is_synchronized(),
            None => false,
        }
    }

    /// Every member currently holds its preferred role
    pub fn balanced(&self) -> bool {
        self.members().all(Segment::is_in_preferred_role)
    }

    /// Members currently marked down
    pub fn down_members(&self) -> Vec<&Segment> {
        self.members().filter(|s| s.is_down()).collect()
    }

    /// The other member of the pair, if `dbid` belongs to it
    pub fn peer_of(&self, dbid: i32) -> Option<&Segment> {
        let mirror = self.mirror.as_ref()?;
        if self.primary.dbid == dbid {
            Some(mirror)
        } else if mirror.dbid == dbid {
            Some(&self.primary)
        } else {
            None
        }
    }
}

/// Immutable view of the whole cluster configuration
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    coordinator: Segment,
    standby: Option<Segment>,
    /// Non-coordinator segments ordered by (content, dbid)
    segments: Vec<Segment>,
}

impl ClusterTopology {
    /// Build and validate a topology from catalog rows
    pub fn new(rows: Vec<Segment>) -> Result<Self> {
        let mut seen = HashSet::new();
        for seg in &rows {
            if !seen.insert(seg.dbid) {
                return Err(SegrecoverError::DuplicateDbid(seg.dbid));
            }
        }

        let mut by_content: BTreeMap<i32, Vec<Segment>> = BTreeMap::new();
        for seg in rows {
            if seg.content < COORDINATOR_CONTENT_ID {
                return Err(SegrecoverError::InvalidField {
                    field: "content",
                    value: seg.content.to_string(),
                });
            }
            by_content.entry(seg.content).or_default().push(seg);
        }

        for (content, members) in &by_content {
            if members.len() > 2 {
                return Err(SegrecoverError::TooManySegments {
                    content: *content,
                    count: members.len(),
                });
            }
            let primaries = members.iter().filter(|s| s.is_primary()).count();
            if primaries != 1 {
                return Err(SegrecoverError::PrimaryCount {
                    content: *content,
                    primaries,
                });
            }
        }

        let coordinator_rows = by_content
            .remove(&COORDINATOR_CONTENT_ID)
            .ok_or(SegrecoverError::MissingCoordinator)?;
        let mut coordinator = None;
        let mut standby = None;
        for seg in coordinator_rows {
            match seg.role {
                Role::Primary => coordinator = Some(seg),
                Role::Mirror => standby = Some(seg),
            }
        }
        let coordinator = coordinator.ok_or(SegrecoverError::MissingCoordinator)?;

        let mut segments: Vec<Segment> = by_content.into_values().flatten().collect();
        segments.sort_by_key(|s| (s.content, s.dbid));

        Ok(Self {
            coordinator,
            standby,
            segments,
        })
    }

    /// Parse a pipe-delimited snapshot, one segment per line.
    /// Blank lines and lines starting with `#` are ignored.
    pub fn from_pipe_format(text: &str) -> Result<Self> {
        let mut rows = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let seg = line.parse::<Segment>().map_err(|e| {
                SegrecoverError::InvalidSegment(format!("line {}: {}", idx + 1, e))
            })?;
            rows.push(seg);
        }
        Self::new(rows)
    }

    pub fn coordinator(&self) -> &Segment {
        &self.coordinator
    }

    pub fn standby(&self) -> Option<&Segment> {
        self.standby.as_ref()
    }

    /// One pair per non-negative content id, ordered by content
    pub fn segment_pairs(&self) -> Vec<SegmentPair> {
        let mut pairs = Vec::new();
        for members in self.segments_by_content().into_values() {
            let primary = members.iter().find(|s| s.is_primary());
            let mirror = members.iter().find(|s| s.is_mirror());
            if let Some(primary) = primary {
                pairs.push(SegmentPair {
                    primary: (*primary).clone(),
                    mirror: mirror.map(|m| (*m).clone()),
                });
            }
        }
        pairs
    }

    /// Alias kept for callers iterating pairs
    pub fn get_segment_list(&self) -> Vec<SegmentPair> {
        self.segment_pairs()
    }

    /// Every instance, coordinator and standby included
    pub fn get_db_list(&self) -> Vec<&Segment> {
        std::iter::once(&self.coordinator)
            .chain(self.standby.iter())
            .chain(self.segments.iter())
            .collect()
    }

    /// Every non-coordinator instance
    pub fn get_seg_db_list(&self) -> Vec<&Segment> {
        self.segments.iter().collect()
    }

    /// Group arbitrary segments by hostname
    pub fn segments_by_host<'a, I>(segments: I) -> BTreeMap<String, Vec<Segment>>
    where
        I: IntoIterator<Item = &'a Segment>,
    {
        let mut map: BTreeMap<String, Vec<Segment>> = BTreeMap::new();
        for seg in segments {
            map.entry(seg.hostname.clone()).or_default().push(seg.clone());
        }
        map
    }

    pub fn segments_by_content(&self) -> BTreeMap<i32, Vec<&Segment>> {
        let mut map: BTreeMap<i32, Vec<&Segment>> = BTreeMap::new();
        for seg in &self.segments {
            map.entry(seg.content).or_default().push(seg);
        }
        map
    }

    pub fn segment_by_dbid(&self, dbid: i32) -> Option<&Segment> {
        self.get_db_list().into_iter().find(|s| s.dbid == dbid)
    }

    /// The other member sharing the content id of `dbid`
    pub fn peer_of(&self, dbid: i32) -> Option<&Segment> {
        let seg = self.segment_by_dbid(dbid)?;
        if seg.is_coordinator_content() {
            return None;
        }
        self.segments
            .iter()
            .find(|s| s.content == seg.content && s.dbid != dbid)
    }

    /// Map each segment dbid to its peer dbid
    pub fn dbid_to_peer_map(&self) -> HashMap<i32, i32> {
        let mut map = HashMap::new();
        for pair in self.segment_pairs() {
            if let Some(mirror) = &pair.mirror {
                map.insert(pair.primary.dbid, mirror.dbid);
                map.insert(mirror.dbid, pair.primary.dbid);
            }
        }
        map
    }

    /// Hostnames carrying at least one non-coordinator segment
    pub fn hosts(&self) -> BTreeSet<&str> {
        self.segments.iter().map(|s| s.hostname.as_str()).collect()
    }

    pub fn has_mirrors(&self) -> bool {
        self.segments.iter().any(|s| s.preferred_role == Role::Mirror)
    }

    pub fn down_segments(&self) -> Vec<&Segment> {
        self.segments.iter().filter(|s| s.is_down()).collect()
    }

    pub fn unbalanced_segments(&self) -> Vec<&Segment> {
        self.segments
            .iter()
            .filter(|s| !s.is_in_preferred_role())
            .collect()
    }

    /// Reject configurations where two instances on one host share a port or data directory
    pub fn check_port_and_directory_conflicts(&self) -> Result<()> {
        let mut used_ports: HashSet<(&str, u16)> = HashSet::new();
        let mut used_dirs: HashSet<(&str, &str)> = HashSet::new();
        for seg in self.get_db_list() {
            if !used_ports.insert((seg.hostname.as_str(), seg.port)) {
                return Err(SegrecoverError::PortConflict {
                    host: seg.hostname.clone(),
                    port: seg.port,
                });
            }
            if !used_dirs.insert((seg.hostname.as_str(), seg.datadir.as_str())) {
                return Err(SegrecoverError::DirectoryConflict {
                    host: seg.hostname.clone(),
                    datadir: seg.datadir.clone(),
                });
            }
        }
        Ok(())
    }

    /// New snapshot with every segment on `hosts` flagged unreachable
    pub fn with_unreachable_hosts(&self, hosts: &HashSet<String>) -> Self {
        let mut next = self.clone();
        for seg in next.segments.iter_mut() {
            seg.unreachable = hosts.contains(&seg.hostname);
        }
        next
    }

    /// Pipe-delimited rendering accepted by `from_pipe_format`
    pub fn to_pipe_format(&self) -> String {
        let mut out = String::new();
        for seg in self.get_db_list() {
            out.push_str(&seg.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) const TWO_PAIRS: &str = "\
1|-1|p|p|n|u|cdw|cdw|5432|/data/coordinator/gpseg-1
2|0|p|p|s|u|sdw1|sdw1|6000|/data/primary/gpseg0
3|1|p|p|s|u|sdw2|sdw2|6000|/data/primary/gpseg1
4|0|m|m|s|u|sdw2|sdw2|7000|/data/mirror/gpseg0
5|1|m|m|s|u|sdw1|sdw1|7000|/data/mirror/gpseg1
";

    fn topology(text: &str) -> ClusterTopology {
        ClusterTopology::from_pipe_format(text).unwrap()
    }

    #[test]
    fn test_parse_segment_line() {
        let seg: Segment = "2|0|p|m|c|d|sdw1|sdw1-1|6000|/data/p0".parse().unwrap();
        assert_eq!(seg.dbid, 2);
        assert_eq!(seg.content, 0);
        assert_eq!(seg.role, Role::Primary);
        assert_eq!(seg.preferred_role, Role::Mirror);
        assert_eq!(seg.mode, Mode::ChangeTracking);
        assert_eq!(seg.status, Status::Down);
        assert_eq!(seg.address, "sdw1-1");
        assert_eq!(seg.to_string(), "2|0|p|m|c|d|sdw1|sdw1-1|6000|/data/p0");
    }

    #[test]
    fn test_parse_rejects_unknown_role() {
        let err = "2|0|x|p|s|u|h|h|6000|/d".parse::<Segment>().unwrap_err();
        assert!(matches!(err, SegrecoverError::InvalidField { field: "role", .. }));
    }

    #[test]
    fn test_parse_rejects_short_row() {
        assert!("2|0|p|p|s|u".parse::<Segment>().is_err());
    }

    #[test]
    fn test_pairs_and_lists() {
        let topo = topology(TWO_PAIRS);
        let pairs = topo.segment_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].content(), 0);
        assert_eq!(pairs[0].primary.dbid, 2);
        assert_eq!(pairs[0].mirror.as_ref().map(|m| m.dbid), Some(4));
        assert!(pairs.iter().all(|p| p.up() && p.synchronized() && p.balanced()));

        assert_eq!(topo.get_db_list().len(), 5);
        assert_eq!(topo.get_seg_db_list().len(), 4);
        assert_eq!(topo.coordinator().dbid, 1);
        assert!(topo.standby().is_none());
        assert!(topo.has_mirrors());
    }

    #[test]
    fn test_peer_lookup() {
        let topo = topology(TWO_PAIRS);
        assert_eq!(topo.peer_of(2).map(|s| s.dbid), Some(4));
        assert_eq!(topo.peer_of(5).map(|s| s.dbid), Some(3));
        assert!(topo.peer_of(1).is_none());
        let peers = topo.dbid_to_peer_map();
        assert_eq!(peers.get(&4), Some(&2));
        assert_eq!(peers.len(), 4);
    }

    #[test]
    fn test_segments_by_host() {
        let topo = topology(TWO_PAIRS);
        let by_host = ClusterTopology::segments_by_host(topo.get_seg_db_list());
        assert_eq!(by_host.len(), 2);
        let sdw1: Vec<i32> = by_host["sdw1"].iter().map(|s| s.dbid).collect();
        assert_eq!(sdw1, vec![2, 5]);
    }

    #[test]
    fn test_two_primaries_rejected() {
        let text = "\
1|-1|p|p|n|u|cdw|cdw|5432|/c
2|0|p|p|s|u|sdw1|sdw1|6000|/p0
3|0|p|m|s|u|sdw2|sdw2|7000|/m0
";
        let err = ClusterTopology::from_pipe_format(text).unwrap_err();
        assert!(matches!(
            err,
            SegrecoverError::PrimaryCount { content: 0, primaries: 2 }
        ));
    }

    #[test]
    fn test_missing_coordinator_rejected() {
        let err = ClusterTopology::from_pipe_format("2|0|p|p|s|u|h|h|6000|/p0\n").unwrap_err();
        assert!(matches!(err, SegrecoverError::MissingCoordinator));
    }

    #[test]
    fn test_duplicate_dbid_rejected() {
        let text = "\
1|-1|p|p|n|u|cdw|cdw|5432|/c
1|0|p|p|s|u|sdw1|sdw1|6000|/p0
";
        let err = ClusterTopology::from_pipe_format(text).unwrap_err();
        assert!(matches!(err, SegrecoverError::DuplicateDbid(1)));
    }

    #[test]
    fn test_failed_over_pair_is_unbalanced() {
        let text = "\
1|-1|p|p|n|u|cdw|cdw|5432|/c
2|0|m|p|n|d|sdw1|sdw1|6000|/p0
4|0|p|m|n|u|sdw2|sdw2|7000|/m0
";
        let topo = topology(text);
        let pair = &topo.segment_pairs()[0];
        assert_eq!(pair.primary.dbid, 4);
        assert!(!pair.balanced());
        assert!(!pair.up());
        assert!(!pair.synchronized());
        assert_eq!(pair.down_members()[0].dbid, 2);
        assert_eq!(topo.unbalanced_segments().len(), 2);
        assert_eq!(topo.down_segments().len(), 1);
    }

    #[test]
    fn test_port_conflict_detected() {
        let text = "\
1|-1|p|p|n|u|cdw|cdw|5432|/c
2|0|p|p|s|u|sdw1|sdw1|6000|/p0
3|1|p|p|s|u|sdw1|sdw1|6000|/p1
";
        let err = topology(text).check_port_and_directory_conflicts().unwrap_err();
        assert!(matches!(err, SegrecoverError::PortConflict { port: 6000, .. }));
        assert!(topology(TWO_PAIRS).check_port_and_directory_conflicts().is_ok());
    }

    #[test]
    fn test_unreachable_hosts_produce_new_snapshot() {
        let topo = topology(TWO_PAIRS);
        let hosts: HashSet<String> = ["sdw2".to_string()].into_iter().collect();
        let marked = topo.with_unreachable_hosts(&hosts);
        assert!(topo.segment_pairs().iter().all(|p| p.reachable()));
        assert!(marked.segment_pairs().iter().all(|p| !p.reachable()));
    }

    fn arb_topology() -> impl Strategy<Value = ClusterTopology> {
        (1usize..12, prop::collection::vec(0usize..4, 12)).prop_map(|(contents, hosts)| {
            let mut rows = vec!["1|-1|p|p|n|u|cdw|cdw|5432|/c".parse::<Segment>().unwrap()];
            for content in 0..contents {
                let host = hosts[content];
                let mirror_host = (host + 1) % 4;
                rows.push(
                    format!("{}|{content}|p|p|s|u|sdw{host}|sdw{host}|{}|/p{content}",
                        content * 2 + 2, 6000 + content)
                        .parse()
                        .unwrap(),
                );
                rows.push(
                    format!("{}|{content}|m|m|s|u|sdw{mirror_host}|sdw{mirror_host}|{}|/m{content}",
                        content * 2 + 3, 7000 + content)
                        .parse()
                        .unwrap(),
                );
            }
            ClusterTopology::new(rows).unwrap()
        })
    }

    proptest! {
        #[test]
        fn prop_host_grouping_partitions_segments(topo in arb_topology()) {
            let grouped = ClusterTopology::segments_by_host(topo.get_seg_db_list());
            let total: usize = grouped.values().map(Vec::len).sum();
            prop_assert_eq!(total, topo.get_seg_db_list().len());
            for (host, segs) in &grouped {
                prop_assert!(segs.iter().all(|s| &s.hostname == host));
            }
        }

        #[test]
        fn prop_pipe_format_reparses(topo in arb_topology()) {
            let reparsed = ClusterTopology::from_pipe_format(&topo.to_pipe_format()).unwrap();
            prop_assert_eq!(reparsed.get_db_list().len(), topo.get_db_list().len());
            prop_assert_eq!(reparsed.segment_pairs(), topo.segment_pairs());
        }
    }
}
