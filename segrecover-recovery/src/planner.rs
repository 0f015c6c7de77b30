//! Segment recovery planning
//!
//! Planning runs in two passes around target assessment:
//! 1. [`find_candidates`] picks the segments to rebuild and their donors
//!    from the topology (and any directives)
//! 2. [`Planner::plan`] chooses full or incremental recovery per target
//!    from what assessment found on disk
//!
//! Problems with one segment never abort planning. They are collected as
//! validation failures and the caller decides what to do with them.

use segrecover_core::{ClusterTopology, Segment};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use crate::assess::{DirectoryState, TargetAssessment, TimelineRelation};
use crate::confinfo::{ResolvedDirective, SegmentLocation};
use crate::report::{FailureStage, SegmentFailure};

/// How a target is rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// Copy the whole data directory from the donor (`pg_basebackup`)
    Full,
    /// Replay divergent history from the donor (`pg_rewind`)
    Incremental,
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryKind::Full => f.write_str("Full"),
            RecoveryKind::Incremental => f.write_str("Incremental"),
        }
    }
}

/// A segment selected for recovery, before its method is chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryCandidate {
    /// Segment to rebuild, at its new location when relocated
    pub target: Segment,
    /// Up peer to copy from
    pub donor: Segment,
    /// Target moves to a new location
    pub failover: bool,
}

/// Candidates plus the segments that could not become candidates
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub candidates: Vec<RecoveryCandidate>,
    pub failures: Vec<SegmentFailure>,
}

impl CandidateSet {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty() && self.failures.is_empty()
    }
}

/// Select segments to recover.
///
/// Without directives every down segment with an up peer is selected.
/// With directives only the named segments are, optionally relocated.
pub fn find_candidates(
    topology: &ClusterTopology,
    directives: Option<&[ResolvedDirective]>,
) -> CandidateSet {
    let requested: Option<HashMap<i32, Option<&SegmentLocation>>> = directives.map(|ds| {
        ds.iter()
            .map(|d| (d.dbid, d.relocate_to.as_ref()))
            .collect()
    });

    let mut set = CandidateSet::default();
    for pair in topology.segment_pairs() {
        let down = pair.down_members();
        let wanted: Vec<&Segment> = match &requested {
            None => down.clone(),
            Some(req) => pair.members().filter(|s| req.contains_key(&s.dbid)).collect(),
        };

        for segment in wanted {
            let fail = |message: String| SegmentFailure::new(segment.dbid, FailureStage::Validation, message);

            if segment.is_up() {
                set.failures.push(fail(format!(
                    "segment {} is up; only down segments can be recovered",
                    segment.location()
                )));
                continue;
            }
            if down.len() > 1 {
                set.failures.push(fail(format!(
                    "both segments for content {} are down; no peer to recover from",
                    pair.content()
                )));
                continue;
            }
            let Some(donor) = pair.peer_of(segment.dbid) else {
                set.failures.push(fail(format!(
                    "segment {} has no mirror to recover from",
                    segment.location()
                )));
                continue;
            };
            if !donor.is_primary() {
                set.failures.push(fail(format!(
                    "peer {} of segment {} is not acting as primary",
                    donor.location(),
                    segment.location()
                )));
                continue;
            }

            let relocate_to = requested
                .as_ref()
                .and_then(|req| req.get(&segment.dbid).copied().flatten());
            let mut target = segment.clone();
            let failover = match relocate_to {
                Some(loc) if !loc.matches(segment) => {
                    target.hostname = loc.address.clone();
                    target.address = loc.address.clone();
                    target.port = loc.port;
                    target.datadir = loc.datadir.clone();
                    true
                }
                _ => false,
            };

            set.candidates.push(RecoveryCandidate {
                target,
                donor: donor.clone(),
                failover,
            });
        }
    }

    reject_relocation_conflicts(topology, &mut set);
    set
}

/// Relocated targets may not reuse a port or data directory already taken on
/// their host, by the cluster or by another relocation.
fn reject_relocation_conflicts(topology: &ClusterTopology, set: &mut CandidateSet) {
    let relocated: HashSet<i32> = set
        .candidates
        .iter()
        .filter(|c| c.failover)
        .map(|c| c.target.dbid)
        .collect();
    if relocated.is_empty() {
        return;
    }

    let mut ports: HashSet<(String, u16)> = HashSet::new();
    let mut dirs: HashSet<(String, String)> = HashSet::new();
    for seg in topology.get_db_list() {
        if relocated.contains(&seg.dbid) {
            continue;
        }
        ports.insert((seg.hostname.clone(), seg.port));
        dirs.insert((seg.hostname.clone(), seg.datadir.clone()));
    }

    let mut kept = Vec::with_capacity(set.candidates.len());
    for candidate in set.candidates.drain(..) {
        if !candidate.failover {
            kept.push(candidate);
            continue;
        }
        let target = &candidate.target;
        let port_free = ports.insert((target.hostname.clone(), target.port));
        let dir_free = dirs.insert((target.hostname.clone(), target.datadir.clone()));
        if port_free && dir_free {
            kept.push(candidate);
        } else {
            set.failures.push(SegmentFailure::new(
                target.dbid,
                FailureStage::Validation,
                format!(
                    "relocation target {} conflicts with an existing port or data directory",
                    target.location()
                ),
            ));
        }
    }
    set.candidates = kept;
}

/// Planner inputs that come from configuration
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub force_full: bool,
    pub force_overwrite: bool,
    /// Directory on the target host receiving progress files
    pub log_dir: PathBuf,
    /// `%Y%m%d_%H%M%S` stamp shared by every file of one run
    pub timestamp: String,
}

/// One planned recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryInfo {
    pub target: Segment,
    pub donor: Segment,
    pub kind: RecoveryKind,
    /// Remove the target data directory before copying
    pub clear_target: bool,
    pub failover: bool,
    /// Progress file on the target host
    pub progress_file: PathBuf,
}

impl RecoveryInfo {
    pub fn dbid(&self) -> i32 {
        self.target.dbid
    }

    pub fn is_full(&self) -> bool {
        self.kind == RecoveryKind::Full
    }

    pub fn progress_path(&self) -> String {
        self.progress_file.to_string_lossy().into_owned()
    }
}

impl fmt::Display for RecoveryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Recovery type              = {}", self.kind)?;
        writeln!(f, "Failed instance            = {}", self.target.dbid)?;
        writeln!(f, "Recovery target host       = {}", self.target.hostname)?;
        writeln!(f, "Recovery target port       = {}", self.target.port)?;
        writeln!(f, "Recovery target datadir    = {}", self.target.datadir)?;
        writeln!(f, "Recovery source host       = {}", self.donor.hostname)?;
        writeln!(f, "Recovery source port       = {}", self.donor.port)?;
        write!(f, "Recovery source datadir    = {}", self.donor.datadir)
    }
}

/// Result of planning: what to run and what was rejected
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    pub infos: Vec<RecoveryInfo>,
    pub failures: Vec<SegmentFailure>,
}

impl RecoveryPlan {
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn full_count(&self) -> usize {
        self.infos.iter().filter(|i| i.is_full()).count()
    }

    /// Operator-facing plan listing
    pub fn display(&self) -> String {
        let mut out = format!(
            "Recovery of {} segment(s): {} full, {} incremental",
            self.infos.len(),
            self.full_count(),
            self.infos.len() - self.full_count()
        );
        for (idx, info) in self.infos.iter().enumerate() {
            out.push_str(&format!("\n---- Recovery {} of {} ----\n", idx + 1, self.infos.len()));
            out.push_str(&info.to_string());
        }
        out
    }
}

/// Chooses the recovery method per candidate
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Whether assessment needs to read timelines at all
    pub fn needs_timelines(&self) -> bool {
        !self.config.force_full
    }

    /// Turn assessed candidates into a plan. Each dbid is planned at most once.
    pub fn plan(
        &self,
        set: CandidateSet,
        assessments: &HashMap<i32, TargetAssessment>,
    ) -> RecoveryPlan {
        let mut plan = RecoveryPlan {
            infos: Vec::with_capacity(set.candidates.len()),
            failures: set.failures,
        };
        let mut planned = HashSet::new();

        for candidate in set.candidates {
            let dbid = candidate.target.dbid;
            if !planned.insert(dbid) {
                continue;
            }
            let assessment = assessments.get(&dbid).copied().unwrap_or_default();
            match self.plan_one(candidate, assessment) {
                Ok(info) => plan.infos.push(info),
                Err(failure) => plan.failures.push(failure),
            }
        }
        plan
    }

    fn plan_one(
        &self,
        candidate: RecoveryCandidate,
        assessment: TargetAssessment,
    ) -> Result<RecoveryInfo, SegmentFailure> {
        let RecoveryCandidate {
            target,
            donor,
            failover,
        } = candidate;

        let directory_usable = matches!(assessment.directory, DirectoryState::NonEmpty);
        let kind = if self.config.force_full
            || failover
            || !directory_usable
            || assessment.timeline != TimelineRelation::Ancestor
        {
            RecoveryKind::Full
        } else {
            RecoveryKind::Incremental
        };

        let clear_target = match (kind, assessment.directory) {
            (RecoveryKind::Incremental, _) => false,
            (RecoveryKind::Full, DirectoryState::Missing | DirectoryState::Empty) => false,
            (RecoveryKind::Full, _) if self.config.force_overwrite => true,
            (RecoveryKind::Full, state) => {
                let reason = if state == DirectoryState::Unknown {
                    "could not be inspected"
                } else {
                    "exists and is not empty"
                };
                return Err(SegmentFailure::new(
                    target.dbid,
                    FailureStage::Validation,
                    format!(
                        "target directory {}:{} {}; use --force-overwrite to replace it",
                        target.hostname, target.datadir, reason
                    ),
                ));
            }
        };

        let tool = match kind {
            RecoveryKind::Full => "pg_basebackup",
            RecoveryKind::Incremental => "pg_rewind",
        };
        let progress_file = self.config.log_dir.join(format!(
            "{}.{}.dbid{}.out",
            tool, self.config.timestamp, target.dbid
        ));

        Ok(RecoveryInfo {
            target,
            donor,
            kind,
            clear_target,
            failover,
            progress_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ONE_DOWN: &str = "\
1|-1|p|p|n|u|cdw|cdw|5432|/data/c
2|0|p|p|n|u|sdw1|sdw1|6000|/data/p0
4|0|m|m|n|d|sdw2|sdw2|7000|/data/m0
3|1|p|p|s|u|sdw2|sdw2|6000|/data/p1
5|1|m|m|s|u|sdw1|sdw1|7000|/data/m1
";

    fn planner(force_full: bool, force_overwrite: bool) -> Planner {
        Planner::new(PlannerConfig {
            force_full,
            force_overwrite,
            log_dir: PathBuf::from("/home/gpadmin/gpAdminLogs"),
            timestamp: "20260101_120000".to_string(),
        })
    }

    fn assessed(dbid: i32, directory: DirectoryState, timeline: TimelineRelation) -> HashMap<i32, TargetAssessment> {
        HashMap::from([(dbid, TargetAssessment { directory, timeline })])
    }

    #[test]
    fn test_down_mirror_is_candidate() {
        let topo = ClusterTopology::from_pipe_format(ONE_DOWN).unwrap();
        let set = find_candidates(&topo, None);
        assert!(set.failures.is_empty());
        assert_eq!(set.candidates.len(), 1);
        assert_eq!(set.candidates[0].target.dbid, 4);
        assert_eq!(set.candidates[0].donor.dbid, 2);
        assert!(!set.candidates[0].failover);
    }

    #[test]
    fn test_incremental_when_timeline_is_ancestor() {
        let topo = ClusterTopology::from_pipe_format(ONE_DOWN).unwrap();
        let plan = planner(false, false).plan(
            find_candidates(&topo, None),
            &assessed(4, DirectoryState::NonEmpty, TimelineRelation::Ancestor),
        );
        assert_eq!(plan.infos.len(), 1);
        let info = &plan.infos[0];
        assert_eq!(info.kind, RecoveryKind::Incremental);
        assert!(!info.clear_target);
        assert_eq!(
            info.progress_path(),
            "/home/gpadmin/gpAdminLogs/pg_rewind.20260101_120000.dbid4.out"
        );
    }

    #[test]
    fn test_full_when_diverged_or_missing() {
        let topo = ClusterTopology::from_pipe_format(ONE_DOWN).unwrap();
        let plan = planner(false, true).plan(
            find_candidates(&topo, None),
            &assessed(4, DirectoryState::NonEmpty, TimelineRelation::Diverged),
        );
        assert_eq!(plan.infos[0].kind, RecoveryKind::Full);
        assert!(plan.infos[0].clear_target);

        let plan = planner(false, false).plan(
            find_candidates(&topo, None),
            &assessed(4, DirectoryState::Missing, TimelineRelation::Unknown),
        );
        assert_eq!(plan.infos[0].kind, RecoveryKind::Full);
        assert!(!plan.infos[0].clear_target);
        assert!(plan.infos[0].progress_path().contains("pg_basebackup."));
    }

    #[test]
    fn test_in_place_full_into_populated_directory_needs_overwrite() {
        let topo = ClusterTopology::from_pipe_format(ONE_DOWN).unwrap();
        for timeline in [TimelineRelation::Unknown, TimelineRelation::Diverged] {
            let plan = planner(true, false).plan(
                find_candidates(&topo, None),
                &assessed(4, DirectoryState::NonEmpty, timeline),
            );
            assert!(plan.infos.is_empty());
            assert!(plan.has_failures());
            assert_eq!(plan.failures[0].dbid, 4);
            assert_eq!(plan.failures[0].stage, FailureStage::Validation);
            assert!(plan.failures[0].message.contains("--force-overwrite"));
        }

        // directory could not be inspected
        let plan = planner(false, false).plan(find_candidates(&topo, None), &HashMap::new());
        assert!(plan.infos.is_empty());
        assert!(plan.failures[0].message.contains("could not be inspected"));

        let plan = planner(true, true).plan(
            find_candidates(&topo, None),
            &assessed(4, DirectoryState::NonEmpty, TimelineRelation::Unknown),
        );
        assert!(!plan.has_failures());
        assert!(plan.infos[0].clear_target);
    }

    #[test]
    fn test_relocation_into_populated_directory() {
        let topo = ClusterTopology::from_pipe_format(ONE_DOWN).unwrap();
        let directives = vec![ResolvedDirective {
            dbid: 4,
            relocate_to: Some("sdw3|7000|/data/m0".parse().unwrap()),
        }];

        let set = find_candidates(&topo, Some(&directives));
        assert!(set.candidates[0].failover);
        assert_eq!(set.candidates[0].target.hostname, "sdw3");
        let plan = planner(false, false).plan(
            set,
            &assessed(4, DirectoryState::NonEmpty, TimelineRelation::Unknown),
        );
        assert!(plan.infos.is_empty());
        assert_eq!(plan.failures[0].stage, FailureStage::Validation);

        let plan = planner(false, true).plan(
            find_candidates(&topo, Some(&directives)),
            &assessed(4, DirectoryState::NonEmpty, TimelineRelation::Unknown),
        );
        assert_eq!(plan.infos[0].kind, RecoveryKind::Full);
        assert!(plan.infos[0].clear_target);
    }

    #[test]
    fn test_relocation_conflict() {
        let topo = ClusterTopology::from_pipe_format(ONE_DOWN).unwrap();
        let directives = vec![ResolvedDirective {
            dbid: 4,
            relocate_to: Some("sdw1|7000|/data/new".parse().unwrap()),
        }];
        let set = find_candidates(&topo, Some(&directives));
        assert!(set.candidates.is_empty());
        assert!(set.failures[0].message.contains("conflicts"));
    }

    #[test]
    fn test_invalid_requests_are_failures() {
        let both_down = "\
1|-1|p|p|n|u|cdw|cdw|5432|/data/c
2|0|p|p|n|d|sdw1|sdw1|6000|/data/p0
4|0|m|m|n|d|sdw2|sdw2|7000|/data/m0
";
        let topo = ClusterTopology::from_pipe_format(both_down).unwrap();
        let set = find_candidates(&topo, None);
        assert!(set.candidates.is_empty());
        assert_eq!(set.failures.len(), 2);

        let topo = ClusterTopology::from_pipe_format(ONE_DOWN).unwrap();
        let up = vec![ResolvedDirective { dbid: 3, relocate_to: None }];
        let set = find_candidates(&topo, Some(&up));
        assert!(set.candidates.is_empty());
        assert!(set.failures[0].message.contains("is up"));
    }

    #[test]
    fn test_plan_display() {
        let topo = ClusterTopology::from_pipe_format(ONE_DOWN).unwrap();
        let plan = planner(true, false).plan(
            find_candidates(&topo, None),
            &assessed(4, DirectoryState::Empty, TimelineRelation::Unknown),
        );
        let text = plan.display();
        assert!(text.starts_with("Recovery of 1 segment(s): 1 full, 0 incremental"));
        assert!(text.contains("Recovery source host       = sdw1"));
    }

    fn topology_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 1..6).prop_map(|pairs| {
            let mut text = String::from("1|-1|p|p|n|u|cdw|cdw|5432|/data/c\n");
            for (content, (primary_up, mirror_up, swapped)) in pairs.into_iter().enumerate() {
                let p_dbid = 2 + content as i32 * 2;
                let (p_role, m_role) = if swapped { ('m', 'p') } else { ('p', 'm') };
                let p_status = if primary_up { 'u' } else { 'd' };
                let m_status = if mirror_up { 'u' } else { 'd' };
                text.push_str(&format!(
                    "{}|{}|{}|p|n|{}|sdw1|sdw1|{}|/data/p{}\n",
                    p_dbid, content, p_role, p_status, 6000 + content, content
                ));
                text.push_str(&format!(
                    "{}|{}|{}|m|n|{}|sdw2|sdw2|{}|/data/m{}\n",
                    p_dbid + 1, content, m_role, m_status, 7000 + content, content
                ));
            }
            text
        })
    }

    proptest! {
        #[test]
        fn prop_each_down_segment_planned_at_most_once(text in topology_strategy()) {
            let topo = ClusterTopology::from_pipe_format(&text).unwrap();
            let plan = planner(true, true).plan(find_candidates(&topo, None), &HashMap::new());

            let mut seen = HashSet::new();
            for info in &plan.infos {
                prop_assert!(seen.insert(info.dbid()));
                let original = topo.segment_by_dbid(info.dbid()).unwrap();
                prop_assert!(original.is_down());
                prop_assert!(info.donor.is_up() && info.donor.is_primary());
            }
            let healthy = topo.segment_pairs().iter().all(|p| p.down_members().is_empty());
            if healthy {
                prop_assert!(plan.is_empty() && !plan.has_failures());
            }
        }
    }
}
