//! Recovery directives
//!
//! Operators name the segments to recover as `address|port|datadir`, optionally
//! followed by a second group giving a new location to rebuild the segment
//! at. Directives come from an input file (one per line, `#` comments) or
//! inline via `--confinfo` (comma separated).

use segrecover_core::{ClusterTopology, Segment};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Directive errors
#[derive(Error, Debug)]
pub enum DirectiveError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("No segments to recover were given")]
    Empty,

    #[error("A segment to recover was not found in configuration: '{location}' on input line {line}")]
    NotFound { location: String, line: usize },

    #[error("A segment to recover was given more than once: '{location}' on input line {line}")]
    Duplicate { location: String, line: usize },

    #[error("Failed to read directive file: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DirectiveError>;

/// `address|port|datadir`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentLocation {
    pub address: String,
    pub port: u16,
    pub datadir: String,
}

impl SegmentLocation {
    pub fn of(segment: &Segment) -> Self {
        Self {
            address: segment.address.clone(),
            port: segment.port,
            datadir: segment.datadir.clone(),
        }
    }

    pub fn matches(&self, segment: &Segment) -> bool {
        self.address == segment.address
            && self.port == segment.port
            && self.datadir == segment.datadir
    }
}

impl FromStr for SegmentLocation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() != 3 {
            return Err(format!(
                "expected 3 parts in '{}' (address|port|datadir), found {}",
                s,
                parts.len()
            ));
        }
        let address = parts[0].trim();
        if address.is_empty() {
            return Err(format!("empty address in '{}'", s));
        }
        let port = parts[1]
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}'", parts[1]))?;
        let datadir = normalize_datadir(parts[2].trim())?;
        Ok(Self {
            address: address.to_string(),
            port,
            datadir,
        })
    }
}

impl fmt::Display for SegmentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.address, self.port, self.datadir)
    }
}

/// Data directories must be absolute; trailing slashes are dropped
fn normalize_datadir(dir: &str) -> std::result::Result<String, String> {
    if !dir.starts_with('/') {
        return Err(format!("data directory '{}' must be an absolute path", dir));
    }
    let trimmed = dir.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() })
}

/// One requested recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDirective {
    pub failed: SegmentLocation,
    /// Rebuild the segment here instead of in place
    pub relocate_to: Option<SegmentLocation>,
    /// 1-based source line, for error messages
    pub line: usize,
}

impl fmt::Display for RecoveryDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.failed)?;
        if let Some(target) = &self.relocate_to {
            write!(f, " {}", target)?;
        }
        Ok(())
    }
}

fn parse_entry(entry: &str, line: usize) -> Result<RecoveryDirective> {
    let groups: Vec<&str> = entry.split_whitespace().collect();
    if groups.is_empty() || groups.len() > 2 {
        return Err(DirectiveError::Syntax {
            line,
            message: format!("expected 1 or 2 groups but found {}", groups.len()),
        });
    }
    let failed = groups[0]
        .parse::<SegmentLocation>()
        .map_err(|message| DirectiveError::Syntax { line, message })?;
    let relocate_to = match groups.get(1) {
        Some(group) => Some(
            group
                .parse::<SegmentLocation>()
                .map_err(|message| DirectiveError::Syntax { line, message })?,
        ),
        None => None,
    };
    Ok(RecoveryDirective {
        failed,
        relocate_to,
        line,
    })
}

/// Parse file contents: one directive per line
pub fn parse_directives(text: &str) -> Result<Vec<RecoveryDirective>> {
    let mut directives = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        directives.push(parse_entry(line, idx + 1)?);
    }
    if directives.is_empty() {
        return Err(DirectiveError::Empty);
    }
    Ok(directives)
}

/// Parse an inline `--confinfo` value: directives separated by commas
pub fn parse_confinfo(value: &str) -> Result<Vec<RecoveryDirective>> {
    let mut directives = Vec::new();
    for (idx, entry) in value.split(',').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        directives.push(parse_entry(entry, idx + 1)?);
    }
    if directives.is_empty() {
        return Err(DirectiveError::Empty);
    }
    Ok(directives)
}

pub fn read_directive_file(path: impl AsRef<Path>) -> Result<Vec<RecoveryDirective>> {
    let text = std::fs::read_to_string(path)?;
    parse_directives(&text)
}

/// A directive matched against the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDirective {
    pub dbid: i32,
    pub relocate_to: Option<SegmentLocation>,
}

/// Match every directive to exactly one segment
pub fn resolve(
    directives: &[RecoveryDirective],
    topology: &ClusterTopology,
) -> Result<Vec<ResolvedDirective>> {
    if directives.is_empty() {
        return Err(DirectiveError::Empty);
    }

    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(directives.len());
    for directive in directives {
        let matches: Vec<&Segment> = topology
            .get_db_list()
            .into_iter()
            .filter(|s| directive.failed.matches(s))
            .collect();

        let segment = match matches.as_slice() {
            [one] => *one,
            [] => {
                return Err(DirectiveError::NotFound {
                    location: directive.failed.to_string(),
                    line: directive.line,
                })
            }
            _ => {
                return Err(DirectiveError::Duplicate {
                    location: directive.failed.to_string(),
                    line: directive.line,
                })
            }
        };

        if !seen.insert(segment.dbid) {
            return Err(DirectiveError::Duplicate {
                location: directive.failed.to_string(),
                line: directive.line,
            });
        }
        resolved.push(ResolvedDirective {
            dbid: segment.dbid,
            relocate_to: directive.relocate_to.clone(),
        });
    }
    Ok(resolved)
}

/// Lines accepted back by `parse_directives`, one per segment
pub fn render_directives<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a Segment, Option<&'a SegmentLocation>)>,
{
    let mut out = String::new();
    for (segment, relocate_to) in entries {
        out.push_str(&SegmentLocation::of(segment).to_string());
        if let Some(target) = relocate_to {
            out.push(' ');
            out.push_str(&target.to_string());
        }
        out.push('\n');
    }
    out
}
