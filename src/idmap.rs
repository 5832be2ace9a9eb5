//! Subordinate UID/GID resolution.
//!
//! Produces the argument vectors for `newuidmap`/`newgidmap` from either the
//! static `/etc/subuid` + `/etc/subgid` files or the dynamic `getsubids`
//! helper. The resolver never touches the kernel; the parent execs the
//! mapping tools with the child's PID.

use crate::errors::IdmapError;
use lazy_static::lazy_static;
use nix::unistd::{self, User};
use regex::Regex;
use std::{env, fs, path::Path, process::Command};

const SUBUID_FILE: &str = "/etc/subuid";
const SUBGID_FILE: &str = "/etc/subgid";

/// One contiguous range of subordinate ids delegated to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubIdRange {
    pub start: u32,
    pub length: u32,
}

impl SubIdRange {
    fn validate(self) -> Result<SubIdRange, IdmapError> {
        if self.start as u64 + self.length as u64 > 1 << 32 {
            return Err(IdmapError::RangeOverflow {
                start: self.start,
                length: self.length,
            });
        }
        Ok(self)
    }
}

/// Where subordinate ranges come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubidSource {
    /// Try dynamic, fall back to static.
    Auto,
    /// `/etc/subuid` and `/etc/subgid`.
    Static,
    /// `getsubids(1)`.
    Dynamic,
}

impl std::str::FromStr for SubidSource {
    type Err = String;

    fn from_str(s: &str) -> Result<SubidSource, String> {
        match s {
            "" | "auto" => Ok(SubidSource::Auto),
            "static" => Ok(SubidSource::Static),
            "dynamic" => Ok(SubidSource::Dynamic),
            other => Err(format!("unknown subid source {:?}", other)),
        }
    }
}

/// Argument vectors for `newuidmap <pid>` and `newgidmap <pid>`.
#[derive(Debug, Clone)]
pub struct IdMaps {
    pub uid_args: Vec<String>,
    pub gid_args: Vec<String>,
}

/// Resolve the caller's subordinate ranges and pack them into mapping argv.
pub fn resolve(source: SubidSource) -> Result<IdMaps, IdmapError> {
    let uid = unistd::getuid();
    let user = User::from_uid(uid)
        .map_err(|e| IdmapError::Io(e.into()))?
        .ok_or_else(|| IdmapError::UnknownUser(uid.as_raw()))?;
    let (subuids, subgids) = get_subid_ranges(uid.as_raw(), &user.name, source)?;
    log::debug!("subuid ranges={:?}", subuids);
    log::debug!("subgid ranges={:?}", subgids);
    Ok(IdMaps {
        uid_args: pack_ranges(uid.as_raw(), &subuids)?,
        gid_args: pack_ranges(user.gid.as_raw(), &subgids)?,
    })
}

/// Fetch subordinate uid and gid ranges for one user from the given source.
pub fn get_subid_ranges(
    uid: u32,
    username: &str,
    source: SubidSource,
) -> Result<(Vec<SubIdRange>, Vec<SubIdRange>), IdmapError> {
    match source {
        SubidSource::Static => {
            log::debug!("subid-source: using the static source");
            static_ranges(uid, username)
        }
        SubidSource::Dynamic => {
            log::debug!("subid-source: using the dynamic source");
            dynamic_ranges(uid, username)
        }
        SubidSource::Auto => match dynamic_ranges(uid, username) {
            Ok((u, g)) if !u.is_empty() && !g.is_empty() => Ok((u, g)),
            other => {
                if let Err(err) = other {
                    log::debug!("dynamic subid source failed ({}), falling back to static", err);
                }
                static_ranges(uid, username)
            }
        },
    }
}

/// The first triple maps container 0 to the caller; subsequent triples pack
/// the subordinate ranges starting at container id 1.
fn pack_ranges(caller_id: u32, ranges: &[SubIdRange]) -> Result<Vec<String>, IdmapError> {
    let mut args = vec!["0".to_string(), caller_id.to_string(), "1".to_string()];
    let mut next: u64 = 1;
    for range in ranges {
        range.validate()?;
        args.push(next.to_string());
        args.push(range.start.to_string());
        args.push(range.length.to_string());
        next += range.length as u64;
        if next > 1 << 32 {
            return Err(IdmapError::RangeOverflow {
                start: range.start,
                length: range.length,
            });
        }
    }
    Ok(args)
}

fn static_ranges(
    uid: u32,
    username: &str,
) -> Result<(Vec<SubIdRange>, Vec<SubIdRange>), IdmapError> {
    let subuids = parse_subid_file(Path::new(SUBUID_FILE), uid, username)?;
    let subgids = parse_subid_file(Path::new(SUBGID_FILE), uid, username)?;
    if subuids.is_empty() {
        return Err(IdmapError::NoRanges {
            kind: "uid",
            uid,
            username: username.to_string(),
        });
    }
    if subgids.is_empty() {
        return Err(IdmapError::NoRanges {
            kind: "gid",
            uid,
            username: username.to_string(),
        });
    }
    Ok((subuids, subgids))
}

fn parse_subid_file(path: &Path, uid: u32, username: &str) -> Result<Vec<SubIdRange>, IdmapError> {
    let content = fs::read_to_string(path)?;
    parse_subid_content(&content, path, uid, username)
}

/// Lines are `name_or_uid:start:length`; blanks and `#` comments are skipped,
/// anything else malformed is rejected.
fn parse_subid_content(
    content: &str,
    path: &Path,
    uid: u32,
    username: &str,
) -> Result<Vec<SubIdRange>, IdmapError> {
    let uid_str = uid.to_string();
    let mut ranges = Vec::new();
    for (i, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = || IdmapError::MalformedLine {
            path: path.to_path_buf(),
            lineno: i + 1,
            line: raw.to_string(),
        };
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() != 3 {
            return Err(malformed());
        }
        if parts[0] != uid_str && (username.is_empty() || parts[0] != username) {
            continue;
        }
        let start: u32 = parts[1].parse().map_err(|_| malformed())?;
        let length: u32 = parts[2].parse().map_err(|_| malformed())?;
        ranges.push(SubIdRange { start, length }.validate()?);
    }
    Ok(ranges)
}

fn dynamic_ranges(
    uid: u32,
    username: &str,
) -> Result<(Vec<SubIdRange>, Vec<SubIdRange>), IdmapError> {
    let exe = env::var("GETSUBIDS").unwrap_or_else(|_| "getsubids".to_string());
    let uids = combined_getsubids(&exe, false, uid, username)?;
    let gids = combined_getsubids(&exe, true, uid, username)?;
    Ok((uids, gids))
}

/// Query by username and by uid, tolerating the failure of one iff the
/// other succeeds; deduplicate the union.
fn combined_getsubids(
    exe: &str,
    groups: bool,
    uid: u32,
    username: &str,
) -> Result<Vec<SubIdRange>, IdmapError> {
    let by_name = exec_getsubids(exe, groups, username);
    let by_uid = exec_getsubids(exe, groups, &uid.to_string());
    if let Err(err) = &by_name {
        log::debug!("getsubids by username {:?} failed: {}", username, err);
    }
    if let Err(err) = &by_uid {
        log::debug!("getsubids by uid {} failed: {}", uid, err);
    }
    match (by_name, by_uid) {
        (Err(err), Err(_)) => Err(err),
        (by_name, by_uid) => {
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for range in by_name
                .into_iter()
                .flatten()
                .chain(by_uid.into_iter().flatten())
            {
                if seen.insert(range) {
                    out.push(range);
                }
            }
            Ok(out)
        }
    }
}

fn exec_getsubids(exe: &str, groups: bool, subject: &str) -> Result<Vec<SubIdRange>, IdmapError> {
    let mut argv = vec![exe.to_string()];
    if groups {
        argv.push("-g".to_string());
    }
    argv.push(subject.to_string());
    log::debug!("executing {:?}", argv);
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .map_err(|e| IdmapError::HelperFailed {
            argv: argv.clone(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(IdmapError::HelperFailed {
            argv,
            message: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    parse_getsubids_output(&String::from_utf8_lossy(&output.stdout))
}

lazy_static! {
    // e.g. "0: foo 100000 65536"
    static ref GETSUBIDS_LINE: Regex =
        Regex::new(r"^[0-9]+:\s*(\S+)\s+([0-9]+)\s+([0-9]+)\s*$").unwrap();
}

fn parse_getsubids_output(out: &str) -> Result<Vec<SubIdRange>, IdmapError> {
    let mut ranges = Vec::new();
    for (i, raw) in out.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let captures = GETSUBIDS_LINE
            .captures(line)
            .ok_or_else(|| IdmapError::MalformedGetsubids {
                lineno: i + 1,
                line: raw.to_string(),
            })?;
        let malformed = || IdmapError::MalformedGetsubids {
            lineno: i + 1,
            line: raw.to_string(),
        };
        let start: u32 = captures[2].parse().map_err(|_| malformed())?;
        let length: u32 = captures[3].parse().map_err(|_| malformed())?;
        ranges.push(SubIdRange { start, length }.validate()?);
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_file_parsing() {
        let content = "\n# comment\nfoo:100000:65536\n1000:300000:1000\nbar:200000:65536\n";
        let ranges =
            parse_subid_content(content, Path::new("/etc/subuid"), 1000, "foo").unwrap();
        assert_eq!(
            ranges,
            vec![
                SubIdRange {
                    start: 100000,
                    length: 65536
                },
                SubIdRange {
                    start: 300000,
                    length: 1000
                },
            ]
        );
    }

    #[test]
    fn static_file_rejects_malformed() {
        let err = parse_subid_content("foo:100000", Path::new("/etc/subuid"), 1000, "foo")
            .unwrap_err();
        assert!(matches!(err, IdmapError::MalformedLine { lineno: 1, .. }));

        let err = parse_subid_content(
            "foo:abc:65536",
            Path::new("/etc/subuid"),
            1000,
            "foo",
        )
        .unwrap_err();
        assert!(matches!(err, IdmapError::MalformedLine { .. }));
    }

    #[test]
    fn static_file_range_overflow() {
        let err = parse_subid_content(
            "foo:4294967295:2",
            Path::new("/etc/subuid"),
            1000,
            "foo",
        )
        .unwrap_err();
        assert!(matches!(err, IdmapError::RangeOverflow { .. }));
    }

    #[test]
    fn getsubids_parsing() {
        let out = "0: foo 100000 65536\n1: foo 300000 1000\n";
        let ranges = parse_getsubids_output(out).unwrap();
        assert_eq!(
            ranges,
            vec![
                SubIdRange {
                    start: 100000,
                    length: 65536
                },
                SubIdRange {
                    start: 300000,
                    length: 1000
                },
            ]
        );
    }

    #[test]
    fn getsubids_rejects_garbage() {
        let err = parse_getsubids_output("once upon a time\n").unwrap_err();
        assert!(matches!(err, IdmapError::MalformedGetsubids { lineno: 1, .. }));
    }

    #[test]
    fn packing_assigns_sequential_container_ids() {
        let ranges = vec![
            SubIdRange {
                start: 100000,
                length: 65536,
            },
            SubIdRange {
                start: 300000,
                length: 1000,
            },
        ];
        let args = pack_ranges(1000, &ranges).unwrap();
        assert_eq!(
            args,
            vec![
                "0", "1000", "1", // container root is the caller
                "1", "100000", "65536", "65537", "300000", "1000",
            ]
        );
    }

    #[test]
    fn packing_with_no_ranges_still_maps_root() {
        let args = pack_ranges(1000, &[]).unwrap();
        assert_eq!(args, vec!["0", "1000", "1"]);
    }
}
