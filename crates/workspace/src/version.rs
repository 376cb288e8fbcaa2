use std::fmt;
use std::str::FromStr;

use buildfarm_protocol::VersionBump;

use crate::WorkspaceError;

/// `major.minor.patch[.build]` project version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: Option<u32>,
}

impl Version {
    /// Applies the requested bumps from most to least significant.
    ///
    /// Bumping a component resets every component below it; the build
    /// number is dropped unless it is bumped too. Fails if a bumped
    /// component is already `u32::MAX`.
    pub fn bump(self, flags: VersionBump) -> Result<Self, WorkspaceError> {
        let overflow = || WorkspaceError::VersionOverflow(self.to_string());
        let mut v = self;
        if flags.major {
            v = Version {
                major: v.major.checked_add(1).ok_or_else(overflow)?,
                minor: 0,
                patch: 0,
                build: None,
            };
        }
        if flags.minor {
            v = Version {
                minor: v.minor.checked_add(1).ok_or_else(overflow)?,
                patch: 0,
                build: None,
                ..v
            };
        }
        if flags.patch {
            v = Version {
                patch: v.patch.checked_add(1).ok_or_else(overflow)?,
                build: None,
                ..v
            };
        }
        if flags.build {
            let keep = if flags.major || flags.minor || flags.patch {
                None
            } else {
                self.build
            };
            v.build = Some(match keep {
                Some(b) => b.checked_add(1).ok_or_else(overflow)?,
                None => 1,
            });
        }
        Ok(v)
    }
}

impl FromStr for Version {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('.').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(WorkspaceError::InvalidVersion(trimmed.to_string()));
        }
        let parse = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| WorkspaceError::InvalidVersion(trimmed.to_string()))
        };
        Ok(Version {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parse(parts[2])?,
            build: parts.get(3).map(|p| parse(p)).transpose()?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(build) = self.build {
            write!(f, ".{build}")?;
        }
        Ok(())
    }
}
