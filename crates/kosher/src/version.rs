// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Version specs and matching against installed runtime versions.

use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};

use crate::Error;

#[cfg(test)]
#[path = "./version_test.rs"]
mod version_test;

/// What kind of request a version spec makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind {
    /// A full `X.Y.Z` version.
    Exact,
    /// `X` or `X.Y`: any version sharing that prefix.
    Partial,
    /// An operator-based range such as `>=3.10` or `^20`.
    Range,
}

/// A parsed version request for a language runtime.
#[derive(Debug, Clone)]
pub struct VersionSpec {
    text: String,
    kind: SpecKind,
    req: VersionReq,
}

impl VersionSpec {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> SpecKind {
        self.kind
    }

    /// Exact and partial versions can be handed to an installer; ranges cannot.
    pub fn is_installable(&self) -> bool {
        self.kind != SpecKind::Range
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
    }

    /// Pick the installed version that best satisfies this spec.
    ///
    /// Only concrete `X.Y.Z` entries are candidates. Floating tags such as
    /// `3` or `3.11` name whatever release was pulled last, so they never
    /// match. An entry spelled exactly as requested wins; otherwise the
    /// highest matching semantic version does.
    pub fn select<'a, S: AsRef<str>>(&self, installed: &'a [S]) -> Option<&'a str> {
        let candidates = installed
            .iter()
            .map(AsRef::as_ref)
            .filter_map(|text| parse_concrete(text).map(|v| (v, text)))
            .filter(|(v, _)| self.matches(v));

        let mut best: Option<(Version, &str)> = None;
        for (version, text) in candidates {
            if text == self.text {
                return Some(text);
            }
            let better = match &best {
                None => true,
                Some((best_version, best_text)) => {
                    (&version, text.len()) > (best_version, best_text.len())
                }
            };
            if better {
                best = Some((version, text));
            }
        }
        best.map(|(_, text)| text)
    }
}

impl FromStr for VersionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let invalid = |reason: String| Error::InvalidVersion {
            spec: s.to_string(),
            reason,
        };
        if text.is_empty() {
            return Err(invalid("version spec is empty".to_string()));
        }

        let numeric = text.trim_start_matches('v');
        let parts: Vec<&str> = numeric.split('.').collect();
        let all_numeric = parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));

        let (kind, req) = if all_numeric && parts.len() == 3 {
            (SpecKind::Exact, VersionReq::parse(&format!("={numeric}")))
        } else if all_numeric && parts.len() < 3 {
            // `=3.11` means >=3.11.0, <3.12.0 in semver terms.
            (SpecKind::Partial, VersionReq::parse(&format!("={numeric}")))
        } else {
            (SpecKind::Range, VersionReq::parse(text))
        };
        let req = req.map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            text: numeric.to_string(),
            kind,
            req,
        })
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Parse a full `X.Y.Z` runtime version, rejecting floating ones.
pub fn parse_concrete(text: &str) -> Option<Version> {
    let text = text.trim().trim_start_matches('v');
    if text.split('.').count() < 3 {
        return None;
    }
    parse_lenient(text)
}

/// Parse a runtime version the way installers report them.
///
/// Missing minor and patch components are padded with zero, so `3.11` parses
/// as `3.11.0`. Anything else that is not plain semver is rejected.
pub fn parse_lenient(text: &str) -> Option<Version> {
    let text = text.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(text) {
        return Some(version);
    }
    let mut numbers = text.split('.').map(|p| p.parse::<u64>().ok());
    let major = numbers.next()??;
    let minor = numbers.next().unwrap_or(Some(0))?;
    let patch = numbers.next().unwrap_or(Some(0))?;
    if numbers.next().is_some() {
        return None;
    }
    Some(Version::new(major, minor, patch))
}
