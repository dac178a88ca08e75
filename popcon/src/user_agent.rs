// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of popcon.
//
// popcon is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// popcon is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with popcon.  If not,
// see <http://www.gnu.org/licenses/>.

//! # user_agent
//!
//! Extracting a client's self-reported identity from its User-Agent.
//!
//! Clients identify themselves with a "marker" token (the application name). Requests that don't
//! carry it aren't from a client we recognize, and are simply not counted. Two formats are in use:
//!
//! 1. the structured format sent by current clients:
//!
//!    ```text
//!    <marker>/<version> (<os>; <os family>; <app version>; <language>)
//!    ```
//!
//! 2. the legacy format, in which the only thing we can glean from the User-Agent itself is a
//!    trailing "on <os>"; older clients send their language & version in separate headers.
//!
//! Nothing here is authenticated; it's all self-reported.

use std::fmt::Display;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{identity} has {fields} fields in its parenthesized segment; expected four"))]
    Malformed {
        identity: String,
        fields: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("The marker {marker} could not be compiled to a regex: {source}"))]
    Marker {
        marker: String,
        source: regex::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Broad operating system classification
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum OsFamily {
    Windows,
    #[serde(rename = "macOS")]
    MacOs,
    Linux,
    #[serde(rename = "BSD")]
    Bsd,
    Other,
}

impl Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                OsFamily::Windows => "Windows",
                OsFamily::MacOs => "macOS",
                OsFamily::Linux => "Linux",
                OsFamily::Bsd => "BSD",
                OsFamily::Other => "Other",
            }
        )
    }
}

/// Classify a raw OS token into an [OsFamily]
///
/// The checks are case-insensitive substring matches, applied in a fixed order (so "Windows
/// Subsystem for Linux" is Windows). A missing or empty token has no family at all, which is not the
/// same as [OsFamily::Other].
pub fn classify_os_family(os: Option<&str>) -> Option<OsFamily> {
    let os = os?.trim().to_lowercase();
    if os.is_empty() {
        None
    } else if os.contains("windows") {
        Some(OsFamily::Windows)
    } else if os.contains("macos") {
        Some(OsFamily::MacOs)
    } else if os.contains("linux") || os.contains("flatpak") {
        Some(OsFamily::Linux)
    } else if os.contains("bsd") {
        Some(OsFamily::Bsd)
    } else {
        Some(OsFamily::Other)
    }
}

/// What we could learn about a client from a single request
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IdentityInfo {
    pub os: Option<String>,
    pub os_family: Option<OsFamily>,
    pub language: Option<String>,
    pub version: Option<String>,
}

/// The two headers legacy clients use to report language & version
#[derive(Clone, Debug, Default)]
pub struct AuxiliaryHeaders<'a> {
    pub language: Option<&'a str>,
    pub version: Option<&'a str>,
}

lazy_static! {
    static ref LEGACY_OS: Regex = Regex::new(r"^.* on (.+?)\s*$").unwrap(/* known good */);
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

/// User-Agent parser for a given marker token
#[derive(Clone, Debug)]
pub struct Parser {
    marker: String,
    structured: Regex,
}

impl Parser {
    pub fn new(marker: &str) -> Result<Parser> {
        let structured = Regex::new(&format!(r"^{}/(\S+) \(([^)]*)\)", regex::escape(marker)))
            .context(MarkerSnafu { marker })?;
        Ok(Parser {
            marker: marker.to_owned(),
            structured,
        })
    }
    pub fn marker(&self) -> &str {
        &self.marker
    }
    /// Parse `identity` (along with, for legacy clients, the auxiliary headers)
    ///
    /// Returns `Ok(None)` if `identity` doesn't carry our marker. An identity that looks like the
    /// structured format but whose parenthesized segment doesn't have four fields is an error.
    pub fn parse(&self, identity: &str, aux: &AuxiliaryHeaders) -> Result<Option<IdentityInfo>> {
        if !identity.contains(&self.marker) {
            return Ok(None);
        }

        if let Some(caps) = self.structured.captures(identity) {
            let fields = caps[2].split(';').collect::<Vec<&str>>();
            if fields.len() < 4 {
                return MalformedSnafu {
                    identity,
                    fields: fields.len(),
                }
                .fail();
            }
            let os = non_empty(fields[0]);
            let family_raw = non_empty(fields[1]);
            let os_family = classify_os_family(family_raw.as_deref().or(os.as_deref()));
            return Ok(Some(IdentityInfo {
                os,
                os_family,
                language: non_empty(fields[3]),
                version: non_empty(fields[2]),
            }));
        }

        let os = LEGACY_OS
            .captures(identity)
            .and_then(|caps| non_empty(&caps[1]));
        Ok(Some(IdentityInfo {
            os_family: classify_os_family(os.as_deref()),
            os,
            language: aux.language.and_then(non_empty),
            version: aux.version.and_then(non_empty),
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn os_families() {
        for os in ["Windows 11", "WINDOWS", "microsoft windows 10"] {
            assert_eq!(classify_os_family(Some(os)), Some(OsFamily::Windows));
        }
        assert_eq!(classify_os_family(Some("macOS 14.1")), Some(OsFamily::MacOs));
        assert_eq!(classify_os_family(Some("MACOS")), Some(OsFamily::MacOs));
        assert_eq!(classify_os_family(Some("Ubuntu Linux")), Some(OsFamily::Linux));
        assert_eq!(classify_os_family(Some("Flatpak")), Some(OsFamily::Linux));
        assert_eq!(classify_os_family(Some("FreeBSD 14")), Some(OsFamily::Bsd));
        assert_eq!(classify_os_family(Some("Haiku")), Some(OsFamily::Other));
        assert_eq!(classify_os_family(Some("")), None);
        assert_eq!(classify_os_family(Some("   ")), None);
        assert_eq!(classify_os_family(None), None);
        // Precedence: windows is checked first
        assert_eq!(
            classify_os_family(Some("Windows Subsystem for Linux")),
            Some(OsFamily::Windows)
        );
        assert_eq!(OsFamily::MacOs.to_string(), "macOS");
        assert_eq!(serde_json::to_string(&OsFamily::Bsd).unwrap(), "\"BSD\"");
    }

    #[test]
    fn structured() {
        let parser = Parser::new("Ecoji").unwrap();
        let info = parser
            .parse(
                "Ecoji/1.4.0 (Ubuntu 24.04; linux; 1.4.0; de_DE)",
                &AuxiliaryHeaders::default(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            info,
            IdentityInfo {
                os: Some("Ubuntu 24.04".to_owned()),
                os_family: Some(OsFamily::Linux),
                language: Some("de_DE".to_owned()),
                version: Some("1.4.0".to_owned()),
            }
        );

        // Empty family field: classify from the OS field
        let info = parser
            .parse("Ecoji/1.4.0 (Windows 11; ; 1.4.0; )", &AuxiliaryHeaders::default())
            .unwrap()
            .unwrap();
        assert_eq!(info.os_family, Some(OsFamily::Windows));
        assert_eq!(info.language, None);

        // The auxiliary headers are ignored for structured identities
        let info = parser
            .parse(
                "Ecoji/2.0 (macOS 14; macos; 2.0; en)",
                &AuxiliaryHeaders {
                    language: Some("fr"),
                    version: Some("0.1"),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(info.language.as_deref(), Some("en"));
        assert_eq!(info.version.as_deref(), Some("2.0"));
    }

    #[test]
    fn malformed() {
        let parser = Parser::new("Ecoji").unwrap();
        assert!(matches!(
            parser.parse("Ecoji/1.4.0 (Ubuntu; linux)", &AuxiliaryHeaders::default()),
            Err(Error::Malformed { fields: 2, .. })
        ));
    }

    #[test]
    fn legacy() {
        let parser = Parser::new("Ecoji").unwrap();
        let info = parser
            .parse(
                "Ecoji 1.2 on FreeBSD 13.2",
                &AuxiliaryHeaders {
                    language: Some("en_US"),
                    version: Some("1.2"),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(info.os.as_deref(), Some("FreeBSD 13.2"));
        assert_eq!(info.os_family, Some(OsFamily::Bsd));
        assert_eq!(info.language.as_deref(), Some("en_US"));
        assert_eq!(info.version.as_deref(), Some("1.2"));

        // No "on" fragment, no headers: still a recognized client, just with nothing to say
        let info = parser
            .parse("Ecoji", &AuxiliaryHeaders::default())
            .unwrap()
            .unwrap();
        assert_eq!(info, IdentityInfo::default());
    }

    #[test]
    fn unrecognized() {
        let parser = Parser::new("Ecoji").unwrap();
        assert!(parser
            .parse("Mozilla/5.0 (X11; Linux x86_64)", &AuxiliaryHeaders::default())
            .unwrap()
            .is_none());
        // Regex metacharacters in the marker are taken literally
        let parser = Parser::new("App.v2+").unwrap();
        assert!(parser
            .parse("App.v2+/1.0 (Haiku; ; 1.0; en)", &AuxiliaryHeaders::default())
            .unwrap()
            .is_some_and(|info| info.os_family == Some(OsFamily::Other)));
    }
}
