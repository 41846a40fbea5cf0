// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Process-wide topic creation filter.

use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterPart {
    /// Byte-exact level.
    Str(String),

    /// `+`, matches exactly one level.
    SingleLevel,

    /// Trailing `#`, matches any remainder.
    MultiLevel,
}

/// A single `/`-separated pattern applied to topic names at creation
/// time. `+` matches one level, a trailing `#` matches any remainder,
/// everything else matches byte-exactly. Non-persistent.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    pattern: String,
    parts: Vec<FilterPart>,
}

impl TopicFilter {
    /// Parse a filter pattern.
    ///
    /// # Errors
    ///
    /// Returns error if the pattern is empty, contains an interior `#`,
    /// or mixes a wildcard into a level.
    pub fn parse(pattern: &str) -> Result<Self, Error> {
        if pattern.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidParam,
                "filter: empty pattern",
            ));
        }

        let segments: Vec<&str> = pattern.split('/').collect();
        let last = segments.len() - 1;
        let mut parts = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let part = match *segment {
                "+" => FilterPart::SingleLevel,
                "#" => {
                    if index != last {
                        return Err(Error::from_string(
                            ErrorKind::InvalidParam,
                            format!("filter: `#` must be the last level in {pattern}"),
                        ));
                    }
                    FilterPart::MultiLevel
                }
                other => {
                    if other.contains('+') || other.contains('#') {
                        return Err(Error::from_string(
                            ErrorKind::InvalidParam,
                            format!("filter: wildcard inside level in {pattern}"),
                        ));
                    }
                    FilterPart::Str(other.to_owned())
                }
            };
            parts.push(part);
        }

        Ok(Self {
            pattern: pattern.to_owned(),
            parts,
        })
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn is_match(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');
        for part in &self.parts {
            match part {
                FilterPart::MultiLevel => return true,
                FilterPart::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                FilterPart::Str(expected) => {
                    if levels.next() != Some(expected.as_str()) {
                        return false;
                    }
                }
            }
        }
        levels.next().is_none()
    }
}
