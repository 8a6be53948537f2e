//! Tags: named consistency / projection boundaries.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A `(group, content)` pair identifying one boundary, e.g. `Student:123`.
///
/// Equality and hashing consider only `(group, content)`; whether the tag is a
/// consistency boundary is a property of how it is attached to an event, not
/// part of its identity. Deserialization applies the same validation as
/// [`Tag::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTag")]
pub struct Tag {
    group: String,
    content: String,
    consistency: bool,
}

#[derive(Deserialize)]
struct RawTag {
    group: String,
    content: String,
    #[serde(default = "default_consistency")]
    consistency: bool,
}

impl TryFrom<RawTag> for Tag {
    type Error = DomainError;

    fn try_from(raw: RawTag) -> DomainResult<Self> {
        Self::new(raw.group, raw.content, raw.consistency)
    }
}

fn default_consistency() -> bool {
    true
}

impl Tag {
    pub fn new(
        group: impl Into<String>,
        content: impl Into<String>,
        consistency: bool,
    ) -> DomainResult<Self> {
        let group = group.into();
        let content = content.into();
        if group.is_empty() {
            return Err(DomainError::invalid_tag("group must not be empty"));
        }
        if group.contains(':') {
            return Err(DomainError::invalid_tag(format!(
                "group '{group}' must not contain ':'"
            )));
        }
        if content.is_empty() {
            return Err(DomainError::invalid_tag(format!(
                "content of group '{group}' must not be empty"
            )));
        }
        Ok(Self {
            group,
            content,
            consistency,
        })
    }

    /// Tag for which write reservations are enforced.
    pub fn consistency(group: impl Into<String>, content: impl Into<String>) -> DomainResult<Self> {
        Self::new(group, content, true)
    }

    /// Tag used only for projection lookups; writes never reserve it.
    pub fn projection_only(
        group: impl Into<String>,
        content: impl Into<String>,
    ) -> DomainResult<Self> {
        Self::new(group, content, false)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_consistency(&self) -> bool {
        self.consistency
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.content == other.content
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.content.hash(state);
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.content)
    }
}

/// Parses `group:content` into a consistency tag.
///
/// Only the first `:` separates group from content; the content may contain
/// further colons.
impl FromStr for Tag {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, content) = s
            .split_once(':')
            .ok_or_else(|| DomainError::invalid_tag(format!("expected 'group:content', got '{s}'")))?;
        Self::consistency(group, content)
    }
}

/// Identity of one materialized tag state: a tag folded by a named projector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagStateId {
    pub tag_group: String,
    pub tag_content: String,
    pub projector: String,
}

impl TagStateId {
    pub fn new(tag: &Tag, projector: impl Into<String>) -> Self {
        Self {
            tag_group: tag.group.clone(),
            tag_content: tag.content.clone(),
            projector: projector.into(),
        }
    }

    /// The tag this state is folded from.
    pub fn tag(&self) -> DomainResult<Tag> {
        Tag::consistency(self.tag_group.clone(), self.tag_content.clone())
    }
}

impl fmt::Display for TagStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tag_group, self.tag_content, self.projector)
    }
}

/// Parses `group:content:projector`; the projector is the segment after the last `:`.
impl FromStr for TagStateId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, projector) = s.rsplit_once(':').ok_or_else(|| {
            DomainError::invalid_id(format!("expected 'group:content:projector', got '{s}'"))
        })?;
        if projector.is_empty() {
            return Err(DomainError::invalid_id(format!("missing projector in '{s}'")));
        }
        let tag: Tag = tag.parse()?;
        Ok(Self::new(&tag, projector))
    }
}
