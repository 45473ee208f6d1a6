//! Represents a logical bucket (a top-level namespace for objects) and the
//! side-table blobs (policy, acl, tags, logging) attached to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

/// Versioning mode of a bucket.
///
/// `Unset` and `Suspended` only keep the latest state of an object, `Enabled`
/// retains every write in the history ledger.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Versioning {
    #[default]
    Unset,
    Enabled,
    Suspended,
}

impl Versioning {
    pub fn as_str(&self) -> &'static str {
        match self {
            Versioning::Unset => "Unset",
            Versioning::Enabled => "Enabled",
            Versioning::Suspended => "Suspended",
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Versioning::Enabled)
    }
}

impl fmt::Display for Versioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Versioning {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "" | "unset" => Ok(Versioning::Unset),
            "enabled" => Ok(Versioning::Enabled),
            "suspended" => Ok(Versioning::Suspended),
            other => Err(format!("unknown versioning mode `{}`", other)),
        }
    }
}

impl TryFrom<String> for Versioning {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A storage bucket.
///
/// `count` and `size` are aggregates over the live rows of the bucket and are
/// only ever changed by signed deltas inside the transaction that performs the
/// structural mutation.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Bucket {
    /// Globally unique bucket name.
    pub name: String,

    /// Stable internal identifier.
    pub bucket_id: String,

    /// Number of live (non-marker) rows, directories included.
    pub count: i64,

    /// Sum of live leaf content lengths.
    pub size: i64,

    /// Owner account.
    pub owner: String,

    #[sqlx(try_from = "String")]
    pub versioning: Versioning,

    /// Default storage class for new objects.
    pub storage_class: String,

    /// Location constraint (region).
    pub location: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bucket {
    /// An empty bucket with default settings.
    pub fn new(name: impl Into<String>, owner: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            bucket_id: String::new(),
            count: 0,
            size: 0,
            owner: owner.into(),
            versioning: Versioning::Unset,
            storage_class: super::object::DEFAULT_STORAGE_CLASS.into(),
            location: "local".into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Which side-table blob an external bucket operation targets.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExternalKind {
    Policy,
    Acl,
    Tags,
    Logging,
}

impl ExternalKind {
    /// Column backing this blob in `bucket_external`.
    pub fn column(&self) -> &'static str {
        match self {
            ExternalKind::Policy => "policy",
            ExternalKind::Acl => "acl",
            ExternalKind::Tags => "tags",
            ExternalKind::Logging => "logging",
        }
    }
}

impl FromStr for ExternalKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "policy" => Ok(ExternalKind::Policy),
            "acl" => Ok(ExternalKind::Acl),
            "tags" => Ok(ExternalKind::Tags),
            "logging" => Ok(ExternalKind::Logging),
            other => Err(format!("unknown bucket attribute `{}`", other)),
        }
    }
}

/// Side-table row holding rarely-read bucket blobs.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, Default, PartialEq)]
pub struct BucketExternal {
    pub bucket: String,
    pub policy: Option<String>,
    pub acl: Option<String>,
    pub tags: Option<String>,
    pub logging: Option<String>,
}

impl BucketExternal {
    pub fn get(&self, kind: ExternalKind) -> Option<&str> {
        match kind {
            ExternalKind::Policy => self.policy.as_deref(),
            ExternalKind::Acl => self.acl.as_deref(),
            ExternalKind::Tags => self.tags.as_deref(),
            ExternalKind::Logging => self.logging.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioning_parses_case_insensitively() {
        assert_eq!("enabled".parse::<Versioning>(), Ok(Versioning::Enabled));
        assert_eq!("Suspended".parse::<Versioning>(), Ok(Versioning::Suspended));
        assert_eq!("".parse::<Versioning>(), Ok(Versioning::Unset));
        assert!("sometimes".parse::<Versioning>().is_err());
    }

    #[test]
    fn external_kind_maps_to_columns() {
        assert_eq!("acl".parse::<ExternalKind>().unwrap().column(), "acl");
        assert_eq!(ExternalKind::Logging.column(), "logging");
        assert!("cors".parse::<ExternalKind>().is_err());
    }
}
