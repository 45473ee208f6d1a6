//! Represents an entry of the virtual directory tree: a leaf object, a
//! materialized directory, or a tombstone marker standing in for either.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Version literal used for non-versioned objects and every directory.
pub const NULL_VERSION: &str = "null";

/// Content reference stored for directories and markers.
pub const SENTINEL_CID: &str = "-";

/// ETag stored for directories and markers.
pub const SENTINEL_ETAG: &str = "-";

/// Content type of directory entries.
pub const DIR_CONTENT_TYPE: &str = "dir";

pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// One row of the `objects` (current) or `object_history` table.
///
/// Both tables share this shape. Identity is `(bucket, dirname, name)`; in the
/// history table the version is part of the key.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ObjectInfo {
    /// Row id inside its table. Ignored on insert.
    #[serde(default)]
    pub id: i64,

    pub bucket: String,

    /// Parent directory path, `/` for entries at the bucket root.
    pub dirname: String,

    /// Last path segment.
    pub name: String,

    /// Content reference in the chunk store.
    pub cid: String,

    pub etag: String,

    /// Plaintext size in bytes.
    pub content_length: i64,

    /// Stored size after encryption.
    pub cipher_text_size: i64,

    pub content_type: String,

    /// `"null"` for non-versioned entries.
    pub version: String,

    pub is_dir: bool,

    /// Tombstone flag.
    pub is_marker: bool,

    pub storage_class: String,
    pub acl: String,
    pub tags: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectInfo {
    /// A leaf object with the given plaintext length.
    pub fn file(
        bucket: impl Into<String>,
        dirname: impl Into<String>,
        name: impl Into<String>,
        cid: impl Into<String>,
        content_length: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            bucket: bucket.into(),
            dirname: dirname.into(),
            name: name.into(),
            cid: cid.into(),
            etag: String::new(),
            content_length,
            cipher_text_size: content_length,
            content_type: "application/octet-stream".into(),
            version: NULL_VERSION.into(),
            is_dir: false,
            is_marker: false,
            storage_class: DEFAULT_STORAGE_CLASS.into(),
            acl: String::new(),
            tags: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A directory entry carrying the sentinel content fields.
    pub fn directory(
        bucket: impl Into<String>,
        dirname: impl Into<String>,
        name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut row = Self::file(bucket, dirname, name, SENTINEL_CID, 0, now);
        row.into_directory();
        row
    }

    /// Reset content fields to the directory sentinels.
    pub fn into_directory(&mut self) {
        self.is_dir = true;
        self.cid = SENTINEL_CID.into();
        self.etag = SENTINEL_ETAG.into();
        self.content_length = 0;
        self.cipher_text_size = 0;
        self.content_type = DIR_CONTENT_TYPE.into();
        self.version = NULL_VERSION.into();
    }

    /// Tombstone standing in for this row, stamped with `version`.
    pub fn tombstone(&self, version: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            cid: SENTINEL_CID.into(),
            etag: SENTINEL_ETAG.into(),
            content_length: 0,
            cipher_text_size: 0,
            version: version.to_string(),
            is_marker: true,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Bytes this row contributes to the bucket size while live.
    pub fn live_size(&self) -> i64 {
        if self.is_marker || self.is_dir {
            0
        } else {
            self.content_length
        }
    }

    pub fn is_null_version(&self) -> bool {
        self.version == NULL_VERSION
    }

    /// Full path of the entry, e.g. `/a/b/obj`.
    pub fn path(&self) -> String {
        crate::services::paths::join(&self.dirname, &self.name)
    }
}

/// Addresses one entry (or one version of it) for deletion.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ObjectOptions {
    pub bucket: String,

    /// Parent directory of the target.
    pub prefix: String,

    /// Last path segment of the target.
    pub object: String,

    /// Empty for "the current state".
    #[serde(default)]
    pub version_id: String,

    #[serde(default)]
    pub is_dir: bool,
}

/// Row and byte totals removed by a deletion. Never persisted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeletedObjects {
    pub count: i64,
    pub size: i64,
}

impl DeletedObjects {
    pub fn add(&mut self, count: i64, size: i64) {
        self.count += count;
        self.size += size;
    }
}
