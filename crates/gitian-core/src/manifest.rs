//! Output manifests and deterministic-build fingerprints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Incidental file metadata. Never part of a fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub modified: Option<DateTime<Utc>>,
    pub owner: Option<String>,
}

/// One file produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Path relative to the build output directory.
    pub path: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the contents.
    pub sha256: String,
    #[serde(default)]
    pub metadata: ArtifactMetadata,
}

/// Hash identifying the exact output of a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(hex: String) -> Self {
        Self(hex)
    }
}

/// Artifacts of one build, kept sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputManifest {
    entries: Vec<ArtifactEntry>,
}

impl OutputManifest {
    pub fn new(mut entries: Vec<ArtifactEntry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Self { entries }
    }

    pub fn entries(&self) -> &[ArtifactEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ArtifactEntry> {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical form: one `path NUL size NUL sha256 LF` record per entry,
    /// in path order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.extend_from_slice(entry.path.as_bytes());
            out.push(0);
            out.extend_from_slice(entry.size.to_string().as_bytes());
            out.push(0);
            out.extend_from_slice(entry.sha256.as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(sha256_hex(&self.canonical_bytes()))
    }

    /// `sha256sum`-style listing used in assert documents.
    pub fn sums(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}  {}\n", e.sha256, e.path))
            .collect()
    }
}
