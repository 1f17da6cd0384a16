//! On-disk token store.
//!
//! Tokens are persisted only as SHA-256 hex digests in a small JSON
//! document. Loading tolerates a missing or unreadable file (treated as
//! "no tokens yet") and migrates legacy plaintext entries by hashing them.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTokens {
    #[serde(default)]
    tokens: Vec<String>,
}

/// JSON-file-backed set of token hashes.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load the persisted hash set. Any load failure yields an empty set;
    /// the guard then behaves as if no device was ever paired.
    pub async fn load(&self) -> HashSet<String> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashSet::new(),
            Err(err) => {
                warn!("could not read token store {:?}: {err}", self.path);
                return HashSet::new();
            }
        };

        let stored: StoredTokens = match serde_json::from_str(&contents) {
            Ok(stored) => stored,
            Err(err) => {
                warn!("could not parse token store {:?}: {err}", self.path);
                return HashSet::new();
            }
        };

        let mut migrated = 0usize;
        let hashes = stored
            .tokens
            .into_iter()
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| {
                if looks_hashed(&entry) {
                    entry
                } else {
                    // Legacy store format kept raw tokens on disk.
                    migrated += 1;
                    hash_token(&entry)
                }
            })
            .collect::<HashSet<_>>();

        if migrated > 0 {
            info!("migrated {migrated} legacy plaintext token(s) to hashes");
        }
        hashes
    }

    /// Write the hash set back to disk, creating parent directories as
    /// needed.
    pub async fn save(&self, hashes: &HashSet<String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating token store directory {parent:?}"))?;
        }

        let stored = StoredTokens {
            tokens: hashes.iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&stored).context("serializing token store")?;
        fs::write(&self.path, json)
            .await
            .with_context(|| format!("writing token store {:?}", self.path))?;
        Ok(())
    }
}

/// One-way hash applied to every bearer token before storage or lookup.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// A 64-char lowercase hex string is taken to be an already-hashed entry.
fn looks_hashed(entry: &str) -> bool {
    entry.len() == 64 && entry.bytes().all(|b| b.is_ascii_hexdigit())
}
