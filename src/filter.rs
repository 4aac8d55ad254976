//! Per-path capture policy
//!
//! The filter follows the scanner's directory stack. On every push it picks
//! the override registered for exactly that path, or keeps the policy of the
//! parent, so the policy in effect always comes from the longest registered
//! prefix. Override keys are paths relative to the tracked root without a
//! leading slash (`var/log`); the root itself is the empty string.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Capture policy of one directory level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// New files are stored as zero-length placeholders
    pub touch_new_only: bool,
    /// Non-directory entries are tracked at all
    pub track_content: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            touch_new_only: false,
            track_content: true,
        }
    }
}

impl Policy {
    /// Placeholder-only capture
    pub const TOUCH_NEW: Policy = Policy {
        touch_new_only: true,
        track_content: true,
    };

    /// Directories only
    pub const DIRS_ONLY: Policy = Policy {
        touch_new_only: false,
        track_content: false,
    };
}

/// Path-scoped policy stack plus the set of ignored paths
#[derive(Debug, Clone, Default)]
pub struct Filter {
    ignored: BTreeSet<PathBuf>,
    overrides: BTreeMap<String, Policy>,
    stack: Vec<String>,
    saved: Vec<(Policy, bool)>,
    current: Policy,
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl Filter {
    /// Filter with default policy and no overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Never scan the absolute filesystem path `path` or anything below it
    pub fn add_ignore(&mut self, path: impl Into<PathBuf>) {
        self.ignored.insert(path.into());
    }

    /// Store new files under `path` as placeholders only
    pub fn add_touch_new_files(&mut self, path: &str) {
        self.overrides.insert(normalize(path), Policy::TOUCH_NEW);
    }

    /// Track only directories under `path`
    pub fn add_track_dirs_only(&mut self, path: &str) {
        self.overrides.insert(normalize(path), Policy::DIRS_ONLY);
    }

    /// Whether the absolute path is excluded from scanning
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.ignored.contains(path)
    }

    /// Enter directory `name` (the empty string for the root)
    pub fn push(&mut self, name: &str) {
        let named = !name.is_empty();
        if named {
            self.stack.push(name.to_string());
        }
        self.saved.push((self.current, named));
        let key = self.stack.join("/");
        if let Some(policy) = self.overrides.get(&key) {
            self.current = *policy;
        }
        trace!(
            "Filter {:?}: touch_new_only={} track_content={}",
            key,
            self.current.touch_new_only,
            self.current.track_content
        );
    }

    /// Leave the current directory
    pub fn pop(&mut self) {
        if let Some((policy, named)) = self.saved.pop() {
            if named {
                self.stack.pop();
            }
            self.current = policy;
        }
    }

    /// Policy of the current directory
    pub fn policy(&self) -> Policy {
        self.current
    }

    /// Whether new files are placeholder-only here
    pub fn touch_new_only(&self) -> bool {
        self.current.touch_new_only
    }

    /// Whether non-directory content is tracked here
    pub fn track_content(&self) -> bool {
        self.current.track_content
    }
}
