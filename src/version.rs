//! Version and build information

use std::fmt;

use serde::Serialize;

use crate::transport::tcp::MAX_FRAME_BYTES;
use crate::transport::CHANNEL_TAG;
use crate::waypoint::BACKLOG_HIGH_WATER;

/// Build information embedded at compile time by `build.rs`
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    git_dirty: &'static str,
    pub build_timestamp: &'static str,
    pub target: &'static str,
    pub host: &'static str,
    pub profile: &'static str,
    pub rustc_version: &'static str,

    /// Tag carried by every overlay message
    pub channel_tag: u32,
    /// Largest frame the TCP transport accepts
    pub max_frame_bytes: usize,
    /// In-flight count above which a poll turn logs a backlog advisory
    pub backlog_high_water: usize,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("TREEWAY_GIT_HASH"),
            git_branch: env!("TREEWAY_GIT_BRANCH"),
            git_dirty: env!("TREEWAY_GIT_DIRTY"),
            build_timestamp: env!("TREEWAY_BUILD_TIMESTAMP"),
            target: env!("TREEWAY_TARGET"),
            host: env!("TREEWAY_HOST"),
            profile: env!("TREEWAY_PROFILE"),
            rustc_version: env!("TREEWAY_RUSTC_VERSION"),
            channel_tag: CHANNEL_TAG,
            max_frame_bytes: MAX_FRAME_BYTES,
            backlog_high_water: BACKLOG_HIGH_WATER,
        }
    }

    /// Whether the working directory was dirty at build time
    pub fn git_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// Version with git hash, e.g. "0.1.0-abc1234" or "0.1.0-abc1234-dirty"
    pub fn full_version(&self) -> String {
        if self.git_dirty() {
            format!("{}-{}-dirty", self.version, self.git_hash)
        } else {
            format!("{}-{}", self.version, self.git_hash)
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build:")?;
        writeln!(f, "  Git:        {} on {}", self.git_hash, self.git_branch)?;
        writeln!(f, "  Built:      {} ({})", self.build_timestamp, self.profile)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Host:       {}", self.host)?;
        writeln!(f, "  Compiler:   {}", self.rustc_version)?;
        writeln!(f)?;
        writeln!(f, "Overlay:")?;
        writeln!(f, "  Channel tag:   {}", self.channel_tag)?;
        writeln!(f, "  Max frame:     {} bytes", self.max_frame_bytes)?;
        writeln!(f, "  Backlog mark:  {} operations", self.backlog_high_water)?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info_exists() {
        let info = build_info();
        assert_eq!(info.name, "treeway");
        assert!(!info.version.is_empty());
    }

    #[test]
    fn test_full_version_contains_hash() {
        let info = build_info();
        let full = info.full_version();
        assert!(full.starts_with(info.version));
        assert!(full.contains(info.git_hash));
    }

    #[test]
    fn test_display_lists_overlay_constants() {
        let display = build_info().to_string();
        assert!(display.contains("Channel tag:   1972"));
        assert!(display.contains("Backlog mark:  100"));
    }

    #[test]
    fn test_serializes_to_json() {
        let json = serde_json::to_value(build_info()).unwrap();
        assert_eq!(json["channel_tag"], 1972);
        assert!(json.get("git_dirty").is_some());
    }
}
