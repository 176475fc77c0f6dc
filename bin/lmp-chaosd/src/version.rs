//! ---
//! lmp_section: "01-core-functionality"
//! lmp_subsection: "binary"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Build metadata reported by the chaos daemon."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---

/// Build metadata captured by `vergen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Workspace semantic version.
    pub semver: String,
    /// Build timestamp from the compilation environment.
    pub build_timestamp: String,
    /// Target triple used for the build.
    pub target: String,
    /// Optimisation level the binary was compiled with.
    pub opt_level: String,
}

impl VersionInfo {
    #[must_use]
    pub fn current() -> Self {
        Self {
            semver: env!("CARGO_PKG_VERSION").to_owned(),
            build_timestamp: option_env!("VERGEN_BUILD_TIMESTAMP")
                .unwrap_or("UNKNOWN")
                .to_owned(),
            target: option_env!("VERGEN_CARGO_TARGET_TRIPLE")
                .unwrap_or("UNKNOWN")
                .to_owned(),
            opt_level: option_env!("VERGEN_CARGO_OPT_LEVEL")
                .unwrap_or("UNKNOWN")
                .to_owned(),
        }
    }

    #[must_use]
    pub fn banner(&self) -> String {
        format!("LMP chaosd v{}", self.semver)
    }

    /// Extended string for `-V`.
    #[must_use]
    pub fn extended(&self) -> String {
        format!(
            "{banner}\nBuilt: {built}\nTarget: {target}\nOpt level: {opt}",
            banner = self.banner(),
            built = self.build_timestamp,
            target = self.target,
            opt = self.opt_level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_starts_with_banner() {
        let version = VersionInfo::current();
        assert!(version.extended().starts_with(&version.banner()));
        assert_eq!(version.semver, env!("CARGO_PKG_VERSION"));
    }
}
