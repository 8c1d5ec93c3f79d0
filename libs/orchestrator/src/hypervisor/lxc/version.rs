//! LXC package version detection.

use std::fmt;

/// Query printing the installed `lxc` package version.
pub const VERSION_QUERY: &str = "dpkg-query -W -f='${Version}' lxc";

const LEGACY_PREFIX: &str = "0.9";

/// Installed LXC version on a hypervisor host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LxcVersion(String);

impl LxcVersion {
    /// Parse the output of [`VERSION_QUERY`], dropping any Debian epoch.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let without_epoch = match trimmed.split_once(':') {
            Some((epoch, rest)) if epoch.chars().all(|c| c.is_ascii_digit()) => rest,
            _ => trimmed,
        };
        Self(without_epoch.to_string())
    }

    /// 0.9.x hosts lack `lxc.start.auto` and `lxc-stop -t`.
    pub fn is_legacy(&self) -> bool {
        self.0.starts_with(LEGACY_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LxcVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0.9.0-0ubuntu3", true)]
    #[case("1:0.9.0-0ubuntu3\n", true)]
    #[case("1.0.8-0ubuntu0.3", false)]
    #[case("1:2.0.11-0ubuntu1~16.04.3", false)]
    #[case("", false)]
    fn test_legacy_detection(#[case] raw: &str, #[case] legacy: bool) {
        assert_eq!(LxcVersion::parse(raw).is_legacy(), legacy);
    }

    #[test]
    fn test_epoch_stripped() {
        assert_eq!(LxcVersion::parse("1:2.0.8").as_str(), "2.0.8");
    }
}
