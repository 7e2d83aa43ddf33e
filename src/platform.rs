//! Target platform identification and platform-qualified binary naming.

use std::fmt;

use anyhow::{bail, Result};

/// A platform a scie can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
    LinuxAarch64,
    LinuxX86_64,
    MacosAarch64,
    MacosX86_64,
    WindowsX86_64,
}

impl Platform {
    /// All platforms the external assembler publishes binaries for.
    pub const ALL: &'static [Platform] = &[
        Platform::LinuxAarch64,
        Platform::LinuxX86_64,
        Platform::MacosAarch64,
        Platform::MacosX86_64,
        Platform::WindowsX86_64,
    ];

    /// Parse a platform identifier as it appears in configuration files.
    pub fn parse(value: &str) -> Result<Platform> {
        match value {
            "linux-aarch64" => Ok(Platform::LinuxAarch64),
            "linux-x86_64" => Ok(Platform::LinuxX86_64),
            "macos-aarch64" => Ok(Platform::MacosAarch64),
            "macos-x86_64" => Ok(Platform::MacosX86_64),
            "windows-x86_64" => Ok(Platform::WindowsX86_64),
            other => {
                let known = Platform::ALL
                    .iter()
                    .map(|platform| platform.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                bail!("Unknown platform '{other}'. Known platforms are: {known}")
            }
        }
    }

    /// The platform this process is running on.
    pub fn current() -> Result<Platform> {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "aarch64") => Ok(Platform::LinuxAarch64),
            ("linux", "x86_64") => Ok(Platform::LinuxX86_64),
            ("macos", "aarch64") => Ok(Platform::MacosAarch64),
            ("macos", "x86_64") => Ok(Platform::MacosX86_64),
            ("windows", "x86_64") => Ok(Platform::WindowsX86_64),
            (os, arch) => bail!("The current platform {os}-{arch} is not supported."),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::LinuxAarch64 => "linux-aarch64",
            Platform::LinuxX86_64 => "linux-x86_64",
            Platform::MacosAarch64 => "macos-aarch64",
            Platform::MacosX86_64 => "macos-x86_64",
            Platform::WindowsX86_64 => "windows-x86_64",
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, Platform::WindowsX86_64)
    }

    /// The executable name for this platform (`.exe` suffix on Windows).
    pub fn binary_name(&self, name: &str) -> String {
        if self.is_windows() {
            format!("{name}.exe")
        } else {
            name.to_string()
        }
    }

    /// The executable name qualified with the platform, e.g. `tool-linux-x86_64`.
    pub fn qualified_binary_name(&self, name: &str) -> String {
        if self.is_windows() {
            format!("{name}-{}.exe", self.as_str())
        } else {
            format!("{name}-{}", self.as_str())
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for platform in Platform::ALL {
            assert_eq!(*platform, Platform::parse(platform.as_str()).unwrap());
        }
    }

    #[test]
    fn parse_unknown() {
        let err = Platform::parse("plan9-mips").unwrap_err();
        assert!(err.to_string().contains("plan9-mips"));
        assert!(err.to_string().contains("linux-x86_64"));
    }

    #[test]
    fn binary_names() {
        assert_eq!("tool", Platform::LinuxX86_64.binary_name("tool"));
        assert_eq!("tool.exe", Platform::WindowsX86_64.binary_name("tool"));
        assert_eq!(
            "tool-linux-aarch64",
            Platform::LinuxAarch64.qualified_binary_name("tool")
        );
        assert_eq!(
            "tool-windows-x86_64.exe",
            Platform::WindowsX86_64.qualified_binary_name("tool")
        );
    }
}
