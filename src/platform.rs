//! Target matrix and native artifact naming
//!
//! The host ships one shared library per (arch, os, libc) triple and picks the
//! right one at load time by name. [`TargetTriple::library_file_name`] produces
//! the same names the host loader looks for:
//!
//! ```text
//! libmegatrace-x86_64-linux-gnu.so
//! libmegatrace-aarch64-linux-gnu.so
//! megatrace-x86_64-windows-gnu.dll
//! ```
//!
//! aarch64-windows is recognized but left out of the shipped matrix: the sink
//! the original builds targeted could not be produced for it. macOS is
//! recognized so names are stable, but it is not part of the matrix either.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Aarch64,
}

impl Arch {
    pub fn name(&self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Aarch64 => "aarch64",
        }
    }

    /// Architecture this crate was compiled for
    pub fn current() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "x86") {
            Some(Arch::X86)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else if cfg!(target_arch = "arm") {
            Some(Arch::Arm)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Windows,
    MacOs,
}

impl Os {
    pub fn name(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Windows => "windows",
            Os::MacOs => "macos",
        }
    }

    pub fn current() -> Option<Self> {
        if cfg!(target_os = "windows") {
            Some(Os::Windows)
        } else if cfg!(target_os = "macos") {
            Some(Os::MacOs)
        } else if cfg!(any(target_os = "linux", target_os = "freebsd", target_os = "android")) {
            Some(Os::Linux)
        } else {
            None
        }
    }

    /// C library flavour the host expects in the artifact name
    pub fn libc(&self) -> Libc {
        match self {
            Os::MacOs => Libc::None,
            Os::Linux | Os::Windows => Libc::Gnu,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Libc {
    Gnu,
    None,
}

impl Libc {
    pub fn name(&self) -> &'static str {
        match self {
            Libc::Gnu => "gnu",
            Libc::None => "none",
        }
    }
}

/// Why a triple is not part of the shipped matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    /// The sink dependency of the shipped builds does not support this triple
    SinkUnsupported,
    /// No loader support on the host side yet
    HostUnsupported,
    /// 32-bit targets are not built
    NotBuilt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetTriple {
    pub arch: Arch,
    pub os: Os,
    pub libc: Libc,
}

/// Triples the packaging pipeline builds
pub const SHIPPED_TARGETS: &[TargetTriple] = &[
    TargetTriple { arch: Arch::X86_64, os: Os::Linux, libc: Libc::Gnu },
    TargetTriple { arch: Arch::Aarch64, os: Os::Linux, libc: Libc::Gnu },
    TargetTriple { arch: Arch::X86_64, os: Os::Windows, libc: Libc::Gnu },
];

impl TargetTriple {
    pub fn new(arch: Arch, os: Os) -> Self {
        TargetTriple { arch, os, libc: os.libc() }
    }

    /// Triple of the running build, if it is one the host knows how to name
    pub fn current() -> Option<Self> {
        Some(TargetTriple::new(Arch::current()?, Os::current()?))
    }

    /// File name the host loader resolves for library `base`
    pub fn library_file_name(&self, base: &str) -> String {
        let (prefix, extension) = match self.os {
            Os::Linux => ("lib", "so"),
            Os::MacOs => ("lib", "dylib"),
            Os::Windows => ("", "dll"),
        };
        format!("{prefix}{base}-{self}.{extension}")
    }

    /// `None` if the triple is part of the shipped matrix
    pub fn exclusion(&self) -> Option<Exclusion> {
        if SHIPPED_TARGETS.contains(self) {
            return None;
        }
        Some(match (self.arch, self.os) {
            (Arch::Aarch64, Os::Windows) => Exclusion::SinkUnsupported,
            (_, Os::MacOs) => Exclusion::HostUnsupported,
            _ => Exclusion::NotBuilt,
        })
    }
}

impl fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.arch.name(), self.os.name(), self.libc.name())
    }
}

/// Name of the running build as the host knows it
///
/// The artifact triple for targets the host can name, the Rust target triple
/// otherwise.
pub fn target_name() -> String {
    match TargetTriple::current() {
        Some(triple) => triple.to_string(),
        None => build_target().to_string(),
    }
}

/// Rust target triple this artifact was compiled for (from `build.rs`)
pub fn build_target() -> &'static str {
    env!("MEGATRACE_BUILD_TARGET")
}
