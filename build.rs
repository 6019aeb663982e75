//! Injects the build-time identity of the bridge.
//!
//! The packaging pipeline passes the host mod's identity through environment
//! variables; each one becomes a `rustc-env` value read by `src/identity.rs`
//! with `env!`, so the strings end up as read-only constants in the binary.

use std::env;

const IDENTITY_VARS: &[(&str, Option<&str>)] = &[
    ("MEGATRACE_MOD_ID", Some("megatrace")),
    ("MEGATRACE_MOD_NAME", Some("MEGATrace")),
    // Falls back to the crate version below
    ("MEGATRACE_MOD_VERSION", None),
    ("MEGATRACE_ROOT_PKG", Some("mega.trace")),
];

fn main() {
    for (var, default) in IDENTITY_VARS {
        println!("cargo:rerun-if-env-changed={var}");

        let value = env::var(var).ok().filter(|v| !v.trim().is_empty());
        let value = match (value, default) {
            (Some(v), _) => v,
            (None, Some(d)) => (*d).to_string(),
            (None, None) => env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string()),
        };

        if value.contains('\0') {
            eprintln!("Error: {var} must not contain NUL bytes");
            std::process::exit(1);
        }

        println!("cargo:rustc-env={var}={value}");
    }

    // Target triple the artifact is built for, surfaced by `platform::build_target()`
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=MEGATRACE_BUILD_TARGET={target}");
    println!("cargo:rerun-if-changed=build.rs");
}
