use std::env;

/// Per-link pipeline buffer size in KiB. Overridable at build time, clamped
/// to a sane range so a typo cannot produce a degenerate pipeline.
const DEFAULT_BUFFER_KIB: usize = 4;

pub fn main() {
    println!("cargo:rerun-if-env-changed=KDBX_PIPELINE_BUFFER_KIB");

    let kib = match env::var("KDBX_PIPELINE_BUFFER_KIB") {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n >= 1 && n <= 100 => n,
            _ => panic!(
                "KDBX_PIPELINE_BUFFER_KIB must be an integer in 1..=100, got `{}`",
                raw
            ),
        },
        Err(_) => DEFAULT_BUFFER_KIB,
    };

    println!("cargo:rustc-env=KDBX_PIPELINE_BUFFER_KIB={}", kib);
}
