/// Default number of master key transformation rounds
/// (making dictionary attacks harder).
pub const DEFAULT_KEY_ENCRYPTION_ROUNDS: u64 = 60000;

/// Split size for hashed blocks written by this crate.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Upper bound on a single hashed block's payload. Anything larger is
/// treated as corruption rather than allocated.
pub const MAX_BLOCK_SIZE: usize = 10 * 1024 * 1024;

/// Number of in-flight chunks per pipeline link.
pub const PIPE_DEPTH: usize = 4;

/// Per-link pipeline chunk size in bytes. The KiB value is fixed at build
/// time through the `KDBX_PIPELINE_BUFFER_KIB` environment variable
/// (1..=100, default 4); `build.rs` validates it.
pub fn pipe_chunk_size() -> usize {
    env!("KDBX_PIPELINE_BUFFER_KIB")
        .parse::<usize>()
        .unwrap_or(4)
        * 1024
}

#[cfg(test)]
mod test {
    #[test]
    fn chunk_size_is_in_range() {
        let size = super::pipe_chunk_size();
        assert!(size >= 1024 && size <= 100 * 1024);
        assert_eq!(size % 1024, 0);
    }
}
