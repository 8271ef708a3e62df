pub const METRONOME_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol revision of the ping/pong frames exchanged over TCP.
pub const WIRE_REVISION: u32 = 1;

pub fn git_commit_hash() -> &'static str {
    option_env!("GIT_COMMIT_HASH").unwrap_or("unknown")
}
