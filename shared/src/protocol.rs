/// Interface selector meaning "every interface the engine listens on"
pub const ALL_INTERFACES: u32 = 0;

/// Domain browsed and registered in when none is given
pub const DEFAULT_DOMAIN: &str = "local.";

/// Separator placed between a logical service name and its collision counter,
/// e.g. "printer #2"
pub const COLLISION_SEPARATOR: &str = " #";

/// Collision retries attempted before a registration is given up
pub const DEFAULT_MAX_COLLISION_RETRIES: u32 = 32;

/// Longest single TXT attribute record (one length byte)
pub const MAX_TXT_RECORD_LEN: usize = u8::MAX as usize;

/// API path prefix
pub const API_PREFIX: &str = "/v1";
