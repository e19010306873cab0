use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix of sandbox ids.
pub const SANDBOX_ID_PREFIX: &str = "SBX-";

/// Prefix of job ids.
pub const JOB_ID_PREFIX: &str = "JOB-";

/// Prefix of snapshot ids.
pub const SNAPSHOT_ID_PREFIX: &str = "SNP-";

/// Prefix of command ids.
pub const COMMAND_ID_PREFIX: &str = "CMD-";

/// Prefix of diff ids.
pub const DIFF_ID_PREFIX: &str = "DIF-";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the first hyphen-separated segment of a fresh v4 UUID.
pub fn short_id() -> String {
    let id = Uuid::new_v4().to_string();
    id.split('-').next().unwrap_or(&id).to_string()
}

/// Returns `prefix` followed by a fresh [`short_id`].
pub fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}{}", short_id())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
