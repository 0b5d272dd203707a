pub const STORE_VERSION_CONFLICTS: &str = "scan_store_version_conflicts";
pub const STORE_PUT_DURATION: &str = "scan_store_put_duration_seconds";
