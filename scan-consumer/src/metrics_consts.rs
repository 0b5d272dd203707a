pub const MESSAGES_RECEIVED: &str = "scan_messages_received";
pub const MESSAGES_PROCESSED: &str = "scan_messages_processed";
// Labelled with the decode error kind, or "store" when the write failed.
pub const MESSAGES_FAILED: &str = "scan_messages_failed";
pub const WRITES_STALE: &str = "scan_writes_stale";
pub const MESSAGES_DEAD_LETTERED: &str = "scan_messages_dead_lettered";
pub const MESSAGES_DROPPED: &str = "scan_messages_dropped";
pub const IN_FLIGHT: &str = "scan_consumer_in_flight";
pub const RECEIVE_ERRORS: &str = "scan_transport_receive_errors";
pub const DELIVERIES_EXHAUSTED: &str = "scan_kafka_deliveries_exhausted";
