pub const TOPIC_OVERRIDES_IN: &str = "HA-to-rg_PwrMgmt";
pub const TOPIC_RESULTS_OUT: &str = "rg_PwrMgmt-to-HA";

/// Device push feed topic for a given certificate account and serial.
pub fn feed_quota_topic(account: &str, serial_number: &str) -> String {
    format!("/open/{account}/{serial_number}/quota")
}
