//! `metrics` facade emitters.
//!
//! Nothing here installs a recorder; without one every call is a no-op.

use ::metrics::{counter, gauge, histogram};

use crate::protocol::RequestTag;

pub fn record_connection_accepted(current: usize) {
    counter!("ldap_core_connections_accepted_total").increment(1);
    gauge!("ldap_core_connections_current").set(current as f64);
}

pub fn record_connection_rejected(reason: &'static str) {
    counter!("ldap_core_connections_rejected_total", "reason" => reason).increment(1);
}

pub fn record_connection_closed(current: usize) {
    counter!("ldap_core_connections_closed_total").increment(1);
    gauge!("ldap_core_connections_current").set(current as f64);
}

pub fn record_op_initiated(tag: RequestTag) {
    counter!("ldap_core_ops_initiated_total", "tag" => tag.name()).increment(1);
}

pub fn record_op_completed(tag: RequestTag, latency_us: u64) {
    counter!("ldap_core_ops_completed_total", "tag" => tag.name()).increment(1);
    histogram!("ldap_core_op_latency_us", "tag" => tag.name()).record(latency_us as f64);
}

pub fn record_op_abandoned(tag: RequestTag) {
    counter!("ldap_core_ops_abandoned_total", "tag" => tag.name()).increment(1);
}

pub fn record_busy_rejection() {
    counter!("ldap_core_busy_rejections_total").increment(1);
}

pub fn record_submit_failure() {
    counter!("ldap_core_submit_failures_total").increment(1);
}

pub fn record_op_pool(free: usize) {
    gauge!("ldap_core_op_pool_free").set(free as f64);
}

pub fn record_reader(renewed: bool) {
    let kind = if renewed { "renewed" } else { "opened" };
    counter!("ldap_core_read_txns_total", "kind" => kind).increment(1);
}

pub fn record_write_wait() {
    counter!("ldap_core_write_waits_total").increment(1);
}
