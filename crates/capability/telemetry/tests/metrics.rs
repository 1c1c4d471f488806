use plc_telemetry::{
    metrics, new_trace_id, record_bytes_sent, record_connect_failure, record_transaction,
};

#[test]
fn trace_ids_are_unique() {
    let a = new_trace_id();
    let b = new_trace_id();
    assert!(!a.is_empty());
    assert_ne!(a, b);
}

#[test]
fn counters_accumulate() {
    let before = metrics().snapshot();
    record_transaction(true, 3);
    record_transaction(false, 5);
    record_connect_failure();
    record_bytes_sent(12);
    let after = metrics().snapshot();

    assert!(after.transactions >= before.transactions + 2);
    assert!(after.transaction_failures >= before.transaction_failures + 1);
    assert!(after.connect_failures >= before.connect_failures + 1);
    assert!(after.bytes_sent >= before.bytes_sent + 12);
    assert!(after.transaction_latency_ms_total >= before.transaction_latency_ms_total + 8);
}
