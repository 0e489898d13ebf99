//! Report, alarm and command flows over TLS.

use super::fixtures::{eventually, GatewayOptions, TestGateway};
use chrono::Local;
use coldgate::report::AlarmSet;
use coldgate::store::DeviceStore;
use serde_json::{json, Value};
use std::sync::Arc;

fn stored_today(gw: &TestGateway, device_id: &str) -> Vec<Value> {
    let path = gw
        .data_dir()
        .join(format!("{}_{}.json", device_id, Local::now().date_naive().format("%Y-%m-%d")));
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_report_acknowledged_and_stored_verbatim() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    let report = json!({
        "unit": "U1",
        "timestamp": "14:02:11  06:15:2025",
        "alarm_codes": "",
        "setpoint": 38.0,
        "firmware": {"rev": "2.4.1", "flags": [1, 2]}
    });

    let response = gw.client().send(gw.addr, &report).await.unwrap();
    assert_eq!(response.status, "Received");
    assert_eq!(stored_today(&gw, "U1"), vec![report]);

    gw.stop().await;
}

#[tokio::test]
async fn test_reports_kept_in_arrival_order() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    let client = gw.client();

    for seq in 0..5 {
        client
            .send(gw.addr, &json!({"unit": "U1", "seq": seq}))
            .await
            .unwrap();
    }

    let seqs: Vec<i64> = stored_today(&gw, "U1")
        .iter()
        .map(|r| r["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

    gw.stop().await;
}

#[tokio::test]
async fn test_alarm_notifications_deduplicated() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    let client = gw.client();
    let client = &client;
    let addr = gw.addr;
    let send = move |codes: Value| {
        async move {
            client
                .send(addr, &json!({"unit": "U1", "alarm_codes": codes}))
                .await
                .unwrap()
        }
    };

    send(json!([101, 102])).await;
    assert_eq!(gw.notifier.count(), 1);

    send(json!("102,101")).await;
    assert_eq!(gw.notifier.count(), 1);

    send(json!([103])).await;
    assert_eq!(gw.notifier.count(), 2);

    send(json!([])).await;
    assert_eq!(gw.notifier.count(), 2);
    assert_eq!(gw.engine.current_alarm_state("U1"), None);

    let alerts = gw.notifier.alerts();
    assert_eq!(alerts[0], ("U1".to_string(), AlarmSet::from([101, 102])));
    assert_eq!(alerts[1], ("U1".to_string(), AlarmSet::from([103])));

    gw.stop().await;
}

#[tokio::test]
async fn test_queued_command_delivered_once() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    let client = gw.client();

    gw.engine.queue_command("U1", "DEFROST").unwrap();

    let first = client.send(gw.addr, &json!({"unit": "U1"})).await.unwrap();
    assert_eq!(first.status, "DEFROST");
    assert_eq!(gw.engine.pending_command("U1"), None);

    let second = client.send(gw.addr, &json!({"unit": "U1"})).await.unwrap();
    assert_eq!(second.status, "Received");

    gw.stop().await;
}

#[tokio::test]
async fn test_command_for_other_device_not_delivered() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    gw.engine.queue_command("U2", "RESET").unwrap();

    let response = gw.client().send(gw.addr, &json!({"unit": "U1"})).await.unwrap();
    assert_eq!(response.status, "Received");
    assert_eq!(gw.engine.pending_command("U2").as_deref(), Some("RESET"));

    gw.stop().await;
}

#[tokio::test]
async fn test_legacy_identifier_field() {
    let gw = TestGateway::start(GatewayOptions::default()).await;

    let response = gw.client().send(gw.addr, &json!({"trl": "T9"})).await.unwrap();
    assert_eq!(response.status, "Received");
    assert_eq!(stored_today(&gw, "T9").len(), 1);

    gw.stop().await;
}

#[tokio::test]
async fn test_malformed_json_gets_no_response() {
    let gw = TestGateway::start(GatewayOptions::default()).await;

    let reply = gw
        .client()
        .send_raw(gw.addr, b"{\"unit\": \"U1\", \"temp\": }")
        .await
        .unwrap();
    assert!(reply.is_empty());
    assert!(gw.engine.list_devices().await.unwrap().is_empty());

    gw.stop().await;
}

#[tokio::test]
async fn test_missing_identifier_gets_no_response() {
    let gw = TestGateway::start(GatewayOptions::default()).await;

    let reply = gw
        .client()
        .send_raw(gw.addr, br#"{"ping": true}"#)
        .await
        .unwrap();
    assert!(reply.is_empty());
    assert!(gw.engine.list_devices().await.unwrap().is_empty());

    gw.stop().await;
}

#[tokio::test]
async fn test_concurrent_reports_same_device_not_lost() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    let client = Arc::new(gw.client());

    let mut tasks = Vec::new();
    for seq in 0..20 {
        let client = Arc::clone(&client);
        let addr = gw.addr;
        tasks.push(tokio::spawn(async move {
            client
                .send(addr, &json!({"unit": "U5", "seq": seq}))
                .await
                .unwrap()
        }));
    }
    for t in tasks {
        assert_eq!(t.await.unwrap().status, "Received");
    }

    let mut seqs: Vec<i64> = stored_today(&gw, "U5")
        .iter()
        .map(|r| r["seq"].as_i64().unwrap())
        .collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..20).collect::<Vec<_>>());

    gw.stop().await;
}

#[tokio::test]
async fn test_mutual_tls_requires_client_certificate() {
    let gw = TestGateway::start(GatewayOptions {
        mutual_tls: true,
        ..GatewayOptions::default()
    })
    .await;

    let ok = gw.client().send(gw.addr, &json!({"unit": "U1"})).await.unwrap();
    assert_eq!(ok.status, "Received");

    let anonymous = gw.anonymous_client().send(gw.addr, &json!({"unit": "U2"})).await;
    assert!(anonymous.is_err());

    let ip = gw.addr.ip();
    assert!(eventually(|| gw.blocklist.failure_count(&ip) == 1).await);
    assert_eq!(gw.engine.list_devices().await.unwrap(), vec!["U1"]);

    gw.stop().await;
}

#[tokio::test]
async fn test_records_view_sorted_by_timestamp() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    let client = gw.client();

    for (n, ts) in [(2, "12:00:00  06:15:2025"), (0, "not a time"), (1, "08:00:00  06:15:2025")] {
        client
            .send(gw.addr, &json!({"unit": "U1", "timestamp": ts, "n": n}))
            .await
            .unwrap();
    }

    // Direct store access sees the same files the engine wrote
    let store = DeviceStore::open(gw.data_dir(), 30).unwrap();
    let sorted = store.records("U1").await.unwrap();
    let order: Vec<i64> = sorted.iter().map(|r| r["n"].as_i64().unwrap()).collect();
    assert_eq!(order, vec![1, 2]);
    assert_eq!(gw.engine.get_records("U1").await.unwrap(), sorted);
    assert_eq!(stored_today(&gw, "U1").len(), 3);

    gw.stop().await;
}
