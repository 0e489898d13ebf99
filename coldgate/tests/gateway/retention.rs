//! Retention sweep triggered by incoming reports.

use super::fixtures::{eventually, GatewayOptions, TestGateway};
use chrono::{Days, Local};
use serde_json::json;

#[tokio::test]
async fn test_report_triggers_sweep() {
    let gw = TestGateway::start(GatewayOptions {
        retention_days: 30,
        ..GatewayOptions::default()
    })
    .await;

    let today = Local::now().date_naive();
    let name = |id: &str, days_ago: u64| {
        let date = today.checked_sub_days(Days::new(days_ago)).unwrap();
        gw.data_dir().join(format!("{}_{}.json", id, date.format("%Y-%m-%d")))
    };

    let expired = name("U1", 31);
    let boundary = name("U1", 30);
    let other_device_expired = name("U9", 90);
    let foreign = gw.data_dir().join("README.txt");
    for path in [&expired, &boundary, &other_device_expired, &foreign] {
        std::fs::write(path, "[]").unwrap();
    }

    let response = gw.client().send(gw.addr, &json!({"unit": "U1"})).await.unwrap();
    assert_eq!(response.status, "Received");

    assert!(eventually(|| !expired.exists() && !other_device_expired.exists()).await);
    assert!(boundary.exists());
    assert!(foreign.exists());
    assert!(name("U1", 0).exists());

    gw.stop().await;
}

#[tokio::test]
async fn test_rejected_request_does_not_sweep() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    let today = Local::now().date_naive();
    let old = today.checked_sub_days(Days::new(400)).unwrap();
    let expired = gw
        .data_dir()
        .join(format!("U1_{}.json", old.format("%Y-%m-%d")));
    std::fs::write(&expired, "[]").unwrap();

    let reply = gw.client().send_raw(gw.addr, b"{broken}").await.unwrap();
    assert!(reply.is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(expired.exists());

    gw.stop().await;
}
