//! Handshake failure counting and address bans.

use super::fixtures::{eventually, fail_handshake, GatewayOptions, TestGateway};
use coldgate::blocklist::Blocklist;
use coldgate::tls;
use rustls::pki_types::ServerName;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

#[tokio::test]
async fn test_ban_after_repeated_handshake_failures() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    let ip = gw.addr.ip();

    for expected in 1..=2 {
        fail_handshake(gw.addr).await;
        assert!(eventually(|| gw.blocklist.failure_count(&ip) == expected).await);
        assert!(!gw.blocklist.is_blocked(&ip));
    }

    fail_handshake(gw.addr).await;
    assert!(eventually(|| gw.blocklist.is_blocked(&ip)).await);

    // Dropped before any handshake
    let result = gw.client().send(gw.addr, &json!({"unit": "U1"})).await;
    assert!(result.is_err());
    assert!(gw.engine.list_devices().await.unwrap().is_empty());

    gw.stop().await;
}

#[tokio::test]
async fn test_ban_survives_restart() {
    let gw = TestGateway::start(GatewayOptions {
        max_failures: 1,
        ..GatewayOptions::default()
    })
    .await;
    let ip = gw.addr.ip();
    let blocklist_file = gw.blocklist_file();

    fail_handshake(gw.addr).await;
    assert!(eventually(|| gw.blocklist.is_blocked(&ip)).await);

    let persisted: Vec<String> =
        serde_json::from_str(&std::fs::read_to_string(&blocklist_file).unwrap()).unwrap();
    assert_eq!(persisted, vec![ip.to_string()]);

    // Keep the state directory alive while a second gateway reads the file
    let copy = tempfile::NamedTempFile::new().unwrap();
    std::fs::copy(&blocklist_file, copy.path()).unwrap();
    gw.stop().await;

    let reloaded = Blocklist::load(copy.path(), 3).unwrap();
    assert!(reloaded.is_blocked(&ip));

    let restarted = TestGateway::start(GatewayOptions {
        blocklist_file: Some(copy.path().to_path_buf()),
        ..GatewayOptions::default()
    })
    .await;
    assert!(restarted.blocklist.is_blocked(&ip));
    let result = restarted
        .client()
        .send(restarted.addr, &json!({"unit": "U1"}))
        .await;
    assert!(result.is_err());

    restarted.stop().await;
}

#[tokio::test]
async fn test_successful_handshake_resets_failures() {
    let gw = TestGateway::start(GatewayOptions::default()).await;
    let ip = gw.addr.ip();

    fail_handshake(gw.addr).await;
    fail_handshake(gw.addr).await;
    assert!(eventually(|| gw.blocklist.failure_count(&ip) == 2).await);

    let ok = gw.client().send(gw.addr, &json!({"unit": "U1"})).await.unwrap();
    assert_eq!(ok.status, "Received");
    assert_eq!(gw.blocklist.failure_count(&ip), 0);

    fail_handshake(gw.addr).await;
    fail_handshake(gw.addr).await;
    assert!(eventually(|| gw.blocklist.failure_count(&ip) == 2).await);
    assert!(!gw.blocklist.is_blocked(&ip));

    gw.stop().await;
}

#[tokio::test]
async fn test_ban_during_pending_handshake_denies_session() {
    let gw = TestGateway::start(GatewayOptions {
        max_failures: 1,
        ..GatewayOptions::default()
    })
    .await;
    let ip = gw.addr.ip();

    // Admitted while the address is still clean
    let pending = TcpStream::connect(gw.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    fail_handshake(gw.addr).await;
    assert!(eventually(|| gw.blocklist.is_blocked(&ip)).await);

    let config = tls::build_client_config(&gw.pki.ca_cert, None).unwrap();
    let connector = TlsConnector::from(config);
    let connected = connector
        .connect(ServerName::try_from("localhost").unwrap(), pending)
        .await;

    if let Ok(mut tls) = connected {
        let _ = tls.write_all(br#"{"unit": "U1"}"#).await;
        let _ = tls.flush().await;
        let mut reply = Vec::new();
        let _ = tls.read_to_end(&mut reply).await;
        assert!(reply.is_empty());
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gw.engine.list_devices().await.unwrap().is_empty());

    gw.stop().await;
}
