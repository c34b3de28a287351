use agentbox_billing::*;
use agentbox_common::Tier;
use mockito::Server;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn client_for(server: &mockito::ServerGuard) -> HttpBillingClient {
    let base = url::Url::parse(&server.url()).unwrap();
    HttpBillingClient::new(base, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_http_balance_and_tier() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v1/accounts/alice")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"user_id": "alice", "balance": 500, "tier": "team"}).to_string())
        .expect(2)
        .create_async()
        .await;

    let client = client_for(&server);
    assert_eq!(client.get_balance("alice").await.unwrap(), 500);
    assert_eq!(client.get_tier("alice").await.unwrap(), Tier::Team);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_debit_insufficient() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/accounts/bob/debits")
        .match_body(mockito::Matcher::PartialJson(json!({"tokens": 120})))
        .with_status(402)
        .with_header("content-type", "application/json")
        .with_body(json!({"required": 120, "available": 30}).to_string())
        .create_async()
        .await;

    let client = client_for(&server);
    let err = client.debit("bob", 120, "lease").await.unwrap_err();
    assert_eq!(
        err,
        BillingError::InsufficientBalance {
            required: 120,
            available: 30
        }
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_unknown_account() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/v1/accounts/ghost")
        .with_status(404)
        .create_async()
        .await;

    let client = client_for(&server);
    assert_eq!(
        client.get_balance("ghost").await.unwrap_err(),
        BillingError::AccountNotFound("ghost".into())
    );
}

#[tokio::test]
async fn test_http_server_error_is_unavailable() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/accounts/carol/debits")
        .with_status(503)
        .create_async()
        .await;

    let client = client_for(&server);
    assert!(matches!(
        client.debit("carol", 1, "metered").await,
        Err(BillingError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_concurrent_debits_never_overdraw() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.create_account("dave", Tier::Developer, 100).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.debit("dave", 30, "lease").await.is_ok()
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 3);
    assert_eq!(ledger.get_balance("dave").await.unwrap(), 10);
    assert_eq!(ledger.debits_for("dave").await.len(), 3);
}

#[tokio::test]
async fn test_credit_restores_affordability() {
    let ledger = InMemoryLedger::new();
    ledger.create_account("erin", Tier::Scale, 10).await;
    assert!(ledger.debit("erin", 50, "lease").await.is_err());

    ledger.credit("erin", 40).await.unwrap();
    ledger.debit("erin", 50, "lease").await.unwrap();
    assert_eq!(ledger.get_balance("erin").await.unwrap(), 0);
}
