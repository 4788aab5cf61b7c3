//! A replica whose fetcher goes through the executor recovers from an
//! expired token without surfacing an error.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use replica::{PhysicalReplica, ReplicaSettings, fetcher_fn};
use replica_network::{BearerCredentials, NetworkExecutor, NetworkRequest, ReqwestTransport};

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct Profile {
    handle: String,
}

async fn requests_to(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == route)
        .count()
}

#[tokio::test]
async fn test_replica_recovers_from_expired_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("Authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "handle": "replica" })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "fresh" })))
        .expect(1)
        .mount(&server)
        .await;

    let transport = Arc::new(ReqwestTransport::new(server.uri()).unwrap());
    let credentials = BearerCredentials::new(Some("stale".to_string())).with_refresh(
        transport.clone(),
        "/refresh",
        "refresh-token",
    );
    let executor = NetworkExecutor::new(transport, Arc::new(credentials));

    let replica = PhysicalReplica::new(
        "profile",
        ReplicaSettings::default(),
        fetcher_fn(move || {
            let executor = executor.clone();
            async move {
                executor
                    .execute_json::<Profile>(NetworkRequest::get("/profile"))
                    .await
            }
        }),
    );

    let (_active_tx, active_rx) = watch::channel(true);
    let _observer = replica.observe(active_rx);
    let state = replica
        .state_watch()
        .wait_for(|s| !s.loading && (s.data.is_some() || s.error.is_some()))
        .await
        .unwrap()
        .clone();

    assert!(state.error.is_none());
    assert!(state.has_fresh_data());
    assert_eq!(
        state.value(),
        Some(Profile {
            handle: "replica".to_string()
        })
    );

    assert_eq!(requests_to(&server, "/refresh").await, 1);
    assert_eq!(requests_to(&server, "/profile").await, 2);
}
