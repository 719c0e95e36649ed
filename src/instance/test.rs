use super::*;
use crate::api::fixtures::FakeApi;
use serde_json::json;

#[tokio::test]
async fn list_preserves_api_order() {
    let api = FakeApi::new().json(
        "/instances",
        json!([
            {"id": "web2", "uri": "/2/instances/web2"},
            {"id": "db1", "uri": "/2/instances/db1"},
            {"id": "web1", "uri": "/2/instances/web1"},
        ]),
    );

    assert_eq!(
        vec!["web2", "db1", "web1"],
        list_instances(&api).await.unwrap()
    );
}

#[tokio::test]
async fn list_of_nothing() {
    let api = FakeApi::new().json("/instances", json!([]));
    assert!(list_instances(&api).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_without_ids_is_a_decode_error() {
    let api = FakeApi::new().json("/instances", json!([{"name": "vm1"}]));
    assert!(matches!(
        list_instances(&api).await,
        Err(ApiError::Decode { .. })
    ));
}

#[tokio::test]
async fn info_extracts_network_port() {
    let api = FakeApi::new().json(
        "/instances/vm1",
        json!({"name": "vm1", "network_port": 11005, "status": "running"}),
    );

    let instance = instance(&api, "vm1").await.unwrap();
    assert_eq!(
        Instance {
            id: "vm1".into(),
            network_port: 11005,
        },
        instance
    );
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let api = FakeApi::new();
    match instance_info(&api, "ghost").await {
        Err(ApiError::NotFound(id)) => assert_eq!("ghost", id),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn other_statuses_pass_through() {
    let api = FakeApi::new().status("/instances/vm1", 502);
    assert!(matches!(
        instance_info(&api, "vm1").await,
        Err(ApiError::Status { status: 502, .. })
    ));
}

#[tokio::test]
async fn missing_port_is_a_decode_error() {
    let api = FakeApi::new().json("/instances/vm1", json!({"name": "vm1"}));
    assert!(matches!(
        instance_info(&api, "vm1").await,
        Err(ApiError::Decode { .. })
    ));
}

#[tokio::test]
async fn static_info_polls_the_returned_job() {
    let api = FakeApi::new()
        .json("/instances/vm1/info?static=1", json!(812))
        .json("/jobs/812", json!({"status": "running"}))
        .json(
            "/jobs/812",
            json!({"status": "success", "opresult": [{"vm1": {"os": "debian"}}]}),
        );

    let result = instance_static_info(&api, "vm1", &Backoff::immediate(10))
        .await
        .unwrap();

    assert_eq!(JobResult::PerNode(json!({"os": "debian"})), result);
    assert_eq!(
        vec![
            "/instances/vm1/info?static=1".to_owned(),
            "/jobs/812".to_owned(),
            "/jobs/812".to_owned(),
        ],
        api.requests()
    );
}
