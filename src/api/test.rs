use super::fixtures::FakeApi;
use super::*;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

mod backoff {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let backoff = Backoff::default();
        let delays: Vec<_> = (0..7).map(|attempt| backoff.delay(attempt)).collect();
        let expected = [500, 1000, 2000, 4000, 8000, 8000, 8000].map(Duration::from_millis);
        assert_eq!(expected.to_vec(), delays);
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        assert_eq!(Duration::from_secs(8), Backoff::default().delay(u32::MAX));
    }

    #[test]
    fn immediate_never_waits() {
        let backoff = Backoff::immediate(3);
        assert_eq!(Duration::ZERO, backoff.delay(0));
        assert_eq!(Duration::ZERO, backoff.delay(9));
        assert_eq!(3, backoff.attempts);
    }
}

mod job_result {
    use super::*;

    #[test]
    fn per_node_entry_is_selected() {
        let opresult = json!([{"vm1": {"state": "up"}, "vm2": {"state": "down"}}]);
        assert_eq!(
            JobResult::PerNode(json!({"state": "up"})),
            JobResult::from_opresult(&opresult, Some("vm1")),
        );
    }

    #[test]
    fn missing_node_falls_back_to_scalar() {
        let opresult = json!([{"vm2": {"state": "down"}}]);
        assert_eq!(
            JobResult::Scalar(json!({"vm2": {"state": "down"}})),
            JobResult::from_opresult(&opresult, Some("vm1")),
        );
        assert_eq!(
            JobResult::Scalar(json!({"vm2": {"state": "down"}})),
            JobResult::from_opresult(&opresult, None),
        );
    }

    #[test]
    fn empty_results() {
        for opresult in [
            json!(null),
            json!([]),
            json!([null]),
            json!([{}]),
            json!([""]),
            json!([false]),
            json!([0]),
        ] {
            assert_eq!(
                JobResult::Empty,
                JobResult::from_opresult(&opresult, Some("vm1")),
                "opresult: {opresult}",
            );
        }
    }

    #[test]
    fn render_indents_by_one_space() {
        let result = JobResult::Scalar(json!({"a": [1, 2]}));
        assert_eq!("{\n \"a\": [\n  1,\n  2\n ]\n}", result.render());
    }

    #[test]
    fn render_keeps_the_api_key_order() {
        let opresult: Value =
            serde_json::from_str(r#"[{"vm1": {"name": "vm1", "config_state": "up", "beparams": {}}}]"#)
                .unwrap();
        let result = JobResult::from_opresult(&opresult, Some("vm1"));
        assert_eq!(
            "{\n \"name\": \"vm1\",\n \"config_state\": \"up\",\n \"beparams\": {}\n}",
            result.render()
        );
    }

    #[test]
    fn render_empty_is_empty_string() {
        assert_eq!("", JobResult::Empty.render());
    }

    #[test]
    fn job_ids_display_without_quotes() {
        assert_eq!("42", JobId::Number(42).to_string());
        assert_eq!("42", JobId::Text("42".into()).to_string());
        assert_eq!(JobId::Number(7), serde_json::from_str::<JobId>("7").unwrap());
        assert_eq!(
            JobId::Text("7".into()),
            serde_json::from_str::<JobId>("\"7\"").unwrap()
        );
    }
}

mod poll {
    use super::*;

    fn status(status: &str) -> Value {
        json!({"status": status, "opresult": null})
    }

    #[tokio::test]
    async fn returns_only_after_job_finishes() {
        let api = FakeApi::new()
            .json("/jobs/12", status("queued"))
            .json("/jobs/12", status("running"))
            .json("/jobs/12", status("running"))
            .json(
                "/jobs/12",
                json!({"status": "success", "opresult": [{"vm1": {"port": 11000}}]}),
            );

        let result = poll_job(&api, &JobId::Number(12), Some("vm1"), &Backoff::immediate(10))
            .await
            .unwrap();

        assert_eq!(JobResult::PerNode(json!({"port": 11000})), result);
        assert_eq!("{\n \"port\": 11000\n}", result.render());
        assert_eq!(4, api.requests().len());
    }

    #[tokio::test]
    async fn failed_jobs_are_finished_jobs() {
        let api = FakeApi::new().json(
            "/jobs/3",
            json!({"status": "error", "opresult": [["OpPrereqError", "bad"]]}),
        );

        let result = poll_job(&api, &JobId::Number(3), None, &Backoff::immediate(10))
            .await
            .unwrap();
        assert_eq!(JobResult::Scalar(json!(["OpPrereqError", "bad"])), result);
    }

    #[tokio::test]
    async fn times_out_after_attempt_budget() {
        let api = FakeApi::new().json("/jobs/5", status("waiting"));

        let error = poll_job(&api, &JobId::Text("5".into()), None, &Backoff::immediate(3))
            .await
            .unwrap_err();

        match error {
            ApiError::Timeout {
                job_id,
                attempts,
                last_status,
            } => {
                assert_eq!("5", job_id);
                assert_eq!(3, attempts);
                assert_eq!("waiting", last_status);
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(3, api.requests().len());
    }

    #[tokio::test]
    async fn request_errors_are_not_retried() {
        let api = FakeApi::new().status("/jobs/9", 500);

        let error = poll_job(&api, &JobId::Number(9), None, &Backoff::immediate(10))
            .await
            .unwrap_err();
        assert!(matches!(error, ApiError::Status { status: 500, .. }));
        assert_eq!(vec!["/jobs/9".to_owned()], api.requests());
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        let api = FakeApi::new().raw("/jobs/1", "<html>oops</html>");

        let error = poll_job(&api, &JobId::Number(1), None, &Backoff::immediate(10))
            .await
            .unwrap_err();
        assert!(matches!(error, ApiError::Decode { ref path, .. } if path == "/jobs/1"));
    }
}

mod cluster_client {
    use super::*;

    // Accepts a single connection on a local port, answers it with `response`, and returns the
    // raw request head through the join handle.
    async fn serve_once(response: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        (format!("http://{addr}/2"), handle)
    }

    fn http_response(status_line: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len(),
        )
    }

    #[test]
    fn url_joins_base_and_path() {
        let client = ClusterClient::new("ganeti:5080", "user", "pass").unwrap();
        assert_eq!("https://ganeti:5080/2/instances", client.url("/instances"));

        let client = ClusterClient::with_base_url("http://localhost/2/", "user", "pass").unwrap();
        assert_eq!("http://localhost/2/jobs/1", client.url("/jobs/1"));
    }

    #[tokio::test]
    async fn sends_basic_auth_and_returns_body() {
        let (base_url, server) = serve_once(http_response("200 OK", r#"[{"id":"vm1"}]"#)).await;
        let client = ClusterClient::with_base_url(base_url, "user", "pass").unwrap();

        let body = client.get("/instances").await.unwrap();
        assert_eq!(br#"[{"id":"vm1"}]"#.to_vec(), body);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /2/instances HTTP/1.1\r\n"), "{request}");
        // base64("user:pass")
        assert!(
            request
                .to_ascii_lowercase()
                .contains("authorization: basic dxnlcjpwyxnz"),
            "{request}",
        );
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (base_url, server) = serve_once(http_response("404 Not Found", "{}")).await;
        let client = ClusterClient::with_base_url(base_url, "user", "pass").unwrap();

        let error = client.get("/instances/nope").await.unwrap_err();
        assert!(matches!(error, ApiError::Status { status: 404, .. }));
        assert!(error.to_string().contains("/2/instances/nope"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        // Bind and immediately drop a listener to find a port that is almost certainly closed.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client = ClusterClient::with_base_url(format!("http://{addr}/2"), "u", "p").unwrap();

        let error = client.get("/instances").await.unwrap_err();
        assert!(matches!(error, ApiError::Transport { .. }), "{error:?}");
    }
}
