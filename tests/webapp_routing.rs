// End-to-end routing through the axum router: reserved routes, statics,
// controllers, scripts, request bodies and error payloads.
mod common;

#[cfg(test)]
mod test {
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode, header},
    };

    use crate::common::{TestHost, body_string};

    const SHOP: &str = r#"{
        "controllers": { "/health": "Health", "/files/*": "Health", "/api/*": "api/$1.rhai" },
        "statics": { "/css/*": "css", "/files/*": "files" }
    }"#;

    fn shop() -> TestHost {
        TestHost::new(&[
            ("shop/app.json", SHOP),
            ("shop/css/site.css", "body { color: red; }"),
            ("shop/files/notes.txt", "static wins"),
            ("shop/docs/index.rhai", r#"response.write("docs index");"#),
            (
                "shop/api/echo.rhai",
                r#"response.json(#{ method: request.method, body: request.body() });"#,
            ),
            (
                "shop/boom.rhai",
                r#"throw "connection string postgres://secret";"#,
            ),
            (
                "shop/boom_json.rhai",
                r#"
                    response.content_type("application/json");
                    throw "failed after choosing json";
                "#,
            ),
            (
                "shop/page.rhai",
                r#"
                    let title = tools.call("missing", "get");
                    response.write(title);
                "#,
            ),
        ])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_static_file_headers_and_head() {
        let host = shop();

        let response = host.get("/shop/css/site.css").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "20");
        assert!(response.headers().contains_key(header::LAST_MODIFIED));
        assert!(response.headers().contains_key(header::SERVER));
        assert_eq!(body_string(response).await, "body { color: red; }");

        let response = host
            .send(
                Request::builder()
                    .method(Method::HEAD)
                    .uri("/shop/css/site.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "20");
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_static_rule_wins_over_controller() {
        let host = shop();

        let response = host.get("/shop/files/notes.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "static wins");

        // A matching static rule with no file behind it is a 404, not a fallthrough
        let response = host.get("/shop/files/absent.txt").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("NOT_FOUND_ERROR"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_not_found() {
        let host = shop();

        for uri in ["/elsewhere", "/shop/css/missing.css", "/shop/nothing-here"] {
            let response = host.get(uri).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(
                response.headers()[header::CONTENT_TYPE],
                "text/html; charset=utf-8"
            );
            assert!(body_string(response).await.contains("404 NOT_FOUND_ERROR"));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compiled_controller() {
        let host = shop();

        let response = host.get("/shop/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        assert!(response.headers().contains_key(header::SET_COOKIE));

        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_directory_redirect_keeps_query() {
        let host = shop();

        let response = host.get("/shop/docs?page=2").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/shop/docs/?page=2");

        let response = host.get("/shop/docs/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "docs index");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_script_error_hides_details() {
        let host = shop();

        let response = host.get("/shop/boom").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert!(body.contains("500 SCRIPT_ERROR"));
        assert!(!body.contains("postgres://"));
        assert!(!body.contains("line"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_error_format_follows_response_content_type() {
        let host = shop();

        let response = host.get("/shop/boom_json").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], 500);
        assert_eq!(json["title"], "SCRIPT_ERROR");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tool_failure_is_query_error() {
        let host = shop();

        let response = host.get("/shop/page").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response).await.contains("QUERY_ERROR"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_json_body_reaches_script() {
        let host = shop();

        let response = host
            .send(
                Request::builder()
                    .method(Method::POST)
                    .uri("/shop/api/echo")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"name":"ada","tags":[1,2]}"#))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["body"]["name"], "ada");
        assert_eq!(json["body"]["tags"][1], 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_form_body_reaches_script() {
        let host = shop();

        let response = host
            .send(
                Request::builder()
                    .method(Method::POST)
                    .uri("/shop/api/echo")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("name=ada&city=London"))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["body"]["city"], "London");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unacceptable_bodies() {
        let host = shop();

        let requests = [
            ("application/pdf", "%PDF-1.7"),
            ("application/json", "{not json"),
            ("application/xml", "<open>"),
        ];
        for (content_type, body) in requests {
            let response = host
                .send(
                    Request::builder()
                        .method(Method::POST)
                        .uri("/shop/api/echo")
                        .header(header::CONTENT_TYPE, content_type)
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await;
            assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE, "{content_type}");
            assert!(body_string(response).await.contains("BODY_ERROR"));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_lists_applications() {
        let host = shop();

        let response = host.get("/_status").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        let apps = json["applications"].as_array().unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0]["context_path"], "/shop");
        assert_eq!(apps[0]["live_generation"], 1);
    }
}
