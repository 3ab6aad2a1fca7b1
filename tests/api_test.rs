//! HTTP routing and envelope tests

mod common;

#[cfg(test)]
mod tests {
    use crate::common::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use payorch::api::router;
    use payorch::payments::types::PaymentMethod;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> (Router, Harness) {
        let h = Harness::new(&[
            FakeGateway::new(PaymentMethod::PushPayment),
            FakeGateway::new(PaymentMethod::RedirectCapture),
        ]);
        (router(h.service.clone()), h)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, request_id, body)
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _h) = app();
        let (status, request_id, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(request_id.is_some());
    }

    #[tokio::test]
    async fn test_process_payment_envelope() {
        let (app, _h) = app();
        let (status, _, body) = send(&app, post_json("/api/payments/push_payment", &push_request())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["code"], 200);
        assert_eq!(body["data"]["status"], "pending");
        assert_eq!(body["data"]["gateway_transaction_id"], "ref-1");
        assert!(body["data"].get("raw_payload").is_none());
    }

    #[tokio::test]
    async fn test_http_status_matches_envelope_code() {
        let (app, _h) = app();

        let (status, _, body) = send(
            &app,
            post_json("/api/payments/push_payment", &json!({"amount": 500, "customer_reference": "c1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
        assert_eq!(body["data"]["errors"][0]["field"], "phone_number");

        let (status, _, body) = send(&app, post_json("/api/payments/bitcoin", &push_request())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_unreadable_body_is_invalid_field() {
        let (app, _h) = app();
        let request = Request::post("/api/payments/push_payment")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["data"]["errors"][0]["field"], "body");
    }

    #[tokio::test]
    async fn test_capture_and_status_routes() {
        let (app, _h) = app();
        send(&app, post_json("/api/payments/redirect_capture", &redirect_request())).await;

        let capture = Request::post("/api/payments/orders/order-1/capture").body(Body::empty()).unwrap();
        let (status, _, body) = send(&app, capture).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "completed");

        let lookup = Request::get("/api/payments/status/order-1").body(Body::empty()).unwrap();
        let (status, _, body) = send(&app, lookup).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "completed");

        let missing = Request::get("/api/payments/status/nope").body(Body::empty()).unwrap();
        let (status, _, _) = send(&app, missing).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_callback_always_acknowledged() {
        let (app, _h) = app();
        send(&app, post_json("/api/payments/push_payment", &push_request())).await;

        let (status, _, body) = send(
            &app,
            post_json("/api/payments/callbacks/push", &push_callback("ref-1", 0, Some(500))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ResultCode"], 0);

        let garbage = Request::post("/api/payments/callbacks/push")
            .header("content-type", "application/json")
            .body(Body::from("]]"))
            .unwrap();
        let (status, _, _) = send(&app, garbage).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_transactions_query() {
        let (app, _h) = app();
        send(&app, post_json("/api/payments/push_payment", &push_request())).await;
        send(&app, post_json("/api/payments/redirect_capture", &redirect_request())).await;

        let request = Request::get("/api/payments/transactions?method=redirect_capture&status=pending")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        let items = body["data"]["transactions"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["customer_reference"], "CUST-2001");

        let bad = Request::get("/api/payments/transactions?status=unknown").body(Body::empty()).unwrap();
        let (status, _, _) = send(&app, bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
