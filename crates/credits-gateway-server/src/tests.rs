use crate::{create_app, AppState};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::NaiveDate;
use credits_ledger::{
    CreditsLedger, FixedClock, InMemoryStorage, LedgerError, LedgerStorage, PaymentRecord,
    SwapOutcome, UpgradeCommit, UsageRecord,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

#[cfg(test)]
mod gateway_tests {
    use super::*;

    const ADMIN_KEY: &str = "test-admin-key";

    fn create_test_app() -> Router {
        let clock = Arc::new(FixedClock::at_date(
            NaiveDate::from_ymd_opt(2024, 11, 16).unwrap(),
        ));
        let ledger = CreditsLedger::new(Arc::new(InMemoryStorage::new())).with_clock(clock);
        create_app(AppState::new(Arc::new(ledger), ADMIN_KEY))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn post_json(uri: &str, body: Value, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app();

        let (status, json) = send(&app, get("/health", None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_get_usage_creates_free_account() {
        let app = create_test_app();

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/usage",
                json!({ "accountId": "user-1", "email": "user-1@example.com" }),
                None,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["accountId"], "user-1");
        assert_eq!(json["email"], "user-1@example.com");
        assert_eq!(json["subscriptionPlan"], "free");
        assert_eq!(json["dailyAllowance"], 60);
        assert_eq!(json["remainingCredits"], 60);
        assert_eq!(json["usedToday"], 0);
        assert_eq!(json["slowModeEnabled"], false);
        assert_eq!(json["lastResetDate"], "2024-11-16");

        let (status, json) = send(&app, get("/api/v1/accounts/user-1/usage", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["remainingCredits"], 60);
    }

    #[tokio::test]
    async fn test_get_usage_rejects_empty_account() {
        let app = create_test_app();

        let (status, json) =
            send(&app, post_json("/api/v1/usage", json!({ "accountId": "" }), None)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_consume_success_and_exhaustion() {
        let app = create_test_app();

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/credits/consume",
                json!({ "accountId": "user-2", "toolName": "chat", "amount": 59 }),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(json["canUse"], true);
        assert_eq!(json["remainingCredits"], 1);

        // amount defaults to one
        let (_, json) = send(
            &app,
            post_json(
                "/api/v1/credits/consume",
                json!({ "accountId": "user-2", "toolName": "chat" }),
                None,
            ),
        )
        .await;
        assert_eq!(json["status"], "success");
        assert_eq!(json["remainingCredits"], 0);

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/credits/consume",
                json!({ "accountId": "user-2", "toolName": "chat" }),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "error");
        assert_eq!(json["canUse"], false);
        assert_eq!(json["message"], "insufficient credits");
    }

    #[tokio::test]
    async fn test_consume_validation_error() {
        let app = create_test_app();

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/credits/consume",
                json!({ "accountId": "user-3", "toolName": "chat", "amount": 0 }),
                None,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "error");
        assert_eq!(json["canUse"], false);
        assert!(json["message"].as_str().unwrap().contains("amount"));
    }

    #[tokio::test]
    async fn test_upgrade_requires_admin_key() {
        let app = create_test_app();
        let body = json!({ "accountId": "user-4", "plan": "pro", "paymentReference": "pay-1" });

        let (status, json) =
            send(&app, post_json("/api/v1/plans/upgrade", body.clone(), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], "UNAUTHORIZED");

        let (status, _) =
            send(&app, post_json("/api/v1/plans/upgrade", body, Some("wrong-key"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_upgrade_to_pro() {
        let app = create_test_app();

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/plans/upgrade",
                json!({ "accountId": "user-5", "plan": "pro", "paymentReference": "pay-5" }),
                Some(ADMIN_KEY),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);

        let (_, json) = send(&app, get("/api/v1/accounts/user-5/usage", None)).await;
        assert_eq!(json["subscriptionPlan"], "pro");
        assert_eq!(json["monthlyAllowance"], 18000);
        // 15 of 30 days left in November
        assert_eq!(json["monthlyCredits"], 9000);
        assert_eq!(json["remainingCredits"], 9000);

        let (status, json) =
            send(&app, get("/api/v1/accounts/user-5/payments", Some(ADMIN_KEY))).await;
        assert_eq!(status, StatusCode::OK);
        let payments = json.as_array().unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0]["paymentReference"], "pay-5");
        assert_eq!(payments[0]["proratedCredits"], 9000);
    }

    #[tokio::test]
    async fn test_upgrade_unknown_plan_fails() {
        let app = create_test_app();

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/plans/upgrade",
                json!({ "accountId": "user-6", "plan": "platinum", "paymentReference": "pay-6" }),
                Some(ADMIN_KEY),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_upgrade_replay_is_idempotent() {
        let app = create_test_app();
        let body = json!({ "accountId": "user-7", "plan": "basic", "paymentReference": "pay-7" });

        for _ in 0..2 {
            let (status, json) =
                send(&app, post_json("/api/v1/plans/upgrade", body.clone(), Some(ADMIN_KEY)))
                    .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["success"], true);
        }

        let (_, json) = send(&app, get("/api/v1/accounts/user-7/usage", None)).await;
        assert_eq!(json["monthlyCredits"], 1700);

        let (_, json) = send(&app, get("/api/v1/accounts/user-7/payments", Some(ADMIN_KEY))).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_endpoints() {
        let app = create_test_app();

        send(
            &app,
            post_json(
                "/api/v1/credits/consume",
                json!({ "accountId": "user-8", "toolName": "chat", "amount": 5 }),
                None,
            ),
        )
        .await;

        let (status, _) = send(&app, post_json("/api/v1/maintenance/reset-daily", json!({}), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, json) = send(
            &app,
            post_json("/api/v1/maintenance/reset-daily", json!({}), Some(ADMIN_KEY)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["job"], "daily");
        assert!(json["affected"].is_u64());

        let (status, json) = send(
            &app,
            post_json("/api/v1/maintenance/reset-monthly", json!({}), Some(ADMIN_KEY)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["job"], "monthly");
    }

    #[tokio::test]
    async fn test_rpc_dispatch() {
        let app = create_test_app();

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/rpc",
                json!({ "op": "consume_credits", "accountId": "user-9", "toolName": "chat", "amount": 10 }),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(json["remainingCredits"], 50);

        let (status, json) = send(
            &app,
            post_json("/api/v1/rpc", json!({ "op": "get_usage", "accountId": "user-9" }), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["usedToday"], 10);

        let upgrade = json!({
            "op": "upgrade_plan",
            "accountId": "user-9",
            "plan": "advanced",
            "paymentReference": "pay-9"
        });
        let (status, _) = send(&app, post_json("/api/v1/rpc", upgrade.clone(), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, json) = send(&app, post_json("/api/v1/rpc", upgrade, Some(ADMIN_KEY))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);

        let (status, json) = send(
            &app,
            post_json("/api/v1/rpc", json!({ "op": "reset_monthly" }), Some(ADMIN_KEY)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["job"], "monthly");
    }

    #[tokio::test]
    async fn test_rpc_unknown_op_is_rejected() {
        let app = create_test_app();

        let response = app
            .oneshot(post_json("/api/v1/rpc", json!({ "op": "drop_tables" }), None))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_consume_missing_tool_name_is_validation_error() {
        let app = create_test_app();

        let (status, json) = send(
            &app,
            post_json("/api/v1/credits/consume", json!({ "accountId": "u" }), None),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "error");
        assert_eq!(json["canUse"], false);
        assert!(json["message"].as_str().unwrap().contains("toolName"));
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_validation_errors() {
        let app = create_test_app();

        let (status, json) =
            send(&app, post_json("/api/v1/usage", json!({ "email": "a@b.c" }), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "VALIDATION_ERROR");

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/plans/upgrade",
                json!({ "accountId": "u", "plan": "pro" }),
                Some(ADMIN_KEY),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "VALIDATION_ERROR");

        let (status, json) = send(
            &app,
            post_json("/api/v1/rpc", json!({ "op": "consume_credits", "accountId": "u" }), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "error");
        assert_eq!(json["canUse"], false);
    }

    /// Storage whose writes fail while `down` is set.
    #[derive(Default)]
    struct UnreachableStorage {
        inner: InMemoryStorage,
        down: AtomicBool,
    }

    impl UnreachableStorage {
        fn check(&self) -> credits_ledger::Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(LedgerError::Storage("database is locked".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LedgerStorage for UnreachableStorage {
        async fn load(&self, account_id: &str) -> credits_ledger::Result<Option<UsageRecord>> {
            self.inner.load(account_id).await
        }

        async fn insert(&self, record: &UsageRecord) -> credits_ledger::Result<bool> {
            self.check()?;
            self.inner.insert(record).await
        }

        async fn compare_and_swap(&self, record: &UsageRecord) -> credits_ledger::Result<SwapOutcome> {
            self.check()?;
            self.inner.compare_and_swap(record).await
        }

        async fn commit_upgrade(
            &self,
            record: &UsageRecord,
            payment: &PaymentRecord,
        ) -> credits_ledger::Result<UpgradeCommit> {
            self.check()?;
            self.inner.commit_upgrade(record, payment).await
        }

        async fn find_payment(
            &self,
            payment_reference: &str,
        ) -> credits_ledger::Result<Option<PaymentRecord>> {
            self.inner.find_payment(payment_reference).await
        }

        async fn payments_for(&self, account_id: &str) -> credits_ledger::Result<Vec<PaymentRecord>> {
            self.inner.payments_for(account_id).await
        }

        async fn account_ids(&self) -> credits_ledger::Result<Vec<String>> {
            self.inner.account_ids().await
        }
    }

    fn create_unreachable_app() -> (Router, Arc<UnreachableStorage>) {
        let storage = Arc::new(UnreachableStorage::default());
        let clock = Arc::new(FixedClock::at_date(
            NaiveDate::from_ymd_opt(2024, 11, 16).unwrap(),
        ));
        let ledger = CreditsLedger::new(storage.clone()).with_clock(clock);
        (create_app(AppState::new(Arc::new(ledger), ADMIN_KEY)), storage)
    }

    #[tokio::test]
    async fn test_storage_failure_maps_to_service_unavailable() {
        let (app, storage) = create_unreachable_app();
        storage.down.store(true, Ordering::SeqCst);

        let (status, json) =
            send(&app, post_json("/api/v1/usage", json!({ "accountId": "new" }), None)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["code"], "STORAGE_UNAVAILABLE");
        assert!(json["error"].as_str().unwrap().contains("retry later"));
    }

    #[tokio::test]
    async fn test_consume_storage_failure_keeps_consume_shape() {
        let (app, storage) = create_unreachable_app();
        send(&app, get("/api/v1/accounts/user/usage", None)).await;
        storage.down.store(true, Ordering::SeqCst);

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/credits/consume",
                json!({ "accountId": "user", "toolName": "chat", "amount": 3 }),
                None,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "error");
        assert_eq!(json["canUse"], false);

        storage.down.store(false, Ordering::SeqCst);
        let (_, json) = send(&app, get("/api/v1/accounts/user/usage", None)).await;
        assert_eq!(json["usedToday"], 0);
    }

    #[tokio::test]
    async fn test_upgrade_storage_failure_reports_not_applied() {
        let (app, storage) = create_unreachable_app();
        let (_, before) = send(&app, get("/api/v1/accounts/user/usage", None)).await;
        storage.down.store(true, Ordering::SeqCst);

        let (status, json) = send(
            &app,
            post_json(
                "/api/v1/plans/upgrade",
                json!({ "accountId": "user", "plan": "pro", "paymentReference": "pay-down" }),
                Some(ADMIN_KEY),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], false);

        storage.down.store(false, Ordering::SeqCst);
        let (_, after) = send(&app, get("/api/v1/accounts/user/usage", None)).await;
        assert_eq!(after, before);
        let (_, payments) =
            send(&app, get("/api/v1/accounts/user/payments", Some(ADMIN_KEY))).await;
        assert!(payments.as_array().unwrap().is_empty());
    }
}
