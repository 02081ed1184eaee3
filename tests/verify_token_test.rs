//! Token verification pipeline: fast path, cold path, expiry,
//! revocation and throttling.

mod common;

use chrono::Utc;
use common::*;
use deviceauth_service::error::DevAuthError;
use deviceauth_service::jwt::{Claims, JwtHandler};
use deviceauth_service::models::{Limit, LIMIT_MAX_DEVICE_COUNT};
use deviceauth_service::utils::Clock;

#[tokio::test]
async fn test_verify_issued_token() {
    let fx = fixture();
    let ctx = ctx();
    let req = auth_req("aa:bb:cc", "key-1");
    let (device_id, auth_id, raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    // cold path
    let claims = fx.devauth.verify_token(&ctx, &raw).await.unwrap();
    assert_eq!(claims.subject, device_id);
    assert_eq!(claims.id, auth_id);
    assert!(claims.device);

    // second verification of the same raw token hits the cache
    let claims = fx.devauth.verify_token(&ctx, &raw).await.unwrap();
    assert_eq!(claims.subject, device_id);
}

#[tokio::test]
async fn test_verify_rejects_garbage() {
    let fx = fixture();
    let err = fx
        .devauth
        .verify_token(&ctx(), "not-a-token")
        .await
        .unwrap_err();
    assert!(matches!(err, DevAuthError::TokenInvalid));
}

#[tokio::test]
async fn test_verify_rejects_non_device_token() {
    let fx = fixture();
    let claims = Claims {
        id: "some-id".to_string(),
        subject: "some-user".to_string(),
        issuer: "deviceauth".to_string(),
        expires_at: Utc::now().timestamp() + 3600,
        issued_at: Utc::now().timestamp(),
        device: false,
        ..Default::default()
    };
    let raw = jwt_service().sign(&claims).unwrap();

    let err = fx.devauth.verify_token(&ctx(), &raw).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenInvalid));
}

#[tokio::test]
async fn test_verify_rejects_tenant_claim_in_single_tenant_mode() {
    let fx = fixture();
    let claims = Claims {
        id: "some-id".to_string(),
        subject: "some-device".to_string(),
        issuer: "deviceauth".to_string(),
        expires_at: Utc::now().timestamp() + 3600,
        issued_at: Utc::now().timestamp(),
        tenant: Some("acme".to_string()),
        device: true,
        ..Default::default()
    };
    let raw = jwt_service().sign(&claims).unwrap();

    let err = fx.devauth.verify_token(&ctx(), &raw).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenInvalid));
}

#[tokio::test]
async fn test_verify_fails_after_reject() {
    let fx = fixture();
    let ctx = ctx();
    let req = auth_req("aa:bb:cc", "key-1");
    let (device_id, auth_id, raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    // populate the cache fast path first
    fx.devauth.verify_token(&ctx, &raw).await.unwrap();

    fx.devauth
        .reject_device_auth(&ctx, &device_id, &auth_id)
        .await
        .unwrap();

    // rejection purged the token everywhere, cache included
    let err = fx.devauth.verify_token(&ctx, &raw).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenNotFound));
}

#[tokio::test]
async fn test_verify_expired_token_is_deleted() {
    let fx = fixture();
    let ctx = ctx();
    let req = auth_req("aa:bb:cc", "key-1");
    let (device_id, auth_id, _raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    let expired = Claims {
        id: auth_id.clone(),
        subject: device_id,
        issuer: "deviceauth".to_string(),
        expires_at: Utc::now().timestamp() - 3600,
        issued_at: Utc::now().timestamp() - 7200,
        device: true,
        ..Default::default()
    };
    let raw_expired = jwt_service().sign(&expired).unwrap();

    let err = fx.devauth.verify_token(&ctx, &raw_expired).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenExpired));

    // the stored token is gone, a retry reports not-found
    let err = fx.devauth.verify_token(&ctx, &raw_expired).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenNotFound));
}

#[tokio::test]
async fn test_fallback_key_validates_rotated_tokens() {
    let fx = fixture_with_fallback("rotated-out-secret");
    let ctx = ctx();
    let req = auth_req("aa:bb:cc", "key-1");
    let (device_id, auth_id, _raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    // token signed under the old key, before the rotation
    let old = Claims {
        id: auth_id.clone(),
        subject: device_id.clone(),
        issuer: "deviceauth".to_string(),
        expires_at: Utc::now().timestamp() + 3600,
        issued_at: Utc::now().timestamp(),
        device: true,
        ..Default::default()
    };
    let raw_old = jwt_service_with("rotated-out-secret").sign(&old).unwrap();

    let claims = fx.devauth.verify_token(&ctx, &raw_old).await.unwrap();
    assert_eq!(claims.subject, device_id);

    // a key neither the primary nor the fallback holds stays invalid
    let raw_unknown = jwt_service_with("never-configured-secret").sign(&old).unwrap();
    let err = fx.devauth.verify_token(&ctx, &raw_unknown).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenInvalid));
}

#[tokio::test]
async fn test_expired_token_under_fallback_key_is_deleted() {
    let fx = fixture_with_fallback("rotated-out-secret");
    let ctx = ctx();
    let req = auth_req("aa:bb:cc", "key-1");
    let (device_id, auth_id, _raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    let expired = Claims {
        id: auth_id.clone(),
        subject: device_id,
        issuer: "deviceauth".to_string(),
        expires_at: Utc::now().timestamp() - 3600,
        issued_at: Utc::now().timestamp() - 7200,
        device: true,
        ..Default::default()
    };
    let raw_expired = jwt_service_with("rotated-out-secret").sign(&expired).unwrap();

    // expiry under the fallback key is still expiry, not invalidity,
    // and purges the stored token
    let err = fx.devauth.verify_token(&ctx, &raw_expired).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenExpired));

    let err = fx.devauth.verify_token(&ctx, &raw_expired).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenNotFound));
}

#[tokio::test]
async fn test_verify_fails_after_decommission() {
    let fx = fixture();
    let ctx = ctx();
    let req = auth_req("aa:bb:cc", "key-1");
    let (device_id, _, raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    fx.devauth.verify_token(&ctx, &raw).await.unwrap();
    fx.devauth.decommission_device(&ctx, &device_id).await.unwrap();

    let err = fx.devauth.verify_token(&ctx, &raw).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenNotFound));
}

#[tokio::test]
async fn test_revoke_token() {
    let fx = fixture();
    let ctx = ctx();
    let req = auth_req("aa:bb:cc", "key-1");
    let (_, auth_id, raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    fx.devauth.revoke_token(&ctx, &auth_id).await.unwrap();

    let err = fx.devauth.verify_token(&ctx, &raw).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenNotFound));
}

#[tokio::test]
async fn test_delete_tokens_flushes_tenant() {
    let fx = fixture();
    let ctx = ctx();
    let req = auth_req("aa:bb:cc", "key-1");
    let (_, _, raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    // cache the token, then flush the whole tenant
    fx.devauth.verify_token(&ctx, &raw).await.unwrap();
    fx.devauth.delete_tokens(&ctx, "", None).await.unwrap();

    let err = fx.devauth.verify_token(&ctx, &raw).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TokenNotFound));
}

#[tokio::test]
async fn test_same_day_verifications_write_check_in_once() {
    let fx = fixture();
    let ctx = ctx();
    let req = auth_req("aa:bb:cc", "key-1");
    let (device_id, _, raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    // issuance already recorded today's check-in
    let writes_after_issue = fx.store.device_update_count();

    for _ in 0..10 {
        fx.devauth.verify_token(&ctx, &raw).await.unwrap();
    }
    assert_eq!(fx.store.device_update_count(), writes_after_issue);

    // the first contact on the next day writes exactly once
    fx.clock.advance(chrono::Duration::days(1));
    fx.devauth.verify_token(&ctx, &raw).await.unwrap();
    fx.devauth.verify_token(&ctx, &raw).await.unwrap();
    assert_eq!(fx.store.device_update_count(), writes_after_issue + 1);

    let dev = fx.devauth.get_device(&ctx, &device_id).await.unwrap();
    assert_eq!(
        dev.check_in_time.map(|t| t.date_naive()),
        Some(fx.clock.now().date_naive())
    );
}

#[tokio::test]
async fn test_verify_throttled_by_tenant_quota() {
    let fx = fixture();
    let ctx = ctx().with_forwarded("GET", "/api/devices/v1/deployments/next");
    fx.devauth
        .set_tenant_limit(&ctx, "", Limit::new(LIMIT_MAX_DEVICE_COUNT, 1))
        .await
        .unwrap();

    let req = auth_req("aa:bb:cc", "key-1");
    let (_, _, raw) = accept_and_issue(&fx.devauth, &ctx, &req).await;

    // device limit 1 with the default weight means one request per window
    fx.devauth.verify_token(&ctx, &raw).await.unwrap();
    let err = fx.devauth.verify_token(&ctx, &raw).await.unwrap_err();
    assert!(matches!(err, DevAuthError::TooManyRequests));

    // a fresh window clears the quota
    fx.clock.advance(chrono::Duration::seconds(61));
    fx.devauth.verify_token(&ctx, &raw).await.unwrap();
}
