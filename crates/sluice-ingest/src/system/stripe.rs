//! Stripe source.
//!
//! Stripe pushes events as `{"type": "<object>.<action>", "data": {"object": {..}}}`.
//! The object prefix selects the receive routes, the action suffix selects
//! the operation, and `data.object` is mapped and ingested once per route.

use std::process::Stdio;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use sluice_core::metrics::increment_labeled;
use sluice_core::{Object, Operation, ReceiveRoute, Secret, SystemInfo};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CONNECT_TIMEOUT, SourceAdapter, WebhookRequest};
use crate::error::{Error, Result};
use crate::ingest::Ingestor;
use crate::mapper;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "https://api.stripe.com";
const SIGNATURE_HEADER: &str = "stripe-signature";

/// Maximum age of a signed delivery, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: Value,
}

/// Split `customer.subscription.updated` into (`customer.subscription`, `updated`).
pub fn split_event_type(event_type: &str) -> Option<(&str, &str)> {
    event_type
        .rsplit_once('.')
        .filter(|(object, action)| !object.is_empty() && !action.is_empty())
}

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>..]`).
///
/// The signed payload is `"<t>.<body>"`. Any matching `v1` entry is
/// accepted as long as `t` is within `tolerance` seconds of `now`.
pub fn verify_signature(header: &str, body: &[u8], secret: &[u8], now: i64, tolerance: i64) -> bool {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => timestamp = Some(t),
            Some(("v1", sig)) => {
                if let Ok(bytes) = hex::decode(sig) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let Some(t) = timestamp else {
        return false;
    };
    let Ok(ts) = t.parse::<i64>() else {
        return false;
    };
    if (now - ts).abs() > tolerance {
        return false;
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(t.as_bytes());
    mac.update(b".");
    mac.update(body);

    candidates
        .iter()
        .any(|sig| mac.clone().verify_slice(sig).is_ok())
}

pub struct StripeSource {
    info: SystemInfo,
    api_key: Secret,
    api_base: String,
    client: reqwest::Client,
    listen_port: u16,
    listener: Mutex<Option<Child>>,
}

impl StripeSource {
    pub fn new(info: SystemInfo, listen_port: u16) -> Result<Self> {
        let api_key = info
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config(format!("stripe system '{}' needs 'api_key'", info.name)))?;

        let client = reqwest::Client::builder().timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            info,
            api_key,
            api_base: DEFAULT_API_BASE.to_string(),
            client,
            listen_port,
            listener: Mutex::new(None),
        })
    }

    /// Point API calls somewhere other than api.stripe.com.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn forward_url(&self) -> String {
        format!("http://localhost:{}/{}", self.listen_port, self.info.name)
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/v1/coupons?limit=1", self.api_base))
            .bearer_auth(self.api_key.expose())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::AdapterUnavailable {
                system: self.info.name.clone(),
                reason: format!("stripe API returned {status}"),
            });
        }
        Ok(())
    }

    async fn start_listener(&self) -> Result<()> {
        let forward_to = self.forward_url();
        let child = Command::new("stripe")
            .args(["listen", "--forward-to", &forward_to])
            .env("STRIPE_API_KEY", self.api_key.expose())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::AdapterUnavailable {
                system: self.info.name.clone(),
                reason: format!("cannot start stripe CLI: {e}"),
            })?;

        info!(system = %self.info.name, forward_to = %forward_to, "stripe CLI listener started");
        *self.listener.lock().await = Some(child);
        Ok(())
    }

    fn check_signature(&self, request: &WebhookRequest) -> Result<()> {
        let Some(secret) = self.info.endpoint_secret.as_ref().filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        let header = request
            .headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Webhook("missing Stripe-Signature header".to_string()))?;

        let now = chrono::Utc::now().timestamp();
        if verify_signature(header, &request.body, secret.expose().as_bytes(), now, SIGNATURE_TOLERANCE_SECS) {
            Ok(())
        } else {
            Err(Error::Webhook("Stripe-Signature mismatch".to_string()))
        }
    }
}

#[async_trait]
impl SourceAdapter for StripeSource {
    fn info(&self) -> &SystemInfo {
        &self.info
    }

    async fn connect(&self) -> Result<()> {
        self.ping().await?;
        debug!(system = %self.info.name, "stripe API ping succeeded");
        if self.info.use_cli_listener {
            self.start_listener().await?;
        }
        Ok(())
    }

    async fn handle_webhook(&self, ingestor: &Ingestor, request: WebhookRequest) -> Result<usize> {
        increment_labeled("ingest_webhooks_total", "system", &self.info.name, 1);

        if let Err(e) = self.check_signature(&request) {
            warn!(system = %self.info.name, error = %e, "dropping webhook");
            return Err(e);
        }

        let event: StripeEvent = serde_json::from_slice(&request.body)?;
        let Some((source_object, action)) = split_event_type(&event.event_type) else {
            warn!(system = %self.info.name, event_type = %event.event_type, "malformed event type, dropping");
            return Ok(0);
        };
        let Some(operation) = Operation::from_action(action) else {
            debug!(system = %self.info.name, event_type = %event.event_type, "ignoring event action");
            return Ok(0);
        };
        let Value::Object(raw) = event.data.object else {
            return Err(Error::Webhook(format!(
                "event '{}' has no data.object",
                event.event_type
            )));
        };

        // Routes are independent: one failing schema does not hold back the
        // others. The delivery only fails if nothing was enqueued.
        let mut enqueued = 0;
        let mut first_error = None;
        for (model, object) in self.map_properties(source_object, raw) {
            match ingestor.ingest(&model, operation, object).await {
                Ok(()) => enqueued += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if enqueued == 0 => Err(e),
            _ => Ok(enqueued),
        }
    }

    fn map_properties(&self, source_object: &str, raw: Object) -> Vec<(String, Object)> {
        match self.info.receive.get(source_object) {
            Some(routes) if !routes.is_empty() => routes
                .iter()
                .map(|route| {
                    let model = route.model.clone().unwrap_or_else(|| source_object.to_string());
                    (model, mapper::map_properties(raw.clone(), route))
                })
                .collect(),
            _ => vec![(
                source_object.to_string(),
                mapper::map_properties(raw, &ReceiveRoute::default()),
            )],
        }
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.listener.lock().await.take() {
            match child.kill().await {
                Ok(()) => debug!(system = %self.info.name, "stripe CLI listener stopped"),
                Err(e) => warn!(system = %self.info.name, error = %e, "failed to stop stripe CLI listener"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::{product_ingestor, product_schema};
    use axum::body::Bytes;
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use axum::routing::get;
    use serde_json::json;
    use sluice_core::SystemType;
    use tempfile::TempDir;

    fn info() -> SystemInfo {
        let mut info = SystemInfo::new("stripe", SystemType::Stripe);
        info.api_key = Some(Secret::new("sk_test_123"));
        info
    }

    fn sign(secret: &str, t: i64, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{t}.").as_bytes());
        mac.update(body);
        format!("t={t},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn delivery(body: Value) -> WebhookRequest {
        WebhookRequest {
            headers: HeaderMap::new(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    #[test]
    fn test_split_event_type_on_last_dot() {
        assert_eq!(split_event_type("product.created"), Some(("product", "created")));
        assert_eq!(
            split_event_type("customer.subscription.deleted"),
            Some(("customer.subscription", "deleted"))
        );
        assert_eq!(split_event_type("ping"), None);
        assert_eq!(split_event_type(".created"), None);
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_x", 1_700_000_000, body);

        assert!(verify_signature(&header, body, b"whsec_x", 1_700_000_010, 300));
        assert!(!verify_signature(&header, body, b"whsec_y", 1_700_000_010, 300));
        assert!(!verify_signature(&header, b"tampered", b"whsec_x", 1_700_000_010, 300));
        assert!(!verify_signature(&header, body, b"whsec_x", 1_700_001_000, 300));
        assert!(!verify_signature("v1=abcd", body, b"whsec_x", 1_700_000_000, 300));
    }

    #[test]
    fn test_verify_signature_accepts_any_v1() {
        let body = b"{}";
        let good = sign("whsec_x", 100, body);
        let good_sig = good.split_once(",v1=").unwrap().1;
        let header = format!("t=100,v1={},v1={good_sig}", "00".repeat(32));
        assert!(verify_signature(&header, body, b"whsec_x", 100, 300));
    }

    #[test]
    fn test_new_requires_api_key() {
        let info = SystemInfo::new("stripe", SystemType::Stripe);
        assert!(matches!(StripeSource::new(info, 4000), Err(Error::Config(_))));
    }

    #[test]
    fn test_forward_url() {
        let source = StripeSource::new(info(), 4000).unwrap();
        assert_eq!(source.forward_url(), "http://localhost:4000/stripe");
    }

    #[test]
    fn test_map_properties_uses_route() {
        let mut info = info();
        info.receive.insert(
            "price".to_string(),
            vec![ReceiveRoute {
                model: Some("product_price".to_string()),
                properties: [("unit_amount".to_string(), "amount.cents".to_string())].into(),
                hardcode: [("source".to_string(), json!("stripe"))].into(),
            }],
        );
        let source = StripeSource::new(info, 4000).unwrap();

        let raw = json!({"id": "price_1", "unit_amount": 500, "nickname": null});
        let mapped = source.map_properties("price", raw.as_object().unwrap().clone());
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].0, "product_price");
        assert_eq!(
            Value::Object(mapped[0].1.clone()),
            json!({"id": "price_1", "amount": {"cents": 500}, "source": "stripe"})
        );

        let mapped = source.map_properties("coupon", json!({"id": "c"}).as_object().unwrap().clone());
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].0, "coupon");
        assert_eq!(mapped[0].1["id"], "c");
    }

    #[tokio::test]
    async fn test_webhook_enqueues_data_object() {
        let tmp = TempDir::new().unwrap();
        let ingestor = product_ingestor(tmp.path());
        let source = StripeSource::new(info(), 4000).unwrap();

        let count = source
            .handle_webhook(
                &ingestor,
                delivery(json!({
                    "type": "product.created",
                    "data": {"object": {"id": "prod_1", "name": "Widget", "description": null}}
                })),
            )
            .await
            .unwrap();
        assert_eq!(count, 1);

        let env = ingestor.queues().get("product").unwrap().peek().unwrap().unwrap();
        assert_eq!(env.operation, Operation::Upsert);
        assert_eq!(env.field("name"), Some(&json!("Widget")));
        assert_eq!(env.field("description"), None);
    }

    /// `product` and `catalog_item` queues, both fed by Stripe `product`.
    fn catalog_ingestor(dir: &std::path::Path) -> Ingestor {
        let mut schemas = crate::SchemaRegistry::default();
        schemas
            .insert(crate::Schema::compile(std::path::Path::new("product.json"), &product_schema()).unwrap())
            .unwrap();
        let catalog = json!({
            "title": "catalog_item",
            "type": "object",
            "required": ["sku", "source"],
            "properties": {"sku": {"type": "string"}, "source": {"const": "stripe"}}
        });
        schemas
            .insert(crate::Schema::compile(std::path::Path::new("catalog_item.json"), &catalog).unwrap())
            .unwrap();
        let queues = schemas.open_queues(dir, crate::QueueOptions::default()).unwrap();
        Ingestor::new(schemas, queues)
    }

    fn catalog_info() -> SystemInfo {
        let mut info = info();
        info.receive.insert(
            "product".to_string(),
            vec![
                ReceiveRoute::default(),
                ReceiveRoute {
                    model: Some("catalog_item".to_string()),
                    properties: [("metadata.sku".to_string(), "sku".to_string())].into(),
                    hardcode: [("source".to_string(), json!("stripe"))].into(),
                },
            ],
        );
        info
    }

    #[tokio::test]
    async fn test_one_event_feeds_two_schemas() {
        let tmp = TempDir::new().unwrap();
        let ingestor = catalog_ingestor(tmp.path());
        let source = StripeSource::new(catalog_info(), 4000).unwrap();

        let count = source
            .handle_webhook(
                &ingestor,
                delivery(json!({
                    "type": "product.updated",
                    "data": {"object": {"id": "prod_1", "name": "Widget", "metadata": {"sku": "W-1"}}}
                })),
            )
            .await
            .unwrap();
        assert_eq!(count, 2);

        let product = ingestor.queues().get("product").unwrap().peek().unwrap().unwrap();
        assert_eq!(product.field("name"), Some(&json!("Widget")));
        let item = ingestor.queues().get("catalog_item").unwrap().peek().unwrap().unwrap();
        assert_eq!(item.operation, Operation::Upsert);
        assert_eq!(item.field("sku"), Some(&json!("W-1")));
        assert_eq!(item.field("source"), Some(&json!("stripe")));
    }

    #[tokio::test]
    async fn test_failing_route_does_not_block_the_others() {
        let tmp = TempDir::new().unwrap();
        let ingestor = catalog_ingestor(tmp.path());
        let source = StripeSource::new(catalog_info(), 4000).unwrap();

        // No metadata.sku: valid for product, invalid for catalog_item.
        let count = source
            .handle_webhook(
                &ingestor,
                delivery(json!({
                    "type": "product.created",
                    "data": {"object": {"id": "prod_2", "name": "Gadget"}}
                })),
            )
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(ingestor.queues().get("product").unwrap().len(), 1);
        assert!(ingestor.queues().get("catalog_item").unwrap().is_empty());

        let err = source
            .handle_webhook(
                &ingestor,
                delivery(json!({"type": "product.created", "data": {"object": {"id": "prod_3"}}})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_webhook_delete_and_ignored_actions() {
        let tmp = TempDir::new().unwrap();
        let ingestor = product_ingestor(tmp.path());
        let source = StripeSource::new(info(), 4000).unwrap();

        let ignored = source
            .handle_webhook(
                &ingestor,
                delivery(json!({"type": "product.archived", "data": {"object": {"id": "p"}}})),
            )
            .await
            .unwrap();
        assert_eq!(ignored, 0);

        source
            .handle_webhook(
                &ingestor,
                delivery(json!({"type": "product.deleted", "data": {"object": {"id": "p", "name": "W"}}})),
            )
            .await
            .unwrap();
        let env = ingestor.queues().get("product").unwrap().peek().unwrap().unwrap();
        assert_eq!(env.operation, Operation::Delete);
    }

    #[tokio::test]
    async fn test_webhook_invalid_object_not_enqueued() {
        let tmp = TempDir::new().unwrap();
        let ingestor = product_ingestor(tmp.path());
        let source = StripeSource::new(info(), 4000).unwrap();

        let err = source
            .handle_webhook(
                &ingestor,
                delivery(json!({"type": "product.updated", "data": {"object": {"id": "p"}}})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(ingestor.queues().get("product").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_signature_enforced_when_configured() {
        let tmp = TempDir::new().unwrap();
        let ingestor = product_ingestor(tmp.path());
        let mut info = info();
        info.endpoint_secret = Some(Secret::new("whsec_test"));
        let source = StripeSource::new(info, 4000).unwrap();

        let body = json!({"type": "product.created", "data": {"object": {"id": "p", "name": "W"}}});
        let err = source.handle_webhook(&ingestor, delivery(body.clone())).await.unwrap_err();
        assert!(matches!(err, Error::Webhook(_)));

        let mut request = delivery(body);
        let header = sign("whsec_test", chrono::Utc::now().timestamp(), &request.body);
        request
            .headers
            .insert(SIGNATURE_HEADER, HeaderValue::from_str(&header).unwrap());
        assert_eq!(source.handle_webhook(&ingestor, request).await.unwrap(), 1);
    }

    async fn serve_coupons(status: StatusCode) -> String {
        let app = axum::Router::new().route(
            "/v1/coupons",
            get(move |headers: HeaderMap| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer sk_test_123");
                if authorized { status } else { StatusCode::FORBIDDEN }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_ping_against_api() {
        let ok = serve_coupons(StatusCode::OK).await;
        let source = StripeSource::new(info(), 4000).unwrap().with_api_base(ok);
        source.connect().await.unwrap();

        let denied = serve_coupons(StatusCode::UNAUTHORIZED).await;
        let source = StripeSource::new(info(), 4000).unwrap().with_api_base(denied);
        let err = source.connect().await.unwrap_err();
        assert!(matches!(err, Error::AdapterUnavailable { .. }));
    }
}
