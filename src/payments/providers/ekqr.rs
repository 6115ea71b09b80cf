use crate::config::GatewayConfig;
use crate::middleware::logging::log_external_call;
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    normalize_mobile, CreateOrderRequest, CreatedOrder, GatewayStatus, StatusCheck, StatusReport,
    UpiIntentLinks,
};
use crate::payments::utils::{format_amount_minor, normalize_txn_date, GatewayHttpClient};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, info};

/// UPI QR gateway speaking the `create_order` / `check_order_status` API.
pub struct EkqrGateway {
    config: GatewayConfig,
    http: GatewayHttpClient,
}

impl EkqrGateway {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let http =
            GatewayHttpClient::new(Duration::from_secs(config.timeout_secs), config.max_retries)?;
        Ok(Self { config, http })
    }

    pub fn with_http_client(config: GatewayConfig, http: GatewayHttpClient) -> Self {
        Self { config, http }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Splits the `{status, msg, data}` envelope; `status: false` is a rejection.
    fn unwrap_envelope<T: DeserializeOwned>(raw: &JsonValue) -> GatewayResult<T> {
        let envelope: EkqrEnvelope = serde_json::from_value(raw.clone()).map_err(|e| {
            GatewayError::unavailable(format!("unexpected gateway envelope: {}", e))
        })?;

        if !envelope.status {
            return Err(GatewayError::Rejected {
                message: envelope.msg.unwrap_or_else(|| "request rejected".to_string()),
                field: None,
                provider_code: None,
            });
        }

        let data = envelope
            .data
            .ok_or_else(|| GatewayError::unavailable("gateway response is missing data"))?;
        serde_json::from_value(data)
            .map_err(|e| GatewayError::unavailable(format!("unexpected gateway data: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for EkqrGateway {
    async fn create_order(&self, request: CreateOrderRequest) -> GatewayResult<CreatedOrder> {
        let amount = format_amount_minor(request.amount_minor)?;
        request.customer.validate()?;

        let payload = serde_json::json!({
            "key": self.config.api_key,
            "client_txn_id": request.client_txn_id,
            "amount": amount,
            "p_info": request.product_info,
            "customer_name": request.customer.name.trim(),
            "customer_email": request.customer.email.trim(),
            "customer_mobile": normalize_mobile(&request.customer.mobile),
            "redirect_url": self.config.redirect_url,
            "udf1": request.booking_reference,
            "udf2": request.slot.clone().unwrap_or_default(),
            "udf3": "",
        });

        let raw: JsonValue = log_external_call(
            self.name(),
            "create_order",
            self.http.post_json(&self.endpoint("/create_order"), &payload),
        )
        .await?;
        let data: EkqrOrderData = Self::unwrap_envelope(&raw)?;
        let order_id = opaque_id(&data.order_id);

        info!(
            client_txn_id = %request.client_txn_id,
            order_id = %order_id,
            "upi order created"
        );

        Ok(CreatedOrder {
            order_id,
            client_txn_id: request.client_txn_id,
            payment_url: data.payment_url,
            upi_intent: data.upi_intent.unwrap_or_default(),
            raw,
        })
    }

    async fn check_status(&self, request: StatusCheck) -> GatewayResult<StatusReport> {
        let txn_date = normalize_txn_date(request.txn_date())?;
        let payload = serde_json::json!({
            "key": self.config.api_key,
            "client_txn_id": request.client_txn_id(),
            "txn_date": txn_date,
        });

        let raw: JsonValue = self
            .http
            .post_json(&self.endpoint("/check_order_status"), &payload)
            .await?;
        let data: EkqrStatusData = Self::unwrap_envelope(&raw)?;
        let status = GatewayStatus::from_provider(&data.status);

        debug!(
            client_txn_id = %request.client_txn_id(),
            provider_status = %data.status,
            "upi order status checked"
        );

        Ok(StatusReport {
            status,
            provider_status: data.status,
            provider_txn_id: data.upi_txn_id.filter(|v| !v.trim().is_empty()),
            raw,
        })
    }

    fn name(&self) -> &'static str {
        "ekqr"
    }
}

/// The gateway sends `order_id` as a number or a string depending on account type.
fn opaque_id(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct EkqrEnvelope {
    status: bool,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct EkqrOrderData {
    order_id: JsonValue,
    #[serde(default)]
    payment_url: Option<String>,
    #[serde(default)]
    upi_intent: Option<UpiIntentLinks>,
}

#[derive(Debug, Deserialize)]
struct EkqrStatusData {
    status: String,
    #[serde(default)]
    upi_txn_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_envelope_carries_provider_message() {
        let raw = serde_json::json!({"status": false, "msg": "Invalid txn_date format"});
        let err = EkqrGateway::unwrap_envelope::<EkqrStatusData>(&raw).expect_err("rejected");
        assert_eq!(err, GatewayError::rejected("Invalid txn_date format"));
    }

    #[test]
    fn status_envelope_parses_provider_txn_id() {
        let raw = serde_json::json!({
            "status": true,
            "msg": "Transaction found",
            "data": {"id": 991, "status": "success", "upi_txn_id": "TXN1", "amount": 500}
        });
        let data: EkqrStatusData = EkqrGateway::unwrap_envelope(&raw).expect("valid envelope");
        assert_eq!(data.status, "success");
        assert_eq!(data.upi_txn_id.as_deref(), Some("TXN1"));
    }

    #[test]
    fn order_id_may_be_numeric() {
        let raw = serde_json::json!({
            "status": true,
            "data": {"order_id": 12345, "payment_url": "https://pay.example.com/12345"}
        });
        let data: EkqrOrderData = EkqrGateway::unwrap_envelope(&raw).expect("valid envelope");
        assert_eq!(opaque_id(&data.order_id), "12345");
        assert!(data.upi_intent.is_none());
        assert_eq!(opaque_id(&serde_json::json!("ord_9")), "ord_9");
    }
}
