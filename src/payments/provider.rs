use crate::payments::error::GatewayResult;
use crate::payments::types::{CreateOrderRequest, CreatedOrder, StatusCheck, StatusReport};
use async_trait::async_trait;

/// Black-box payment gateway. Implementations perform the network call only;
/// nothing here persists state.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, request: CreateOrderRequest) -> GatewayResult<CreatedOrder>;

    async fn check_status(&self, request: StatusCheck) -> GatewayResult<StatusReport>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{CustomerInfo, GatewayStatus, UpiIntentLinks};

    struct MockGateway;

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_order(&self, request: CreateOrderRequest) -> GatewayResult<CreatedOrder> {
            Ok(CreatedOrder {
                order_id: "ord_1".to_string(),
                client_txn_id: request.client_txn_id,
                payment_url: Some("https://pay.example.com/ord_1".to_string()),
                upi_intent: UpiIntentLinks::default(),
                raw: serde_json::json!({}),
            })
        }

        async fn check_status(&self, _request: StatusCheck) -> GatewayResult<StatusReport> {
            Ok(StatusReport {
                status: GatewayStatus::Completed,
                provider_status: "success".to_string(),
                provider_txn_id: Some("UTR1".to_string()),
                raw: serde_json::json!({}),
            })
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_gateway() {
        let gateway: Box<dyn PaymentGateway> = Box::new(MockGateway);
        let created = gateway
            .create_order(CreateOrderRequest {
                client_txn_id: "txn_1".to_string(),
                amount_minor: 50_000,
                customer: CustomerInfo {
                    name: "Test".to_string(),
                    email: "test@example.com".to_string(),
                    mobile: "9876543210".to_string(),
                },
                product_info: "Study hall booking".to_string(),
                booking_reference: "tmp-1".to_string(),
                slot: None,
            })
            .await
            .expect("order creation should succeed");
        assert_eq!(created.client_txn_id, "txn_1");

        let report = gateway
            .check_status(StatusCheck::new("txn_1", "17-06-2024").expect("valid date"))
            .await
            .expect("status check should succeed");
        assert_eq!(report.status, GatewayStatus::Completed);
    }
}
