pub mod error;
pub mod provider;
pub mod providers;
pub mod types;
pub mod utils;

pub use error::{GatewayError, GatewayResult};
pub use provider::PaymentGateway;
pub use providers::EkqrGateway;
pub use types::{
    CreateOrderRequest, CreatedOrder, CustomerInfo, GatewayStatus, StatusCheck, StatusReport,
    UpiIntentLinks,
};
