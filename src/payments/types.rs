use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::utils::normalize_txn_date;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::OnceLock;

fn mobile_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[6-9][0-9]{9}$").expect("static regex"))
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub mobile: String,
}

impl CustomerInfo {
    /// Gateway-side rules: non-empty name, plausible e-mail, 10 digit Indian mobile.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::invalid_field(
                "customer.name",
                "customer name is required",
            ));
        }
        if !email_pattern().is_match(self.email.trim()) {
            return Err(GatewayError::invalid_field(
                "customer.email",
                format!("invalid e-mail address: {}", self.email),
            ));
        }
        if !mobile_pattern().is_match(&normalize_mobile(&self.mobile)) {
            return Err(GatewayError::invalid_field(
                "customer.mobile",
                "mobile number must have 10 digits",
            ));
        }
        Ok(())
    }
}

/// Strips `+91`, spaces and dashes so `+91 98765-43210` becomes `9876543210`.
pub fn normalize_mobile(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 12 && digits.starts_with("91") {
        digits[2..].to_string()
    } else {
        digits
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub client_txn_id: String,
    /// Minor units (paise).
    pub amount_minor: i64,
    pub customer: CustomerInfo,
    pub product_info: String,
    pub booking_reference: String,
    pub slot: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpiIntentLinks {
    pub bhim_link: Option<String>,
    pub phonepe_link: Option<String>,
    pub paytm_link: Option<String>,
    pub gpay_link: Option<String>,
}

impl UpiIntentLinks {
    /// The generic `upi://pay` link, which every UPI app can open or scan.
    pub fn primary(&self) -> Option<&str> {
        self.bhim_link
            .as_deref()
            .or(self.gpay_link.as_deref())
            .or(self.phonepe_link.as_deref())
            .or(self.paytm_link.as_deref())
    }

    pub fn labelled(&self) -> Vec<(&'static str, String)> {
        let mut links = Vec::new();
        if let Some(link) = &self.gpay_link {
            links.push(("Google Pay", link.clone()));
        }
        if let Some(link) = &self.phonepe_link {
            links.push(("PhonePe", link.clone()));
        }
        if let Some(link) = &self.paytm_link {
            links.push(("Paytm", link.clone()));
        }
        if let Some(link) = &self.bhim_link {
            links.push(("BHIM / any UPI app", link.clone()));
        }
        links
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedOrder {
    pub order_id: String,
    pub client_txn_id: String,
    pub payment_url: Option<String>,
    pub upi_intent: UpiIntentLinks,
    pub raw: JsonValue,
}

/// Status query. Construction normalizes the date, so a value of this type
/// always carries `DD-MM-YYYY`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCheck {
    client_txn_id: String,
    txn_date: String,
}

impl StatusCheck {
    pub fn new(client_txn_id: impl Into<String>, txn_date: &str) -> GatewayResult<Self> {
        let client_txn_id = client_txn_id.into();
        if client_txn_id.trim().is_empty() {
            return Err(GatewayError::invalid_field(
                "client_txn_id",
                "client_txn_id is required",
            ));
        }
        Ok(Self {
            client_txn_id,
            txn_date: normalize_txn_date(txn_date)?,
        })
    }

    pub fn client_txn_id(&self) -> &str {
        &self.client_txn_id
    }

    pub fn txn_date(&self) -> &str {
        &self.txn_date
    }
}

/// Canonical reading of whatever status string the provider returns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Completed,
    Failed,
    Pending,
}

impl GatewayStatus {
    pub fn from_provider(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "success" | "completed" => GatewayStatus::Completed,
            "failure" | "failed" | "cancelled" => GatewayStatus::Failed,
            _ => GatewayStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, GatewayStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: GatewayStatus,
    pub provider_status: String,
    pub provider_txn_id: Option<String>,
    pub raw: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer() -> CustomerInfo {
        CustomerInfo {
            name: "Asha Rao".to_string(),
            email: "asha@example.com".to_string(),
            mobile: "+91 98765-43210".to_string(),
        }
    }

    #[test]
    fn provider_status_strings_map_to_canonical_status() {
        assert_eq!(GatewayStatus::from_provider("success"), GatewayStatus::Completed);
        assert_eq!(GatewayStatus::from_provider("COMPLETED"), GatewayStatus::Completed);
        assert_eq!(GatewayStatus::from_provider("failure"), GatewayStatus::Failed);
        assert_eq!(GatewayStatus::from_provider("cancelled"), GatewayStatus::Failed);
        assert_eq!(GatewayStatus::from_provider("scanning"), GatewayStatus::Pending);
        assert_eq!(GatewayStatus::from_provider("created"), GatewayStatus::Pending);
        assert_eq!(GatewayStatus::from_provider(""), GatewayStatus::Pending);
    }

    #[test]
    fn customer_validation_accepts_formatted_mobile() {
        assert!(customer().validate().is_ok());
        assert_eq!(normalize_mobile("+91 98765-43210"), "9876543210");
    }

    #[test]
    fn customer_validation_rejects_bad_fields() {
        let mut bad_email = customer();
        bad_email.email = "asha-at-example".to_string();
        assert!(matches!(
            bad_email.validate(),
            Err(GatewayError::Rejected { field: Some(ref f), .. }) if f == "customer.email"
        ));

        let mut bad_mobile = customer();
        bad_mobile.mobile = "12345".to_string();
        assert!(bad_mobile.validate().is_err());
    }

    #[test]
    fn status_check_normalizes_date() {
        let check = StatusCheck::new("txn_1", "17/06/2024").expect("valid date");
        assert_eq!(check.txn_date(), "17-06-2024");
        let check = StatusCheck::new("txn_1", "2024-06-17").expect("valid date");
        assert_eq!(check.txn_date(), "17-06-2024");
    }

    #[test]
    fn primary_link_prefers_generic_upi_intent() {
        let links = UpiIntentLinks {
            bhim_link: Some("upi://pay?pa=x".to_string()),
            gpay_link: Some("tez://upi/pay?pa=x".to_string()),
            ..Default::default()
        };
        assert_eq!(links.primary(), Some("upi://pay?pa=x"));
        assert_eq!(links.labelled().len(), 2);
    }
}
