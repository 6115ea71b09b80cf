use crate::payments::error::{GatewayError, GatewayResult};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use regex::Regex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Date format the gateway expects for `txn_date`.
pub const GATEWAY_DATE_FORMAT: &str = "%d-%m-%Y";

/// The gateway keys transactions by Indian Standard Time calendar date.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

#[derive(Clone)]
pub struct GatewayHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

impl GatewayHttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::unavailable(format!("failed to initialize HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            max_retries,
            backoff_base: Duration::from_secs(1),
        })
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * (1u32 << attempt.min(6))
    }

    /// POSTs `body` as JSON. Network errors, 429 and 5xx are retried with
    /// exponential backoff and end as `Unavailable`; any other 4xx is
    /// `Rejected` immediately.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &JsonValue,
    ) -> GatewayResult<T> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let response = self
                .client
                .post(url)
                .timeout(self.timeout)
                .json(body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            GatewayError::Unavailable {
                                message: format!("invalid gateway JSON response: {}", e),
                                status_code: Some(status.as_u16()),
                            }
                        });
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = Some(GatewayError::Unavailable {
                            message: format!("HTTP {}: {}", status, truncate(&text, 200)),
                            status_code: Some(status.as_u16()),
                        });
                        if attempt < self.max_retries {
                            warn!(
                                status = %status,
                                attempt = attempt + 1,
                                "gateway returned retryable status, retrying"
                            );
                            tokio::time::sleep(self.backoff(attempt)).await;
                            continue;
                        }
                        break;
                    }

                    return Err(GatewayError::Rejected {
                        message: format!("HTTP {}: {}", status, truncate(&text, 200)),
                        field: None,
                        provider_code: Some(status.as_u16().to_string()),
                    });
                }
                Err(e) => {
                    last_error = Some(GatewayError::unavailable(format!(
                        "gateway request failed: {}",
                        e
                    )));
                    if attempt < self.max_retries {
                        warn!(attempt = attempt + 1, error = %e, "gateway request failed, retrying");
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::unavailable("gateway request failed")))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn ist() -> FixedOffset {
    FixedOffset::east_opt(IST_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Gateway calendar date (IST) of an instant, as `DD-MM-YYYY`.
pub fn gateway_txn_date(at: DateTime<Utc>) -> String {
    at.with_timezone(&ist()).format(GATEWAY_DATE_FORMAT).to_string()
}

fn date_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"^\d{2}-\d{2}-\d{4}$", "%d-%m-%Y"),
            (r"^\d{2}/\d{2}/\d{4}$", "%d/%m/%Y"),
            (r"^\d{4}-\d{2}-\d{2}$", "%Y-%m-%d"),
        ]
        .into_iter()
        .map(|(pattern, format)| (Regex::new(pattern).expect("static regex"), format))
        .collect()
    })
}

/// Accepts `DD-MM-YYYY`, `DD/MM/YYYY`, `YYYY-MM-DD` or an RFC 3339 timestamp
/// and returns `DD-MM-YYYY`. Anything else is rejected before it reaches
/// the gateway, which would otherwise answer with a misleading error.
pub fn normalize_txn_date(raw: &str) -> GatewayResult<String> {
    let value = raw.trim();
    for (pattern, format) in date_patterns() {
        if pattern.is_match(value) {
            return NaiveDate::parse_from_str(value, format)
                .map(|date| date.format(GATEWAY_DATE_FORMAT).to_string())
                .map_err(|e| {
                    GatewayError::invalid_field("txn_date", format!("invalid date '{}': {}", raw, e))
                });
        }
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(gateway_txn_date(ts.with_timezone(&Utc)));
    }

    Err(GatewayError::invalid_field(
        "txn_date",
        format!("unrecognised date '{}', expected DD-MM-YYYY", raw),
    ))
}

/// Minor units to the gateway's rupee string: `50000` becomes `"500.00"`.
pub fn format_amount_minor(amount_minor: i64) -> GatewayResult<String> {
    if amount_minor <= 0 {
        return Err(GatewayError::invalid_field(
            "amount",
            "amount must be greater than zero",
        ));
    }
    Ok(format!("{}.{:02}", amount_minor / 100, amount_minor % 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn all_supported_date_shapes_normalize_to_gateway_format() {
        assert_eq!(normalize_txn_date("17-06-2024").as_deref(), Ok("17-06-2024"));
        assert_eq!(normalize_txn_date("17/06/2024").as_deref(), Ok("17-06-2024"));
        assert_eq!(normalize_txn_date("2024-06-17").as_deref(), Ok("17-06-2024"));
        assert_eq!(
            normalize_txn_date("2024-06-17T09:15:00+05:30").as_deref(),
            Ok("17-06-2024")
        );
    }

    #[test]
    fn utc_timestamp_uses_ist_calendar_day() {
        // 20:00 UTC is 01:30 the next day in IST.
        assert_eq!(
            normalize_txn_date("2024-06-16T20:00:00Z").as_deref(),
            Ok("17-06-2024")
        );
        let at = Utc.with_ymd_and_hms(2024, 6, 16, 20, 0, 0).single().expect("valid");
        assert_eq!(gateway_txn_date(at), "17-06-2024");
    }

    #[test]
    fn malformed_dates_are_rejected_not_passed_through() {
        for raw in ["2024/06/17", "17-6-2024", "31-02-2024", "yesterday", ""] {
            let err = normalize_txn_date(raw).expect_err("should reject");
            assert!(!err.is_retryable());
            assert!(matches!(err, GatewayError::Rejected { field: Some(ref f), .. } if f == "txn_date"));
        }
    }

    #[test]
    fn amount_formatting_uses_two_decimals() {
        assert_eq!(format_amount_minor(50_000).as_deref(), Ok("500.00"));
        assert_eq!(format_amount_minor(105).as_deref(), Ok("1.05"));
        assert!(format_amount_minor(0).is_err());
        assert!(format_amount_minor(-10).is_err());
    }
}
