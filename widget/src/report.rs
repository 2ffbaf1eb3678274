//! Grant report client
//!
//! The standalone report page fetches one report by id. Every failure mode
//! (no id, transport error, non-2xx, missing `data`) collapses into
//! [`ReportOutcome::NotFound`] so the page can show a single empty state.

use std::time::Duration;

use chrono::NaiveDate;
use shared_types::{parse_timestamp, DataEnvelope, Report, HEADER_USER_EMAIL};

use crate::error::ApiError;

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Found(Report),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct ReportClient {
    http: reqwest::Client,
    report_url: String,
}

impl ReportClient {
    pub fn new(report_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self::with_client(http, report_url))
    }

    pub fn with_client(http: reqwest::Client, report_url: impl Into<String>) -> Self {
        Self {
            http,
            report_url: report_url.into(),
        }
    }

    pub async fn fetch_report(&self, report_id: Option<&str>, email: Option<&str>) -> ReportOutcome {
        let Some(report_id) = report_id.filter(|id| !id.trim().is_empty()) else {
            return ReportOutcome::NotFound;
        };
        match self.try_fetch(report_id, email).await {
            Ok(Some(report)) => ReportOutcome::Found(report),
            Ok(None) => {
                tracing::info!(report_id, "Report response carried no data");
                ReportOutcome::NotFound
            }
            Err(e) => {
                tracing::warn!(report_id, error = %e, "Report fetch failed");
                ReportOutcome::NotFound
            }
        }
    }

    async fn try_fetch(
        &self,
        report_id: &str,
        email: Option<&str>,
    ) -> Result<Option<Report>, ApiError> {
        let mut req = self
            .http
            .get(&self.report_url)
            .query(&[("report_id", report_id)]);
        if let Some(email) = email.filter(|e| !e.is_empty()) {
            req = req.header(HEADER_USER_EMAIL, email);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Server {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let bytes = resp.bytes().await?;
        let envelope: DataEnvelope<Report> =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Format an amount as USD (`$1,234.50`). Values that are not numbers are
/// returned as written; `null` becomes an empty string.
pub fn format_amount(value: &serde_json::Value) -> String {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n.is_finite() => format_usd(n),
        _ => match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

fn format_usd(amount: f64) -> String {
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}${grouped}.{:02}", cents % 100)
}

/// `Month DD, YYYY`. Unparseable input is returned unchanged.
pub fn format_report_date(raw: &str) -> String {
    let date = parse_timestamp(raw)
        .map(|at| at.date_naive())
        .or_else(|| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok());
    match date {
        Some(date) => date.format("%B %d, %Y").to_string(),
        None => raw.to_string(),
    }
}
