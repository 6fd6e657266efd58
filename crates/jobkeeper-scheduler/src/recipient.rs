use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Where and how a job's payload is delivered. `classType` is the wire discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "classType")]
pub enum Recipient {
    #[serde(rename = "HttpRecipient")]
    Http(HttpRecipient),
    #[serde(rename = "SinkRecipient")]
    Sink(SinkRecipient),
}

/// Plain HTTP callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRecipient {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// CloudEvents sink, delivered in binary content mode (`ce-*` headers, raw body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkRecipient {
    pub sink_url: String,
    #[serde(default = "default_spec_version")]
    pub ce_specversion: String,
    pub ce_type: String,
    pub ce_source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ce_extensions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_spec_version() -> String {
    "1.0".to_string()
}

impl Recipient {
    pub fn http(url: impl Into<String>) -> Self {
        Recipient::Http(HttpRecipient {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            payload: None,
        })
    }

    /// Target URL, for logging.
    pub fn url(&self) -> &str {
        match self {
            Recipient::Http(r) => &r.url,
            Recipient::Sink(r) => &r.sink_url,
        }
    }

    /// Append every rule this recipient breaks to `errors`.
    pub fn validate(&self, errors: &mut Vec<String>) {
        match self {
            Recipient::Http(r) => {
                check_url("recipient.url", &r.url, errors);
                if reqwest::Method::from_bytes(r.method.as_bytes()).is_err() {
                    errors.push(format!("recipient.method '{}' is not an HTTP method", r.method));
                }
            }
            Recipient::Sink(r) => {
                check_url("recipient.sinkUrl", &r.sink_url, errors);
                if r.ce_type.trim().is_empty() {
                    errors.push("recipient.ceType must not be empty".to_string());
                }
                if r.ce_source.trim().is_empty() {
                    errors.push("recipient.ceSource must not be empty".to_string());
                }
            }
        }
    }
}

fn check_url(field: &str, url: &str, errors: &mut Vec<String>) {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        Ok(parsed) => errors.push(format!(
            "{field} must use http or https, not '{}'",
            parsed.scheme()
        )),
        Err(e) => errors.push(format!("{field} is not a valid URL: {e}")),
    }
}
