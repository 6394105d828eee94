use k8s_openapi::{
    api::core::v1::{ResourceRequirements, SecretKeySelector, SecretReference},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reusable bundle of scan defaults, notification channels and quarantine
/// behaviour, referenced by name from NodeScans and ClusterScans.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clamav.antivirus.io",
    version = "v1alpha1",
    kind = "ScanPolicy",
    namespaced,
    status = "ScanPolicyStatus",
    shortname = "spol",
    printcolumn = r#"{"name":"MaxConcurrent","type":"integer","jsonPath":".spec.maxConcurrent"}"#,
    printcolumn = r#"{"name":"UsageCount","type":"integer","jsonPath":".status.usageCount"}"#,
    printcolumn = r#"{"name":"LastUsed","type":"date","jsonPath":".status.lastUsed"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScanPolicySpec {
    /// Absolute host paths scanned on each node.
    pub paths: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,

    /// Parallel file scans inside the scanner; 0 means unset.
    #[serde(default)]
    pub max_concurrent: i32,

    /// Per-file scan timeout in milliseconds; 0 means unset.
    #[serde(default)]
    pub file_timeout: i64,

    /// Files larger than this many bytes are skipped; 0 means unset.
    #[serde(default)]
    pub max_file_size: i64,

    /// Milliseconds allowed for the scanner to reach the ClamAV service;
    /// 0 means unset.
    #[serde(default)]
    pub connect_timeout: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<QuarantineConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    pub enabled: bool,

    /// Inline webhook URL; prefer `webhookSecretRef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Secret key holding the webhook URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret_ref: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default = "default_true")]
    pub only_on_infection: bool,
}

/// Transport security for the SMTP connection. There is no implicit
/// downgrade: the configured mode is the one used.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTransportSecurity {
    #[default]
    Starttls,
    Tls,
    None,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    pub enabled: bool,

    /// SMTP server as `host:port`.
    pub smtp_server: String,

    /// Secret with `username` and `password` keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_auth_secret_ref: Option<SecretReference>,

    pub from: String,

    pub recipients: Vec<String>,

    #[serde(default)]
    pub transport_security: SmtpTransportSecurity,

    #[serde(default = "default_true")]
    pub only_on_infection: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Secret whose entries become additional request headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    #[serde(default = "default_true")]
    pub only_on_infection: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum QuarantineAction {
    #[default]
    AlertOnly,
    Move,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineConfig {
    pub enabled: bool,

    #[serde(default)]
    pub action: QuarantineAction,

    /// Destination for `move`; ignored otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_dir: Option<String>,

    #[serde(default = "default_true")]
    pub notify_admin: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<Time>,

    #[serde(default)]
    pub usage_count: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_on_infection_defaults_to_true() {
        let slack: SlackConfig = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert!(slack.only_on_infection);
    }

    #[test]
    fn smtp_transport_defaults_to_starttls() {
        let email: EmailConfig = serde_json::from_str(
            r#"{
                "enabled": true,
                "smtpServer": "mail.example.com:587",
                "from": "clamav@example.com",
                "recipients": ["secops@example.com"]
            }"#,
        )
        .unwrap();
        assert_eq!(email.transport_security, SmtpTransportSecurity::Starttls);
    }

    #[test]
    fn quarantine_action_kebab_case() {
        assert_eq!(
            serde_json::to_string(&QuarantineAction::AlertOnly).unwrap(),
            "\"alert-only\""
        );
    }
}
