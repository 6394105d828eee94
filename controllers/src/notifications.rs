//! Notification channels driven by a ScanPolicy: Slack webhook, SMTP mail,
//! and a generic HTTP webhook. Send failures surface as warning events and
//! never re-open a terminal scan.

use crate::publish_event;
use chrono::Utc;
use clamav_operator_k8s_api::{
    scanpolicy::{EmailConfig, SlackConfig, SmtpTransportSecurity, WebhookConfig},
    NodeScan, NodeScanStatus, ScanPolicy, Secret,
};
use kube::{runtime::events::{EventType, Recorder}, Api, Client, ResourceExt};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::json;
use std::{fmt::Write as _, time::Duration};
use thiserror::Error;

const USER_AGENT: &str = "ClamAV-Operator/1.0";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Infected paths shown inline in a Slack message before eliding.
const SLACK_MAX_LISTED: usize = 10;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook URL not configured")]
    MissingWebhookUrl,

    #[error("failed to fetch secret {name}: {source}")]
    Secret {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("secret {name} has no {key:?} key")]
    MissingSecretKey { name: String, key: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned status {0}")]
    Status(u16),

    #[error("invalid SMTP server address {0:?}")]
    BadSmtpServer(String),

    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("failed to build mail: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

pub struct Notifier {
    client: Client,
    http: reqwest::Client,
}

// === impl Notifier ===

impl Notifier {
    pub fn new(client: Client) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client, http }
    }

    /// Fires every enabled channel, reporting failures as events on the
    /// NodeScan.
    pub async fn send_all(&self, scan: &NodeScan, policy: &ScanPolicy, recorder: &Recorder) {
        let Some(notifications) = &policy.spec.notifications else {
            return;
        };
        let namespace = policy.namespace().unwrap_or_default();

        if let Some(slack) = notifications.slack.as_ref().filter(|s| s.enabled) {
            if let Err(error) = self.send_slack(scan, &namespace, slack).await {
                tracing::error!(%error, "failed to send Slack notification");
                publish_event(
                    recorder,
                    EventType::Warning,
                    "NotificationFailed",
                    format!("Failed to send Slack notification: {error}"),
                )
                .await;
            }
        }

        if let Some(email) = notifications.email.as_ref().filter(|e| e.enabled) {
            if let Err(error) = self.send_email(scan, &namespace, email).await {
                tracing::error!(%error, "failed to send email notification");
                publish_event(
                    recorder,
                    EventType::Warning,
                    "NotificationFailed",
                    format!("Failed to send email notification: {error}"),
                )
                .await;
            }
        }

        if let Some(webhook) = notifications.webhook.as_ref() {
            if let Err(error) = self.send_webhook(scan, &namespace, webhook).await {
                tracing::error!(%error, "failed to send webhook notification");
                publish_event(
                    recorder,
                    EventType::Warning,
                    "NotificationFailed",
                    format!("Failed to send webhook notification: {error}"),
                )
                .await;
            }
        }
    }

    async fn send_slack(
        &self,
        scan: &NodeScan,
        namespace: &str,
        config: &SlackConfig,
    ) -> Result<(), NotifyError> {
        let status = scan.status.clone().unwrap_or_default();
        if config.only_on_infection && status.files_infected == 0 {
            return Ok(());
        }

        let webhook_url = match &config.webhook_secret_ref {
            Some(key_ref) => {
                let secret = self.secret(namespace, &key_ref.name).await?;
                secret_string(&secret, &key_ref.key)?
            }
            None => config
                .webhook_url
                .clone()
                .ok_or(NotifyError::MissingWebhookUrl)?,
        };
        if webhook_url.is_empty() {
            return Err(NotifyError::MissingWebhookUrl);
        }

        let payload = slack_payload(scan, config.channel.as_deref(), Utc::now().timestamp());
        let response = self.http.post(&webhook_url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn send_email(
        &self,
        scan: &NodeScan,
        namespace: &str,
        config: &EmailConfig,
    ) -> Result<(), NotifyError> {
        let status = scan.status.clone().unwrap_or_default();
        if config.only_on_infection && status.files_infected == 0 {
            return Ok(());
        }

        let (host, port) = split_smtp_server(&config.smtp_server)?;

        let mut builder = Message::builder()
            .from(config.from.parse::<Mailbox>()?)
            .subject(email_subject(&status))
            .header(ContentType::TEXT_PLAIN);
        for recipient in &config.recipients {
            builder = builder.to(recipient.parse::<Mailbox>()?);
        }
        let message = builder.body(email_body(scan))?;

        // Transport security is explicit configuration; a TLS failure is a
        // failure, not a plaintext retry.
        let mut transport = match config.transport_security {
            SmtpTransportSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
            }
            SmtpTransportSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)?,
            SmtpTransportSecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            }
        }
        .port(port);

        if let Some(secret_ref) = &config.smtp_auth_secret_ref {
            let name = secret_ref.name.clone().unwrap_or_default();
            let secret = self.secret(namespace, &name).await?;
            let username = secret_string(&secret, "username")?;
            let password = secret_string(&secret, "password")?;
            transport = transport.credentials(Credentials::new(username, password));
        }

        transport.build().send(message).await?;
        Ok(())
    }

    async fn send_webhook(
        &self,
        scan: &NodeScan,
        namespace: &str,
        config: &WebhookConfig,
    ) -> Result<(), NotifyError> {
        let status = scan.status.clone().unwrap_or_default();
        if config.only_on_infection && status.files_infected == 0 {
            return Ok(());
        }

        let payload = webhook_payload(scan, &Utc::now().to_rfc3339());
        let mut request = self.http.post(&config.url).json(&payload);
        for (key, value) in &config.headers {
            request = request.header(key, value);
        }
        if let Some(secret_ref) = &config.secret_ref {
            let name = secret_ref.name.clone().unwrap_or_default();
            let secret = self.secret(namespace, &name).await?;
            if let Some(data) = &secret.data {
                for (key, value) in data {
                    let value = String::from_utf8_lossy(&value.0).to_string();
                    request = request.header(key, value);
                }
            }
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret, NotifyError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|source| NotifyError::Secret {
            name: name.to_string(),
            source,
        })
    }
}

fn secret_string(secret: &Secret, key: &str) -> Result<String, NotifyError> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).to_string())
        .ok_or_else(|| NotifyError::MissingSecretKey {
            name: secret.name_any(),
            key: key.to_string(),
        })
}

fn split_smtp_server(server: &str) -> Result<(&str, u16), NotifyError> {
    let bad = || NotifyError::BadSmtpServer(server.to_string());
    match server.split_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| bad())?;
            Ok((host, port))
        }
        None if !server.is_empty() => Ok((server, 587)),
        _ => Err(bad()),
    }
}

fn email_subject(status: &NodeScanStatus) -> &'static str {
    if status.files_infected > 0 {
        "ALERT: Malware Detected by ClamAV"
    } else {
        "ClamAV Scan Completed"
    }
}

fn slack_payload(scan: &NodeScan, channel: Option<&str>, ts: i64) -> serde_json::Value {
    let status = scan.status.clone().unwrap_or_default();
    let infected = status.files_infected > 0;
    let (color, headline) = if infected {
        ("danger", "ClamAV scan found infected files")
    } else {
        ("good", "ClamAV scan completed")
    };

    let mut fields = vec![
        json!({"title": "Node", "value": scan.spec.node_name, "short": true}),
        json!({"title": "Status", "value": status.phase.map(|p| p.to_string()).unwrap_or_default(), "short": true}),
        json!({"title": "Files Scanned", "value": status.files_scanned.to_string(), "short": true}),
        json!({"title": "Files Infected", "value": status.files_infected.to_string(), "short": true}),
        json!({"title": "Duration", "value": format!("{} seconds", status.duration), "short": true}),
    ];

    if infected {
        let mut listed: Vec<String> = status
            .infected_files
            .iter()
            .take(SLACK_MAX_LISTED)
            .map(|f| format!("• `{}` - {}", f.path, f.viruses.join(", ")))
            .collect();
        if status.infected_files.len() > SLACK_MAX_LISTED {
            listed.push(format!(
                "... and {} more",
                status.infected_files.len() - SLACK_MAX_LISTED
            ));
        }
        fields.push(json!({
            "title": "Infected Files",
            "value": listed.join("\n"),
            "short": false,
        }));
    }

    json!({
        "channel": channel,
        "username": "ClamAV Operator",
        "icon_emoji": ":shield:",
        "text": headline,
        "attachments": [{
            "color": color,
            "fields": fields,
            "footer": "ClamAV Operator",
            "ts": ts,
        }],
    })
}

fn email_body(scan: &NodeScan) -> String {
    let status = scan.status.clone().unwrap_or_default();
    let rule = "-".repeat(80);
    let heavy = "=".repeat(80);

    let mut body = String::new();
    let _ = writeln!(body, "{heavy}");
    let _ = writeln!(body, "{:^80}", "ClamAV SCAN REPORT");
    let _ = writeln!(body, "{heavy}\n");
    let _ = writeln!(body, "Node:              {}", scan.spec.node_name);
    let _ = writeln!(body, "Scan Name:         {}", scan.name_any());
    let _ = writeln!(
        body,
        "Status:            {}",
        status.phase.map(|p| p.to_string()).unwrap_or_default()
    );
    if let Some(start) = &status.start_time {
        let _ = writeln!(body, "Scan Date:         {}", start.0.to_rfc3339());
    }
    let _ = writeln!(body, "Duration:          {} seconds\n", status.duration);

    let _ = writeln!(body, "STATISTICS:");
    let _ = writeln!(body, "{rule}");
    let _ = writeln!(body, "Files Scanned:     {}", status.files_scanned);
    let _ = writeln!(body, "Files Infected:    {}", status.files_infected);
    let _ = writeln!(body, "Files Skipped:     {}", status.files_skipped);
    let _ = writeln!(body, "Errors:            {}\n", status.error_count);

    if status.files_infected > 0 {
        let _ = writeln!(body, "INFECTED FILES DETECTED:");
        let _ = writeln!(body, "{heavy}\n");
        for (i, f) in status.infected_files.iter().enumerate() {
            let _ = writeln!(body, "{}. File: {}", i + 1, f.path);
            let _ = writeln!(body, "   Viruses: {}", f.viruses.join(", "));
            let _ = writeln!(body, "   Size: {} bytes\n", f.size);
        }
    } else {
        let _ = writeln!(body, "NO MALWARE DETECTED\n");
    }

    let _ = writeln!(body, "{rule}");
    let _ = writeln!(body, "This is an automated message from the ClamAV operator.");
    let _ = writeln!(body, "For more information, check the cluster events and logs.");
    let _ = writeln!(body, "{heavy}");
    body
}

fn webhook_payload(scan: &NodeScan, timestamp: &str) -> serde_json::Value {
    let status = scan.status.clone().unwrap_or_default();
    let mut payload = json!({
        "type": "clamav.scan.completed",
        "timestamp": timestamp,
        "severity": if status.files_infected > 0 { "critical" } else { "info" },
        "scan": {
            "name": scan.name_any(),
            "namespace": scan.namespace(),
            "node": scan.spec.node_name,
            "phase": status.phase,
            "filesScanned": status.files_scanned,
            "filesInfected": status.files_infected,
            "filesSkipped": status.files_skipped,
            "errorCount": status.error_count,
            "duration": status.duration,
            "startTime": status.start_time,
            "completionTime": status.completion_time,
        },
    });

    if status.files_infected > 0 {
        payload["infectedFiles"] = json!(status
            .infected_files
            .iter()
            .map(|f| json!({"path": f.path, "viruses": f.viruses, "size": f.size}))
            .collect::<Vec<_>>());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use clamav_operator_k8s_api::{InfectedFile, NodeScanPhase, NodeScanSpec};

    fn scan_with(infected: i64) -> NodeScan {
        let mut scan = NodeScan::new(
            "s1",
            NodeScanSpec {
                node_name: "worker-1".to_string(),
                ..Default::default()
            },
        );
        scan.metadata.namespace = Some("default".to_string());
        scan.status = Some(NodeScanStatus {
            phase: Some(NodeScanPhase::Completed),
            files_scanned: 1000,
            files_infected: infected,
            duration: 42,
            infected_files: (0..infected)
                .map(|i| InfectedFile {
                    path: format!("/host/var/lib/bad-{i}.bin"),
                    viruses: vec!["Eicar-Test-Signature".to_string()],
                    size: 68,
                    detected_at: None,
                })
                .collect(),
            ..Default::default()
        });
        scan
    }

    #[test]
    fn slack_payload_reports_clean_scans_in_green() {
        let payload = slack_payload(&scan_with(0), Some("#security"), 1);
        assert_eq!(payload["channel"], "#security");
        assert_eq!(payload["attachments"][0]["color"], "good");
        let fields = payload["attachments"][0]["fields"].as_array().unwrap();
        assert!(fields.iter().all(|f| f["title"] != "Infected Files"));
    }

    #[test]
    fn slack_payload_lists_infected_files() {
        let payload = slack_payload(&scan_with(2), None, 1);
        assert_eq!(payload["attachments"][0]["color"], "danger");
        let fields = payload["attachments"][0]["fields"].as_array().unwrap();
        let infected = fields
            .iter()
            .find(|f| f["title"] == "Infected Files")
            .unwrap();
        assert!(infected["value"]
            .as_str()
            .unwrap()
            .contains("/host/var/lib/bad-0.bin"));
    }

    #[test]
    fn slack_payload_elides_past_ten_files() {
        let payload = slack_payload(&scan_with(14), None, 1);
        let fields = payload["attachments"][0]["fields"].as_array().unwrap();
        let infected = fields
            .iter()
            .find(|f| f["title"] == "Infected Files")
            .unwrap();
        assert!(infected["value"].as_str().unwrap().contains("and 4 more"));
    }

    #[test]
    fn email_subject_reflects_infections() {
        let infected = scan_with(1).status.unwrap();
        assert!(email_subject(&infected).contains("ALERT"));
        let clean = scan_with(0).status.unwrap();
        assert_eq!(email_subject(&clean), "ClamAV Scan Completed");
    }

    #[test]
    fn email_body_shape() {
        let body = email_body(&scan_with(1));
        assert!(body.contains("ClamAV SCAN REPORT"));
        assert!(body.contains("Node:              worker-1"));
        assert!(body.contains("Files Scanned:     1000"));
        assert!(body.contains("INFECTED FILES DETECTED:"));
        assert!(body.contains("1. File: /host/var/lib/bad-0.bin"));

        let clean = email_body(&scan_with(0));
        assert!(clean.contains("NO MALWARE DETECTED"));
    }

    #[test]
    fn webhook_payload_shape() {
        let payload = webhook_payload(&scan_with(1), "2025-06-01T02:00:00Z");
        assert_eq!(payload["type"], "clamav.scan.completed");
        assert_eq!(payload["severity"], "critical");
        assert_eq!(payload["scan"]["node"], "worker-1");
        assert_eq!(payload["scan"]["filesScanned"], 1000);
        assert_eq!(payload["infectedFiles"][0]["size"], 68);

        let clean = webhook_payload(&scan_with(0), "2025-06-01T02:00:00Z");
        assert_eq!(clean["severity"], "info");
        assert!(clean.get("infectedFiles").is_none());
    }

    #[test]
    fn smtp_server_splits_host_and_port() {
        assert_eq!(
            split_smtp_server("mail.example.com:465").unwrap(),
            ("mail.example.com", 465)
        );
        assert_eq!(
            split_smtp_server("mail.example.com").unwrap(),
            ("mail.example.com", 587)
        );
        assert!(split_smtp_server(":25").is_err());
        assert!(split_smtp_server("").is_err());
        assert!(split_smtp_server("mail.example.com:notaport").is_err());
    }
}
