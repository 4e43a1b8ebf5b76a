//! Outbound email for magic links.
//!
//! Delivery goes through the [`Mailer`] trait. `ResendMailer` posts to the Resend
//! HTTP API; `LogMailer` is the local dev sender and only logs recipient and
//! subject, never the link itself.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, info_span, Instrument};

pub const DEFAULT_EMAIL_FROM: &str = "Web Dev Tools <info@web-dev-tools.xyz>";
const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const MAGIC_LINK_SUBJECT: &str = "Your Web Dev Tools sign-in link";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl EmailMessage {
    /// Sign-in email carrying a one-time link.
    #[must_use]
    pub fn magic_link(to: &str, link: &str, valid_minutes: u64) -> Self {
        let link = escape_html(link);
        let html = format!(
            "<p>Hi,</p>\
             <p>Click the link below to sign in to Web Dev Tools. \
             It is valid for {valid_minutes} minutes.</p>\
             <p><a href=\"{link}\">Sign in</a></p>\
             <p>If you did not request this email you can ignore it.</p>"
        );
        Self {
            to: to.to_string(),
            subject: MAGIC_LINK_SUBJECT.to_string(),
            html,
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver a message or return an error.
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, "email send stub");
        Ok(())
    }
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// Sends through the Resend HTTP API.
#[derive(Clone, Debug)]
pub struct ResendMailer {
    client: reqwest::Client,
    api_key: SecretString,
    from: String,
    endpoint: String,
}

impl ResendMailer {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_key: SecretString, from: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(SEND_TIMEOUT)
            .build()
            .context("failed to build mail client")?;
        Ok(Self {
            client,
            api_key,
            from,
            endpoint: RESEND_ENDPOINT.to_string(),
        })
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let body = ResendRequest {
            from: &self.from,
            to: [&message.to],
            subject: &message.subject,
            html: &message.html,
        };
        let span = info_span!("mail.send", provider = "resend");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .instrument(span)
            .await
            .context("failed to reach mail provider")?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let detail = response.text().await.unwrap_or_default();
            Err(anyhow!("mail provider returned {status}: {detail}"))
        }
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
