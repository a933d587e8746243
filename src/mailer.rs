//! Outbound notification sender (SendGrid v3) behind the `Mailer` trait.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

const SENDGRID_SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SendgridMailer {
    http: Client,
    api_key: String,
    from_email: String,
}

impl SendgridMailer {
    pub fn new(api_key: &str, from_email: &str) -> Self {
        let http = Client::builder()
            .user_agent("shopsync/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_key: api_key.to_string(),
            from_email: from_email.to_string(),
        }
    }
}

#[async_trait]
impl Mailer for SendgridMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let body = build_send_request(&self.from_email, to, subject, html);
        let res = self
            .http
            .post(SENDGRID_SEND_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to reach SendGrid")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("sendgrid error {}: {}", status, body));
        }
        Ok(())
    }
}

pub fn build_send_request(from: &str, to: &str, subject: &str, html: &str) -> Value {
    json!({
        "personalizations": [ { "to": [ { "email": to } ] } ],
        "from": { "email": from },
        "subject": subject,
        "content": [ { "type": "text/html", "value": html } ],
    })
}

/// Reward message for high-value segments (Champions, Loyal Customers).
pub fn reward_email(shop_name: &str) -> (String, String) {
    let subject = format!("A Special Gift from {shop_name}!");
    let html = format!(
        "<div style=\"font-family: Arial, sans-serif; padding: 20px;\">\
           <h2>You're a Star!</h2>\
           <p>Thank you for being one of our most loyal customers at {shop_name}.</p>\
           <p>To show our appreciation, we're giving you exclusive access to our VIP sale.</p>\
           <p><strong>Use code VIP20 for 20% off your next order.</strong></p>\
           <br/>\
           <p>Best regards,<br/>The {shop_name} Team</p>\
         </div>"
    );
    (subject, html)
}

/// Retention message for churn-risk segments (At-Risk, Lost).
pub fn retention_email(shop_name: &str) -> (String, String) {
    let subject = format!("We Miss You at {shop_name}!");
    let html = format!(
        "<div style=\"font-family: Arial, sans-serif; padding: 20px;\">\
           <h2>We Miss You!</h2>\
           <p>It's been a while since we've seen you at {shop_name}.</p>\
           <p>We've updated our collection and would love to have you back.</p>\
           <p><strong>Here is a 15% discount code just for you: WELCOMEBACK15</strong></p>\
           <br/>\
           <p>Best regards,<br/>The {shop_name} Team</p>\
         </div>"
    );
    (subject, html)
}
