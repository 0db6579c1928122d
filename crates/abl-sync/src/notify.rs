//! Outbound notifications for newly approved balls.

use std::time::Duration;

use abl_core::Ball;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Discord accepts up to ten embeds per message, but image embeds render best in small groups.
pub const EMBEDS_PER_MESSAGE: usize = 3;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce newly approved balls. An empty slice must succeed without side effects.
    async fn notify(&self, balls: &[Ball]) -> Result<(), NotifyError>;
}

/// Writes announcements to the log. Used for local runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, balls: &[Ball]) -> Result<(), NotifyError> {
        if balls.is_empty() {
            debug!("no approved balls to notify");
            return Ok(());
        }
        for ball in balls {
            info!(brand = %ball.brand, name = %ball.name, "newly approved ball");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embeds: Vec<Embed<'a>>,
}

#[derive(Debug, Serialize)]
struct Embed<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    title: String,
    image: EmbedImage<'a>,
}

#[derive(Debug, Serialize)]
struct EmbedImage<'a> {
    url: &'a str,
}

/// Posts announcements to one or more Discord channel webhooks.
#[derive(Debug, Clone)]
pub struct DiscordWebhookNotifier {
    client: reqwest::Client,
    webhook_urls: Vec<String>,
}

impl DiscordWebhookNotifier {
    pub fn new(webhook_urls: Vec<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            webhook_urls,
        })
    }

    async fn post(&self, url: &str, message: &WebhookMessage<'_>) -> Result<(), NotifyError> {
        let resp = self.client.post(url).json(message).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for DiscordWebhookNotifier {
    async fn notify(&self, balls: &[Ball]) -> Result<(), NotifyError> {
        if balls.is_empty() {
            return Ok(());
        }

        let header = format!("Approved Balls: {}", Utc::now().format("%B %-d, %Y"));
        for url in &self.webhook_urls {
            self.post(
                url,
                &WebhookMessage {
                    content: Some(header.clone()),
                    embeds: Vec::new(),
                },
            )
            .await?;

            for chunk in balls.chunks(EMBEDS_PER_MESSAGE) {
                let embeds = chunk
                    .iter()
                    .map(|ball| Embed {
                        kind: "image",
                        title: format!("{} {}", ball.brand, ball.name),
                        image: EmbedImage {
                            url: &ball.image_url,
                        },
                    })
                    .collect();
                self.post(
                    url,
                    &WebhookMessage {
                        content: None,
                        embeds,
                    },
                )
                .await?;
            }
        }

        info!(
            count = balls.len(),
            channels = self.webhook_urls.len(),
            "sent approval notifications"
        );
        Ok(())
    }
}
