use crate::error::AlerterError;
use configuration::AlertingConfig;
use events::{EngineEvent, LogLevel};
use reqwest::Client;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::broadcast;
pub mod error;

/// The JSON payload for the Telegram `sendMessage` endpoint.
#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str, // To allow for formatting like bold, italics etc.
}

/// A client for sending messages to the Telegram Bot API.
pub struct TelegramAlerter {
    client: Client,
    token: String,
    chat_id: String,
}

impl TelegramAlerter {
    /// Creates a new `TelegramAlerter`.
    ///
    /// Returns `None` if the token or chat_id is missing from the configuration,
    /// allowing the system to gracefully disable alerting.
    pub fn new(config: &AlertingConfig) -> Option<Self> {
        if config.telegram_token.is_empty() || config.telegram_chat_id.is_empty() {
            tracing::warn!("Telegram alerter is not configured (missing token or chat_id).");
            return None;
        }
        Some(Self {
            client: Client::new(),
            token: config.telegram_token.clone(),
            chat_id: config.telegram_chat_id.clone(),
        })
    }

    /// Sends a text message to the configured Telegram chat.
    pub async fn send_message(&self, message: &str) -> Result<(), AlerterError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);

        let payload = SendMessagePayload {
            chat_id: &self.chat_id,
            text: message,
            parse_mode: "MarkdownV2", // Use Markdown for rich formatting
        };

        let response = self.client.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Failed to decode error response".to_string());
            return Err(AlerterError::ApiError(error_text));
        }

        Ok(())
    }
}
/// A long-running service that listens to the `EngineEvent` broadcast bus
/// and sends Telegram alerts for the events worth paging a human over:
/// circuit-breaker escalations, risk-relevant rejections, and shutdown.
pub async fn run_alerter_service(alerter: TelegramAlerter, mut event_rx: broadcast::Receiver<EngineEvent>) {
    tracing::info!("Alerter service started. Listening for critical events.");

    let _ = alerter.send_message("✅ *Aegis Engine Started*").await;

    loop {
        match event_rx.recv().await {
            Ok(event) => {
                if let Some(msg) = render_alert(&event) {
                    if let Err(e) = alerter.send_message(&msg).await {
                        tracing::error!(error = ?e, "Failed to send Telegram alert.");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Alerter service lagged, skipped {} messages.", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::error!("Broadcast channel closed. Alerter service shutting down.");
                break;
            }
        }
    }
}

/// Decides whether an event is worth paging on and, if so, renders it.
/// Narrower than `EngineEvent::level`'s general severity judgment — a
/// circuit escalation and a shutdown page a human; a routine tick or fill
/// stays in the structured log only.
fn render_alert(event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::CircuitTransition(t) if t.to > t.from => Some(format!(
            "🚨 *Circuit breaker escalated*: {:?} \\-\\> {:?} \\(drawdown {:.2}%\\)",
            t.from,
            t.to,
            t.drawdown * dec!(100)
        )),
        // Duplicate-suppression is expected traffic (spec.md §7, logged at
        // debug), not an alert-worthy rejection; everything else (sizing,
        // leverage, circuit, insufficient funds) pages a human.
        EngineEvent::ActionRejected(r) if !r.reason.to_lowercase().contains("duplicate") => Some(format!(
            "⚠️ *Action rejected* for {:?} on `{}`: {}",
            r.owner,
            escape_markdown(&r.symbol),
            escape_markdown(&r.reason)
        )),
        EngineEvent::Shutdown(s) => Some(format!("🛑 *Engine halted*: {}", escape_markdown(&s.reason))),
        EngineEvent::Log(log) if log.level >= LogLevel::Warn => {
            Some(format!("⚠️ {}", escape_markdown(&log.message)))
        }
        _ => None,
    }
}

/// Escapes characters with special meaning in Telegram's MarkdownV2.
fn escape_markdown(text: &str) -> String {
    let special_chars = r"_*[]()~`>#+-=|{}.!";
    special_chars.chars().fold(text.to_string(), |s, c| s.replace(c, &format!("\\{}", c)))
}