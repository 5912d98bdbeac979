//! Bridges EQ receipts from Pub/Sub to census RM `RESPONSE_RECEIVED` events.
//!
//! Reads settings from the environment (a `.env` file is loaded first) plus:
//!
//! - `EQ_RECEIPT_PROJECT`
//! - `EQ_RECEIPT_SUBSCRIPTION` (default `eq-receipt-subscription`)
//! - `RECEIPT_ROUTING_KEY` (default `event.response.receipt`)

use pubsub_adapter::{
    ConversionError, Processor, SourceMessage,
    config::{Pairing, Settings},
    logging,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct EqReceipt {
    #[serde(rename = "timeCreated")]
    time_created: String,
    metadata: EqReceiptMetadata,
}

#[derive(Debug, Deserialize)]
struct EqReceiptMetadata {
    tx_id: String,
    #[serde(default)]
    questionnaire_id: String,
    #[serde(rename = "caseId", default)]
    case_id: Option<String>,
}

impl SourceMessage for EqReceipt {
    fn transaction_id(&self) -> &str {
        &self.metadata.tx_id
    }
}

#[derive(Debug, Serialize)]
struct RmMessage {
    event: RmEvent,
    payload: RmPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RmEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    source: &'static str,
    channel: &'static str,
    date_time: String,
    transaction_id: String,
}

#[derive(Debug, Serialize)]
struct RmPayload {
    response: RmResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RmResponse {
    questionnaire_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    case_id: Option<String>,
    unreceipt: bool,
}

fn unmarshal(payload: &[u8]) -> Result<EqReceipt, tower::BoxError> {
    Ok(serde_json::from_slice(payload)?)
}

fn convert(receipt: &EqReceipt) -> Result<RmMessage, ConversionError<RmMessage>> {
    let message = RmMessage {
        event: RmEvent {
            event_type: "RESPONSE_RECEIVED",
            source: "RECEIPT_SERVICE",
            channel: "EQ",
            date_time: receipt.time_created.clone(),
            transaction_id: receipt.metadata.tx_id.clone(),
        },
        payload: RmPayload {
            response: RmResponse {
                questionnaire_id: receipt.metadata.questionnaire_id.clone(),
                case_id: receipt.metadata.case_id.clone(),
                unreceipt: false,
            },
        },
    };

    if receipt.metadata.questionnaire_id.is_empty() {
        return Err(ConversionError::partial(message, "receipt has no questionnaire_id"));
    }
    Ok(message)
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let settings = Settings::from_env()?;
    logging::init(&settings.log_level)?;

    let pairing = Pairing::new(
        std::env::var("EQ_RECEIPT_PROJECT")?,
        env_or("EQ_RECEIPT_SUBSCRIPTION", "eq-receipt-subscription"),
        env_or("RECEIPT_ROUTING_KEY", "event.response.receipt"),
    );

    let cancel = CancellationToken::new();
    let (errors, mut failures) = tokio::sync::mpsc::channel(1);

    let processor =
        Processor::connect(&settings, &pairing, unmarshal, convert, errors, &cancel).await?;

    tokio::select! {
        Some(err) = failures.recv() => {
            tracing::error!(
                subscription = err.subscription(),
                %err,
                "Processor failed, shutting down"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down");
        }
    }

    cancel.cancel();
    processor.shutdown().await;
    Ok(())
}
