//! Zap flow: profile lookup, LNURL callback, invoice handling.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{self, Event, EventDraft, Tag, KIND_METADATA, KIND_ZAP_REQUEST};
use crate::identity::Identity;
use crate::relay::{Filter, RelayLink};

/// Recognized fields of a kind-0 profile content blob.
#[derive(Debug, Deserialize)]
struct ProfileMeta {
    /// Lightning address, `user@domain`.
    lud16: Option<String>,
    /// Raw LNURL-style endpoint.
    lud06: Option<String>,
}

/// LNURL-pay callback response.
#[derive(Debug, Deserialize)]
struct LnurlResponse {
    status: Option<String>,
    reason: Option<String>,
    pr: Option<String>,
}

/// Result of handing an invoice to the payment executor.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    /// The executor settled the invoice.
    Paid,
    /// No executor settled it; the invoice itself is the artifact, to be
    /// presented for manual settlement. A defined success, not a failure.
    Manual(String),
}

/// External capability that can settle a bolt11 invoice.
#[async_trait]
pub trait PaymentExecutor: Send + Sync {
    fn available(&self) -> bool;
    async fn pay(&self, invoice: &str) -> Result<()>;
}

/// Look up the counterparty's payment endpoint from their latest profile
/// event. `None` means no profile or no lightning field: a normal outcome.
pub async fn resolve_endpoint(
    relay: &RelayLink,
    pubkey: &str,
    timeout: Duration,
) -> Result<Option<String>> {
    let filter = Filter {
        kinds: Some(vec![KIND_METADATA]),
        authors: Some(vec![pubkey.to_string()]),
        limit: Some(1),
        ..Default::default()
    };
    let mut events = relay.query_sync(&filter, timeout).await?;
    events.retain(|ev| match ev.verify() {
        Ok(()) => true,
        Err(e) => {
            warn!("dropping unverifiable profile event: {e}");
            false
        }
    });
    let Some(latest) = events.into_iter().max_by_key(|ev| ev.created_at) else {
        return Ok(None);
    };
    let Ok(meta) = serde_json::from_str::<ProfileMeta>(&latest.content) else {
        debug!("profile content is not metadata json");
        return Ok(None);
    };
    Ok(meta.lud16.or(meta.lud06).filter(|s| !s.is_empty()))
}

/// Turn a lightning address or raw endpoint into the LNURL-pay callback URL.
/// `user@domain` becomes `https://domain/.well-known/lnurlp/user`; anything
/// else is already a callback URL and passes through unchanged.
pub fn normalize_endpoint(endpoint: &str) -> String {
    match endpoint.split_once('@') {
        Some((user, domain)) => format!("https://{domain}/.well-known/lnurlp/{user}"),
        None => endpoint.to_string(),
    }
}

/// Build and sign the kind-9734 zap request. It is not published to the
/// relay; it rides the LNURL HTTP query and correlates by its id.
pub fn zap_request(
    identity: &Identity,
    receiver: &str,
    amount_sats: u64,
    relays: &[String],
    comment: &str,
) -> Result<Event> {
    let mut relays_tag = vec!["relays".to_string()];
    relays_tag.extend(relays.iter().cloned());
    let tags = vec![
        Tag::p(receiver),
        Tag(vec!["amount".into(), millisats(amount_sats)]),
        Tag(relays_tag),
    ];
    EventDraft::new(
        KIND_ZAP_REQUEST,
        identity.public_key(),
        event::unix_now(),
        tags,
        comment,
    )
    .sign(identity.keypair())
}

/// Exchange the signed zap request for a bolt11 invoice at the callback URL.
pub async fn request_invoice(
    client: &reqwest::Client,
    endpoint: &str,
    amount_sats: u64,
    signed: &Event,
) -> Result<String> {
    let payload = serde_json::to_vec(signed)
        .map_err(|e| Error::InvoiceRequest(format!("serialization: {e}")))?;
    let url = format!(
        "{endpoint}?amount={}&nostr={}",
        millisats(amount_sats),
        hex::encode(payload)
    );
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::InvoiceRequest(format!("request: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::InvoiceRequest(format!(
            "endpoint returned {}",
            resp.status()
        )));
    }
    let body: LnurlResponse = resp
        .json()
        .await
        .map_err(|e| Error::InvoiceRequest(format!("response body: {e}")))?;
    if body.status.as_deref() == Some("ERROR") {
        return Err(Error::InvoiceRequest(
            body.reason.unwrap_or_else(|| "unspecified reason".into()),
        ));
    }
    body.pr
        .filter(|pr| !pr.is_empty())
        .ok_or_else(|| Error::InvoiceRequest("no invoice in response".into()))
}

/// Hand the invoice to the executor if one is present and willing; otherwise
/// fall back to the invoice string for manual settlement.
pub async fn execute_payment(
    executor: Option<&dyn PaymentExecutor>,
    invoice: String,
) -> PaymentOutcome {
    if let Some(exec) = executor {
        if exec.available() {
            match exec.pay(&invoice).await {
                Ok(()) => return PaymentOutcome::Paid,
                Err(e) => warn!("payment executor failed, falling back to manual: {e}"),
            }
        }
    }
    PaymentOutcome::Manual(invoice)
}

fn millisats(sats: u64) -> String {
    (sats * 1000).to_string()
}
