//! Webhook signature verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`. The
//! signed payload is `"{t}.{body}"`, keyed with the endpoint secret.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> BillingResult<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Webhook signature header missing timestamp");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Webhook signature header has no v1 signature");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn mac_for(secret: &str, timestamp: i64, payload: &str) -> BillingResult<Vec<u8>> {
    // The full `whsec_...` string is the key
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Check a signature header against the payload
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let parsed = parse_header(header)?;

    let skew = (now.unix_timestamp() - parsed.timestamp).unsigned_abs();
    if skew > tolerance.as_secs() {
        tracing::warn!(
            timestamp = parsed.timestamp,
            skew_secs = skew,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = mac_for(secret, parsed.timestamp, payload)?;
    let matched = parsed
        .signatures
        .iter()
        .fold(false, |found, candidate| {
            found | bool::from(expected.as_slice().ct_eq(candidate.as_slice()))
        });

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Build a signature header for `payload`, as the processor would
pub fn sign(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let mac = mac_for(secret, timestamp, payload)?;
    Ok(format!("t={timestamp},v1={}", hex::encode(mac)))
}
