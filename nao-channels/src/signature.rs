use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Requests older (or further in the future) than this are rejected as replays.
pub const SIGNATURE_MAX_AGE_SECS: i64 = 300;

/// Checks `X-Slack-Signature` (`v0=<hex hmac>`) over `v0:{timestamp}:{body}`.
///
/// `now_unix` is injected so callers and tests control the clock.
pub fn verify_slack_signature(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now_unix: i64,
) -> bool {
    let Ok(ts) = timestamp.trim().parse::<i64>() else {
        return false;
    };
    if (now_unix - ts).abs() > SIGNATURE_MAX_AGE_SECS {
        return false;
    }
    let Some(hex_sig) = signature.trim().strip_prefix("v0=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(signing_secret.as_bytes()) else {
        return false;
    };
    mac.update(b"v0:");
    mac.update(timestamp.trim().as_bytes());
    mac.update(b":");
    mac.update(body);
    // verify_slice compares in constant time.
    mac.verify_slice(&provided).is_ok()
}
