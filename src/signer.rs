//! HMAC envelope signing for outbound requests.
//!
//! The upstream authenticates callers with three headers:
//!
//! - `Third-Party-Timestamp` - decimal nanoseconds since the Unix epoch
//! - `Third-Party-User-Id` - the identity the request is signed as
//! - `Third-Party-Signature` - HMAC-SHA512 over `{user_id}-{timestamp}`,
//!   encoded as URL-safe base64 with padding
//!
//! [`EnvelopeSigner::sign`] injects each header only when the caller has not
//! already supplied it, so a fully pre-signed request passes through
//! untouched. Injection proceeds timestamp, then user id, then signature,
//! because the signature covers whatever ends up in the first two headers.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose;
use hmac::{Hmac, Mac};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::Sha512;
use tracing::debug;

use crate::config::Identity;

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the envelope timestamp.
pub const TIMESTAMP_HEADER: HeaderName = HeaderName::from_static("third-party-timestamp");

/// Header carrying the signing user id.
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("third-party-user-id");

/// Header carrying the envelope signature.
pub const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("third-party-signature");

/// Time source for envelope timestamps. Injectable so tests can sign with a
/// known instant and assert exact signatures.
pub trait Clock: Send + Sync {
    /// Nanoseconds since the Unix epoch.
    fn epoch_nanos(&self) -> u64;
}

/// Wall-clock [`Clock`] used outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }
}

/// Stamps outbound requests with the envelope headers.
///
/// Cheap to clone; the identity and clock are shared.
#[derive(Clone)]
pub struct EnvelopeSigner {
    identity: Arc<Identity>,
    clock: Arc<dyn Clock>,
}

impl EnvelopeSigner {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self::with_clock(identity, Arc::new(SystemClock))
    }

    pub fn with_clock(identity: Arc<Identity>, clock: Arc<dyn Clock>) -> Self {
        Self { identity, clock }
    }

    /// Inject the envelope headers into `headers`, skipping any already set.
    ///
    /// The signature always covers the user id and timestamp that end up in
    /// the headers, whether injected here or supplied by the caller.
    pub fn sign(&self, headers: &mut HeaderMap) {
        if !headers.contains_key(&TIMESTAMP_HEADER) {
            let timestamp = self.clock.epoch_nanos();
            debug!(header = %TIMESTAMP_HEADER, value = timestamp, "Signing header");
            headers.insert(TIMESTAMP_HEADER, HeaderValue::from(timestamp));
        }

        if !headers.contains_key(&USER_ID_HEADER) {
            debug!(header = %USER_ID_HEADER, value = %self.identity.user_id(), "Signing header");
            headers.insert(USER_ID_HEADER, self.identity.user_id_value().clone());
        }

        if !headers.contains_key(&SIGNATURE_HEADER) {
            let user_id = headers
                .get(&USER_ID_HEADER)
                .map(HeaderValue::as_bytes)
                .unwrap_or_default();
            let timestamp = headers
                .get(&TIMESTAMP_HEADER)
                .map(HeaderValue::as_bytes)
                .unwrap_or_default();
            let signature =
                sign_envelope(self.identity.private_key().as_bytes(), user_id, timestamp);
            debug!(header = %SIGNATURE_HEADER, "Signing header");
            let value = HeaderValue::from_str(&signature)
                .expect("base64 output is always a legal header value");
            headers.insert(SIGNATURE_HEADER, value);
        }
    }
}

/// The exact string the signature covers: `{user_id}-{timestamp}`.
pub fn envelope(user_id: &str, timestamp: &str) -> String {
    format!("{user_id}-{timestamp}")
}

/// Compute the envelope signature for the given key, user id, and timestamp.
///
/// Operates on raw header bytes so a caller-supplied header that is not valid
/// UTF-8 still signs the same way it was sent.
pub fn sign_envelope(key: &[u8], user_id: &[u8], timestamp: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(user_id);
    mac.update(b"-");
    mac.update(timestamp);
    general_purpose::URL_SAFE.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrivateKey;

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn epoch_nanos(&self) -> u64 {
            self.0
        }
    }

    fn identity(user_id: &str, key: &[u8]) -> Arc<Identity> {
        Arc::new(
            Identity::new(user_id.to_owned(), PrivateKey::new(key)).expect("valid test identity"),
        )
    }

    fn signer_at(user_id: &str, key: &[u8], nanos: u64) -> EnvelopeSigner {
        EnvelopeSigner::with_clock(identity(user_id, key), Arc::new(FixedClock(nanos)))
    }

    #[test]
    fn injects_all_three_headers() {
        let signer = signer_at("alice", b"super-secret-key", 1_700_000_000_000_000_000);
        let mut headers = HeaderMap::new();

        signer.sign(&mut headers);

        assert_eq!(headers[&TIMESTAMP_HEADER], "1700000000000000000");
        assert_eq!(headers[&USER_ID_HEADER], "alice");
        assert_eq!(
            headers[&SIGNATURE_HEADER],
            "9hzMNkS_CRVde7eVor_i4P4PE5619nvL8chk5_ROzDAWWRonjLaG04dePocfV6xg78plbqsipniuDCTtAlGwqA=="
        );
    }

    #[test]
    fn signing_is_deterministic_for_a_fixed_instant() {
        let mut first = HeaderMap::new();
        let mut second = HeaderMap::new();

        signer_at("alice", b"super-secret-key", 1_700_000_000_000_000_000).sign(&mut first);
        signer_at("alice", b"super-secret-key", 1_700_000_000_000_000_000).sign(&mut second);

        assert_eq!(first, second);
    }

    #[test]
    fn signing_twice_changes_nothing() {
        let signer = signer_at("alice", b"super-secret-key", 1_700_000_000_000_000_000);
        let mut headers = HeaderMap::new();

        signer.sign(&mut headers);
        let snapshot = headers.clone();
        signer.sign(&mut headers);

        assert_eq!(headers, snapshot);
    }

    #[test]
    fn caller_supplied_timestamp_is_kept_and_signed() {
        let signer = signer_at("svc-steward", b"test-key", 1_700_000_000_000_000_000);
        let mut headers = HeaderMap::new();
        headers.insert(&TIMESTAMP_HEADER, HeaderValue::from_static("42"));

        signer.sign(&mut headers);

        // The clock is never consulted; the signature covers the caller's
        // timestamp together with the injected user id.
        assert_eq!(headers[&TIMESTAMP_HEADER], "42");
        assert_eq!(headers[&USER_ID_HEADER], "svc-steward");
        assert_eq!(
            headers[&SIGNATURE_HEADER],
            "v5U8f2RklNY4ny3gWYwuHQLExKjQqRYxf-qwBZk7qYEMNK3DBWeMVrLbB7CKokpjmlrv9uSvr-2U8-iGA4F-4Q=="
        );
    }

    #[test]
    fn caller_supplied_signature_is_never_overwritten() {
        let signer = signer_at("alice", b"super-secret-key", 1_700_000_000_000_000_000);
        let mut headers = HeaderMap::new();
        headers.insert(&SIGNATURE_HEADER, HeaderValue::from_static("presigned"));

        signer.sign(&mut headers);

        assert_eq!(headers[&SIGNATURE_HEADER], "presigned");
        // The other two are still filled in.
        assert_eq!(headers[&TIMESTAMP_HEADER], "1700000000000000000");
        assert_eq!(headers[&USER_ID_HEADER], "alice");
    }

    #[test]
    fn envelope_joins_user_id_and_timestamp() {
        assert_eq!(envelope("abc", "123"), "abc-123");
    }

    #[test]
    fn sign_envelope_matches_known_vector() {
        assert_eq!(
            sign_envelope(b"k", b"abc", b"123"),
            "cf9gPZZhyw6RZC_XYFZ-vNNQc6kgrI9wDcu4bO81KgS8wxdB04X451o0VLP1CbH2XrCFQdRl4ukTnrqRlYNrdQ=="
        );
    }

    #[test]
    fn system_clock_reports_nanosecond_epoch_time() {
        // Anything after 2020-01-01 in nanoseconds.
        assert!(SystemClock.epoch_nanos() > 1_577_836_800_000_000_000);
    }
}
