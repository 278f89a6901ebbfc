//! Per-hook authentication: bearer tokens and HMAC signatures.
//!
//! All comparisons are constant-time. Tokens and secrets never leave this
//! module in logs or replies.

use base64::Engine;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

/// Auth material for one hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum HookAuth {
    Bearer {
        /// Empty means "use the globally configured token".
        #[serde(default)]
        token: String,
    },
    Hmac {
        secret: String,
        /// Header carrying the signature, e.g. `X-Hub-Signature-256`.
        header: String,
        #[serde(default = "default_algorithm")]
        algorithm: String,
        #[serde(default = "default_encoding")]
        encoding: String,
        /// Literal prefix stripped from the header value, e.g. `sha256=`.
        #[serde(default, rename = "signaturePrefix")]
        signature_prefix: Option<String>,
        /// Alternative to the prefix: capture group 1 is the signature.
        #[serde(default, rename = "signatureRegex")]
        signature_regex: Option<String>,
        /// When set, group 1 captured from the header value is prepended
        /// to the body as `<prefix>.<body>` before signing.
        #[serde(default, rename = "payloadPrefixRegex")]
        payload_prefix_regex: Option<String>,
    },
}

impl Default for HookAuth {
    fn default() -> Self {
        Self::Bearer {
            token: String::new(),
        }
    }
}

fn default_algorithm() -> String {
    "sha256".into()
}

fn default_encoding() -> String {
    "hex".into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Verify `Authorization: Bearer <token>` against the hook token, falling
/// back to the global token when the hook's own is empty.
pub fn verify_bearer(authorization: Option<&str>, hook_token: &str, global_token: &str) -> bool {
    let expected = if hook_token.is_empty() {
        global_token
    } else {
        hook_token
    };
    if expected.is_empty() {
        return false;
    }
    let Some(presented) = authorization.and_then(|v| v.strip_prefix("Bearer ")) else {
        return false;
    };
    constant_time_eq(presented.trim().as_bytes(), expected.as_bytes())
}

/// Verify an HMAC signature per the hook's configuration.
pub fn verify_hmac(auth: &HookAuth, header_value: Option<&str>, body: &[u8]) -> bool {
    let HookAuth::Hmac {
        secret,
        algorithm,
        encoding,
        signature_prefix,
        signature_regex,
        payload_prefix_regex,
        ..
    } = auth
    else {
        return false;
    };
    let Some(header_value) = header_value else {
        return false;
    };

    // Extract the presented signature from the header.
    let presented = if let Some(pattern) = signature_regex {
        match capture_group_one(pattern, header_value) {
            Some(sig) => sig,
            None => return false,
        }
    } else if let Some(prefix) = signature_prefix {
        match header_value.strip_prefix(prefix.as_str()) {
            Some(sig) => sig.to_string(),
            None => return false,
        }
    } else {
        header_value.to_string()
    };

    // Some providers sign `<prefix>.<body>` where the prefix (typically a
    // timestamp) also travels in the header.
    let signed: Vec<u8> = if let Some(pattern) = payload_prefix_regex {
        match capture_group_one(pattern, header_value) {
            Some(prefix) => {
                let mut buf = prefix.into_bytes();
                buf.push(b'.');
                buf.extend_from_slice(body);
                buf
            }
            None => return false,
        }
    } else {
        body.to_vec()
    };

    let digest = match algorithm.as_str() {
        "sha256" => {
            let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
                Ok(mac) => mac,
                Err(_) => return false,
            };
            mac.update(&signed);
            mac.finalize().into_bytes().to_vec()
        }
        "sha512" => {
            let mut mac = match Hmac::<Sha512>::new_from_slice(secret.as_bytes()) {
                Ok(mac) => mac,
                Err(_) => return false,
            };
            mac.update(&signed);
            mac.finalize().into_bytes().to_vec()
        }
        _ => return false,
    };

    let computed = match encoding.as_str() {
        "hex" => hex::encode(digest),
        "base64" => base64::engine::general_purpose::STANDARD.encode(digest),
        _ => return false,
    };

    constant_time_eq(computed.as_bytes(), presented.trim().as_bytes())
}

fn capture_group_one(pattern: &str, value: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(value)?.get(1).map(|m| m.as_str().to_string())
}

/// Generate a fresh bearer token with 256 bits of entropy, hex-encoded.
pub fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hmac_auth(secret: &str) -> HookAuth {
        HookAuth::Hmac {
            secret: secret.into(),
            header: "X-Sig".into(),
            algorithm: "sha256".into(),
            encoding: "hex".into(),
            signature_prefix: Some("sha256=".into()),
            signature_regex: None,
            payload_prefix_regex: None,
        }
    }

    #[test]
    fn test_bearer_match_and_fallback() {
        assert!(verify_bearer(Some("Bearer abc"), "abc", ""));
        assert!(!verify_bearer(Some("Bearer abc"), "xyz", ""));
        // Empty hook token falls back to global.
        assert!(verify_bearer(Some("Bearer global"), "", "global"));
        // No token configured anywhere always fails.
        assert!(!verify_bearer(Some("Bearer anything"), "", ""));
        assert!(!verify_bearer(None, "abc", ""));
        assert!(!verify_bearer(Some("Basic abc"), "abc", ""));
    }

    #[test]
    fn test_hmac_hex_prefixed() {
        // HMAC-SHA256 over the raw body with secret "k".
        let body = br#"{"a":1}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"k").unwrap();
        mac.update(body);
        let good = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        let auth = hmac_auth("k");
        assert!(verify_hmac(&auth, Some(&good), body));

        // Any single hex digit change must fail.
        let mut bad = good.clone().into_bytes();
        let last = *bad.last().unwrap();
        *bad.last_mut().unwrap() = if last == b'0' { b'1' } else { b'0' };
        assert!(!verify_hmac(&auth, Some(&String::from_utf8(bad).unwrap()), body));

        // Missing prefix fails.
        assert!(!verify_hmac(&auth, Some(good.trim_start_matches("sha256=")), body));
        assert!(!verify_hmac(&auth, None, body));
    }

    #[test]
    fn test_hmac_base64_and_regex_extraction() {
        let body = b"payload";
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        let header = format!("v1,{sig}");

        let auth = HookAuth::Hmac {
            secret: "secret".into(),
            header: "X-Signature".into(),
            algorithm: "sha256".into(),
            encoding: "base64".into(),
            signature_prefix: None,
            signature_regex: Some(r"^v1,(.+)$".into()),
            payload_prefix_regex: None,
        };
        assert!(verify_hmac(&auth, Some(&header), body));
        assert!(!verify_hmac(&auth, Some("v2,nope"), body));
    }

    #[test]
    fn test_hmac_signed_payload_prefix() {
        // Stripe-style: header carries `t=<ts>,v1=<sig>` and the signature
        // covers `<ts>.<body>`.
        let body = b"{}";
        let ts = "1700000000";
        let mut signed = ts.as_bytes().to_vec();
        signed.push(b'.');
        signed.extend_from_slice(body);
        let mut mac = Hmac::<Sha256>::new_from_slice(b"whsec").unwrap();
        mac.update(&signed);
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("t={ts},v1={sig}");

        let auth = HookAuth::Hmac {
            secret: "whsec".into(),
            header: "Stripe-Signature".into(),
            algorithm: "sha256".into(),
            encoding: "hex".into(),
            signature_prefix: None,
            signature_regex: Some(r"v1=([0-9a-f]+)".into()),
            payload_prefix_regex: Some(r"t=(\d+)".into()),
        };
        assert!(verify_hmac(&auth, Some(&header), body));
        // Signature over the bare body must not pass.
        let mut bare = Hmac::<Sha256>::new_from_slice(b"whsec").unwrap();
        bare.update(body);
        let bare_sig = hex::encode(bare.finalize().into_bytes());
        assert!(!verify_hmac(&auth, Some(&format!("t={ts},v1={bare_sig}")), body));
    }

    #[test]
    fn test_generated_tokens_are_long_and_unique() {
        let a = generate_token();
        let b = generate_token();
        // 32 bytes hex-encoded.
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_sha512_support() {
        let body = b"x";
        let mut mac = Hmac::<Sha512>::new_from_slice(b"k").unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        let auth = HookAuth::Hmac {
            secret: "k".into(),
            header: "X-Sig".into(),
            algorithm: "sha512".into(),
            encoding: "hex".into(),
            signature_prefix: None,
            signature_regex: None,
            payload_prefix_regex: None,
        };
        assert!(verify_hmac(&auth, Some(&sig), body));
    }
}
