use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;
/// Accepted clock drift, in steps, on either side.
const DRIFT_STEPS: i64 = 1;

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32 without padding, as authenticator apps expect.
fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for c in s.bytes() {
        if c == b'=' {
            continue;
        }
        let value = BASE32_ALPHABET
            .iter()
            .position(|a| *a == c.to_ascii_uppercase())? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    Some(out)
}

/// Fresh base32 secret for TOTP setup.
pub fn generate_secret() -> String {
    let raw: [u8; 20] = {
        let a = uuid::Uuid::new_v4().into_bytes();
        let b = uuid::Uuid::new_v4().into_bytes();
        let mut out = [0u8; 20];
        out[..16].copy_from_slice(&a);
        out[16..].copy_from_slice(&b[..4]);
        out
    };
    base32_encode(&raw)
}

/// otpauth:// provisioning URL encoded into the setup QR code.
pub fn otpauth_url(login: &str, secret: &str) -> String {
    format!("otpauth://totp/redub:{login}?secret={secret}&issuer=redub&digits={DIGITS}&period={STEP_SECS}")
}

/// RFC 6238 code for a given counter step.
fn code_at_step(secret: &str, step: u64) -> Option<String> {
    let key = base32_decode(secret)?;
    let mut mac = HmacSha1::new_from_slice(&key).ok()?;
    mac.update(&step.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    let code = binary % 10u32.pow(DIGITS);
    Some(format!("{code:06}"))
}

/// The current code; exposed for clients that mint codes (tests, CLI).
pub fn current_code(secret: &str, at: SystemTime) -> Option<String> {
    let secs = at.duration_since(UNIX_EPOCH).ok()?.as_secs();
    code_at_step(secret, secs / STEP_SECS)
}

/// Verify a submitted code, tolerating one step of clock drift each way.
pub fn verify_code(secret: &str, submitted: &str, at: SystemTime) -> bool {
    let Ok(elapsed) = at.duration_since(UNIX_EPOCH) else {
        return false;
    };
    let step = (elapsed.as_secs() / STEP_SECS) as i64;
    for drift in -DRIFT_STEPS..=DRIFT_STEPS {
        let candidate = step + drift;
        if candidate < 0 {
            continue;
        }
        if code_at_step(secret, candidate as u64).as_deref() == Some(submitted) {
            return true;
        }
    }
    false
}
