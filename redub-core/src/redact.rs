use once_cell::sync::Lazy;
use regex::Regex;

/// Patterns that must never reach a log or audit record in the clear.
///
/// Redaction happens at write time. Order matters: the key=value rule runs
/// last so that already-masked values are not re-matched.
static JWT_LIKE: Lazy<Regex> = Lazy::new(|| {
    // Three dot-separated base64url segments, the first starting with eyJ
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").unwrap()
});

static BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").unwrap());

static COOKIE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(cookie|set-cookie):\s*[^\r\n]+").unwrap());

static SECRET_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(token|secret|password|passwd|api[_-]?key|authorization|session)["']?\s*[:=]\s*["']?[^\s"',;&]+"#,
    )
    .unwrap()
});

const MASK: &str = "[redacted]";

/// Scrub secrets, tokens, cookies and JWT-like strings from `input`.
pub fn redact(input: &str) -> String {
    let out = JWT_LIKE.replace_all(input, MASK);
    let out = BEARER.replace_all(&out, MASK);
    let out = COOKIE_HEADER.replace_all(&out, MASK);
    let out = SECRET_PAIR.replace_all(&out, |caps: &regex::Captures<'_>| {
        format!("{}={}", &caps[1], MASK)
    });
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwts_are_masked() {
        let line = "denied token eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.c2ln for user";
        let out = redact(line);
        assert!(!out.contains("eyJhbGci"));
        assert!(out.contains(MASK));
    }

    #[test]
    fn bearer_headers_are_masked() {
        let out = redact("Authorization: Bearer abc.def.ghi-jkl");
        assert!(!out.contains("abc.def"));
    }

    #[test]
    fn key_value_secrets_are_masked() {
        let out = redact(r#"retrying with api_key=sk-live-12345 password="hunter2""#);
        assert!(!out.contains("sk-live-12345"));
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn plain_text_is_untouched() {
        let line = "stage tts finished in 12.4s";
        assert_eq!(redact(line), line);
    }
}
