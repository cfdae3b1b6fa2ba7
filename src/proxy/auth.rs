use base64::Engine;
use std::fmt;

/// Expected Basic credentials. An empty password disables authentication.
#[derive(Clone)]
pub struct Credentials {
    expected: Option<String>,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        let expected = (!password.is_empty()).then(|| format!("{username}:{password}"));
        Self { expected }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    /// Whether a request carrying `header` as its `Authorization` may pass.
    pub fn allows(&self, header: Option<&str>) -> bool {
        match &self.expected {
            Some(expected) => check_auth(header, expected),
            None => true,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Validate a `Basic` authorization header against `username:password`.
///
/// Missing header, another scheme, bad base64 or non-UTF-8 all fail.
pub fn check_auth(header: Option<&str>, expected: &str) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Some((scheme, encoded)) = header.trim().split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }

    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .is_some_and(|decoded| decoded == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(raw: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    #[test]
    fn accepts_exact_credentials() {
        let header = basic("kasm_user:secret");
        assert!(check_auth(Some(&header), "kasm_user:secret"));
        assert!(check_auth(Some(&header.replace("Basic", "basic")), "kasm_user:secret"));
    }

    #[test]
    fn rejects_wrong_password() {
        let header = basic("kasm_user:wrongpass");
        assert!(!check_auth(Some(&header), "kasm_user:secret"));
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(!check_auth(None, "kasm_user:secret"));
        assert!(!check_auth(Some("Bearer abc"), "kasm_user:secret"));
        assert!(!check_auth(Some("Basic !!!not-base64"), "kasm_user:secret"));
        assert!(!check_auth(Some("Basic"), "kasm_user:secret"));
    }

    #[test]
    fn empty_password_disables_auth() {
        let open = Credentials::new("kasm_user", "");
        assert!(!open.is_enabled());
        assert!(open.allows(None));

        let closed = Credentials::new("kasm_user", "secret");
        assert!(closed.allows(Some(&basic("kasm_user:secret"))));
        assert!(!closed.allows(None));
    }

    #[test]
    fn debug_hides_password() {
        let rendered = format!("{:?}", Credentials::new("kasm_user", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
