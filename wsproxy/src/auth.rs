use url::form_urlencoded;

pub const PASSWORD_PARAM: &str = "password";

/// Checks the tunnel upgrade password carried in the request's query string.
///
/// Plain string equality. When no password is configured every request passes.
pub fn authorize(expected: Option<&str>, query: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let provided = query.and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == PASSWORD_PARAM)
            .map(|(_, value)| value.into_owned())
    });
    provided.as_deref() == Some(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_when_unset() {
        assert!(authorize(None, None));
        assert!(authorize(None, Some("password=anything")));
    }

    #[test]
    fn test_password_must_match() {
        assert!(authorize(Some("s3cret"), Some("password=s3cret")));
        assert!(authorize(Some("a b"), Some("x=1&password=a%20b")));
        assert!(!authorize(Some("s3cret"), Some("password=nope")));
        assert!(!authorize(Some("s3cret"), Some("other=s3cret")));
        assert!(!authorize(Some("s3cret"), None));
    }
}
