//! Request URL parsing, layered on the `url` crate with this library's own
//! default-port and empty-path rules (`spec.md` §4.6) on top. Grounded on
//! `url`'s appearance in `salvo`'s and `cpkb-bluezoo-tagliacarte`'s
//! dependency tables for exactly this scheme/host/port/path split.

use crate::errors::ClientErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scheme {
    Http,
    Https,
}

/// A request URL, resolved against a base when following a redirect.
#[derive(Debug, Clone)]
pub(crate) struct RequestUrl {
    inner: url::Url,
    scheme: Scheme,
    port: u16,
}

impl RequestUrl {
    pub(crate) fn parse(raw: &str) -> Result<Self, ClientErrorKind> {
        let inner = url::Url::parse(raw)?;
        Self::from_url(inner)
    }

    fn from_url(inner: url::Url) -> Result<Self, ClientErrorKind> {
        let scheme = match inner.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(ClientErrorKind::UnsupportedScheme),
        };
        if inner.host_str().is_none() {
            return Err(ClientErrorKind::InvalidUrl(url::ParseError::EmptyHost));
        }
        let port = inner.port_or_known_default().unwrap_or(match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        });
        Ok(Self { inner, scheme, port })
    }

    pub(crate) fn host(&self) -> &str {
        // Checked present in `from_url`.
        self.inner.host_str().unwrap_or("")
    }

    pub(crate) const fn port(&self) -> u16 {
        self.port
    }

    pub(crate) const fn is_tls(&self) -> bool {
        matches!(self.scheme, Scheme::Https)
    }

    pub(crate) fn is_default_port(&self) -> bool {
        matches!((self.scheme, self.port), (Scheme::Http, 80) | (Scheme::Https, 443))
    }

    /// Pool key: lowercase host, port, TLS flag (`spec.md` §4.6 Acquire).
    pub(crate) fn pool_key(&self) -> (String, u16, bool) {
        (self.host().to_ascii_lowercase(), self.port, self.is_tls())
    }

    /// Request target: path (defaulting to `/` when empty) plus query.
    pub(crate) fn path_and_query(&self) -> String {
        let path = self.inner.path();
        let mut out = if path.is_empty() { "/".to_string() } else { path.to_string() };
        if let Some(query) = self.inner.query() {
            out.push('?');
            out.push_str(query);
        }
        out
    }

    /// Resolves a redirect `Location` header against this URL per RFC 3986.
    pub(crate) fn resolve(&self, location: &[u8]) -> Result<Self, ClientErrorKind> {
        let location = std::str::from_utf8(location).map_err(|_| ClientErrorKind::InvalidRedirectLocation)?;
        let joined = self.inner.join(location).map_err(|_| ClientErrorKind::InvalidRedirectLocation)?;
        Self::from_url(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_port_and_path() {
        let url = RequestUrl::parse("http://Example.com").unwrap();
        assert_eq!(url.port(), 80);
        assert_eq!(url.path_and_query(), "/");
        assert_eq!(url.pool_key(), ("example.com".to_string(), 80, false));
    }

    #[test]
    fn https_defaults_to_443() {
        let url = RequestUrl::parse("https://example.com/a?b=1").unwrap();
        assert_eq!(url.port(), 443);
        assert!(url.is_tls());
        assert_eq!(url.path_and_query(), "/a?b=1");
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let err = RequestUrl::parse("ftp://example.com").unwrap_err();
        assert!(matches!(err, ClientErrorKind::UnsupportedScheme));
    }

    #[test]
    fn resolves_relative_redirect() {
        let base = RequestUrl::parse("http://example.com/old/path").unwrap();
        let next = base.resolve(b"/new").unwrap();
        assert_eq!(next.path_and_query(), "/new");
        assert_eq!(next.host(), "example.com");
    }
}
