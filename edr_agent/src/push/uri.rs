//! Push-channel target parsing: `ws(s)://host[:port][/path]`.

use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl PushTarget {
    pub fn parse(uri: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidUri(uri.to_string());
        let url = Url::parse(uri.trim()).map_err(|_| invalid())?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            _ => return Err(invalid()),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(invalid)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port()
            .unwrap_or(if secure { 443 } else { 80 });
        let mut path = match url.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        Ok(Self {
            secure,
            host,
            port,
            path,
        })
    }

    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{scheme}://{host}:{}{}", self.port, self.path)
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
