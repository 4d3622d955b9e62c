// Remote access key parsing

//! `ss://` access keys
//!
//! Keys come from the remote authority in SIP002 form
//! (`ss://BASE64(method:password)@host:port[/?plugin][#tag]`), with the plain
//! `method:password@` userinfo also accepted. The engine wants a literal
//! endpoint address, so [`substitute_host_literal`] resolves a hostname once
//! before the key is handed over.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

const SCHEME: &str = "ss://";

/// Parsed access key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKey {
    /// Cipher name
    pub method: String,
    /// Cipher password
    pub password: String,
    /// Server host name or address literal
    pub host: String,
    /// Server port
    pub port: u16,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    /// Raw fragment without the leading `#`
    pub tag: Option<String>,
    /// Userinfo exactly as it appeared, re-emitted by `Display`
    userinfo: String,
}

/// Whether the value looks like an access key at all
pub fn is_access_key(value: &str) -> bool {
    value.starts_with(SCHEME)
}

/// Decode standard or URL-safe base64, with or without padding
fn decode_lenient(encoded: &str) -> Result<String> {
    let normalized: String = encoded
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    let bytes = STANDARD_NO_PAD
        .decode(normalized.as_bytes())
        .context("Invalid base64 in access key")?;
    String::from_utf8(bytes).context("Access key userinfo is not UTF-8")
}

fn split_credentials(userinfo: &str) -> Result<(String, String)> {
    let (method, password) = userinfo
        .split_once(':')
        .context("Access key userinfo must be method:password")?;
    if method.is_empty() {
        anyhow::bail!("Access key cipher method cannot be empty");
    }
    Ok((method.to_string(), password.to_string()))
}

fn split_host_port(authority: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .context("Unterminated IPv6 literal in access key")?;
        let port = after
            .strip_prefix(':')
            .context("Access key is missing a port")?;
        (host, port)
    } else {
        authority
            .rsplit_once(':')
            .context("Access key is missing a port")?
    };

    if host.is_empty() {
        anyhow::bail!("Access key host cannot be empty");
    }
    let port: u16 = port.parse().context("Invalid access key port")?;
    Ok((host.to_string(), port))
}

impl FromStr for AccessKey {
    type Err = anyhow::Error;

    fn from_str(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .context("Access key must start with ss://")?;

        let (rest, tag) = match rest.split_once('#') {
            Some((rest, tag)) => (rest, Some(tag.to_string())),
            None => (rest, None),
        };

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query.to_string())),
            None => (rest, None),
        };
        let (userinfo, authority, credentials) = match rest.rsplit_once('@') {
            Some((userinfo, authority)) => {
                let plain = if userinfo.contains(':') {
                    userinfo.to_string()
                } else {
                    decode_lenient(userinfo)?
                };
                (
                    userinfo.to_string(),
                    authority.trim_end_matches('/').to_string(),
                    plain,
                )
            }
            None => {
                // Legacy form: the whole method:password@host:port is encoded
                let decoded = decode_lenient(rest)?;
                let (plain, authority) = decoded
                    .rsplit_once('@')
                    .context("Access key has no host part")?;
                (plain.to_string(), authority.to_string(), plain.to_string())
            }
        };

        let (method, password) = split_credentials(&credentials)?;
        let (host, port) = split_host_port(&authority)?;

        Ok(Self {
            method,
            password,
            host,
            port,
            query,
            tag,
            userinfo,
        })
    }
}

impl AccessKey {
    /// True when the host is already an IP literal
    pub fn has_literal_host(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Same key pointing at `ip`
    pub fn with_host(mut self, ip: IpAddr) -> Self {
        self.host = ip.to_string();
        self
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@", SCHEME, self.userinfo)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        write!(f, ":{}", self.port)?;
        if let Some(query) = &self.query {
            write!(f, "/?{}", query)?;
        }
        if let Some(tag) = &self.tag {
            write!(f, "#{}", tag)?;
        }
        Ok(())
    }
}

/// Replace a hostname endpoint with one resolved IP literal
///
/// Best effort: anything that fails to parse or resolve is returned unchanged.
/// IPv4 results are preferred.
pub async fn substitute_host_literal(uri: &str) -> String {
    let key = match uri.parse::<AccessKey>() {
        Ok(key) => key,
        Err(e) => {
            log::debug!("Not substituting host, key did not parse: {:#}", e);
            return uri.to_string();
        }
    };

    if key.has_literal_host() {
        return uri.to_string();
    }

    let addrs: Vec<IpAddr> = match tokio::net::lookup_host((key.host.as_str(), key.port)).await {
        Ok(addrs) => addrs.map(|addr| addr.ip()).collect(),
        Err(e) => {
            log::warn!("Failed to resolve endpoint {}: {}", key.host, e);
            return uri.to_string();
        }
    };

    let chosen = addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied();

    match chosen {
        Some(ip) => {
            log::info!("Resolved endpoint {} -> {}", key.host, ip);
            key.with_host(ip).to_string()
        }
        None => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const SIP002_KEY: &str =
        "ss://YWVzLTEyOC1nY206RWdpU2VjcmV0UGFzc3dvcmQyMDI2@159.223.1.1:8388";

    #[test]
    fn test_parse_sip002() {
        let key: AccessKey = SIP002_KEY.parse().unwrap();
        assert_eq!(key.method, "aes-128-gcm");
        assert_eq!(key.password, "EgiSecretPassword2026");
        assert_eq!(key.host, "159.223.1.1");
        assert_eq!(key.port, 8388);
        assert!(key.has_literal_host());
        assert_eq!(key.to_string(), SIP002_KEY);
    }

    #[test]
    fn test_parse_plain_userinfo_with_query_and_tag() {
        let key: AccessKey = "ss://chacha20-ietf-poly1305:pw@node.example.net:443/?plugin=obfs#Frankfurt"
            .parse()
            .unwrap();
        assert_eq!(key.method, "chacha20-ietf-poly1305");
        assert_eq!(key.password, "pw");
        assert_eq!(key.host, "node.example.net");
        assert_eq!(key.query.as_deref(), Some("plugin=obfs"));
        assert_eq!(key.tag.as_deref(), Some("Frankfurt"));
        assert!(!key.has_literal_host());
    }

    #[test]
    fn test_parse_url_safe_unpadded() {
        // Standard base64 of this userinfo contains '/' and a padding byte
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("aes-256-gcm:p>?~~");
        assert!(encoded.contains('_'));
        let key: AccessKey = format!("ss://{}@1.2.3.4:1000", encoded).parse().unwrap();
        assert_eq!(key.password, "p>?~~");
    }

    #[test]
    fn test_parse_legacy_whole_encoding() {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode("aes-128-gcm:pw@10.1.2.3:8388");
        let key: AccessKey = format!("ss://{}", encoded).parse().unwrap();
        assert_eq!(key.method, "aes-128-gcm");
        assert_eq!(key.host, "10.1.2.3");
        assert_eq!(key.port, 8388);
    }

    #[test]
    fn test_parse_ipv6() {
        let key: AccessKey = "ss://aes-128-gcm:pw@[2001:db8::1]:8388".parse().unwrap();
        assert_eq!(key.host, "2001:db8::1");
        assert!(key.has_literal_host());
        assert_eq!(key.to_string(), "ss://aes-128-gcm:pw@[2001:db8::1]:8388");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("http://example.com".parse::<AccessKey>().is_err());
        assert!("ss://aes-128-gcm:pw@host".parse::<AccessKey>().is_err());
        assert!("ss://aes-128-gcm:pw@host:notaport".parse::<AccessKey>().is_err());
        assert!("ss://!!!@host:1".parse::<AccessKey>().is_err());
        assert!("ss://:pw@host:1".parse::<AccessKey>().is_err());
    }

    #[test]
    fn test_with_host_keeps_everything_else() {
        let key: AccessKey = "ss://YWVzLTEyOC1nY206cHc@vpn.example.net:8388#tag"
            .parse()
            .unwrap();
        let rewritten = key.with_host(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(
            rewritten.to_string(),
            "ss://YWVzLTEyOC1nY206cHc@203.0.113.9:8388#tag"
        );
    }

    #[test]
    fn test_is_access_key() {
        assert!(is_access_key(SIP002_KEY));
        assert!(!is_access_key("vless://abc"));
        assert!(!is_access_key(""));
    }

    #[tokio::test]
    async fn test_substitute_leaves_literal_untouched() {
        assert_eq!(substitute_host_literal(SIP002_KEY).await, SIP002_KEY);
    }

    #[tokio::test]
    async fn test_substitute_leaves_garbage_untouched() {
        assert_eq!(substitute_host_literal("not a key").await, "not a key");
    }

    #[tokio::test]
    async fn test_substitute_resolves_localhost() {
        let out = substitute_host_literal("ss://YWVzLTEyOC1nY206cHc@localhost:8388").await;
        let key: AccessKey = out.parse().unwrap();
        assert!(key.has_literal_host());
        assert_eq!(key.port, 8388);
    }
}
