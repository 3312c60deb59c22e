use anyhow::Result;
use http::HeaderMap;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// A parsed trust-proxy rule.
#[derive(Debug, Clone)]
enum TrustRule {
    Loopback,
    LinkLocal,
    UniqueLocal,
    Network(IpNetwork),
}

impl TrustRule {
    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            TrustRule::Loopback => ip.is_loopback(),
            TrustRule::LinkLocal => match ip {
                IpAddr::V4(v4) => v4.is_link_local(),
                // fe80::/10
                IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            },
            TrustRule::UniqueLocal => match ip {
                IpAddr::V4(v4) => v4.is_private(),
                // fc00::/7
                IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
            },
            TrustRule::Network(net) => net.contains(ip),
        }
    }
}

/// Trust-proxy evaluation per the platform rules: the configured tokens
/// name which direct peers are trusted; only then are forwarded headers
/// honored, and the effective client is the rightmost `X-Forwarded-For`
/// entry that is itself untrusted.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    rules: Vec<TrustRule>,
}

/// Resolution result: the effective client address and, when forwarded
/// headers were honored, the forwarded protocol.
#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedClient {
    pub ip: IpAddr,
    pub forwarded_proto: Option<String>,
}

impl TrustedProxies {
    /// Parse config tokens: IP literals, CIDR blocks, or the literals
    /// `loopback`, `linklocal`, `uniquelocal`.
    pub fn parse(tokens: &[String]) -> Result<Self> {
        let mut rules = Vec::with_capacity(tokens.len());
        for token in tokens {
            let rule = match token.as_str() {
                "loopback" => TrustRule::Loopback,
                "linklocal" => TrustRule::LinkLocal,
                "uniquelocal" => TrustRule::UniqueLocal,
                other => {
                    let net: IpNetwork = other
                        .parse()
                        .map_err(|e| anyhow::anyhow!("bad trust_proxy token '{}': {}", other, e))?;
                    TrustRule::Network(net)
                }
            };
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.rules.iter().any(|r| r.matches(ip))
    }

    /// Derive the effective client for a request from `peer`.
    ///
    /// Untrusted peer: forwarded headers are ignored entirely. Trusted
    /// peer: walk `X-Forwarded-For` right to left, skipping trusted hops;
    /// the first untrusted entry is the client (if every entry is trusted,
    /// the leftmost wins). Protocol comes from `X-Forwarded-Proto`.
    pub fn resolve_client(&self, peer: IpAddr, headers: &HeaderMap) -> ResolvedClient {
        if !self.is_trusted(peer) {
            return ResolvedClient {
                ip: peer,
                forwarded_proto: None,
            };
        }

        let forwarded: Vec<IpAddr> = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .filter_map(|part| part.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        let ip = forwarded
            .iter()
            .rev()
            .find(|entry| !self.is_trusted(**entry))
            .or_else(|| forwarded.first())
            .copied()
            .unwrap_or(peer);

        let forwarded_proto = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        ResolvedClient {
            ip,
            forwarded_proto,
        }
    }
}
