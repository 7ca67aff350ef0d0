use std::net::IpAddr;

use ipnet::IpNet;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use redub_core::{Config, RemoteAccessMode};

use crate::error::{PolicyError, PolicyResult};

/// Tailscale's CGNAT range plus loopback, the only peers admitted in
/// `tailscale` mode.
const TAILSCALE_CGNAT: &str = "100.64.0.0/10";

#[derive(Debug, Deserialize)]
struct AccessClaims {
    #[allow(dead_code)]
    sub: Option<String>,
    exp: i64,
}

/// The outermost request gate: decides whether a peer may talk to the
/// server at all, and which address counts as the client for rate
/// limiting and audit.
pub struct NetGate {
    mode: RemoteAccessMode,
    allowed_subnets: Vec<IpNet>,
    trusted_proxies: Vec<IpNet>,
    cgnat: IpNet,
    access_jwt_key: DecodingKey,
}

impl NetGate {
    pub fn new(config: &Config) -> Self {
        Self {
            mode: config.remote_access_mode,
            allowed_subnets: config.allowed_subnets.clone(),
            trusted_proxies: config.trusted_proxy_subnets.clone(),
            cgnat: TAILSCALE_CGNAT.parse().expect("static subnet parses"),
            access_jwt_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        }
    }

    /// The address rate limits and audits key on: the socket peer, unless
    /// the peer is a trusted proxy, in which case the first hop of the
    /// forwarded header is consulted.
    pub fn client_ip(&self, peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        if !self.is_trusted_proxy(peer) {
            return peer;
        }
        forwarded_for
            .and_then(|header| header.split(',').next())
            .and_then(|first| first.trim().parse().ok())
            .unwrap_or(peer)
    }

    fn is_trusted_proxy(&self, peer: IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(&peer))
    }

    /// Admit or refuse a connection per the remote-access mode.
    pub fn check(&self, peer: IpAddr, access_jwt: Option<&str>) -> PolicyResult<()> {
        match self.mode {
            RemoteAccessMode::Off => Ok(()),
            RemoteAccessMode::Tailscale => {
                let allowed = peer.is_loopback()
                    || self.cgnat.contains(&peer)
                    || self.allowed_subnets.iter().any(|net| net.contains(&peer));
                if allowed {
                    Ok(())
                } else {
                    Err(PolicyError::Gate(format!("peer {peer} outside tailnet")))
                }
            }
            RemoteAccessMode::Cloudflare => {
                let token = access_jwt
                    .ok_or_else(|| PolicyError::Gate("missing access token".into()))?;
                decode::<AccessClaims>(token, &self.access_jwt_key, &Validation::default())
                    .map_err(|_| PolicyError::Gate("access token rejected".into()))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn gate(mode: RemoteAccessMode, trusted: &[&str]) -> NetGate {
        let mut config = Config::dev_defaults(Path::new("/tmp/x"));
        config.remote_access_mode = mode;
        config.trusted_proxy_subnets = trusted.iter().map(|s| s.parse().unwrap()).collect();
        NetGate::new(&config)
    }

    #[test]
    fn off_mode_admits_everyone() {
        let gate = gate(RemoteAccessMode::Off, &[]);
        assert!(gate.check("203.0.113.9".parse().unwrap(), None).is_ok());
    }

    #[test]
    fn tailscale_mode_admits_cgnat_and_loopback_only() {
        let gate = gate(RemoteAccessMode::Tailscale, &[]);
        assert!(gate.check("100.101.5.9".parse().unwrap(), None).is_ok());
        assert!(gate.check("127.0.0.1".parse().unwrap(), None).is_ok());
        assert!(gate.check("203.0.113.9".parse().unwrap(), None).is_err());
    }

    #[test]
    fn forwarded_header_only_counts_from_trusted_proxies() {
        let gate = gate(RemoteAccessMode::Off, &["10.0.0.0/8"]);

        // Untrusted peer: the header is ignored.
        let ip = gate.client_ip(
            "203.0.113.9".parse().unwrap(),
            Some("198.51.100.7, 10.0.0.1"),
        );
        assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().unwrap());

        // Trusted proxy: the first forwarded hop wins.
        let ip = gate.client_ip("10.0.0.2".parse().unwrap(), Some("198.51.100.7, 10.0.0.1"));
        assert_eq!(ip, "198.51.100.7".parse::<IpAddr>().unwrap());

        // Trusted proxy with a garbage header falls back to the peer.
        let ip = gate.client_ip("10.0.0.2".parse().unwrap(), Some("not-an-ip"));
        assert_eq!(ip, "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn cloudflare_mode_requires_a_valid_access_jwt() {
        let gate = gate(RemoteAccessMode::Cloudflare, &[]);
        assert!(gate.check("203.0.113.9".parse().unwrap(), None).is_err());
        assert!(gate
            .check("203.0.113.9".parse().unwrap(), Some("junk"))
            .is_err());
    }
}
