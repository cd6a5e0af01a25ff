//! Client-side configuration for a newly added peer.

use serde::Serialize;
use std::net::Ipv4Addr;

/// Values shared by every client profile this server hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub dns: String,
    pub allowed_ips: String,
    pub persistent_keepalive: u16,
    /// Public host clients dial. Without it the `Endpoint` line is left out
    /// and has to be filled in by hand.
    pub endpoint_host: Option<String>,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            dns: "8.8.8.8, 1.1.1.1".to_string(),
            allowed_ips: "0.0.0.0/0, ::/0".to_string(),
            persistent_keepalive: 25,
            endpoint_host: None,
        }
    }
}

/// Everything that differs between two client profiles.
#[derive(Debug, Clone)]
pub struct ClientConfig<'a> {
    pub private_key: &'a str,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub server_public_key: &'a str,
    pub listen_port: Option<u16>,
}

/// Rendered profile, ready to be written to `<name>.conf`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedClient {
    pub name: String,
    pub address: String,
    pub config: String,
}

pub fn render_client_config(profile: &ClientProfile, client: &ClientConfig<'_>) -> String {
    let endpoint = profile
        .endpoint_host
        .as_deref()
        .map(|host| format!("Endpoint = {}:{}\n", host, client.listen_port.unwrap_or(51820)))
        .unwrap_or_default();
    format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {address}/{prefix_len}\n\
         DNS = {dns}\n\
         \n\
         [Peer]\n\
         PublicKey = {server_public_key}\n\
         {endpoint}\
         AllowedIPs = {allowed_ips}\n\
         PersistentKeepalive = {keepalive}\n",
        private_key = client.private_key,
        address = client.address,
        prefix_len = client.prefix_len,
        dns = profile.dns,
        server_public_key = client.server_public_key,
        endpoint = endpoint,
        allowed_ips = profile.allowed_ips,
        keepalive = profile.persistent_keepalive,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientConfig<'static> {
        ClientConfig {
            private_key: "cPRIVATE",
            address: Ipv4Addr::new(10, 8, 0, 4),
            prefix_len: 24,
            server_public_key: "sPUBLIC",
            listen_port: Some(51821),
        }
    }

    #[test]
    fn test_render_with_endpoint() {
        let profile = ClientProfile {
            endpoint_host: Some("vpn.example.com".to_string()),
            ..Default::default()
        };
        let text = render_client_config(&profile, &client());
        assert_eq!(
            text,
            "[Interface]\n\
             PrivateKey = cPRIVATE\n\
             Address = 10.8.0.4/24\n\
             DNS = 8.8.8.8, 1.1.1.1\n\
             \n\
             [Peer]\n\
             PublicKey = sPUBLIC\n\
             Endpoint = vpn.example.com:51821\n\
             AllowedIPs = 0.0.0.0/0, ::/0\n\
             PersistentKeepalive = 25\n"
        );
    }

    #[test]
    fn test_render_without_endpoint() {
        let text = render_client_config(&ClientProfile::default(), &client());
        assert!(!text.contains("Endpoint"));
        assert!(text.contains("PublicKey = sPUBLIC\nAllowedIPs = 0.0.0.0/0, ::/0\n"));
        assert!(text.ends_with("PersistentKeepalive = 25\n"));
    }

    #[test]
    fn test_endpoint_defaults_to_standard_port() {
        let profile = ClientProfile {
            endpoint_host: Some("203.0.113.7".to_string()),
            ..Default::default()
        };
        let client = ClientConfig {
            listen_port: None,
            ..client()
        };
        let text = render_client_config(&profile, &client);
        assert!(text.contains("\nEndpoint = 203.0.113.7:51820\nAllowedIPs"));
    }
}
