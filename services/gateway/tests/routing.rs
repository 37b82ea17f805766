
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use craftgate_gateway::metadata::{Metadata, NextState};
use craftgate_gateway::proxy::{CustomRule, CustomRuleRegistry, Router, SystemDialer};
use craftgate_gateway::{ConfigError, Root};
use craftgate_networking::BufferPool;
use harness::{handshake, login_start, read_all, GatewayHandle, MinecraftBackend, TcpEchoBackend, TlsBackend};
use rustls::pki_types::{CertificateDer, ServerName};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

#[tokio::test]
async fn default_outbound_relays_to_service_target() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let root = Root::from_json(
        &json!({
            "services": [{
                "name": "raw",
                "listen": 0,
                "bind_address": "127.0.0.1",
                "target_address": backend.addr.ip().to_string(),
                "target_port": backend.addr.port(),
            }],
        })
        .to_string(),
    )
    .unwrap();
    let gateway = GatewayHandle::spawn(root).await.unwrap();

    assert_eq!(roundtrip(gateway.addr("raw"), b"hello gateway").await, b"hello gateway");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn hostname_rules_pick_outbounds() {
    let lobby = MinecraftBackend::spawn(b"welcome").await.unwrap();
    let survival = MinecraftBackend::spawn(b"welcome").await.unwrap();
    let root = Root::from_json(
        &json!({
            "services": [{ "name": "mc", "listen": 0, "bind_address": "127.0.0.1" }],
            "router": {
                "default_outbound": "REJECT",
                "rules": [
                    {
                        "type": "minecraft_hostname",
                        "parameter": { "domain": "lobby.example.com" },
                        "sniff": "minecraft",
                        "outbound": "lobby",
                    },
                    {
                        "type": "minecraft_hostname",
                        "parameter": { "domain_suffix": "survival.example.com" },
                        "sniff": ["minecraft"],
                        "outbound": "survival",
                    },
                ],
            },
            "outbounds": [
                {
                    "name": "lobby",
                    "target_address": lobby.addr.ip().to_string(),
                    "target_port": lobby.addr.port(),
                    "minecraft": {},
                },
                {
                    "name": "survival",
                    "target_address": survival.addr.ip().to_string(),
                    "target_port": survival.addr.port(),
                    "minecraft": {},
                },
            ],
        })
        .to_string(),
    )
    .unwrap();
    let gateway = GatewayHandle::spawn(root).await.unwrap();

    for host in ["lobby.example.com", "eu.survival.example.com"] {
        let mut client = TcpStream::connect(gateway.addr("mc")).await.unwrap();
        let mut request = handshake(47, host, 25565, NextState::Login);
        request.extend_from_slice(&login_start("Steve"));
        client.write_all(&request).await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
    }
    assert_eq!(lobby.wait_for(1).await.handshake.address, "lobby.example.com");
    assert_eq!(survival.wait_for(1).await.handshake.address, "eu.survival.example.com");

    // No rule matches: the REJECT default closes the connection.
    let mut client = TcpStream::connect(gateway.addr("mc")).await.unwrap();
    let mut request = handshake(47, "unknown.example.com", 25565, NextState::Login);
    request.extend_from_slice(&login_start("Steve"));
    client.write_all(&request).await.unwrap();
    assert_eq!(read_all(&mut client).await, b"");
    assert_eq!(lobby.count().await, 1);
    assert_eq!(survival.count().await, 1);
}

#[tokio::test]
async fn rewrite_redirects_plain_outbound() {
    let decoy = TcpEchoBackend::spawn().await.unwrap();
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let root = Root::from_json(
        &json!({
            "services": [{
                "name": "raw",
                "listen": 0,
                "bind_address": "127.0.0.1",
                "target_address": decoy.addr.ip().to_string(),
                "target_port": decoy.addr.port(),
            }],
            "router": {
                "rules": [{
                    "type": "service_name",
                    "parameter": "raw",
                    "rewrite": {
                        "target_address": backend.addr.ip().to_string(),
                        "target_port": backend.addr.port(),
                    },
                    "outbound": "direct",
                }],
            },
            "outbounds": [{ "name": "direct" }],
        })
        .to_string(),
    )
    .unwrap();
    let gateway = GatewayHandle::spawn(root).await.unwrap();

    assert_eq!(roundtrip(gateway.addr("raw"), b"redirected").await, b"redirected");
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(decoy.connection_count(), 0);
}

#[tokio::test]
async fn non_minecraft_traffic_falls_through() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let root = Root::from_json(
        &json!({
            "services": [{
                "name": "mixed",
                "listen": 0,
                "bind_address": "127.0.0.1",
                "target_address": backend.addr.ip().to_string(),
                "target_port": backend.addr.port(),
            }],
            "router": {
                "rules": [{
                    "type": "minecraft_hostname",
                    "parameter": { "domain": "play.example.com" },
                    "sniff": "minecraft",
                    "outbound": "REJECT",
                }],
            },
        })
        .to_string(),
    )
    .unwrap();
    let gateway = GatewayHandle::spawn(root).await.unwrap();

    // Sniffed as a Minecraft packet this has the wrong packet id.
    let payload = b"GET / HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\nAccept: */*\r\nConnection: close\r\n\r\n";
    assert_eq!(roundtrip(gateway.addr("mixed"), payload).await, payload.to_vec());
}

#[tokio::test]
async fn tls_server_name_routes_via_custom_rule() {
    let alpha = TlsBackend::spawn("alpha.example.com", b"alpha").await.unwrap();
    let beta = TlsBackend::spawn("beta.example.com", b"beta").await.unwrap();

    let mut custom = CustomRuleRegistry::new();
    custom.register("sni", |parameter, _lists| {
        let wanted = parameter
            .as_str()
            .ok_or_else(|| ConfigError::InvalidParameter {
                rule_type: "custom:sni".to_string(),
                reason: "expected a host name".to_string(),
            })?
            .to_string();
        let rule = move |metadata: &Metadata| {
            metadata
                .tls
                .as_ref()
                .and_then(|tls| tls.server_name.as_deref())
                == Some(wanted.as_str())
        };
        Ok(Arc::new(rule) as Arc<dyn CustomRule>)
    });
    let router = Router::new(
        Arc::new(SystemDialer::default()),
        Arc::new(BufferPool::with_defaults()),
    )
    .with_custom_rules(custom);

    let root = Root::from_json(
        &json!({
            "services": [{ "name": "tls", "listen": 0, "bind_address": "127.0.0.1" }],
            "router": {
                "default_outbound": "RESET",
                "rules": [
                    { "type": "custom:sni", "parameter": "alpha.example.com", "sniff": "tls", "outbound": "alpha" },
                    { "type": "custom:sni", "parameter": "beta.example.com", "sniff": "tls", "outbound": "beta" },
                ],
            },
            "outbounds": [
                {
                    "name": "alpha",
                    "target_address": alpha.addr.ip().to_string(),
                    "target_port": alpha.addr.port(),
                },
                {
                    "name": "beta",
                    "target_address": beta.addr.ip().to_string(),
                    "target_port": beta.addr.port(),
                },
            ],
        })
        .to_string(),
    )
    .unwrap();
    let gateway = GatewayHandle::spawn_with_router(root, router).await.unwrap();

    for (host, cert, marker) in [
        ("alpha.example.com", &alpha.cert_der, &b"alpha"[..]),
        ("beta.example.com", &beta.cert_der, &b"beta"[..]),
    ] {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(CertificateDer::from(cert.clone())).unwrap();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect(gateway.addr("tls")).await.unwrap();
        let server_name = ServerName::try_from(host.to_string()).unwrap();
        let mut tls = timeout(Duration::from_secs(5), connector.connect(server_name, tcp))
            .await
            .unwrap()
            .unwrap();
        tls.write_all(b"hi").await.unwrap();
        let mut response = Vec::new();
        let _ = timeout(Duration::from_secs(5), tls.read_to_end(&mut response)).await;
        assert_eq!(response, marker);
    }
}
