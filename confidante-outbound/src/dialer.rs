use std::net::SocketAddr;

use anyhow::{Error, anyhow};
use futures::{FutureExt, future::select_ok};
use hickory_resolver::{
    IntoName, TokioAsyncResolver, config::LookupIpStrategy, name_server::TokioConnectionProvider,
};
use tokio::net::TcpStream;
use tracing::debug;

const S2S_SRV_SERVICE: &str = "_xmpp-server._tcp";
const S2S_FALLBACK_PORT: u16 = 5269;

/// Resolves `_xmpp-server._tcp.<domain>` SRV records and dials the first
/// reachable target, falling back to A/AAAA on the default s2s port when no
/// SRV records exist.
pub async fn dial(remote_domain: &str) -> Result<TcpStream, Error> {
    if let Ok(addr) = remote_domain.parse::<std::net::IpAddr>() {
        debug!(%addr, port = S2S_FALLBACK_PORT, "dialing literal address");
        return Ok(TcpStream::connect(SocketAddr::new(addr, S2S_FALLBACK_PORT)).await?);
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()?;

    let srv_name = format!("{}.{}.", S2S_SRV_SERVICE, remote_domain).into_name()?;
    match resolver.srv_lookup(srv_name.clone()).await {
        Ok(lookup) => {
            let mut targets: Vec<_> = lookup.iter().collect();
            targets.sort_by_key(|srv| (srv.priority(), std::cmp::Reverse(srv.weight())));

            for srv in targets {
                let target = srv.target().to_ascii();
                debug!(%target, port = srv.port(), "dialing s2s SRV target");
                match dial_host(&target, srv.port()).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) => debug!(%err, %target, "s2s SRV target unreachable"),
                }
            }

            Err(anyhow!(
                "remote-connection-failed: no reachable SRV target for {remote_domain}"
            ))
        }
        Err(err) => {
            debug!(%err, %remote_domain, "no SRV records, falling back to A/AAAA");
            dial_host(remote_domain, S2S_FALLBACK_PORT).await
        }
    }
}

async fn dial_host(host: &str, port: u16) -> Result<TcpStream, Error> {
    if let Ok(addr) = host.parse::<std::net::IpAddr>() {
        return Ok(TcpStream::connect(SocketAddr::new(addr, port)).await?);
    }

    let (config, mut options) = hickory_resolver::system_conf::read_system_conf()?;
    options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
    let resolver = TokioAsyncResolver::new(config, options, TokioConnectionProvider::default());

    let ips = resolver.lookup_ip(host).await?;

    // Happy Eyeballs: race all addresses, first to connect wins.
    select_ok(
        ips.into_iter()
            .map(|ip| TcpStream::connect(SocketAddr::new(ip, port)).boxed()),
    )
    .await
    .map(|(stream, _)| stream)
    .map_err(|err| anyhow!("remote-connection-failed: {err}"))
}
