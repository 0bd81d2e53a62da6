//! Direct delivery: resolve the recipient's MX and speak SMTP on port 25

use anyhow::{anyhow, Result};
use lettre::address::Envelope;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::time::Duration;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

const DIRECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve MX hosts for a domain, sorted by preference ascending. An
/// empty or failed lookup is a delivery failure; no network attempt is
/// made against a guessed host.
pub async fn resolve_mx(domain: &str) -> Result<Vec<String>> {
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

    let lookup = resolver
        .mx_lookup(domain)
        .await
        .map_err(|e| anyhow!("mx_lookup_failed: {}", e))?;

    let mut hosts: Vec<(u16, String)> = lookup
        .iter()
        .map(|r| {
            let host = r.exchange().to_string();
            (r.preference(), host.trim_end_matches('.').to_string())
        })
        .collect();

    if hosts.is_empty() {
        return Err(anyhow!("mx_lookup_failed: no MX records for {}", domain));
    }

    hosts.sort_by_key(|(pref, _)| *pref);
    Ok(hosts.into_iter().map(|(_, host)| host).collect())
}

/// Attempt delivery against each MX in preference order. The EHLO host
/// is the sender's domain, which is what SPF alignment checks expect
/// when sending from a subdomain. STARTTLS is taken when advertised with
/// certificate verification disabled: the value is encryption in
/// transit, not endpoint authentication.
pub async fn send_direct(
    sender_domain: &str,
    recipient_domain: &str,
    envelope: &Envelope,
    message: &[u8],
) -> Result<()> {
    let hosts = resolve_mx(recipient_domain).await?;

    let mut last_error: Option<anyhow::Error> = None;

    for host in &hosts {
        match attempt_host(host, sender_domain, envelope, message).await {
            Ok(()) => {
                debug!(mx = %host, "Direct delivery succeeded");
                return Ok(());
            }
            Err(e) => {
                warn!(mx = %host, error = %e, "Direct delivery attempt failed");
                last_error = Some(e);
            }
        }
    }

    let last = last_error.unwrap_or_else(|| anyhow!("no MX host reachable"));
    if last.to_string().contains("timeout") || last.to_string().contains("timed out") {
        return Err(anyhow!(
            "direct_send_failed: {} (outbound port 25 is likely blocked)",
            last
        ));
    }
    Err(anyhow!("direct_send_failed: {}", last))
}

async fn attempt_host(
    host: &str,
    sender_domain: &str,
    envelope: &Envelope,
    message: &[u8],
) -> Result<()> {
    let tls_params = TlsParameters::builder(host.to_string())
        .dangerous_accept_invalid_certs(true)
        .dangerous_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| anyhow!("tls config: {}", e))?;

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        .port(25)
        .tls(Tls::Opportunistic(tls_params))
        .timeout(Some(DIRECT_TIMEOUT));

    if !sender_domain.is_empty() {
        builder = builder.hello_name(ClientId::Domain(sender_domain.to_string()));
    }

    let transport = builder.build();
    transport
        .send_raw(envelope, message)
        .await
        .map_err(|e| anyhow!("{}", e))?;
    Ok(())
}
