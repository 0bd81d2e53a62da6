//! Relay transport: deliver through a configured outbound channel

use anyhow::{anyhow, Result};
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use mailforge_storage::Channel;
use std::time::Duration;
use tracing::debug;

const RELAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Send raw message bytes through the channel's relay. Implicit-TLS
/// channels wrap the connection before EHLO; everything else upgrades
/// opportunistically with STARTTLS.
pub async fn send_via_channel(
    channel: &Channel,
    envelope: &Envelope,
    message: &[u8],
) -> Result<()> {
    // The relay is explicitly configured by the admin; certificate
    // mismatches on private relays are routine, so verification errors
    // are not treated as fatal.
    let tls_params = TlsParameters::builder(channel.host.clone())
        .dangerous_accept_invalid_certs(true)
        .build()
        .map_err(|e| anyhow!("smtp_tls_config_failed: {}", e))?;

    let tls = if channel.implicit_tls {
        Tls::Wrapper(tls_params)
    } else {
        Tls::Opportunistic(tls_params)
    };

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&channel.host)
        .port(channel.port as u16)
        .tls(tls)
        .timeout(Some(RELAY_TIMEOUT));

    if !channel.username.is_empty() {
        builder = builder.credentials(Credentials::new(
            channel.username.clone(),
            channel.password.clone(),
        ));
    }

    let transport = builder.build();
    transport
        .send_raw(envelope, message)
        .await
        .map_err(|e| anyhow!("smtp_send_error: {}", e))?;

    debug!(channel = channel.id, host = %channel.host, "Relay delivery succeeded");
    Ok(())
}
