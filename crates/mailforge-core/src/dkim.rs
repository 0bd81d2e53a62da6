//! DKIM (DomainKeys Identified Mail) signing
//!
//! Implements the signing half of RFC 6376: RSA-SHA256 with
//! relaxed/relaxed canonicalization, which is what every major receiver
//! expects from small senders.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// DKIM canonicalization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Canonicalization {
    Simple,
    #[default]
    Relaxed,
}

/// DKIM signing configuration
#[derive(Debug, Clone)]
pub struct DkimSigningConfig {
    /// Domain name (d= tag)
    pub domain: String,
    /// Selector (s= tag)
    pub selector: String,
    /// Private key (PEM format)
    pub private_key_pem: String,
    /// Header canonicalization
    pub header_canon: Canonicalization,
    /// Body canonicalization
    pub body_canon: Canonicalization,
    /// Headers to sign
    pub headers_to_sign: Vec<String>,
}

impl DkimSigningConfig {
    pub fn new(domain: impl Into<String>, selector: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            private_key_pem: private_key_pem.into(),
            header_canon: Canonicalization::Relaxed,
            body_canon: Canonicalization::Relaxed,
            headers_to_sign: vec![
                "from".to_string(),
                "to".to_string(),
                "subject".to_string(),
                "date".to_string(),
                "message-id".to_string(),
                "mime-version".to_string(),
                "content-type".to_string(),
            ],
        }
    }
}

/// DKIM signer for outgoing mail
pub struct DkimSigner {
    config: DkimSigningConfig,
    signing_key: SigningKey<Sha256>,
}

impl DkimSigner {
    /// Create a new DKIM signer
    pub fn new(config: DkimSigningConfig) -> Result<Self> {
        let private_key = parse_rsa_private_key(&config.private_key_pem)?;
        let signing_key = SigningKey::<Sha256>::new(private_key);

        Ok(Self {
            config,
            signing_key,
        })
    }

    /// Sign a message and return the full message bytes with the
    /// DKIM-Signature header prepended.
    pub fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        let header_value = self.sign(message)?;
        let mut signed = Vec::with_capacity(message.len() + header_value.len() + 32);
        signed.extend_from_slice(b"DKIM-Signature: ");
        signed.extend_from_slice(header_value.as_bytes());
        signed.extend_from_slice(b"\r\n");
        signed.extend_from_slice(message);
        Ok(signed)
    }

    /// Sign a message and return the DKIM-Signature header value
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let (headers, body) = split_message(message)?;

        let canon_body = canonicalize_body(&body, self.config.body_canon);
        let body_hash = Sha256::digest(&canon_body);
        let body_hash_b64 = BASE64.encode(body_hash);

        let timestamp = chrono::Utc::now().timestamp();
        let canon = format!(
            "{}/{}",
            canon_name(self.config.header_canon),
            canon_name(self.config.body_canon)
        );

        let signed_headers: Vec<String> = self
            .config
            .headers_to_sign
            .iter()
            .filter(|h| headers.contains_key(&h.to_lowercase()))
            .cloned()
            .collect();

        let mut dkim_header = format!(
            "v=1; a=rsa-sha256; c={}; d={}; s={}; t={}; h={}; bh={}; b=",
            canon,
            self.config.domain,
            self.config.selector,
            timestamp,
            signed_headers.join(":"),
            body_hash_b64
        );

        let canon_headers = self.canonicalize_headers(&headers, &signed_headers, &dkim_header);

        let signature = self.signing_key.sign(canon_headers.as_bytes());
        let signature_b64 = BASE64.encode(signature.to_bytes().as_ref());

        dkim_header.push_str(&signature_b64);

        Ok(dkim_header)
    }

    /// Canonicalize headers for signing
    fn canonicalize_headers(
        &self,
        headers: &HashMap<String, String>,
        signed_headers: &[String],
        dkim_header: &str,
    ) -> String {
        let mut result = String::new();

        for header_name in signed_headers {
            if let Some(value) = headers.get(&header_name.to_lowercase()) {
                match self.config.header_canon {
                    Canonicalization::Simple => {
                        result.push_str(header_name);
                        result.push_str(": ");
                        result.push_str(value);
                        result.push_str("\r\n");
                    }
                    Canonicalization::Relaxed => {
                        result.push_str(&header_name.to_lowercase());
                        result.push(':');
                        let value = value.replace("\r\n", "").replace('\t', " ");
                        let value: String = value.split_whitespace().collect::<Vec<_>>().join(" ");
                        result.push_str(&value);
                        result.push_str("\r\n");
                    }
                }
            }
        }

        // The DKIM-Signature header itself, without trailing CRLF.
        match self.config.header_canon {
            Canonicalization::Simple => {
                result.push_str("DKIM-Signature: ");
                result.push_str(dkim_header);
            }
            Canonicalization::Relaxed => {
                result.push_str("dkim-signature:");
                let value: String = dkim_header.split_whitespace().collect::<Vec<_>>().join(" ");
                result.push_str(&value);
            }
        }

        result
    }
}

/// The TXT record value expected at `<selector>._domainkey.<domain>`.
pub fn dns_txt_record(public_key_pem: &str) -> Result<String> {
    use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
    use rsa::RsaPublicKey;

    let key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| anyhow!("Failed to parse DKIM public key: {}", e))?;
    let der = key
        .to_public_key_der()
        .map_err(|e| anyhow!("Failed to encode DKIM public key: {}", e))?;
    Ok(format!("v=DKIM1; k=rsa; p={}", BASE64.encode(der.as_bytes())))
}

/// Parse an RSA private key from PEM, accepting PKCS#8 and legacy PKCS#1.
fn parse_rsa_private_key(pem: &str) -> Result<RsaPrivateKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(key);
    }
    RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| anyhow!("Failed to parse RSA private key: {}", e))
}

/// Split message into headers (folded, lowercased names) and body
fn split_message(message: &[u8]) -> Result<(HashMap<String, String>, String)> {
    let message_str = String::from_utf8_lossy(message);
    let mut headers = HashMap::new();

    let parts: Vec<&str> = message_str.splitn(2, "\r\n\r\n").collect();
    let (header_section, body) = if parts.len() == 2 {
        (parts[0], parts[1])
    } else {
        let parts: Vec<&str> = message_str.splitn(2, "\n\n").collect();
        if parts.len() == 2 {
            (parts[0], parts[1])
        } else {
            return Err(anyhow!("Could not find header/body separator"));
        }
    };

    let mut current_name = String::new();
    let mut current_value = String::new();

    for line in header_section.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            current_value.push(' ');
            current_value.push_str(line.trim());
        } else if let Some(colon_pos) = line.find(':') {
            if !current_name.is_empty() {
                headers.insert(current_name.to_lowercase(), current_value);
            }
            current_name = line[..colon_pos].to_string();
            current_value = line[colon_pos + 1..].trim().to_string();
        }
    }

    if !current_name.is_empty() {
        headers.insert(current_name.to_lowercase(), current_value);
    }

    Ok((headers, body.to_string()))
}

/// Canonicalize a message body
fn canonicalize_body(body: &str, canon: Canonicalization) -> Vec<u8> {
    match canon {
        Canonicalization::Simple => {
            let mut result = body.replace('\n', "\r\n");
            while result.ends_with("\r\n\r\n") {
                result.truncate(result.len() - 2);
            }
            if !result.ends_with("\r\n") {
                result.push_str("\r\n");
            }
            result.into_bytes()
        }
        Canonicalization::Relaxed => {
            let mut lines: Vec<String> = body
                .lines()
                .map(|line| {
                    let mut result = String::new();
                    let mut last_was_space = false;
                    for c in line.chars() {
                        if c.is_whitespace() {
                            if !last_was_space {
                                result.push(' ');
                                last_was_space = true;
                            }
                        } else {
                            result.push(c);
                            last_was_space = false;
                        }
                    }
                    result.trim_end().to_string()
                })
                .collect();

            while lines.last().map_or(false, |l| l.is_empty()) {
                lines.pop();
            }

            let mut result = lines.join("\r\n");
            if !result.is_empty() {
                result.push_str("\r\n");
            }
            result.into_bytes()
        }
    }
}

fn canon_name(canon: Canonicalization) -> &'static str {
    match canon {
        Canonicalization::Simple => "simple",
        Canonicalization::Relaxed => "relaxed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailforge_common::config::generate_dkim_keypair;

    const MESSAGE: &[u8] = b"From: sender@example.org\r\nTo: rcpt@a.test\r\nSubject: Test\r\nDate: Mon, 1 Jan 2024 00:00:00 +0000\r\n\r\nHello world.\r\n";

    #[test]
    fn test_split_message() {
        let (headers, body) = split_message(MESSAGE).unwrap();
        assert_eq!(headers.get("from"), Some(&"sender@example.org".to_string()));
        assert_eq!(headers.get("subject"), Some(&"Test".to_string()));
        assert_eq!(body, "Hello world.\r\n");
    }

    #[test]
    fn test_relaxed_body_canonicalization() {
        let canon = canonicalize_body("line  with\t spaces  \n\n\n", Canonicalization::Relaxed);
        assert_eq!(canon, b"line with spaces\r\n");
    }

    #[test]
    fn test_sign_produces_expected_tags() {
        let (private_pem, _) = generate_dkim_keypair().unwrap();
        let signer = DkimSigner::new(DkimSigningConfig::new(
            "example.org",
            "mail",
            private_pem,
        ))
        .unwrap();

        let header = signer.sign(MESSAGE).unwrap();
        assert!(header.starts_with("v=1; a=rsa-sha256; c=relaxed/relaxed;"));
        assert!(header.contains("d=example.org;"));
        assert!(header.contains("s=mail;"));
        assert!(header.contains("h=from:to:subject:date;"));
        assert!(header.contains("bh="));
        assert!(!header.ends_with("b="));
    }

    #[test]
    fn test_sign_message_prepends_header() {
        let (private_pem, _) = generate_dkim_keypair().unwrap();
        let signer =
            DkimSigner::new(DkimSigningConfig::new("example.org", "mail", private_pem)).unwrap();

        let signed = signer.sign_message(MESSAGE).unwrap();
        assert!(signed.starts_with(b"DKIM-Signature: v=1;"));
        assert!(signed.ends_with(MESSAGE));
    }

    #[test]
    fn test_dns_txt_record() {
        let (_, public_pem) = generate_dkim_keypair().unwrap();
        let record = dns_txt_record(&public_pem).unwrap();
        assert!(record.starts_with("v=DKIM1; k=rsa; p="));
    }
}
