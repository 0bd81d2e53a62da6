//! SMTP session handler
//!
//! Line-oriented session FSM: greet -> helo -> mail -> rcpt -> data,
//! with STARTTLS upgrade, size enforcement during DATA accumulation,
//! MIME parsing, inbox persistence, and rule-matched forwarding back
//! into the outbound queue.

use anyhow::Result;
use mailforge_common::types::EmailAddress;
use mailforge_common::Config;
use mailforge_storage::{
    AttachmentRepository, AttachmentStore, Database, ForwardLogRepository, InboxRepository,
    NewAttachmentFile, NewForwardLog, NewInboxItem,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::delivery::SendRequest;
use crate::mime;
use crate::queue::{Deliverer, QueueManager};
use crate::smtp::rules::resolve_forward_rule;
use crate::spam::detect_spam;

/// Combined IO bound for plain and TLS streams.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

type BoxedStream = Box<dyn SessionStream>;

/// One inbound SMTP session
pub struct SmtpSession<D: Deliverer> {
    config: Config,
    db: Database,
    files: AttachmentStore,
    queue: Arc<QueueManager<D>>,
    acceptor: Option<TlsAcceptor>,
    remote_ip: String,
    tls_active: bool,
    from: String,
    to: Vec<String>,
}

impl<D: Deliverer + 'static> SmtpSession<D> {
    pub fn new(
        config: Config,
        db: Database,
        files: AttachmentStore,
        queue: Arc<QueueManager<D>>,
        acceptor: Option<TlsAcceptor>,
        remote_ip: String,
    ) -> Self {
        Self {
            config,
            db,
            files,
            queue,
            acceptor,
            remote_ip,
            tls_active: false,
            from: String::new(),
            to: Vec::new(),
        }
    }

    /// Drive the session to completion. The caller wraps this in the
    /// connection deadline.
    pub async fn run(mut self, stream: impl SessionStream + 'static) -> Result<()> {
        let mut reader = BufReader::new(Box::new(stream) as BoxedStream);

        send_line(&mut reader, "220 Mailforge SMTP Ready").await?;

        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                debug!(ip = %self.remote_ip, "Client disconnected");
                return Ok(());
            }

            let trimmed = line.trim().to_string();
            if trimmed.is_empty() {
                continue;
            }
            let upper = trimmed.to_uppercase();

            if upper.starts_with("HELO") || upper.starts_with("EHLO") {
                self.handle_helo(&mut reader, &trimmed).await?;
            } else if upper.starts_with("MAIL FROM:") {
                self.handle_mail_from(&mut reader, &trimmed).await?;
            } else if upper.starts_with("RCPT TO:") {
                self.handle_rcpt_to(&mut reader, &trimmed).await?;
            } else if upper == "DATA" {
                self.handle_data(&mut reader).await?;
            } else if upper == "STARTTLS" {
                match self.handle_starttls(reader).await? {
                    Some(upgraded) => reader = upgraded,
                    None => return Ok(()),
                }
            } else if upper == "RSET" {
                self.reset();
                send_line(&mut reader, "250 OK").await?;
            } else if upper == "NOOP" {
                send_line(&mut reader, "250 OK").await?;
            } else if upper == "QUIT" {
                send_line(&mut reader, "221 Bye").await?;
                return Ok(());
            } else {
                send_line(&mut reader, "502 Command not implemented").await?;
            }
        }
    }

    fn reset(&mut self) {
        self.from.clear();
        self.to.clear();
    }

    async fn handle_helo(&self, reader: &mut BufReader<BoxedStream>, line: &str) -> Result<()> {
        let is_ehlo = line.to_uppercase().starts_with("EHLO");
        if line.splitn(2, ' ').nth(1).map(str::trim).unwrap_or("").is_empty() {
            return send_line(reader, "501 Syntax error").await;
        }

        if is_ehlo {
            send_line(reader, "250-Mailforge").await?;
            send_line(reader, &format!("250-SIZE {}", self.config.max_msg_bytes())).await?;
            send_line(reader, "250-8BITMIME").await?;
            if self.acceptor.is_some() && !self.tls_active {
                send_line(reader, "250-STARTTLS").await?;
            }
            send_line(reader, "250 OK").await
        } else {
            send_line(reader, "250 Mailforge").await
        }
    }

    /// STARTTLS: reply 220, run the handshake over the raw stream, and
    /// hand back an upgraded reader. The session state is reset, as the
    /// pre-handshake envelope cannot be trusted.
    async fn handle_starttls(
        &mut self,
        mut reader: BufReader<BoxedStream>,
    ) -> Result<Option<BufReader<BoxedStream>>> {
        let acceptor = match &self.acceptor {
            Some(acceptor) => acceptor.clone(),
            None => {
                send_line(&mut reader, "454 TLS not available").await?;
                return Ok(Some(reader));
            }
        };
        if self.tls_active {
            send_line(&mut reader, "503 TLS already active").await?;
            return Ok(Some(reader));
        }

        send_line(&mut reader, "220 Ready to start TLS").await?;

        let inner = reader.into_inner();
        let tls_stream = match acceptor.accept(inner).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(ip = %self.remote_ip, error = %e, "TLS handshake failed");
                return Ok(None);
            }
        };

        self.tls_active = true;
        self.reset();
        info!(ip = %self.remote_ip, "TLS connection established");

        Ok(Some(BufReader::new(Box::new(tls_stream) as BoxedStream)))
    }

    async fn handle_mail_from(
        &mut self,
        reader: &mut BufReader<BoxedStream>,
        line: &str,
    ) -> Result<()> {
        if self.config.receiver_require_tls && !self.tls_active {
            return send_line(reader, "530 Must issue STARTTLS command first").await;
        }

        match extract_email(&line[10..]) {
            Some(addr) => {
                self.from = addr;
                send_line(reader, "250 OK").await
            }
            None => send_line(reader, "501 Syntax error in MAIL FROM").await,
        }
    }

    async fn handle_rcpt_to(
        &mut self,
        reader: &mut BufReader<BoxedStream>,
        line: &str,
    ) -> Result<()> {
        let addr = match extract_email(&line[8..]) {
            Some(addr) => addr,
            None => return send_line(reader, "501 Syntax error in RCPT TO").await,
        };

        match resolve_forward_rule(&self.db, &addr).await {
            Ok(Some(_)) => {
                self.to.push(addr);
                send_line(reader, "250 OK").await
            }
            Ok(None) => send_line(reader, "550 Recipient not accepted").await,
            Err(e) => {
                warn!(error = %e, "Rule lookup failed");
                send_line(reader, "451 Temporary error").await
            }
        }
    }

    async fn handle_data(&mut self, reader: &mut BufReader<BoxedStream>) -> Result<()> {
        if self.from.is_empty() {
            return send_line(reader, "503 Need MAIL command first").await;
        }
        if self.to.is_empty() {
            return send_line(reader, "503 Need RCPT command first").await;
        }

        send_line(reader, "354 Start mail input; end with <CRLF>.<CRLF>").await?;

        let max_size = self.config.max_msg_bytes();
        let mut data = String::new();
        let mut oversize = false;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                anyhow::bail!("connection closed during DATA");
            }

            let content = line.trim_end_matches(['\r', '\n']);
            if content == "." {
                break;
            }

            if oversize {
                continue;
            }
            if max_size > 0 && data.len() + content.len() > max_size {
                // Stop accumulating but keep draining to end-of-data so
                // the rest of the message is not parsed as commands.
                oversize = true;
                data.clear();
                continue;
            }

            // Reverse dot-stuffing.
            let unstuffed = if content.starts_with("..") {
                &content[1..]
            } else {
                content
            };
            data.push_str(unstuffed);
            data.push_str("\r\n");
        }

        if oversize {
            // Only the data buffer is discarded. The envelope survives
            // so the client can retry DATA without reissuing MAIL FROM
            // and RCPT TO.
            send_line(reader, "552 Message size exceeds limit").await?;
            return Ok(());
        }

        match self.process_email(&data).await {
            Ok(()) => send_line(reader, "250 OK: Message queued for forwarding").await?,
            Err(e) => {
                warn!(error = %e, "Failed to process inbound message");
                send_line(reader, &format!("550 Failed to process email: {}", e)).await?;
            }
        }

        self.reset();
        Ok(())
    }

    /// Parse, persist, and forward an accepted message: one inbox row
    /// and one forward attempt per recipient.
    async fn process_email(&self, raw: &str) -> Result<()> {
        let parsed = mime::parse_message(raw.as_bytes());

        let mut tags = String::new();
        if self.config.receiver_spam_filter {
            let verdict = detect_spam(&parsed.subject, &parsed.body);
            if verdict.flagged {
                info!(from = %self.from, reason = %verdict.reason, "Inbound message tagged as spam");
                tags = r#"["spam"]"#.to_string();
            }
        }

        let inbox = InboxRepository::new(self.db.pool().clone());
        let attachments = AttachmentRepository::new(self.db.pool().clone());
        let forward_logs = ForwardLogRepository::new(self.db.pool().clone());

        for recipient in &self.to {
            let inbox_id = inbox
                .create(&NewInboxItem {
                    from_addr: self.from.clone(),
                    to_addr: recipient.clone(),
                    subject: parsed.subject.clone(),
                    body: parsed.body.clone(),
                    raw_data: raw.to_string(),
                    tags: tags.clone(),
                    remote_ip: self.remote_ip.clone(),
                })
                .await?;

            for part in &parsed.attachments {
                if part.data.is_empty() {
                    continue;
                }
                let path = self
                    .files
                    .save_inbox_part(inbox_id, &part.filename, &part.data)
                    .await?;
                attachments
                    .create(&NewAttachmentFile {
                        filename: part.filename.clone(),
                        file_path: path,
                        file_size: part.data.len() as i64,
                        content_type: part.content_type.clone(),
                        source: "inbox".to_string(),
                        related_to: format!("inbox:{}", inbox_id),
                    })
                    .await?;
            }

            let (rule, _domain) = match resolve_forward_rule(&self.db, recipient).await? {
                Some(hit) => hit,
                None => continue,
            };

            let forward_req = SendRequest {
                from: self.from.clone(),
                to: rule.forward_to.clone(),
                subject: format!("[Fwd] {}", parsed.subject),
                body: format_forward_body(&self.from, recipient, &parsed.body),
                ..Default::default()
            };

            let mut log = NewForwardLog {
                rule_id: rule.id,
                from_addr: self.from.clone(),
                to_addr: recipient.clone(),
                forward_to: rule.forward_to.clone(),
                subject: parsed.subject.clone(),
                remote_ip: self.remote_ip.clone(),
                ..Default::default()
            };

            match self.queue.enqueue(&forward_req).await {
                Ok(queue_id) => {
                    debug!(queue_id, forward_to = %rule.forward_to, "Forward enqueued");
                    log.status = "success".to_string();
                }
                Err(e) => {
                    log.status = "failed".to_string();
                    log.error_msg = e.to_string();
                }
            }
            forward_logs.create(&log).await?;
        }

        Ok(())
    }
}

async fn send_line(writer: &mut (impl AsyncWrite + Unpin), msg: &str) -> Result<()> {
    writer.write_all(msg.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Extract the address from a MAIL FROM / RCPT TO argument, tolerating
/// angle brackets and trailing parameters such as SIZE=.
fn extract_email(s: &str) -> Option<String> {
    let mut s = s.trim();
    if let Some(space) = s.find(' ') {
        s = &s[..space];
    }
    let s = s.strip_prefix('<').unwrap_or(s);
    let s = s.strip_suffix('>').unwrap_or(s);
    EmailAddress::parse(s).map(|addr| addr.to_string().to_lowercase())
}

/// Banner prepended to forwarded mail showing the original envelope.
fn format_forward_body(from: &str, original_to: &str, body: &str) -> String {
    format!(
        concat!(
            r#"<div style="background:#f5f5f5; padding:15px; margin-bottom:20px; "#,
            r#"border-left:4px solid #2563eb; font-size:14px; color:#666;">"#,
            "<p><strong>Forwarded message</strong></p>",
            "<p>Original sender: {}<br>Original recipient: {}</p></div>",
            r#"<div style="padding:10px 0;">{}</div>"#
        ),
        from, original_to, body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mailforge_storage::repository::forward::ForwardRuleInput;
    use mailforge_storage::{
        DomainRepository, ForwardLogRepository as FwdLogs, ForwardRuleRepository, InboxRepository as Inbox,
    };
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    struct NullDeliverer;

    #[async_trait]
    impl crate::queue::Deliverer for NullDeliverer {
        async fn send(&self, _req: &SendRequest) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        db: Database,
        _dir: TempDir,
        files: AttachmentStore,
        config: Config,
    }

    async fn harness() -> Harness {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();

        DomainRepository::new(db.pool().clone())
            .create("mail.x.test", "default", "key", "pub", "")
            .await
            .unwrap();
        ForwardRuleRepository::new(db.pool().clone())
            .create(&ForwardRuleInput {
                domain_id: 1,
                match_type: "prefix".to_string(),
                match_addr: "sup".to_string(),
                forward_to: "ext@y.test".to_string(),
                enabled: true,
                remark: String::new(),
            })
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let files = AttachmentStore::new(dir.path());
        let mut config = Config::default();
        config.receiver_spam_filter = true;
        Harness {
            db,
            _dir: dir,
            files,
            config,
        }
    }

    /// Run a scripted session over an in-memory duplex stream and return
    /// everything the server wrote.
    async fn run_session(h: &Harness, script: &str) -> String {
        let queue = Arc::new(QueueManager::new(h.db.clone(), Arc::new(NullDeliverer)));
        let session = SmtpSession::new(
            h.config.clone(),
            h.db.clone(),
            h.files.clone(),
            queue,
            None,
            "198.51.100.7".to_string(),
        );

        let (client, server) = tokio::io::duplex(256 * 1024);
        let handle = tokio::spawn(session.run(server));

        let (mut read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(script.as_bytes()).await.unwrap();
        write_half.flush().await.unwrap();

        let mut output = String::new();
        read_half.read_to_string(&mut output).await.unwrap();
        handle.await.unwrap().unwrap();
        output
    }

    #[tokio::test]
    async fn multipart_message_is_stored_and_forwarded() {
        let h = harness().await;

        let script = concat!(
            "EHLO tester\r\n",
            "MAIL FROM:<Alice@Remote.test>\r\n",
            "RCPT TO:<support@mail.x.test>\r\n",
            "RCPT TO:<nobody@unknown.test>\r\n",
            "DATA\r\n",
            "From: alice@remote.test\r\n",
            "To: support@mail.x.test\r\n",
            "Subject: Invoice attached\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Please find the invoice.\r\n",
            "..and a stuffed dot line\r\n",
            "--b1\r\n",
            "Content-Type: application/pdf; name=\"invoice.pdf\"\r\n",
            "Content-Disposition: attachment; filename=\"invoice.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0xLjQ=\r\n",
            "--b1--\r\n",
            ".\r\n",
            "QUIT\r\n",
        );

        let output = run_session(&h, script).await;
        assert!(output.starts_with("220 "));
        assert!(output.contains("250-SIZE"));
        assert!(output.contains("550 Recipient not accepted"));
        assert!(output.contains("354 Start mail input"));
        assert!(output.contains("250 OK: Message queued for forwarding"));
        assert!(output.contains("221 Bye"));

        // One inbox row for the accepted recipient.
        let inbox = Inbox::new(h.db.pool().clone());
        let items = inbox.list(10, 0).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].from_addr, "alice@remote.test");
        assert_eq!(items[0].to_addr, "support@mail.x.test");
        assert_eq!(items[0].subject, "Invoice attached");
        assert!(items[0].body.contains("Please find the invoice."));
        assert!(items[0].body.contains(".and a stuffed dot line"));

        // The attachment landed on disk with a tracking row.
        let attachment: (String, String, i64) = sqlx::query_as(
            "SELECT filename, file_path, file_size FROM attachment_files",
        )
        .fetch_one(h.db.pool())
        .await
        .unwrap();
        assert_eq!(attachment.0, "invoice.pdf");
        assert_eq!(attachment.2, 8);
        assert_eq!(h.files.read(&attachment.1).await.unwrap(), b"%PDF-1.4");

        // Forwarding: one queue task to the rule target, one log row.
        let task: (String, String) =
            sqlx::query_as("SELECT recipient, subject FROM email_queue")
                .fetch_one(h.db.pool())
                .await
                .unwrap();
        assert_eq!(task.0, "ext@y.test");
        assert_eq!(task.1, "[Fwd] Invoice attached");

        let logs = FwdLogs::new(h.db.pool().clone());
        let forward_logs = logs.list(10).await.unwrap();
        assert_eq!(forward_logs.len(), 1);
        assert_eq!(forward_logs[0].status, "success");
        assert_eq!(forward_logs[0].forward_to, "ext@y.test");
        assert_eq!(forward_logs[0].remote_ip, "198.51.100.7");
    }

    #[tokio::test]
    async fn oversize_data_gets_552_and_envelope_survives_for_retry() {
        let mut h = harness().await;
        h.config.receiver_max_msg_size = 1; // 1 KiB

        // First DATA blows the cap; the second reuses the same envelope
        // without a fresh MAIL FROM / RCPT TO.
        let big_line = "x".repeat(900);
        let script = format!(
            concat!(
                "EHLO tester\r\n",
                "MAIL FROM:<a@remote.test>\r\n",
                "RCPT TO:<support@mail.x.test>\r\n",
                "DATA\r\n",
                "Subject: big\r\n",
                "\r\n",
                "{}\r\n",
                "{}\r\n",
                ".\r\n",
                "DATA\r\n",
                "Subject: small\r\n",
                "\r\n",
                "fits\r\n",
                ".\r\n",
                "QUIT\r\n",
            ),
            big_line, big_line
        );

        let output = run_session(&h, &script).await;
        assert!(output.contains("552 Message size exceeds limit"));
        assert!(
            output.contains("250 OK: Message queued for forwarding"),
            "retry DATA on the surviving envelope must succeed"
        );

        // Only the retried message lands; nothing of the oversize body
        // leaks into the inbox.
        let items: Vec<(String, String)> = sqlx::query_as("SELECT subject, body FROM inbox")
            .fetch_all(h.db.pool())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, "small");
        assert!(!items[0].1.contains("xxx"));
    }

    #[tokio::test]
    async fn tls_policy_and_unknown_commands() {
        let mut h = harness().await;
        h.config.receiver_require_tls = true;

        let script = concat!(
            "EHLO tester\r\n",
            "BDAT 100\r\n",
            "STARTTLS\r\n",
            "MAIL FROM:<a@remote.test>\r\n",
            "QUIT\r\n",
        );

        let output = run_session(&h, script).await;
        // No TLS context loaded: STARTTLS unavailable, and require_tls
        // blocks MAIL FROM on the plain session.
        assert!(!output.contains("250-STARTTLS"));
        assert!(output.contains("502 Command not implemented"));
        assert!(output.contains("454 TLS not available"));
        assert!(output.contains("530 Must issue STARTTLS command first"));
    }

    #[test]
    fn test_extract_email() {
        assert_eq!(
            extract_email("<User@Example.COM>"),
            Some("user@example.com".to_string())
        );
        assert_eq!(
            extract_email(" <a@b.test> SIZE=1024"),
            Some("a@b.test".to_string())
        );
        assert_eq!(extract_email("a@b.test"), Some("a@b.test".to_string()));
        assert_eq!(extract_email("<>"), None);
        assert_eq!(extract_email("no-at-sign"), None);
    }

    #[test]
    fn forward_body_carries_envelope() {
        let body = format_forward_body("a@x.test", "sup@mail.x.test", "<p>hi</p>");
        assert!(body.contains("Original sender: a@x.test"));
        assert!(body.contains("Original recipient: sup@mail.x.test"));
        assert!(body.contains("<p>hi</p>"));
    }
}
