use crate::address::{parse_recipient, ParsedAddress, Recipient};

/// Informational header announcing which domains received secure delivery.
pub const X_TLS_HEADER: &str = "X-TLS";

/// Per-transaction state accumulated across milter events. Created on
/// connect, owned by the milter context for the transaction's lifetime,
/// and discarded on close or abort. Recipients and headers are kept in
/// arrival order and never deduplicated here.
#[derive(Debug, Default, Clone)]
pub struct Session {
    pub hostname: String,
    pub source_ip: Option<String>,
    pub source_port: Option<u16>,
    pub sender: Option<String>,
    pub recipients: Vec<Recipient>,
    pub headers: Vec<(String, String)>,
    /// Value of a pre-existing X-TLS header, last occurrence wins.
    pub existing_x_tls: Option<String>,
    track_headers: bool,
}

impl Session {
    pub fn new(
        hostname: String,
        source_ip: Option<String>,
        source_port: Option<u16>,
        track_headers: bool,
    ) -> Self {
        Session {
            hostname,
            source_ip,
            source_port,
            track_headers,
            ..Default::default()
        }
    }

    /// MAIL FROM opens a new transaction on this connection: any state
    /// accumulated for a previous message is discarded before the sender
    /// is recorded. Connection metadata survives.
    pub fn on_sender(&mut self, sender: String) {
        log::debug!("mail from: {sender}");
        self.reset_message();
        self.sender = Some(sender);
    }

    /// Drop all message-scoped state, keeping the connection metadata.
    /// Used at MAIL FROM and on abort; safe to call repeatedly.
    pub fn reset_message(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.headers.clear();
        self.existing_x_tls = None;
    }

    /// Append one recipient in arrival order. Malformed addresses are kept
    /// (they still count toward the recipient total) but logged.
    pub fn on_recipient(&mut self, raw: String) {
        let recipient = parse_recipient(&raw);
        if recipient.parsed == ParsedAddress::Malformed {
            log::error!("unparseable recipient address: {raw}");
        }
        self.recipients.push(recipient);
    }

    pub fn on_header(&mut self, name: String, value: String) {
        if self.track_headers && name.eq_ignore_ascii_case(X_TLS_HEADER) {
            self.existing_x_tls = Some(value.clone());
        }
        self.headers.push((name, value));
    }
}
