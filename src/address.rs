use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Enforced form: optional angle bracket, optional quote, the `s:`
    // marker leading the local part, lazy local part, `@`, domain,
    // optional closing bracket. Anchored on the left so the marker is only
    // recognized as a prefix; the right edge stays open for trailing ESMTP
    // arguments.
    static ref ENFORCED: Regex =
        Regex::new(r#"^<?"?s:(.*?)"?@([A-Za-z0-9.-]*)>?"#).unwrap();
    // Fallback for recipients without the marker.
    static ref NORMAL: Regex = Regex::new(r"^<?(.*?)@([A-Za-z0-9.-]*)>?").unwrap();
    // Recovers the exact bracket/quote form of an enforced token from the
    // raw recipient text, for envelope deletion.
    static ref ENFORCED_TOKEN: Regex =
        Regex::new(r#"^(<?"?s:.*?"?@[A-Za-z0-9.-]*>?)"#).unwrap();
}

/// Parsed view of one raw recipient token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedAddress {
    /// Local part carried the `s:` enforced-delivery marker.
    Enforced { local: String, domain: String },
    Normal { local: String, domain: String },
    Malformed,
}

impl ParsedAddress {
    pub fn is_enforced(&self) -> bool {
        matches!(self, ParsedAddress::Enforced { .. })
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            ParsedAddress::Enforced { domain, .. } | ParsedAddress::Normal { domain, .. } => {
                Some(domain)
            }
            ParsedAddress::Malformed => None,
        }
    }
}

/// One recipient as received, with the original token kept verbatim so it
/// can be deleted from the envelope byte-for-byte later.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub raw: String,
    pub parsed: ParsedAddress,
}

/// Parse a raw recipient token. Tries the enforced pattern first, then the
/// loose fallback; anything matching neither is `Malformed`. The raw text
/// is never modified.
pub fn parse_recipient(raw: &str) -> Recipient {
    let parsed = if let Some(caps) = ENFORCED.captures(raw) {
        ParsedAddress::Enforced {
            local: caps[1].to_string(),
            domain: caps[2].to_string(),
        }
    } else if let Some(caps) = NORMAL.captures(raw) {
        ParsedAddress::Normal {
            local: caps[1].to_string(),
            domain: caps[2].to_string(),
        }
    } else {
        ParsedAddress::Malformed
    };

    Recipient {
        raw: raw.to_string(),
        parsed,
    }
}

/// Extract the exact enforced-form token (brackets and quotes included)
/// from the raw recipient text.
pub fn enforced_token(raw: &str) -> Option<&str> {
    ENFORCED_TOKEN.find(raw).map(|m| m.as_str())
}
