use crate::address::{enforced_token, ParsedAddress};
use crate::config::Config;
use crate::policy::PolicyEngine;
use crate::session::Session;
use regex::Regex;
use std::collections::HashMap;

/// Outcome of a transaction. Reject carries the fixed SMTP reply to hand
/// back to the MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Reject {
        code: String,
        enhanced: String,
        text: String,
    },
}

impl Default for Verdict {
    fn default() -> Self {
        Verdict::Continue
    }
}

/// One To/Cc value replacement. `index` is the 1-based occurrence of
/// `name` expected by the milter change-header action, which takes it
/// as an `i32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRewrite {
    pub name: String,
    pub index: i32,
    pub value: String,
}

/// Everything the dispatcher must do for one transaction: the verdict plus
/// the exact header and envelope mutations, in application order.
#[derive(Debug, Clone, Default)]
pub struct DecisionResult {
    pub verdict: Verdict,
    pub x_tls_header: Option<String>,
    pub header_rewrites: Vec<HeaderRewrite>,
    pub recipient_deletions: Vec<String>,
    pub recipient_additions: Vec<String>,
}

impl DecisionResult {
    fn reject(code: &str, enhanced: &str, text: String) -> Self {
        DecisionResult {
            verdict: Verdict::Reject {
                code: code.to_string(),
                enhanced: enhanced.to_string(),
                text,
            },
            ..Default::default()
        }
    }
}

/// Runs once per transaction, at end-of-data. Pure function of the session,
/// the policy snapshot, and the configuration; re-evaluating an unchanged
/// session yields an identical result.
pub struct DecisionEngine {
    policy: PolicyEngine,
    config: Config,
}

impl DecisionEngine {
    pub fn new(policy: PolicyEngine, config: Config) -> Self {
        DecisionEngine { policy, config }
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn evaluate(&self, session: &Session) -> DecisionResult {
        let mut tls_required = 0usize;
        let mut tls_enforced = 0usize;
        let mut ok_domains: Vec<String> = Vec::new();
        let mut failed_domains: Vec<String> = Vec::new();
        let mut deletions: Vec<String> = Vec::new();
        // (local, domain) for every enforced recipient whose domain passed
        let mut rewritten: Vec<(String, String)> = Vec::new();

        for recipient in &session.recipients {
            match &recipient.parsed {
                ParsedAddress::Enforced { local, domain } => {
                    tls_required += 1;
                    if self.policy.enforced_capable(domain) {
                        tls_enforced += 1;
                        ok_domains.push(domain.clone());
                        let token = enforced_token(&recipient.raw)
                            .unwrap_or(recipient.raw.as_str())
                            .to_string();
                        deletions.push(token);
                        rewritten.push((local.clone(), domain.clone()));
                    } else {
                        failed_domains.push(domain.clone());
                    }
                }
                ParsedAddress::Normal { domain, .. } => {
                    // TLS happens transparently for capable domains; the
                    // recipient text is left alone.
                    if self.policy.enforced_capable(domain) {
                        tls_enforced += 1;
                        ok_domains.push(domain.clone());
                    }
                }
                ParsedAddress::Malformed => {}
            }
        }

        let x_tls_header = if self.config.annotate_headers && !ok_domains.is_empty() {
            let value = format!(
                "Secure delivery enabled to \"{}\"",
                ok_domains.join("\", \"")
            );
            // never duplicate an identical pre-existing value
            if session.existing_x_tls.as_deref() == Some(value.as_str()) {
                None
            } else {
                Some(value)
            }
        } else {
            None
        };

        // No recipient asked for enforced delivery: at most the header
        // annotation applies.
        if tls_required == 0 {
            return DecisionResult {
                verdict: Verdict::Continue,
                x_tls_header,
                ..Default::default()
            };
        }

        if !failed_domains.is_empty() && self.config.strict {
            let noun = if failed_domains.len() == 1 {
                "domain"
            } else {
                "domains"
            };
            let text = format!(
                "Enforced TLS is not possible to the {noun} \"{}\". \
                 Mail was not delivered. For more information, please see {}",
                failed_domains.join("\", \""),
                self.config.info_url
            );
            return DecisionResult::reject("550", "5.5.0", text);
        }

        if session.recipients.len() != tls_enforced && self.config.unified {
            let text = format!(
                "TLS was not possible to all recipients. Mail was not delivered. \
                 For more information, please see {}",
                self.config.info_url
            );
            return DecisionResult::reject("550", "5.5.0", text);
        }

        let mut header_rewrites = Vec::new();
        let mut additions = Vec::new();
        if !rewritten.is_empty() {
            header_rewrites = self.rewrite_headers(session, &rewritten);
            additions = rewritten
                .iter()
                .map(|(local, domain)| format!("<{local}@{domain}>"))
                .collect();
        }

        DecisionResult {
            verdict: Verdict::Continue,
            x_tls_header,
            header_rewrites,
            recipient_deletions: deletions,
            recipient_additions: additions,
        }
    }

    /// Strip the enforced marker from To/Cc values, one substitution rule
    /// per rewritten recipient so unrelated addresses are never touched.
    fn rewrite_headers(
        &self,
        session: &Session,
        rewritten: &[(String, String)],
    ) -> Vec<HeaderRewrite> {
        let mut rewrites = Vec::new();
        let mut occurrence: HashMap<String, i32> = HashMap::new();

        for (name, value) in &session.headers {
            let key = name.to_ascii_lowercase();
            let index = occurrence.entry(key.clone()).or_insert(0);
            *index += 1;
            if key != "to" && key != "cc" {
                continue;
            }

            let mut new_value = value.clone();
            for (local, domain) in rewritten {
                let pattern = format!(
                    "\"?s:{}\"?@{}",
                    regex::escape(local),
                    regex::escape(domain)
                );
                let re = match Regex::new(&pattern) {
                    Ok(re) => re,
                    Err(e) => {
                        log::error!("bad substitution pattern for {local}@{domain}: {e}");
                        continue;
                    }
                };
                let plain = format!("{local}@{domain}");
                new_value = re
                    .replace_all(&new_value, regex::NoExpand(&plain))
                    .into_owned();
            }

            if new_value != *value {
                rewrites.push(HeaderRewrite {
                    name: name.clone(),
                    index: *index,
                    value: new_value,
                });
            }
        }

        rewrites
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyStore;
    use std::sync::Arc;

    fn engine(entries: &[(&str, &str)], strict: bool, unified: bool) -> DecisionEngine {
        let store = PolicyStore::from_entries(entries.iter().map(|&(k, v)| (k, v)));
        let config = Config {
            strict,
            unified,
            info_url: "https://example.org/tls".to_string(),
            ..Default::default()
        };
        DecisionEngine::new(PolicyEngine::new(Arc::new(store)), config)
    }

    fn session_with(recipients: &[&str], headers: &[(&str, &str)]) -> Session {
        let mut session = Session::new("mx.example.com".to_string(), None, None, true);
        session.on_sender("<sender@example.com>".to_string());
        for r in recipients {
            session.on_recipient(r.to_string());
        }
        for (name, value) in headers {
            session.on_header(name.to_string(), value.to_string());
        }
        session
    }

    #[test]
    fn test_success_rewrites_envelope_and_headers() {
        // Scenario A
        let engine = engine(&[("good.com", "secure")], false, false);
        let session = session_with(
            &["<s:alice@good.com>"],
            &[("To", "s:alice@good.com"), ("Subject", "hi")],
        );

        let result = engine.evaluate(&session);
        assert_eq!(result.verdict, Verdict::Continue);
        assert_eq!(
            result.x_tls_header.as_deref(),
            Some("Secure delivery enabled to \"good.com\"")
        );
        assert_eq!(result.recipient_deletions, vec!["<s:alice@good.com>"]);
        assert_eq!(result.recipient_additions, vec!["<alice@good.com>"]);
        assert_eq!(
            result.header_rewrites,
            vec![HeaderRewrite {
                name: "To".to_string(),
                index: 1,
                value: "alice@good.com".to_string(),
            }]
        );
    }

    #[test]
    fn test_strict_reject_names_failed_domain() {
        // Scenario B
        let engine = engine(&[("good.com", "secure")], true, false);
        let session = session_with(&["<s:alice@good.com>", "<s:bob@bad.com>"], &[]);

        let result = engine.evaluate(&session);
        match &result.verdict {
            Verdict::Reject {
                code,
                enhanced,
                text,
            } => {
                assert_eq!(code, "550");
                assert_eq!(enhanced, "5.5.0");
                assert!(text.contains("domain \"bad.com\""));
                assert!(text.contains("https://example.org/tls"));
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert!(result.recipient_deletions.is_empty());
        assert!(result.recipient_additions.is_empty());
        assert!(result.header_rewrites.is_empty());
        assert_eq!(result.x_tls_header, None);
    }

    #[test]
    fn test_strict_reject_pluralizes_domains() {
        let engine = engine(&[], true, false);
        let session = session_with(&["<s:a@one.com>", "<s:b@two.com>"], &[]);

        match engine.evaluate(&session).verdict {
            Verdict::Reject { text, .. } => {
                assert!(text.contains("domains \"one.com\", \"two.com\""));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_loose_mode_leaves_failed_recipient_untouched() {
        // Scenario C
        let engine = engine(&[("good.com", "secure")], false, false);
        let session = session_with(
            &["<s:alice@good.com>", "<s:bob@bad.com>"],
            &[("To", "s:alice@good.com, s:bob@bad.com")],
        );

        let result = engine.evaluate(&session);
        assert_eq!(result.verdict, Verdict::Continue);
        assert_eq!(result.recipient_deletions, vec!["<s:alice@good.com>"]);
        assert_eq!(result.recipient_additions, vec!["<alice@good.com>"]);
        // bad.com stays in its enforced form, everywhere
        assert_eq!(
            result.header_rewrites[0].value,
            "alice@good.com, s:bob@bad.com"
        );
    }

    #[test]
    fn test_unified_reject_when_not_all_recipients_enforced() {
        // Scenario D
        let engine = engine(&[("good.com", "secure")], false, true);
        let session = session_with(&["<s:alice@good.com>", "<carl@plain.com>"], &[]);

        match engine.evaluate(&session).verdict {
            Verdict::Reject { code, text, .. } => {
                assert_eq!(code, "550");
                assert!(text.starts_with("TLS was not possible to all recipients."));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_unified_passes_when_all_recipients_capable() {
        let engine = engine(&[("good.com", "secure"), ("ok.com", "verify")], false, true);
        let session = session_with(&["<s:alice@good.com>", "<carl@ok.com>"], &[]);

        let result = engine.evaluate(&session);
        assert_eq!(result.verdict, Verdict::Continue);
        assert_eq!(
            result.x_tls_header.as_deref(),
            Some("Secure delivery enabled to \"good.com\", \"ok.com\"")
        );
    }

    #[test]
    fn test_no_enforced_recipients_skips_rewrites() {
        let engine = engine(&[("good.com", "secure")], true, false);
        let session = session_with(&["<carl@good.com>"], &[("To", "carl@good.com")]);

        let result = engine.evaluate(&session);
        assert_eq!(result.verdict, Verdict::Continue);
        // header annotation still happens for transparently capable domains
        assert_eq!(
            result.x_tls_header.as_deref(),
            Some("Secure delivery enabled to \"good.com\"")
        );
        assert!(result.recipient_deletions.is_empty());
        assert!(result.recipient_additions.is_empty());
        assert!(result.header_rewrites.is_empty());
    }

    #[test]
    fn test_duplicate_x_tls_value_suppressed() {
        let engine = engine(&[("good.com", "secure")], false, false);
        let mut session = session_with(&["<carl@good.com>"], &[]);
        session.on_header(
            "X-TLS".to_string(),
            "Secure delivery enabled to \"good.com\"".to_string(),
        );

        let result = engine.evaluate(&session);
        assert_eq!(result.x_tls_header, None);
    }

    #[test]
    fn test_differing_existing_x_tls_value_replaced() {
        let engine = engine(&[("good.com", "secure")], false, false);
        let mut session = session_with(&["<carl@good.com>"], &[]);
        session.on_header("X-TLS".to_string(), "stale value".to_string());

        let result = engine.evaluate(&session);
        assert_eq!(
            result.x_tls_header.as_deref(),
            Some("Secure delivery enabled to \"good.com\"")
        );
    }

    #[test]
    fn test_malformed_recipient_counts_against_unified() {
        let engine = engine(&[("good.com", "secure")], false, true);
        let session = session_with(&["<s:alice@good.com>", "bogus"], &[]);

        match engine.evaluate(&session).verdict {
            Verdict::Reject { text, .. } => {
                assert!(text.starts_with("TLS was not possible to all recipients."));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_recipient_is_inert_otherwise() {
        let engine = engine(&[("good.com", "secure")], true, false);
        let session = session_with(&["bogus"], &[]);

        let result = engine.evaluate(&session);
        assert_eq!(result.verdict, Verdict::Continue);
        assert_eq!(result.x_tls_header, None);
        assert!(result.recipient_deletions.is_empty());
    }

    #[test]
    fn test_cc_header_rewritten_with_per_name_index() {
        let engine = engine(&[("good.com", "secure")], false, false);
        let session = session_with(
            &["<s:alice@good.com>"],
            &[
                ("Received", "by mx"),
                ("Cc", "nobody@else.org"),
                ("Cc", "\"s:alice\"@good.com"),
            ],
        );

        let result = engine.evaluate(&session);
        // only the second Cc changes; index is per header name
        assert_eq!(
            result.header_rewrites,
            vec![HeaderRewrite {
                name: "Cc".to_string(),
                index: 2,
                value: "alice@good.com".to_string(),
            }]
        );
    }

    #[test]
    fn test_substitution_scoped_to_exact_recipient() {
        let engine = engine(&[("good.com", "secure")], false, false);
        let session = session_with(
            &["<s:alice@good.com>"],
            &[("To", "s:alice@good.com, s:alice@other.com")],
        );

        let result = engine.evaluate(&session);
        assert_eq!(
            result.header_rewrites[0].value,
            "alice@good.com, s:alice@other.com"
        );
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let engine = engine(&[("good.com", "secure")], false, false);
        let session = session_with(&["<s:alice@good.com>"], &[("To", "s:alice@good.com")]);

        let first = engine.evaluate(&session);
        let second = engine.evaluate(&session);
        assert_eq!(first.verdict, second.verdict);
        assert_eq!(first.x_tls_header, second.x_tls_header);
        assert_eq!(first.header_rewrites, second.header_rewrites);
        assert_eq!(first.recipient_deletions, second.recipient_deletions);
        assert_eq!(first.recipient_additions, second.recipient_additions);
    }
}
