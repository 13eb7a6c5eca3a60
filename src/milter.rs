use crate::config::Config;
use crate::decision::{DecisionEngine, Verdict};
use crate::policy::{PolicyEngine, PolicyStore};
use crate::session::{Session, X_TLS_HEADER};
use indymilter::{
    run, Actions, Callbacks, Config as IndyConfig, ContextActions, SetErrorReply, SocketInfo,
    Status,
};
use std::sync::Arc;
use tokio::net::UnixListener;

pub struct Milter {
    engine: Arc<DecisionEngine>,
    annotate_headers: bool,
}

impl Milter {
    /// Loading the policy snapshot is part of construction: without it the
    /// milter must not start serving.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let store = PolicyStore::load(&config.policy_path)?;
        let policy = PolicyEngine::new(Arc::new(store));
        let annotate_headers = config.annotate_headers;
        Ok(Milter {
            engine: Arc::new(DecisionEngine::new(policy, config)),
            annotate_headers,
        })
    }

    pub async fn run(&self, socket_path: &str) -> anyhow::Result<()> {
        log::info!("Starting milter on: {socket_path}");
        // Remove existing socket if it exists
        if std::path::Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        let engine = self.engine.clone();
        let annotate_headers = self.annotate_headers;

        let callbacks: Callbacks<Session> = Callbacks {
            connect: Some(Box::new(
                move |ctx: &mut indymilter::Context<Session>, hostname, addr| {
                    Box::pin(async move {
                        let hostname = hostname.to_string_lossy().to_string();
                        let (source_ip, source_port) = match addr {
                            SocketInfo::Inet(addr) => {
                                (Some(addr.ip().to_string()), Some(addr.port()))
                            }
                            _ => (None, None),
                        };
                        log::debug!("connection from {hostname}");
                        ctx.data = Some(Session::new(
                            hostname,
                            source_ip,
                            source_port,
                            annotate_headers,
                        ));
                        Status::Continue
                    })
                },
            )),

            mail: Some(Box::new(
                move |ctx: &mut indymilter::Context<Session>, sender| {
                    Box::pin(async move {
                        let sender = sender
                            .iter()
                            .map(|s| s.to_string_lossy())
                            .collect::<Vec<_>>()
                            .join(",");
                        if let Some(session) = ctx.data.as_mut() {
                            session.on_sender(sender);
                        }
                        Status::Continue
                    })
                },
            )),

            rcpt: Some(Box::new(
                move |ctx: &mut indymilter::Context<Session>, recipient| {
                    Box::pin(async move {
                        let recipient = recipient
                            .iter()
                            .map(|s| s.to_string_lossy())
                            .collect::<Vec<_>>()
                            .join(",");
                        if let Some(session) = ctx.data.as_mut() {
                            session.on_recipient(recipient);
                        }
                        Status::Continue
                    })
                },
            )),

            header: Some(Box::new(
                move |ctx: &mut indymilter::Context<Session>, name, value| {
                    Box::pin(async move {
                        let name = name.to_string_lossy().to_string();
                        let value = value.to_string_lossy().to_string();
                        if let Some(session) = ctx.data.as_mut() {
                            session.on_header(name, value);
                        }
                        Status::Continue
                    })
                },
            )),

            eom: Some(Box::new({
                let engine = engine.clone();
                move |ctx: &mut indymilter::EomContext<Session>| {
                    let engine = engine.clone();
                    Box::pin(async move {
                        // The session stays in place for further messages
                        // on this connection; the next MAIL FROM resets it.
                        let (result, sender) = match ctx.data.as_ref() {
                            Some(session) => (engine.evaluate(session), session.sender.clone()),
                            None => return Status::Continue,
                        };

                        match result.verdict {
                            Verdict::Reject {
                                code,
                                enhanced,
                                text,
                            } => {
                                log::info!(
                                    "rejecting transaction from {}: {text}",
                                    sender.as_deref().unwrap_or("<>")
                                );
                                if let Err(e) = ctx.reply.set_error_reply(
                                    &code,
                                    Some(&enhanced),
                                    vec![text.as_str()],
                                ) {
                                    log::warn!("failed to set reject reply: {e}");
                                }
                                Status::Reject
                            }
                            Verdict::Continue => {
                                // Envelope first. A refused deletion is
                                // survivable; a refused addition is not,
                                // since the original recipient is already
                                // gone.
                                for token in &result.recipient_deletions {
                                    if let Err(e) =
                                        ctx.actions.delete_recipient(token.clone()).await
                                    {
                                        log::warn!("failed to delete recipient {token}: {e}");
                                    }
                                }
                                for token in &result.recipient_additions {
                                    if let Err(e) = ctx.actions.add_recipient(token.clone()).await
                                    {
                                        log::error!(
                                            "failed to add recipient {token}, rejecting: {e}"
                                        );
                                        return Status::Reject;
                                    }
                                }

                                if let Some(value) = &result.x_tls_header {
                                    log::debug!("{X_TLS_HEADER}: {value}");
                                    if let Err(e) = ctx
                                        .actions
                                        .add_header(X_TLS_HEADER.to_string(), value.clone())
                                        .await
                                    {
                                        log::warn!("failed to add {X_TLS_HEADER} header: {e}");
                                    }
                                }
                                for rewrite in &result.header_rewrites {
                                    if let Err(e) = ctx
                                        .actions
                                        .change_header(
                                            rewrite.name.clone(),
                                            rewrite.index,
                                            Some(rewrite.value.clone()),
                                        )
                                        .await
                                    {
                                        log::warn!(
                                            "failed to rewrite {} header: {e}",
                                            rewrite.name
                                        );
                                    }
                                }

                                Status::Continue
                            }
                        }
                    })
                }
            })),

            abort: Some(Box::new(|ctx: &mut indymilter::Context<Session>| {
                Box::pin(async move {
                    // Discard the aborted message; no verdict, no
                    // mutations. The connection may still carry further
                    // transactions, so only message state goes.
                    if let Some(session) = ctx.data.as_mut() {
                        session.reset_message();
                    }
                    Status::Continue
                })
            })),

            close: Some(Box::new(|ctx: &mut indymilter::Context<Session>| {
                Box::pin(async move {
                    ctx.data = None;
                    Status::Continue
                })
            })),

            ..Default::default()
        };

        let config = IndyConfig {
            actions: Actions::ADD_HEADER
                | Actions::CHANGE_HEADER
                | Actions::ADD_RCPT
                | Actions::DELETE_RCPT,
            ..Default::default()
        };

        run(listener, callbacks, config, tokio::signal::ctrl_c()).await?;
        Ok(())
    }
}
