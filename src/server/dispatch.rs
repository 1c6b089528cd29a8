//! Command dispatch: built-in protocol commands handled inline, data
//! commands routed through the selected bucket engine.

use bytes::Bytes;
use tracing::{debug, info};

use crate::auth::{list_mechanisms, RbacError, SaslError, SaslStep};
use crate::engine::{EngineCode, EngineContext, EngineOutcome, EngineResponse, StoreOp};
use crate::item::DocKey;
use crate::protocol::{Feature, Opcode, Request, Response, Status};
use crate::server::connection::{CommandAction, Connection};

/// Extras layout for the store family: 4-byte flags + 4-byte expiry.
const STORE_EXTRAS_LEN: u8 = 8;

impl Connection {
    pub(crate) fn dispatch_command(&mut self) -> CommandAction {
        let Some(request) = self.cookie.request().cloned() else {
            return CommandAction::Disconnect;
        };
        let opcode = request.header.opcode;
        let opaque = request.header.opaque;
        debug!(conn = self.id(), %opcode, "dispatching");
        match opcode {
            Opcode::Noop => CommandAction::Respond(Response::new(opcode, Status::Success, opaque)),
            Opcode::Version => CommandAction::Respond(
                Response::new(opcode, Status::Success, opaque)
                    .with_value(env!("CARGO_PKG_VERSION")),
            ),
            Opcode::Quit => {
                CommandAction::RespondThenClose(Response::new(opcode, Status::Success, opaque))
            }
            Opcode::Hello => self.execute_hello(&request),
            Opcode::SaslListMechs => CommandAction::Respond(
                Response::new(opcode, Status::Success, opaque)
                    .with_value(list_mechanisms("", " ", "")),
            ),
            Opcode::SaslAuth => self.execute_sasl(&request, true),
            Opcode::SaslStep => self.execute_sasl(&request, false),
            Opcode::SelectBucket => self.execute_select_bucket(&request),
            Opcode::Get => self.execute_get(&request),
            Opcode::Set => self.execute_store(&request, StoreOp::Set),
            Opcode::Add => self.execute_store(&request, StoreOp::Add),
            Opcode::Replace => self.execute_store(&request, StoreOp::Replace),
            Opcode::Delete => self.execute_delete(&request),
        }
    }

    fn engine_context(&self) -> EngineContext {
        EngineContext {
            cookie: self.cookie.handle(),
        }
    }

    fn execute_hello(&mut self, request: &Request) -> CommandAction {
        if !request.key.is_empty() {
            let name = String::from_utf8_lossy(&request.key);
            self.agent_name = name.chars().take(32).collect();
        }
        if request.value.len() % 2 != 0 {
            return CommandAction::Respond(Response::new(
                request.header.opcode,
                Status::Einval,
                request.header.opaque,
            ));
        }
        for pair in request.value.chunks_exact(2) {
            let code = u16::from_be_bytes([pair[0], pair[1]]);
            match Feature::from_u16(code) {
                Some(feature) => {
                    debug!(conn = self.id(), %feature, "HELLO enabled feature");
                    self.features.enable(feature);
                }
                None => {
                    // Unknown feature requests are ignored, not errors;
                    // the response lists what was actually enabled.
                    debug!(conn = self.id(), code, "HELLO ignoring unknown feature");
                }
            }
        }
        CommandAction::Respond(
            Response::new(request.header.opcode, Status::Success, request.header.opaque)
                .with_value(self.features.to_wire()),
        )
    }

    fn execute_sasl(&mut self, request: &Request, start: bool) -> CommandAction {
        let opcode = request.header.opcode;
        let opaque = request.header.opaque;
        if !self.sasl_enabled {
            // Certificate-authenticated connections cannot change identity.
            return CommandAction::Engine(EngineResponse::code(EngineCode::Eaccess));
        }
        let step = if start {
            let Ok(mechanism) = std::str::from_utf8(&request.key) else {
                return CommandAction::Respond(Response::new(opcode, Status::Einval, opaque));
            };
            self.sasl.start(mechanism, &request.value)
        } else {
            self.sasl.step(&request.value)
        };
        match step {
            Ok(SaslStep::Done(payload)) => {
                let Some(user) = self.sasl.username().map(str::to_string) else {
                    return CommandAction::Respond(Response::new(
                        opcode,
                        Status::AuthError,
                        opaque,
                    ));
                };
                match self.ctx.rbac.create_context(&user, "") {
                    Ok(context) => {
                        self.authenticated = true;
                        self.internal = context.is_internal();
                        self.username = user;
                        let mut privilege = context;
                        privilege.set_bucket_privileges();
                        self.set_privilege_context(privilege);
                        info!(
                            conn = self.id(),
                            user = %self.username,
                            "client authenticated via SASL"
                        );
                        CommandAction::Respond(
                            Response::new(opcode, Status::Success, opaque)
                                .with_value(payload.unwrap_or_else(|| b"Authenticated".to_vec())),
                        )
                    }
                    Err(RbacError::NoSuchUser { .. }) => {
                        info!(
                            conn = self.id(),
                            user, "SASL verified but user has no profile"
                        );
                        self.restart_authentication();
                        CommandAction::Respond(Response::new(opcode, Status::AuthError, opaque))
                    }
                    Err(_) => {
                        self.restart_authentication();
                        CommandAction::Respond(Response::new(opcode, Status::AuthError, opaque))
                    }
                }
            }
            Ok(SaslStep::Continue(payload)) => CommandAction::Respond(
                Response::new(opcode, Status::AuthContinue, opaque).with_value(payload),
            ),
            Err(SaslError::AuthFailed) => {
                info!(conn = self.id(), "SASL authentication failed");
                self.restart_authentication();
                CommandAction::Respond(Response::new(opcode, Status::AuthError, opaque))
            }
            Err(err) => {
                // Unknown mechanism and malformed payloads are client
                // parameter errors.
                debug!(conn = self.id(), error = %err, "SASL negotiation error");
                CommandAction::Respond(Response::new(opcode, Status::Einval, opaque))
            }
        }
    }

    fn execute_select_bucket(&mut self, request: &Request) -> CommandAction {
        let opcode = request.header.opcode;
        let opaque = request.header.opaque;
        if !self.authenticated {
            return CommandAction::Engine(EngineResponse::code(EngineCode::Eaccess));
        }
        let Ok(name) = std::str::from_utf8(&request.key) else {
            return CommandAction::Respond(Response::new(opcode, Status::Einval, opaque));
        };
        let Some(bucket) = self.ctx.get_bucket(name) else {
            return CommandAction::Respond(Response::new(opcode, Status::KeyEnoent, opaque));
        };
        match self.ctx.rbac.create_context(&self.username, name) {
            Ok(context) => {
                self.engine = Some(bucket);
                self.bucket_name = name.to_string();
                self.set_privilege_context(context);
                info!(conn = self.id(), bucket = name, "selected bucket");
                CommandAction::Respond(Response::new(opcode, Status::Success, opaque))
            }
            Err(RbacError::NoSuchBucket { .. }) => {
                CommandAction::Engine(EngineResponse::code(EngineCode::Eaccess))
            }
            Err(RbacError::NoSuchUser { .. }) => {
                CommandAction::Engine(EngineResponse::code(EngineCode::AuthStale))
            }
            Err(_) => CommandAction::Engine(EngineResponse::code(EngineCode::Eaccess)),
        }
    }

    fn execute_get(&mut self, request: &Request) -> CommandAction {
        let Some(engine) = self.engine.clone() else {
            return CommandAction::Engine(EngineResponse::code(EngineCode::NoBucket));
        };
        if request.key.is_empty() || !request.extras.is_empty() {
            return CommandAction::Engine(EngineResponse::code(EngineCode::Einval));
        }
        let key = DocKey::default_collection(request.key.clone());
        match engine.get(&self.engine_context(), request.header.partition, &key) {
            EngineOutcome::Done(response) => CommandAction::Engine(response),
            EngineOutcome::EWouldBlock => CommandAction::WouldBlock,
        }
    }

    fn execute_store(&mut self, request: &Request, op: StoreOp) -> CommandAction {
        let Some(engine) = self.engine.clone() else {
            return CommandAction::Engine(EngineResponse::code(EngineCode::NoBucket));
        };
        if request.key.is_empty() || request.extras.len() != STORE_EXTRAS_LEN as usize {
            return CommandAction::Engine(EngineResponse::code(EngineCode::Einval));
        }
        let key = DocKey::default_collection(request.key.clone());
        let value: Bytes = request.value.clone();
        match engine.store(
            &self.engine_context(),
            op,
            request.header.partition,
            key,
            value,
            request.header.cas,
        ) {
            EngineOutcome::Done(response) => CommandAction::Engine(response),
            EngineOutcome::EWouldBlock => CommandAction::WouldBlock,
        }
    }

    fn execute_delete(&mut self, request: &Request) -> CommandAction {
        let Some(engine) = self.engine.clone() else {
            return CommandAction::Engine(EngineResponse::code(EngineCode::NoBucket));
        };
        if request.key.is_empty() || !request.extras.is_empty() {
            return CommandAction::Engine(EngineResponse::code(EngineCode::Einval));
        }
        let key = DocKey::default_collection(request.key.clone());
        match engine.remove(
            &self.engine_context(),
            request.header.partition,
            &key,
            request.header.cas,
        ) {
            EngineOutcome::Done(response) => CommandAction::Engine(response),
            EngineOutcome::EWouldBlock => CommandAction::WouldBlock,
        }
    }
}
