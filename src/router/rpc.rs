use std::{
    collections::hash_map::Entry,
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;
use log::{
    debug,
    info,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    core::{
        error::InteractionError,
        hash::HashMap,
        id::Id,
        types::{
            Dictionary,
            List,
        },
        uri::Uri,
    },
    message::message::Message,
};

/// The arguments of a call routed to an internal procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InternalRpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// The result an internal procedure yields back to the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InternalRpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A handler for a procedure hosted by the router itself.
///
/// Internal procedures are called exactly like remote ones, but the
/// invocation never leaves the router process.
#[async_trait]
pub trait InternalRpcHandler: Send + Sync {
    async fn invoke(&self, call: InternalRpcCall) -> Result<InternalRpcYield>;
}

/// The endpoint a registered procedure routes to.
#[derive(Clone)]
pub enum RpcEndpoint {
    /// A procedure registered by a peer session.
    Callee {
        session: Id,
        invocation_tx: UnboundedSender<Message>,
    },
    /// A procedure hosted by the router.
    Internal { handler: Arc<dyn InternalRpcHandler> },
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callee {
                session,
                invocation_tx,
            } => f
                .debug_struct("Callee")
                .field("session", session)
                .field("invocation_tx", invocation_tx)
                .finish(),
            Self::Internal { .. } => f.debug_struct("Internal").finish_non_exhaustive(),
        }
    }
}

/// A registration of a procedure in a realm.
#[derive(Debug, Clone)]
pub struct Registration {
    pub registration_id: Id,
    pub procedure: Uri,
    pub endpoint: RpcEndpoint,
}

/// A routed invocation awaiting its YIELD (or ERROR) from the callee.
pub struct PendingInvocation {
    /// The session that issued the CALL.
    pub caller: Id,
    /// The calling session's message channel, for routing the RESULT back.
    pub caller_tx: UnboundedSender<Message>,
    /// The request ID of the original CALL.
    pub call_request: Id,
}

#[derive(Default)]
struct RealmProcedures {
    procedures: HashMap<Uri, Registration>,
    procedure_uris: HashMap<Id, Uri>,
}

#[derive(Default)]
struct RpcManagerState {
    realms: HashMap<Uri, RealmProcedures>,
    procedures_by_session: HashMap<Id, Vec<(Uri, Uri)>>,
    pending_invocations: HashMap<Id, PendingInvocation>,
    next_registration_id: u64,
    next_invocation_id: u64,
}

/// The router's RPC registry.
///
/// Maps procedure URIs to registrations per realm, tracks which session owns
/// each registration so that everything a session registered disappears when
/// it closes, and correlates in-flight invocations with their callers.
///
/// A single mutex guards the whole structure; every operation is short.
/// Registration IDs are drawn from one monotone counter across realms and
/// are never reused within the process lifetime.
#[derive(Default)]
pub struct RpcManager {
    state: Mutex<RpcManagerState>,
}

impl RpcManager {
    /// Registers a procedure owned by a peer session.
    ///
    /// Within one realm, each URI maps to at most one registration.
    pub async fn register(
        &self,
        realm: &Uri,
        session: Id,
        invocation_tx: UnboundedSender<Message>,
        procedure: Uri,
    ) -> Result<Id> {
        self.register_endpoint(
            realm,
            Some(session),
            procedure,
            RpcEndpoint::Callee {
                session,
                invocation_tx,
            },
        )
        .await
    }

    /// Registers a procedure hosted by the router itself.
    pub async fn register_internal(
        &self,
        realm: &Uri,
        procedure: Uri,
        handler: Arc<dyn InternalRpcHandler>,
    ) -> Result<Id> {
        self.register_endpoint(realm, None, procedure, RpcEndpoint::Internal { handler })
            .await
    }

    async fn register_endpoint(
        &self,
        realm: &Uri,
        session: Option<Id>,
        procedure: Uri,
        endpoint: RpcEndpoint,
    ) -> Result<Id> {
        let mut state = self.state.lock().await;
        state.next_registration_id += 1;
        let registration_id = Id::try_from(state.next_registration_id).unwrap();

        let realm_procedures = state.realms.entry(realm.clone()).or_default();
        match realm_procedures.procedures.entry(procedure.clone()) {
            Entry::Occupied(_) => {
                debug!("Ignored duplicate procedure registration for {realm}:{procedure}");
                return Err(InteractionError::ProcedureAlreadyExists.into());
            }
            Entry::Vacant(entry) => {
                entry.insert(Registration {
                    registration_id,
                    procedure: procedure.clone(),
                    endpoint,
                });
            }
        }
        realm_procedures
            .procedure_uris
            .insert(registration_id, procedure.clone());

        if let Some(session) = session {
            state
                .procedures_by_session
                .entry(session)
                .or_default()
                .push((realm.clone(), procedure.clone()));
        }

        info!("Procedure added, {registration_id}, {realm}::{procedure}");
        Ok(registration_id)
    }

    /// Looks up the registration for a procedure URI in a realm.
    pub async fn lookup(&self, realm: &Uri, procedure: &Uri) -> Option<Registration> {
        let state = self.state.lock().await;
        state
            .realms
            .get(realm)
            .and_then(|realm_procedures| realm_procedures.procedures.get(procedure))
            .cloned()
    }

    /// Removes a registration owned by the given session.
    pub async fn unregister(&self, realm: &Uri, session: Id, registration_id: Id) -> Result<()> {
        let mut state = self.state.lock().await;
        let realm_procedures = match state.realms.get_mut(realm) {
            Some(realm_procedures) => realm_procedures,
            None => return Err(InteractionError::NoSuchRegistration.into()),
        };
        let procedure = match realm_procedures.procedure_uris.get(&registration_id) {
            Some(procedure) => procedure.clone(),
            None => return Err(InteractionError::NoSuchRegistration.into()),
        };
        let owned = matches!(
            realm_procedures.procedures.get(&procedure),
            Some(Registration {
                endpoint: RpcEndpoint::Callee { session: owner, .. },
                ..
            }) if *owner == session
        );
        if !owned {
            return Err(InteractionError::NoSuchRegistration.into());
        }
        realm_procedures.procedures.remove(&procedure);
        realm_procedures.procedure_uris.remove(&registration_id);
        if let Some(owned_procedures) = state.procedures_by_session.get_mut(&session) {
            owned_procedures.retain(|(_, uri)| *uri != procedure);
        }
        info!("Procedure removed, {registration_id}, {realm}::{procedure}");
        Ok(())
    }

    /// Starts routing an invocation, correlating the router-issued
    /// invocation request ID with the original caller.
    pub async fn begin_invocation(
        &self,
        caller: Id,
        caller_tx: UnboundedSender<Message>,
        call_request: Id,
    ) -> Id {
        let mut state = self.state.lock().await;
        state.next_invocation_id += 1;
        let invocation_id = Id::try_from(state.next_invocation_id).unwrap();
        state.pending_invocations.insert(
            invocation_id,
            PendingInvocation {
                caller,
                caller_tx,
                call_request,
            },
        );
        invocation_id
    }

    /// Finishes a routed invocation, yielding the pending record so the
    /// result can be routed back to the caller.
    pub async fn complete_invocation(&self, invocation_id: Id) -> Option<PendingInvocation> {
        self.state
            .lock()
            .await
            .pending_invocations
            .remove(&invocation_id)
    }

    /// Atomically removes everything the given session owns: its
    /// registrations and the invocations it is waiting on.
    pub async fn session_closed(&self, session: Id) {
        let mut state = self.state.lock().await;
        if let Some(owned_procedures) = state.procedures_by_session.remove(&session) {
            for (realm, procedure) in owned_procedures {
                if let Some(realm_procedures) = state.realms.get_mut(&realm) {
                    if let Some(registration) = realm_procedures.procedures.remove(&procedure) {
                        realm_procedures
                            .procedure_uris
                            .remove(&registration.registration_id);
                        info!(
                            "Procedure removed, {}, {realm}::{procedure}",
                            registration.registration_id
                        );
                    }
                }
            }
        }
        state
            .pending_invocations
            .retain(|_, pending| pending.caller != session);
    }
}
