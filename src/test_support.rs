//! Scripted engine and resolver doubles for lifecycle tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::engine::{
    AuthCredential, EngineEvent, EngineEventSink, EngineHandle, EngineParams, EngineRequest,
    EngineSettings, OperationId, Outcome, SignalingEngine,
};
use crate::error::{Error, Result};
use crate::resolver::{NameResolver, SrvTarget};

const WAIT_BUDGET: Duration = Duration::from_secs(5);

#[derive(Default)]
struct EngineState {
    next_op: u64,
    sink: Option<EngineEventSink>,
    created: Vec<EngineParams>,
    fail_create: Option<String>,
    swallow_shutdown: bool,
    configures: Vec<EngineSettings>,
    registers: Vec<OperationId>,
    registers_taken: usize,
    authenticates: Vec<AuthCredential>,
    authenticates_taken: usize,
    unregisters: usize,
    unregisters_taken: usize,
    shutdowns: usize,
    /// Request awaiting completion; guards the one-outstanding-request rule.
    outstanding: Option<OperationId>,
}

/// Engine double: records every call, hands out operation ids, and lets the
/// test deliver outcomes. Requests are checked against the invariant that a
/// new one is never issued while another is outstanding.
pub(crate) struct MockEngine {
    state: Mutex<EngineState>,
    notify: Notify,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState::default()),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    pub fn fail_create(&self, reason: &str) {
        self.lock().fail_create = Some(reason.to_string());
    }

    /// Accept shutdown requests but never confirm them.
    pub fn swallow_shutdown(&self) {
        self.lock().swallow_shutdown = true;
    }

    /// Deliver a completion for `operation`.
    pub fn complete(&self, operation: OperationId, outcome: Outcome) {
        let sink = {
            let mut state = self.lock();
            assert_eq!(
                state.outstanding,
                Some(operation),
                "completion for an operation with no outstanding request"
            );
            state.outstanding = None;
            state.sink.clone().expect("engine not created")
        };
        let _ = sink.send(EngineEvent::Operation { operation, outcome });
        self.notify.notify_waiters();
    }

    pub fn created_params(&self) -> EngineParams {
        self.lock().created.last().expect("engine not created").clone()
    }

    pub fn create_count(&self) -> usize {
        self.lock().created.len()
    }

    pub fn configure_count(&self) -> usize {
        self.lock().configures.len()
    }

    pub fn last_settings(&self) -> EngineSettings {
        self.lock().configures.last().expect("never configured").clone()
    }

    pub fn authenticate_count(&self) -> usize {
        self.lock().authenticates.len()
    }

    pub fn shutdown_count(&self) -> usize {
        self.lock().shutdowns
    }

    pub async fn wait_for_register(&self) -> OperationId {
        self.wait_until(|state| {
            if state.registers.len() > state.registers_taken {
                let op = state.registers[state.registers_taken];
                state.registers_taken += 1;
                Some(op)
            } else {
                None
            }
        })
        .await
    }

    pub async fn wait_for_authenticate(&self) -> AuthCredential {
        self.wait_until(|state| {
            if state.authenticates.len() > state.authenticates_taken {
                let credential = state.authenticates[state.authenticates_taken].clone();
                state.authenticates_taken += 1;
                Some(credential)
            } else {
                None
            }
        })
        .await
    }

    pub async fn wait_for_unregister(&self) {
        self.wait_until(|state| {
            if state.unregisters > state.unregisters_taken {
                state.unregisters_taken += 1;
                Some(())
            } else {
                None
            }
        })
        .await
    }

    pub async fn wait_for_settings(&self, predicate: impl Fn(&EngineSettings) -> bool) {
        self.wait_until(|state| {
            if state.configures.iter().any(&predicate) {
                Some(())
            } else {
                None
            }
        })
        .await
    }

    async fn wait_until<T>(&self, mut check: impl FnMut(&mut EngineState) -> Option<T>) -> T {
        tokio::time::timeout(WAIT_BUDGET, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // Register for wakeups before checking, so a notification
                // between the check and the await is not lost.
                notified.as_mut().enable();
                if let Some(value) = check(&mut self.lock()) {
                    return value;
                }
                notified.await;
            }
        })
        .await
        .expect("mock engine wait timed out")
    }
}

impl SignalingEngine for MockEngine {
    fn create(&self, params: EngineParams, events: EngineEventSink) -> Result<EngineHandle> {
        let mut state = self.lock();
        if let Some(reason) = &state.fail_create {
            return Err(Error::EngineCreationFailed(reason.clone()));
        }
        state.created.push(params);
        state.sink = Some(events);
        let handle = EngineHandle::from_raw(state.created.len() as u64);
        drop(state);
        self.notify.notify_waiters();
        Ok(handle)
    }

    fn configure(&self, _engine: EngineHandle, settings: &EngineSettings) -> Result<()> {
        self.lock().configures.push(settings.clone());
        self.notify.notify_waiters();
        Ok(())
    }

    fn request(&self, _engine: EngineHandle, request: EngineRequest) -> Result<OperationId> {
        let mut state = self.lock();
        assert!(
            state.outstanding.is_none(),
            "request issued while another is outstanding: {request:?}"
        );
        let operation = match &request {
            EngineRequest::Register { .. } => {
                state.next_op += 1;
                let operation = OperationId::from_raw(state.next_op);
                state.registers.push(operation);
                operation
            }
            EngineRequest::Authenticate {
                operation,
                credential,
            } => {
                state.authenticates.push(credential.clone());
                *operation
            }
            EngineRequest::Unregister => {
                state.unregisters += 1;
                *state.registers.last().expect("unregister without register")
            }
        };
        state.outstanding = Some(operation);
        drop(state);
        self.notify.notify_waiters();
        Ok(operation)
    }

    fn shutdown(&self, _engine: EngineHandle) -> Result<()> {
        let sink = {
            let mut state = self.lock();
            state.shutdowns += 1;
            if state.swallow_shutdown {
                None
            } else {
                state.sink.clone()
            }
        };
        if let Some(sink) = sink {
            let _ = sink.send(EngineEvent::ShutdownComplete);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[derive(Default)]
struct ResolverState {
    hosts: HashMap<String, Vec<IpAddr>>,
    srv: HashMap<String, Vec<SrvTarget>>,
    held: bool,
}

/// Resolver double with scripted answers; responses can be held back to keep
/// a query in flight.
pub(crate) struct MockResolver {
    state: Mutex<ResolverState>,
    release: Notify,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ResolverState::default()),
            release: Notify::new(),
        })
    }

    pub fn set_host(&self, host: &str, addresses: Vec<IpAddr>) {
        self.state.lock().unwrap().hosts.insert(host.to_string(), addresses);
    }

    #[allow(dead_code)]
    pub fn set_srv(&self, name: &str, targets: Vec<SrvTarget>) {
        self.state.lock().unwrap().srv.insert(name.to_string(), targets);
    }

    pub fn hold_responses(&self) {
        self.state.lock().unwrap().held = true;
    }

    pub fn release_responses(&self) {
        self.state.lock().unwrap().held = false;
        self.release.notify_waiters();
    }

    async fn pause(&self) {
        loop {
            let released = self.release.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if !self.state.lock().unwrap().held {
                return;
            }
            released.await;
        }
    }
}

#[async_trait]
impl NameResolver for MockResolver {
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.pause().await;
        self.state
            .lock()
            .unwrap()
            .hosts
            .get(host)
            .cloned()
            .ok_or_else(|| Error::DiscoveryFailed(format!("unknown host {host}")))
    }

    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>> {
        self.pause().await;
        self.state
            .lock()
            .unwrap()
            .srv
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DiscoveryFailed(format!("no records for {name}")))
    }
}
