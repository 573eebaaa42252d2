//! The Resource Multiplexer (§4.4): routes command and query payloads addressed by
//! `(resource_id, type_id)` to a lazily-created [`StateMachineDriver`](crate::driver::StateMachineDriver),
//! and reaps instances once they have gone quiescent.
//!
//! Concrete resource state machines are an external collaborator; this module only owns
//! instance lifecycle and dispatch, the same separation the `raft` crate draws between its
//! `Log` trait and whatever actually backs it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use protocol::{Consistency, ResourceId, SessionId, TypeId};

use crate::driver::{StateMachine, StateMachineDriver};
use crate::error::{ApplicationError, FatalError};

/// Builds a fresh state machine instance for a registered type.
///
/// Boxed as `Send` because instances are driven from pool worker threads.
pub type StateMachineFactory = Box<dyn Fn() -> Box<dyn StateMachine> + Send + Sync>;

/// Registry of resource types known to this engine, sealed before first use.
///
/// Grounded on the "register once, seal, then only read" pattern the `raft` crate uses for
/// `Config`: registration happens during process startup, dispatch never needs to take a write
/// lock to discover a factory.
pub struct TypeRegistry {
    factories: HashMap<TypeId, StateMachineFactory>,
    sealed: bool,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry {
            factories: HashMap::new(),
            sealed: false,
        }
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for `type_id`. Panics if called after [`seal`](Self::seal) or twice
    /// for the same type: both are programmer errors made during process wiring, not runtime
    /// conditions callers need to recover from.
    pub fn register(&mut self, type_id: TypeId, factory: StateMachineFactory) {
        assert!(!self.sealed, "TypeRegistry::register called after seal()");
        assert!(
            self.factories.insert(type_id, factory).is_none(),
            "type {} registered twice",
            type_id
        );
    }

    pub fn seal(self) -> SealedTypeRegistry {
        SealedTypeRegistry {
            factories: self.factories,
        }
    }
}

/// An immutable, shared view of a [`TypeRegistry`] after startup registration has finished.
pub struct SealedTypeRegistry {
    factories: HashMap<TypeId, StateMachineFactory>,
}

impl SealedTypeRegistry {
    fn build(&self, type_id: TypeId) -> Option<Box<dyn StateMachine>> {
        self.factories.get(&type_id).map(|factory| factory())
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.factories.contains_key(&type_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    Open,
    Quiescent,
}

struct ResourceInstance {
    type_id: TypeId,
    driver: Arc<StateMachineDriver>,
    state: InstanceState,
    open_sessions: std::collections::BTreeSet<SessionId>,
}

/// Routes requests addressed by `(resource_id, type_id)` to the matching driver, creating an
/// instance on first use and tearing it down once quiescent.
pub struct ResourceMultiplexer {
    registry: Arc<SealedTypeRegistry>,
    instances: RwLock<HashMap<ResourceId, Mutex<ResourceInstance>>>,
    pool: Arc<rayon::ThreadPool>,
    fatal: crossbeam_channel::Sender<FatalError>,
}

impl ResourceMultiplexer {
    pub fn new(
        registry: SealedTypeRegistry,
        pool: Arc<rayon::ThreadPool>,
        fatal: crossbeam_channel::Sender<FatalError>,
    ) -> Self {
        ResourceMultiplexer {
            registry: Arc::new(registry),
            instances: RwLock::new(HashMap::new()),
            pool,
            fatal,
        }
    }

    /// Returns the driver for `(resource_id, type_id)`, creating and registering the session as
    /// an opener of the instance if this is the first time the pair has been seen.
    ///
    /// # Errors
    ///
    /// `UnknownType` if `type_id` was never registered. `UnknownResource` is reserved for
    /// dispatch against a resource that existed but was reaped out from under the caller; open()
    /// never returns it since it is the path that creates resources.
    fn open(
        &self,
        resource_id: ResourceId,
        type_id: TypeId,
        session_id: SessionId,
    ) -> Result<Arc<StateMachineDriver>, ApplicationError> {
        {
            let instances = self.instances.read().unwrap();
            if let Some(instance) = instances.get(&resource_id) {
                let mut instance = instance.lock().unwrap();
                if instance.type_id != type_id {
                    return Err(ApplicationError::UnknownType(type_id.get()));
                }
                let newly_opened = instance.open_sessions.insert(session_id);
                instance.state = InstanceState::Open;
                let driver = instance.driver.clone();
                drop(instance);
                if newly_opened {
                    driver.on_register(session_id);
                }
                return Ok(driver);
            }
        }

        if !self.registry.contains(type_id) {
            return Err(ApplicationError::UnknownType(type_id.get()));
        }

        let mut instances = self.instances.write().unwrap();
        // Another thread may have created the instance between the read lock dropping above and
        // this write lock being taken; re-check before building a redundant machine.
        if let Some(instance) = instances.get(&resource_id) {
            let mut instance = instance.lock().unwrap();
            if instance.type_id != type_id {
                return Err(ApplicationError::UnknownType(type_id.get()));
            }
            let newly_opened = instance.open_sessions.insert(session_id);
            instance.state = InstanceState::Open;
            let driver = instance.driver.clone();
            drop(instance);
            if newly_opened {
                driver.on_register(session_id);
            }
            return Ok(driver);
        }

        let machine = self
            .registry
            .build(type_id)
            .ok_or(ApplicationError::UnknownType(type_id.get()))?;
        let driver = Arc::new(StateMachineDriver::new(
            resource_id,
            machine,
            self.pool.clone(),
            self.fatal.clone(),
        ));
        let mut open_sessions = std::collections::BTreeSet::new();
        open_sessions.insert(session_id);
        instances.insert(
            resource_id,
            Mutex::new(ResourceInstance {
                type_id,
                driver: driver.clone(),
                state: InstanceState::Open,
                open_sessions,
            }),
        );
        driver.on_register(session_id);
        Ok(driver)
    }

    /// Applies a command against the resource, lazily opening it first.
    pub fn dispatch_command(
        &self,
        resource_id: ResourceId,
        type_id: TypeId,
        session_id: SessionId,
        payload: Vec<u8>,
    ) -> Result<(Vec<u8>, Vec<(SessionId, Vec<u8>)>), ApplicationError> {
        let driver = self.open(resource_id, type_id, session_id)?;
        driver.apply_command(session_id, payload)
    }

    /// Evaluates a query against the resource, lazily opening it first.
    pub fn dispatch_query(
        &self,
        resource_id: ResourceId,
        type_id: TypeId,
        session_id: SessionId,
        payload: Vec<u8>,
        consistency: Consistency,
    ) -> Result<Vec<u8>, ApplicationError> {
        let driver = self.open(resource_id, type_id, session_id)?;
        driver.apply_query(session_id, payload, consistency)
    }

    /// Notifies every open resource that `session_id` unregistered, expired, or closed, so
    /// embedded state machines can release any per-session bookkeeping of their own.
    ///
    /// `on_register` has no counterpart here: it is delivered from [`Self::open`] exactly once,
    /// the moment a session is first added to an instance's `open_sessions`, rather than on every
    /// dispatch.
    pub fn on_session_unregister(&self, resource_id: ResourceId, session_id: SessionId) {
        self.release(resource_id, session_id);
        if let Some(driver) = self.driver_of(resource_id) {
            driver.on_unregister(session_id);
        }
    }

    pub fn on_session_expire(&self, resource_id: ResourceId, session_id: SessionId) {
        self.release(resource_id, session_id);
        if let Some(driver) = self.driver_of(resource_id) {
            driver.on_expire(session_id);
        }
    }

    fn driver_of(&self, resource_id: ResourceId) -> Option<Arc<StateMachineDriver>> {
        let instances = self.instances.read().unwrap();
        instances
            .get(&resource_id)
            .map(|instance| instance.lock().unwrap().driver.clone())
    }

    fn release(&self, resource_id: ResourceId, session_id: SessionId) {
        let instances = self.instances.read().unwrap();
        if let Some(instance) = instances.get(&resource_id) {
            let mut instance = instance.lock().unwrap();
            instance.open_sessions.remove(&session_id);
        }
    }

    /// Destroys every instance whose driver reports quiescence and which no session still holds
    /// open. Intended to be called periodically by the owning engine, mirroring the `raft`
    /// crate's own tick-driven maintenance loop rather than reaping inline on every dispatch.
    pub fn reap(&self) -> usize {
        let candidates: Vec<ResourceId> = {
            let instances = self.instances.read().unwrap();
            instances
                .iter()
                .filter_map(|(id, instance)| {
                    let instance = instance.lock().unwrap();
                    let reapable =
                        instance.open_sessions.is_empty() && instance.driver.is_quiescent();
                    if reapable {
                        Some(*id)
                    } else {
                        None
                    }
                })
                .collect()
        };

        if candidates.is_empty() {
            return 0;
        }

        let mut instances = self.instances.write().unwrap();
        let mut reaped = 0;
        for id in candidates {
            // Re-check under the write lock: a session may have reopened the resource between
            // the scan above and taking this lock.
            let still_reapable = instances
                .get(&id)
                .map(|instance| {
                    let instance = instance.lock().unwrap();
                    instance.open_sessions.is_empty() && instance.driver.is_quiescent()
                })
                .unwrap_or(false);
            if still_reapable {
                instances.remove(&id);
                reaped += 1;
            }
        }
        reaped
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::CounterMachine;

    fn registry_with_counter() -> SealedTypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register(
            TypeId(1),
            Box::new(|| Box::new(CounterMachine::default()) as Box<dyn StateMachine>),
        );
        registry.seal()
    }

    fn pool() -> Arc<rayon::ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap())
    }

    fn fatal_tx() -> crossbeam_channel::Sender<crate::error::FatalError> {
        crossbeam_channel::unbounded().0
    }

    #[test]
    fn dispatch_lazily_creates_and_reuses_instance() {
        let mux = ResourceMultiplexer::new(registry_with_counter(), pool(), fatal_tx());
        let resource_id = ResourceId(7);
        let sid = SessionId(1);

        assert_eq!(mux.instance_count(), 0);
        let (result, _) = mux
            .dispatch_command(resource_id, TypeId(1), sid, b"inc".to_vec())
            .unwrap();
        assert_eq!(result, b"1");
        assert_eq!(mux.instance_count(), 1);

        let (result, _) = mux
            .dispatch_command(resource_id, TypeId(1), sid, b"inc".to_vec())
            .unwrap();
        assert_eq!(result, b"2");
        assert_eq!(mux.instance_count(), 1);
    }

    #[test]
    fn dispatch_against_unregistered_type_is_an_error() {
        let mux = ResourceMultiplexer::new(registry_with_counter(), pool(), fatal_tx());
        let err = mux
            .dispatch_command(ResourceId(1), TypeId(99), SessionId(1), b"inc".to_vec())
            .unwrap_err();
        assert_eq!(err, ApplicationError::UnknownType(99));
    }

    /// Records how many times `on_register` fires, to pin down delivery-once semantics
    /// independent of `CounterMachine`'s idempotent `BTreeSet` bookkeeping.
    struct RegisterCountingMachine {
        register_calls: Arc<std::sync::atomic::AtomicUsize>,
        inner: CounterMachine,
    }

    impl StateMachine for RegisterCountingMachine {
        fn on_register(&mut self, session_id: SessionId) {
            self.register_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.on_register(session_id);
        }
        fn on_unregister(&mut self, session_id: SessionId) {
            self.inner.on_unregister(session_id);
        }
        fn on_expire(&mut self, session_id: SessionId) {
            self.inner.on_expire(session_id);
        }
        fn on_close(&mut self, session_id: SessionId) {
            self.inner.on_close(session_id);
        }
        fn apply_command(
            &mut self,
            session_id: SessionId,
            payload: &[u8],
            publish: &mut dyn FnMut(SessionId, Vec<u8>),
        ) -> Result<Vec<u8>, ApplicationError> {
            self.inner.apply_command(session_id, payload, publish)
        }
        fn apply_query(
            &mut self,
            session_id: SessionId,
            payload: &[u8],
            consistency: Consistency,
        ) -> Result<Vec<u8>, ApplicationError> {
            self.inner.apply_query(session_id, payload, consistency)
        }
        fn is_quiescent(&self) -> bool {
            self.inner.is_quiescent()
        }
        fn snapshot(&self, writer: &mut dyn std::io::Write) -> std::io::Result<()> {
            self.inner.snapshot(writer)
        }
        fn restore(&mut self, reader: &mut dyn std::io::Read) -> std::io::Result<()> {
            self.inner.restore(reader)
        }
    }

    #[test]
    fn on_register_fires_once_on_first_open_not_on_every_dispatch() {
        let register_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = register_calls.clone();
        let mut registry = TypeRegistry::new();
        registry.register(
            TypeId(1),
            Box::new(move || {
                Box::new(RegisterCountingMachine {
                    register_calls: counted.clone(),
                    inner: CounterMachine::default(),
                }) as Box<dyn StateMachine>
            }),
        );
        let mux = ResourceMultiplexer::new(registry.seal(), pool(), fatal_tx());
        let resource_id = ResourceId(7);
        let sid = SessionId(1);

        mux.dispatch_command(resource_id, TypeId(1), sid, b"inc".to_vec())
            .unwrap();
        assert_eq!(register_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Further commands from the same already-open session must not re-fire on_register.
        mux.dispatch_command(resource_id, TypeId(1), sid, b"inc".to_vec())
            .unwrap();
        mux.dispatch_command(resource_id, TypeId(1), sid, b"inc".to_vec())
            .unwrap();
        assert_eq!(register_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // A second session opening the same resource does get its own on_register.
        let other = SessionId(2);
        mux.dispatch_command(resource_id, TypeId(1), other, b"inc".to_vec())
            .unwrap();
        assert_eq!(register_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn reap_destroys_only_quiescent_unreferenced_instances() {
        let mux = ResourceMultiplexer::new(registry_with_counter(), pool(), fatal_tx());
        let resource_id = ResourceId(7);
        let sid = SessionId(1);

        mux.dispatch_command(resource_id, TypeId(1), sid, b"inc".to_vec())
            .unwrap();
        assert_eq!(mux.reap(), 0, "session still holds the resource open");

        mux.on_session_unregister(resource_id, sid);
        assert_eq!(mux.reap(), 1);
        assert_eq!(mux.instance_count(), 0);
    }
}
