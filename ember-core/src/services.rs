//! Lazy, hierarchical service registry.
//!
//! Capabilities are keyed by type. Each registration is either a pre-built
//! instance or a factory that receives the registry it was registered in.
//! Factories run at most once per registration, on first successful lookup,
//! and every caller observes the same `Arc`.
//!
//! ```text
//! process registry (parent)
//!   └── daemon registry (child)  : local registrations shadow the parent's
//! ```
//!
//! Factories declare the keys they depend on. Before a factory runs, the
//! declared graph reachable from its key is checked, so an `A -> B -> A`
//! wiring fails with [`ServiceError::CyclicDependency`] before either factory
//! executes. Undeclared nested lookups that loop back are caught at run time:
//! on one thread through a per-thread resolution stack, across threads by
//! walking the process-wide record of which thread waits on which service
//! before blocking on it.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, TryLockError};
use std::thread::{self, ThreadId};

use crate::error::ServiceError;

/// Boxed error returned by [`Close::close`].
pub type CloseError = Box<dyn std::error::Error + Send + Sync>;

/// A service that owns resources which must be released on registry close.
pub trait Close: Send + Sync {
    fn close(&self) -> Result<(), CloseError>;
}

/// Identifies a capability by its type.
#[derive(Clone, Copy)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// The boxed value is always an `Arc<T>` for the registration's `T`.
type AnyInstance = Box<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn(&ServiceRegistry) -> Result<AnyInstance, ServiceError> + Send + Sync>;
type Closer = Box<dyn Fn(&AnyInstance) -> Option<Arc<dyn Close>> + Send + Sync>;

struct Registration {
    key: ServiceKey,
    deps: Vec<ServiceKey>,
    factory: Option<Factory>,
    closer: Option<Closer>,
    instance: OnceLock<AnyInstance>,
    init: Mutex<()>,
    /// Thread currently running the factory.
    builder: Mutex<Option<ThreadId>>,
}

impl Registration {
    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }
}

thread_local! {
    static RESOLVING: RefCell<Vec<(usize, &'static str)>> = const { RefCell::new(Vec::new()) };
}

/// Marks a registration as under construction on this thread.
struct ResolvingGuard;

impl ResolvingGuard {
    fn enter(id: usize, name: &'static str) -> Result<Self, ServiceError> {
        RESOLVING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().position(|(seen, _)| *seen == id) {
                let mut chain: Vec<&'static str> = stack[pos..].iter().map(|(_, n)| *n).collect();
                chain.push(name);
                return Err(ServiceError::CyclicDependency { chain });
            }
            stack.push((id, name));
            Ok(ResolvingGuard)
        })
    }
}

impl Drop for ResolvingGuard {
    fn drop(&mut self) {
        RESOLVING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Threads blocked on another thread's factory, and the registration each
/// one waits for.
static WAITING: Mutex<Vec<(ThreadId, Arc<Registration>)>> = Mutex::new(Vec::new());

/// Holds a registration's init lock and marks the current thread as its
/// builder until dropped.
struct Building<'a> {
    registration: &'a Registration,
    _init: MutexGuard<'a, ()>,
}

impl Drop for Building<'_> {
    fn drop(&mut self) {
        *lock(&self.registration.builder) = None;
    }
}

impl<'a> Building<'a> {
    fn begin(registration: &'a Arc<Registration>) -> Result<Self, ServiceError> {
        let me = thread::current().id();
        let init = match registration.init.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                wait_for(me, registration)?;
                let guard = lock(&registration.init);
                lock(&WAITING).retain(|(waiter, _)| *waiter != me);
                guard
            }
        };
        *lock(&registration.builder) = Some(me);
        Ok(Self {
            registration: registration.as_ref(),
            _init: init,
        })
    }
}

/// Record that `me` is about to block on `target`, unless following the
/// chain of builders and what they wait on leads back to `me`.
fn wait_for(me: ThreadId, target: &Arc<Registration>) -> Result<(), ServiceError> {
    let mut waiting = lock(&WAITING);
    let mut chain = vec![target.key.name];
    let mut next = Arc::clone(target);
    loop {
        let Some(owner) = *lock(&next.builder) else {
            break;
        };
        if owner == me {
            // the last key in the chain is one this thread is building
            if let Some(held) = chain.last().copied() {
                chain.insert(0, held);
            }
            return Err(ServiceError::CyclicDependency { chain });
        }
        let Some(blocked_on) = waiting
            .iter()
            .find(|(waiter, _)| *waiter == owner)
            .map(|(_, registration)| Arc::clone(registration))
        else {
            break;
        };
        chain.push(blocked_on.key.name);
        next = blocked_on;
    }
    waiting.push((me, Arc::clone(target)));
    Ok(())
}

/// A scope of service registrations with an optional parent scope.
pub struct ServiceRegistry {
    name: String,
    parent: Option<Arc<ServiceRegistry>>,
    registrations: RwLock<HashMap<ServiceKey, Arc<Registration>>>,
    created: Mutex<Vec<(&'static str, Arc<dyn Close>)>>,
    closed: AtomicBool,
}

impl ServiceRegistry {
    /// Create a root registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Create a registry that falls back to `parent` for keys it lacks.
    pub fn with_parent(name: impl Into<String>, parent: Arc<ServiceRegistry>) -> Self {
        Self::build(name.into(), Some(parent))
    }

    /// Create a child scope of this registry.
    pub fn create_child(self: &Arc<Self>, name: impl Into<String>) -> Arc<ServiceRegistry> {
        Arc::new(Self::with_parent(name, Arc::clone(self)))
    }

    fn build(name: String, parent: Option<Arc<ServiceRegistry>>) -> Self {
        Self {
            name,
            parent,
            registrations: RwLock::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<ServiceRegistry>> {
        self.parent.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a pre-built instance.
    pub fn register_instance<T>(&self, instance: Arc<T>) -> Result<(), ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let instance_slot = OnceLock::new();
        let _ = instance_slot.set(Box::new(instance) as AnyInstance);
        self.insert(Registration {
            key: ServiceKey::of::<T>(),
            deps: Vec::new(),
            factory: None,
            closer: None,
            instance: instance_slot,
            init: Mutex::new(()),
            builder: Mutex::new(None),
        })
    }

    /// Register a factory. `deps` lists every key the factory looks up.
    pub fn register_factory<T, F>(&self, deps: &[ServiceKey], factory: F) -> Result<(), ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceRegistry) -> Result<Arc<T>, ServiceError> + Send + Sync + 'static,
    {
        self.insert(Registration {
            key: ServiceKey::of::<T>(),
            deps: deps.to_vec(),
            factory: Some(erase(factory)),
            closer: None,
            instance: OnceLock::new(),
            init: Mutex::new(()),
            builder: Mutex::new(None),
        })
    }

    /// Register a factory whose instance is closed when the registry closes.
    pub fn register_closable<T, F>(&self, deps: &[ServiceKey], factory: F) -> Result<(), ServiceError>
    where
        T: Close + 'static,
        F: Fn(&ServiceRegistry) -> Result<Arc<T>, ServiceError> + Send + Sync + 'static,
    {
        let closer: Closer = Box::new(|instance: &AnyInstance| {
            instance
                .downcast_ref::<Arc<T>>()
                .map(|service| Arc::clone(service) as Arc<dyn Close>)
        });
        self.insert(Registration {
            key: ServiceKey::of::<T>(),
            deps: deps.to_vec(),
            factory: Some(erase(factory)),
            closer: Some(closer),
            instance: OnceLock::new(),
            init: Mutex::new(()),
            builder: Mutex::new(None),
        })
    }

    fn insert(&self, registration: Registration) -> Result<(), ServiceError> {
        self.ensure_open()?;
        let mut registrations = write(&self.registrations);
        if registrations.contains_key(&registration.key) {
            return Err(ServiceError::DuplicateRegistration {
                service: registration.key.name,
                registry: self.name.clone(),
            });
        }
        tracing::trace!(registry = %self.name, service = registration.key.name, "registered service");
        registrations.insert(registration.key, Arc::new(registration));
        Ok(())
    }

    /// True when this registry or an ancestor can provide `T`.
    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.lookup(&ServiceKey::of::<T>()).is_ok()
    }

    /// Resolve `T`, creating it on first use.
    pub fn get<T>(&self) -> Result<Arc<T>, ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<T>();
        let (owner, registration) = self.lookup(&key)?;
        let instance = owner.instantiate(&registration)?;
        instance
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or_else(|| ServiceError::creation(key.name, "stored instance has a different type"))
    }

    /// Check every local registration's declared dependencies without
    /// running any factory.
    pub fn validate(&self) -> Result<(), ServiceError> {
        self.ensure_open()?;
        let keys: Vec<ServiceKey> = read(&self.registrations).keys().copied().collect();
        let mut done = HashSet::new();
        for key in keys {
            self.visit(key, &mut Vec::new(), &mut done)?;
        }
        Ok(())
    }

    /// Close every closable service this registry created, newest first.
    ///
    /// All services are attempted; the first failure is returned afterwards.
    /// Parents are not closed.
    pub fn close(&self) -> Result<(), ServiceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let created = std::mem::take(&mut *lock(&self.created));
        let mut first_error = None;
        for (service, instance) in created.into_iter().rev() {
            match instance.close() {
                Ok(()) => tracing::debug!(registry = %self.name, service, "closed service"),
                Err(source) => {
                    tracing::warn!(registry = %self.name, service, error = %source, "failed to close service");
                    first_error.get_or_insert(ServiceError::Close { service, source });
                }
            }
        }
        write(&self.registrations).clear();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), ServiceError> {
        if self.is_closed() {
            return Err(ServiceError::RegistryClosed {
                registry: self.name.clone(),
            });
        }
        Ok(())
    }

    fn local(&self, key: &ServiceKey) -> Option<Arc<Registration>> {
        read(&self.registrations).get(key).cloned()
    }

    /// Find the registry in the chain that owns `key`.
    fn lookup(&self, key: &ServiceKey) -> Result<(&ServiceRegistry, Arc<Registration>), ServiceError> {
        let mut searched = Vec::new();
        let mut current = self;
        loop {
            current.ensure_open()?;
            if let Some(registration) = current.local(key) {
                return Ok((current, registration));
            }
            searched.push(current.name.as_str());
            match &current.parent {
                Some(parent) => current = parent,
                None => {
                    return Err(ServiceError::Unresolved {
                        service: key.name,
                        searched: searched.join(" -> "),
                    })
                }
            }
        }
    }

    fn instantiate<'a>(&self, registration: &'a Arc<Registration>) -> Result<&'a AnyInstance, ServiceError> {
        if let Some(instance) = registration.instance.get() {
            return Ok(instance);
        }

        let _resolving = ResolvingGuard::enter(registration.id(), registration.key.name)?;
        let _building = Building::begin(registration)?;
        if let Some(instance) = registration.instance.get() {
            return Ok(instance);
        }

        let mut done = HashSet::new();
        let mut path = vec![registration.key];
        for dep in &registration.deps {
            self.visit(*dep, &mut path, &mut done)?;
        }

        let factory = registration.factory.as_ref().ok_or_else(|| {
            ServiceError::creation(registration.key.name, "registration has neither instance nor factory")
        })?;
        let instance = factory(self)?;
        let closable = registration.closer.as_ref().and_then(|closer| closer(&instance));

        // `close` flips `closed` before draining `created`, so checking under
        // the `created` lock cannot miss a concurrent close.
        {
            let mut created = lock(&self.created);
            if self.is_closed() {
                drop(created);
                if let Some(service) = closable {
                    if let Err(err) = service.close() {
                        tracing::warn!(registry = %self.name, service = registration.key.name, error = %err, "failed to close service created during registry close");
                    }
                }
                return Err(ServiceError::RegistryClosed {
                    registry: self.name.clone(),
                });
            }
            if let Some(service) = closable {
                created.push((registration.key.name, service));
            }
        }
        tracing::debug!(registry = %self.name, service = registration.key.name, "created service");

        Ok(registration.instance.get_or_init(|| instance))
    }

    /// Depth-first walk over declared dependencies.
    fn visit(
        &self,
        key: ServiceKey,
        path: &mut Vec<ServiceKey>,
        done: &mut HashSet<ServiceKey>,
    ) -> Result<(), ServiceError> {
        if let Some(pos) = path.iter().position(|seen| *seen == key) {
            let mut chain: Vec<&'static str> = path[pos..].iter().map(|k| k.name).collect();
            chain.push(key.name);
            return Err(ServiceError::CyclicDependency { chain });
        }
        if done.contains(&key) {
            return Ok(());
        }
        let (owner, registration) = self.lookup(&key)?;
        if registration.instance.get().is_none() {
            path.push(key);
            for dep in &registration.deps {
                owner.visit(*dep, path, done)?;
            }
            path.pop();
        }
        done.insert(key);
        Ok(())
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<ServiceKey> = read(&self.registrations).keys().copied().collect();
        f.debug_struct("ServiceRegistry")
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| p.name.clone()))
            .field("services", &keys)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn erase<T, F>(factory: F) -> Factory
where
    T: ?Sized + Send + Sync + 'static,
    F: Fn(&ServiceRegistry) -> Result<Arc<T>, ServiceError> + Send + Sync + 'static,
{
    Box::new(move |registry: &ServiceRegistry| factory(registry).map(|instance| Box::new(instance) as AnyInstance))
}

// Lock poisoning only means a factory panicked; the guarded data stays valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
