//! Daemon-scope service wiring.
//!
//! Everything the lifecycle needs is registered here as a lazy factory; the
//! coordinator resolves services in the order it wants them created, which
//! is also the reverse of the order they are closed.

use std::sync::Arc;

use ember_core::{
    AuthToken, ConcurrencyPolicy, DaemonContext, DaemonRegistry, ExecutorFactory, ExecutorPool,
    IdleTimeout, ServiceError, ServiceKey, ServiceRegistry,
};

use crate::activity::CommandTracker;
use crate::connector::{Connector, TcpConnector};
use crate::executer::{CommandExecuter, DaemonCommandExecuter};
use crate::lifecycle::{StartParameters, StopHandle};

pub const COMMAND_POOL: &str = "daemon-commands";

/// Pool that runs one [`CommandExecuter::execute`] per accepted connection.
#[derive(Debug)]
pub struct CommandPool(pub Arc<ExecutorPool>);

/// Replacements for the default connector and command executer.
#[derive(Clone, Default)]
pub struct ServiceOverrides {
    pub connector: Option<Arc<dyn Connector>>,
    pub command_executer: Option<Arc<dyn CommandExecuter>>,
}

/// Register the daemon services into `registry`.
pub fn register_daemon_services(
    registry: &ServiceRegistry,
    params: &StartParameters,
    stop: StopHandle,
    overrides: ServiceOverrides,
) -> Result<(), ServiceError> {
    let grace = params.grace_period;
    registry.register_closable(&[], move |_| Ok(Arc::new(ExecutorFactory::with_grace_period(grace))))?;

    let idle_setting = params.idle_timeout_ms;
    registry.register_factory(&[], move |_| Ok(Arc::new(IdleTimeout::from_millis_setting(idle_setting))))?;

    let registry_dir = params.registry_dir.clone();
    let options = params.options.clone();
    registry.register_factory(&[ServiceKey::of::<IdleTimeout>()], move |services| {
        let idle = services.get::<IdleTimeout>()?;
        let context = DaemonContext::builder(registry_dir.clone())
            .idle_timeout(idle.timeout())
            .pid(std::process::id())
            .options(options.clone())
            .build();
        Ok(Arc::new(context))
    })?;

    registry.register_factory(&[ServiceKey::of::<DaemonContext>()], |services| {
        let context = services.get::<DaemonContext>()?;
        Ok(Arc::new(DaemonRegistry::new(context.registry_dir())))
    })?;

    registry.register_factory(&[ServiceKey::of::<IdleTimeout>()], |services| {
        Ok(Arc::new(CommandTracker::new(services.get::<IdleTimeout>()?)))
    })?;

    registry.register_instance(Arc::new(AuthToken::generate()))?;
    registry.register_instance(Arc::new(stop))?;

    registry.register_factory(&[ServiceKey::of::<ExecutorFactory>()], |services| {
        let pool = services
            .get::<ExecutorFactory>()?
            .new_pool(COMMAND_POOL, ConcurrencyPolicy::Unbounded)
            .map_err(|err| ServiceError::creation(ServiceKey::of::<CommandPool>().name(), err))?;
        Ok(Arc::new(CommandPool(pool)))
    })?;

    match overrides.connector {
        Some(connector) => registry.register_instance(connector)?,
        None => {
            let bind = params.bind_address;
            registry.register_factory::<dyn Connector, _>(&[], move |_| {
                Ok(Arc::new(TcpConnector::new(bind)) as Arc<dyn Connector>)
            })?;
        }
    }

    match overrides.command_executer {
        Some(executer) => registry.register_instance(executer)?,
        None => {
            let deps = [
                ServiceKey::of::<DaemonContext>(),
                ServiceKey::of::<AuthToken>(),
                ServiceKey::of::<StopHandle>(),
                ServiceKey::of::<CommandTracker>(),
            ];
            registry.register_factory::<dyn CommandExecuter, _>(&deps, |services| {
                let executer = DaemonCommandExecuter::new(
                    services.get::<DaemonContext>()?,
                    services.get::<AuthToken>()?,
                    services.get::<StopHandle>()?,
                    services.get::<CommandTracker>()?,
                );
                Ok(Arc::new(executer) as Arc<dyn CommandExecuter>)
            })?;
        }
    }

    Ok(())
}
