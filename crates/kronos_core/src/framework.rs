//! The framework context.
//!
//! [`Framework`] owns every registry of a running system: modules,
//! components, buses and drivers, plus the shared [`MessagePool`]. It replaces
//! a process-wide singleton with an explicit value that is threaded through
//! module initialization.
//!
//! ## Boot sequence
//!
//! 1. [`Framework::add_module`] for every module, in any order.
//! 2. [`Framework::init_modules`] resolves the dependency order and runs each
//!    module's `init`, which creates components, buses and drivers.
//! 3. [`Framework::start`] runs `init`, then `post_init`, then `start` on
//!    every component in registration order.
//! 4. [`Framework::shutdown`] destroys components in reverse order.
//!
//! Registries are mutated only through `&mut Framework` during boot and are
//! read-only once started.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bus::{Bus, BusKind};
use crate::component::{Component, Concurrency, ConcurrencyKind, Handler, LifecycleState};
use crate::config::KronosConfig;
use crate::driver::IoDriver;
use crate::error::{KronosError, Result};
use crate::message::{MessageHandle, Opcode, Payload};
use crate::module::{Module, ModuleId, resolve_order};
use crate::pool::MessagePool;

/// Registry and lifecycle owner of a Kronos system.
pub struct Framework {
    config: KronosConfig,
    instance_id: Uuid,
    pool: Arc<MessagePool>,
    modules: Vec<Arc<dyn Module>>,
    module_order: Vec<ModuleId>,
    modules_initialized: bool,
    components: Vec<Arc<Component>>,
    component_index: HashMap<String, usize>,
    active_components: Vec<Arc<Component>>,
    buses: HashMap<String, Arc<Bus>>,
    drivers: HashMap<String, Arc<dyn IoDriver>>,
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("instance_id", &self.instance_id)
            .field("modules", &self.modules.len())
            .field("components", &self.components.len())
            .field("buses", &self.buses.len())
            .field("drivers", &self.drivers.len())
            .finish_non_exhaustive()
    }
}

impl Framework {
    /// Create an empty framework.
    #[must_use]
    pub fn new(config: KronosConfig) -> Self {
        let pool = Arc::new(MessagePool::new(config.pool.clone()));
        let instance_id = Uuid::new_v4();
        debug!(%instance_id, "framework created");
        Self {
            config,
            instance_id,
            pool,
            modules: Vec::new(),
            module_order: Vec::new(),
            modules_initialized: false,
            components: Vec::new(),
            component_index: HashMap::new(),
            active_components: Vec::new(),
            buses: HashMap::new(),
            drivers: HashMap::new(),
        }
    }

    /// The configuration this framework was built with.
    #[must_use]
    pub fn config(&self) -> &KronosConfig {
        &self.config
    }

    /// Identifier of this boot, attached to log output.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The shared message pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    // ── Modules ─────────────────────────────────────────────────────────

    /// Register a module.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::DuplicateModule`] if a module with the same id
    /// was already added.
    pub fn add_module(&mut self, module: impl Module + 'static) -> Result<()> {
        let id = module.id();
        if self.has_module(&id) {
            return Err(KronosError::DuplicateModule(id));
        }
        debug!(module = %id, "module added");
        self.modules.push(Arc::new(module));
        Ok(())
    }

    /// Returns `true` if a module with this id was added.
    #[must_use]
    pub fn has_module(&self, id: &ModuleId) -> bool {
        self.modules.iter().any(|m| m.id() == *id)
    }

    /// Initialize every module, dependencies first.
    ///
    /// The order is resolved before any module runs, so a broken dependency
    /// graph leaves every module uninitialized. Afterwards each module's
    /// exported components must exist.
    ///
    /// # Errors
    ///
    /// - [`KronosError::ModulesAlreadyInitialized`] on a second call.
    /// - [`KronosError::MissingModule`] / [`KronosError::CyclicDependency`]
    ///   for a broken dependency graph.
    /// - [`KronosError::MissingComponent`] for an export that was never
    ///   created.
    /// - Any error returned by a module's `init`.
    pub fn init_modules(&mut self) -> Result<()> {
        if self.modules_initialized {
            return Err(KronosError::ModulesAlreadyInitialized);
        }

        let graph: Vec<(ModuleId, Vec<ModuleId>)> = self
            .modules
            .iter()
            .map(|m| (m.id(), m.dependencies()))
            .collect();
        let order = resolve_order(&graph)?;
        self.modules_initialized = true;

        for id in &order {
            let Some(module) = self.modules.iter().find(|m| m.id() == *id).cloned() else {
                return Err(KronosError::MissingModule(id.clone()));
            };
            debug!(module = %id, name = %module.name(), "initializing module");
            module.init(self)?;
        }
        self.module_order = order;

        for module in &self.modules {
            for name in module.exported_components() {
                if !self.component_index.contains_key(name) {
                    error!(module = %module.id(), component = name, "exported component missing");
                    return Err(KronosError::MissingComponent(name.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Module ids in the order they were initialized. Empty before
    /// [`Framework::init_modules`] succeeded.
    #[must_use]
    pub fn module_order(&self) -> &[ModuleId] {
        &self.module_order
    }

    // ── Components ──────────────────────────────────────────────────────

    /// Create and register a component.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::DuplicateComponent`] if the name is taken.
    pub fn create_component(
        &mut self,
        name: impl Into<String>,
        concurrency: Concurrency,
        handler: impl Handler,
    ) -> Result<Arc<Component>> {
        let name = name.into();
        if self.component_index.contains_key(&name) {
            return Err(KronosError::DuplicateComponent(name));
        }

        let component = Component::new(name.clone(), concurrency, handler, Arc::clone(&self.pool));
        if component.kind() == ConcurrencyKind::Active {
            self.active_components.push(Arc::clone(&component));
        }
        self.component_index.insert(name, self.components.len());
        self.components.push(Arc::clone(&component));
        debug!(component = component.name(), kind = ?component.kind(), "component created");
        Ok(component)
    }

    /// Look a component up by name.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::MissingComponent`] if no such component exists.
    pub fn component(&self, name: &str) -> Result<Arc<Component>> {
        self.component_index
            .get(name)
            .map(|&i| Arc::clone(&self.components[i]))
            .ok_or_else(|| KronosError::MissingComponent(name.to_string()))
    }

    /// Every component, in registration order.
    #[must_use]
    pub fn components(&self) -> &[Arc<Component>] {
        &self.components
    }

    /// Active components, in registration order.
    #[must_use]
    pub fn active_components(&self) -> &[Arc<Component>] {
        &self.active_components
    }

    // ── Buses ───────────────────────────────────────────────────────────

    /// Create and register a bus.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::DuplicateBus`] if the name is taken.
    pub fn create_bus(&mut self, name: impl Into<String>, kind: BusKind) -> Result<Arc<Bus>> {
        let bus = Arc::new(Bus::new(name, kind, Arc::clone(&self.pool)));
        self.add_bus(Arc::clone(&bus))?;
        Ok(bus)
    }

    /// Register a bus built elsewhere, for example by a service that owns
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::DuplicateBus`] if the name is taken.
    pub fn add_bus(&mut self, bus: Arc<Bus>) -> Result<()> {
        if self.buses.contains_key(bus.name()) {
            return Err(KronosError::DuplicateBus(bus.name().to_string()));
        }
        debug!(bus = bus.name(), kind = ?bus.kind(), "bus created");
        self.buses.insert(bus.name().to_string(), bus);
        Ok(())
    }

    /// Look a bus up by name.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::MissingBus`] if no such bus exists.
    pub fn bus(&self, name: &str) -> Result<Arc<Bus>> {
        self.buses
            .get(name)
            .cloned()
            .ok_or_else(|| KronosError::MissingBus(name.to_string()))
    }

    /// Subscribe a component to a bus, both by name.
    ///
    /// Returns `false` if the component was already subscribed.
    ///
    /// # Errors
    ///
    /// [`KronosError::MissingBus`] or [`KronosError::MissingComponent`].
    pub fn subscribe(&self, bus: &str, component: &str) -> Result<bool> {
        let bus = self.bus(bus)?;
        let component = self.component(component)?;
        Ok(bus.subscribe(&component))
    }

    // ── Drivers ─────────────────────────────────────────────────────────

    /// Register a driver.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::DuplicateDriver`] if the name is taken.
    pub fn create_driver(
        &mut self,
        name: impl Into<String>,
        driver: impl IoDriver + 'static,
    ) -> Result<Arc<dyn IoDriver>> {
        let name = name.into();
        if self.drivers.contains_key(&name) {
            return Err(KronosError::DuplicateDriver(name));
        }
        let driver: Arc<dyn IoDriver> = Arc::new(driver);
        debug!(driver = %name, "driver created");
        self.drivers.insert(name, Arc::clone(&driver));
        Ok(driver)
    }

    /// Look a driver up by name.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::MissingDriver`] if no such driver exists.
    pub fn driver(&self, name: &str) -> Result<Arc<dyn IoDriver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| KronosError::MissingDriver(name.to_string()))
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Create a message in the shared pool. The returned handle holds one
    /// reference, to be given to [`Bus::publish`] or released.
    pub fn create_message(
        &self,
        opcode: Opcode,
        payload: Payload,
        reply: Option<&Arc<Bus>>,
    ) -> MessageHandle {
        self.pool.create(opcode, payload, reply)
    }

    /// Release one reference of a message.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::MissingMessage`] if the handle is stale.
    pub fn release_message(&self, handle: MessageHandle) -> Result<bool> {
        self.pool.release(handle)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Initialize and start every component.
    ///
    /// Runs three passes in registration order: `init`, `post_init`, then
    /// `start`. Active components spawn their tasks in the first pass, so
    /// this must be called from within a tokio runtime when any exist.
    ///
    /// # Errors
    ///
    /// The first component failure aborts the sequence.
    pub fn start(&self) -> Result<()> {
        info!(instance_id = %self.instance_id, "==== kronos framework starting ====");
        for id in &self.module_order {
            info!(module = %id, "module initialized");
        }

        for component in &self.components {
            component.init()?;
        }
        for component in &self.components {
            component.post_init()?;
        }
        for component in &self.components {
            component.start()?;
        }

        info!(
            components = self.components.len(),
            active = self.active_components.len(),
            buses = self.buses.len(),
            "framework started"
        );
        Ok(())
    }

    /// Destroy every initialized component, in reverse registration order.
    ///
    /// Failures are logged and do not stop the teardown.
    pub fn shutdown(&self) {
        for component in self.components.iter().rev() {
            if !matches!(
                component.state(),
                LifecycleState::Initialized | LifecycleState::Running
            ) {
                continue;
            }
            if let Err(err) = component.destroy() {
                error!(component = component.name(), %err, "failed to destroy component");
            }
        }
        info!(
            instance_id = %self.instance_id,
            live_messages = self.pool.live(),
            "framework shut down"
        );
    }
}
