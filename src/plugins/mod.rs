//! Plugin system for dynamic node loading
//!
//! A `Module` wraps one dynamically loadable unit contributing node classes
//! to a factory. Its lifecycle is an explicit state machine
//! (unloaded -> loaded -> nodes-registered -> loaded -> unloaded) so code
//! can never be mapped with its classes half-visible.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libloading::{Library, Symbol};
use log::{debug, info, warn};

use crate::error::{raise, FlowError, Result};
use crate::nodes::factory::{NodeClass, NodeFactory};

/// Engine version prefix a plugin must declare compatibility with
const COMPATIBLE_PREFIX: &str = "0.1";

/// Static metadata declared by a plugin
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub compatible_version: String,
}

/// Implemented by every plugin's entry object
pub trait NodePlugin: Send + Sync {
    fn plugin_info(&self) -> PluginInfo;

    /// The node classes this plugin contributes
    fn node_classes(&self) -> Vec<NodeClass>;

    fn on_load(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn on_unload(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// FFI-safe wrapper a plugin's `create_plugin` entry point returns
#[repr(C)]
pub struct PluginHandle {
    raw: *mut Box<dyn NodePlugin>,
}

impl PluginHandle {
    pub fn new(plugin: Box<dyn NodePlugin>) -> Self {
        Self {
            raw: Box::into_raw(Box::new(plugin)),
        }
    }

    /// # Safety
    /// Must be called exactly once, on a handle produced by
    /// `PluginHandle::new` in a binary sharing this crate's ABI.
    pub unsafe fn into_plugin(self) -> Box<dyn NodePlugin> {
        *Box::from_raw(self.raw)
    }
}

/// Signature of the `create_plugin` symbol every plugin exports
pub type CreatePluginFn = unsafe extern "C" fn() -> PluginHandle;

/// Module load stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Unloaded,
    Loaded,
    NodesRegistered,
}

struct ModuleState {
    stage: LoadStage,
    path: Option<PathBuf>,
    // Declared before the library so the plugin drops first
    plugin: Option<Box<dyn NodePlugin>>,
    library: Option<Library>,
    info: Option<PluginInfo>,
}

/// A dynamically loadable unit contributing node classes to a factory
pub struct Module {
    factory: Arc<NodeFactory>,
    state: Mutex<ModuleState>,
}

impl Module {
    pub fn new(factory: &Arc<NodeFactory>) -> Arc<Module> {
        Arc::new(Module {
            factory: Arc::clone(factory),
            state: Mutex::new(ModuleState {
                stage: LoadStage::Unloaded,
                path: None,
                plugin: None,
                library: None,
                info: None,
            }),
        })
    }

    /// Open the backing plugin library.
    ///
    /// Fails with `ModuleLoadFailed` on a missing file, a missing
    /// `create_plugin` symbol, an incompatible declared version, or a
    /// failing plugin initializer. A no-op when already loaded.
    pub fn load(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.stage != LoadStage::Unloaded {
            debug!("module already loaded from {:?}", state.path);
            return Ok(());
        }
        if path.as_os_str().is_empty() {
            return Err(raise(FlowError::InvalidArgument(
                "module path cannot be empty".to_string(),
            )));
        }
        if !path.exists() {
            return Err(raise(FlowError::ModuleLoadFailed(format!(
                "module path does not exist: {}",
                path.display()
            ))));
        }

        let library = unsafe { Library::new(path) }.map_err(|e| {
            raise(FlowError::ModuleLoadFailed(format!(
                "failed to load library: {e}"
            )))
        })?;
        let create_plugin: Symbol<CreatePluginFn> =
            unsafe { library.get(b"create_plugin") }.map_err(|e| {
                raise(FlowError::ModuleLoadFailed(format!(
                    "missing create_plugin entry point: {e}"
                )))
            })?;
        let plugin = unsafe { create_plugin().into_plugin() };

        let info = plugin.plugin_info();
        if !info.compatible_version.starts_with(COMPATIBLE_PREFIX) {
            return Err(raise(FlowError::ModuleLoadFailed(format!(
                "plugin {} requires engine version {}, this engine is {}",
                info.name,
                info.compatible_version,
                env!("CARGO_PKG_VERSION")
            ))));
        }
        plugin.on_load().map_err(|e| {
            raise(FlowError::ModuleLoadFailed(format!(
                "plugin initialization failed: {e}"
            )))
        })?;

        info!("loaded plugin {} v{}", info.name, info.version);
        state.path = Some(path.to_path_buf());
        state.plugin = Some(plugin);
        state.info = Some(info);
        state.library = Some(library);
        state.stage = LoadStage::Loaded;
        Ok(())
    }

    /// Register the plugin's node classes into the factory, atomically.
    ///
    /// Fails with `ModuleLoadFailed` before `load`, or when a class id
    /// collides with one registered from elsewhere, in which case nothing
    /// from this module is registered.
    pub fn register_nodes(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.stage {
            LoadStage::Unloaded => {
                return Err(raise(FlowError::ModuleLoadFailed(
                    "module is not loaded".to_string(),
                )))
            }
            LoadStage::NodesRegistered => return Ok(()),
            LoadStage::Loaded => {}
        }
        let plugin = state.plugin.as_ref().expect("loaded module has a plugin");
        let name = state.info.as_ref().expect("loaded module has info").name.clone();

        let classes = plugin.node_classes();
        let count = classes.len();
        self.factory
            .register_classes(classes, Some(&name))
            .map_err(|e| {
                raise(FlowError::ModuleLoadFailed(format!(
                    "registering classes of {name}: {}",
                    e.message()
                )))
            })?;
        info!("registered {count} node class(es) from {name}");
        state.stage = LoadStage::NodesRegistered;
        Ok(())
    }

    /// Remove this module's classes from the factory.
    ///
    /// Rejected with `ModuleLoadFailed`, removing nothing, while any live
    /// node instance of one of these classes exists. A no-op when no nodes
    /// are registered.
    pub fn unregister_nodes(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.stage != LoadStage::NodesRegistered {
            return Ok(());
        }
        let name = state.info.as_ref().expect("registered module has info").name.clone();

        let class_ids = self.factory.classes_from(&name);
        self.factory.unregister_classes(&class_ids).map_err(|e| {
            raise(FlowError::ModuleLoadFailed(format!(
                "unregistering classes of {name}: {}",
                e.message()
            )))
        })?;
        info!("unregistered {} node class(es) from {name}", class_ids.len());
        state.stage = LoadStage::Loaded;
        Ok(())
    }

    /// Release the backing plugin. Only valid once nodes are unregistered;
    /// a no-op when not loaded.
    pub fn unload(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.stage {
            LoadStage::Unloaded => return Ok(()),
            LoadStage::NodesRegistered => {
                return Err(raise(FlowError::ModuleLoadFailed(
                    "cannot unload while nodes are registered".to_string(),
                )))
            }
            LoadStage::Loaded => {}
        }
        if let Some(plugin) = state.plugin.take() {
            if let Err(e) = plugin.on_unload() {
                warn!("plugin cleanup failed: {e}");
            }
        }
        state.library.take();
        state.info.take();
        state.path.take();
        state.stage = LoadStage::Unloaded;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().stage != LoadStage::Unloaded
    }

    pub fn stage(&self) -> LoadStage {
        self.state.lock().unwrap().stage
    }

    pub fn name(&self) -> Result<String> {
        self.metadata(|info| info.name.clone())
    }

    pub fn version(&self) -> Result<String> {
        self.metadata(|info| info.version.clone())
    }

    pub fn author(&self) -> Result<String> {
        self.metadata(|info| info.author.clone())
    }

    pub fn description(&self) -> Result<String> {
        self.metadata(|info| info.description.clone())
    }

    fn metadata<T>(&self, f: impl FnOnce(&PluginInfo) -> T) -> Result<T> {
        let state = self.state.lock().unwrap();
        state
            .info
            .as_ref()
            .map(f)
            .ok_or_else(|| raise(FlowError::ModuleLoadFailed("module is not loaded".to_string())))
    }

    /// Install an in-process plugin, skipping the dynamic-library step.
    /// Test seam for exercising the state machine without a real library.
    #[cfg(test)]
    pub(crate) fn with_plugin_for_tests(
        factory: &Arc<NodeFactory>,
        plugin: Box<dyn NodePlugin>,
    ) -> Arc<Module> {
        let info = plugin.plugin_info();
        Arc::new(Module {
            factory: Arc::clone(factory),
            state: Mutex::new(ModuleState {
                stage: LoadStage::Loaded,
                path: None,
                plugin: Some(plugin),
                library: None,
                info: Some(info),
            }),
        })
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if state.stage == LoadStage::NodesRegistered {
            if let Some(info) = &state.info {
                let class_ids = self.factory.classes_from(&info.name);
                if let Err(e) = self.factory.unregister_classes(&class_ids) {
                    warn!(
                        "module {} dropped with classes still in use: {}",
                        info.name,
                        e.message()
                    );
                }
            }
        }
    }
}
