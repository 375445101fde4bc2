//! The shared runtime: stubs, adapters and native wrappers, plus the
//! method, thread and object models they are generated against.

pub mod adapter;
pub mod call_site;
pub mod calling_convention;
pub mod method;
pub mod native_wrapper;
pub mod objects;
pub mod signature;
pub mod stubs;
pub mod thread;

use std::fmt;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::InstallError;
use crate::jit::code_blob::InstalledCode;
use crate::jit::installer::{CodeInstaller, CompiledCode, InstallContext};
use crate::jit::memory::PollingPage;

use adapter::{AdapterHandlerEntry, AdapterHandlerLibrary};
use method::Method;
use stubs::{RuntimeEntryPoints, RuntimeStubs};

/// Owns everything generated once per process: the polling page, the
/// shared stubs and the adapter cache.
pub struct SharedRuntime {
    polling_page: PollingPage,
    installer: CodeInstaller,
    stub_blobs: Vec<Arc<InstalledCode>>,
    adapters: AdapterHandlerLibrary,
}

impl fmt::Debug for SharedRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRuntime")
            .field("polling_page", &format_args!("{:#x}", self.polling_page.address()))
            .field("stubs", &self.installer.context().stubs)
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

impl SharedRuntime {
    pub fn new(config: RuntimeConfig, entry_points: RuntimeEntryPoints) -> Result<Self, InstallError> {
        let polling_page = PollingPage::new()?;
        let mut context = InstallContext {
            stubs: RuntimeStubs::default(),
            polling_page: polling_page.address(),
            narrow_oops: config.compressed_oops,
        };

        // Stubs only reference their resolvers, so they can be installed
        // before the stub table exists.
        let bootstrap = CodeInstaller::new(config.clone(), context);
        let (stubs, stub_blobs) = stubs::generate(&bootstrap, &entry_points)?;
        context.stubs = stubs;

        let installer = CodeInstaller::new(config, context);
        let adapters = AdapterHandlerLibrary::new(installer.clone());
        Ok(Self {
            polling_page,
            installer,
            stub_blobs,
            adapters,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.installer.config()
    }

    pub fn installer(&self) -> &CodeInstaller {
        &self.installer
    }

    pub fn stubs(&self) -> &RuntimeStubs {
        &self.installer.context().stubs
    }

    pub fn stub_blobs(&self) -> &[Arc<InstalledCode>] {
        &self.stub_blobs
    }

    pub fn polling_page(&self) -> u64 {
        self.polling_page.address()
    }

    pub fn adapters(&self) -> &AdapterHandlerLibrary {
        &self.adapters
    }

    pub fn install(&self, compiled: CompiledCode) -> Result<Arc<InstalledCode>, InstallError> {
        self.installer.install(compiled)
    }

    pub fn get_adapter(&self, method: &Method) -> Result<Arc<AdapterHandlerEntry>, InstallError> {
        self.adapters.get_adapter(method)
    }

    /// Point a method's entries at its adapters: interpreted callers go
    /// through i2c, compiled callers through c2i until compiled code exists.
    pub fn link_method(&self, method: &Method) -> Result<Arc<AdapterHandlerEntry>, InstallError> {
        let entry = self.get_adapter(method)?;
        method.set_from_interpreted_entry(entry.i2c_entry());
        method.set_from_compiled_entry(entry.c2i_entry());
        Ok(entry)
    }

    /// Generate and install a native wrapper. Wrappers are not cached.
    pub fn create_native_wrapper(
        &self,
        method: &Method,
        native_entry: u64,
    ) -> Result<Arc<InstalledCode>, InstallError> {
        let compiled = native_wrapper::generate(method, native_entry, self.installer.context())?;
        let code = self.installer.install(compiled)?;
        if self.config().trace_adapters {
            eprintln!(
                "[adapter] native wrapper {}{} at {:#x} -> {:#x}",
                method.name(),
                method.descriptor(),
                code.verified_entry_point(),
                native_entry
            );
        }
        Ok(code)
    }
}
