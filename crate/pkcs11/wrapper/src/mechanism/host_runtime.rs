//! Native layouts that only some host runtimes provide.
//!
//! The GCM, CCM and TLS 1.2 parameter structures are compiled in behind the
//! `aead` and `tls12` features, and can further be withdrawn at run time by
//! listing their families in `COSMIAN_PKCS11_UNSUPPORTED_PARAMS`
//! (comma-separated, e.g. `gcm,tls12_key_material`). The table is resolved
//! once per process.

use std::{collections::HashMap, env, fmt, str::FromStr};

use cosmian_logger::{debug, warn};
use once_cell::sync::OnceCell;
use strum::IntoEnumIterator;

use super::{
    ParameterFamily,
    native::{self, NativeParams},
    parameters::ParameterBlock,
};
use crate::error::{HError, HResult};

pub(crate) const UNSUPPORTED_PARAMS_ENV: &str = "COSMIAN_PKCS11_UNSUPPORTED_PARAMS";

type NativeBuilder = for<'a> fn(&'a mut ParameterBlock) -> HResult<NativeParams<'a>>;

static PROCESS_CAPABILITIES: OnceCell<HostCapabilities> = OnceCell::new();

/// Which host-dependent parameter layouts can be built in this process.
#[derive(Clone)]
pub struct HostCapabilities {
    builders: HashMap<ParameterFamily, NativeBuilder>,
}

impl HostCapabilities {
    /// The process-wide table, detected on first use.
    pub fn process() -> &'static Self {
        PROCESS_CAPABILITIES.get_or_init(|| {
            let detected = Self::detect();
            debug!("host parameter layouts: {detected:?}");
            detected
        })
    }

    /// Compiled-in layouts minus those withdrawn through the environment.
    #[must_use]
    pub fn detect() -> Self {
        let mut capabilities = Self::compiled();
        if let Ok(list) = env::var(UNSUPPORTED_PARAMS_ENV) {
            for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                match ParameterFamily::from_str(name) {
                    Ok(family) => capabilities = capabilities.without(family),
                    Err(_) => warn!("{UNSUPPORTED_PARAMS_ENV}: unknown parameter family {name}"),
                }
            }
        }
        capabilities
    }

    fn compiled() -> Self {
        #[allow(unused_mut)]
        let mut builders: HashMap<ParameterFamily, NativeBuilder> = HashMap::new();
        #[cfg(feature = "aead")]
        {
            builders.insert(ParameterFamily::Gcm, native::build_gcm);
            builders.insert(ParameterFamily::Ccm, native::build_ccm);
        }
        #[cfg(feature = "tls12")]
        {
            builders.insert(
                ParameterFamily::Tls12MasterKeyDerive,
                native::build_tls12_master_key_derive,
            );
            builders.insert(
                ParameterFamily::Tls12KeyMaterial,
                native::build_tls12_key_material,
            );
        }
        Self { builders }
    }

    /// A runtime offering none of the host-dependent layouts.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    #[must_use]
    pub fn without(mut self, family: ParameterFamily) -> Self {
        self.builders.remove(&family);
        self
    }

    #[must_use]
    pub fn supports(&self, family: ParameterFamily) -> bool {
        !family.requires_host_runtime() || self.builders.contains_key(&family)
    }

    /// Marshal `block` to its native layout.
    pub(crate) fn build<'a>(&self, block: &'a mut ParameterBlock) -> HResult<NativeParams<'a>> {
        let family = block.family();
        if !family.requires_host_runtime() {
            return native::build_portable(block);
        }
        let builder = self
            .builders
            .get(&family)
            .ok_or(HError::UnsupportedInHostRuntime(family))?;
        builder(block)
    }
}

impl fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                ParameterFamily::iter()
                    .filter(|family| family.requires_host_runtime() && self.supports(*family)),
            )
            .finish()
    }
}
