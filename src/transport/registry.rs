//! Transport-mapping registry
//!
//! Process-wide, lazily-initialized table resolving an address kind to the
//! transport-mapping implementation that handles it. With extensibility
//! disabled (the default) a fixed built-in table is installed; with it
//! enabled, bindings are loaded once from an external key/value resource.
//! Dynamic loading is deliberately absent: resource values resolve against
//! a fixed name-to-constructor table.
use std::collections::HashMap;
use std::env;
use std::fs;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::{debug, error};

use crate::address::{AddressKind, TransportAddress};
use crate::error::Result;
use crate::registry_error;
use crate::settings;
use crate::transport::udp::UdpTransport;
use crate::transport::TransportMapping;

/// Constructs a transport mapping for a concrete address.
#[async_trait]
trait MappingConstructor: Send + Sync {
    async fn construct(&self, address: &TransportAddress) -> Result<Box<dyn TransportMapping>>;
}

struct UdpConstructor;

#[async_trait]
impl MappingConstructor for UdpConstructor {
    async fn construct(&self, address: &TransportAddress) -> Result<Box<dyn TransportMapping>> {
        let transport = UdpTransport::with_address(*address).await?;
        Ok(Box::new(transport))
    }
}

/// Resolves a registered implementation name from the external resource.
fn named_constructor(name: &str) -> Option<Arc<dyn MappingConstructor>> {
    match name {
        "UdpTransport" => Some(Arc::new(UdpConstructor)),
        _ => None,
    }
}

type MappingTable = HashMap<AddressKind, Arc<dyn MappingConstructor>>;

static INSTANCE: Lazy<TransportMappings> = Lazy::new(TransportMappings::new);

/// The transport-mapping factory registry.
pub struct TransportMappings {
    table: RwLock<Option<MappingTable>>,
}

impl TransportMappings {
    fn new() -> Self {
        Self {
            table: RwLock::new(None),
        }
    }

    /// The process-wide registry instance.
    pub fn instance() -> &'static TransportMappings {
        &INSTANCE
    }

    /// Clears the registered table so the next lookup re-registers. For
    /// test isolation and for picking up a changed extensibility setting.
    pub fn reset(&self) {
        let mut guard = self
            .table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
    }

    /// Returns a transport mapping bound to `address`, or `None` when no
    /// implementation is registered for its kind. A registered
    /// constructor's own failure (e.g. a bind error) is logged and
    /// propagated.
    pub async fn create_transport_mapping(
        &self,
        address: &TransportAddress,
    ) -> Result<Option<Box<dyn TransportMapping>>> {
        self.ensure_registered()?;
        let constructor = {
            let guard = self
                .table
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard
                .as_ref()
                .and_then(|table| table.get(&address.kind()).cloned())
        };
        match constructor {
            None => Ok(None),
            Some(constructor) => match constructor.construct(address).await {
                Ok(mapping) => Ok(Some(mapping)),
                Err(err) => {
                    error!("Failed to construct transport mapping for {}: {}", address, err);
                    Err(err)
                }
            },
        }
    }

    fn ensure_registered(&self) -> Result<()> {
        {
            let guard = self
                .table
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.is_some() {
                return Ok(());
            }
        }
        let mut guard = self
            .table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_some() {
            return Ok(());
        }
        // Build the full table first, then install it, so readers never
        // observe a partially populated registration.
        let table = if settings::is_extensibility_enabled() {
            Self::load_external_table()?
        } else {
            Self::builtin_table()
        };
        *guard = Some(table);
        Ok(())
    }

    fn builtin_table() -> MappingTable {
        // TCP and TLS mappings are not provided by this crate; their
        // address kinds resolve to no mapping.
        let mut table: MappingTable = HashMap::with_capacity(1);
        table.insert(AddressKind::Udp, Arc::new(UdpConstructor));
        table
    }

    fn load_external_table() -> Result<MappingTable> {
        let path = env::var(settings::TRANSPORT_MAPPINGS_ENV)
            .unwrap_or_else(|_| settings::TRANSPORT_MAPPINGS_DEFAULT.to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| registry_error!("Could not read '{}': {}", path, e))?;

        let mut table: MappingTable = HashMap::new();
        for (line_number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (kind_name, constructor_name) = line.split_once('=').ok_or_else(|| {
                registry_error!("Malformed line {} in '{}': {}", line_number + 1, path, line)
            })?;
            let kind: AddressKind = kind_name.trim().parse().map_err(|_| {
                registry_error!(
                    "Unknown address kind '{}' in '{}'",
                    kind_name.trim(),
                    path
                )
            })?;
            let constructor = named_constructor(constructor_name.trim()).ok_or_else(|| {
                registry_error!(
                    "Unknown transport mapping '{}' in '{}'",
                    constructor_name.trim(),
                    path
                )
            })?;
            table.insert(kind, constructor);
        }
        debug!("Registered {} transport mapping(s) from '{}'", table.len(), path);
        Ok(table)
    }
}
