//! Kingfisher process-wide settings
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::worker::{ThreadFactory, TokioTaskFactory};

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default ceiling for inbound datagrams, in bytes.
pub const DEFAULT_MAX_INBOUND_MESSAGE_SIZE: usize = (1 << 16) - 1;

/// Environment variable naming the transport-mapping registration resource.
pub const TRANSPORT_MAPPINGS_ENV: &str = "KINGFISHER_TRANSPORT_MAPPINGS";

/// Default file name for the transport-mapping registration resource.
pub const TRANSPORT_MAPPINGS_DEFAULT: &str = "transports.properties";

static EXTENSIBILITY_ENABLED: AtomicBool = AtomicBool::new(false);

static THREAD_FACTORY: Lazy<RwLock<Arc<dyn ThreadFactory>>> =
    Lazy::new(|| RwLock::new(Arc::new(TokioTaskFactory)));

/// When enabled, the transport-mapping registry loads its table from the
/// external resource named by [`TRANSPORT_MAPPINGS_ENV`] instead of the
/// built-in table. Takes effect at the registry's next (re)initialization.
pub fn set_extensibility_enabled(enabled: bool) {
    EXTENSIBILITY_ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn is_extensibility_enabled() -> bool {
    EXTENSIBILITY_ENABLED.load(Ordering::SeqCst)
}

/// The factory used by transport mappings to spawn their receive workers.
pub fn thread_factory() -> Arc<dyn ThreadFactory> {
    THREAD_FACTORY
        .read()
        .map(|guard| guard.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
}

/// Replaces the process-wide worker factory. Mappings pick the new factory
/// up on their next `listen()` call; already-running workers are unaffected.
pub fn set_thread_factory(factory: Arc<dyn ThreadFactory>) {
    match THREAD_FACTORY.write() {
        Ok(mut guard) => *guard = factory,
        Err(poisoned) => *poisoned.into_inner() = factory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(DEFAULT_MAX_INBOUND_MESSAGE_SIZE, 65535);
        assert_eq!(TRANSPORT_MAPPINGS_DEFAULT, "transports.properties");
        assert!(!is_extensibility_enabled());
    }

    #[test]
    fn test_thread_factory_slot() {
        let factory = thread_factory();
        // Default factory is installed lazily and is swappable.
        set_thread_factory(factory.clone());
        assert!(Arc::ptr_eq(&factory, &thread_factory()));
    }
}
