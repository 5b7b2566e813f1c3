//! Process-wide TLS client configuration, built once. Grounded on
//! `cpkb-bluezoo-tagliacarte`'s `net.rs` (`build_root_store`,
//! `default_connector`): native platform certs first, `webpki-roots` as
//! fallback, no client auth.
//!
//! The design notes call for double-checked locking around the global CA
//! bundle: an acquire-ordered flag check, a lock, and a second check inside
//! the lock before building. `OnceLock::get_or_init` is exactly that pattern
//! (fast-path atomic load, slow-path lock-and-recheck), so it's used as-is
//! rather than hand-rolled.

use crate::errors::ClientErrorKind;
use rustls::{ClientConfig, RootCertStore};
use std::sync::{Arc, OnceLock};
use tokio_rustls::TlsConnector;

static CONNECTOR: OnceLock<Result<TlsConnector, ()>> = OnceLock::new();

fn build_root_store() -> Result<RootCertStore, ()> {
    let mut store = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = store.add(cert);
        }
    }
    if store.is_empty() {
        store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    if store.is_empty() {
        return Err(());
    }
    Ok(store)
}

fn build_connector() -> Result<TlsConnector, ()> {
    let store = build_root_store()?;
    let config = ClientConfig::builder().with_root_certificates(store).with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Returns the lazily-built, process-wide TLS connector.
pub(crate) fn connector() -> Result<&'static TlsConnector, ClientErrorKind> {
    CONNECTOR.get_or_init(build_connector).as_ref().map_err(|_| ClientErrorKind::MissingCaBundle)
}
