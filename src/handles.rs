//! Address handle registry.
//!
//! Components refer to SIP addresses through stable opaque handles instead of
//! comparing raw text. The registry normalizes addresses on entry, so two
//! spellings of the same address always map to the same handle, and tracks a
//! lease count per holder; an entry is freed when its last lease goes.

use std::collections::HashMap;
use std::num::NonZeroU32;

use crate::error::{Error, Result};

/// Stable opaque identifier for a normalized address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU32);

impl Handle {
    fn from_slot(slot: usize) -> Self {
        // Slot 0 maps to handle 1, keeping the niche for Option<Handle>.
        Self(NonZeroU32::new(slot as u32 + 1).expect("slot overflow"))
    }

    fn slot(&self) -> usize {
        self.0.get() as usize - 1
    }
}

#[derive(Debug)]
struct Entry {
    address: String,
    leases: HashMap<String, u32>,
}

/// Arena of normalized-address entries with per-holder leases.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    entries: Vec<Option<Entry>>,
    index: HashMap<String, Handle>,
    free: Vec<usize>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a SIP address.
    ///
    /// Scheme and host are case-folded, the scheme's default port is
    /// dropped, the userinfo part is preserved case-sensitively, and URI
    /// passwords, parameters and headers are discarded. Deterministic:
    /// equivalent spellings produce identical output.
    pub fn normalize(address: &str) -> Result<String> {
        let uri = rsip::Uri::try_from(address.trim())
            .map_err(|err| Error::IdentityResolutionFailed(format!("{address}: {err}")))?;

        let (scheme, default_port) = match uri.scheme.clone().unwrap_or(rsip::Scheme::Sip) {
            rsip::Scheme::Sip => ("sip", 5060u16),
            rsip::Scheme::Sips => ("sips", 5061u16),
            other => {
                return Err(Error::IdentityResolutionFailed(format!(
                    "unsupported scheme {other:?} in {address}"
                )))
            }
        };

        let host = match &uri.host_with_port.host {
            rsip::host_with_port::Host::Domain(domain) => {
                let lowered = domain.to_string().to_ascii_lowercase();
                if lowered.is_empty() {
                    return Err(Error::IdentityResolutionFailed(format!(
                        "empty host in {address}"
                    )));
                }
                lowered
            }
            rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
        };

        let port = uri
            .host_with_port
            .port
            .as_ref()
            .map(|port| *port.value())
            .filter(|port| *port != default_port);

        let mut normalized = String::with_capacity(address.len());
        normalized.push_str(scheme);
        normalized.push(':');
        if let Some(auth) = &uri.auth {
            normalized.push_str(&auth.user);
            normalized.push('@');
        }
        normalized.push_str(&host);
        if let Some(port) = port {
            normalized.push(':');
            normalized.push_str(&port.to_string());
        }
        Ok(normalized)
    }

    /// Return the handle for `address`, creating an entry if absent, and
    /// take a lease on it for `client`.
    pub fn ensure(&mut self, client: &str, address: &str) -> Result<Handle> {
        let normalized = Self::normalize(address)?;

        let handle = match self.index.get(&normalized) {
            Some(handle) => *handle,
            None => {
                let entry = Entry {
                    address: normalized.clone(),
                    leases: HashMap::new(),
                };
                let slot = match self.free.pop() {
                    Some(slot) => {
                        self.entries[slot] = Some(entry);
                        slot
                    }
                    None => {
                        self.entries.push(Some(entry));
                        self.entries.len() - 1
                    }
                };
                let handle = Handle::from_slot(slot);
                self.index.insert(normalized, handle);
                handle
            }
        };

        let entry = self.entries[handle.slot()]
            .as_mut()
            .expect("indexed entry present");
        *entry.leases.entry(client.to_string()).or_insert(0) += 1;
        Ok(handle)
    }

    /// The normalized address behind `handle`.
    pub fn inspect(&self, handle: Handle) -> Result<&str> {
        self.entries
            .get(handle.slot())
            .and_then(|slot| slot.as_ref())
            .map(|entry| entry.address.as_str())
            .ok_or(Error::UnknownHandle)
    }

    /// Take an additional lease on an existing handle.
    pub fn hold(&mut self, client: &str, handle: Handle) -> Result<()> {
        let entry = self
            .entries
            .get_mut(handle.slot())
            .and_then(|slot| slot.as_mut())
            .ok_or(Error::UnknownHandle)?;
        *entry.leases.entry(client.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Drop one of `client`'s leases; frees the entry when no holder remains.
    pub fn release(&mut self, client: &str, handle: Handle) -> Result<()> {
        let entry = self
            .entries
            .get_mut(handle.slot())
            .and_then(|slot| slot.as_mut())
            .ok_or(Error::UnknownHandle)?;

        match entry.leases.get_mut(client) {
            Some(count) if *count > 1 => {
                *count -= 1;
            }
            Some(_) => {
                entry.leases.remove(client);
            }
            None => return Err(Error::UnknownHandle),
        }

        if entry.leases.is_empty() {
            let address = entry.address.clone();
            self.index.remove(&address);
            self.entries[handle.slot()] = None;
            self.free.push(handle.slot());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
