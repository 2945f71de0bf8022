//! In-memory tunnel catalog with active-tunnel selection.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::tunnel::TunnelSpec;

/// Outcome of a wholesale catalog replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replacement {
    /// The previously active tunnel is still listed and stays active.
    Preserved,
    /// The member list changed in a way that invalidated the selection.
    Changed,
}

/// Ordered collection of tunnel specifications, unique by id, plus an
/// optional active selection.
///
/// Invariant: the active id, when set, always refers to a member. Any
/// mutation that would break this clears the selection instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelCatalog {
    tunnels: Vec<TunnelSpec>,
    active: Option<String>,
}

impl TunnelCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog from fetched tunnels, dropping duplicate ids.
    pub fn from_tunnels(tunnels: Vec<TunnelSpec>) -> Self {
        let mut catalog = Self::new();
        catalog.replace(tunnels);
        catalog
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TunnelSpec> {
        self.tunnels.iter()
    }

    /// Look up a member by id.
    pub fn get(&self, id: &str) -> Option<&TunnelSpec> {
        self.tunnels.iter().find(|t| t.id == id)
    }

    /// The active tunnel, if one is selected.
    pub fn active(&self) -> Option<&TunnelSpec> {
        self.active.as_deref().and_then(|id| self.get(id))
    }

    /// Select a member as active, or clear the selection with `None`.
    ///
    /// Fails without mutating the selection when the id is not a member.
    pub fn set_active(&mut self, id: Option<&str>) -> Result<()> {
        match id {
            None => {
                self.active = None;
                Ok(())
            }
            Some(id) => {
                if self.get(id).is_none() {
                    return Err(Error::NotInCatalog(id.to_string()));
                }
                self.active = Some(id.to_string());
                Ok(())
            }
        }
    }

    /// Swap the member list wholesale.
    ///
    /// The active selection survives iff its id is present in the new list.
    pub fn replace(&mut self, new_tunnels: Vec<TunnelSpec>) -> Replacement {
        let mut deduped: Vec<TunnelSpec> = Vec::with_capacity(new_tunnels.len());
        for tunnel in new_tunnels {
            if deduped.iter().any(|t| t.id == tunnel.id) {
                debug!(id = %tunnel.id, "dropping duplicate tunnel id");
                continue;
            }
            deduped.push(tunnel);
        }
        self.tunnels = deduped;

        match self.active.take() {
            Some(id) if self.get(&id).is_some() => {
                self.active = Some(id);
                Replacement::Preserved
            }
            Some(id) => {
                info!(id, "active tunnel no longer listed, clearing selection");
                Replacement::Changed
            }
            None => Replacement::Changed,
        }
    }

    /// Resolve the selection to a single suitable tunnel.
    ///
    /// Keeps a still-suitable prior selection. Auto-selects when exactly one
    /// suitable tunnel exists; fails with [`Error::NoSuitableTunnel`] on zero
    /// and [`Error::AmbiguousTunnel`] when several exist with nothing to go
    /// by. A `preferred` id breaks ties.
    pub fn select_single(&mut self, preferred: Option<&str>) -> Result<&TunnelSpec> {
        if let Some(active) = self.active() {
            if active.is_suitable() {
                let id = active.id.clone();
                return Ok(self.get(&id).unwrap());
            }
        }

        let suitable: Vec<String> = self
            .tunnels
            .iter()
            .filter(|t| t.is_suitable())
            .map(|t| t.id.clone())
            .collect();

        let chosen = match suitable.len() {
            0 => return Err(Error::NoSuitableTunnel),
            1 => suitable.into_iter().next().unwrap(),
            n => match preferred.filter(|p| suitable.iter().any(|id| id == p)) {
                Some(p) => p.to_string(),
                None => return Err(Error::AmbiguousTunnel(n)),
            },
        };

        self.active = Some(chosen.clone());
        info!(id = %chosen, "selected tunnel");
        Ok(self.get(&chosen).unwrap())
    }
}
