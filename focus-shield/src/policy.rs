//! Routing policy resolution
//!
//! Turns a [`RoutingMode`] into the dependency-closed application set and,
//! at tunnel-parameter time, into the concrete allow/disallow filter.

use crate::closure::DependencyGraph;
use crate::types::{ApplicationId, EffectiveRoutingSet, RoutingMode, RoutingShape};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Per-application filter handed to the tunnel primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppFilter {
    /// Only these applications use the tunnel
    Allow(BTreeSet<ApplicationId>),
    /// Everything except these applications uses the tunnel
    Disallow(BTreeSet<ApplicationId>),
}

impl AppFilter {
    /// Applications named by the filter, whichever way it points
    pub fn apps(&self) -> &BTreeSet<ApplicationId> {
        match self {
            AppFilter::Allow(apps) | AppFilter::Disallow(apps) => apps,
        }
    }

    /// Whether this is an allow-list
    pub fn is_allow(&self) -> bool {
        matches!(self, AppFilter::Allow(_))
    }
}

/// Resolves routing modes against the companion table
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    graph: Arc<DependencyGraph>,
}

impl PolicyResolver {
    /// Resolver over a merged companion table
    pub fn new(graph: Arc<DependencyGraph>) -> Self {
        Self { graph }
    }

    /// False when a stealth Focus/Casual mode names nothing to tunnel
    ///
    /// The own package is dropped from every allow-list, so a base set that
    /// holds nothing else is as empty as no selection at all. An empty
    /// allow-list would otherwise route every application.
    pub fn is_routable(&self, mode: &RoutingMode, own_app: &ApplicationId) -> bool {
        match mode.shape {
            RoutingShape::Global => true,
            RoutingShape::Focus(_) | RoutingShape::Casual(_) => {
                !mode.stealth || mode.base_set().iter().any(|app| app != own_app)
            }
        }
    }

    /// Dependency-closed application set for this mode
    pub fn resolve(&self, mode: &RoutingMode) -> EffectiveRoutingSet {
        self.graph.expand(&mode.base_set())
    }

    /// Combine the effective set with the stealth/global rule
    ///
    /// The client's own package never goes through its own tunnel.
    pub fn app_filter(
        mode: &RoutingMode,
        effective: &EffectiveRoutingSet,
        own_app: &ApplicationId,
    ) -> AppFilter {
        if mode.is_global() {
            return AppFilter::Disallow(BTreeSet::from([own_app.clone()]));
        }

        if mode.stealth {
            let mut allowed = effective.clone();
            allowed.remove(own_app);
            AppFilter::Allow(allowed)
        } else {
            let mut disallowed = effective.clone();
            disallowed.insert(own_app.clone());
            AppFilter::Disallow(disallowed)
        }
    }

    /// Companion table this resolver expands against
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }
}
