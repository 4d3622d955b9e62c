// Companion-app dependency closure

//! Dependency-graph expansion of application sets
//!
//! Some applications only work when their companion processes share the same
//! routing decision (a messenger and its business variant, a social app and the
//! vendor's service framework). [`DependencyGraph::expand`] computes the
//! transitive closure of a set through that table.

use crate::types::ApplicationId;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Umbrella ecosystem prefixes that always pull in the support services
const UMBRELLA_PREFIXES: &[&str] = &["com.google.android.apps.", "com.google.android.youtube"];

/// Support services required by every umbrella application
const UMBRELLA_SUPPORT: &[&str] = &[
    "com.google.android.gms",
    "com.google.android.gsf",
    "com.android.vending",
];

/// Built-in companion table
const BUILTIN_GROUPS: &[(&str, &[&str])] = &[
    (
        "com.facebook.katana",
        &[
            "com.facebook.orca",
            "com.facebook.services",
            "com.facebook.system",
            "com.facebook.appmanager",
        ],
    ),
    (
        "com.google.android.youtube",
        &[
            "com.google.android.gms",
            "com.google.android.gsf",
            "com.android.vending",
        ],
    ),
    (
        "com.google.android.gm",
        &["com.google.android.gms", "com.google.android.gsf"],
    ),
    (
        "com.google.android.apps.maps",
        &["com.google.android.gms", "com.google.android.gsf"],
    ),
    ("com.whatsapp", &["com.whatsapp.w4b"]),
    (
        "com.instagram.android",
        &[
            "com.facebook.katana",
            "com.facebook.services",
            "com.facebook.appmanager",
        ],
    ),
    ("com.twitter.android", &["com.x.android"]),
    ("com.ss.android.ugc.trill", &["com.zhiliaoapp.musically"]),
];

/// Prefix rule: any id matching one of `prefixes` implies every id in `support`
#[derive(Debug, Clone, Default)]
pub struct UmbrellaRule {
    prefixes: Vec<String>,
    support: Vec<ApplicationId>,
}

impl UmbrellaRule {
    /// Rule from id prefixes to the support packages they imply
    pub fn new<P, S>(prefixes: P, support: S) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<ApplicationId>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            support: support.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, id: &ApplicationId) -> bool {
        self.prefixes.iter().any(|p| id.starts_with(p))
    }
}

/// Immutable "routing X implies routing Y" table
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: HashMap<ApplicationId, Vec<ApplicationId>>,
    umbrella: UmbrellaRule,
}

impl DependencyGraph {
    /// Empty table with no umbrella rule
    pub fn empty() -> Self {
        Self::default()
    }

    /// The shipped companion table and umbrella rule
    pub fn builtin() -> Self {
        let mut graph = Self {
            edges: HashMap::new(),
            umbrella: UmbrellaRule::new(
                UMBRELLA_PREFIXES.iter().copied(),
                UMBRELLA_SUPPORT.iter().copied(),
            ),
        };
        for (app, companions) in BUILTIN_GROUPS {
            graph = graph.with_entry(*app, companions.iter().copied());
        }
        graph
    }

    /// Builder: replace the companions of `app`
    pub fn with_entry<A, I>(mut self, app: A, companions: I) -> Self
    where
        A: Into<ApplicationId>,
        I: IntoIterator,
        I::Item: Into<ApplicationId>,
    {
        self.edges
            .insert(app.into(), companions.into_iter().map(Into::into).collect());
        self
    }

    /// Builder: replace the umbrella rule
    pub fn with_umbrella(mut self, rule: UmbrellaRule) -> Self {
        self.umbrella = rule;
        self
    }

    /// Overlay config-provided entries on top of this table
    pub fn merged_with(self, overrides: &BTreeMap<String, Vec<String>>) -> Self {
        overrides
            .iter()
            .fold(self, |graph, (app, companions)| {
                graph.with_entry(app.as_str(), companions.iter().map(String::as_str))
            })
    }

    /// Companions listed for `app`
    pub fn companions(&self, app: &ApplicationId) -> &[ApplicationId] {
        self.edges.get(app).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of apps with listed companions
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether no companions are listed
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Breadth-first transitive closure of `base`
    ///
    /// Membership is checked before enqueueing, so cycles in the table terminate.
    pub fn expand(&self, base: &BTreeSet<ApplicationId>) -> BTreeSet<ApplicationId> {
        let mut expanded = BTreeSet::new();
        let mut queue: VecDeque<ApplicationId> = base.iter().cloned().collect();

        while let Some(app) = queue.pop_front() {
            if expanded.contains(&app) {
                continue;
            }

            for companion in self.companions(&app) {
                if !expanded.contains(companion) {
                    queue.push_back(companion.clone());
                }
            }

            if self.umbrella.matches(&app) {
                for support in &self.umbrella.support {
                    if !expanded.contains(support) {
                        queue.push_back(support.clone());
                    }
                }
            }

            expanded.insert(app);
        }

        expanded
    }
}
