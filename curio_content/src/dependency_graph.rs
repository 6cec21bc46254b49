use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::{hasher::StableHasher, AssetGuid};

/// The two kinds of edges between assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// The content of the target is consumed when the source is transformed.
    Transform,
    /// The target is only needed at runtime. It affects the thumbnail of the source.
    Reference,
}

#[derive(Debug, Default, Clone)]
struct Edges {
    outgoing: BTreeMap<AssetGuid, BTreeSet<AssetGuid>>,
    incoming: BTreeMap<AssetGuid, BTreeSet<AssetGuid>>,
}

impl Edges {
    fn set(&mut self, source: AssetGuid, targets: BTreeSet<AssetGuid>) {
        self.clear_outgoing(source);
        for target in &targets {
            self.incoming.entry(*target).or_default().insert(source);
        }
        if !targets.is_empty() {
            self.outgoing.insert(source, targets);
        }
    }

    fn clear_outgoing(&mut self, source: AssetGuid) {
        let Some(old_targets) = self.outgoing.remove(&source) else {
            return;
        };
        for target in old_targets {
            if let Some(sources) = self.incoming.get_mut(&target) {
                sources.remove(&source);
                if sources.is_empty() {
                    self.incoming.remove(&target);
                }
            }
        }
    }
}

/// Directed graph between assets. Only GUIDs are stored so that the graph never
/// keeps an asset alive and can contain edges to assets that don't exist (yet).
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    dependencies: Edges,
    references: Edges,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn edges(&self, kind: DependencyKind) -> &Edges {
        match kind {
            DependencyKind::Transform => &self.dependencies,
            DependencyKind::Reference => &self.references,
        }
    }

    /// Replaces the transform dependencies of `asset`.
    pub fn set_dependencies(&mut self, asset: AssetGuid, dependencies: impl IntoIterator<Item = AssetGuid>) {
        self.dependencies.set(asset, dependencies.into_iter().collect());
    }

    /// Replaces the runtime references of `asset`.
    pub fn set_references(&mut self, asset: AssetGuid, references: impl IntoIterator<Item = AssetGuid>) {
        self.references.set(asset, references.into_iter().collect());
    }

    /// Removes the outgoing edges of `asset`. Edges from other assets to `asset` are
    /// kept and become unresolved.
    pub fn remove_asset(&mut self, asset: AssetGuid) {
        self.dependencies.clear_outgoing(asset);
        self.references.clear_outgoing(asset);
    }

    pub fn clear(&mut self) {
        self.dependencies = Edges::default();
        self.references = Edges::default();
    }

    /// The direct targets of `asset` for the given kind of edge.
    pub fn outgoing(&self, asset: &AssetGuid, kind: DependencyKind) -> BTreeSet<AssetGuid> {
        self.edges(kind).outgoing.get(asset).cloned().unwrap_or_default()
    }

    fn incoming(&self, asset: &AssetGuid) -> impl Iterator<Item = &AssetGuid> {
        let dependents = self.dependencies.incoming.get(asset).into_iter().flatten();
        let referrers = self.references.incoming.get(asset).into_iter().flatten();
        dependents.chain(referrers)
    }

    /// Returns the assets that depend on or reference `target`.
    ///
    /// With `transitive` the search continues through the users of the users. The
    /// target itself is part of the result only when it lies on a cycle.
    pub fn find_uses(&self, target: &AssetGuid, transitive: bool) -> BTreeSet<AssetGuid> {
        if !transitive {
            return self.incoming(target).copied().collect();
        }

        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([*target]);
        while let Some(current) = queue.pop_front() {
            for user in self.incoming(&current) {
                if visited.insert(*user) {
                    queue.push_back(*user);
                }
            }
        }
        visited
    }

    /// `asset` and everything reachable from it over edges of the given kind.
    pub fn transitive_closure(&self, asset: &AssetGuid, kind: DependencyKind) -> BTreeSet<AssetGuid> {
        let edges = self.edges(kind);
        let mut visited = BTreeSet::from([*asset]);
        let mut queue = VecDeque::from([*asset]);
        while let Some(current) = queue.pop_front() {
            for next in edges.outgoing.get(&current).into_iter().flatten() {
                if visited.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        visited
    }

    /// Everything `asset` depends on directly or indirectly, excluding `asset` itself
    /// unless it depends on itself through a cycle.
    pub fn transitive_dependencies(&self, asset: &AssetGuid) -> BTreeSet<AssetGuid> {
        let mut closure = self.transitive_closure(asset, DependencyKind::Transform);
        let on_cycle = self
            .dependencies
            .incoming
            .get(asset)
            .map(|dependents| dependents.iter().any(|dependent| closure.contains(dependent)))
            .unwrap_or(false);
        if !on_cycle {
            closure.remove(asset);
        }
        closure
    }

    /// Hash over the content hashes of `asset` and all its transitive dependencies.
    ///
    /// `content_hash` resolves a GUID to the content hash of its file. GUIDs that can't
    /// be resolved or that have not been hashed yet are returned as `Err`. The result
    /// doesn't depend on the order in which the dependencies were declared.
    pub fn compute_transitive_hash(
        &self,
        asset: &AssetGuid,
        content_hash: impl Fn(&AssetGuid) -> Option<u64>,
    ) -> Result<u64, BTreeSet<AssetGuid>> {
        self.closure_hash(asset, DependencyKind::Transform, content_hash)
    }

    /// Like [`DependencyGraph::compute_transitive_hash`] but over the runtime references.
    pub fn compute_reference_hash(
        &self,
        asset: &AssetGuid,
        content_hash: impl Fn(&AssetGuid) -> Option<u64>,
    ) -> Result<u64, BTreeSet<AssetGuid>> {
        self.closure_hash(asset, DependencyKind::Reference, content_hash)
    }

    fn closure_hash(
        &self,
        asset: &AssetGuid,
        kind: DependencyKind,
        content_hash: impl Fn(&AssetGuid) -> Option<u64>,
    ) -> Result<u64, BTreeSet<AssetGuid>> {
        let closure = self.transitive_closure(asset, kind);
        let mut hasher = StableHasher::new();
        let mut missing = BTreeSet::new();

        // BTreeSet iterates in GUID order
        for guid in &closure {
            match content_hash(guid) {
                Some(hash) if hash != 0 => {
                    hasher.update(guid.as_bytes()).update_u64(hash);
                }
                _ => {
                    missing.insert(*guid);
                }
            }
        }

        if missing.is_empty() {
            Ok(hasher.finish())
        } else {
            Err(missing)
        }
    }
}
