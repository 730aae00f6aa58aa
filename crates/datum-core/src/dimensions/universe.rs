//! The dimension universe and its process-wide cache.
//!
//! A universe is built from a [`DimensionConfig`] in four ordered phases:
//! skypix systems, elements, topological families, and packers. Each phase
//! turns one section of the configuration into [`Directive`]s that are
//! applied to a shared [`UniverseBuilder`]; [`UniverseBuilder::finish`] then
//! validates every reference, computes required closures, and assigns each
//! element its fixed topological index.
//!
//! Finished universes live in a process-wide cache keyed by version. They are
//! leaked to `'static` on first build and never evicted, so a version number
//! is enough to restore a universe reference anywhere in the process.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, OnceLock, PoisonError};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::{debug, info};

use super::config::{DimensionConfig, ElementConfig, FieldConfig};
use super::element::{DimensionElement, ElementKind, FieldSpec};
use super::graph::DimensionGraph;
use super::packer::{DimensionPacker, PackerFactory, PackerRegistry};
use super::topology::{PixelizationClass, SkyPixSystem, TopologicalFamily, TopologicalSpace};
use crate::coordinate::DataCoordinate;
use crate::error::{Error, Result};
use crate::observability::universe_span;
use crate::region::Region;
use crate::value::FieldType;

static UNIVERSES: OnceLock<Mutex<HashMap<u32, &'static DimensionUniverse>>> = OnceLock::new();

fn universes() -> &'static Mutex<HashMap<u32, &'static DimensionUniverse>> {
    UNIVERSES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The complete, immutable set of dimension elements for one version.
#[derive(Debug)]
pub struct DimensionUniverse {
    version: u32,
    common_skypix: String,
    elements: Vec<DimensionElement>,
    element_indices: HashMap<String, usize>,
    /// Element positions of dimensions, in dimension-index order.
    dimensions: Vec<usize>,
    families: Vec<TopologicalFamily>,
    skypix_systems: BTreeMap<String, SkyPixSystem>,
    packers: BTreeMap<String, PackerFactory>,
    graphs: Mutex<HashMap<BTreeSet<String>, DimensionGraph>>,
}

impl DimensionUniverse {
    /// Returns the universe for `config.version`, building and caching it
    /// with the built-in packer classes if it does not exist yet.
    ///
    /// If a universe with this version is already cached it is returned and
    /// `config` is not examined further.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is malformed; nothing is cached
    /// in that case.
    pub fn from_config(config: &DimensionConfig) -> Result<&'static Self> {
        Self::from_config_with_packers(config, &PackerRegistry::builtin())
    }

    /// Like [`from_config`](Self::from_config), resolving packer classes
    /// against `packers`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is malformed or names a packer
    /// class `packers` does not know.
    pub fn from_config_with_packers(
        config: &DimensionConfig,
        packers: &PackerRegistry,
    ) -> Result<&'static Self> {
        let span = universe_span(config.version);
        let _guard = span.enter();

        let mut cache = universes()
            .lock()
            .map_err(|_| Error::internal("universe cache lock poisoned"))?;
        if let Some(existing) = cache.get(&config.version) {
            debug!(version = config.version, "universe cache hit");
            return Ok(existing);
        }

        let universe = UniverseBuilder::from_config(config, packers)?.finish()?;
        let leaked: &'static Self = Box::leak(Box::new(universe));
        cache.insert(config.version, leaked);
        info!(
            version = config.version,
            elements = leaked.elements.len(),
            "dimension universe built"
        );
        Ok(leaked)
    }

    /// Returns the cached universe with this version.
    ///
    /// This is the only way to restore a universe from its serialized form.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if no universe with this version has been
    /// built in this process.
    pub fn from_version(version: u32) -> Result<&'static Self> {
        let cache = universes()
            .lock()
            .map_err(|_| Error::internal("universe cache lock poisoned"))?;
        cache
            .get(&version)
            .copied()
            .ok_or_else(|| Error::resource_not_found("dimension universe version", version))
    }

    /// Returns the universe built from the bundled standard configuration.
    ///
    /// # Errors
    ///
    /// Returns `Config` only if the bundled configuration is malformed.
    pub fn standard() -> Result<&'static Self> {
        Self::from_config(&DimensionConfig::standard()?)
    }

    /// Version number; the key in the universe cache.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// All elements in topological order.
    #[must_use]
    pub fn elements(&self) -> &[DimensionElement] {
        &self.elements
    }

    /// All dimensions in topological order.
    pub fn dimensions(&self) -> impl Iterator<Item = &DimensionElement> + '_ {
        self.dimensions.iter().map(|&i| &self.elements[i])
    }

    /// Looks up an element by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DimensionElement> {
        self.element_indices.get(name).map(|&i| &self.elements[i])
    }

    /// Looks up an element by name.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for an unknown name.
    pub fn element(&self, name: &str) -> Result<&DimensionElement> {
        self.get(name)
            .ok_or_else(|| Error::resource_not_found("dimension element", name))
    }

    /// Looks up a dimension (not a combination) by name.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if `name` is unknown or names a
    /// combination.
    pub fn dimension(&self, name: &str) -> Result<&DimensionElement> {
        self.get(name)
            .filter(|e| e.is_dimension())
            .ok_or_else(|| Error::resource_not_found("dimension", name))
    }

    /// Position of an element in the global topological order.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for an unknown name.
    pub fn element_index(&self, name: &str) -> Result<usize> {
        self.element(name).map(DimensionElement::index)
    }

    /// Position of a dimension in the dimension-only topological order.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if `name` is not a dimension.
    pub fn dimension_index(&self, name: &str) -> Result<usize> {
        self.dimension(name)?
            .dimension_index()
            .ok_or_else(|| Error::resource_not_found("dimension", name))
    }

    /// The skypix dimension used to relate all spatial elements.
    ///
    /// # Errors
    ///
    /// Never fails for a finished universe; the builder checks this.
    pub fn common_skypix(&self) -> Result<&DimensionElement> {
        self.dimension(&self.common_skypix)
    }

    /// Name of the common skypix dimension.
    #[must_use]
    pub fn common_skypix_name(&self) -> &str {
        &self.common_skypix
    }

    /// Skypix systems by name.
    #[must_use]
    pub const fn skypix_systems(&self) -> &BTreeMap<String, SkyPixSystem> {
        &self.skypix_systems
    }

    /// All spatial and temporal families, skypix systems included.
    #[must_use]
    pub fn families(&self) -> &[TopologicalFamily] {
        &self.families
    }

    /// Looks up a family by name.
    #[must_use]
    pub fn family(&self, name: &str) -> Option<&TopologicalFamily> {
        self.families.iter().find(|f| f.name == name)
    }

    /// Names of the configured packers.
    pub fn packer_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.packers.keys().map(String::as_str)
    }

    /// Number of bytes in an encoded graph: one bit per dimension.
    #[must_use]
    pub fn encode_length(&self) -> usize {
        self.dimensions.len().div_ceil(8)
    }

    /// Expands `names` with every required and implied dependency, by
    /// fixed-point iteration.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if a name is not a dimension.
    pub fn expand<I, S>(&self, names: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut expanded = BTreeSet::new();
        for name in names {
            expanded.insert(self.dimension(name.as_ref())?.name.clone());
        }
        loop {
            let before = expanded.len();
            let snapshot: Vec<String> = expanded.iter().cloned().collect();
            for name in snapshot {
                let dim = self.dimension(&name)?;
                expanded.extend(dim.required.iter().cloned());
                expanded.extend(dim.implied.iter().cloned());
            }
            if expanded.len() == before {
                return Ok(expanded);
            }
        }
    }

    /// Returns the interned graph for the closure of `names`.
    ///
    /// Two calls whose names expand to the same set return the same graph
    /// object.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if a name is not a dimension.
    pub fn extract<I, S>(&'static self, names: I) -> Result<DimensionGraph>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let expanded = self.expand(names)?;
        Ok(self.intern(expanded))
    }

    /// The graph with no dimensions.
    #[must_use]
    pub fn empty(&'static self) -> DimensionGraph {
        self.intern(BTreeSet::new())
    }

    fn intern(&'static self, names: BTreeSet<String>) -> DimensionGraph {
        // Insert-only map, so a poisoned lock still holds consistent graphs.
        let mut graphs = self.graphs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(graph) = graphs.get(&names) {
            return graph.clone();
        }
        let graph = DimensionGraph::build(self, &names);
        graphs.insert(names, graph.clone());
        graph
    }

    /// Returns the named elements in the global topological order.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for an unknown name.
    pub fn sorted<I, S>(&self, names: I) -> Result<Vec<&DimensionElement>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut found = names
            .into_iter()
            .map(|n| self.element(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        found.sort();
        found.dedup();
        Ok(found)
    }

    /// Builds the named packer with its fixed dimensions taken from
    /// `data_id`.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for an unknown packer name,
    /// `MissingCapability` if `data_id` has no records, or an error from
    /// the packer's constructor.
    pub fn make_packer(
        &'static self,
        name: &str,
        data_id: &DataCoordinate,
    ) -> Result<Box<dyn DimensionPacker>> {
        let factory = self
            .packers
            .get(name)
            .ok_or_else(|| Error::resource_not_found("dimension packer", name))?;
        if !data_id.has_records() {
            return Err(Error::MissingCapability {
                capability: "records",
                coordinate: data_id.to_string(),
            });
        }
        let fixed_graph = self.extract(&factory.fixed)?;
        let fixed = data_id.subset(&fixed_graph)?;
        let dimensions = self.extract(&factory.dimensions)?;
        (factory.constructor)(fixed, dimensions)
    }

    /// Envelope, in the common skypix pixelization, of one skypix pixel.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if `dimension` is not a skypix dimension.
    pub fn skypix_region(&self, dimension: &str, index: u64) -> Result<Region> {
        let (system, level) = self.skypix_level(dimension)?;
        let (common_system, common_level) = self.skypix_level(&self.common_skypix)?;
        if system.name != common_system.name {
            return Err(Error::InvalidInput(format!(
                "skypix dimension '{dimension}' is not in the common system '{}'",
                common_system.name
            )));
        }
        system.envelope(level, index, common_level)
    }

    fn skypix_level(&self, dimension: &str) -> Result<(&SkyPixSystem, u8)> {
        match self.dimension(dimension)?.kind() {
            ElementKind::SkyPix { system, level } => self
                .skypix_systems
                .get(system)
                .map(|s| (s, *level))
                .ok_or_else(|| Error::resource_not_found("skypix system", system)),
            _ => Err(Error::resource_not_found("skypix dimension", dimension)),
        }
    }
}

impl std::fmt::Display for DimensionUniverse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DimensionUniverse(version={})", self.version)
    }
}

/// One construction step emitted by a configuration phase.
#[derive(Debug, Clone)]
pub enum Directive {
    /// Add a pixelization system and one skypix dimension per level.
    AddSkyPixSystem(SkyPixSystem),
    /// Add a dimension or combination.
    AddElement {
        /// Element name.
        name: String,
        /// Element definition.
        config: ElementConfig,
    },
    /// Add a spatial or temporal family.
    AddFamily(TopologicalFamily),
    /// Add a packer factory.
    AddPacker(PackerFactory),
}

/// Phase 1: skypix systems.
///
/// # Errors
///
/// Returns `Config` for an unknown pixelization class or a zero level.
pub fn skypix_phase(config: &DimensionConfig) -> Result<Vec<Directive>> {
    config
        .skypix
        .systems
        .iter()
        .map(|(name, system)| {
            if system.max_level == 0 {
                return Err(Error::config(format!(
                    "skypix system '{name}' must have max_level >= 1"
                )));
            }
            Ok(Directive::AddSkyPixSystem(SkyPixSystem {
                name: name.clone(),
                class: PixelizationClass::from_name(&system.class)?,
                max_level: system.max_level,
            }))
        })
        .collect()
}

/// Phase 2: dimensions and combinations.
#[must_use]
pub fn element_phase(config: &DimensionConfig) -> Vec<Directive> {
    config
        .elements
        .iter()
        .map(|(name, element)| Directive::AddElement {
            name: name.clone(),
            config: element.clone(),
        })
        .collect()
}

/// Phase 3: spatial and temporal families.
#[must_use]
pub fn topology_phase(config: &DimensionConfig) -> Vec<Directive> {
    let spatial = config
        .topology
        .spatial
        .iter()
        .map(|(name, members)| (TopologicalSpace::Spatial, name, members));
    let temporal = config
        .topology
        .temporal
        .iter()
        .map(|(name, members)| (TopologicalSpace::Temporal, name, members));
    spatial
        .chain(temporal)
        .map(|(space, name, members)| {
            Directive::AddFamily(TopologicalFamily {
                name: name.clone(),
                space,
                members: members.clone(),
            })
        })
        .collect()
}

/// Phase 4: packer factories, resolved against `registry`.
///
/// # Errors
///
/// Returns `Config` for a packer class `registry` does not know.
pub fn packer_phase(config: &DimensionConfig, registry: &PackerRegistry) -> Result<Vec<Directive>> {
    config
        .packers
        .iter()
        .map(|(name, packer)| {
            let constructor = registry.get(&packer.cls).ok_or_else(|| {
                Error::config(format!(
                    "packer '{name}' has unknown class '{}'",
                    packer.cls
                ))
            })?;
            Ok(Directive::AddPacker(PackerFactory {
                name: name.clone(),
                cls: packer.cls.clone(),
                fixed: packer.fixed.clone(),
                dimensions: packer.dimensions.clone(),
                constructor,
            }))
        })
        .collect()
}

#[derive(Debug)]
struct PendingElement {
    doc: String,
    kind: ElementKind,
    requires: Vec<String>,
    implies: Vec<String>,
    keys: Vec<FieldSpec>,
    metadata: Vec<FieldSpec>,
    always_join: bool,
}

/// Accumulates directives and produces a validated universe.
#[derive(Debug)]
pub struct UniverseBuilder {
    version: u32,
    common_skypix: String,
    systems: BTreeMap<String, SkyPixSystem>,
    elements: BTreeMap<String, PendingElement>,
    families: Vec<TopologicalFamily>,
    packers: BTreeMap<String, PackerFactory>,
}

impl UniverseBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new(version: u32, common_skypix: impl Into<String>) -> Self {
        Self {
            version,
            common_skypix: common_skypix.into(),
            systems: BTreeMap::new(),
            elements: BTreeMap::new(),
            families: Vec::new(),
            packers: BTreeMap::new(),
        }
    }

    /// Runs all four configuration phases in order.
    ///
    /// # Errors
    ///
    /// Returns `Config` for the first malformed directive.
    pub fn from_config(config: &DimensionConfig, registry: &PackerRegistry) -> Result<Self> {
        let mut builder = Self::new(config.version, config.skypix.common.clone());
        let phases = [
            skypix_phase(config)?,
            element_phase(config),
            topology_phase(config),
            packer_phase(config, registry)?,
        ];
        for (phase, directives) in phases.into_iter().enumerate() {
            debug!(phase, directives = directives.len(), "applying construction phase");
            for directive in directives {
                builder.apply(directive)?;
            }
        }
        Ok(builder)
    }

    /// Applies one directive.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a duplicate name or a malformed element.
    pub fn apply(&mut self, directive: Directive) -> Result<()> {
        match directive {
            Directive::AddSkyPixSystem(system) => {
                if self.systems.contains_key(&system.name) {
                    return Err(Error::config(format!(
                        "duplicate skypix system '{}'",
                        system.name
                    )));
                }
                for level in 1..=system.max_level {
                    let name = system.dimension_name(level);
                    self.add_element(
                        name,
                        PendingElement {
                            doc: format!("Level {level} of the {} pixelization.", system.name),
                            kind: ElementKind::SkyPix {
                                system: system.name.clone(),
                                level,
                            },
                            requires: Vec::new(),
                            implies: Vec::new(),
                            keys: vec![FieldSpec::new("id", FieldType::Int, false)],
                            metadata: Vec::new(),
                            always_join: false,
                        },
                    )?;
                }
                self.families.push(TopologicalFamily {
                    name: system.name.clone(),
                    space: TopologicalSpace::Spatial,
                    members: (1..=system.max_level)
                        .rev()
                        .map(|level| system.dimension_name(level))
                        .collect(),
                });
                self.systems.insert(system.name.clone(), system);
            }
            Directive::AddElement { name, config } => {
                let pending = pending_element(&name, config)?;
                self.add_element(name, pending)?;
            }
            Directive::AddFamily(family) => {
                if self.families.iter().any(|f| f.name == family.name) {
                    return Err(Error::config(format!(
                        "duplicate topological family '{}'",
                        family.name
                    )));
                }
                if family.members.is_empty() {
                    return Err(Error::config(format!(
                        "topological family '{}' has no members",
                        family.name
                    )));
                }
                self.families.push(family);
            }
            Directive::AddPacker(factory) => {
                if self.packers.contains_key(&factory.name) {
                    return Err(Error::config(format!(
                        "duplicate packer '{}'",
                        factory.name
                    )));
                }
                self.packers.insert(factory.name.clone(), factory);
            }
        }
        Ok(())
    }

    fn add_element(&mut self, name: String, pending: PendingElement) -> Result<()> {
        if self.elements.contains_key(&name) {
            return Err(Error::config(format!("duplicate dimension element '{name}'")));
        }
        self.elements.insert(name, pending);
        Ok(())
    }

    /// Validates every reference and freezes the universe.
    ///
    /// # Errors
    ///
    /// Returns `Config` for unknown references, dependency cycles, invalid
    /// family membership, or invalid packer dimensions.
    pub fn finish(self) -> Result<DimensionUniverse> {
        self.check_references()?;
        let order = self.topological_order()?;

        let element_indices: HashMap<String, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let position = |name: &str| element_indices.get(name).copied().unwrap_or(usize::MAX);

        let mut elements: Vec<DimensionElement> = Vec::with_capacity(order.len());
        let mut dimensions = Vec::new();
        for (index, name) in order.iter().enumerate() {
            let pending = self
                .elements
                .get(name)
                .ok_or_else(|| Error::internal(format!("element '{name}' lost during sort")))?;
            let is_dimension = !matches!(pending.kind, ElementKind::Combination);

            // Dependencies precede dependents, so their closures are final.
            let mut required: BTreeSet<String> = BTreeSet::new();
            for dep in &pending.requires {
                if let Some(dep_element) = elements.get(position(dep)) {
                    required.extend(dep_element.required.iter().cloned());
                }
            }
            if is_dimension {
                required.insert(name.clone());
            }
            let mut required: Vec<String> = required.into_iter().collect();
            required.sort_by_key(|n| position(n));
            let mut implied = pending.implies.clone();
            implied.sort_by_key(|n| position(n));

            let dimension_index = if is_dimension {
                dimensions.push(index);
                Some(dimensions.len() - 1)
            } else {
                None
            };

            elements.push(DimensionElement {
                name: name.clone(),
                doc: pending.doc.clone(),
                kind: pending.kind.clone(),
                index,
                dimension_index,
                required,
                implied,
                keys: pending.keys.clone(),
                metadata: pending.metadata.clone(),
                record_fields: Vec::new(),
                spatial_family: None,
                temporal_family: None,
                always_join: pending.always_join,
            });
        }

        self.assign_families(&mut elements, &element_indices)?;
        let all_fields: Vec<Vec<FieldSpec>> = elements
            .iter()
            .map(|e| record_fields(&elements, &element_indices, e))
            .collect();
        for (element, fields) in elements.iter_mut().zip(all_fields) {
            element.record_fields = fields;
        }

        match element_indices.get(&self.common_skypix).map(|&i| &elements[i]) {
            Some(e) if e.is_skypix() => {}
            _ => {
                return Err(Error::config(format!(
                    "common skypix '{}' is not a skypix dimension",
                    self.common_skypix
                )))
            }
        }

        for factory in self.packers.values() {
            for name in factory.fixed.iter().chain(&factory.dimensions) {
                match element_indices.get(name).map(|&i| &elements[i]) {
                    Some(e) if e.is_dimension() => {}
                    _ => {
                        return Err(Error::config(format!(
                            "packer '{}' references unknown dimension '{name}'",
                            factory.name
                        )))
                    }
                }
            }
            if let Some(missing) = factory.fixed.iter().find(|f| !factory.dimensions.contains(f)) {
                return Err(Error::config(format!(
                    "packer '{}' fixes '{missing}' which is not one of its dimensions",
                    factory.name
                )));
            }
        }

        Ok(DimensionUniverse {
            version: self.version,
            common_skypix: self.common_skypix,
            elements,
            element_indices,
            dimensions,
            families: self.families,
            skypix_systems: self.systems,
            packers: self.packers,
            graphs: Mutex::new(HashMap::new()),
        })
    }

    fn check_references(&self) -> Result<()> {
        for (name, pending) in &self.elements {
            for dep in pending.requires.iter().chain(&pending.implies) {
                if dep == name {
                    return Err(Error::config(format!(
                        "element '{name}' depends on itself"
                    )));
                }
                match self.elements.get(dep) {
                    None => {
                        return Err(Error::config(format!(
                            "element '{name}' references unknown dimension '{dep}'"
                        )))
                    }
                    Some(target) if matches!(target.kind, ElementKind::Combination) => {
                        return Err(Error::config(format!(
                            "element '{name}' depends on '{dep}', which has no keys"
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over the dependency graph; ready elements are taken
    /// in name order.
    fn topological_order(&self) -> Result<Vec<String>> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::with_capacity(self.elements.len());
        for name in self.elements.keys() {
            nodes.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for (name, pending) in &self.elements {
            for dep in pending.requires.iter().chain(&pending.implies) {
                if let (Some(&from), Some(&to)) = (nodes.get(dep.as_str()), nodes.get(name.as_str())) {
                    graph.update_edge(from, to, ());
                }
            }
        }

        let mut in_degree: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
            .collect();
        let mut ready: BTreeMap<&str, NodeIndex> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .filter_map(|(&idx, _)| graph.node_weight(idx).map(|&n| (n, idx)))
            .collect();

        let mut order = Vec::with_capacity(graph.node_count());
        while let Some((name, idx)) = ready.pop_first() {
            order.push(name.to_string());
            for next in graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        if let Some(&next_name) = graph.node_weight(next) {
                            ready.insert(next_name, next);
                        }
                    }
                }
            }
        }

        if order.len() != graph.node_count() {
            let stuck: Vec<&str> = self
                .elements
                .keys()
                .map(String::as_str)
                .filter(|n| !order.iter().any(|o| o.as_str() == *n))
                .collect();
            return Err(Error::config(format!(
                "dimension dependency cycle among {stuck:?}"
            )));
        }
        Ok(order)
    }

    fn assign_families(
        &self,
        elements: &mut [DimensionElement],
        indices: &HashMap<String, usize>,
    ) -> Result<()> {
        for family in &self.families {
            let is_skypix_family = self.systems.contains_key(&family.name);
            for member in &family.members {
                let element = indices
                    .get(member)
                    .and_then(|&i| elements.get_mut(i))
                    .ok_or_else(|| {
                        Error::config(format!(
                            "family '{}' references unknown element '{member}'",
                            family.name
                        ))
                    })?;
                if element.is_skypix() != is_skypix_family {
                    return Err(Error::config(format!(
                        "element '{member}' cannot be a member of family '{}'",
                        family.name
                    )));
                }
                let slot = match family.space {
                    TopologicalSpace::Spatial => &mut element.spatial_family,
                    TopologicalSpace::Temporal => &mut element.temporal_family,
                };
                if let Some(existing) = slot {
                    return Err(Error::config(format!(
                        "element '{member}' is in both '{existing}' and '{}'",
                        family.name
                    )));
                }
                *slot = Some(family.name.clone());
            }
        }
        Ok(())
    }
}

fn pending_element(name: &str, config: ElementConfig) -> Result<PendingElement> {
    let mut keys = config
        .keys
        .into_iter()
        .map(|k| field_spec(name, k))
        .collect::<Result<Vec<_>>>()?;
    for key in &mut keys {
        key.nullable = false;
    }
    if let Some(pk) = keys.first() {
        if !matches!(pk.field_type, FieldType::Int | FieldType::String) {
            return Err(Error::config(format!(
                "primary key of '{name}' must be int or string"
            )));
        }
    }
    let metadata = config
        .metadata
        .into_iter()
        .map(|m| field_spec(name, m))
        .collect::<Result<Vec<_>>>()?;
    let kind = if keys.is_empty() {
        if config.requires.is_empty() {
            return Err(Error::config(format!(
                "element '{name}' has neither keys nor required dimensions"
            )));
        }
        ElementKind::Combination
    } else {
        ElementKind::Dimension
    };
    Ok(PendingElement {
        doc: config.doc,
        kind,
        requires: config.requires,
        implies: config.implies,
        keys,
        metadata,
        always_join: config.always_join,
    })
}

fn field_spec(element: &str, config: FieldConfig) -> Result<FieldSpec> {
    if matches!(config.name.as_str(), "region" | "timespan") {
        return Err(Error::config(format!(
            "field name '{}' on '{element}' is reserved",
            config.name
        )));
    }
    Ok(FieldSpec {
        name: config.name,
        field_type: config.field_type,
        nullable: config.nullable,
        doc: config.doc,
    })
}

fn record_fields(
    elements: &[DimensionElement],
    indices: &HashMap<String, usize>,
    element: &DimensionElement,
) -> Vec<FieldSpec> {
    let pk_type = |dim: &str| {
        indices
            .get(dim)
            .and_then(|&i| elements.get(i))
            .and_then(DimensionElement::primary_key)
            .map_or(FieldType::Int, |pk| pk.field_type)
    };
    let mut fields = Vec::new();
    for dim in &element.required {
        if *dim == element.name {
            fields.extend(element.keys.first().cloned());
        } else {
            fields.push(FieldSpec::new(dim.clone(), pk_type(dim), false));
        }
    }
    fields.extend(element.keys.iter().skip(1).cloned());
    for dim in &element.implied {
        fields.push(FieldSpec::new(dim.clone(), pk_type(dim), true));
    }
    fields.extend(element.metadata.iter().cloned());
    if element.is_spatial() {
        fields.push(FieldSpec::new("region", FieldType::Region, true));
    }
    if element.is_temporal() {
        fields.push(FieldSpec::new("timespan", FieldType::Timespan, true));
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(version: u32, elements: serde_json::Value) -> DimensionConfig {
        serde_json::from_value(serde_json::json!({
            "version": version,
            "skypix": { "common": "htm3", "htm": { "class": "htm", "max_level": 3 } },
            "elements": elements,
        }))
        .unwrap()
    }

    #[test]
    fn standard_universe_orders_dependencies_first() {
        let universe = DimensionUniverse::standard().unwrap();
        let idx = |n: &str| universe.element_index(n).unwrap();
        assert!(idx("instrument") < idx("detector"));
        assert!(idx("band") < idx("physical_filter"));
        assert!(idx("physical_filter") < idx("visit"));
        assert!(idx("visit") < idx("visit_detector_region"));
        assert!(idx("tract") < idx("patch"));
    }

    #[test]
    fn required_sets_are_closed_and_include_self() {
        let universe = DimensionUniverse::standard().unwrap();
        let patch = universe.element("patch").unwrap();
        assert_eq!(patch.required(), ["skymap", "tract", "patch"]);
        let vdr = universe.element("visit_detector_region").unwrap();
        assert_eq!(vdr.required(), ["instrument", "detector", "visit"]);
        assert!(!vdr.is_dimension());
    }

    #[test]
    fn cache_returns_the_same_instance() {
        let a = DimensionUniverse::standard().unwrap();
        let b = DimensionUniverse::from_version(a.version()).unwrap();
        assert!(std::ptr::eq(a, b));
        assert!(DimensionUniverse::from_version(987_654).unwrap_err().is_not_found());
    }

    #[test]
    fn cycles_are_fatal() {
        let err = DimensionUniverse::from_config(&config(
            9001,
            serde_json::json!({
                "a": { "requires": ["b"], "keys": [{"name": "id", "type": "int"}] },
                "b": { "implies": ["a"], "keys": [{"name": "id", "type": "int"}] },
            }),
        ))
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(DimensionUniverse::from_version(9001).is_err());
    }

    #[test]
    fn unknown_references_are_fatal() {
        let err = DimensionUniverse::from_config(&config(
            9002,
            serde_json::json!({
                "detector": { "requires": ["instrument"], "keys": [{"name": "id", "type": "int"}] },
            }),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("instrument"));
    }

    #[test]
    fn unknown_packer_class_is_fatal_at_load() {
        let mut cfg = config(
            9003,
            serde_json::json!({
                "instrument": { "keys": [{"name": "name", "type": "string"}] },
            }),
        );
        cfg.packers.insert(
            "p".into(),
            crate::dimensions::config::PackerConfig {
                cls: "does_not_exist".into(),
                fixed: vec!["instrument".into()],
                dimensions: vec!["instrument".into()],
            },
        );
        let err = DimensionUniverse::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("does_not_exist"));
    }

    #[test]
    fn skypix_families_prefer_finest_level() {
        let universe = DimensionUniverse::standard().unwrap();
        let htm = universe.family("htm").unwrap();
        assert_eq!(htm.members().first().map(String::as_str), Some("htm7"));
        assert_eq!(
            universe.skypix_region("htm6", 2).unwrap().envelope(),
            &[(8, 12)]
        );
    }

    #[test]
    fn encode_length_counts_dimensions() {
        let universe = DimensionUniverse::standard().unwrap();
        let dims = universe.dimensions().count();
        assert_eq!(universe.encode_length(), dims.div_ceil(8));
    }
}
