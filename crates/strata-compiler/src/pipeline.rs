//! Compile pipeline
//!
//! Loader -> pass 1 (extraction) -> name resolution -> graph -> pass 2
//! (expansion) -> manifest. Node-level errors are collected and the compile
//! keeps going; only a dependency cycle stops it early.

use crate::error::CompileFailure;
use crate::options::CompileOptions;
use crate::relations::{physical_relation, relation_for};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use strata_core::{
    checksum, Diagnostic, DiagnosticCode, Location, Materialization, NodeConfig, PartialConfig, Relation,
    Report, ResourceType,
};
use strata_graph::{
    DependencyGraph, DependsOn, GraphCycleError, Manifest, ManifestMetadata, ManifestNode, ManifestSource,
    ReferenceIndex, Resolution,
};
use strata_project::{Definition, LoadedProject, Loader};
use strata_template::{
    extract, Expander, ExpansionUnit, Extraction, ModelContext, ReferenceTable, ResolvedRef, TargetContext,
    TemplateContext, TemplateError,
};

/// A successful compile
#[derive(Debug, Clone)]
pub struct Compilation {
    pub manifest: Manifest,

    /// Warnings and info diagnostics
    pub report: Report,
}

/// Load and compile the project at `options.project_dir`
pub fn compile(options: &CompileOptions) -> Result<Compilation, CompileFailure> {
    let project = Loader::new(&options.project_dir)
        .load()
        .map_err(|error| failure(vec![error.to_diagnostic()], 0))?;

    compile_project(&project, options)
}

/// Per-definition state carried between passes
struct Pending<'p> {
    definition: &'p Definition,
    config: NodeConfig,
    relation: Option<Relation>,

    /// `None` when pass 1 failed
    extraction: Option<Extraction>,
}

impl Pending<'_> {
    fn is_ephemeral(&self) -> bool {
        self.definition.resource_type() == ResourceType::Model
            && self.config.materialized == Materialization::Ephemeral
    }

    fn is_source(&self) -> bool {
        self.definition.resource_type() == ResourceType::Source
    }
}

/// Edges and rendering table of one node
#[derive(Default)]
struct Resolved {
    depends_on: BTreeSet<String>,
    disabled: BTreeSet<String>,
    table: ReferenceTable,
}

/// Compile an already loaded project
pub fn compile_project(project: &LoadedProject, options: &CompileOptions) -> Result<Compilation, CompileFailure> {
    let mut collector = Collector::new(project.diagnostics());
    let target = &options.target;

    tracing::debug!(definitions = project.definitions.len(), "Pass 1: extracting references");

    let mut pending: BTreeMap<String, Pending<'_>> = BTreeMap::new();
    for definition in &project.definitions {
        let (config, extraction) = match first_pass(definition) {
            Ok(result) => result,
            Err(diagnostic) => {
                collector.push(diagnostic);
                (definition.config.resolve(), None)
            }
        };

        pending.insert(
            definition.unique_id.clone(),
            Pending {
                definition,
                relation: relation_for(definition, &config, target),
                config,
                extraction,
            },
        );
    }

    let mut index = ReferenceIndex::new(project.root_package());
    for node in pending.values() {
        let definition = node.definition;
        match (&definition.source, definition.resource_type()) {
            (Some(source), _) => index.insert_source(
                &definition.package,
                &source.source_name,
                &source.table_name,
                &definition.unique_id,
                node.config.enabled,
            ),
            (None, ResourceType::Model) => {
                index.insert_model(&definition.package, &definition.name, &definition.unique_id, node.config.enabled)
            }
            _ => {}
        }
    }

    tracing::debug!("Resolving references");

    let mut resolved: BTreeMap<String, Resolved> = BTreeMap::new();
    for (id, node) in pending.iter().filter(|(_, n)| n.config.enabled && !n.is_source()) {
        let Some(extraction) = &node.extraction else { continue };
        match resolve_node(node, extraction, &index, &pending, target) {
            Ok(result) => {
                for disabled in &result.disabled {
                    tracing::warn!(node = %id, disabled = %disabled, "Reference to disabled node");
                    collector.push(
                        Diagnostic::warn(
                            DiagnosticCode::DisabledDependency,
                            format!("{} references disabled {}; no edge created", id, disabled),
                        )
                        .with_node(id.clone())
                        .with_token(disabled.clone()),
                    );
                }
                resolved.insert(id.clone(), result);
            }
            Err(errors) => {
                for error in errors {
                    collector.push(template_diagnostic(&error, node.definition));
                }
            }
        }
    }

    let mut graph = DependencyGraph::new();
    for id in pending.iter().filter(|(_, n)| n.config.enabled).map(|(id, _)| id) {
        graph.add_node(id);
        if let Some(result) = resolved.get(id) {
            for parent in &result.depends_on {
                graph.add_edge(id, parent);
            }
        }
    }

    // Cycles made only of ephemerals are template self-references; the
    // expander reports them as circular context instead
    let ephemerals: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, n)| n.is_ephemeral())
        .map(|(id, _)| id.as_str())
        .collect();

    while let Some(path) = graph.find_cycle() {
        if path.iter().all(|id| ephemerals.contains(id.as_str())) && path.len() >= 2 {
            tracing::debug!(path = %path.join(" -> "), "Ephemeral-only cycle left to expansion");
            graph.remove_edge(&path[0], &path[1]);
            continue;
        }

        let error = GraphCycleError { path };
        tracing::debug!(error = %error, "Aborting compile");
        collector.push(error.to_diagnostic());
        return Err(collector.into_failure(project.definitions.len()));
    }

    let order = match graph.topological_sort() {
        Ok(order) => order,
        Err(error) => {
            collector.push(error.to_diagnostic());
            return Err(collector.into_failure(project.definitions.len()));
        }
    };

    tracing::debug!(nodes = order.len(), "Pass 2: expanding templates");

    let vars = package_vars(project, options);
    let target_context = TargetContext::from(target);

    let disabled: BTreeMap<String, Vec<String>> = resolved
        .iter()
        .map(|(id, result)| (id.clone(), result.disabled.iter().cloned().collect()))
        .collect();

    let mut units: BTreeMap<String, ExpansionUnit> = BTreeMap::new();
    for (id, result) in resolved {
        let Some(node) = pending.get(&id) else { continue };
        let definition = node.definition;

        let model = ModelContext {
            name: definition.name.clone(),
            unique_id: id.clone(),
            package: definition.package.clone(),
            resource_type: definition.resource_type().as_str().to_string(),
            config: node.config.clone(),
        };

        let mut context = TemplateContext::new(model, target_context.clone())
            .with_vars(vars.get(&definition.package).cloned().unwrap_or_default())
            .incremental(node.config.materialized == Materialization::Incremental && !options.full_refresh);
        if let Some(relation) = &node.relation {
            context = context.with_this(relation.clone());
        }

        units.insert(
            id.clone(),
            ExpansionUnit {
                unique_id: id,
                body: definition.raw_body.clone(),
                context,
                references: Arc::new(result.table),
            },
        );
    }

    let mut expander = Expander::new(&units);
    let mut compiled: BTreeMap<String, String> = BTreeMap::new();
    for id in order.iter().filter(|id| units.contains_key(*id)) {
        match expander.expand(id) {
            Ok(expanded) => {
                compiled.insert(id.clone(), expanded.compiled);
            }
            Err(error) => {
                if let Some(node) = pending.get(id) {
                    collector.push(template_diagnostic(&error, node.definition));
                }
            }
        }
    }

    if collector.has_errors() {
        return Err(collector.into_failure(project.definitions.len()));
    }

    let manifest = assemble(project, options, &pending, &graph, &compiled, &disabled);
    tracing::info!(
        nodes = manifest.nodes.len(),
        sources = manifest.sources.len(),
        disabled = manifest.disabled.len(),
        "Compiled project"
    );

    let mut report = Report::from_diagnostics(collector.diagnostics);
    report.summary.definitions_loaded = project.definitions.len();
    report.summary.nodes_compiled = manifest.nodes.len();

    Ok(Compilation { manifest, report })
}

/// Extract references and merge the inline `config()` call
fn first_pass(definition: &Definition) -> Result<(NodeConfig, Option<Extraction>), Diagnostic> {
    if definition.resource_type() == ResourceType::Source {
        return Ok((definition.config.resolve(), Some(Extraction::default())));
    }

    let extraction = extract(&definition.unique_id, &definition.raw_body)
        .map_err(|error| template_diagnostic(&error, definition))?;

    let mut config = definition.config.clone();
    if !extraction.config.is_empty() {
        let inline = PartialConfig::from_json(serde_json::Value::Object(extraction.config.clone())).map_err(|e| {
            Diagnostic::error(
                DiagnosticCode::LoadMalformedConfig,
                format!("Invalid config() in {}: {}", definition.unique_id, e),
            )
            .with_node(definition.unique_id.clone())
            .with_location(Location::new(definition.original_file_path.clone()))
        })?;
        config.merge(&inline);
    }

    Ok((config.resolve(), Some(extraction)))
}

/// Resolve every extracted call of one node
fn resolve_node(
    node: &Pending<'_>,
    extraction: &Extraction,
    index: &ReferenceIndex,
    pending: &BTreeMap<String, Pending<'_>>,
    target: &strata_core::TargetConfig,
) -> Result<Resolved, Vec<TemplateError>> {
    let definition = node.definition;
    let id = &definition.unique_id;
    let mut result = Resolved::default();
    let mut errors = Vec::new();

    let record = |resolution: &Resolution, result: &mut Resolved| match resolution {
        Resolution::Node(target_id) => {
            result.depends_on.insert(target_id.clone());
        }
        Resolution::Disabled(target_id) => {
            result.disabled.insert(target_id.clone());
        }
    };

    for call in &extraction.refs {
        match index.resolve_ref(id, &definition.package, call) {
            Ok(resolution) => {
                record(&resolution, &mut result);
                if let Some(rendered) = rendered_ref(&resolution, pending, target) {
                    result.table.insert_ref(call.clone(), rendered);
                }
            }
            Err(error) => errors.push(error),
        }
    }

    for call in &extraction.sources {
        match index.resolve_source(id, &definition.package, call) {
            Ok(resolution) => {
                record(&resolution, &mut result);
                if let Some(relation) = pending.get(resolution.unique_id()).and_then(|p| p.relation.as_ref()) {
                    result.table.insert_source(call.clone(), relation.to_string());
                }
            }
            Err(error) => errors.push(error),
        }
    }

    if errors.is_empty() {
        Ok(result)
    } else {
        Err(errors)
    }
}

/// What a resolved `ref()` renders as
fn rendered_ref(
    resolution: &Resolution,
    pending: &BTreeMap<String, Pending<'_>>,
    target: &strata_core::TargetConfig,
) -> Option<ResolvedRef> {
    let node = pending.get(resolution.unique_id())?;

    match (resolution, node.is_ephemeral(), &node.relation) {
        (Resolution::Node(id), true, _) => Some(ResolvedRef::Ephemeral {
            unique_id: id.clone(),
            name: node.definition.name.clone(),
        }),
        (_, _, Some(relation)) => Some(ResolvedRef::Relation(relation.to_string())),
        (_, _, None) => Some(ResolvedRef::Relation(
            physical_relation(node.definition, &node.config, target).to_string(),
        )),
    }
}

/// Vars visible to each package: its own, then the root project's, then overrides
fn package_vars(
    project: &LoadedProject,
    options: &CompileOptions,
) -> BTreeMap<String, Arc<BTreeMap<String, serde_json::Value>>> {
    let root_vars = project.config.vars.clone();

    project
        .packages
        .iter()
        .map(|package| {
            let mut vars = package.config.vars.clone();
            vars.extend(root_vars.clone());
            vars.extend(options.vars.clone());
            (package.name.clone(), Arc::new(vars))
        })
        .collect()
}

/// Hash of the vars the root project compiles with
fn vars_hash(project: &LoadedProject, options: &CompileOptions) -> String {
    let mut vars = project.config.vars.clone();
    vars.extend(options.vars.clone());
    checksum(&serde_json::to_string(&vars).unwrap_or_default())
}

fn assemble(
    project: &LoadedProject,
    options: &CompileOptions,
    pending: &BTreeMap<String, Pending<'_>>,
    graph: &DependencyGraph,
    compiled: &BTreeMap<String, String>,
    disabled: &BTreeMap<String, Vec<String>>,
) -> Manifest {
    let mut manifest = Manifest::new(ManifestMetadata {
        project_name: project.root_package().to_string(),
        strata_version: env!("CARGO_PKG_VERSION").to_string(),
        vars_hash: vars_hash(project, options),
        target_name: options.target.name.clone(),
    });

    for (id, node) in pending {
        let definition = node.definition;

        if let Some(source) = &definition.source {
            let Some(relation) = node.relation.clone().filter(|_| node.config.enabled) else { continue };
            manifest.sources.insert(
                id.clone(),
                ManifestSource {
                    unique_id: id.clone(),
                    source_name: source.source_name.clone(),
                    name: source.table_name.clone(),
                    package_name: definition.package.clone(),
                    original_file_path: definition.original_file_path.clone(),
                    fqn: definition.fqn.clone(),
                    relation,
                    config: node.config.clone(),
                    description: definition.description.clone(),
                    columns: definition.columns.clone(),
                },
            );
            continue;
        }

        let mut depends_on = DependsOn::default();
        if node.config.enabled {
            depends_on.nodes = graph.parents(id).to_vec();
            depends_on.disabled = disabled.get(id).cloned().unwrap_or_default();
        }

        let manifest_node = ManifestNode {
            unique_id: id.clone(),
            name: definition.name.clone(),
            resource_type: definition.resource_type(),
            package_name: definition.package.clone(),
            original_file_path: definition.original_file_path.clone(),
            fqn: definition.fqn.clone(),
            relation: node.relation.clone(),
            config: node.config.clone(),
            description: definition.description.clone(),
            columns: definition.columns.clone(),
            raw_body: definition.raw_body.clone(),
            compiled_body: compiled.get(id).cloned().unwrap_or_default(),
            checksum: definition.checksum.clone(),
            depends_on,
            test_metadata: definition.test.clone(),
        };

        if node.config.enabled {
            manifest.nodes.insert(id.clone(), manifest_node);
        } else {
            manifest.disabled.insert(id.clone(), manifest_node);
        }
    }

    for node in graph.nodes() {
        manifest.parent_map.insert(node.clone(), graph.parents(node).to_vec());
        manifest.child_map.insert(node.clone(), graph.children(node).to_vec());
    }

    manifest
}

fn template_diagnostic(error: &TemplateError, definition: &Definition) -> Diagnostic {
    let location = match error.line() {
        Some(line) => Location::with_line(definition.original_file_path.clone(), line),
        None => Location::new(definition.original_file_path.clone()),
    };
    error.to_diagnostic().with_location(location)
}

fn failure(diagnostics: Vec<Diagnostic>, definitions: usize) -> CompileFailure {
    let mut report = Report::from_diagnostics(diagnostics);
    report.summary.definitions_loaded = definitions;
    CompileFailure { report }
}

/// Diagnostics gathered across passes, deduplicated
struct Collector {
    diagnostics: Vec<Diagnostic>,
    seen: HashSet<(DiagnosticCode, String)>,
}

impl Collector {
    fn new(initial: Vec<Diagnostic>) -> Self {
        let mut collector = Self {
            diagnostics: Vec::new(),
            seen: HashSet::new(),
        };
        for diagnostic in initial {
            collector.push(diagnostic);
        }
        collector
    }

    fn push(&mut self, diagnostic: Diagnostic) {
        if self.seen.insert((diagnostic.code, diagnostic.message.clone())) {
            self.diagnostics.push(diagnostic);
        }
    }

    fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    fn into_failure(self, definitions: usize) -> CompileFailure {
        failure(self.diagnostics, definitions)
    }
}
