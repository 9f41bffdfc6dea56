//! Project loader
//!
//! Walks the root project and every installed package, producing the
//! complete set of raw definitions. Errors are collected per file and
//! surfaced together once loading finishes.

use crate::definition::{ColumnSpec, Definition, SourceSpec, TestSpec};
use crate::error::LoadError;
use crate::generic_tests::{self, TestParent};
use crate::schema_file::{ColumnEntry, ModelPatch, SchemaFile};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use strata_core::{
    ConfigScope, Diagnostic, DiagnosticCode, DefinitionKind, Location, Materialization,
    PartialConfig, ProjectConfig, ResourceType, TestType,
};
use walkdir::WalkDir;

/// A namespace of definitions: the root project or an installed package
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,

    /// Absolute package root
    pub root: PathBuf,

    /// Package root relative to the project root (empty for the root project)
    pub relative_root: PathBuf,

    pub config: ProjectConfig,

    pub is_root: bool,
}

/// Result of loading a project
#[derive(Debug, Clone)]
pub struct LoadedProject {
    /// Root project configuration
    pub config: ProjectConfig,

    /// Root project first, then packages by name
    pub packages: Vec<Package>,

    /// Definitions ordered by unique id
    pub definitions: Vec<Definition>,

    /// File-level errors
    pub errors: Vec<LoadError>,

    /// Non-fatal findings (orphan patches)
    pub warnings: Vec<Diagnostic>,
}

impl LoadedProject {
    /// Name of the root namespace
    pub fn root_package(&self) -> &str {
        &self.config.name
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// All findings as diagnostics, errors first
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.errors
            .iter()
            .map(LoadError::to_diagnostic)
            .chain(self.warnings.iter().cloned())
            .collect()
    }

    pub fn get(&self, unique_id: &str) -> Option<&Definition> {
        self.definitions.iter().find(|d| d.unique_id == unique_id)
    }
}

/// Loads definitions from a project tree
pub struct Loader {
    project_root: PathBuf,
}

/// Config scopes of one resource type (models or tests)
#[derive(Default)]
struct Scopes {
    root: ConfigScope,
    package: Option<ConfigScope>,
}

impl Scopes {
    /// Layers in merge order: root defaults, package scopes, root scopes for the package
    fn declared(&self, fqn: &[String]) -> PartialConfig {
        let mut layers = vec![&self.root.config];
        if let Some(package) = &self.package {
            layers.extend(package.layers_for(fqn));
        }
        layers.extend(self.root.scoped_layers_for(fqn));
        PartialConfig::layered(layers)
    }
}

struct LoadState {
    definitions: Vec<Definition>,
    seen: HashMap<(ResourceType, String, String), String>,
    errors: Vec<LoadError>,
    warnings: Vec<Diagnostic>,
    root_models: ConfigScope,
    root_tests: ConfigScope,
}

impl LoadState {
    /// Register a definition unless its name is already taken in the package
    fn add(&mut self, definition: Definition) {
        let key = (
            definition.resource_type(),
            definition.package.clone(),
            definition.name.clone(),
        );

        if let Some(first) = self.seen.get(&key) {
            self.errors.push(LoadError::DuplicateDefinition {
                resource: definition.resource_type().to_string(),
                package: definition.package.clone(),
                name: definition.name.clone(),
                first: first.clone(),
                second: definition.original_file_path.clone(),
            });
            return;
        }

        self.seen.insert(key, definition.original_file_path.clone());
        self.definitions.push(definition);
    }

    fn malformed(&mut self, path: &str, message: impl Into<String>) {
        self.errors.push(LoadError::MalformedConfig {
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// A schema file waiting for every model of its package to be loaded
struct PendingSchema {
    display_path: String,
    directories: Vec<String>,
    schema: SchemaFile,
}

impl Loader {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Load the project
    ///
    /// Only an unusable root project file fails the call; every other
    /// problem is collected in [`LoadedProject::errors`].
    pub fn load(&self) -> Result<LoadedProject, LoadError> {
        let project_file = self.project_root.join(ProjectConfig::FILE_NAME);
        if !project_file.is_file() {
            return Err(LoadError::MissingProjectFile(project_file.display().to_string()));
        }

        let mut config = ProjectConfig::from_file(&project_file).map_err(|e| {
            LoadError::MalformedConfig {
                path: ProjectConfig::FILE_NAME.to_string(),
                message: e.to_string(),
            }
        })?;
        config.project_root = self.project_root.clone();

        let mut state = LoadState {
            definitions: Vec::new(),
            seen: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            root_models: ConfigScope::default(),
            root_tests: ConfigScope::default(),
        };

        match config.model_scope() {
            Ok(scope) => state.root_models = scope,
            Err(e) => state.malformed(ProjectConfig::FILE_NAME, e.to_string()),
        }
        match config.test_scope() {
            Ok(scope) => state.root_tests = scope,
            Err(e) => state.malformed(ProjectConfig::FILE_NAME, e.to_string()),
        }

        let mut packages = vec![Package {
            name: config.name.clone(),
            root: self.project_root.clone(),
            relative_root: PathBuf::new(),
            config: config.clone(),
            is_root: true,
        }];
        packages.extend(self.discover_packages(&config, &mut state));

        for package in &packages {
            let before = state.definitions.len();
            self.load_package(package, &mut state);
            tracing::debug!(
                package = %package.name,
                definitions = state.definitions.len() - before,
                "Loaded package"
            );
        }

        let mut definitions = state.definitions;
        definitions.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));

        tracing::info!(
            project = %config.name,
            packages = packages.len(),
            definitions = definitions.len(),
            errors = state.errors.len(),
            "Project loaded"
        );

        Ok(LoadedProject {
            config,
            packages,
            definitions,
            errors: state.errors,
            warnings: state.warnings,
        })
    }

    /// Installed packages, ordered by directory name
    fn discover_packages(&self, config: &ProjectConfig, state: &mut LoadState) -> Vec<Package> {
        let install_dir = self.project_root.join(&config.packages_install_path);
        if !install_dir.is_dir() {
            return Vec::new();
        }

        let mut packages: Vec<Package> = Vec::new();
        let mut names: HashMap<String, String> = HashMap::new();
        names.insert(config.name.clone(), ProjectConfig::FILE_NAME.to_string());

        for entry in WalkDir::new(&install_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }

            let root = entry.path().to_path_buf();
            let project_file = root.join(ProjectConfig::FILE_NAME);
            if !project_file.is_file() {
                continue;
            }

            let relative_root = relative_to(&root, &self.project_root);
            let display = display_path(&relative_root.join(ProjectConfig::FILE_NAME));

            let package_config = match ProjectConfig::from_file(&project_file) {
                Ok(package_config) => package_config,
                Err(e) => {
                    state.malformed(&display, e.to_string());
                    continue;
                }
            };

            if let Some(first) = names.get(&package_config.name) {
                state.errors.push(LoadError::DuplicateDefinition {
                    resource: "package".to_string(),
                    package: package_config.name.clone(),
                    name: package_config.name.clone(),
                    first: first.clone(),
                    second: display,
                });
                continue;
            }
            names.insert(package_config.name.clone(), display);

            packages.push(Package {
                name: package_config.name.clone(),
                root,
                relative_root,
                config: package_config,
                is_root: false,
            });
        }

        packages
    }

    fn load_package(&self, package: &Package, state: &mut LoadState) {
        let mut model_scopes = Scopes {
            root: state.root_models.clone(),
            package: None,
        };
        let mut test_scopes = Scopes {
            root: state.root_tests.clone(),
            package: None,
        };

        if !package.is_root {
            let display = display_path(&package.relative_root.join(ProjectConfig::FILE_NAME));
            match package.config.model_scope() {
                Ok(scope) => model_scopes.package = Some(scope),
                Err(e) => state.malformed(&display, e.to_string()),
            }
            match package.config.test_scope() {
                Ok(scope) => test_scopes.package = Some(scope),
                Err(e) => state.malformed(&display, e.to_string()),
            }
        }

        let mut pending = Vec::new();

        for model_path in &package.config.model_paths {
            for (file, relative) in files_under(&package.root.join(model_path)) {
                let display = display_path(&package.relative_root.join(model_path).join(&relative));
                let directories = directories_of(&relative);

                match file.extension().and_then(|e| e.to_str()) {
                    Some("sql") => {
                        let Some(raw_body) = read_file(&file, &display, state) else {
                            continue;
                        };
                        let name = file_stem(&file);
                        let fqn = fqn_of(&package.name, &directories, &name);
                        let config = model_scopes.declared(&fqn);
                        state.add(Definition::model(&package.name, &name, raw_body, display, fqn, config));
                    }
                    Some("toml") => {
                        let Some(contents) = read_file(&file, &display, state) else {
                            continue;
                        };
                        match SchemaFile::from_toml(&contents) {
                            Ok(schema) => pending.push(PendingSchema {
                                display_path: display,
                                directories,
                                schema,
                            }),
                            Err(message) => state.malformed(&display, message),
                        }
                    }
                    _ => {}
                }
            }
        }

        // Patches apply once every model file of the package is known
        let mut patched: HashMap<String, String> = HashMap::new();
        for schema in pending {
            self.load_sources(package, &schema, &test_scopes, state);
            for patch in &schema.schema.models {
                self.apply_patch(package, &schema, patch, &mut patched, &test_scopes, state);
            }
        }

        for test_path in &package.config.test_paths {
            for (file, relative) in files_under(&package.root.join(test_path)) {
                if file.extension().and_then(|e| e.to_str()) != Some("sql") {
                    continue;
                }

                let display = display_path(&package.relative_root.join(test_path).join(&relative));
                let Some(raw_body) = read_file(&file, &display, state) else {
                    continue;
                };

                let name = file_stem(&file);
                let fqn = fqn_of(&package.name, &directories_of(&relative), &name);
                let config = test_scopes.declared(&fqn);
                state.add(Definition::test(
                    &package.name,
                    &name,
                    raw_body,
                    display,
                    fqn,
                    config,
                    TestSpec::data(),
                ));
            }
        }
    }

    fn load_sources(&self, package: &Package, pending: &PendingSchema, tests: &Scopes, state: &mut LoadState) {
        for entry in &pending.schema.sources {
            for table in &entry.tables {
                let spec = SourceSpec {
                    source_name: entry.name.clone(),
                    table_name: table.name.clone(),
                    database: entry.database.clone(),
                    schema: entry.schema.clone().unwrap_or_else(|| entry.name.clone()),
                    identifier: table.identifier.clone().unwrap_or_else(|| table.name.clone()),
                };

                let mut config = PartialConfig::default();
                for (declared, tags) in [(&entry.config, &entry.tags), (&table.config, &table.tags)] {
                    if let Some(declared) = declared {
                        config.merge(declared);
                    }
                    if !tags.is_empty() {
                        config.merge(&PartialConfig {
                            tags: Some(tags.clone()),
                            ..Default::default()
                        });
                    }
                }

                let mut definition = Definition::source(&package.name, spec, pending.display_path.clone(), config);
                definition.description = table.description.clone();
                definition.columns = column_specs(&table.columns);
                state.add(definition);

                let parent = TestParent::Source {
                    source: entry.name.clone(),
                    table: table.name.clone(),
                };
                self.generate_tests(package, pending, &parent, &table.columns, tests, state);
            }
        }
    }

    fn apply_patch(
        &self,
        package: &Package,
        pending: &PendingSchema,
        patch: &ModelPatch,
        patched: &mut HashMap<String, String>,
        tests: &Scopes,
        state: &mut LoadState,
    ) {
        if let Some(first) = patched.get(&patch.name) {
            state.errors.push(LoadError::DuplicateDefinition {
                resource: "model patch".to_string(),
                package: package.name.clone(),
                name: patch.name.clone(),
                first: first.clone(),
                second: pending.display_path.clone(),
            });
            return;
        }
        patched.insert(patch.name.clone(), pending.display_path.clone());

        let target = state.definitions.iter_mut().find(|d| {
            d.package == package.name && d.resource_type() == ResourceType::Model && d.name == patch.name
        });

        let Some(definition) = target else {
            tracing::warn!(model = %patch.name, file = %pending.display_path, "Patch for unknown model");
            state.warnings.push(
                Diagnostic::warn(
                    DiagnosticCode::LoadOrphanPatch,
                    format!("Schema file patches model '{}' which does not exist", patch.name),
                )
                .with_token(patch.name.clone())
                .with_location(Location::new(pending.display_path.clone())),
            );
            return;
        };

        if let Some(config) = &patch.config {
            definition.config.merge(config);
            definition.kind = if definition.config.materialized == Some(Materialization::Ephemeral) {
                DefinitionKind::Ephemeral
            } else {
                DefinitionKind::Model
            };
        }
        definition.description = patch.description.clone();
        definition.columns = column_specs(&patch.columns);

        let parent = TestParent::Model(patch.name.clone());
        self.generate_tests(package, pending, &parent, &patch.columns, tests, state);
    }

    fn generate_tests(
        &self,
        package: &Package,
        pending: &PendingSchema,
        parent: &TestParent,
        columns: &[ColumnEntry],
        tests: &Scopes,
        state: &mut LoadState,
    ) {
        for column in columns {
            for declared in &column.tests {
                let generated = declared.parts().and_then(|(test_name, args)| {
                    generic_tests::generate(&test_name, &args, parent, &column.name)
                });

                let generated = match generated {
                    Ok(generated) => generated,
                    Err(message) => {
                        state.malformed(
                            &pending.display_path,
                            format!("column '{}' of '{}': {}", column.name, parent.display_name(), message),
                        );
                        continue;
                    }
                };

                let fqn = fqn_of(&package.name, &pending.directories, &generated.name);
                let mut config = tests.declared(&fqn);
                config.merge(&generated.config);

                let spec = TestSpec {
                    test_type: TestType::Schema,
                    test_name: Some(generated.test.as_str().to_string()),
                    column_name: Some(column.name.clone()),
                    attached_to: Some(parent.display_name()),
                    kwargs: generated.kwargs,
                };

                state.add(Definition::test(
                    &package.name,
                    &generated.name,
                    generated.body,
                    pending.display_path.clone(),
                    fqn,
                    config,
                    spec,
                ));
            }
        }
    }
}

/// Files under `dir` with their path relative to it, in file-name order
fn files_under(dir: &Path) -> Vec<(PathBuf, PathBuf)> {
    if !dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let path = e.path().to_path_buf();
            let relative = relative_to(&path, dir);
            (path, relative)
        })
        .collect()
}

fn read_file(path: &Path, display: &str, state: &mut LoadState) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) => {
            state.errors.push(LoadError::Io {
                path: display.to_string(),
                message: e.to_string(),
            });
            None
        }
    }
}

fn relative_to(path: &Path, base: &Path) -> PathBuf {
    path.strip_prefix(base).unwrap_or(path).to_path_buf()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn directories_of(relative: &Path) -> Vec<String> {
    relative
        .parent()
        .map(|parent| {
            parent
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn fqn_of(package: &str, directories: &[String], name: &str) -> Vec<String> {
    let mut fqn = Vec::with_capacity(directories.len() + 2);
    fqn.push(package.to_string());
    fqn.extend(directories.iter().cloned());
    fqn.push(name.to_string());
    fqn
}

/// Forward-slash path for reports
fn display_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn column_specs(columns: &[ColumnEntry]) -> BTreeMap<String, ColumnSpec> {
    columns
        .iter()
        .map(|column| {
            (
                column.name.clone(),
                ColumnSpec {
                    name: column.name.clone(),
                    description: column.description.clone(),
                    data_type: column.data_type.clone(),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqn_includes_directories() {
        let relative = Path::new("staging/orders/stg_orders.sql");
        let fqn = fqn_of("shop", &directories_of(relative), "stg_orders");
        assert_eq!(fqn, vec!["shop", "staging", "orders", "stg_orders"]);
    }

    #[test]
    fn display_path_uses_forward_slashes() {
        let path = Path::new("strata_packages").join("utils").join("models");
        assert_eq!(display_path(&path), "strata_packages/utils/models");
    }

    #[test]
    fn missing_project_file() {
        let dir = std::env::temp_dir().join("strata-loader-missing-project");
        let result = Loader::new(&dir).load();
        assert!(matches!(result, Err(LoadError::MissingProjectFile(_))));
    }
}
