//! Name resolution for `ref()` and `source()` calls
//!
//! An unqualified `ref('name')` is looked up in the referencing node's own
//! package first, then in the root project, then in any other package that
//! has exactly one match. References to disabled definitions resolve but
//! never become edges.

use std::collections::HashMap;
use strata_template::{RefCall, SourceCall, TemplateError};

/// Outcome of resolving one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Enabled node, becomes an edge
    Node(String),

    /// Disabled definition, recorded on the referencing node only
    Disabled(String),
}

impl Resolution {
    pub fn unique_id(&self) -> &str {
        match self {
            Self::Node(id) | Self::Disabled(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    package: String,
    unique_id: String,
    enabled: bool,
}

impl Candidate {
    fn resolution(&self) -> Resolution {
        if self.enabled {
            Resolution::Node(self.unique_id.clone())
        } else {
            Resolution::Disabled(self.unique_id.clone())
        }
    }
}

/// Lookup table of every referable definition, by name
#[derive(Debug, Clone)]
pub struct ReferenceIndex {
    root_package: String,
    models: HashMap<String, Vec<Candidate>>,
    sources: HashMap<(String, String), Vec<Candidate>>,
}

impl ReferenceIndex {
    pub fn new(root_package: impl Into<String>) -> Self {
        Self {
            root_package: root_package.into(),
            models: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    pub fn root_package(&self) -> &str {
        &self.root_package
    }

    /// Register a model (ephemeral or not)
    pub fn insert_model(&mut self, package: &str, name: &str, unique_id: &str, enabled: bool) {
        self.models.entry(name.to_string()).or_default().push(Candidate {
            package: package.to_string(),
            unique_id: unique_id.to_string(),
            enabled,
        });
    }

    /// Register a source table
    pub fn insert_source(&mut self, package: &str, source: &str, table: &str, unique_id: &str, enabled: bool) {
        self.sources
            .entry((source.to_string(), table.to_string()))
            .or_default()
            .push(Candidate {
                package: package.to_string(),
                unique_id: unique_id.to_string(),
                enabled,
            });
    }

    /// Resolve a `ref()` made by `node` in `package`
    pub fn resolve_ref(&self, node: &str, package: &str, call: &RefCall) -> Result<Resolution, TemplateError> {
        let candidates = self.models.get(&call.name).map(Vec::as_slice).unwrap_or(&[]);

        let found = match &call.package {
            Some(qualifier) => match candidates.iter().find(|c| &c.package == qualifier) {
                Some(candidate) => Ok(candidate),
                None => Err(match candidates.is_empty() {
                    true => format!("no model named '{}' in any package", call.name),
                    false => format!(
                        "'{}' exists in {} but not in package '{}'",
                        call.name,
                        packages_of(candidates),
                        qualifier
                    ),
                }),
            },
            None => self.pick(package, candidates),
        };

        found.map(Candidate::resolution).map_err(|hint| TemplateError::UnresolvedReference {
            node: node.to_string(),
            reference: call.to_string(),
            hint: Some(hint),
        })
    }

    /// Resolve a `source()` made by `node` in `package`
    pub fn resolve_source(
        &self,
        node: &str,
        package: &str,
        call: &SourceCall,
    ) -> Result<Resolution, TemplateError> {
        let key = (call.source.clone(), call.table.clone());
        let candidates = self.sources.get(&key).map(Vec::as_slice).unwrap_or(&[]);

        self.pick(package, candidates)
            .map(Candidate::resolution)
            .map_err(|hint| TemplateError::UnresolvedReference {
                node: node.to_string(),
                reference: call.to_string(),
                hint: Some(match candidates.is_empty() && self.has_source(&call.source) {
                    true => format!("source '{}' has no table '{}'", call.source, call.table),
                    false => hint,
                }),
            })
    }

    fn has_source(&self, source: &str) -> bool {
        self.sources.keys().any(|(name, _)| name == source)
    }

    /// Own package, then root, then a unique match elsewhere
    fn pick<'a>(&self, package: &str, candidates: &'a [Candidate]) -> Result<&'a Candidate, String> {
        if let Some(own) = candidates.iter().find(|c| c.package == package) {
            return Ok(own);
        }
        if let Some(root) = candidates.iter().find(|c| c.package == self.root_package) {
            return Ok(root);
        }

        match candidates {
            [] => Err("no definition with that name in any package".to_string()),
            [only] => Ok(only),
            many => Err(format!(
                "ambiguous: defined in {}; qualify it with a package name",
                packages_of(many)
            )),
        }
    }
}

fn packages_of(candidates: &[Candidate]) -> String {
    let mut packages: Vec<&str> = candidates.iter().map(|c| c.package.as_str()).collect();
    packages.sort_unstable();
    packages.join(", ")
}
