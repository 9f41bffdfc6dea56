//! Node selection
//!
//! Grammar:
//!
//! ```text
//! expression := term (whitespace term)*        union
//! term       := item ("," item)*               intersection
//! item       := atom
//!             | "ancestors-of(" expression ")" | "descendants-of(" expression ")"
//! atom       := ["@"] [N "+"] [method ":"] value ["+" N]
//! ```
//!
//! Whitespace and commas inside parentheses belong to the inner expression,
//! so `descendants-of(ancestors-of(c))` and `ancestors-of(a, b)` nest.
//!
//! Methods: `fqn` (default), `tag`, `path`, `package`, `source`,
//! `resource_type`, `test_type`, `test_name`, `config.materialized`, `state`.

use crate::dag::{DependencyGraph, NodeId};
use crate::manifest::{Manifest, ManifestNode, ManifestSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use strata_core::{glob_match, Diagnostic, DiagnosticCode, NodeConfig, ResourceType};

/// Selection error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectionError {
    #[error("Invalid selector '{atom}': {message}")]
    InvalidAtom { atom: String, message: String },

    #[error("Unknown selector method '{0}'")]
    UnknownMethod(String),

    #[error("Invalid value '{value}' for selector method '{method}'")]
    InvalidValue { method: String, value: String },

    #[error("The state: selector requires a previous manifest")]
    StateRequired,
}

/// How many edges a graph operator follows; `None` is unbounded
pub type Depth = Option<usize>;

/// Selector method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Fqn,
    Tag,
    Path,
    Package,
    Source,
    ResourceType,
    TestType,
    TestName,
    Materialized,
    State,
}

impl Method {
    pub fn parse(name: &str) -> Result<Self, SelectionError> {
        match name {
            "fqn" => Ok(Self::Fqn),
            "tag" => Ok(Self::Tag),
            "path" => Ok(Self::Path),
            "package" => Ok(Self::Package),
            "source" => Ok(Self::Source),
            "resource_type" => Ok(Self::ResourceType),
            "test_type" => Ok(Self::TestType),
            "test_name" => Ok(Self::TestName),
            "config.materialized" => Ok(Self::Materialized),
            "state" => Ok(Self::State),
            other => Err(SelectionError::UnknownMethod(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fqn => "fqn",
            Self::Tag => "tag",
            Self::Path => "path",
            Self::Package => "package",
            Self::Source => "source",
            Self::ResourceType => "resource_type",
            Self::TestType => "test_type",
            Self::TestName => "test_name",
            Self::Materialized => "config.materialized",
            Self::State => "state",
        }
    }
}

/// One selector atom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub method: Method,
    pub value: String,

    /// `N+x`: ancestors up to N edges away
    pub parents: Option<Depth>,

    /// `x+N`: descendants up to N edges away
    pub children: Option<Depth>,

    /// `@x`: descendants and all of their ancestors
    pub at: bool,
}

impl Atom {
    /// Parse an atom such as `2+tag:nightly+` or `@orders`
    pub fn parse(input: &str) -> Result<Self, SelectionError> {
        let invalid = |message: &str| SelectionError::InvalidAtom {
            atom: input.to_string(),
            message: message.to_string(),
        };

        if input.contains(['(', ')']) {
            return Err(invalid("unexpected parenthesis"));
        }

        let mut rest = input;

        let at = rest.starts_with('@');
        if at {
            rest = &rest[1..];
        }

        let mut parents = None;
        if let Some(position) = rest.find('+') {
            let prefix = &rest[..position];
            if prefix.chars().all(|c| c.is_ascii_digit()) {
                parents = Some(parse_depth(prefix).map_err(|_| invalid("bad depth"))?);
                rest = &rest[position + 1..];
            }
        }

        let mut children = None;
        if let Some(position) = rest.rfind('+') {
            let suffix = &rest[position + 1..];
            if suffix.chars().all(|c| c.is_ascii_digit()) {
                children = Some(parse_depth(suffix).map_err(|_| invalid("bad depth"))?);
                rest = &rest[..position];
            }
        }

        if rest.is_empty() {
            return Err(invalid("missing value"));
        }
        if at && (parents.is_some() || children.is_some()) {
            return Err(invalid("'@' cannot be combined with '+'"));
        }

        let (method, value) = match rest.split_once(':') {
            Some((method, value)) => (Method::parse(method)?, value),
            None => (Method::Fqn, rest),
        };

        if value.is_empty() {
            return Err(invalid("missing value"));
        }

        Ok(Self {
            method,
            value: value.to_string(),
            parents,
            children,
            at,
        })
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depth = |d: &Depth| d.map(|n| n.to_string()).unwrap_or_default();

        if self.at {
            f.write_str("@")?;
        }
        if let Some(parents) = &self.parents {
            write!(f, "{}+", depth(parents))?;
        }
        if self.method != Method::Fqn {
            write!(f, "{}:", self.method.as_str())?;
        }
        f.write_str(&self.value)?;
        if let Some(children) = &self.children {
            write!(f, "+{}", depth(children))?;
        }
        Ok(())
    }
}

fn function_argument<'a>(input: &'a str, name: &str) -> Option<&'a str> {
    input
        .strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

/// Split at separators outside parentheses, dropping empty pieces
fn split_top_level(input: &str, is_separator: impl Fn(char) -> bool) -> Result<Vec<&str>, SelectionError> {
    let unbalanced = || SelectionError::InvalidAtom {
        atom: input.to_string(),
        message: "unbalanced parentheses".to_string(),
    };

    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or_else(unbalanced)?,
            c if depth == 0 && is_separator(c) => {
                pieces.push(&input[start..index]);
                start = index + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(unbalanced());
    }
    pieces.push(&input[start..]);

    Ok(pieces.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect())
}

fn parse_depth(digits: &str) -> Result<Depth, std::num::ParseIntError> {
    if digits.is_empty() {
        Ok(None)
    } else {
        digits.parse().map(Some)
    }
}

/// One member of an intersection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetExpr {
    Atom(Atom),

    /// `ancestors-of(E)`: the set of `E` plus all of its ancestors
    AncestorsOf(Box<SelectorExpr>),

    /// `descendants-of(E)`: the set of `E` plus all of its descendants
    DescendantsOf(Box<SelectorExpr>),
}

impl SetExpr {
    pub fn parse(input: &str) -> Result<Self, SelectionError> {
        if let Some(inner) = function_argument(input, "ancestors-of") {
            return Ok(Self::AncestorsOf(Box::new(inner_expression(input, inner)?)));
        }
        if let Some(inner) = function_argument(input, "descendants-of") {
            return Ok(Self::DescendantsOf(Box::new(inner_expression(input, inner)?)));
        }
        Atom::parse(input).map(Self::Atom)
    }
}

fn inner_expression(input: &str, inner: &str) -> Result<SelectorExpr, SelectionError> {
    let expr = SelectorExpr::parse(inner)?;
    if expr.is_empty() {
        return Err(SelectionError::InvalidAtom {
            atom: input.to_string(),
            message: "missing value".to_string(),
        });
    }
    Ok(expr)
}

/// Union of intersections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorExpr {
    pub terms: Vec<Vec<SetExpr>>,
}

impl SelectorExpr {
    pub fn parse(input: &str) -> Result<Self, SelectionError> {
        let terms = split_top_level(input, char::is_whitespace)?
            .into_iter()
            .map(|term| {
                split_top_level(term, |c| c == ',')?
                    .into_iter()
                    .map(SetExpr::parse)
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// What to select
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Include expressions; empty selects every node
    pub select: Vec<String>,

    /// Exclude expressions
    pub exclude: Vec<String>,

    /// Keep only these resource types after selection; empty keeps all
    pub resource_types: BTreeSet<ResourceType>,

    /// Skip indirect test selection
    pub no_indirect_tests: bool,
}

impl SelectionCriteria {
    pub fn select(expression: impl Into<String>) -> Self {
        Self {
            select: vec![expression.into()],
            ..Self::default()
        }
    }

    pub fn exclude(mut self, expression: impl Into<String>) -> Self {
        self.exclude.push(expression.into());
        self
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_types.insert(resource_type);
        self
    }
}

/// A node dropped because one of its ancestors is disabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunedNode {
    pub unique_id: String,

    /// Disabled definition that caused the prune
    pub disabled_ancestor: String,

    pub reason: String,
}

impl PrunedNode {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::warn(DiagnosticCode::SelectionPruned, self.reason.clone())
            .with_node(self.unique_id.clone())
            .with_related(vec![self.disabled_ancestor.clone()])
    }
}

/// Result of selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Nodes to schedule, in deterministic topological order
    pub selected: Vec<NodeId>,

    /// Unselected parents of selected nodes; resolved but never executed
    pub referenced_only: Vec<NodeId>,

    pub pruned: Vec<PrunedNode>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.selected.iter().any(|id| id == unique_id)
    }
}

/// Evaluates selector expressions over a manifest
pub struct Selector<'a> {
    manifest: &'a Manifest,
    graph: DependencyGraph,
    previous: Option<&'a Manifest>,
}

impl<'a> Selector<'a> {
    pub fn new(manifest: &'a Manifest) -> Self {
        Self {
            manifest,
            graph: manifest.graph(),
            previous: None,
        }
    }

    /// Compare against a previous manifest for `state:` selectors
    pub fn with_state(mut self, previous: &'a Manifest) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Evaluate a single expression to a node set, with no test or prune handling
    pub fn evaluate(&self, expression: &str) -> Result<BTreeSet<NodeId>, SelectionError> {
        self.evaluate_expr(&SelectorExpr::parse(expression)?)
    }

    fn evaluate_expr(&self, expr: &SelectorExpr) -> Result<BTreeSet<NodeId>, SelectionError> {
        let mut result = BTreeSet::new();

        for term in &expr.terms {
            let mut term_set: Option<BTreeSet<NodeId>> = None;
            for item in term {
                let atom_set = self.evaluate_item(item)?;
                term_set = Some(match term_set {
                    Some(current) => current.intersection(&atom_set).cloned().collect(),
                    None => atom_set,
                });
            }
            result.extend(term_set.unwrap_or_default());
        }

        Ok(result)
    }

    /// Full selection: include, indirect tests, exclusion, pruning
    pub fn select(&self, criteria: &SelectionCriteria) -> Result<Selection, SelectionError> {
        let mut included = if criteria.select.iter().all(|s| s.trim().is_empty()) {
            self.graph.nodes().cloned().collect::<BTreeSet<_>>()
        } else {
            let mut set = BTreeSet::new();
            for expression in &criteria.select {
                set.extend(self.evaluate(expression)?);
            }
            set
        };

        let mut excluded = BTreeSet::new();
        for expression in &criteria.exclude {
            excluded.extend(self.evaluate(expression)?);
        }

        if !criteria.no_indirect_tests {
            let indirect: Vec<NodeId> = self
                .manifest
                .tests()
                .filter(|test| !included.contains(&test.unique_id))
                .filter(|test| {
                    let parents = self.graph.parents(&test.unique_id);
                    !parents.is_empty() && parents.iter().all(|p| included.contains(p))
                })
                .map(|test| test.unique_id.clone())
                .collect();

            tracing::debug!(count = indirect.len(), "Indirectly selected tests");
            included.extend(indirect);
        }

        // Greedy exclusion: tests touching an excluded node go too
        included.retain(|id| {
            if excluded.contains(id) {
                return false;
            }
            let is_test = self.manifest.resource_type(id) == Some(ResourceType::Test);
            !(is_test && self.graph.parents(id).iter().any(|p| excluded.contains(p)))
        });

        included.retain(|id| {
            self.manifest.resource_type(id).is_some_and(|resource| {
                resource != ResourceType::Source
                    && (criteria.resource_types.is_empty() || criteria.resource_types.contains(&resource))
            })
        });

        let pruned = self.prune(&mut included);

        let selected = self
            .graph
            .subgraph(&included)
            .topological_sort()
            .map_err(|error| SelectionError::InvalidAtom {
                atom: error.path.join(" -> "),
                message: "selection contains a cycle".to_string(),
            })?;

        let referenced_only: BTreeSet<NodeId> = selected
            .iter()
            .flat_map(|id| self.graph.parents(id))
            .filter(|parent| !included.contains(*parent))
            .filter(|parent| self.manifest.nodes.contains_key(*parent))
            .cloned()
            .collect();

        tracing::debug!(
            selected = selected.len(),
            referenced_only = referenced_only.len(),
            pruned = pruned.len(),
            "Selection complete"
        );

        Ok(Selection {
            selected,
            referenced_only: referenced_only.into_iter().collect(),
            pruned,
        })
    }

    /// Remove nodes that reference a disabled definition, and their dependents
    fn prune(&self, included: &mut BTreeSet<NodeId>) -> Vec<PrunedNode> {
        let mut pruned: BTreeMap<NodeId, PrunedNode> = BTreeMap::new();

        for id in included.iter() {
            let Some(node) = self.manifest.get_node(id) else { continue };
            let Some(disabled) = node.depends_on.disabled.first() else { continue };

            pruned.entry(id.clone()).or_insert_with(|| PrunedNode {
                unique_id: id.clone(),
                disabled_ancestor: disabled.clone(),
                reason: format!("{} depends on disabled {}", id, disabled),
            });

            for descendant in self.graph.downstream(id, None) {
                if included.contains(&descendant) {
                    pruned.entry(descendant.clone()).or_insert_with(|| PrunedNode {
                        unique_id: descendant.clone(),
                        disabled_ancestor: disabled.clone(),
                        reason: format!("ancestor {} depends on disabled {}", id, disabled),
                    });
                }
            }
        }

        for node in pruned.values() {
            tracing::warn!(node = %node.unique_id, reason = %node.reason, "Pruned from selection");
            included.remove(&node.unique_id);
        }

        pruned.into_values().collect()
    }

    fn evaluate_item(&self, item: &SetExpr) -> Result<BTreeSet<NodeId>, SelectionError> {
        match item {
            SetExpr::Atom(atom) => self.evaluate_atom(atom),
            SetExpr::AncestorsOf(inner) => {
                let mut result = self.evaluate_expr(inner)?;
                let base: Vec<NodeId> = result.iter().cloned().collect();
                for id in &base {
                    result.extend(self.graph.upstream(id, None));
                }
                Ok(result)
            }
            SetExpr::DescendantsOf(inner) => {
                let mut result = self.evaluate_expr(inner)?;
                let base: Vec<NodeId> = result.iter().cloned().collect();
                for id in &base {
                    result.extend(self.graph.downstream(id, None));
                }
                Ok(result)
            }
        }
    }

    fn evaluate_atom(&self, atom: &Atom) -> Result<BTreeSet<NodeId>, SelectionError> {
        let base = self.match_method(atom)?;
        if base.is_empty() {
            tracing::warn!(selector = %atom, "Selector matched no nodes");
        }

        let mut result = base.clone();

        if atom.at {
            for id in &base {
                result.extend(self.graph.downstream(id, None));
            }
            let with_descendants: Vec<NodeId> = result.iter().cloned().collect();
            for id in &with_descendants {
                result.extend(self.graph.upstream(id, None));
            }
            return Ok(result);
        }

        if let Some(depth) = atom.parents {
            for id in &base {
                result.extend(self.graph.upstream(id, depth));
            }
        }
        if let Some(depth) = atom.children {
            for id in &base {
                result.extend(self.graph.downstream(id, depth));
            }
        }

        Ok(result)
    }

    fn match_method(&self, atom: &Atom) -> Result<BTreeSet<NodeId>, SelectionError> {
        let invalid = || SelectionError::InvalidValue {
            method: atom.method.as_str().to_string(),
            value: atom.value.clone(),
        };

        let value = atom.value.as_str();
        let predicate: Box<dyn Fn(&Candidate<'_>) -> bool + '_> = match atom.method {
            Method::Fqn => Box::new(move |c: &Candidate<'_>| c.matches_fqn(value)),
            Method::Tag => Box::new(move |c: &Candidate<'_>| c.config().tags.iter().any(|t| glob_match(value, t))),
            Method::Path => {
                let prefix = value.trim_end_matches('/');
                Box::new(move |c: &Candidate<'_>| {
                    let path = c.path();
                    path == prefix
                        || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
                        || glob_match(value, path)
                })
            }
            Method::Package => Box::new(move |c: &Candidate<'_>| glob_match(value, c.package())),
            Method::Source => {
                let (source, table) = value.split_once('.').unwrap_or((value, "*"));
                Box::new(move |c: &Candidate<'_>| match c {
                    Candidate::Source(s) => glob_match(source, &s.source_name) && glob_match(table, &s.name),
                    Candidate::Node(_) => false,
                })
            }
            Method::ResourceType => {
                let resource = ResourceType::parse(value).ok_or_else(invalid)?;
                Box::new(move |c: &Candidate<'_>| c.resource_type() == resource)
            }
            Method::TestType => {
                if !matches!(value, "schema" | "data") {
                    return Err(invalid());
                }
                Box::new(move |c: &Candidate<'_>| {
                    c.test().is_some_and(|t| t.test_type.as_str() == value)
                })
            }
            Method::TestName => Box::new(move |c: &Candidate<'_>| {
                c.test()
                    .and_then(|t| t.test_name.as_deref())
                    .is_some_and(|name| glob_match(value, name))
            }),
            Method::Materialized => Box::new(move |c: &Candidate<'_>| match c {
                Candidate::Node(n) => n.config.materialized.as_str() == value,
                Candidate::Source(_) => false,
            }),
            Method::State => {
                let previous = self.previous.ok_or(SelectionError::StateRequired)?;
                match value {
                    "new" => Box::new(move |c: &Candidate<'_>| !previous.contains(c.unique_id())),
                    "modified" => Box::new(move |c: &Candidate<'_>| c.is_new_or_modified(previous)),
                    _ => return Err(invalid()),
                }
            }
        };

        Ok(self
            .candidates()
            .filter(|c| predicate(c))
            .map(|c| c.unique_id().to_string())
            .collect())
    }

    fn candidates(&self) -> impl Iterator<Item = Candidate<'a>> + 'a {
        self.manifest
            .nodes
            .values()
            .map(Candidate::Node)
            .chain(self.manifest.sources.values().map(Candidate::Source))
    }
}

/// Uniform view over nodes and sources
enum Candidate<'a> {
    Node(&'a ManifestNode),
    Source(&'a ManifestSource),
}

impl Candidate<'_> {
    fn unique_id(&self) -> &str {
        match self {
            Self::Node(n) => &n.unique_id,
            Self::Source(s) => &s.unique_id,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Node(n) => &n.name,
            Self::Source(s) => &s.name,
        }
    }

    fn fqn(&self) -> &[String] {
        match self {
            Self::Node(n) => &n.fqn,
            Self::Source(s) => &s.fqn,
        }
    }

    fn package(&self) -> &str {
        match self {
            Self::Node(n) => &n.package_name,
            Self::Source(s) => &s.package_name,
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::Node(n) => &n.original_file_path,
            Self::Source(s) => &s.original_file_path,
        }
    }

    fn config(&self) -> &NodeConfig {
        match self {
            Self::Node(n) => &n.config,
            Self::Source(s) => &s.config,
        }
    }

    fn resource_type(&self) -> ResourceType {
        match self {
            Self::Node(n) => n.resource_type,
            Self::Source(_) => ResourceType::Source,
        }
    }

    fn test(&self) -> Option<&strata_project::TestSpec> {
        match self {
            Self::Node(n) => n.test_metadata.as_ref(),
            Self::Source(_) => None,
        }
    }

    /// Name, unique id, or dotted fqn prefix, each part a glob
    fn matches_fqn(&self, value: &str) -> bool {
        if glob_match(value, self.name()) || value == self.unique_id() {
            return true;
        }

        let parts: Vec<&str> = value.split('.').collect();
        let fqn = self.fqn();
        parts.len() > 1
            && parts.len() <= fqn.len()
            && parts.iter().zip(fqn).all(|(pattern, part)| glob_match(pattern, part))
    }

    fn is_new_or_modified(&self, previous: &Manifest) -> bool {
        match self {
            Self::Node(n) => match previous.get_node(&n.unique_id) {
                Some(old) => old.checksum != n.checksum || old.config != n.config,
                None => true,
            },
            Self::Source(s) => match previous.get_source(&s.unique_id) {
                Some(old) => old.relation != s.relation || old.config != s.config,
                None => true,
            },
        }
    }
}
