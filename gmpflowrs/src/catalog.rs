//! Query template catalog: one named template per dashboard panel.
//!
//! Template bodies reference parameters as `{{name}}` and shared fragments as
//! `{{> fragment}}`. Fragments are expanded once, at registration, so every
//! panel filters the event table through the same SQL.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::glob;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{GmpflowError, Result};
use crate::normalize::ResultShape;
use crate::params::ParamKind;

const BUILTIN_FRAGMENTS: &[(&str, &str)] = &[(
    "gmp_events",
    include_str!("../templates/fragments/gmp_events.sql"),
)];

const BUILTIN_TEMPLATES: &[&str] = &[
    include_str!("../templates/overview_kpi.yml"),
    include_str!("../templates/time_series.yml"),
    include_str!("../templates/fee_series.yml"),
    include_str!("../templates/chain_routes.yml"),
    include_str!("../templates/activity_heatmap.yml"),
];

static BUILTIN: OnceCell<Arc<TemplateCatalog>> = OnceCell::new();

/// On-disk / embedded form of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateDef {
    pub id: String,
    pub description: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamKind>,
    pub shape: ResultShape,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Sql(String),
    Param(String),
}

/// A registered, immutable template with fragments expanded and
/// placeholders checked against the declared parameters.
#[derive(Debug, Clone)]
pub struct QueryTemplate {
    id: String,
    description: Option<String>,
    params: BTreeMap<String, ParamKind>,
    shape: ResultShape,
    sql: String,
    segments: Vec<Segment>,
}

impl QueryTemplate {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, ParamKind> {
        &self.params
    }

    pub fn shape(&self) -> &ResultShape {
        &self.shape
    }

    /// SQL body with fragments expanded and placeholders intact.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn compile(def: TemplateDef, fragments: &HashMap<String, String>) -> Result<Self> {
        let err = |msg: String| GmpflowError::Template(format!("template {}: {msg}", def.id));

        if def.id.trim().is_empty() {
            return Err(GmpflowError::Template("template id is empty".to_string()));
        }
        if let ResultShape::PivotSource {
            dimensions,
            measures,
        } = &def.shape
        {
            if dimensions.is_empty() || measures.is_empty() {
                return Err(err(
                    "pivot_source shape needs at least one dimension and one measure".to_string(),
                ));
            }
        }

        let mut expanded = String::with_capacity(def.sql.len());
        for token in tokenize(&def.sql).map_err(&err)? {
            match token {
                Token::Text(text) => expanded.push_str(text),
                Token::Param(name) => {
                    expanded.push_str("{{");
                    expanded.push_str(name);
                    expanded.push_str("}}");
                }
                Token::Include(name) => {
                    let fragment = fragments
                        .get(name)
                        .ok_or_else(|| err(format!("unknown fragment {name}")))?;
                    expanded.push_str(fragment.trim_end());
                }
            }
        }

        let mut segments = Vec::new();
        for token in tokenize(&expanded).map_err(&err)? {
            match token {
                Token::Text(text) => segments.push(Segment::Sql(text.to_string())),
                Token::Param(name) => {
                    if !def.params.contains_key(name) {
                        return Err(err(format!("placeholder {{{{{name}}}}} is not declared")));
                    }
                    segments.push(Segment::Param(name.to_string()));
                }
                Token::Include(name) => {
                    return Err(err(format!("fragment {name} includes another fragment")));
                }
            }
        }

        Ok(Self {
            id: def.id,
            description: def.description,
            params: def.params,
            shape: def.shape,
            sql: expanded,
            segments,
        })
    }
}

enum Token<'a> {
    Text(&'a str),
    Param(&'a str),
    Include(&'a str),
}

fn tokenize(sql: &str) -> std::result::Result<Vec<Token<'_>>, String> {
    let mut tokens = Vec::new();
    let mut rest = sql;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            tokens.push(Token::Text(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| "unterminated placeholder".to_string())?;
        let inner = after[..close].trim();
        let (include, name) = match inner.strip_prefix('>') {
            Some(name) => (true, name.trim()),
            None => (false, inner),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid placeholder name {inner:?}"));
        }
        tokens.push(if include {
            Token::Include(name)
        } else {
            Token::Param(name)
        });
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest));
    }
    Ok(tokens)
}

#[derive(Debug, Default, Clone)]
pub struct TemplateCatalog {
    templates: HashMap<String, QueryTemplate>,
    fragments: HashMap<String, String>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide catalog of dashboard panels, built once on first use.
    pub fn builtin() -> Result<Arc<TemplateCatalog>> {
        BUILTIN
            .get_or_try_init(|| {
                let mut catalog = TemplateCatalog::new();
                for (name, sql) in BUILTIN_FRAGMENTS {
                    catalog.register_fragment(*name, *sql);
                }
                for source in BUILTIN_TEMPLATES {
                    catalog.register_yaml(source)?;
                }
                tracing::debug!(templates = catalog.len(), "built-in template catalog ready");
                Ok(Arc::new(catalog))
            })
            .cloned()
    }

    /// Load `fragments/*.sql` and `*.yml`/`*.yaml` templates from a directory.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            return Err(GmpflowError::Template(format!(
                "templates directory not found: {}",
                root.display()
            )));
        }
        let mut catalog = TemplateCatalog::new();
        for path in glob_files(&root.join("fragments"), "sql")? {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| {
                    GmpflowError::Template(format!("bad fragment file name {}", path.display()))
                })?
                .to_string();
            let sql = fs::read_to_string(&path)?;
            catalog.register_fragment(name, sql);
        }
        for ext in ["yml", "yaml"] {
            for path in glob_files(root, ext)? {
                let contents = fs::read_to_string(&path)?;
                catalog.register_yaml(&contents)?;
                tracing::debug!(path = %path.display(), "loaded template file");
            }
        }
        Ok(catalog)
    }

    /// Fragments must be registered before the templates that include them.
    pub fn register_fragment(&mut self, name: impl Into<String>, sql: impl Into<String>) {
        self.fragments.insert(name.into(), sql.into());
    }

    pub fn register_yaml(&mut self, source: &str) -> Result<()> {
        let def: TemplateDef = serde_yaml::from_str(source)?;
        self.register(def)
    }

    pub fn register(&mut self, def: TemplateDef) -> Result<()> {
        if self.templates.contains_key(&def.id) {
            return Err(GmpflowError::Template(format!(
                "template {} registered twice",
                def.id
            )));
        }
        let template = QueryTemplate::compile(def, &self.fragments)?;
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&QueryTemplate> {
        self.templates
            .get(id)
            .ok_or_else(|| GmpflowError::UnknownTemplate(id.to_string()))
    }

    /// Registered template ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.templates.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn glob_files(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = glob(&format!("{}/*.{ext}", dir.display()))
        .map_err(|e| GmpflowError::Other(e.into()))?
        .flatten()
        .collect();
    paths.sort();
    Ok(paths)
}
