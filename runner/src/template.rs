//! Template root and `$name` substitution for generated job inputs.

use crate::descriptor::Cluster;
use std::{
    collections::BTreeMap,
    fs,
    io,
    iter::Peekable,
    path::{Path, PathBuf},
    str::CharIndices,
};
use thiserror::Error;
use tracing::debug;

/// Placeholder name -> value
pub type TemplateValues = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read template {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Template {path:?}: no value for placeholder `{name}`")]
    MissingValue { path: PathBuf, name: String },
    #[error("Template {path:?}: invalid placeholder at byte {offset}")]
    InvalidPlaceholder { path: PathBuf, offset: usize },
}

/// Location of every template and setup script, injected at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplatePaths {
    root: PathBuf,
}

impl TemplatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Module or conda script of a cluster
    pub fn cluster_script(&self, cluster: Cluster, name: &str) -> PathBuf {
        self.root.join(cluster.name()).join(name)
    }

    /// Cluster independent GPU probe script
    pub fn probe(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn potential(&self) -> PathBuf {
        self.root.join("potential.in")
    }

    pub fn bench_input(&self) -> PathBuf {
        self.root.join("inference").join("bench.in")
    }

    pub fn bench_script(&self) -> PathBuf {
        self.root.join("inference").join("run.sh")
    }

    pub fn properties_submit(&self) -> PathBuf {
        self.root.join("properties").join("submit.sh")
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Malformed {
    Missing(String),
    Invalid(usize),
}

fn identifier(chars: &mut Peekable<CharIndices<'_>>) -> String {
    let mut name = String::new();
    while let Some((_, c)) = chars.next_if(|(_, c)| c.is_ascii_alphanumeric() || *c == '_') {
        name.push(c);
    }
    name
}

fn substitute_str(template: &str, values: &TemplateValues) -> Result<String, Malformed> {
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        if c != '$' {
            rendered.push(c);
            continue;
        }

        let name = match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                rendered.push('$');
                continue;
            }
            Some((_, '{')) => {
                chars.next();
                let name = identifier(&mut chars);
                if chars.next_if(|(_, c)| *c == '}').is_none() {
                    return Err(Malformed::Invalid(offset));
                }
                name
            }
            _ => identifier(&mut chars),
        };

        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(Malformed::Invalid(offset));
        }

        let value = values.get(&name).ok_or(Malformed::Missing(name))?;
        rendered.push_str(value);
    }

    Ok(rendered)
}

/// Replace every `$name` / `${name}` in `template`, `$$` is a literal `$`.
/// Every placeholder must have a value.
pub fn substitute(template: &Path, values: &TemplateValues) -> Result<String, TemplateError> {
    let content = fs::read_to_string(template).map_err(|source| TemplateError::Read {
        path: template.to_path_buf(),
        source,
    })?;

    substitute_str(&content, values).map_err(|malformed| match malformed {
        Malformed::Missing(name) => TemplateError::MissingValue {
            path: template.to_path_buf(),
            name,
        },
        Malformed::Invalid(offset) => TemplateError::InvalidPlaceholder {
            path: template.to_path_buf(),
            offset,
        },
    })
}

/// Render `template` into `out`, creating parent directories
pub fn gen_from_template(
    template: &Path,
    values: &TemplateValues,
    out: &Path,
) -> Result<PathBuf, TemplateError> {
    let rendered = substitute(template, values)?;
    let write_error = |source| TemplateError::Write {
        path: out.to_path_buf(),
        source,
    };

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    fs::write(out, rendered).map_err(write_error)?;
    debug!(template = ?template, out = ?out, "Rendered template");

    Ok(out.to_path_buf())
}

/// Build substitution values from name/value pairs
pub fn values<I, K, V>(pairs: I) -> TemplateValues
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.to_string()))
        .collect()
}
