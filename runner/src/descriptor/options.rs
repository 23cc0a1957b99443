use super::{BuildError, StageType};
use itertools::Itertools;
use std::{collections::BTreeMap, fmt, path::Path};

/// Scheduler directives by long option name (`time`, `cpus-per-task`, ...)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerOptions(BTreeMap<String, String>);

impl SchedulerOptions {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge extra directives over the preset ones
    pub fn extend<I, K, V>(&mut self, extra: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in extra {
            self.insert(key, value);
        }
    }

    /// Rewrite output paths and the working directory so every array task
    /// writes below `<out>/<index>`
    pub(super) fn make_array(&mut self, stage: StageType, out: &Path, array: &ArrayIndices) {
        let out = out.display();

        self.insert("array", array.to_string());
        self.insert("chdir", format!("{out}/%a"));
        self.insert("output", format!("{out}/%a/{stage}_%A_%a.out"));
        self.insert("error", format!("{out}/%a/{stage}_%A_%a.err"));
    }

    pub fn to_directives(&self) -> Vec<String> {
        self.iter()
            .map(|(key, value)| format!("#SBATCH --{key}={value}"))
            .collect()
    }
}

/// Shell body running `commands` one per line, the first failing line
/// ends the whole body
pub fn command_body(commands: &[String]) -> String {
    let mut body = String::from("set -e\n\n");
    for command in commands {
        body.push_str(command);
        body.push('\n');
    }

    body
}

/// Batch script submitted to the scheduler
pub fn render_script(options: &SchedulerOptions, commands: &[String]) -> String {
    let mut script = String::from("#!/bin/bash\n");

    for directive in options.to_directives() {
        script.push_str(&directive);
        script.push('\n');
    }
    script.push('\n');
    script.push_str(&command_body(commands));

    script
}

/// Sorted, unique, positive task indices of an array job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayIndices(Vec<u32>);

impl ArrayIndices {
    pub fn new(mut indices: Vec<u32>) -> Result<Self, BuildError> {
        indices.sort_unstable();

        if indices.is_empty()
            || indices[0] == 0
            || indices.windows(2).any(|pair| pair[0] == pair[1])
        {
            return Err(BuildError::InvalidArray);
        }

        Ok(Self(indices))
    }

    /// `1..=count`
    pub fn up_to(count: u32) -> Result<Self, BuildError> {
        Self::new((1..=count).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ArrayIndices {
    /// Scheduler range syntax, consecutive runs are compressed: `1-3,5`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runs = self
            .0
            .iter()
            .enumerate()
            .group_by(|(position, index)| **index as usize - *position);

        let rendered = runs
            .into_iter()
            .map(|(_, run)| {
                let run = run.map(|(_, index)| *index).collect_vec();
                match (run.first(), run.last()) {
                    (Some(first), Some(last)) if first != last => format!("{first}-{last}"),
                    (Some(first), _) => first.to_string(),
                    _ => String::new(),
                }
            })
            .join(",");

        f.write_str(&rendered)
    }
}
