use regex::Regex;

use ktail_types::{ContainerSpec, PodSnapshot};

/// Include/exclude patterns applied to pod and container names
///
/// A container passes when any include pattern matches its pod or container
/// name (or there are no include patterns) and no exclude pattern matches.
#[derive(Clone, Debug, Default)]
pub struct ContainerFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl ContainerFilter {
    /// Compile include and exclude patterns
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, regex::Error>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Check if a container should be tailed
    pub fn matches(&self, pod: &PodSnapshot, container: &ContainerSpec) -> bool {
        let hit = |re: &Regex| re.is_match(&pod.name) || re.is_match(&container.name);

        let included = self.include.is_empty() || self.include.iter().any(hit);
        included && !self.exclude.iter().any(hit)
    }

    /// Check if filter is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

fn compile<I>(patterns: I) -> Result<Vec<Regex>, regex::Error>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|p| Regex::new(p.as_ref()))
        .collect()
}
