use std::collections::BTreeSet;

use crate::job::{CondaEnv, Job};

/// Read-only view of the job graph for one invocation.
pub trait JobGraph {
    /// Every job in the graph, whether or not it will run.
    fn jobs(&self) -> Vec<&Job>;

    /// Jobs that still need to run in this invocation.
    fn needrun_jobs(&self) -> Vec<&Job>;

    /// Container image references used anywhere in the graph.
    fn container_img_urls(&self) -> BTreeSet<String> {
        self.jobs()
            .into_iter()
            .filter_map(|job| job.container_img_url.clone())
            .collect()
    }

    /// Environments used anywhere in the graph, deduplicated by content hash.
    fn conda_envs(&self) -> Vec<&CondaEnv> {
        let mut seen = BTreeSet::new();
        self.jobs()
            .into_iter()
            .filter_map(|job| job.conda_env.as_ref())
            .filter(|env| seen.insert(env.content_hash.clone()))
            .collect()
    }
}

/// A fixed list of jobs, all of which need to run unless narrowed.
#[derive(Clone, Debug, Default)]
pub struct StaticGraph {
    jobs: Vec<Job>,
    needrun: Option<BTreeSet<usize>>,
}

impl StaticGraph {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            needrun: None,
        }
    }

    /// Restrict the jobs that need to run to the given positions.
    #[must_use]
    pub fn with_needrun(mut self, positions: impl IntoIterator<Item = usize>) -> Self {
        self.needrun = Some(positions.into_iter().collect());
        self
    }
}

impl JobGraph for StaticGraph {
    fn jobs(&self) -> Vec<&Job> {
        self.jobs.iter().collect()
    }

    fn needrun_jobs(&self) -> Vec<&Job> {
        match &self.needrun {
            None => self.jobs.iter().collect(),
            Some(positions) => self
                .jobs
                .iter()
                .enumerate()
                .filter(|(idx, _)| positions.contains(idx))
                .map(|(_, job)| job)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::LocalFile;
    use crate::job::Rule;
    use std::sync::Arc;

    #[test]
    fn needrun_narrows_jobs() {
        let rule = Arc::new(Rule::new("copy"));
        let graph = StaticGraph::new(vec![
            Job::new(rule.clone()).with_output(LocalFile::new("a")),
            Job::new(rule.clone())
                .with_output(LocalFile::new("b"))
                .with_container("docker://alpine:3"),
        ])
        .with_needrun([1]);
        assert_eq!(graph.jobs().len(), 2);
        let needrun = graph.needrun_jobs();
        assert_eq!(needrun.len(), 1);
        assert_eq!(needrun[0].output[0].id(), "b");
        assert_eq!(
            graph.container_img_urls().into_iter().collect::<Vec<_>>(),
            vec!["docker://alpine:3".to_string()]
        );
    }
}
