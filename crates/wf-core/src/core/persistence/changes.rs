use std::slice;

use super::*;

/// An aspect of a job whose change since the recorded run can trigger a rerun.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Change {
    Version,
    Code,
    Input,
    Params,
    CondaEnv,
    Container,
}

impl Change {
    pub const ALL: [Self; 6] = [
        Self::Version,
        Self::Code,
        Self::Input,
        Self::Params,
        Self::CondaEnv,
        Self::Container,
    ];

    /// Metadata field holding the recorded value.
    #[must_use]
    pub fn field(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::Code => "code",
            Self::Input => "input",
            Self::Params => "params",
            Self::CondaEnv => "conda_env",
            Self::Container => "container_img_url",
        }
    }
}

impl Persistence {
    /// Whether `file` has a recorded value for `change` that differs from
    /// what `job` would record now. Files without history never count as
    /// changed.
    pub fn changed(&self, change: Change, job: &Job, file: &str) -> Result<bool> {
        let record = self.metadata(file)?;
        let Some(recorded) = record.get(change.field()).filter(|value| !value.is_null()) else {
            return Ok(false);
        };
        Ok(*recorded != self.current_value(change, job))
    }

    /// Outputs of `job` for which `change` applies, evaluated lazily.
    pub fn changed_outputs<'a>(&'a self, change: Change, job: &'a Job) -> ChangedOutputs<'a> {
        ChangedOutputs {
            persistence: self,
            change,
            job,
            outputs: job.output.iter(),
        }
    }

    pub fn version_changed(&self, job: &Job, file: &str) -> Result<bool> {
        self.changed(Change::Version, job, file)
    }

    pub fn code_changed(&self, job: &Job, file: &str) -> Result<bool> {
        self.changed(Change::Code, job, file)
    }

    pub fn input_changed(&self, job: &Job, file: &str) -> Result<bool> {
        self.changed(Change::Input, job, file)
    }

    pub fn params_changed(&self, job: &Job, file: &str) -> Result<bool> {
        self.changed(Change::Params, job, file)
    }

    pub fn conda_env_changed(&self, job: &Job, file: &str) -> Result<bool> {
        self.changed(Change::CondaEnv, job, file)
    }

    pub fn container_changed(&self, job: &Job, file: &str) -> Result<bool> {
        self.changed(Change::Container, job, file)
    }

    fn current_value(&self, change: Change, job: &Job) -> Value {
        match change {
            Change::Version => json!(job.rule.version),
            Change::Code => Value::String(self.fingerprints.code(job)),
            Change::Input => json!(self.fingerprints.input(job)),
            Change::Params => json!(self.fingerprints.params(job)),
            Change::CondaEnv => json!(self.fingerprints.conda_env(job)),
            Change::Container => json!(Fingerprinter::container(job)),
        }
    }
}

/// Lazy iterator over the outputs of a job affected by one kind of change.
#[derive(Debug)]
pub struct ChangedOutputs<'a> {
    persistence: &'a Persistence,
    change: Change,
    job: &'a Job,
    outputs: slice::Iter<'a, Arc<dyn FileIdentity>>,
}

impl<'a> Iterator for ChangedOutputs<'a> {
    type Item = Result<&'a Arc<dyn FileIdentity>>;

    fn next(&mut self) -> Option<Self::Item> {
        for output in self.outputs.by_ref() {
            match self.persistence.changed(self.change, self.job, output.id()) {
                Ok(true) => return Some(Ok(output)),
                Ok(false) => {}
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}
