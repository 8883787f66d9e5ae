use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::file::FileIdentity;
use crate::params::ParamValue;

/// Executable body of a rule in a canonical, order-preserving form.
///
/// Two bodies are considered the same program iff their instructions, local
/// names, referenced names and constants (including nested bodies) match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleBody {
    pub instructions: Vec<String>,
    pub locals: Vec<String>,
    pub names: Vec<String>,
    pub constants: Vec<BodyConst>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyConst {
    Literal(String),
    Body(RuleBody),
}

impl RuleBody {
    /// A body made of source lines and nothing else.
    pub fn from_source(source: &str) -> Self {
        Self {
            instructions: source.lines().map(ToOwned::to_owned).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_locals<I, S>(mut self, locals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locals = locals.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_const(mut self, constant: BodyConst) -> Self {
        self.constants.push(constant);
        self
    }
}

/// The reusable definition a job instantiates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub version: Option<String>,
    pub body: RuleBody,
}

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            body: RuleBody::default(),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: RuleBody) -> Self {
        self.body = body;
        self
    }
}

/// Handle to an isolated execution environment declared by a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CondaEnv {
    /// Raw environment specification.
    pub content: Vec<u8>,
    /// Hash naming the environment's install directory.
    pub hash: String,
    /// Hash naming the environment's archive directory.
    pub content_hash: String,
}

impl CondaEnv {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        let content_hash = hex::encode(Sha256::digest(&content));
        Self {
            hash: content_hash.clone(),
            content,
            content_hash,
        }
    }
}

/// Stable identity of a job within one invocation: rule name plus the sorted
/// output identities.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey(String);

impl JobKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scheduled unit of work.
#[derive(Clone, Debug)]
pub struct Job {
    pub rule: Arc<Rule>,
    pub output: Vec<Arc<dyn FileIdentity>>,
    pub input: Vec<Arc<dyn FileIdentity>>,
    pub log: Vec<String>,
    pub params: Vec<ParamValue>,
    pub shellcmd: Option<String>,
    pub conda_env: Option<CondaEnv>,
    pub container_img_url: Option<String>,
}

impl Job {
    pub fn new(rule: Arc<Rule>) -> Self {
        Self {
            rule,
            output: Vec::new(),
            input: Vec::new(),
            log: Vec::new(),
            params: Vec::new(),
            shellcmd: None,
            conda_env: None,
            container_img_url: None,
        }
    }

    #[must_use]
    pub fn with_output(mut self, file: impl FileIdentity + 'static) -> Self {
        self.output.push(Arc::new(file));
        self
    }

    #[must_use]
    pub fn with_input(mut self, file: impl FileIdentity + 'static) -> Self {
        self.input.push(Arc::new(file));
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log.push(log.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, param: ParamValue) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn with_shellcmd(mut self, cmd: impl Into<String>) -> Self {
        self.shellcmd = Some(cmd.into());
        self
    }

    #[must_use]
    pub fn with_conda_env(mut self, env: CondaEnv) -> Self {
        self.conda_env = Some(env);
        self
    }

    #[must_use]
    pub fn with_container(mut self, url: impl Into<String>) -> Self {
        self.container_img_url = Some(url.into());
        self
    }

    pub fn key(&self) -> JobKey {
        let mut outputs: Vec<&str> = self.output.iter().map(|f| f.id()).collect();
        outputs.sort_unstable();
        let mut key = self.rule.name.clone();
        for output in outputs {
            key.push('\0');
            key.push_str(output);
        }
        JobKey(key)
    }

    /// Informational identity hash. Collisions are tolerated.
    pub fn job_hash(&self) -> i64 {
        let digest = Sha256::digest(self.key().as_str().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}
