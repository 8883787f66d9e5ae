use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use wf_domain::{BodyConst, Job, JobKey, RuleBody};

use super::params::ParamSerializer;

/// Per-invocation memo of the fingerprints derived from each job.
///
/// Every value is computed at most once per job; jobs are immutable for the
/// lifetime of an invocation, so nothing here is ever invalidated.
#[derive(Debug)]
pub(crate) struct Fingerprinter {
    serializer: Box<dyn ParamSerializer>,
    jobs: Mutex<HashMap<JobKey, Arc<JobFingerprints>>>,
}

#[derive(Debug, Default)]
struct JobFingerprints {
    code: OnceLock<String>,
    input: OnceLock<Vec<String>>,
    log: OnceLock<Vec<String>>,
    params: OnceLock<Vec<String>>,
    conda_env: OnceLock<Option<String>>,
}

impl Fingerprinter {
    pub(crate) fn new(serializer: Box<dyn ParamSerializer>) -> Self {
        Self {
            serializer,
            jobs: Mutex::default(),
        }
    }

    pub(crate) fn code(&self, job: &Job) -> String {
        self.entry(job)
            .code
            .get_or_init(|| encode_rule_body(&job.rule.body))
            .clone()
    }

    /// Sorted resolved input identities.
    pub(crate) fn input(&self, job: &Job) -> Vec<String> {
        self.entry(job)
            .input
            .get_or_init(|| {
                let mut input: Vec<String> = job
                    .input
                    .iter()
                    .map(|file| file.resolved_id().to_string())
                    .collect();
                input.sort();
                input
            })
            .clone()
    }

    pub(crate) fn log(&self, job: &Job) -> Vec<String> {
        self.entry(job)
            .log
            .get_or_init(|| {
                let mut log = job.log.clone();
                log.sort();
                log
            })
            .clone()
    }

    /// Sorted representations of every representable parameter.
    pub(crate) fn params(&self, job: &Job) -> Vec<String> {
        self.entry(job)
            .params
            .get_or_init(|| {
                let mut params: Vec<String> = job
                    .params
                    .iter()
                    .filter_map(|param| self.serializer.serialize(param))
                    .collect();
                params.sort();
                params
            })
            .clone()
    }

    pub(crate) fn conda_env(&self, job: &Job) -> Option<String> {
        self.entry(job)
            .conda_env
            .get_or_init(|| {
                job.conda_env
                    .as_ref()
                    .map(|env| BASE64_STANDARD.encode(&env.content))
            })
            .clone()
    }

    pub(crate) fn container(job: &Job) -> Option<String> {
        job.container_img_url.clone()
    }

    fn entry(&self, job: &Job) -> Arc<JobFingerprints> {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(jobs.entry(job.key()).or_default())
    }
}

/// Base64 of the canonical byte form of a rule body.
pub(crate) fn encode_rule_body(body: &RuleBody) -> String {
    BASE64_STANDARD.encode(body_bytes(body))
}

// Each section is tagged and every string is length-prefixed, so no two
// distinct bodies share an encoding. Nested bodies are encoded first and
// embedded as opaque byte strings.
fn body_bytes(body: &RuleBody) -> Vec<u8> {
    let mut out = Vec::new();
    push_section(&mut out, b'I', body.instructions.iter().map(String::as_bytes));
    push_section(&mut out, b'L', body.locals.iter().map(String::as_bytes));
    push_section(&mut out, b'N', body.names.iter().map(String::as_bytes));
    out.push(b'C');
    push_len(&mut out, body.constants.len());
    for constant in &body.constants {
        match constant {
            BodyConst::Literal(text) => {
                out.push(b'l');
                push_bytes(&mut out, text.as_bytes());
            }
            BodyConst::Body(nested) => {
                out.push(b'b');
                push_bytes(&mut out, &body_bytes(nested));
            }
        }
    }
    out
}

fn push_section<'a>(out: &mut Vec<u8>, tag: u8, items: impl ExactSizeIterator<Item = &'a [u8]>) {
    out.push(tag);
    push_len(out, items.len());
    for item in items {
        push_bytes(out, item);
    }
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    push_len(out, bytes.len());
    out.extend_from_slice(bytes);
}

fn push_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persistence::params::BuiltinParamSerializer;
    use wf_domain::{CondaEnv, LocalFile, ParamValue, Rule};

    fn fingerprinter() -> Fingerprinter {
        Fingerprinter::new(Box::new(BuiltinParamSerializer))
    }

    fn body() -> RuleBody {
        RuleBody::from_source("shell(cmd)\nreturn")
            .with_locals(["cmd"])
            .with_names(["shell"])
            .with_const(BodyConst::Literal("echo".to_string()))
    }

    #[test]
    fn code_is_stable_and_sensitive() {
        let base = encode_rule_body(&body());
        assert_eq!(base, encode_rule_body(&body()));

        let renamed = body().with_locals(["command"]);
        assert_ne!(base, encode_rule_body(&renamed));

        let referenced = body().with_names(["shell", "os"]);
        assert_ne!(base, encode_rule_body(&referenced));

        let edited = RuleBody {
            instructions: vec!["shell(cmd)".to_string(), "return 1".to_string()],
            ..body()
        };
        assert_ne!(base, encode_rule_body(&edited));
    }

    #[test]
    fn nested_body_changes_propagate() {
        let inner = |text: &str| RuleBody::from_source(text);
        let outer = |nested: RuleBody| body().with_const(BodyConst::Body(nested));
        assert_eq!(
            encode_rule_body(&outer(inner("x = 1"))),
            encode_rule_body(&outer(inner("x = 1")))
        );
        assert_ne!(
            encode_rule_body(&outer(inner("x = 1"))),
            encode_rule_body(&outer(inner("x = 2")))
        );
        let deep = |text: &str| outer(RuleBody::default().with_const(BodyConst::Body(inner(text))));
        assert_ne!(encode_rule_body(&deep("a")), encode_rule_body(&deep("b")));
    }

    #[test]
    fn sections_do_not_bleed_into_each_other() {
        let a = RuleBody::default().with_locals(["x"]);
        let b = RuleBody::default().with_names(["x"]);
        assert_ne!(encode_rule_body(&a), encode_rule_body(&b));
        let c = RuleBody::from_source("ab");
        let d = RuleBody::from_source("a\nb");
        assert_ne!(encode_rule_body(&c), encode_rule_body(&d));
    }

    #[test]
    fn job_fingerprints_are_sorted_and_resolved() {
        let job = Job::new(Arc::new(Rule::new("r")))
            .with_output(LocalFile::new("out"))
            .with_input(LocalFile::new("z.txt"))
            .with_input(LocalFile::new("cache/a").from_source_cache("https://host/a.py"))
            .with_log("logs/b.log")
            .with_log("logs/a.log")
            .with_param(ParamValue::Int(2))
            .with_param(ParamValue::from("a"))
            .with_param(ParamValue::Opaque {
                type_name: "Handle".to_string(),
            })
            .with_conda_env(CondaEnv::new("deps: []"));
        let fp = fingerprinter();
        assert_eq!(fp.input(&job), vec!["https://host/a.py", "z.txt"]);
        assert_eq!(fp.log(&job), vec!["logs/a.log", "logs/b.log"]);
        assert_eq!(fp.params(&job), vec!["'a'", "2"]);
        assert_eq!(
            fp.conda_env(&job).as_deref(),
            Some(BASE64_STANDARD.encode("deps: []").as_str())
        );
        assert!(Fingerprinter::container(&job).is_none());
    }

    #[test]
    fn values_are_memoized_per_job() {
        let fp = fingerprinter();
        let first = Job::new(Arc::new(Rule::new("r").with_body(body())))
            .with_output(LocalFile::new("out"));
        let code = fp.code(&first);
        // Same key, different body: the memoized value wins for this invocation.
        let second = Job::new(Arc::new(Rule::new("r"))).with_output(LocalFile::new("out"));
        assert_eq!(fp.code(&second), code);
        let fresh = fingerprinter();
        assert_ne!(fresh.code(&second), code);
    }
}
