use walkdir::WalkDir;

use super::*;

/// Incomplete-record paths seen by this invocation.
///
/// Built from one directory walk on first use, then kept in step with this
/// process's own `started`/`finished`/`cleanup` calls. Records written by
/// other processes after the walk are not seen until the snapshot is disabled.
#[derive(Debug, Default)]
pub(crate) enum IncompleteSnapshot {
    #[default]
    Unbuilt,
    Built(HashSet<PathBuf>),
    Disabled,
}

impl IncompleteSnapshot {
    fn note(&mut self, path: PathBuf, present: bool) {
        if let Self::Built(paths) = self {
            if present {
                paths.insert(path);
            } else {
                paths.remove(&path);
            }
        }
    }
}

impl Persistence {
    /// Mark every output of `job` as in progress.
    pub fn started(&self, job: &Job, external_jobid: Option<&str>) -> Result<()> {
        let record = json!({ "external_jobid": external_jobid });
        for output in &job.output {
            self.records.write(Subject::Incomplete, output.id(), &record)?;
            self.note_incomplete(output.id(), true);
        }
        Ok(())
    }

    /// Record history for every output of `job` (unless `keep_metadata` is
    /// false) and drop the in-progress markers.
    pub fn finished(&self, job: &Job, keep_metadata: bool) -> Result<()> {
        if !keep_metadata {
            for output in &job.output {
                self.drop_incomplete(output.id())?;
            }
            return Ok(());
        }

        let fallback_time = timestamp_secs();
        let code = self.fingerprints.code(job);
        let input = self.fingerprints.input(job);
        let log = self.fingerprints.log(job);
        let params = self.fingerprints.params(job);
        let conda_env = self.fingerprints.conda_env(job);
        let input_checksums: BTreeMap<String, String> = job
            .input
            .iter()
            .filter_map(|file| file.checksum().map(|sum| (file.id().to_string(), sum)))
            .collect();

        for output in &job.output {
            let marker = self.records.record_path(Subject::Incomplete, output.id());
            let starttime = match file_modified_secs(&marker) {
                Some(time) => time,
                None => self
                    .metadata(output.id())?
                    .get("starttime")
                    .and_then(Value::as_f64)
                    .unwrap_or(fallback_time),
            };
            let endtime = if output.exists() {
                output.mtime().unwrap_or(fallback_time)
            } else {
                fallback_time
            };
            let record = MetadataRecord {
                version: job.rule.version.clone(),
                code: Some(code.clone()),
                rule: Some(job.rule.name.clone()),
                input: Some(input.clone()),
                log: Some(log.clone()),
                params: Some(params.clone()),
                shellcmd: job.shellcmd.clone(),
                incomplete: false,
                starttime: Some(starttime),
                endtime: Some(endtime),
                job_hash: Some(job.job_hash()),
                conda_env: conda_env.clone(),
                container_img_url: job.container_img_url.clone(),
                input_checksums: input_checksums.clone(),
                extra: Record::new(),
            };
            self.records.write(Subject::Metadata, output.id(), &record)?;
            self.drop_incomplete(output.id())?;
        }
        debug!(rule = %job.rule.name, outputs = job.output.len(), "recorded job history");
        Ok(())
    }

    /// Forget everything recorded for the outputs of `job`.
    pub fn cleanup(&self, job: &Job) -> Result<()> {
        for output in &job.output {
            self.drop_incomplete(output.id())?;
            self.records.delete(Subject::Metadata, output.id())?;
        }
        Ok(())
    }

    /// Whether any existing output of `job` still carries an in-progress
    /// marker, i.e. was left behind by an interrupted run.
    pub fn incomplete(&self, job: &Job) -> Result<bool> {
        let mut snapshot = self.lock_incomplete();
        if matches!(*snapshot, IncompleteSnapshot::Unbuilt) {
            *snapshot = IncompleteSnapshot::Built(self.scan_incomplete()?);
        }
        for output in &job.output {
            if !output.exists() {
                continue;
            }
            let marked = match &*snapshot {
                IncompleteSnapshot::Built(paths) => paths
                    .contains(&self.records.record_path(Subject::Incomplete, output.id())),
                _ => self.records.exists(Subject::Incomplete, output.id()),
            };
            if marked {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// External job ids recorded for the outputs of `job`; outputs without a
    /// marker or id contribute `None`.
    pub fn external_jobids(&self, job: &Job) -> Result<BTreeSet<Option<String>>> {
        let mut ids = BTreeSet::new();
        for output in &job.output {
            let record = self.records.read(Subject::Incomplete, output.id())?;
            ids.insert(
                record
                    .get("external_jobid")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            );
        }
        Ok(ids)
    }

    fn drop_incomplete(&self, id: &str) -> Result<()> {
        self.records.delete(Subject::Incomplete, id)?;
        self.note_incomplete(id, false);
        Ok(())
    }

    fn note_incomplete(&self, id: &str, present: bool) {
        let path = self.records.record_path(Subject::Incomplete, id);
        self.lock_incomplete().note(path, present);
    }

    fn scan_incomplete(&self) -> Result<HashSet<PathBuf>> {
        let root = self.records.subject_root(Subject::Incomplete);
        let mut paths = HashSet::new();
        for entry in WalkDir::new(&root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err)
                    if err
                        .io_error()
                        .is_some_and(|io| io.kind() == ErrorKind::NotFound) =>
                {
                    continue
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to scan {}", root.display()))
                }
            };
            if entry.file_type().is_file() {
                paths.insert(entry.into_path());
            }
        }
        debug!(markers = paths.len(), "cached incomplete markers");
        Ok(paths)
    }
}
