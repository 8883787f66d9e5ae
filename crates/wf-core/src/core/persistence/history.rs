use serde::{Deserialize, Serialize};

use super::*;

/// Typed view of a metadata record. Fields written by other tools survive a
/// read-modify-write cycle through `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub version: Option<String>,
    pub code: Option<String>,
    pub rule: Option<String>,
    pub input: Option<Vec<String>>,
    pub log: Option<Vec<String>>,
    pub params: Option<Vec<String>>,
    pub shellcmd: Option<String>,
    #[serde(default)]
    pub incomplete: bool,
    pub starttime: Option<f64>,
    pub endtime: Option<f64>,
    pub job_hash: Option<i64>,
    pub conda_env: Option<String>,
    pub container_img_url: Option<String>,
    #[serde(default)]
    pub input_checksums: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Record,
}

impl Persistence {
    /// Raw history record for `path`; empty when there is none.
    pub fn metadata(&self, path: &str) -> Result<Record> {
        self.records.read(Subject::Metadata, path)
    }

    /// History record for `path`, or `None` when it is missing or does not
    /// have the expected shape.
    pub fn metadata_record(&self, path: &str) -> Result<Option<MetadataRecord>> {
        let record = self.metadata(path)?;
        if record.is_empty() {
            return Ok(None);
        }
        match serde_json::from_value(Value::Object(record)) {
            Ok(typed) => Ok(Some(typed)),
            Err(err) => {
                debug!(%path, %err, "metadata record does not match the typed view");
                Ok(None)
            }
        }
    }

    pub fn version(&self, path: &str) -> Result<Option<String>> {
        self.text_field(path, "version")
    }

    pub fn rule(&self, path: &str) -> Result<Option<String>> {
        self.text_field(path, "rule")
    }

    pub fn shellcmd(&self, path: &str) -> Result<Option<String>> {
        self.text_field(path, "shellcmd")
    }

    /// Recorded code fingerprint (base64).
    pub fn code(&self, path: &str) -> Result<Option<String>> {
        self.text_field(path, "code")
    }

    pub fn conda_env(&self, path: &str) -> Result<Option<String>> {
        self.text_field(path, "conda_env")
    }

    pub fn container_img_url(&self, path: &str) -> Result<Option<String>> {
        self.text_field(path, "container_img_url")
    }

    pub fn input(&self, path: &str) -> Result<Option<Vec<String>>> {
        self.list_field(path, "input")
    }

    pub fn log(&self, path: &str) -> Result<Option<Vec<String>>> {
        self.list_field(path, "log")
    }

    pub fn params(&self, path: &str) -> Result<Option<Vec<String>>> {
        self.list_field(path, "params")
    }

    /// Checksums recorded for `input_path` across every output of `job`.
    /// Outputs without a recorded checksum contribute `None`.
    pub fn input_checksums(&self, job: &Job, input_path: &str) -> Result<BTreeSet<Option<String>>> {
        let mut checksums = BTreeSet::new();
        for output in &job.output {
            let record = self.metadata(output.id())?;
            let checksum = record
                .get("input_checksums")
                .and_then(|checksums| checksums.get(input_path))
                .and_then(Value::as_str)
                .map(str::to_string);
            checksums.insert(checksum);
        }
        Ok(checksums)
    }

    fn text_field(&self, path: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .metadata(path)?
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn list_field(&self, path: &str, field: &str) -> Result<Option<Vec<String>>> {
        let record = self.metadata(path)?;
        let Some(items) = record.get(field).and_then(Value::as_array) else {
            return Ok(None);
        };
        Ok(Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ))
    }
}
