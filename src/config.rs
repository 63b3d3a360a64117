//! Configuration model for `.launchpad.yaml` pipelines.
//!
//! This module provides the typed model for the pipeline description:
//! stages, jobs and their matrix-expanded variants, output and input
//! descriptors, snap and package lists, package repositories, and the
//! optional license descriptor.
//!
//! Loading happens in two steps: the raw YAML document is first transformed
//! (matrix expansion, plugin-owned key delegation), then each expanded
//! variant is deserialized and validated. All configuration keys are
//! hyphenated on the wire and underscored in the model.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::sync::LazyLock;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::LpciError;
use crate::plugin;

/// Syntax for job names, series names, and architecture names.
static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9+._-]+$").expect("static regex"));

/// Wire keys owned by the job schema itself. Plugin-owned keys are only
/// delegated when they do not collide with these.
const JOB_WIRE_KEYS: &[&str] = &[
    "series",
    "architectures",
    "run-before",
    "run",
    "run-after",
    "environment",
    "output",
    "input",
    "snaps",
    "packages",
    "package-repositories",
    "plugin",
];

/// A string with constrained syntax used as a short identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Result<Self, LpciError> {
        let value = value.into();
        if IDENTIFIER_RE.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(LpciError::Config(format!(
                "'{}' is not a valid identifier (expected {})",
                value,
                IDENTIFIER_RE.as_str()
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<&str> for Identifier {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Identifier::new(value).map_err(de::Error::custom)
    }
}

fn one_or_many_identifiers<'de, D>(deserializer: D) -> Result<Vec<Identifier>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OneOrMany;

    impl<'de> Visitor<'de> for OneOrMany {
        type Value = Vec<Identifier>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("an identifier or a list of identifiers")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![Identifier::new(v).map_err(de::Error::custom)?])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut values = Vec::new();
            while let Some(value) = seq.next_element::<Identifier>()? {
                values.push(value);
            }
            Ok(values)
        }
    }

    deserializer.deserialize_any(OneOrMany)
}

/// A snap to install into the job's environment before anything else runs.
///
/// The short form `- <name>` is deprecated; it maps to classic confinement
/// on the `latest/stable` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snap {
    pub name: String,
    pub channel: String,
    pub classic: bool,
}

fn default_snap_channel() -> String {
    "latest/stable".to_string()
}

impl<'de> Deserialize<'de> for Snap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SnapVisitor;

        impl<'de> Visitor<'de> for SnapVisitor {
            type Value = Snap;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a snap name or a map with 'name', 'channel', 'classic'")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                warn!(
                    "the snap short form '{}' is deprecated; use \
                    '{{name: {}, channel: latest/stable, classic: true}}' instead",
                    v, v
                );
                Ok(Snap {
                    name: v.to_string(),
                    channel: default_snap_channel(),
                    classic: true,
                })
            }

            fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                #[derive(Deserialize)]
                #[serde(deny_unknown_fields)]
                struct SnapRecord {
                    name: String,
                    #[serde(default = "default_snap_channel")]
                    channel: String,
                    #[serde(default)]
                    classic: bool,
                }

                let record =
                    SnapRecord::deserialize(de::value::MapAccessDeserializer::new(map))?;
                Ok(Snap {
                    name: record.name,
                    channel: record.channel,
                    classic: record.classic,
                })
            }
        }

        deserializer.deserialize_any(SnapVisitor)
    }
}

/// Valid values for `output.distribute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputDistribute {
    Artifactory,
}

/// A non-negative retention duration, accepted as seconds or as
/// `[days d?ays, ]H:MM:SS` text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expires(pub Duration);

static EXPIRES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<sign>-)?(?:(?P<days>\d+)\s*days?,\s*)?(?P<hours>\d+):(?P<minutes>\d{1,2}):(?P<seconds>\d{1,2})$")
        .expect("static regex")
});

impl<'de> Deserialize<'de> for Expires {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ExpiresVisitor;

        impl Visitor<'_> for ExpiresVisitor {
            type Value = Expires;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a duration in seconds or 'H:MM:SS' form")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v < 0 {
                    return Err(de::Error::custom("non-negative duration expected"));
                }
                Ok(Expires(Duration::from_secs(v as u64)))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Expires(Duration::from_secs(v)))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v < 0.0 {
                    return Err(de::Error::custom("non-negative duration expected"));
                }
                Ok(Expires(Duration::from_secs_f64(v)))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let captures = EXPIRES_RE
                    .captures(v.trim())
                    .ok_or_else(|| de::Error::custom(format!("invalid duration: '{}'", v)))?;
                if captures.name("sign").is_some() {
                    return Err(de::Error::custom("non-negative duration expected"));
                }
                let field = |name: &str| -> u64 {
                    captures
                        .name(name)
                        .map(|m| m.as_str().parse().unwrap_or(0))
                        .unwrap_or(0)
                };
                let seconds = field("days") * 86_400
                    + field("hours") * 3_600
                    + field("minutes") * 60
                    + field("seconds");
                Ok(Expires(Duration::from_secs(seconds)))
            }
        }

        deserializer.deserialize_any(ExpiresVisitor)
    }
}

/// Job output properties: which files to extract and which provenance
/// properties to record alongside them.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Output {
    /// Shell-glob patterns, matched against the parent of the build tree
    /// but anchored back into the build tree for the copy.
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    #[serde(default)]
    pub distribute: Option<OutputDistribute>,
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
    /// Path, relative to the build tree, of a `.env`-style file whose
    /// entries override `properties`.
    #[serde(default)]
    pub dynamic_properties: Option<Utf8PathBuf>,
    #[serde(default)]
    pub expires: Option<Expires>,
}

/// Input descriptor: artifacts of an earlier job in the same run, pushed
/// into this job's build tree before its commands execute.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Input {
    pub job_name: String,
    /// Target directory relative to the build tree; must stay inside it
    /// after symlink resolution.
    pub target_directory: Utf8PathBuf,
}

/// License descriptor, written under the `license` key of every job's
/// properties file. Exactly one of `spdx` and `path` must be set.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct License {
    #[serde(default)]
    pub spdx: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl License {
    fn validate(&self) -> Result<(), LpciError> {
        match (&self.spdx, &self.path) {
            (Some(_), Some(_)) => Err(LpciError::Config(
                "license: set either 'spdx' or 'path', not both".to_string(),
            )),
            (None, None) => Err(LpciError::Config(
                "license: either 'spdx' or 'path' is required".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Recognized package-repository types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RepositoryType {
    Apt,
}

/// Archive formats a repository line can be rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
pub enum RepositoryFormat {
    #[serde(rename = "deb")]
    #[strum(serialize = "deb")]
    Deb,
    #[serde(rename = "deb-src")]
    #[strum(serialize = "deb-src")]
    DebSrc,
}

fn default_repository_formats() -> Vec<RepositoryFormat> {
    vec![RepositoryFormat::Deb]
}

/// Conventional host for PPA short forms.
const PPA_BASE_URL: &str = "https://ppa.launchpadcontent.net";

/// An APT package repository, rendered to `sources.list` lines before
/// `apt update` runs inside the environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PackageRepository {
    #[serde(rename = "type")]
    pub repository_type: RepositoryType,
    #[serde(default = "default_repository_formats")]
    pub formats: Vec<RepositoryFormat>,
    #[serde(default)]
    pub components: Option<Vec<String>>,
    /// Distroseries names; defaults to the enclosing job's series.
    #[serde(default)]
    pub suites: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Short form `owner/archive` or `owner/distribution/archive`.
    #[serde(default)]
    pub ppa: Option<String>,
    #[serde(default)]
    pub trusted: Option<bool>,
}

impl PackageRepository {
    /// Validates the url/ppa pairing and fills in defaults that depend on
    /// the enclosing job: an omitted `suites` becomes `[<series>]`, and a
    /// PPA synthesizes its URL and forces `components` to `[main]`.
    fn validate_and_infer(&mut self, series: &Identifier) -> Result<(), LpciError> {
        match (&self.url, &self.ppa) {
            (Some(_), Some(_)) => {
                return Err(LpciError::Config(
                    "package repository: set either 'url' or 'ppa', not both".to_string(),
                ));
            }
            (None, None) => {
                return Err(LpciError::Config(
                    "package repository: one of 'url' or 'ppa' is required".to_string(),
                ));
            }
            (Some(_), None) => {
                if self.components.as_ref().is_none_or(|c| c.is_empty()) {
                    return Err(LpciError::Config(
                        "package repository: 'components' is required with 'url'".to_string(),
                    ));
                }
            }
            (None, Some(ppa)) => {
                if self.components.is_some() {
                    return Err(LpciError::Config(
                        "package repository: 'components' is not allowed with 'ppa', \
                        which implies the 'main' component"
                            .to_string(),
                    ));
                }
                let segments: Vec<&str> = ppa.split('/').collect();
                let (owner, distribution, archive) = match segments.as_slice() {
                    [owner, archive] => (*owner, "ubuntu", *archive),
                    [owner, distribution, archive] => (*owner, *distribution, *archive),
                    _ => {
                        return Err(LpciError::Config(format!(
                            "invalid PPA short form: '{}'",
                            ppa
                        )));
                    }
                };
                for segment in [owner, distribution, archive] {
                    if !IDENTIFIER_RE.is_match(segment) {
                        return Err(LpciError::Config(format!(
                            "invalid PPA short form: '{}'",
                            ppa
                        )));
                    }
                }
                self.url = Some(format!("{}/{}/{}/{}", PPA_BASE_URL, owner, archive, distribution));
                self.components = Some(vec!["main".to_string()]);
            }
        }

        if self.suites.is_empty() {
            self.suites = vec![series.as_str().to_string()];
        }
        Ok(())
    }

    /// Renders one `sources.list` line per (format, suite) pair.
    pub fn sources_lines(&self) -> Vec<String> {
        let url = self.url.as_deref().unwrap_or_default();
        let components = self
            .components
            .as_deref()
            .unwrap_or_default()
            .join(" ");
        let trusted = match self.trusted {
            Some(true) => " [trusted=yes]",
            Some(false) => " [trusted=no]",
            None => "",
        };
        let mut lines = Vec::new();
        for format in &self.formats {
            for suite in &self.suites {
                lines.push(format!("{}{} {} {} {}", format, trusted, url, suite, components));
            }
        }
        lines
    }
}

/// A job variant: one concrete `(series, architectures, …)` realization
/// after matrix expansion.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Job {
    pub series: Identifier,
    #[serde(deserialize_with = "one_or_many_identifiers")]
    pub architectures: Vec<Identifier>,
    #[serde(default)]
    pub run_before: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub run_after: Option<String>,
    /// Extra environment for the job's commands; a null value deletes the
    /// variable from whatever the plugin contributed.
    #[serde(default)]
    pub environment: Option<BTreeMap<String, Option<String>>>,
    #[serde(default)]
    pub output: Option<Output>,
    #[serde(default)]
    pub input: Option<Input>,
    #[serde(default)]
    pub snaps: Option<Vec<Snap>>,
    #[serde(default)]
    pub packages: Option<Vec<String>>,
    #[serde(default)]
    pub package_repositories: Option<Vec<PackageRepository>>,
    pub plugin: Option<String>,
    /// Keys owned by the selected plugin, moved here before job
    /// deserialization and parsed by the plugin's own schema.
    #[serde(skip)]
    pub plugin_config: Mapping,
}

impl Job {
    fn validate(&mut self) -> Result<(), LpciError> {
        if self.architectures.is_empty() {
            return Err(LpciError::Config(format!(
                "job for series '{}' declares no architectures",
                self.series
            )));
        }
        if let Some(plugin_name) = &self.plugin {
            plugin::validate_plugin_config(plugin_name, &self.plugin_config)?;
        }
        if let Some(repositories) = &mut self.package_repositories {
            for repository in repositories {
                repository.validate_and_infer(&self.series)?;
            }
        }
        Ok(())
    }
}

/// A `.launchpad.yaml` configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ordered stages; each stage is an ordered list of job names.
    pub pipeline: Vec<Vec<Identifier>>,
    /// Job name to its matrix-expanded variants, in declaration order.
    pub jobs: BTreeMap<String, Vec<Job>>,
    pub license: Option<License>,
}

impl Config {
    /// Load config from the indicated file name.
    ///
    /// The path must resolve inside the current project directory; this is
    /// checked before the file is read.
    pub fn load(path: &Utf8Path) -> Result<Config, LpciError> {
        let project_dir = env::current_dir()
            .map_err(|e| LpciError::io("failed to determine current directory", e))?;
        let project_dir = Utf8PathBuf::from_path_buf(project_dir)
            .map_err(|p| LpciError::Config(format!("project directory is not UTF-8: {:?}", p)))?;
        Self::load_with_project_dir(path, &project_dir)
    }

    /// Like [`Config::load`], with an explicit project directory.
    pub fn load_with_project_dir(
        path: &Utf8Path,
        project_dir: &Utf8Path,
    ) -> Result<Config, LpciError> {
        let resolved = path
            .canonicalize_utf8()
            .map_err(|e| LpciError::io(path.to_string(), e))?;
        let resolved_project_dir = project_dir
            .canonicalize_utf8()
            .map_err(|e| LpciError::io(project_dir.to_string(), e))?;
        if !resolved.starts_with(&resolved_project_dir) {
            return Err(LpciError::Config(format!(
                "'{}' is not in the subpath of '{}'.",
                resolved, resolved_project_dir
            )));
        }
        let content =
            fs::read_to_string(&resolved).map_err(|e| LpciError::io(resolved.to_string(), e))?;
        Self::parse(&content)
    }

    /// Parses and validates a configuration document.
    pub fn parse(content: &str) -> Result<Config, LpciError> {
        let document: Value = serde_yaml::from_str(content)
            .map_err(|e| LpciError::Config(format!("failed to parse YAML: {}", e)))?;
        let Value::Mapping(root) = document else {
            return Err(LpciError::Config("expected a mapping at the top level".to_string()));
        };

        let pipeline = parse_pipeline(root.get(&Value::from("pipeline")))?;
        let jobs = parse_jobs(root.get(&Value::from("jobs")))?;
        let license = match root.get(&Value::from("license")) {
            None | Some(Value::Null) => None,
            Some(value) => {
                let license: License = serde_yaml::from_value(value.clone())
                    .map_err(|e| LpciError::Config(format!("invalid license: {}", e)))?;
                license.validate()?;
                Some(license)
            }
        };

        let config = Config {
            pipeline,
            jobs,
            license,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LpciError> {
        for stage in &self.pipeline {
            for job_name in stage {
                if !self.jobs.contains_key(job_name.as_str()) {
                    return Err(LpciError::Config(format!(
                        "pipeline references undefined job '{}'",
                        job_name
                    )));
                }
            }
        }
        for (job_name, variants) in &self.jobs {
            if variants.is_empty() {
                return Err(LpciError::Config(format!(
                    "job '{}' expands to no variants",
                    job_name
                )));
            }
        }
        Ok(())
    }
}

fn parse_pipeline(value: Option<&Value>) -> Result<Vec<Vec<Identifier>>, LpciError> {
    let Some(Value::Sequence(stages)) = value else {
        return Err(LpciError::Config("'pipeline' must be a list of stages".to_string()));
    };
    let mut pipeline = Vec::with_capacity(stages.len());
    for stage in stages {
        // A bare job name is accepted as a single-job stage.
        let names: Vec<Identifier> = match stage {
            Value::String(name) => vec![Identifier::new(name.as_str())?],
            Value::Sequence(_) => serde_yaml::from_value(stage.clone())
                .map_err(|e| LpciError::Config(format!("invalid pipeline stage: {}", e)))?,
            other => {
                return Err(LpciError::Config(format!(
                    "invalid pipeline stage: expected a job name or a list, got {:?}",
                    other
                )));
            }
        };
        pipeline.push(names);
    }
    Ok(pipeline)
}

fn parse_jobs(value: Option<&Value>) -> Result<BTreeMap<String, Vec<Job>>, LpciError> {
    let Some(Value::Mapping(raw_jobs)) = value else {
        return Err(LpciError::Config("'jobs' must be a mapping of job definitions".to_string()));
    };
    let mut jobs = BTreeMap::new();
    for (name, raw_job) in raw_jobs {
        let Value::String(name) = name else {
            return Err(LpciError::Config(format!("invalid job name: {:?}", name)));
        };
        let Value::Mapping(raw_job) = raw_job else {
            return Err(LpciError::Config(format!(
                "job '{}' must be a mapping",
                name
            )));
        };
        let mut variants = Vec::new();
        for mut raw_variant in expand_job_values(raw_job)? {
            let plugin_config = move_plugin_config_settings(&mut raw_variant)?;
            let mut job: Job = serde_yaml::from_value(Value::Mapping(raw_variant))
                .map_err(|e| LpciError::Config(format!("invalid job '{}': {}", name, e)))?;
            job.plugin_config = plugin_config;
            job.validate()?;
            variants.push(job);
        }
        if variants.is_empty() {
            return Err(LpciError::Config(format!(
                "job '{}' expands to no variants",
                name
            )));
        }
        jobs.insert(name.clone(), variants);
    }
    Ok(jobs)
}

/// Expands a raw job entry into one mapping per variant.
///
/// A `matrix` key produces one variant per matrix item, each item's keys
/// overriding the parent's; without `matrix`, the entry is exactly one
/// variant. Expansion is idempotent: expanded entries carry no `matrix`
/// key, so expanding again yields the same result.
fn expand_job_values(values: &Mapping) -> Result<Vec<Mapping>, LpciError> {
    let matrix_key = Value::from("matrix");
    let Some(matrix) = values.get(&matrix_key) else {
        return Ok(vec![values.clone()]);
    };
    let Value::Sequence(entries) = matrix else {
        return Err(LpciError::Config("'matrix' must be a list of mappings".to_string()));
    };

    let mut base = values.clone();
    base.remove(&matrix_key);

    let mut expanded = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Mapping(entry) = entry else {
            return Err(LpciError::Config("'matrix' entries must be mappings".to_string()));
        };
        let mut variant = base.clone();
        for (key, value) in entry {
            variant.insert(key.clone(), value.clone());
        }
        expanded.push(variant);
    }
    Ok(expanded)
}

/// Moves plugin-owned keys out of a raw job mapping.
///
/// If the job selects a plugin, any key declared by that plugin's config
/// schema and not owned by the job schema itself is removed from the job
/// and collected for the plugin to parse. Unknown plugins are a fatal
/// configuration error.
fn move_plugin_config_settings(variant: &mut Mapping) -> Result<Mapping, LpciError> {
    let mut moved = Mapping::new();
    let plugin_name = match variant.get(&Value::from("plugin")) {
        Some(Value::String(name)) => name.clone(),
        _ => return Ok(moved),
    };
    let Some(keys) = plugin::plugin_config_keys(&plugin_name) else {
        return Err(LpciError::UnknownPlugin(plugin_name));
    };
    for key in keys {
        if JOB_WIRE_KEYS.contains(key) {
            continue;
        }
        let key_value = Value::from(*key);
        if let Some(value) = variant.remove(&key_value) {
            moved.insert(key_value, value);
        }
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_job(series: &str) -> String {
        format!("{{series: {}, architectures: amd64, run: tox}}", series)
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::parse(&format!(
            "pipeline: [test]\njobs: {{test: {}}}\n",
            minimal_job("focal")
        ))
        .unwrap();
        assert_eq!(config.pipeline, vec![vec![Identifier::new("test").unwrap()]]);
        let variants = &config.jobs["test"];
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].series, "focal");
        assert_eq!(variants[0].architectures, vec![Identifier::new("amd64").unwrap()]);
        assert_eq!(variants[0].run.as_deref(), Some("tox"));
        assert!(config.license.is_none());
    }

    #[test]
    fn test_pipeline_accepts_bare_and_grouped_stages() {
        let config = Config::parse(&format!(
            "pipeline:\n- [lint, test]\n- build\njobs:\n  lint: {j}\n  test: {j}\n  build: {j}\n",
            j = minimal_job("focal")
        ))
        .unwrap();
        assert_eq!(config.pipeline.len(), 2);
        assert_eq!(config.pipeline[0].len(), 2);
        assert_eq!(config.pipeline[1].len(), 1);
    }

    #[test]
    fn test_pipeline_rejects_undefined_job() {
        let err = Config::parse(&format!(
            "pipeline: [missing]\njobs: {{test: {}}}\n",
            minimal_job("focal")
        ))
        .unwrap_err();
        assert!(err.to_string().contains("undefined job 'missing'"));
    }

    #[test]
    fn test_matrix_expands_to_one_variant_per_item() {
        let config = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    matrix:\n",
                "      - series: bionic\n",
                "        architectures: amd64\n",
                "      - series: focal\n",
                "        architectures: [amd64, s390x]\n",
                "    run: tox\n",
            ),
        )
        .unwrap();
        let variants = &config.jobs["test"];
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].series, "bionic");
        assert_eq!(variants[0].architectures.len(), 1);
        assert_eq!(variants[1].series, "focal");
        assert_eq!(variants[1].architectures.len(), 2);
        assert_eq!(variants[0].run.as_deref(), Some("tox"));
        assert_eq!(variants[1].run.as_deref(), Some("tox"));
    }

    #[test]
    fn test_matrix_expansion_is_idempotent() {
        let raw: Mapping = serde_yaml::from_str(
            "series: focal\narchitectures: amd64\nrun: tox\n",
        )
        .unwrap();
        let once = expand_job_values(&raw).unwrap();
        assert_eq!(once.len(), 1);
        let twice = expand_job_values(&once[0]).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_matrix_rejected() {
        let err = Config::parse(
            "pipeline: [test]\njobs:\n  test:\n    matrix: []\n    run: tox\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("expands to no variants"));
    }

    #[test]
    fn test_unknown_job_key_rejected() {
        let err = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    no-such-key: 1\n",
            ),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        let err = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    plugin: nonexistent\n",
            ),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown plugin 'nonexistent'"));
    }

    #[test]
    fn test_plugin_owned_keys_are_delegated() {
        let config = Config::parse(
            concat!(
                "pipeline: [build]\n",
                "jobs:\n",
                "  build:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    plugin: golang\n",
                "    golang-version: \"1.17\"\n",
                "    run: go build ./...\n",
            ),
        )
        .unwrap();
        let job = &config.jobs["build"][0];
        assert_eq!(job.plugin.as_deref(), Some("golang"));
        assert_eq!(
            job.plugin_config.get(&Value::from("golang-version")),
            Some(&Value::from("1.17"))
        );
        // The delegated key never reaches the job schema.
        assert_eq!(job.run.as_deref(), Some("go build ./..."));
    }

    #[test]
    fn test_plugin_and_job_keys_are_disjoint_after_delegation() {
        let config = Config::parse(
            concat!(
                "pipeline: [build]\n",
                "jobs:\n",
                "  build:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    plugin: miniconda\n",
                "    conda-packages: [numpy]\n",
                "    conda-python: 3.9\n",
                "    run: python -m build .\n",
            ),
        )
        .unwrap();
        let job = &config.jobs["build"][0];
        for key in JOB_WIRE_KEYS {
            assert!(
                job.plugin_config.get(&Value::from(*key)).is_none(),
                "job key '{}' must not be delegated",
                key
            );
        }
        assert!(job.plugin_config.get(&Value::from("conda-packages")).is_some());
    }

    #[test]
    fn test_snap_short_form_is_classic_stable() {
        let config = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    snaps: [black]\n",
            ),
        )
        .unwrap();
        let snaps = config.jobs["test"][0].snaps.as_ref().unwrap();
        assert_eq!(
            snaps[0],
            Snap {
                name: "black".to_string(),
                channel: "latest/stable".to_string(),
                classic: true,
            }
        );
    }

    #[test]
    fn test_snap_record_form_defaults() {
        let config = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    snaps:\n",
                "      - name: chromium\n",
                "      - name: firefox\n",
                "        channel: latest/edge\n",
                "        classic: true\n",
            ),
        )
        .unwrap();
        let snaps = config.jobs["test"][0].snaps.as_ref().unwrap();
        assert_eq!(snaps[0].channel, "latest/stable");
        assert!(!snaps[0].classic);
        assert_eq!(snaps[1].channel, "latest/edge");
        assert!(snaps[1].classic);
    }

    #[test]
    fn test_snap_classic_must_be_boolean() {
        let err = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    snaps:\n",
                "      - name: chromium\n",
                "        classic: yes-please\n",
            ),
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid job"));
    }

    #[test]
    fn test_license_both_sources_rejected() {
        let err = Config::parse(&format!(
            "pipeline: [test]\njobs: {{test: {}}}\nlicense: {{spdx: MIT, path: COPYING}}\n",
            minimal_job("focal")
        ))
        .unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn test_license_single_source_accepted() {
        let config = Config::parse(&format!(
            "pipeline: [test]\njobs: {{test: {}}}\nlicense: {{spdx: MIT}}\n",
            minimal_job("focal")
        ))
        .unwrap();
        let license = config.license.unwrap();
        assert_eq!(license.spdx.as_deref(), Some("MIT"));
        assert!(license.path.is_none());
    }

    #[test]
    fn test_expires_negative_rejected() {
        let err = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    output:\n",
                "      expires: \"-1:00:00\"\n",
            ),
        )
        .unwrap_err();
        assert!(err.to_string().contains("non-negative duration expected"));
    }

    #[test]
    fn test_expires_accepts_clock_form() {
        let config = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    output:\n",
                "      expires: \"2 days, 1:30:00\"\n",
            ),
        )
        .unwrap();
        let expires = config.jobs["test"][0].output.as_ref().unwrap().expires.unwrap();
        assert_eq!(expires.0, Duration::from_secs(2 * 86_400 + 5_400));
    }

    #[test]
    fn test_repository_url_requires_components() {
        let err = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    package-repositories:\n",
                "      - type: apt\n",
                "        url: https://example.com/repo\n",
            ),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'components' is required"));
    }

    #[test]
    fn test_repository_url_and_ppa_rejected() {
        let err = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    package-repositories:\n",
                "      - type: apt\n",
                "        url: https://example.com/repo\n",
                "        ppa: launchpad/ppa\n",
            ),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn test_repository_ppa_forbids_components() {
        let err = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    package-repositories:\n",
                "      - type: apt\n",
                "        ppa: launchpad/ppa\n",
                "        components: [main]\n",
            ),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not allowed with 'ppa'"));
    }

    #[test]
    fn test_repository_ppa_synthesizes_url_and_components() {
        let config = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    package-repositories:\n",
                "      - type: apt\n",
                "        ppa: launchpad/ubuntu/ppa\n",
            ),
        )
        .unwrap();
        let repository = &config.jobs["test"][0].package_repositories.as_ref().unwrap()[0];
        assert_eq!(
            repository.url.as_deref(),
            Some("https://ppa.launchpadcontent.net/launchpad/ppa/ubuntu")
        );
        assert_eq!(repository.components.as_deref(), Some(&["main".to_string()][..]));
        assert_eq!(repository.suites, vec!["focal"]);
    }

    #[test]
    fn test_repository_suites_default_to_job_series() {
        let config = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: jammy\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    package-repositories:\n",
                "      - type: apt\n",
                "        formats: [deb, deb-src]\n",
                "        url: https://example.com/repo\n",
                "        components: [main]\n",
            ),
        )
        .unwrap();
        let repository = &config.jobs["test"][0].package_repositories.as_ref().unwrap()[0];
        assert_eq!(repository.suites, vec!["jammy"]);
        let lines = repository.sources_lines();
        assert_eq!(
            lines,
            vec![
                "deb https://example.com/repo jammy main",
                "deb-src https://example.com/repo jammy main",
            ]
        );
    }

    #[test]
    fn test_repository_trusted_rendered_after_format() {
        let config = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    package-repositories:\n",
                "      - type: apt\n",
                "        url: https://example.com/repo\n",
                "        components: [main, universe]\n",
                "        suites: [focal, jammy]\n",
                "        trusted: true\n",
            ),
        )
        .unwrap();
        let repository = &config.jobs["test"][0].package_repositories.as_ref().unwrap()[0];
        assert_eq!(
            repository.sources_lines(),
            vec![
                "deb [trusted=yes] https://example.com/repo focal main universe",
                "deb [trusted=yes] https://example.com/repo jammy main universe",
            ]
        );
    }

    #[test]
    fn test_repository_trusted_no_rendered() {
        let mut repository = PackageRepository {
            repository_type: RepositoryType::Apt,
            formats: default_repository_formats(),
            components: Some(vec!["main".to_string()]),
            suites: vec![],
            url: Some("https://example.com/repo".to_string()),
            ppa: None,
            trusted: Some(false),
        };
        repository
            .validate_and_infer(&Identifier::new("focal").unwrap())
            .unwrap();
        assert_eq!(
            repository.sources_lines(),
            vec!["deb [trusted=no] https://example.com/repo focal main"]
        );
    }

    #[test]
    fn test_environment_null_value_preserved() {
        let config = Config::parse(
            concat!(
                "pipeline: [test]\n",
                "jobs:\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    environment:\n",
                "      KEEP: value\n",
                "      DROP: ~\n",
            ),
        )
        .unwrap();
        let environment = config.jobs["test"][0].environment.as_ref().unwrap();
        assert_eq!(environment["KEEP"].as_deref(), Some("value"));
        assert!(environment["DROP"].is_none());
    }

    #[test]
    fn test_identifier_rejects_invalid_syntax() {
        assert!(Identifier::new("Test").is_err());
        assert!(Identifier::new("-lead").is_err());
        assert!(Identifier::new("x").is_err());
        assert!(Identifier::new("focal").is_ok());
        assert!(Identifier::new("ubuntu-22.04+esm_1").is_ok());
    }

    #[test]
    fn test_input_descriptor_parsed() {
        let config = Config::parse(
            concat!(
                "pipeline: [build, test]\n",
                "jobs:\n",
                "  build:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: make\n",
                "    output: {paths: ['*.whl']}\n",
                "  test:\n",
                "    series: focal\n",
                "    architectures: amd64\n",
                "    run: tox\n",
                "    input: {job-name: build, target-directory: artifacts}\n",
            ),
        )
        .unwrap();
        let input = config.jobs["test"][0].input.as_ref().unwrap();
        assert_eq!(input.job_name, "build");
        assert_eq!(input.target_directory, Utf8PathBuf::from("artifacts"));
    }
}
