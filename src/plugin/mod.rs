//! Plugin registry and hook aggregation.
//!
//! Plugins are named contributors of install lists, commands, and
//! environment variables for certain job kinds. The built-in set is closed:
//! a process-wide, immutable name→factory table maps plugin names to
//! constructors, and unknown names are a fatal configuration error.
//!
//! Each plugin implements the fixed hook set via the [`Plugin`] trait. For a
//! given job variant, a [`PluginSet`] assembles the contributors — the
//! selected plugin (if any) ahead of the always-present internal
//! contributor — and aggregates hook results: install lists concatenate,
//! while environment and command hooks are first-contributor-wins.

pub mod builtins;

use std::collections::BTreeMap;

use serde_yaml::Mapping;

use crate::config::{Job, Snap};
use crate::error::LpciError;

/// CLI-provided plugin settings (`--plugin-setting K=V`).
pub type PluginSettings = BTreeMap<String, String>;

/// A named contributor of install steps, commands, and environment.
///
/// The default implementations contribute nothing; each plugin overrides
/// the hooks it participates in. Anything fallible (config parsing, recipe
/// discovery) happens at construction time, so hook methods are
/// infallible.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// When true, the plugin's `execute_run` hook wins over a
    /// user-supplied `run` and interpolates it internally.
    fn interpolates_run_command(&self) -> bool {
        false
    }

    /// APT package names to install; concatenated across contributors.
    fn install_packages(&self) -> Vec<String> {
        Vec::new()
    }

    /// Snaps to install; concatenated across contributors.
    fn install_snaps(&self) -> Vec<Snap> {
        Vec::new()
    }

    /// Environment variables to set; first contributor wins.
    fn set_environment(&self) -> Option<BTreeMap<String, String>> {
        None
    }

    /// Shell fragment run before `run`; first non-empty contributor wins.
    fn execute_before_run(&self) -> Option<String> {
        None
    }

    /// The job's main shell fragment; first non-empty contributor wins.
    fn execute_run(&self) -> Option<String> {
        None
    }

    /// Shell fragment run after `run`; first non-empty contributor wins.
    fn execute_after_run(&self) -> Option<String> {
        None
    }
}

/// The always-registered contributor: surfaces the job's own `packages`
/// and `snaps` through the install hooks, and nothing else.
struct InternalPlugin {
    packages: Vec<String>,
    snaps: Vec<Snap>,
}

impl InternalPlugin {
    fn new(job: &Job) -> Self {
        Self {
            packages: job.packages.clone().unwrap_or_default(),
            snaps: job.snaps.clone().unwrap_or_default(),
        }
    }
}

impl Plugin for InternalPlugin {
    fn name(&self) -> &'static str {
        "internal"
    }

    fn install_packages(&self) -> Vec<String> {
        self.packages.clone()
    }

    fn install_snaps(&self) -> Vec<Snap> {
        self.snaps.clone()
    }
}

/// One registry row: the plugin's name, the wire keys its config schema
/// owns, and its validation and construction entry points.
struct PluginEntry {
    name: &'static str,
    config_keys: &'static [&'static str],
    validate: fn(&Mapping) -> Result<(), LpciError>,
    create: fn(&Job, &PluginSettings) -> Result<Box<dyn Plugin>, LpciError>,
}

/// The closed built-in plugin table, initialized at compile time.
static REGISTRY: &[PluginEntry] = &[
    PluginEntry {
        name: "tox",
        config_keys: &[],
        validate: builtins::validate_empty_config,
        create: |job, _| Ok(Box::new(builtins::ToxPlugin::new(job))),
    },
    PluginEntry {
        name: "pyproject-build",
        config_keys: &[],
        validate: builtins::validate_empty_config,
        create: |job, _| Ok(Box::new(builtins::PyProjectBuildPlugin::new(job))),
    },
    PluginEntry {
        name: "golang",
        config_keys: &["golang-version"],
        validate: builtins::GolangPlugin::validate_config,
        create: |job, _| Ok(Box::new(builtins::GolangPlugin::new(job)?)),
    },
    PluginEntry {
        name: "miniconda",
        config_keys: &["conda-packages", "conda-python", "conda-channels"],
        validate: builtins::MiniCondaPlugin::validate_config,
        create: |job, settings| Ok(Box::new(builtins::MiniCondaPlugin::new(job, settings)?)),
    },
    PluginEntry {
        name: "conda-build",
        config_keys: &[
            "build-target",
            "conda-channels",
            "conda-packages",
            "conda-python",
            "recipe-folder",
        ],
        validate: builtins::CondaBuildPlugin::validate_config,
        create: |job, settings| Ok(Box::new(builtins::CondaBuildPlugin::new(job, settings)?)),
    },
];

fn registry_entry(name: &str) -> Option<&'static PluginEntry> {
    REGISTRY.iter().find(|entry| entry.name == name)
}

/// The wire keys owned by the named plugin's config schema, used by the
/// config loader to delegate keys out of the job mapping. `None` for
/// unknown plugins.
pub fn plugin_config_keys(name: &str) -> Option<&'static [&'static str]> {
    registry_entry(name).map(|entry| entry.config_keys)
}

/// Parses the delegated keys against the named plugin's own schema.
pub fn validate_plugin_config(name: &str, config: &Mapping) -> Result<(), LpciError> {
    let entry = registry_entry(name).ok_or_else(|| LpciError::UnknownPlugin(name.to_string()))?;
    (entry.validate)(config)
}

fn create_plugin(
    name: &str,
    job: &Job,
    settings: &PluginSettings,
) -> Result<Box<dyn Plugin>, LpciError> {
    let entry = registry_entry(name).ok_or_else(|| LpciError::UnknownPlugin(name.to_string()))?;
    (entry.create)(job, settings)
}

/// The ordered hook contributors for one job variant.
pub struct PluginSet {
    /// Selected plugin first (when the job names one), internal last, so
    /// that "first contributor wins" resolves to the plugin.
    contributors: Vec<Box<dyn Plugin>>,
    interpolates_run_command: bool,
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSet")
            .field("contributors", &self.contributors.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("interpolates_run_command", &self.interpolates_run_command)
            .finish()
    }
}

impl PluginSet {
    /// Assembles the contributors for a job variant: the internal
    /// contributor always, plus the selected plugin when the job names
    /// one.
    pub fn for_job(job: &Job, settings: &PluginSettings) -> Result<Self, LpciError> {
        let mut contributors: Vec<Box<dyn Plugin>> = Vec::with_capacity(2);
        let mut interpolates_run_command = false;
        if let Some(name) = &job.plugin {
            let plugin = create_plugin(name, job, settings)?;
            interpolates_run_command = plugin.interpolates_run_command();
            contributors.push(plugin);
        }
        contributors.push(Box::new(InternalPlugin::new(job)));
        Ok(Self {
            contributors,
            interpolates_run_command,
        })
    }

    /// All contributed APT packages, in contributor order.
    pub fn install_packages(&self) -> Vec<String> {
        self.contributors
            .iter()
            .flat_map(|plugin| plugin.install_packages())
            .collect()
    }

    /// All contributed snaps, in contributor order.
    pub fn install_snaps(&self) -> Vec<Snap> {
        self.contributors
            .iter()
            .flat_map(|plugin| plugin.install_snaps())
            .collect()
    }

    /// The first contributed environment, or empty.
    pub fn environment(&self) -> BTreeMap<String, String> {
        self.contributors
            .iter()
            .find_map(|plugin| plugin.set_environment())
            .unwrap_or_default()
    }

    fn resolve(
        &self,
        from_config: Option<&String>,
        hook: impl Fn(&dyn Plugin) -> Option<String>,
    ) -> Option<String> {
        // A user-supplied fragment wins unless the plugin declares that
        // its run hook interpolates it.
        if let Some(command) = from_config
            && !self.interpolates_run_command
        {
            return Some(command.clone());
        }
        self.contributors
            .iter()
            .find_map(|plugin| hook(plugin.as_ref()).filter(|fragment| !fragment.is_empty()))
    }

    /// The effective pre-run command for the job, per the resolution rule.
    pub fn resolve_before_run(&self, job: &Job) -> Option<String> {
        self.resolve(job.run_before.as_ref(), |plugin| plugin.execute_before_run())
    }

    /// The effective run command for the job, per the resolution rule.
    pub fn resolve_run(&self, job: &Job) -> Option<String> {
        self.resolve(job.run.as_ref(), |plugin| plugin.execute_run())
    }

    /// The effective post-run command for the job, per the resolution rule.
    pub fn resolve_after_run(&self, job: &Job) -> Option<String> {
        self.resolve(job.run_after.as_ref(), |plugin| plugin.execute_after_run())
    }
}

/// Parses CLI `K=V` pairs into plugin settings; only the first `=` splits.
pub fn parse_plugin_settings(pairs: &[String]) -> Result<PluginSettings, LpciError> {
    let mut settings = PluginSettings::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(LpciError::command(format!(
                "invalid plugin setting '{}': expected KEY=VALUE",
                pair
            )));
        };
        settings.insert(key.to_string(), value.to_string());
    }
    Ok(settings)
}
