#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use lpci::LpciError;
use lpci::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use lpci::providers::{LaunchedEnvironment, Provider, ProviderInstance};

#[macro_export]
macro_rules! yaml {
    ($content:literal) => {
        $crate::helpers::dedent($content)
    };
}

pub fn dedent(input: &str) -> String {
    let mut lines: Vec<&str> = input.lines().collect();
    while matches!(lines.first(), Some(line) if line.trim().is_empty()) {
        lines.remove(0);
    }
    while matches!(lines.last(), Some(line) if line.trim().is_empty()) {
        lines.pop();
    }

    let min_indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.as_bytes()
                .iter()
                .take_while(|ch| **ch == b' ' || **ch == b'\t')
                .count()
        })
        .min()
        .unwrap_or(0);

    let mut out = String::new();
    for line in lines {
        let trimmed = if line.len() >= min_indent {
            &line[min_indent..]
        } else {
            ""
        };
        out.push_str(trimmed);
        out.push('\n');
    }
    out
}

pub fn exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

/// One recorded interaction with the mock provider or an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Launch {
        series: String,
        architecture: String,
        gpu_nvidia: bool,
    },
    Exec {
        command: Vec<String>,
        cwd: Option<String>,
        env: BTreeMap<String, String>,
    },
    Pull {
        source: PathBuf,
        destination: PathBuf,
    },
    Push {
        source: PathBuf,
        destination: PathBuf,
    },
    PushIo {
        destination: String,
        content: String,
        mode: String,
    },
    Release,
    Clean {
        instances: Vec<String>,
    },
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<Event> {
    log.lock().unwrap().clone()
}

/// The per-command behavior shared by every mock instance of a provider.
#[derive(Clone)]
pub struct MockBehavior {
    /// Exit code for an executed command, by its rendered argv.
    pub exit_code: Arc<dyn Fn(&[String]) -> i32 + Send + Sync>,
    /// Relative paths returned for `find` listings.
    pub find_entries: Vec<PathBuf>,
    /// Contents returned for `cat <path>`.
    pub file_contents: BTreeMap<String, Vec<u8>>,
    /// Overrides for `readlink -f` resolution; identity by default.
    pub resolve_overrides: BTreeMap<String, String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            exit_code: Arc::new(|_| 0),
            find_entries: Vec::new(),
            file_contents: BTreeMap::new(),
            resolve_overrides: BTreeMap::new(),
        }
    }
}

impl MockBehavior {
    pub fn with_exit_code(mut self, f: impl Fn(&[String]) -> i32 + Send + Sync + 'static) -> Self {
        self.exit_code = Arc::new(f);
        self
    }

    pub fn with_find_entries<I: IntoIterator<Item = &'static str>>(mut self, entries: I) -> Self {
        self.find_entries = entries.into_iter().map(PathBuf::from).collect();
        self
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.file_contents.insert(path.to_string(), contents.as_bytes().to_vec());
        self
    }

    pub fn with_resolved(mut self, requested: &str, resolved: &str) -> Self {
        self.resolve_overrides.insert(requested.to_string(), resolved.to_string());
        self
    }
}

/// A recording instance; command output is synthesized from the
/// behavior's tables.
pub struct MockInstance {
    pub name: String,
    pub log: EventLog,
    pub behavior: MockBehavior,
    released: bool,
}

impl MockInstance {
    pub fn new(name: &str, log: EventLog, behavior: MockBehavior) -> Self {
        Self {
            name: name.to_string(),
            log,
            behavior,
            released: false,
        }
    }
}

fn render_command(command: &[OsString]) -> Vec<String> {
    command.iter().map(|part| part.to_string_lossy().into_owned()).collect()
}

impl ProviderInstance for MockInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute_run(
        &self,
        command: &[OsString],
        cwd: Option<&Utf8Path>,
        environment: &BTreeMap<String, String>,
        capture: bool,
    ) -> Result<ExecutionResult, LpciError> {
        let rendered = render_command(command);
        self.log.lock().unwrap().push(Event::Exec {
            command: rendered.clone(),
            cwd: cwd.map(|c| c.to_string()),
            env: environment.clone(),
        });

        let code = (self.behavior.exit_code)(&rendered);
        let stdout = if capture {
            match rendered.first().map(String::as_str) {
                Some("find") => {
                    let mut bytes = Vec::new();
                    for entry in &self.behavior.find_entries {
                        bytes.extend_from_slice(entry.as_os_str().as_encoded_bytes());
                        bytes.push(0);
                    }
                    bytes
                }
                Some("readlink") => {
                    // Like `readlink -f` without symlinks: overrides first,
                    // otherwise lexical normalization.
                    let mut bytes = Vec::new();
                    for path in rendered.iter().skip_while(|part| *part != "--").skip(1) {
                        let resolved = self.behavior.resolve_overrides.get(path).cloned().unwrap_or_else(
                            || {
                                lpci::artifacts::normalize_path(Path::new(path))
                                    .to_string_lossy()
                                    .into_owned()
                            },
                        );
                        bytes.extend_from_slice(resolved.as_bytes());
                        bytes.push(0);
                    }
                    bytes
                }
                Some("cat") => self
                    .behavior
                    .file_contents
                    .get(&rendered[1])
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            }
        } else {
            Vec::new()
        };

        Ok(ExecutionResult {
            status: Some(exit_status(code)),
            stdout,
        })
    }

    fn pull_file(&self, source: &Path, destination: &Path) -> Result<(), LpciError> {
        self.log.lock().unwrap().push(Event::Pull {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        });
        fs::write(destination, b"artifact")
            .map_err(|e| LpciError::Provider(format!("mock pull failed: {}", e)))
    }

    fn push_file(&self, source: &Path, destination: &Path) -> Result<(), LpciError> {
        self.log.lock().unwrap().push(Event::Push {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        });
        Ok(())
    }

    fn push_file_io(
        &self,
        destination: &Utf8Path,
        content: &[u8],
        file_mode: &str,
    ) -> Result<(), LpciError> {
        self.log.lock().unwrap().push(Event::PushIo {
            destination: destination.to_string(),
            content: String::from_utf8_lossy(content).into_owned(),
            mode: file_mode.to_string(),
        });
        Ok(())
    }
}

impl LaunchedEnvironment for MockInstance {
    fn release(&mut self) -> Result<(), LpciError> {
        if !self.released {
            self.released = true;
            self.log.lock().unwrap().push(Event::Release);
        }
        Ok(())
    }
}

/// A recording provider handing out [`MockInstance`]s.
pub struct MockProvider {
    pub log: EventLog,
    pub behavior: MockBehavior,
}

impl MockProvider {
    pub fn new(log: EventLog, behavior: MockBehavior) -> Self {
        Self { log, behavior }
    }
}

impl Provider for MockProvider {
    fn is_available(&self) -> bool {
        true
    }

    fn ensure_available(&self) -> Result<(), LpciError> {
        Ok(())
    }

    fn clean_project_environments(
        &self,
        _project_name: &str,
        _project_path: &Utf8Path,
        instances: &[String],
    ) -> Result<Vec<String>, LpciError> {
        self.log.lock().unwrap().push(Event::Clean {
            instances: instances.to_vec(),
        });
        Ok(instances.to_vec())
    }

    fn launched_environment(
        &self,
        project_name: &str,
        project_path: &Utf8Path,
        series: &str,
        architecture: &str,
        gpu_nvidia: bool,
    ) -> Result<Box<dyn LaunchedEnvironment>, LpciError> {
        self.log.lock().unwrap().push(Event::Launch {
            series: series.to_string(),
            architecture: architecture.to_string(),
            gpu_nvidia,
        });
        let name = self.get_instance_name(project_name, project_path, series, architecture)?;
        Ok(Box::new(MockInstance::new(&name, self.log.clone(), self.behavior.clone())))
    }
}

/// A command executor recording specs and answering from a scripted
/// responder.
pub struct MockExecutor {
    calls: Mutex<Vec<CommandSpec>>,
    responder: Box<dyn Fn(&CommandSpec, usize) -> ExecutionResult + Send + Sync>,
}

impl MockExecutor {
    pub fn new(
        responder: impl Fn(&CommandSpec, usize) -> ExecutionResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_, _| ExecutionResult {
            status: Some(exit_status(0)),
            stdout: Vec::new(),
        })
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// The recorded argv lines, `command arg arg …`, lossily rendered.
    pub fn call_lines(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|spec| {
                let mut line = spec.command.clone();
                for arg in &spec.args {
                    line.push(' ');
                    line.push_str(&arg.to_string_lossy());
                }
                line
            })
            .collect()
    }
}

impl CommandExecutor for MockExecutor {
    fn execute(&self, spec: &CommandSpec) -> anyhow::Result<ExecutionResult> {
        let mut calls = self.calls.lock().unwrap();
        let index = calls.len();
        calls.push(spec.clone());
        drop(calls);
        Ok((self.responder)(spec, index))
    }
}

pub fn ok_with_stdout(stdout: &str) -> ExecutionResult {
    ExecutionResult {
        status: Some(exit_status(0)),
        stdout: stdout.as_bytes().to_vec(),
    }
}

pub fn status_only(code: i32) -> ExecutionResult {
    ExecutionResult {
        status: Some(exit_status(code)),
        stdout: Vec::new(),
    }
}
