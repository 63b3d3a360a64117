//! Artifact I/O between a job's instance and the host.
//!
//! Lists, filters, dereferences, and copies files between the container
//! and the host within safety bounds. Every path produced by the container
//! is treated as opaque bytes: file names are not required to be UTF-8.
//!
//! Containment is checked twice per output path: lexically on the raw
//! pattern (for clear error messages), then again after `readlink -f`
//! resolution inside the instance (for correctness against malicious
//! symlinks). The checks operate on paths produced by the container, never
//! on a host-side resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::path::{Component, Path, PathBuf};

use camino::Utf8Path;
use glob::Pattern;
use tracing::debug;

use crate::config::{Input, License, Output};
use crate::error::LpciError;
use crate::providers::ProviderInstance;

/// Finds non-directory entries under `dir` on the instance, relative to
/// `dir`.
///
/// Output is NUL-delimited (`find -printf '%P\0'`) so arbitrary bytes in
/// file names survive the round trip.
pub fn list_files(
    instance: &dyn ProviderInstance,
    dir: &Utf8Path,
) -> Result<Vec<PathBuf>, LpciError> {
    let command: Vec<OsString> = [
        "find",
        dir.as_str(),
        "-mindepth",
        "1",
        "!",
        "-type",
        "d",
        "-printf",
        "%P\\0",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    let result = instance.execute_run(&command, None, &BTreeMap::new(), true)?;
    if !result.success() {
        return Err(LpciError::Provider(format!(
            "failed to list files under {} in instance '{}'",
            dir,
            instance.name()
        )));
    }
    Ok(split_nul_paths(&result.stdout))
}

/// Resolves symlinks in each of `paths` on the instance, like
/// `Path::resolve` but inside the container.
pub fn resolve_symlinks(
    instance: &dyn ProviderInstance,
    paths: &[PathBuf],
) -> Result<Vec<PathBuf>, LpciError> {
    let mut command: Vec<OsString> =
        ["readlink", "-f", "-z", "--"].iter().map(OsString::from).collect();
    command.extend(paths.iter().map(|path| path.as_os_str().to_owned()));
    let result = instance.execute_run(&command, None, &BTreeMap::new(), true)?;
    if !result.success() {
        return Err(LpciError::Provider(format!(
            "failed to resolve symlinks in instance '{}'",
            instance.name()
        )));
    }
    Ok(split_nul_paths(&result.stdout))
}

fn split_nul_paths(stdout: &[u8]) -> Vec<PathBuf> {
    let trimmed = stdout.strip_suffix(b"\0").unwrap_or(stdout);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed
        .split(|byte| *byte == 0)
        .map(|chunk| PathBuf::from(OsString::from_vec(chunk.to_vec())))
        .collect()
}

/// Lexically normalizes a path: collapses `.` and resolves `..` against
/// preceding components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

/// Checks that `path` does not escape `container`, returning the relative
/// remainder.
///
/// Any symlinks in `path` must already have been resolved within the
/// context of the container.
pub fn check_relative_path(path: &Path, container: &Path) -> Result<PathBuf, LpciError> {
    path.strip_prefix(container)
        .map(Path::to_path_buf)
        .map_err(|_| LpciError::PathEscape {
            path: path.display().to_string(),
            container: container.display().to_string(),
        })
}

/// Removes `prefix` from `path` if possible.
///
/// Output paths normally live in the build tree but may escape to its
/// parent (and no further). Paths within the build tree stay relative to
/// the build tree, preserving subdirectory structure; paths in the parent
/// stay relative to the parent.
fn remove_prefix_if_possible(path: &Path, prefix: &str) -> PathBuf {
    path.strip_prefix(prefix).map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
}

/// `os.path`-style relative path from `base` (a single component) to
/// `path`; both are relative to the same parent directory.
fn relative_to_sibling(path: &Path, base: &str) -> PathBuf {
    match path.strip_prefix(base) {
        Ok(stripped) => stripped.to_path_buf(),
        Err(_) => Path::new("..").join(path),
    }
}

/// Copies designated output paths from a completed job into
/// `<target_path>/files/`.
pub fn copy_output_paths(
    output: &Output,
    remote_cwd: &Utf8Path,
    instance: &dyn ProviderInstance,
    target_path: &Utf8Path,
) -> Result<(), LpciError> {
    let Some(patterns) = &output.paths else {
        return Ok(());
    };

    let remote_cwd_path = remote_cwd.as_std_path();
    let remote_parent = remote_cwd_path.parent().unwrap_or(Path::new("/"));
    let remote_name = remote_cwd.file_name().unwrap_or_default();

    // Checking whole patterns first produces clearer error messages than
    // only checking individual glob expansions.
    for pattern in patterns {
        let candidate = normalize_path(&remote_cwd_path.join(pattern));
        check_relative_path(&candidate, remote_parent)?;
    }

    // The parent of the build tree is listed so patterns may legitimately
    // reference it; the patterns themselves stay relative to the build
    // tree.
    let mut remote_paths = list_files(instance, Utf8Path::from_path(remote_parent).unwrap_or(remote_cwd))?;
    remote_paths.sort();

    let mut filtered: BTreeSet<PathBuf> = BTreeSet::new();
    for pattern in patterns {
        let matcher = Pattern::new(pattern)
            .map_err(|e| LpciError::Config(format!("invalid output path pattern '{}': {}", pattern, e)))?;
        let mut matched_any = false;
        for path in &remote_paths {
            let anchored = relative_to_sibling(path, remote_name);
            if matcher.matches(&anchored.to_string_lossy()) {
                filtered.insert(anchored);
                matched_any = true;
            }
        }
        if !matched_any {
            return Err(LpciError::NoMatchingFiles {
                pattern: pattern.clone(),
            });
        }
    }

    let absolute: Vec<PathBuf> =
        filtered.iter().map(|path| remote_cwd_path.join(path)).collect();
    let mut resolved = resolve_symlinks(instance, &absolute)?;
    resolved.sort();

    let output_files = target_path.join("files");
    for path in resolved {
        let relative = check_relative_path(&path, remote_parent)?;
        let relative = remove_prefix_if_possible(&relative, remote_name);
        let destination = output_files.as_std_path().join(&relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LpciError::io(parent.display().to_string(), e))?;
        }
        debug!("copying {} from instance '{}'", path.display(), instance.name());
        instance
            .pull_file(&path, &destination)
            .map_err(|e| LpciError::command(e.to_string()))?;
    }
    Ok(())
}

/// Pushes a prior job's artifacts into this job's build tree.
///
/// `source_path` is the prior job's host-side output directory (the one
/// containing `files/` and `properties`). The target directory is
/// resolved inside the instance and must stay within the build tree.
pub fn copy_input_paths(
    input: &Input,
    remote_cwd: &Utf8Path,
    instance: &dyn ProviderInstance,
    source_path: &Utf8Path,
) -> Result<(), LpciError> {
    let requested = remote_cwd.join(&input.target_directory);
    let resolved = resolve_symlinks(instance, &[requested.as_std_path().to_path_buf()])?;
    let [resolved] = resolved.as_slice() else {
        return Err(LpciError::Provider("unexpected readlink output".to_string()));
    };
    check_relative_path(resolved, remote_cwd.as_std_path())?;

    let target = Utf8Path::from_path(resolved).ok_or_else(|| {
        LpciError::Config(format!(
            "input target directory resolves to a non-UTF-8 path: {}",
            resolved.display()
        ))
    })?;
    let target_files = target.join("files");
    instance_mkdir(instance, target_files.as_std_path())?;

    let source_files = source_path.join("files");
    let mut entries = Vec::new();
    collect_files(source_files.as_std_path(), Path::new(""), &mut entries)?;
    for relative in entries {
        let destination = target_files.as_std_path().join(&relative);
        if let Some(parent) = destination.parent() {
            instance_mkdir(instance, parent)?;
        }
        instance.push_file(&source_files.as_std_path().join(&relative), &destination)?;
    }

    let properties = source_path.join("properties");
    if properties.is_file() {
        instance.push_file(properties.as_std_path(), &target.join("properties").into_std_path_buf())?;
    }
    Ok(())
}

fn instance_mkdir(instance: &dyn ProviderInstance, dir: &Path) -> Result<(), LpciError> {
    let command: Vec<OsString> = [OsString::from("mkdir"), OsString::from("-p"), dir.as_os_str().to_owned()].into();
    let result = instance.execute_run(&command, None, &BTreeMap::new(), true)?;
    if !result.success() {
        return Err(LpciError::Provider(format!(
            "failed to create directory {} in instance '{}'",
            dir.display(),
            instance.name()
        )));
    }
    Ok(())
}

fn collect_files(root: &Path, relative: &Path, entries: &mut Vec<PathBuf>) -> Result<(), LpciError> {
    let dir = root.join(relative);
    let read = match fs::read_dir(&dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && relative.as_os_str().is_empty() => {
            return Ok(());
        }
        Err(e) => return Err(LpciError::io(dir.display().to_string(), e)),
    };
    let mut children: Vec<_> = read
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LpciError::io(dir.display().to_string(), e))?;
    children.sort_by_key(|entry| entry.file_name());
    for child in children {
        let child_relative = relative.join(child.file_name());
        let file_type =
            child.file_type().map_err(|e| LpciError::io(dir.display().to_string(), e))?;
        if file_type.is_dir() {
            collect_files(root, &child_relative, entries)?;
        } else {
            entries.push(child_relative);
        }
    }
    Ok(())
}

/// Parses `.env`-style content: `KEY=VALUE` sets a key, a bare `KEY`
/// signals removal. Blank lines and `#` comments are ignored.
fn parse_dotenv(content: &str) -> Vec<(String, Option<String>)> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        match line.split_once('=') {
            Some((key, value)) => {
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                    .unwrap_or(value);
                entries.push((key.trim().to_string(), Some(value.to_string())));
            }
            None => entries.push((line.to_string(), None)),
        }
    }
    entries
}

/// Writes the job's properties file: static properties, overridden by
/// dynamic `.env` entries, with `license` as the final overwrite.
pub fn copy_output_properties(
    output: &Output,
    license: Option<&License>,
    remote_cwd: &Utf8Path,
    instance: &dyn ProviderInstance,
    target_path: &Utf8Path,
) -> Result<(), LpciError> {
    let mut properties: BTreeMap<String, serde_json::Value> =
        output.properties.clone().unwrap_or_default();

    if let Some(dynamic_path) = &output.dynamic_properties {
        let requested = remote_cwd.join(dynamic_path);
        let resolved = resolve_symlinks(instance, &[requested.as_std_path().to_path_buf()])?;
        let [resolved] = &resolved[..] else {
            return Err(LpciError::Provider("unexpected readlink output".to_string()));
        };
        check_relative_path(resolved, remote_cwd.as_std_path())?;

        let command: Vec<OsString> =
            [OsString::from("cat"), resolved.as_os_str().to_owned()].into();
        let result = instance.execute_run(&command, None, &BTreeMap::new(), true)?;
        if !result.success() {
            return Err(LpciError::Provider(format!(
                "failed to read dynamic properties {} in instance '{}'",
                resolved.display(),
                instance.name()
            )));
        }
        for (key, value) in parse_dotenv(&String::from_utf8_lossy(&result.stdout)) {
            match value {
                Some(value) => {
                    properties.insert(key, serde_json::Value::String(value));
                }
                None => {
                    properties.remove(&key);
                }
            }
        }
    }

    if let Some(license) = license {
        properties.insert(
            "license".to_string(),
            serde_json::json!({"spdx": license.spdx, "path": license.path}),
        );
    }

    let rendered = serde_json::to_string(&properties)
        .map_err(|e| LpciError::Config(format!("failed to render properties: {}", e)))?;
    let destination = target_path.join("properties");
    fs::write(&destination, rendered)
        .map_err(|e| LpciError::io(destination.to_string(), e))?;
    Ok(())
}
