//! Static inspection of a materialized image root.
//!
//! Nothing here follows symlinks: a link inside the image may point anywhere
//! on the host once the tree is on disk.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::metadata::ImageConfig;
use crate::report::Report;

/// Executables looked for when common tool checks are on.
pub const COMMON_TOOLS: [&str; 5] = ["sshd", "python3", "curl", "wget", "nvcc"];

const OS_RELEASE_CANDIDATES: [&str; 2] = ["etc/os-release", "usr/lib/os-release"];
const DIST_INFO_SUFFIX: &str = ".dist-info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzeOptions {
    pub check_os_info: bool,
    pub check_python_packages: bool,
    pub check_common_tools: bool,
    /// Extra executables to look for, checked even when common tools are off.
    pub specific_commands: Vec<String>,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            check_os_info: true,
            check_python_packages: true,
            check_common_tools: true,
            specific_commands: Vec::new(),
        }
    }
}

impl AnalyzeOptions {
    fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if self.check_common_tools {
            names.extend(COMMON_TOOLS.iter().map(|t| t.to_string()));
        }
        for command in &self.specific_commands {
            let command = command.trim();
            if !command.is_empty() && !names.iter().any(|n| n == command) {
                names.push(command.to_string());
            }
        }
        names
    }
}

/// Builds a report for the tree at `root`. Never fails; missing data stays empty.
pub fn analyze_root(root: &Path, config: &ImageConfig, options: &AnalyzeOptions) -> Report {
    let mut report = Report {
        architecture: config.architecture.clone(),
        os: config.os.clone(),
        env: config.env.clone(),
        ..Report::default()
    };

    if options.check_os_info {
        report.os_info = read_os_info(root);
    }

    let tool_names = options.tool_names();
    if options.check_python_packages || !tool_names.is_empty() {
        let (packages, tools) = walk_tree(root, options.check_python_packages, &tool_names);
        report.python_packages = packages;
        report.tools = tools;
    }

    report
}

/// First regular os-release file found, as text. Empty if there is none.
pub fn read_os_info(root: &Path) -> String {
    for candidate in OS_RELEASE_CANDIDATES {
        let path = root.join(candidate);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => match fs::read(&path) {
                Ok(data) => return String::from_utf8_lossy(&data).into_owned(),
                Err(e) => log::warn!("Failed to read {}: {}", candidate, e),
            },
            Ok(_) => log::debug!("Ignoring non-regular {}", candidate),
            Err(_) => {}
        }
    }
    log::debug!("No os-release file in {}", root.display());
    String::new()
}

/// One pass over the tree collecting dist-info directories and tool presence.
fn walk_tree(
    root: &Path,
    want_packages: bool,
    tool_names: &[String],
) -> (Vec<String>, BTreeMap<String, bool>) {
    let mut packages = Vec::new();
    let mut tools: BTreeMap<String, bool> =
        tool_names.iter().map(|name| (name.clone(), false)).collect();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };

        if entry.file_type().is_dir() {
            if want_packages && name.ends_with(DIST_INFO_SUFFIX) {
                packages.push(name.to_string());
            }
        } else if let Some(found) = tools.get_mut(name) {
            *found = true;
        }
    }

    packages.sort();
    (packages, tools)
}
