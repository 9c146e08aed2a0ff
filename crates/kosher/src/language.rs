// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Supported language families and how each one is installed, run and built.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

#[cfg(test)]
#[path = "./language_test.rs"]
mod language_test;

/// A language runtime family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
    Ruby,
}

/// How to build a project and where its artifacts land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecipe {
    pub argv: Vec<String>,
    /// Artifact directory, relative to the project root.
    pub artifact_dir: &'static str,
}

impl Language {
    pub const ALL: [Language; 3] = [Self::Python, Self::Node, Self::Ruby];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Ruby => "ruby",
        }
    }

    /// Base image repository on the container registry.
    pub fn image_repository(self) -> &'static str {
        self.as_str()
    }

    /// Image flavour appended to the version tag.
    pub fn image_variant(self) -> &'static str {
        match self {
            Self::Python => "slim",
            Self::Node | Self::Ruby => "alpine",
        }
    }

    /// Full image reference for a runtime version, e.g. `python:3.11-slim`.
    pub fn image_for(self, version: &str) -> String {
        format!(
            "{}:{}-{}",
            self.image_repository(),
            version,
            self.image_variant()
        )
    }

    /// Extract the runtime version from an image tag of our variant.
    ///
    /// `3.11-slim` yields `3.11`; tags of other flavours yield `None`.
    pub fn version_from_tag(self, tag: &str) -> Option<String> {
        let version = tag.strip_suffix(self.image_variant())?.strip_suffix('-')?;
        if version.is_empty() || !version.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        Some(version.to_string())
    }

    /// Environment variable the official images set to their exact runtime
    /// version.
    pub fn version_env_var(self) -> &'static str {
        match self {
            Self::Python => "PYTHON_VERSION",
            Self::Node => "NODE_VERSION",
            Self::Ruby => "RUBY_VERSION",
        }
    }

    /// Command evaluating a snippet of source code.
    pub fn inline_command(self, code: &str) -> Vec<String> {
        let flag = match self {
            Self::Python => "-c",
            Self::Node | Self::Ruby => "-e",
        };
        vec![self.interpreter().to_string(), flag.to_string(), code.to_string()]
    }

    /// Command running a script file already inside the container.
    pub fn script_command(self, script: &str) -> Vec<String> {
        vec![self.interpreter().to_string(), script.to_string()]
    }

    pub fn interpreter(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Ruby => "ruby",
        }
    }

    /// Conventional file name of the dependency manifest.
    pub fn manifest_file_name(self) -> &'static str {
        match self {
            Self::Python => "requirements.txt",
            Self::Node => "package.json",
            Self::Ruby => "Gemfile",
        }
    }

    /// Command installing the manifest at `manifest` (inside the container).
    pub fn manifest_install_command(self, manifest: &str) -> Vec<String> {
        match self {
            Self::Python => strings(&["pip", "install", "--no-cache-dir", "-r", manifest]),
            Self::Node => strings(&["npm", "install"]),
            Self::Ruby => {
                let gemfile = format!("--gemfile={manifest}");
                strings(&["bundle", "install", &gemfile])
            }
        }
    }

    /// Command installing an inline list of packages.
    pub fn package_install_command(self, packages: &[String]) -> Vec<String> {
        let mut argv = match self {
            Self::Python => strings(&["pip", "install", "--no-cache-dir"]),
            Self::Node => strings(&["npm", "install"]),
            Self::Ruby => strings(&["gem", "install"]),
        };
        argv.extend(packages.iter().cloned());
        argv
    }

    pub fn build_recipe(self) -> BuildRecipe {
        match self {
            Self::Python => BuildRecipe {
                argv: strings(&["pip", "wheel", "--no-deps", "--wheel-dir", "dist", "."]),
                artifact_dir: "dist",
            },
            Self::Node => BuildRecipe {
                argv: strings(&["npm", "run", "build"]),
                artifact_dir: "dist",
            },
            Self::Ruby => BuildRecipe {
                argv: strings(&["bundle", "exec", "rake", "build"]),
                artifact_dir: "pkg",
            },
        }
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Self::Python),
            "node" | "nodejs" | "js" => Ok(Self::Node),
            "ruby" | "rb" => Ok(Self::Ruby),
            _ => Err(Error::UnsupportedLanguage(s.to_string())),
        }
    }
}
