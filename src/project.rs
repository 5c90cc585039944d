use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PlaypenError, Result};

/// Port the built-in project listens on
pub const DEFAULT_PORT: u16 = 3111;

const INDEX_JS: &str = r#"
import express from 'express';

const app = express();
const port = 3111;

app.get('/', (req, res) => {
  res.send('Welcome to a playpen app!');
});

app.listen(port, () => {
  console.log(`App is live at http://localhost:${port}`);
});
"#;

const PACKAGE_JSON: &str = r#"{
  "name": "example-app",
  "type": "module",
  "dependencies": {
    "express": "latest",
    "nodemon": "latest"
  },
  "scripts": {
    "start": "nodemon index.js"
  }
}"#;

/// Ordered mapping of relative file path to file content.
///
/// Built once and never mutated; live edits go through the sandbox filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    files: IndexMap<String, String>,
}

impl ProjectDescriptor {
    /// Build a descriptor from `(path, content)` pairs, rejecting bad paths
    /// and duplicates.
    pub fn from_files<I, P, C>(files: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let mut map = IndexMap::new();
        for (path, content) in files {
            let path = path.into();
            validate_path(&path).map_err(PlaypenError::InvalidProject)?;
            if map.insert(path.clone(), content.into()).is_some() {
                return Err(PlaypenError::InvalidProject(format!(
                    "duplicate path: {}",
                    path
                )));
            }
        }
        Ok(Self { files: map })
    }

    /// The Express app on port 3111 plus its manifest.
    pub fn builtin() -> Self {
        let mut files = IndexMap::new();
        files.insert("index.js".to_string(), INDEX_JS.to_string());
        files.insert("package.json".to_string(), PACKAGE_JSON.to_string());
        Self { files }
    }

    /// Load every top-level regular file of `dir`, sorted by name.
    ///
    /// The directory must hold a `package.json` so the start script has a manifest.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let content = std::fs::read_to_string(entry.path())?;
            entries.push((name, content));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        if !entries.iter().any(|(name, _)| name == "package.json") {
            return Err(PlaypenError::InvalidProject(format!(
                "{} has no package.json",
                dir.display()
            )));
        }

        debug!(dir = %dir.display(), files = entries.len(), "Loaded project from directory");
        Self::from_files(entries)
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for ProjectDescriptor {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Check that a sandbox path is relative and stays inside the project root.
pub fn validate_path(path: &str) -> std::result::Result<(), String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err("empty path".to_string());
    }
    if trimmed.contains('\0') {
        return Err(format!("path contains NUL: {:?}", path));
    }
    if trimmed.split('/').any(|part| part == "..") {
        return Err(format!("path escapes the project root: {}", path));
    }
    Ok(())
}

/// Normalize `/index.js` and `index.js` to the same relative path.
pub fn relative_path(path: &str) -> &str {
    path.trim_start_matches('/')
}
