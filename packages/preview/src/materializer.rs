// ABOUTME: Writes generated source files and framework scaffolding into a project directory
// ABOUTME: Produces an independently runnable Next.js project; never spawns processes

use crate::types::{GeneratedFile, SandboxError, SandboxResult};
use crate::validation::validate_relative_path;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

const NEXT_CONFIG: &str = r#"/** @type {import('next').NextConfig} */
const nextConfig = {
  reactStrictMode: true,
  eslint: { ignoreDuringBuilds: true },
  typescript: { ignoreBuildErrors: true },
};

export default nextConfig;
"#;

const TAILWIND_CONFIG: &str = r#"/** @type {import('tailwindcss').Config} */
module.exports = {
  content: [
    './app/**/*.{js,ts,jsx,tsx,mdx}',
    './components/**/*.{js,ts,jsx,tsx,mdx}',
    './src/**/*.{js,ts,jsx,tsx,mdx}',
  ],
  theme: { extend: {} },
  plugins: [],
};
"#;

const POSTCSS_CONFIG: &str = r#"module.exports = {
  plugins: {
    tailwindcss: {},
    autoprefixer: {},
  },
};
"#;

const GLOBALS_CSS: &str = r#"@tailwind base;
@tailwind components;
@tailwind utilities;

html,
body {
  margin: 0;
  padding: 0;
  min-height: 100%;
}
"#;

const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /\n";

/// Kept across re-materialization so installs can reuse downloaded packages
const PRESERVED_ENTRIES: &[&str] = &["node_modules"];

/// Writes a generated file set plus scaffolding to disk.
///
/// Stateless: every call is parameterized by the target directory.
pub struct ProjectMaterializer;

impl ProjectMaterializer {
    /// Materialize `files` into `dir`.
    ///
    /// The previous contents of `dir` are removed first (except `node_modules`), so
    /// files from an earlier generation never survive. Scaffolding is only written for
    /// paths the caller did not supply. Returns the paths written, in write order.
    pub async fn materialize(
        dir: &Path,
        files: &[GeneratedFile],
        title: &str,
    ) -> SandboxResult<Vec<PathBuf>> {
        for file in files {
            validate_relative_path(&file.path)?;
        }

        info!(
            "Materializing {} generated files into {}",
            files.len(),
            dir.display()
        );

        fs::create_dir_all(dir)
            .await
            .map_err(|e| materialize_error(dir, format!("create project directory: {}", e)))?;
        clear_previous_generation(dir).await?;

        let supplied: HashSet<PathBuf> = files
            .iter()
            .map(|f| normalize(Path::new(&f.path)))
            .collect();

        let mut written = Vec::with_capacity(files.len() + 6);

        for (path, content) in Self::scaffolding(title)? {
            if supplied.contains(Path::new(path)) {
                debug!("Caller supplied {}, skipping scaffold", path);
                continue;
            }
            written.push(write_file(dir, path, &content).await?);
        }

        for file in files {
            written.push(write_file(dir, &file.path, &file.content).await?);
        }

        Ok(written)
    }

    /// Scaffold files as `(relative path, content)` pairs.
    pub fn scaffolding(title: &str) -> SandboxResult<Vec<(&'static str, String)>> {
        let manifest = json!({
            "name": package_name(title),
            "version": "0.1.0",
            "private": true,
            "scripts": {
                "dev": "next dev",
                "build": "next build",
                "start": "next start"
            },
            "dependencies": {
                "next": "14.2.5",
                "react": "18.3.1",
                "react-dom": "18.3.1"
            },
            "devDependencies": {
                "autoprefixer": "^10.4.19",
                "postcss": "^8.4.38",
                "tailwindcss": "^3.4.4"
            }
        });

        Ok(vec![
            ("package.json", serde_json::to_string_pretty(&manifest)? + "\n"),
            ("next.config.mjs", NEXT_CONFIG.to_string()),
            ("tailwind.config.js", TAILWIND_CONFIG.to_string()),
            ("postcss.config.js", POSTCSS_CONFIG.to_string()),
            ("app/globals.css", GLOBALS_CSS.to_string()),
            ("public/robots.txt", ROBOTS_TXT.to_string()),
        ])
    }
}

/// Derive an npm package name from a human-readable title.
///
/// Lower-cases, drops everything except ASCII alphanumerics, whitespace and hyphens,
/// then joins whitespace-separated words with hyphens. Falls back to a generated id.
pub fn package_name(title: &str) -> String {
    let kept: String = title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();

    let name = kept.split_whitespace().collect::<Vec<_>>().join("-");

    if name.is_empty() {
        format!("app-{}", &Uuid::new_v4().simple().to_string()[..8])
    } else {
        name
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}

async fn clear_previous_generation(dir: &Path) -> SandboxResult<()> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| materialize_error(dir, format!("read project directory: {}", e)))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| materialize_error(dir, format!("read project directory: {}", e)))?
    {
        if PRESERVED_ENTRIES.iter().any(|keep| entry.file_name() == *keep) {
            continue;
        }
        let path = entry.path();
        let is_dir = fs::symlink_metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let removed = if is_dir {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        removed.map_err(|e| {
            materialize_error(dir, format!("remove stale {}: {}", path.display(), e))
        })?;
    }

    debug!("Cleared previous contents of {}", dir.display());
    Ok(())
}

async fn write_file(dir: &Path, relative: &str, content: &str) -> SandboxResult<PathBuf> {
    let target = dir.join(normalize(Path::new(relative)));

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| materialize_error(dir, format!("create {}: {}", parent.display(), e)))?;
    }

    fs::write(&target, content)
        .await
        .map_err(|e| materialize_error(dir, format!("write {}: {}", relative, e)))?;

    debug!("Wrote {}", target.display());
    Ok(target)
}

fn materialize_error(dir: &Path, reason: String) -> SandboxError {
    SandboxError::MaterializationFailed {
        dir: dir.to_path_buf(),
        reason,
    }
}
