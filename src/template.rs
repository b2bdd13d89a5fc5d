//! # Rendering of worker arguments, environment and config files.
//!
//! Exporters are often configured through files and flags that must contain
//! the port they were assigned, or the location of a file written next to them.
//! The supervisor asks a [`Render`] implementation for the final
//! [`Invocation`] before each start and restart.
//!
//! [`TemplateRenderer`] is the bundled implementation. It understands a single
//! placeholder form, `{{ .name }}` (delimiters configurable per worker):
//!
//! | variable              | value                                                   |
//! |-----------------------|---------------------------------------------------------|
//! | `listen_port`         | port reserved for the worker                            |
//! | `paths_base`          | [`SupervisorConfig::paths_base`](crate::SupervisorConfig) |
//! | `tmp_dir`             | [`SupervisorConfig::temp_dir`](crate::SupervisorConfig) |
//! | `TextFiles.<name>`    | absolute path of the rendered text file `<name>`        |
//!
//! Text files are rendered with the same variables and written to
//! `<temp_dir>/<kind>/<worker_id>/<name>`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::RenderError;
use crate::workers::{BuiltinParams, ProcessParams};

/// Placeholder delimiters.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Delims {
    /// Opening delimiter, `{{` by default.
    pub left: String,
    /// Closing delimiter, `}}` by default.
    pub right: String,
}

impl Default for Delims {
    fn default() -> Self {
        Self {
            left: "{{".into(),
            right: "}}".into(),
        }
    }
}

/// Fully rendered command line of a process worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Arguments passed after the executable path.
    pub args: Vec<String>,
    /// Environment in `KEY=VALUE` form. The child sees nothing else.
    pub env: Vec<String>,
    /// Text file name → path it was written to.
    pub files: BTreeMap<String, PathBuf>,
}

/// Renders worker parameters before a start.
///
/// Implementations must be cheap to call repeatedly: process workers re-render
/// on every restart after a crash.
pub trait Render: Send + Sync + 'static {
    /// Renders a process worker's arguments, environment and text files.
    fn render_process(
        &self,
        id: &str,
        params: &ProcessParams,
        listen_port: u16,
    ) -> Result<Invocation, RenderError>;

    /// Renders a built-in worker's DSN.
    fn render_dsn(&self, id: &str, params: &BuiltinParams) -> Result<String, RenderError>;

    /// Removes whatever was written for a worker that is gone for good.
    fn cleanup(&self, _kind: &str, _id: &str) -> Result<(), RenderError> {
        Ok(())
    }
}

/// A single template with its delimiters.
#[derive(Clone, Debug)]
pub struct Template<'a> {
    name: &'a str,
    text: &'a str,
    delims: &'a Delims,
}

impl<'a> Template<'a> {
    /// Wraps `text`; `name` only shows up in errors.
    pub fn new(name: &'a str, text: &'a str, delims: &'a Delims) -> Self {
        Self { name, text, delims }
    }

    /// Substitutes every placeholder with its value from `vars`.
    pub fn render(&self, vars: &BTreeMap<String, String>) -> Result<String, RenderError> {
        let Delims { left, right } = self.delims;
        let mut out = String::with_capacity(self.text.len());
        let mut rest = self.text;
        let mut offset = 0;

        while let Some(open) = rest.find(left.as_str()) {
            out.push_str(&rest[..open]);
            let after = &rest[open + left.len()..];
            let Some(close) = after.find(right.as_str()) else {
                return Err(RenderError::Unterminated {
                    template: self.name.to_string(),
                    offset: offset + open,
                });
            };

            let inner = after[..close].trim();
            let value = inner
                .strip_prefix('.')
                .map(str::trim)
                .and_then(|key| vars.get(key))
                .ok_or_else(|| RenderError::UnknownKey {
                    template: self.name.to_string(),
                    key: inner.to_string(),
                })?;
            out.push_str(value);

            let consumed = open + left.len() + close + right.len();
            rest = &rest[consumed..];
            offset += consumed;
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Filesystem-backed [`Render`] implementation.
#[derive(Clone, Debug)]
pub struct TemplateRenderer {
    temp_dir: PathBuf,
    paths_base: PathBuf,
}

impl TemplateRenderer {
    /// Creates a renderer writing text files under `temp_dir`.
    pub fn new(temp_dir: impl Into<PathBuf>, paths_base: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            paths_base: paths_base.into(),
        }
    }

    fn worker_dir(&self, kind: &str, id: &str) -> PathBuf {
        self.temp_dir.join(kind).join(id)
    }

    fn base_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("paths_base".to_string(), self.paths_base.display().to_string()),
            ("tmp_dir".to_string(), self.temp_dir.display().to_string()),
        ])
    }

    /// Adds `TextFiles.<name>` variables, renders each file and writes it to `dir`.
    fn write_files(
        &self,
        dir: &Path,
        text_files: &BTreeMap<String, String>,
        delims: &Delims,
        vars: &mut BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, PathBuf>, RenderError> {
        let mut files = BTreeMap::new();
        if text_files.is_empty() {
            return Ok(files);
        }

        for name in text_files.keys() {
            let path = dir.join(name);
            vars.insert(format!("TextFiles.{name}"), path.display().to_string());
            files.insert(name.clone(), path);
        }

        fs::create_dir_all(dir).map_err(|source| RenderError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for (name, body) in text_files {
            let rendered = Template::new(name, body, delims).render(vars)?;
            let path = &files[name];
            fs::write(path, rendered).map_err(|source| RenderError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(files)
    }
}

impl Render for TemplateRenderer {
    fn render_process(
        &self,
        id: &str,
        params: &ProcessParams,
        listen_port: u16,
    ) -> Result<Invocation, RenderError> {
        let default_delims = Delims::default();
        let delims = params.template_delims.as_ref().unwrap_or(&default_delims);

        let mut vars = self.base_vars();
        vars.insert("listen_port".into(), listen_port.to_string());

        let dir = self.worker_dir(&params.kind, id);
        let files = self.write_files(&dir, &params.text_files, delims, &mut vars)?;

        let args: Vec<String> = params
            .args
            .iter()
            .map(|a| Template::new("args", a, delims).render(&vars))
            .collect::<Result<_, _>>()?;
        let env: Vec<String> = params
            .env
            .iter()
            .map(|e| Template::new("env", e, delims).render(&vars))
            .collect::<Result<_, _>>()?;

        Ok(Invocation { args, env, files })
    }

    fn render_dsn(&self, id: &str, params: &BuiltinParams) -> Result<String, RenderError> {
        if params.text_files.is_empty() {
            return Ok(params.dsn.clone());
        }

        let delims = Delims::default();
        let mut vars = self.base_vars();
        let dir = self.worker_dir(&params.kind, id);
        self.write_files(&dir, &params.text_files, &delims, &mut vars)?;
        Template::new("dsn", &params.dsn, &delims).render(&vars)
    }

    fn cleanup(&self, kind: &str, id: &str) -> Result<(), RenderError> {
        let dir = self.worker_dir(kind, id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RenderError::Io { path: dir, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_template_substitutes_placeholders() {
        let d = Delims::default();
        let got = Template::new("args", "--web.listen-address=:{{ .listen_port }}", &d)
            .render(&vars(&[("listen_port", "42000")]))
            .unwrap();
        assert_eq!(got, "--web.listen-address=:42000");

        let got = Template::new("args", "{{.a}}-{{ .b }}-plain", &d)
            .render(&vars(&[("a", "1"), ("b", "2")]))
            .unwrap();
        assert_eq!(got, "1-2-plain");
    }

    #[test]
    fn test_template_custom_delims() {
        let d = Delims {
            left: "[[".into(),
            right: "]]".into(),
        };
        let got = Template::new("args", "{{ keep }} [[ .listen_port ]]", &d)
            .render(&vars(&[("listen_port", "9")]))
            .unwrap();
        assert_eq!(got, "{{ keep }} 9");
    }

    #[test]
    fn test_template_errors() {
        let d = Delims::default();
        let err = Template::new("env", "X={{ .missing }}", &d)
            .render(&BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, RenderError::UnknownKey { ref key, .. } if key == ".missing"));

        let err = Template::new("env", "abc {{ .listen_port", &d)
            .render(&BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, RenderError::Unterminated { offset: 4, .. }));
    }

    #[test]
    fn test_renderer_writes_text_files() {
        let tmp = tempfile::tempdir().unwrap();
        let r = TemplateRenderer::new(tmp.path(), "/opt/base");

        let params = ProcessParams {
            kind: "mysqld_exporter".into(),
            args: vec![
                "--config={{ .TextFiles.my }}".into(),
                "--port={{ .listen_port }}".into(),
            ],
            env: vec!["BASE={{ .paths_base }}".into()],
            text_files: BTreeMap::from([("my".into(), "port={{ .listen_port }}\n".into())]),
            ..ProcessParams::default()
        };

        let inv = r.render_process("a1", &params, 42001).unwrap();
        let file = tmp.path().join("mysqld_exporter").join("a1").join("my");
        assert_eq!(inv.args[0], format!("--config={}", file.display()));
        assert_eq!(inv.args[1], "--port=42001");
        assert_eq!(inv.env, vec!["BASE=/opt/base"]);
        assert_eq!(fs::read_to_string(&file).unwrap(), "port=42001\n");

        r.cleanup("mysqld_exporter", "a1").unwrap();
        assert!(!file.exists());
        r.cleanup("mysqld_exporter", "a1").unwrap();
    }

    #[test]
    fn test_renderer_dsn() {
        let tmp = tempfile::tempdir().unwrap();
        let r = TemplateRenderer::new(tmp.path(), "/opt/base");

        let plain = BuiltinParams {
            kind: "noop".into(),
            dsn: "mysql://{{ .not_rendered }}".into(),
            ..BuiltinParams::default()
        };
        assert_eq!(r.render_dsn("b1", &plain).unwrap(), "mysql://{{ .not_rendered }}");

        let with_files = BuiltinParams {
            kind: "noop".into(),
            dsn: "mysql://host/?tls-ca={{ .TextFiles.ca }}".into(),
            text_files: BTreeMap::from([("ca".into(), "CERT".into())]),
            ..BuiltinParams::default()
        };
        let ca = tmp.path().join("noop").join("b2").join("ca");
        assert_eq!(
            r.render_dsn("b2", &with_files).unwrap(),
            format!("mysql://host/?tls-ca={}", ca.display())
        );
        assert_eq!(fs::read_to_string(ca).unwrap(), "CERT");
    }
}
