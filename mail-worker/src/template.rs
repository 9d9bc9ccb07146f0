//! Email template rendering with Handlebars.
//!
//! Templates are looked up by identifier, first among templates registered
//! in memory, then as `<id>.html` or `<id>.hbs` inside the template directory.
//! Identifiers given as paths (`../../templates/verify-account.html`) are
//! reduced to their file stem, so lookups never leave the template directory.
//!
//! Each template is read and compiled on first use and kept in the
//! Handlebars registry afterwards; edits on disk need a restart.
//!
//! Missing context keys render as empty strings unless strict mode is on.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use handlebars::Handlebars;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::TemplateError;

const EXTENSIONS: [&str; 2] = ["html", "hbs"];

/// Renders named HTML templates against a data context.
pub struct TemplateRenderer {
    handlebars: RwLock<Handlebars<'static>>,
    dir: Option<PathBuf>,
    inline: HashMap<String, String>,
}

impl TemplateRenderer {
    /// Renderer reading templates from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            handlebars: RwLock::new(Handlebars::new()),
            dir: Some(dir.into()),
            inline: HashMap::new(),
        }
    }

    /// Renderer with no template directory; only inline templates resolve.
    pub fn in_memory() -> Self {
        Self {
            handlebars: RwLock::new(Handlebars::new()),
            dir: None,
            inline: HashMap::new(),
        }
    }

    /// Fail rendering when the template references a key missing from the context.
    pub fn strict(mut self, strict: bool) -> Self {
        self.handlebars
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .set_strict_mode(strict);
        self
    }

    /// Register a template body under `name`, shadowing any file of that name.
    pub fn with_template(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        self.inline.insert(name.into(), body.into());
        self
    }

    /// Render `template_id` with `context`, producing an HTML document.
    pub fn render(
        &self,
        template_id: &str,
        context: &Map<String, Value>,
    ) -> Result<String, TemplateError> {
        let name = template_name(template_id).ok_or_else(|| TemplateError::NotFound {
            id: template_id.to_string(),
        })?;

        if !self.registry().has_template(name) {
            let source = self.load(template_id, name)?;
            self.registry_mut()
                .register_template_string(name, source)
                .map_err(|e| TemplateError::Syntax {
                    id: template_id.to_string(),
                    source: Box::new(e),
                })?;
            debug!(template = name, "template_compiled");
        }

        let html = self
            .registry()
            .render(name, context)
            .map_err(|e| TemplateError::Render {
                id: template_id.to_string(),
                source: Box::new(e),
            })?;

        debug!(template = template_id, html_length = html.len(), "template_rendered");
        Ok(html)
    }

    fn registry(&self) -> RwLockReadGuard<'_, Handlebars<'static>> {
        self.handlebars.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Handlebars<'static>> {
        self.handlebars.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, template_id: &str, name: &str) -> Result<String, TemplateError> {
        let not_found = || TemplateError::NotFound {
            id: template_id.to_string(),
        };

        if let Some(body) = self.inline.get(name) {
            return Ok(body.clone());
        }

        let dir = self.dir.as_ref().ok_or_else(not_found)?;

        for ext in EXTENSIONS {
            let path = dir.join(format!("{name}.{ext}"));
            match std::fs::read_to_string(&path) {
                Ok(body) => {
                    debug!(path = %path.display(), "template_loaded");
                    return Ok(body);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(TemplateError::Io {
                        id: template_id.to_string(),
                        source: e,
                    })
                }
            }
        }

        Err(not_found())
    }
}

/// Reduce a template identifier to the bare name looked up in the registry.
fn template_name(template_id: &str) -> Option<&str> {
    let file = Path::new(template_id).file_name()?.to_str()?;

    let name = EXTENSIONS
        .iter()
        .find_map(|ext| file.strip_suffix(ext).and_then(|s| s.strip_suffix('.')))
        .unwrap_or(file);

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
