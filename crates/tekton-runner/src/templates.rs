//! Resource document templates.
//!
//! Templates are Handlebars files compiled into the binary. Values coming
//! from requests are emitted through the `quote` helper, which writes a
//! double-quoted YAML scalar, so user input can never change document
//! structure.

use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};
use serde::Serialize;

use crate::error::Result;

pub const GIT_SECRET: &str = "git-secret";
pub const NFS_VOLUME: &str = "nfs-volume";
pub const SMB_SECRET: &str = "smb-secret";
pub const SMB_VOLUME: &str = "smb-volume";
pub const CLAIM: &str = "claim";
pub const TASK_RUN: &str = "task-run";
pub const APP_BUNDLE: &str = "app-bundle";

const TEMPLATES: &[(&str, &str)] = &[
    (GIT_SECRET, include_str!("../templates/git-secret.yaml.hbs")),
    (NFS_VOLUME, include_str!("../templates/nfs-volume.yaml.hbs")),
    (SMB_SECRET, include_str!("../templates/smb-secret.yaml.hbs")),
    (SMB_VOLUME, include_str!("../templates/smb-volume.yaml.hbs")),
    (CLAIM, include_str!("../templates/claim.yaml.hbs")),
    (TASK_RUN, include_str!("../templates/task-run.yaml.hbs")),
    (APP_BUNDLE, include_str!("../templates/app-bundle.yaml.hbs")),
];

/// Emit the first parameter as a double-quoted scalar.
/// Usage: `{{quote value}}`. Missing values render as `""`.
fn quote_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let quoted = match h.param(0).map(|p| p.value()) {
        Some(value @ serde_json::Value::String(_)) => value.to_string(),
        Some(serde_json::Value::Null) | None => "\"\"".to_string(),
        Some(other) => serde_json::Value::String(other.to_string()).to_string(),
    };
    out.write(&quoted)?;
    Ok(())
}

/// Renders the built-in templates.
pub struct Renderer {
    handlebars: Handlebars<'static>,
}

impl Renderer {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("quote", Box::new(quote_helper));
        for &(name, source) in TEMPLATES {
            handlebars
                .register_template_string(name, source)
                .map_err(Box::new)?;
        }
        Ok(Self { handlebars })
    }

    /// Render template `name` with `data`.
    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> Result<String> {
        Ok(self.handlebars.render(name, data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_all_templates_compile() {
        let renderer = Renderer::new().unwrap();
        for &(name, _) in TEMPLATES {
            assert!(renderer.handlebars.has_template(name));
        }
    }

    #[test]
    fn test_quote_keeps_structure() {
        let renderer = Renderer::new().unwrap();
        let out = renderer
            .render(
                GIT_SECRET,
                &json!({
                    "name": "git-cred-1",
                    "namespace": "tekton-pipelines",
                    "username": "bot",
                    "token": "abc\nkind: Namespace # & <x>",
                }),
            )
            .unwrap();

        let doc: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(doc["kind"], "Secret");
        assert_eq!(
            doc["stringData"]["token"],
            "abc\nkind: Namespace # & <x>"
        );
    }

    #[test]
    fn test_missing_value_is_empty_string() {
        let renderer = Renderer::new().unwrap();
        let out = renderer
            .render(
                SMB_SECRET,
                &json!({ "name": "smb-cred-1", "namespace": "ns" }),
            )
            .unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(doc["stringData"]["password"], "");
    }
}
