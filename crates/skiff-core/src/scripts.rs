use crate::models::ScriptParam;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Source of script templates. Scripts are opaque payloads owned by the
/// script repository; this core only substitutes parameters into them.
pub trait ScriptRepository: Send + Sync {
    fn fetch(&self, script_id: &str) -> Option<String>;
}

/// Loads `<root>/<script_id>.sh` from disk.
pub struct DirScriptRepository {
    root: PathBuf,
}

impl DirScriptRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirScriptRepository { root: root.into() }
    }
}

impl ScriptRepository for DirScriptRepository {
    fn fetch(&self, script_id: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(format!("{script_id}.sh"))).ok()
    }
}

/// In-memory repository, used by tests and embedded deployments.
#[derive(Default)]
pub struct StaticScriptRepository {
    scripts: HashMap<String, String>,
}

impl StaticScriptRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, script_id: impl Into<String>, template: impl Into<String>) {
        self.scripts.insert(script_id.into(), template.into());
    }
}

impl ScriptRepository for StaticScriptRepository {
    fn fetch(&self, script_id: &str) -> Option<String> {
        self.scripts.get(script_id).cloned()
    }
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("script not found: {0}")]
    TemplateNotFound(String),
    #[error("parameter '{0}' cannot be shell-escaped")]
    ParamEscapeFailure(&'static str),
    #[error("unresolved placeholder '{placeholder}' in script '{script}'")]
    UnresolvedPlaceholder { script: String, placeholder: String },
}

/// Substitute `{{name}}` placeholders into the named script and return the
/// command text to transmit. Every value is single-quote shell-escaped
/// unless the parameter is marked raw (the interactive console's ad-hoc
/// command is the one raw field, by design).
pub fn render(
    repo: &dyn ScriptRepository,
    script_id: &str,
    params: &[ScriptParam],
) -> Result<String, TemplateError> {
    let mut text = repo
        .fetch(script_id)
        .ok_or_else(|| TemplateError::TemplateNotFound(script_id.to_string()))?;

    for param in params {
        let value = if param.raw {
            param.value.clone()
        } else {
            shell_escape(param.name, &param.value)?
        };
        text = text.replace(&format!("{{{{{}}}}}", param.name), &value);
    }

    if let Some(start) = text.find("{{") {
        let rest = &text[start + 2..];
        let placeholder = rest
            .split("}}")
            .next()
            .unwrap_or("")
            .to_string();
        return Err(TemplateError::UnresolvedPlaceholder {
            script: script_id.to_string(),
            placeholder,
        });
    }

    Ok(text)
}

fn shell_escape(name: &'static str, value: &str) -> Result<String, TemplateError> {
    if value.contains('\0') {
        return Err(TemplateError::ParamEscapeFailure(name));
    }
    Ok(format!("'{}'", value.replace('\'', "'\\''")))
}

/// The literal substring each script prints on success. This is a
/// compatibility contract with the script repository: classification is by
/// marker presence, not exit code, because the transport exposes no
/// structured exit channel. Ad-hoc console commands have no marker; any
/// output the transport returns counts as success.
pub fn success_marker(script_id: &str) -> Option<&'static str> {
    match script_id {
        "git-install" => Some("DONE-git-install"),
        "git-version" => Some("git version"),
        "server-resize" => Some("DONE-server-resize"),
        "ufw-open-port" => Some("DONE-ufw-open"),
        "ufw-close-port" => Some("DONE-ufw-close"),
        "ssh-key-add" => Some("DONE-ssh-key-add"),
        "ssh-key-remove" => Some("DONE-ssh-key-remove"),
        "user-add" => Some("DONE-user-add"),
        "user-remove" => Some("DONE-user-remove"),
        "gzip-toggle" => Some("DONE-gzip-toggle"),
        "collect-statistics" => Some("DONE-collect-statistics"),
        _ => None,
    }
}

pub fn is_successful(raw_output: &str, script_id: &str) -> bool {
    match success_marker(script_id) {
        Some(marker) => raw_output.contains(marker),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_with(id: &str, body: &str) -> StaticScriptRepository {
        let mut repo = StaticScriptRepository::new();
        repo.insert(id, body);
        repo
    }

    #[test]
    fn render_escapes_values() {
        let repo = repo_with("user-add", "useradd -m {{username}} -c {{comment}}");
        let rendered = render(
            &repo,
            "user-add",
            &[
                ScriptParam::escaped("username", "deploy"),
                ScriptParam::escaped("comment", "it's me; rm -rf /"),
            ],
        )
        .unwrap();
        assert_eq!(rendered, "useradd -m 'deploy' -c 'it'\\''s me; rm -rf /'");
    }

    #[test]
    fn render_raw_param_bypasses_escaping() {
        let repo = repo_with("console-command", "{{command}}");
        let rendered = render(
            &repo,
            "console-command",
            &[ScriptParam::raw("command", "df -h | sort")],
        )
        .unwrap();
        assert_eq!(rendered, "df -h | sort");
    }

    #[test]
    fn render_unknown_script_fails() {
        let repo = StaticScriptRepository::new();
        assert!(matches!(
            render(&repo, "nope", &[]),
            Err(TemplateError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn render_rejects_leftover_placeholder() {
        let repo = repo_with("git-install", "git config {{email}} {{name}}");
        let err = render(
            &repo,
            "git-install",
            &[ScriptParam::escaped("email", "a@b.c")],
        )
        .unwrap_err();
        match err {
            TemplateError::UnresolvedPlaceholder { placeholder, .. } => {
                assert_eq!(placeholder, "name");
            }
            other => panic!("expected UnresolvedPlaceholder, got {other:?}"),
        }
    }

    #[test]
    fn render_rejects_nul_in_value() {
        let repo = repo_with("user-add", "useradd {{username}}");
        assert!(matches!(
            render(
                &repo,
                "user-add",
                &[ScriptParam::escaped("username", "a\0b")]
            ),
            Err(TemplateError::ParamEscapeFailure("username"))
        ));
    }

    #[test]
    fn classifier_matches_exact_marker_only() {
        assert!(is_successful("output...DONE-git-install...more", "git-install"));
        assert!(!is_successful("output...DONE-git-other...more", "git-install"));
        assert!(!is_successful("", "git-install"));
    }

    #[test]
    fn console_output_always_classifies_successful() {
        assert!(is_successful("anything at all", "console-command"));
        assert!(is_successful("", "console-command"));
    }
}
