/*
   Prompt template loading for LLM detection. The built-in template is compiled
   in; named templates are read from `<data dir>/prompts/<name>.md`.
*/

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use crate::config::Config;

pub const BUILTIN_PROMPT: &str = include_str!("templates/builtin_prompt.md");

#[derive(Debug, Clone)]
pub struct PromptLoader {
    prompts_dir: PathBuf,
}

impl PromptLoader {
    pub fn new(prompts_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
        }
    }

    pub fn from_app_dirs() -> Result<Self> {
        let project_dirs = Config::get_app_dirs()?;
        Ok(Self::new(project_dirs.data_dir().join("prompts")))
    }

    pub fn prompts_dir(&self) -> &Path {
        &self.prompts_dir
    }

    /// Writes the built-in template to `default.md` so users have a starting
    /// point for their own. Existing files are left alone.
    pub fn install_default(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.prompts_dir)?;

        let default_prompt_path = self.prompts_dir.join("default.md");
        if !default_prompt_path.exists() {
            std::fs::write(&default_prompt_path, BUILTIN_PROMPT)?;
            debug!("Wrote default prompt to {}", default_prompt_path.display());
        }
        Ok(default_prompt_path)
    }

    pub fn load_prompt(&self, template_name: Option<&String>) -> String {
        match template_name {
            None => BUILTIN_PROMPT.to_string(),
            Some(name) => {
                let prompt_path = self.prompts_dir.join(format!("{}.md", name));
                match std::fs::read_to_string(&prompt_path) {
                    Ok(content) if content.contains("{text}") => content,
                    Ok(_) => {
                        warn!("Prompt template '{}' has no {{text}} slot, using built-in", name);
                        BUILTIN_PROMPT.to_string()
                    }
                    Err(_) => {
                        warn!("Prompt template '{}' not found, using built-in", name);
                        BUILTIN_PROMPT.to_string()
                    }
                }
            }
        }
    }

    pub fn format_prompt(&self, template: &str, text: &str) -> String {
        template.replace("{text}", &text.replace('"', r#"\""#))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_prompt_loading() {
        let loader = PromptLoader::new("/nonexistent/prompts");
        let prompt = loader.load_prompt(None);

        assert!(prompt.contains("Built-in PII Detection Prompt"));
        assert!(prompt.contains("PERSON"));
        assert!(prompt.contains("LOCATION"));
        assert!(prompt.contains("{text}"));
    }

    #[test]
    fn test_install_default_then_load_by_name() {
        let temp_dir = TempDir::new().unwrap();
        let loader = PromptLoader::new(temp_dir.path().join("prompts"));

        let path = loader.install_default().unwrap();
        assert!(path.exists());

        let prompt = loader.load_prompt(Some(&"default".to_string()));
        assert_eq!(prompt, BUILTIN_PROMPT);
    }

    #[test]
    fn test_install_default_keeps_user_edits() {
        let temp_dir = TempDir::new().unwrap();
        let loader = PromptLoader::new(temp_dir.path());
        std::fs::write(temp_dir.path().join("default.md"), "Mine: {text}").unwrap();

        loader.install_default().unwrap();
        assert_eq!(loader.load_prompt(Some(&"default".to_string())), "Mine: {text}");
    }

    #[test]
    fn test_custom_prompt_loading() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("custom.md"),
            "Custom PII Detection Template\nTEXT: {text}",
        )
        .unwrap();
        let loader = PromptLoader::new(temp_dir.path());

        let prompt = loader.load_prompt(Some(&"custom".to_string()));
        assert!(prompt.starts_with("Custom PII Detection Template"));
    }

    #[test]
    fn test_template_without_text_slot_falls_back() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("broken.md"), "no slot here").unwrap();
        let loader = PromptLoader::new(temp_dir.path());

        assert_eq!(loader.load_prompt(Some(&"broken".to_string())), BUILTIN_PROMPT);
    }

    #[test]
    fn test_nonexistent_prompt_fallback() {
        let temp_dir = TempDir::new().unwrap();
        let loader = PromptLoader::new(temp_dir.path());

        let prompt = loader.load_prompt(Some(&"nonexistent123".to_string()));
        assert!(prompt.contains("Built-in PII Detection Prompt"));
    }

    #[test]
    fn test_prompt_formatting() {
        let loader = PromptLoader::new("/unused");
        let template = "TEXT: \"{text}\" - END";

        assert_eq!(
            loader.format_prompt(template, "test@example.com"),
            "TEXT: \"test@example.com\" - END"
        );
        assert_eq!(
            loader.format_prompt(template, r#"say "hi""#),
            r#"TEXT: "say \"hi\"" - END"#
        );
    }
}
