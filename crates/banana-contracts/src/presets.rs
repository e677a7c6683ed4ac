use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresetError {
    #[error("preset name is empty")]
    EmptyName,
    #[error("preset '{0}' already exists")]
    Duplicate(String),
    #[error("preset '{0}' not found")]
    NotFound(String),
}

/// Named prompts, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptPresets {
    entries: IndexMap<String, String>,
}

impl PromptPresets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, prompt: &str) -> Result<(), PresetError> {
        let name = normalized_name(name)?;
        if self.entries.contains_key(&name) {
            return Err(PresetError::Duplicate(name));
        }
        self.entries.insert(name, prompt.to_string());
        Ok(())
    }

    /// Renames and/or replaces the text of an existing preset. A rename keeps
    /// the preset's position.
    pub fn update(
        &mut self,
        name: &str,
        new_name: Option<&str>,
        new_prompt: Option<&str>,
    ) -> Result<(), PresetError> {
        let Some(index) = self.entries.get_index_of(name) else {
            return Err(PresetError::NotFound(name.to_string()));
        };

        if let Some(new_name) = new_name {
            let new_name = normalized_name(new_name)?;
            if new_name != name {
                if self.entries.contains_key(&new_name) {
                    return Err(PresetError::Duplicate(new_name));
                }
                if let Some(prompt) = self.entries.shift_remove(name) {
                    self.entries.shift_insert(index, new_name, prompt);
                }
            }
        }

        if let Some(new_prompt) = new_prompt {
            if let Some((_, prompt)) = self.entries.get_index_mut(index) {
                *prompt = new_prompt.to_string();
            }
        }
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<String, PresetError> {
        self.entries
            .shift_remove(name)
            .ok_or_else(|| PresetError::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries
            .iter()
            .map(|(name, prompt)| (name.as_str(), prompt.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalized_name(name: &str) -> Result<String, PresetError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(PresetError::EmptyName);
    }
    Ok(trimmed.to_string())
}
