//! Prompt id to spoken text, used when drawing call flows

use std::collections::HashMap;
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct PromptBook {
    entries: HashMap<String, String>,
}

impl PromptBook {
    /// Loads a flat TOML table such as `ja348 = "Welcome to the service"`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: HashMap<String, String> = toml::from_str(text)
            .map_err(|e| Error::parse(format!("Invalid prompt book: {}", e)))?;
        Ok(Self {
            entries: raw
                .into_iter()
                .map(|(id, content)| (id.to_lowercase(), content))
                .collect(),
        })
    }

    pub fn lookup(&self, id: &str) -> Option<&str> {
        self.entries.get(&id.to_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let book = PromptBook::parse("JA348 = \"Welcome\"\nja349 = \"Goodbye\"\n").unwrap();
        assert_eq!(book.len(), 2);
        assert_eq!(book.lookup("ja348"), Some("Welcome"));
        assert_eq!(book.lookup("JA349"), Some("Goodbye"));
        assert_eq!(book.lookup("ja350"), None);
    }

    #[test]
    fn test_invalid_book() {
        assert!(PromptBook::parse("not toml at all =").is_err());
    }
}
