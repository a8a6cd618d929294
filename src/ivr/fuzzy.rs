//! Prompt equivalence table
//!
//! One group per line, names separated by `:`. Every name of a group is
//! considered equivalent to every other name of the same group.
//!
//! ```text
//! # greetings recorded twice
//! ja348:ja348b:ja349
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct FuzzyPrompts {
    groups: HashMap<String, Arc<HashSet<String>>>,
}

impl FuzzyPrompts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let table = Self::parse(&text);
        debug!(
            "Loaded {} fuzzy prompt names from {}",
            table.len(),
            path.as_ref().display()
        );
        Ok(table)
    }

    pub fn parse(text: &str) -> Self {
        let mut table = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            table.add_group(line.split(':'));
        }
        table
    }

    pub fn add_group<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let group: HashSet<String> = names
            .into_iter()
            .map(|name| name.as_ref().trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        if group.is_empty() {
            return;
        }

        let group = Arc::new(group);
        for name in group.iter() {
            self.groups.insert(name.clone(), Arc::clone(&group));
        }
    }

    /// Both names are expected to be lower-cased already.
    pub fn equivalent(&self, expected: &str, actual: &str) -> bool {
        expected == actual
            || self
                .groups
                .get(expected)
                .map_or(false, |group| group.contains(actual))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
