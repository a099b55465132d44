//! Destination port to service name table.

use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTable {
    by_port: HashMap<u16, String>,
}

impl ServiceTable {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u16, S)>,
        S: Into<String>,
    {
        Self {
            by_port: entries
                .into_iter()
                .map(|(port, name)| (port, name.into()))
                .collect(),
        }
    }

    /// Entries from `overrides` replace existing names for the same port.
    pub fn with_overrides<I, S>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (u16, S)>,
        S: Into<String>,
    {
        for (port, name) in overrides {
            self.by_port.insert(port, name.into());
        }
        self
    }

    pub fn lookup(&self, port: u16) -> Option<&str> {
        self.by_port.get(&port).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }
}
