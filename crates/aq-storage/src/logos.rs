use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const BUILTIN: &[(&str, &str)] = &[
    ("Amazon", "https://logo.clearbit.com/amazon.com"),
    ("Apple", "https://logo.clearbit.com/apple.com"),
    ("Google", "https://logo.clearbit.com/google.com"),
    ("Meta", "https://logo.clearbit.com/meta.com"),
    ("Microsoft", "https://logo.clearbit.com/microsoft.com"),
    ("Netflix", "https://logo.clearbit.com/netflix.com"),
    ("Nvidia", "https://logo.clearbit.com/nvidia.com"),
    ("Oracle", "https://logo.clearbit.com/oracle.com"),
    ("Salesforce", "https://logo.clearbit.com/salesforce.com"),
    ("Stripe", "https://logo.clearbit.com/stripe.com"),
    ("Tesla", "https://logo.clearbit.com/tesla.com"),
    ("Uber", "https://logo.clearbit.com/uber.com"),
];

#[derive(Debug, Deserialize)]
struct LogosFile {
    #[serde(default)]
    logos: Vec<LogoEntry>,
}

#[derive(Debug, Deserialize)]
struct LogoEntry {
    company: String,
    url: String,
}

/// Static company → logo URL table consulted when an application is created.
#[derive(Debug, Clone, Default)]
pub struct LogoTable {
    entries: HashMap<String, String>,
}

fn normalize(company: &str) -> String {
    company.trim().to_lowercase()
}

impl LogoTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut table = Self::default();
        for (company, url) in BUILTIN {
            table.insert(company, url);
        }
        table
    }

    /// Built-in table overlaid with entries from a YAML file of the form
    /// `logos: [{company, url}]`.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed: LogosFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let mut table = Self::builtin();
        for entry in parsed.logos {
            table.insert(&entry.company, &entry.url);
        }
        Ok(table)
    }

    pub fn insert(&mut self, company: &str, url: &str) {
        self.entries.insert(normalize(company), url.to_string());
    }

    pub fn lookup(&self, company: &str) -> Option<&str> {
        self.entries.get(&normalize(company)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
